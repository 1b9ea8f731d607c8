use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use uuid::Uuid;

use crate::api::error::UploadError;
use crate::config::UploadConfig;

/// Limits a file must satisfy before any network activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConstraints {
    pub max_file_size: usize,
    pub allowed_mimes: Vec<String>,
}

/// Resize / re-encode parameters for large images
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionParams {
    pub threshold: usize,
    pub max_width: u32,
    pub max_height: u32,
    pub quality: f32,
}

impl Default for UploadConstraints {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

impl Default for CompressionParams {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

impl From<&UploadConfig> for UploadConstraints {
    fn from(config: &UploadConfig) -> Self {
        Self {
            max_file_size: config.max_file_size,
            allowed_mimes: config.allowed_mimes.clone(),
        }
    }
}

impl From<&UploadConfig> for CompressionParams {
    fn from(config: &UploadConfig) -> Self {
        Self {
            threshold: config.compression_threshold,
            max_width: config.max_width,
            max_height: config.max_height,
            quality: config.quality,
        }
    }
}

/// A file the user picked, plus everything needed to upload it.
/// Built once on selection and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub data: Bytes,
    pub mime_type: String,
    pub original_name: String,
    pub folder: String,
    pub constraints: UploadConstraints,
    pub compression: CompressionParams,
}

impl UploadRequest {
    pub fn new(
        data: impl Into<Bytes>,
        mime_type: impl Into<String>,
        original_name: impl Into<String>,
        folder: impl Into<String>,
    ) -> Self {
        Self {
            data: data.into(),
            mime_type: mime_type.into(),
            original_name: original_name.into(),
            folder: folder.into(),
            constraints: UploadConstraints::default(),
            compression: CompressionParams::default(),
        }
    }

    pub fn with_constraints(mut self, constraints: UploadConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_compression(mut self, compression: CompressionParams) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_config(self, config: &UploadConfig) -> Self {
        self.with_constraints(config.into())
            .with_compression(config.into())
    }

    /// Reads a file from disk, guessing its type from the content first and the extension second
    pub async fn from_path(path: &Path, folder: &str, config: &UploadConfig) -> std::io::Result<Self> {
        let data = tokio::fs::read(path).await?;
        let mime_type = infer::get(&data)
            .map(|kind| kind.mime_type().to_string())
            .or_else(|| mime_from_extension(path).map(str::to_string))
            .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string());
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        Ok(Self::new(data, mime_type, name, folder).with_config(config))
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

fn mime_from_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// Upload session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Validating,
    Compressing,
    Uploading,
    Stalled,
    Succeeded,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Succeeded | SessionState::Failed | SessionState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Validating => "validating",
            SessionState::Compressing => "compressing",
            SessionState::Uploading => "uploading",
            SessionState::Stalled => "stalled",
            SessionState::Succeeded => "succeeded",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }
}

/// Label shown next to the percentage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadPhase {
    Initializing,
    Uploading,
    Finalizing,
}

impl UploadPhase {
    pub fn from_percent(percent: f64, started: bool) -> Self {
        if !started {
            UploadPhase::Initializing
        } else if percent >= 99.0 {
            UploadPhase::Finalizing
        } else {
            UploadPhase::Uploading
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadPhase::Initializing => "initializing",
            UploadPhase::Uploading => "uploading",
            UploadPhase::Finalizing => "finalizing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadProgress {
    pub session_id: Uuid,
    pub percent: f64,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub phase: UploadPhase,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadReceipt {
    pub session_id: Uuid,
    /// Durable retrieval URL
    pub url: String,
    /// `{folder}/{epoch_ms}_{sanitized_name}`
    pub key: String,
    pub size: u64,
    pub attempts: u32,
    pub compressed: bool,
}

/// What a session reports, in order. Exactly one of `Succeeded` / `Failed` closes the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Progress(UploadProgress),
    /// Non-terminal: the current attempt froze and was cancelled
    Stalled {
        error: UploadError,
        attempt: u32,
        will_retry: bool,
    },
    Retrying { attempt: u32 },
    Succeeded(UploadReceipt),
    Failed(UploadError),
}

impl UploadEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadEvent::Succeeded(_) | UploadEvent::Failed(_))
    }
}

/// Point-in-time view of a live session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub state: SessionState,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub percent: f64,
    pub phase: UploadPhase,
    pub attempt_count: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCategory {
    Storage,
    Network,
    Capabilities,
    Memory,
    StorageReference,
    ContentBlocker,
    TestUpload,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticResult {
    pub category: DiagnosticCategory,
    pub status: DiagnosticStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl DiagnosticResult {
    pub fn pass(category: DiagnosticCategory, message: impl Into<String>) -> Self {
        Self::new(category, DiagnosticStatus::Pass, message)
    }

    pub fn warn(category: DiagnosticCategory, message: impl Into<String>) -> Self {
        Self::new(category, DiagnosticStatus::Warn, message)
    }

    pub fn fail(category: DiagnosticCategory, message: impl Into<String>) -> Self {
        Self::new(category, DiagnosticStatus::Fail, message)
    }

    fn new(category: DiagnosticCategory, status: DiagnosticStatus, message: impl Into<String>) -> Self {
        Self {
            category,
            status,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Issues,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticsReport {
    pub timestamp: DateTime<Utc>,
    pub results: Vec<DiagnosticResult>,
    pub overall_status: OverallStatus,
    pub recommendations: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_labels() {
        assert_eq!(UploadPhase::from_percent(0.0, false), UploadPhase::Initializing);
        assert_eq!(UploadPhase::from_percent(0.0, true), UploadPhase::Uploading);
        assert_eq!(UploadPhase::from_percent(42.0, true), UploadPhase::Uploading);
        assert_eq!(UploadPhase::from_percent(99.0, true), UploadPhase::Finalizing);
        assert_eq!(UploadPhase::from_percent(100.0, true), UploadPhase::Finalizing);
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Succeeded.is_terminal());
        assert!(SessionState::Cancelled.is_terminal());
        assert!(!SessionState::Stalled.is_terminal());
        assert!(!SessionState::Uploading.is_terminal());
    }

    #[test]
    fn test_request_uses_config_limits() {
        let mut config = UploadConfig::default();
        config.max_file_size = 42;
        let request = UploadRequest::new(vec![1u8, 2, 3], "image/png", "a.png", "leaders")
            .with_config(&config);
        assert_eq!(request.size(), 3);
        assert_eq!(request.constraints.max_file_size, 42);
    }

    #[tokio::test]
    async fn test_from_path_sniffs_content_first() {
        let dir = tempfile::tempdir().unwrap();
        let config = UploadConfig::default();

        // PNG bytes behind a misleading extension
        let png = dir.path().join("logo.jpg");
        std::fs::write(&png, [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0]).unwrap();
        let request = UploadRequest::from_path(&png, "leaders", &config).await.unwrap();
        assert_eq!(request.mime_type, "image/png");
        assert_eq!(request.original_name, "logo.jpg");
        assert_eq!(request.folder, "leaders");
        assert_eq!(request.size(), 10);

        // Unrecognised bytes fall back to the extension
        let webp = dir.path().join("banner.WEBP");
        std::fs::write(&webp, b"not really").unwrap();
        let request = UploadRequest::from_path(&webp, "leaders", &config).await.unwrap();
        assert_eq!(request.mime_type, "image/webp");

        let missing = dir.path().join("missing.png");
        assert!(UploadRequest::from_path(&missing, "leaders", &config).await.is_err());
    }

    #[test]
    fn test_diagnostic_serializes_lowercase() {
        let result = DiagnosticResult::warn(DiagnosticCategory::Memory, "high");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "warn");
        assert_eq!(json["category"], "memory");
        assert!(json.get("details").is_none());
    }
}
