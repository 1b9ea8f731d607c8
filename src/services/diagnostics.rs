use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DiagnosticsConfig;
use crate::models::{
    DiagnosticCategory, DiagnosticResult, DiagnosticStatus, DiagnosticsReport, OverallStatus,
};
use crate::services::probe::{CapabilityKind, ConnectionClass, EnvironmentProbe, NetworkStatus};
use crate::services::storage::{StorageService, TransferEvent, TransferRequest};
use crate::services::upload_service::object_key;

const GENERIC_GUIDANCE: &str =
    "If uploads keep failing, reload the page and try again, or send this report to support.";

const MEMORY_HIGH: f64 = 0.90;
const MEMORY_MODERATE: f64 = 0.75;

/// Stateless battery of environment checks plus a live test upload.
///
/// Nothing here touches upload sessions, so it can run next to an active upload.
pub struct DiagnosticsRunner {
    storage: Arc<dyn StorageService>,
    probe: Arc<dyn EnvironmentProbe>,
    config: DiagnosticsConfig,
}

impl DiagnosticsRunner {
    pub fn new(
        storage: Arc<dyn StorageService>,
        probe: Arc<dyn EnvironmentProbe>,
        config: DiagnosticsConfig,
    ) -> Self {
        Self {
            storage,
            probe,
            config,
        }
    }

    pub fn folder(&self) -> &str {
        &self.config.folder
    }

    /// Runs every check. A failing check never stops the others.
    pub async fn run(&self) -> DiagnosticsReport {
        info!("🩺 Running upload diagnostics");

        let (storage, network, capabilities, memory, content_blocker) = tokio::join!(
            self.check_storage(),
            self.check_network(),
            self.check_capabilities(),
            self.check_memory(),
            self.check_content_blocker(),
        );
        let reference = self.check_storage_reference();

        let results = vec![storage, network, capabilities, memory, reference, content_blocker];
        let report = build_report(results);

        info!(
            "🩺 Diagnostics finished: {:?} ({} recommendation(s))",
            report.overall_status,
            report.recommendations.len()
        );
        report
    }

    pub async fn check_storage(&self) -> DiagnosticResult {
        let category = DiagnosticCategory::Storage;
        match tokio::time::timeout(self.config.storage_check_timeout, self.storage.health_check()).await {
            Ok(Ok(())) => DiagnosticResult::pass(category, "Storage service is reachable"),
            Ok(Err(e)) => DiagnosticResult::fail(category, format!("Storage service error: {}", e))
                .with_details(json!({ "code": e.code.as_str() })),
            Err(_) => DiagnosticResult::fail(
                category,
                format!(
                    "Storage service did not answer within {}s",
                    self.config.storage_check_timeout.as_secs()
                ),
            ),
        }
    }

    pub async fn check_network(&self) -> DiagnosticResult {
        let category = DiagnosticCategory::Network;
        match self.probe.network().await {
            NetworkStatus::Offline => DiagnosticResult::fail(category, "No network connection"),
            NetworkStatus::Online { class, rtt } => {
                let details = json!({ "class": class.as_str(), "rtt_ms": rtt.as_millis() as u64 });
                let result = match class {
                    ConnectionClass::FourG => DiagnosticResult::pass(category, "Connection looks good"),
                    slow => DiagnosticResult::warn(
                        category,
                        format!("Slow connection detected ({})", slow.as_str()),
                    ),
                };
                result.with_details(details)
            }
            NetworkStatus::Unknown => {
                DiagnosticResult::pass(category, "Connection type could not be determined")
                    .with_details(json!({ "class": "unknown" }))
            }
        }
    }

    pub async fn check_capabilities(&self) -> DiagnosticResult {
        let category = DiagnosticCategory::Capabilities;
        let capabilities = self.probe.capabilities().await;

        let details: HashMap<&str, bool> = capabilities
            .iter()
            .map(|c| (c.kind.as_str(), c.available))
            .collect();
        let missing: Vec<CapabilityKind> = capabilities
            .iter()
            .filter(|c| !c.available)
            .map(|c| c.kind)
            .collect();
        let details = json!(details);

        if missing.iter().any(CapabilityKind::is_required) {
            return DiagnosticResult::fail(category, "Binary file handling is not available")
                .with_details(details);
        }
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(CapabilityKind::as_str).collect();
            return DiagnosticResult::warn(
                category,
                format!("Missing capabilities: {}", names.join(", ")),
            )
            .with_details(details);
        }
        DiagnosticResult::pass(category, "All required capabilities are available").with_details(details)
    }

    pub async fn check_memory(&self) -> DiagnosticResult {
        let category = DiagnosticCategory::Memory;
        let Some(usage) = self.probe.memory().await else {
            return DiagnosticResult::pass(category, "Memory usage is not exposed on this platform");
        };

        let ratio = usage.ratio();
        let details = json!({
            "used_bytes": usage.used_bytes,
            "limit_bytes": usage.limit_bytes,
            "ratio": ratio,
        });
        let percent = ratio * 100.0;

        let result = if ratio > MEMORY_HIGH {
            DiagnosticResult::warn(category, format!("Memory usage is high ({:.0}%)", percent))
        } else if ratio > MEMORY_MODERATE {
            DiagnosticResult::warn(category, format!("Memory usage is moderate ({:.0}%)", percent))
        } else {
            DiagnosticResult::pass(category, format!("Memory usage is normal ({:.0}%)", percent))
        };
        result.with_details(details)
    }

    /// Builds a reference into the blob store. No network involved.
    pub fn check_storage_reference(&self) -> DiagnosticResult {
        let category = DiagnosticCategory::StorageReference;
        let key = format!("{}/probe", self.config.folder.trim_matches('/'));
        match self.storage.object_reference(&key) {
            Ok(reference) => DiagnosticResult::pass(category, "Storage references can be created")
                .with_details(json!({ "reference": reference })),
            Err(e) => DiagnosticResult::fail(category, format!("Cannot build storage reference: {}", e)),
        }
    }

    /// Heuristic only: a blocked canary and a slow network look the same from here.
    pub async fn check_content_blocker(&self) -> DiagnosticResult {
        let category = DiagnosticCategory::ContentBlocker;
        match self
            .probe
            .fetch_canary(&self.config.canary_url, self.config.canary_timeout)
            .await
        {
            Ok(()) => DiagnosticResult::pass(category, "No content blocking detected"),
            Err(reason) => DiagnosticResult::warn(
                category,
                "Content blocking likely (canary request failed; may also be a slow network)",
            )
            .with_details(json!({ "reason": reason, "heuristic": true })),
        }
    }

    /// One real end-to-end upload of a 1x1 PNG, bounded by its own timeout.
    /// The object is removed afterwards on a best-effort basis.
    pub async fn test_upload(&self) -> DiagnosticResult {
        let category = DiagnosticCategory::TestUpload;
        let payload = match synthetic_png() {
            Ok(bytes) => bytes,
            Err(e) => {
                return DiagnosticResult::fail(category, format!("Could not build test image: {}", e));
            }
        };

        let key = object_key(
            &self.config.folder,
            "diagnostic-test.png",
            Utc::now().timestamp_millis(),
        );
        let request = TransferRequest {
            key: key.clone(),
            data: payload.into(),
            content_type: mime::IMAGE_PNG.to_string(),
            metadata: HashMap::from([
                ("original_name".to_string(), "diagnostic-test.png".to_string()),
                ("uploaded_at".to_string(), Utc::now().to_rfc3339()),
                ("compressed".to_string(), "false".to_string()),
            ]),
        };

        let cancel = CancellationToken::new();
        let started = Instant::now();
        let limit = self.config.test_upload_timeout;

        let outcome = tokio::time::timeout(limit, self.upload_and_resolve(request, cancel.clone())).await;
        cancel.cancel();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(url)) => {
                if let Err(e) = self.storage.delete_object(&key).await {
                    warn!("Failed to delete diagnostic object {}: {}", key, e);
                }
                info!("✅ Test upload succeeded in {}ms", elapsed_ms);
                DiagnosticResult::pass(category, "Test upload succeeded")
                    .with_details(json!({ "url": url, "duration_ms": elapsed_ms }))
            }
            Ok(Err(message)) => {
                warn!("❌ Test upload failed: {}", message);
                DiagnosticResult::fail(category, format!("Test upload failed: {}", message))
                    .with_details(json!({ "duration_ms": elapsed_ms }))
            }
            Err(_) => {
                warn!("❌ Test upload timed out after {}s", limit.as_secs());
                DiagnosticResult::fail(
                    category,
                    format!("Test upload timed out after {}s", limit.as_secs()),
                )
            }
        }
    }

    async fn upload_and_resolve(
        &self,
        request: TransferRequest,
        cancel: CancellationToken,
    ) -> Result<String, String> {
        let mut handle = self
            .storage
            .start_transfer(request, cancel)
            .await
            .map_err(|e| e.to_string())?;

        while let Some(event) = handle.events.recv().await {
            match event {
                TransferEvent::Progress { .. } => {}
                TransferEvent::Completed { key } => {
                    return self.storage.download_url(&key).await.map_err(|e| e.to_string());
                }
                TransferEvent::Failed(e) => return Err(e.to_string()),
            }
        }
        Err("Transfer ended without a result".to_string())
    }
}

/// Encoded 1x1 transparent PNG
pub fn synthetic_png() -> Result<Vec<u8>, image::ImageError> {
    let mut out = Vec::new();
    image::DynamicImage::new_rgba8(1, 1)
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)?;
    Ok(out)
}

/// critical if anything failed, issues if anything warned, healthy otherwise
pub fn overall_status(results: &[DiagnosticResult]) -> OverallStatus {
    if results.iter().any(|r| r.status == DiagnosticStatus::Fail) {
        OverallStatus::Critical
    } else if results.iter().any(|r| r.status == DiagnosticStatus::Warn) {
        OverallStatus::Issues
    } else {
        OverallStatus::Healthy
    }
}

fn recommendation_for(result: &DiagnosticResult) -> Option<&'static str> {
    use DiagnosticCategory::*;
    use DiagnosticStatus::*;

    match (result.category, result.status) {
        (_, Pass) => None,
        (Storage, _) => Some("The storage service is unreachable. Try again in a few minutes."),
        (Network, Fail) => Some("Check your internet connection and try again."),
        (Network, Warn) => {
            Some("Your connection is slow. Use a smaller image or switch to a faster network.")
        }
        (Capabilities, Fail) => {
            Some("This environment cannot handle binary files. Try another browser or device.")
        }
        (Capabilities, Warn) => {
            Some("Some optional features are unavailable, so uploads may be slower than usual.")
        }
        (Memory, _) => Some("Memory is running low. Close other tabs or applications and retry."),
        (StorageReference, _) => Some("Storage is misconfigured. Contact support."),
        (ContentBlocker, _) => {
            Some("A content blocker may be interfering. Disable it for this site and retry.")
        }
        (TestUpload, _) => Some("The test upload did not complete. Check your connection and retry."),
    }
}

/// One recommendation per non-passing check, deduplicated, plus generic guidance when not healthy
pub fn recommendations(results: &[DiagnosticResult]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for text in results.iter().filter_map(recommendation_for) {
        if !out.iter().any(|existing| existing == text) {
            out.push(text.to_string());
        }
    }
    if overall_status(results) != OverallStatus::Healthy {
        out.push(GENERIC_GUIDANCE.to_string());
    }
    out
}

pub fn build_report(results: Vec<DiagnosticResult>) -> DiagnosticsReport {
    DiagnosticsReport {
        timestamp: Utc::now(),
        overall_status: overall_status(&results),
        recommendations: recommendations(&results),
        results,
    }
}
