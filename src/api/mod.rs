pub mod error;

use std::sync::Arc;
use tracing::warn;

use crate::api::error::UploadError;
use crate::config::UploadConfig;
use crate::models::{
    DiagnosticCategory, DiagnosticResult, DiagnosticsReport, SessionSnapshot, UploadRequest,
};
use crate::services::diagnostics::DiagnosticsRunner;
use crate::services::probe::{EnvironmentProbe, SystemProbe};
use crate::services::storage::StorageService;
use crate::services::upload_service::{UploadHandle, UploadService};

/// Slot used when the caller only ever has one upload control
pub const DEFAULT_SLOT: &str = "default";

/// Caller-facing entry point: uploads per slot plus diagnostics
#[derive(Clone)]
pub struct UploadClient {
    uploads: Arc<UploadService>,
    diagnostics: Arc<DiagnosticsRunner>,
}

impl UploadClient {
    pub fn new(storage: Arc<dyn StorageService>, config: UploadConfig) -> Self {
        let probe = Arc::new(SystemProbe::new(
            config.diagnostics.probe_addr.clone(),
            config.diagnostics.canary_timeout,
        ));
        Self::with_probe(storage, probe, config)
    }

    pub fn with_probe(
        storage: Arc<dyn StorageService>,
        probe: Arc<dyn EnvironmentProbe>,
        config: UploadConfig,
    ) -> Self {
        let diagnostics = DiagnosticsRunner::new(Arc::clone(&storage), probe, config.diagnostics.clone());
        Self {
            uploads: Arc::new(UploadService::new(storage, config)),
            diagnostics: Arc::new(diagnostics),
        }
    }

    pub fn uploads(&self) -> &UploadService {
        &self.uploads
    }

    /// Starts an upload in `slot`, cancelling whatever was running there
    pub async fn start_upload(
        &self,
        slot: &str,
        request: UploadRequest,
    ) -> Result<UploadHandle, UploadError> {
        self.uploads.start_upload(slot, request).await
    }

    pub fn cancel_upload(&self, slot: &str) -> bool {
        self.uploads.cancel_upload(slot)
    }

    pub async fn retry_upload(&self, slot: &str) -> Result<UploadHandle, UploadError> {
        self.uploads.retry_upload(slot).await
    }

    pub fn session_snapshot(&self, slot: &str) -> Option<SessionSnapshot> {
        self.uploads.session_snapshot(slot)
    }

    pub async fn run_diagnostics(&self) -> DiagnosticsReport {
        self.diagnostics.run().await
    }

    /// Live end-to-end upload. Refused while another upload writes to the same folder;
    /// uploads started into that folder are refused until it finishes.
    pub async fn test_upload(&self) -> DiagnosticResult {
        let Some(_reservation) = self.uploads.reserve_folder(self.diagnostics.folder()).await else {
            warn!(
                "Test upload refused: an upload into '{}' is in progress",
                self.diagnostics.folder()
            );
            return DiagnosticResult::fail(
                DiagnosticCategory::TestUpload,
                "An upload into the diagnostics folder is in progress; try again when it finishes",
            );
        };
        self.diagnostics.test_upload().await
    }

    /// Cancels all uploads and waits for them to wind down
    pub async fn shutdown(&self) {
        self.uploads.shutdown().await;
    }
}
