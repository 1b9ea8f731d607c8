use chrono::Utc;
use dashmap::{DashMap, DashSet};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::error::UploadError;
use crate::config::{UploadConfig, WatchdogConfig};
use crate::models::{SessionSnapshot, SessionState, UploadEvent, UploadReceipt, UploadRequest};
use crate::services::compressor::{self, CompressionOutcome};
use crate::services::storage::{StorageService, TransferEvent, TransferRequest};
use crate::services::upload_session::UploadSession;
use crate::services::watchdog::{RetryPolicy, StallDetector, TimeoutGuard};
use crate::utils::validation::{effective_mime_type, sanitize_filename, validate};

/// Caller side of one upload: an ordered event stream ending in exactly one terminal event
pub struct UploadHandle {
    session_id: Uuid,
    slot: String,
    events: mpsc::UnboundedReceiver<UploadEvent>,
}

impl UploadHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    /// Next notification, or `None` once the terminal event has been delivered
    pub async fn next_event(&mut self) -> Option<UploadEvent> {
        self.events.recv().await
    }

    /// Skips progress and resolves with the terminal outcome
    pub async fn finished(mut self) -> Result<UploadReceipt, UploadError> {
        while let Some(event) = self.events.recv().await {
            match event {
                UploadEvent::Succeeded(receipt) => return Ok(receipt),
                UploadEvent::Failed(err) => return Err(err),
                _ => {}
            }
        }
        // Driver dropped without reporting, only happens when the runtime goes away
        Err(UploadError::Cancelled)
    }
}

struct SlotEntry {
    session_id: Uuid,
    folder: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

/// Upload orchestrator. One active session per logical slot.
pub struct UploadService {
    storage: Arc<dyn StorageService>,
    config: UploadConfig,
    slots: Arc<DashMap<String, SlotEntry>>,
    /// Request behind each slot's latest session, held until it succeeds
    last_requests: Arc<DashMap<String, UploadRequest>>,
    reserved_folders: Arc<DashSet<String>>,
    start_lock: Mutex<()>,
}

/// Keeps new uploads out of a folder until dropped
pub struct FolderReservation {
    folder: String,
    reserved: Arc<DashSet<String>>,
}

impl Drop for FolderReservation {
    fn drop(&mut self) {
        self.reserved.remove(&self.folder);
    }
}

impl UploadService {
    pub fn new(storage: Arc<dyn StorageService>, config: UploadConfig) -> Self {
        Self {
            storage,
            config,
            slots: Arc::new(DashMap::new()),
            last_requests: Arc::new(DashMap::new()),
            reserved_folders: Arc::new(DashSet::new()),
            start_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Validates, then replaces whatever is running in `slot` with a new session.
    ///
    /// A validation failure returns before the storage collaborator or the prior session
    /// are touched.
    pub async fn start_upload(
        &self,
        slot: &str,
        request: UploadRequest,
    ) -> Result<UploadHandle, UploadError> {
        validate(&request, &request.constraints).into_result()?;
        let content_type = effective_mime_type(&request.mime_type, &request.data)?;

        let _guard = self.start_lock.lock().await;
        let folder = request.folder.trim_matches('/');
        if self.reserved_folders.contains(folder) {
            warn!("Upload into '{}' refused: folder is reserved", folder);
            return Err(UploadError::Unknown(format!(
                "Folder '{}' is in use by a test upload; try again when it finishes",
                folder
            )));
        }
        self.cancel_and_wait(slot).await;
        self.last_requests.insert(slot.to_string(), request.clone());

        Ok(self.spawn_session(slot, request, content_type))
    }

    /// Aborts the active session in `slot`. Returns false when nothing was running.
    pub fn cancel_upload(&self, slot: &str) -> bool {
        match self.slots.get(slot) {
            Some(entry) => {
                info!(session_id = %entry.session_id, "🛑 Cancel requested for slot {}", slot);
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Re-runs the last request for `slot` as a fresh start with a new attempt budget.
    /// Nothing is kept to retry once a slot's upload succeeded or the service shut down.
    pub async fn retry_upload(&self, slot: &str) -> Result<UploadHandle, UploadError> {
        let request = self
            .last_requests
            .get(slot)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| UploadError::Unknown(format!("No previous upload in slot '{}'", slot)))?;

        info!("🔁 Manual retry for slot {}", slot);
        self.start_upload(slot, request).await
    }

    pub fn session_snapshot(&self, slot: &str) -> Option<SessionSnapshot> {
        self.slots
            .get(slot)
            .map(|entry| entry.snapshot.borrow().clone())
    }

    pub fn active_sessions(&self) -> usize {
        self.slots.len()
    }

    /// Whether `retry_upload` has a request to re-run for `slot`
    pub fn can_retry(&self, slot: &str) -> bool {
        self.last_requests.contains_key(slot)
    }

    /// Whether a live session writes into `folder`
    pub fn has_active_upload_in(&self, folder: &str) -> bool {
        let folder = folder.trim_matches('/');
        self.slots
            .iter()
            .any(|entry| entry.folder.trim_matches('/') == folder)
    }

    /// Claims `folder` for exclusive use. Returns `None` while a live session writes
    /// there or another reservation holds it.
    pub async fn reserve_folder(&self, folder: &str) -> Option<FolderReservation> {
        let _guard = self.start_lock.lock().await;
        let folder = folder.trim_matches('/');
        if self.has_active_upload_in(folder) || !self.reserved_folders.insert(folder.to_string()) {
            return None;
        }
        Some(FolderReservation {
            folder: folder.to_string(),
            reserved: Arc::clone(&self.reserved_folders),
        })
    }

    /// Cancels every session and waits for their drivers to exit
    pub async fn shutdown(&self) {
        let _guard = self.start_lock.lock().await;
        let slots: Vec<String> = self.slots.iter().map(|entry| entry.key().clone()).collect();
        if !slots.is_empty() {
            info!("🛑 Shutting down {} active upload(s)", slots.len());
        }
        for slot in slots {
            self.cancel_and_wait(&slot).await;
        }
        self.last_requests.clear();
    }

    async fn cancel_and_wait(&self, slot: &str) {
        let Some((_, entry)) = self.slots.remove(slot) else {
            return;
        };

        debug!(session_id = %entry.session_id, "Cancelling prior session in slot {}", slot);
        entry.cancel.cancel();
        if let Some(task) = entry.task {
            if let Err(e) = task.await {
                warn!("Upload driver for slot {} ended abnormally: {}", slot, e);
            }
        }
    }

    fn spawn_session(&self, slot: &str, request: UploadRequest, content_type: String) -> UploadHandle {
        let cancel = CancellationToken::new();
        let session = UploadSession::new(request.size() as u64, cancel.clone());
        let session_id = session.id();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());

        // Registered before the driver runs so its own cleanup always finds the entry
        self.slots.insert(
            slot.to_string(),
            SlotEntry {
                session_id,
                folder: request.folder.clone(),
                cancel,
                task: None,
                snapshot: snapshot_rx,
            },
        );

        info!(
            session_id = %session_id,
            "⬆️  Upload started: {} ({} bytes) -> {}/ [slot {}]",
            request.original_name,
            request.size(),
            request.folder,
            slot
        );

        let driver = SessionDriver {
            slot: slot.to_string(),
            request,
            content_type,
            storage: Arc::clone(&self.storage),
            watchdog: self.config.watchdog.clone(),
            session,
            events: events_tx,
            snapshots: snapshot_tx,
            slots: Arc::clone(&self.slots),
            last_requests: Arc::clone(&self.last_requests),
        };
        let task = tokio::spawn(driver.run());

        if let Some(mut entry) = self.slots.get_mut(slot) {
            if entry.session_id == session_id {
                entry.task = Some(task);
            }
        }

        UploadHandle {
            session_id,
            slot: slot.to_string(),
            events: events_rx,
        }
    }
}

/// `{folder}/{epoch_ms}_{sanitized_name}`
pub fn object_key(folder: &str, original_name: &str, epoch_ms: i64) -> String {
    let name = sanitize_filename(original_name);
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        format!("{}_{}", epoch_ms, name)
    } else {
        format!("{}/{}_{}", folder, epoch_ms, name)
    }
}

pub fn upload_metadata(original_name: &str, payload: &CompressionOutcome) -> HashMap<String, String> {
    HashMap::from([
        ("original_name".to_string(), original_name.to_string()),
        ("sha256".to_string(), hex::encode(Sha256::digest(&payload.data))),
        ("uploaded_at".to_string(), Utc::now().to_rfc3339()),
        ("compressed".to_string(), payload.compressed.to_string()),
    ])
}

enum AttemptOutcome {
    Completed(String),
    Stalled { percent: f64 },
    Failed(UploadError),
}

/// Owns one session from start to its terminal event
struct SessionDriver {
    slot: String,
    request: UploadRequest,
    content_type: String,
    storage: Arc<dyn StorageService>,
    watchdog: WatchdogConfig,
    session: UploadSession,
    events: mpsc::UnboundedSender<UploadEvent>,
    snapshots: watch::Sender<SessionSnapshot>,
    slots: Arc<DashMap<String, SlotEntry>>,
    last_requests: Arc<DashMap<String, UploadRequest>>,
}

impl SessionDriver {
    async fn run(mut self) {
        let session_id = self.session.id();
        let result = self.drive().await;

        let (state, event) = match result {
            Ok(receipt) => {
                info!(
                    session_id = %session_id,
                    attempts = receipt.attempts,
                    "✅ Upload complete: {}",
                    receipt.key
                );
                (SessionState::Succeeded, UploadEvent::Succeeded(receipt))
            }
            Err(UploadError::Cancelled) => {
                info!(session_id = %session_id, "🛑 Upload cancelled");
                (SessionState::Cancelled, UploadEvent::Failed(UploadError::Cancelled))
            }
            Err(err) => {
                warn!(session_id = %session_id, kind = err.kind().as_str(), "❌ Upload failed: {}", err);
                (SessionState::Failed, UploadEvent::Failed(err))
            }
        };

        // Timers and the transfer are gone by now; release the slot, then report once.
        // The retry copy is dropped before the slot is released
        let first = self.session.finish(state);
        if first && state == SessionState::Succeeded {
            self.last_requests.remove(&self.slot);
        }
        self.slots
            .remove_if(&self.slot, |_, entry| entry.session_id == session_id);
        if first {
            self.publish();
            self.emit(event);
        }
    }

    async fn drive(&mut self) -> Result<UploadReceipt, UploadError> {
        let guard = TimeoutGuard::start(Instant::now(), self.watchdog.session_timeout);
        let cancel = self.session.cancel_token().clone();

        self.session.transition(SessionState::Validating);
        let params = self.request.compression;
        if self.request.size() > params.threshold {
            self.session.transition(SessionState::Compressing);
            self.publish();
        }

        let payload = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            _ = guard.expired() => return Err(self.timeout_error()),
            outcome = compressor::maybe_compress(self.request.data.clone(), &self.content_type, params) => outcome,
        };
        self.session.set_total_bytes(payload.data.len() as u64);

        let key = object_key(
            &self.request.folder,
            &self.request.original_name,
            Utc::now().timestamp_millis(),
        );
        let transfer = TransferRequest {
            key,
            data: payload.data.clone(),
            content_type: self.content_type.clone(),
            metadata: upload_metadata(&self.request.original_name, &payload),
        };

        let detector = StallDetector::from(&self.watchdog);
        let policy = RetryPolicy::from(&self.watchdog);

        loop {
            let attempt = self.session.begin_attempt(Instant::now());
            self.publish();
            if attempt > 1 {
                info!(session_id = %self.session.id(), attempt, "🔁 Retrying stalled upload");
                self.emit(UploadEvent::Retrying { attempt });
            }

            match self.run_attempt(&transfer, &guard, &detector).await {
                AttemptOutcome::Completed(key) => {
                    return self.finalize(key, &guard, payload.compressed).await;
                }
                AttemptOutcome::Failed(err) => return Err(err),
                AttemptOutcome::Stalled { percent } => {
                    let will_retry = policy.should_retry(attempt);
                    self.session.mark_stalled();
                    self.publish();
                    warn!(
                        session_id = %self.session.id(),
                        attempt,
                        will_retry,
                        "⏸️  Upload stalled at {:.0}%",
                        percent
                    );
                    self.emit(UploadEvent::Stalled {
                        error: UploadError::Stalled { percent },
                        attempt,
                        will_retry,
                    });

                    if !will_retry {
                        return Err(UploadError::RetryLimitExceeded { attempts: attempt });
                    }

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                        _ = guard.expired() => return Err(self.timeout_error()),
                        _ = tokio::time::sleep(policy.delay()) => {}
                    }
                }
            }
        }
    }

    async fn run_attempt(
        &mut self,
        transfer: &TransferRequest,
        guard: &TimeoutGuard,
        detector: &StallDetector,
    ) -> AttemptOutcome {
        let cancel = self.session.cancel_token().clone();
        let attempt_cancel = cancel.child_token();

        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => return AttemptOutcome::Failed(UploadError::Cancelled),
            _ = guard.expired() => {
                attempt_cancel.cancel();
                return AttemptOutcome::Failed(self.timeout_error());
            }
            res = self.storage.start_transfer(transfer.clone(), attempt_cancel.clone()) => res,
        };

        let mut handle = match started {
            Ok(handle) => handle,
            Err(err) => return AttemptOutcome::Failed(err.into()),
        };

        let mut ticker = detector.ticker(Instant::now());
        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break AttemptOutcome::Failed(UploadError::Cancelled),
                // Ahead of the stall check so a concurrent stall never masks a timeout
                _ = guard.expired() => break AttemptOutcome::Failed(self.timeout_error()),
                event = handle.events.recv() => match event {
                    Some(TransferEvent::Progress { bytes_transferred, .. }) => {
                        if let Some(progress) = self.session.record_progress(bytes_transferred, Instant::now()) {
                            self.publish();
                            self.emit(UploadEvent::Progress(progress));
                        }
                    }
                    Some(TransferEvent::Completed { key }) => break AttemptOutcome::Completed(key),
                    Some(TransferEvent::Failed(err)) => break AttemptOutcome::Failed(err.into()),
                    None => {
                        break AttemptOutcome::Failed(UploadError::Unknown(
                            "Transfer ended without a result".to_string(),
                        ));
                    }
                },
                _ = ticker.tick() => {
                    let percent = self.session.attempt_percent();
                    if detector.is_stalled(Instant::now(), self.session.last_progress_at(), percent) {
                        break AttemptOutcome::Stalled { percent };
                    }
                }
            }
        };

        if !matches!(outcome, AttemptOutcome::Completed(_)) {
            handle.cancel();
        }
        // Dropping the handle discards anything the aborted transfer still sends
        outcome
    }

    async fn finalize(
        &mut self,
        key: String,
        guard: &TimeoutGuard,
        compressed: bool,
    ) -> Result<UploadReceipt, UploadError> {
        let cancel = self.session.cancel_token().clone();
        self.session.begin_finalizing();
        self.publish();
        self.emit(UploadEvent::Progress(self.session.progress()));

        let url = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            _ = guard.expired() => return Err(self.timeout_error()),
            res = self.storage.download_url(&key) => res?,
        };

        Ok(UploadReceipt {
            session_id: self.session.id(),
            url,
            key,
            size: self.session.total_bytes(),
            attempts: self.session.attempt_count(),
            compressed,
        })
    }

    fn timeout_error(&self) -> UploadError {
        UploadError::Timeout {
            secs: self.watchdog.session_timeout.as_secs(),
        }
    }

    fn emit(&self, event: UploadEvent) {
        // The caller may have dropped its handle; the session still runs to completion
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.session.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_object_key_layout() {
        assert_eq!(
            object_key("leaders", "Team Photo.JPG", 1_700_000_000_000),
            "leaders/1700000000000_Team_Photo.JPG"
        );
        assert_eq!(object_key("/leaders/", "a.png", 5), "leaders/5_a.png");
        assert_eq!(object_key("", "a.png", 5), "5_a.png");
    }

    #[test]
    fn test_upload_metadata() {
        let payload = CompressionOutcome {
            data: Bytes::from_static(b"abc"),
            compressed: true,
        };
        let metadata = upload_metadata("logo.png", &payload);
        assert_eq!(metadata["original_name"], "logo.png");
        assert_eq!(
            metadata["sha256"],
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(metadata["compressed"], "true");
        assert!(chrono::DateTime::parse_from_rfc3339(&metadata["uploaded_at"]).is_ok());
    }
}
