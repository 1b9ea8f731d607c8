#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use site_asset_uploader::config::UploadConfig;
use site_asset_uploader::models::UploadRequest;
use site_asset_uploader::services::probe::{
    Capability, CapabilityKind, ConnectionClass, EnvironmentProbe, MemoryUsage, NetworkStatus,
};
use site_asset_uploader::services::storage::{
    StorageError, StorageService, TransferEvent, TransferHandle, TransferRequest, build_object_url,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const PNG_MAGIC: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// What one transfer attempt does
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Reports progress in four steps, then completes
    Complete,
    /// Reports `percent` once, then goes silent until cancelled
    FreezeAt(u64),
    /// Adds `bytes` every `every` until cancelled, never finishing
    Trickle { every: Duration, bytes: u64 },
    /// Reports some progress, then fails
    Fail(StorageError),
    /// Refuses to open the transfer
    RejectStart(StorageError),
    /// Reports `percent`, then finishes and stores the object right after being cancelled
    CompleteAfterCancel(u64),
}

#[derive(Debug, Clone)]
pub struct TransferCall {
    pub key: String,
    pub size: usize,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
    /// Whether every earlier transfer's token was cancelled when this one opened
    pub earlier_settled: bool,
}

/// Scriptable storage collaborator. Each `start_transfer` pops the next behavior;
/// once the script runs out every transfer completes.
pub struct MockStorageService {
    script: Mutex<VecDeque<Behavior>>,
    calls: Mutex<Vec<TransferCall>>,
    tokens: Mutex<Vec<CancellationToken>>,
    files: std::sync::Arc<Mutex<HashMap<String, Bytes>>>,
    deleted: Mutex<Vec<String>>,
    health: Mutex<Result<(), StorageError>>,
}

impl MockStorageService {
    pub fn new() -> Self {
        Self::with_script(Vec::new())
    }

    pub fn with_script(script: Vec<Behavior>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
            files: std::sync::Arc::new(Mutex::new(HashMap::new())),
            deleted: Mutex::new(Vec::new()),
            health: Mutex::new(Ok(())),
        }
    }

    pub fn push(&self, behavior: Behavior) {
        self.script.lock().unwrap().push_back(behavior);
    }

    pub fn set_health(&self, result: Result<(), StorageError>) {
        *self.health.lock().unwrap() = result;
    }

    pub fn calls(&self) -> Vec<TransferCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn start_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn cancelled(&self, attempt: usize) -> bool {
        self.tokens.lock().unwrap()[attempt].is_cancelled()
    }

    pub fn stored(&self, key: &str) -> Option<Bytes> {
        self.files.lock().unwrap().get(key).cloned()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl StorageService for MockStorageService {
    async fn start_transfer(
        &self,
        request: TransferRequest,
        cancel: CancellationToken,
    ) -> Result<TransferHandle, StorageError> {
        let earlier_settled = self
            .tokens
            .lock()
            .unwrap()
            .iter()
            .all(|token| token.is_cancelled());

        self.calls.lock().unwrap().push(TransferCall {
            key: request.key.clone(),
            size: request.data.len(),
            content_type: request.content_type.clone(),
            metadata: request.metadata.clone(),
            earlier_settled,
        });
        self.tokens.lock().unwrap().push(cancel.clone());

        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Behavior::Complete);

        if let Behavior::RejectStart(err) = behavior {
            return Err(err);
        }

        let (tx, handle) = TransferHandle::channel(cancel.clone());
        let files = std::sync::Arc::clone(&self.files);
        let total = request.data.len() as u64;

        tokio::spawn(async move {
            match behavior {
                Behavior::Complete => {
                    for step in 1..=4u64 {
                        tokio::task::yield_now().await;
                        if cancel.is_cancelled() {
                            return;
                        }
                        let _ = tx
                            .send(TransferEvent::Progress {
                                bytes_transferred: total * step / 4,
                                total_bytes: total,
                            })
                            .await;
                    }
                    files.lock().unwrap().insert(request.key.clone(), request.data);
                    let _ = tx.send(TransferEvent::Completed { key: request.key }).await;
                }
                Behavior::FreezeAt(percent) => {
                    let _ = tx
                        .send(TransferEvent::Progress {
                            bytes_transferred: total * percent / 100,
                            total_bytes: total,
                        })
                        .await;
                    cancel.cancelled().await;
                }
                Behavior::Trickle { every, bytes } => {
                    let mut sent = 0;
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(every) => {
                                sent = (sent + bytes).min(total.saturating_sub(1));
                                let _ = tx
                                    .send(TransferEvent::Progress {
                                        bytes_transferred: sent,
                                        total_bytes: total,
                                    })
                                    .await;
                            }
                        }
                    }
                }
                Behavior::Fail(err) => {
                    let _ = tx
                        .send(TransferEvent::Progress {
                            bytes_transferred: total / 3,
                            total_bytes: total,
                        })
                        .await;
                    let _ = tx.send(TransferEvent::Failed(err)).await;
                }
                Behavior::CompleteAfterCancel(percent) => {
                    let _ = tx
                        .send(TransferEvent::Progress {
                            bytes_transferred: total * percent / 100,
                            total_bytes: total,
                        })
                        .await;
                    cancel.cancelled().await;
                    let _ = tx
                        .send(TransferEvent::Progress {
                            bytes_transferred: total,
                            total_bytes: total,
                        })
                        .await;
                    files.lock().unwrap().insert(request.key.clone(), request.data);
                    let _ = tx.send(TransferEvent::Completed { key: request.key }).await;
                }
                Behavior::RejectStart(_) => {}
            }
        });

        Ok(handle)
    }

    async fn download_url(&self, key: &str) -> Result<String, StorageError> {
        if !self.files.lock().unwrap().contains_key(key) {
            return Err(StorageError::not_found(key));
        }
        self.object_reference(key)
    }

    fn object_reference(&self, key: &str) -> Result<String, StorageError> {
        build_object_url("https://assets.example.org", key)
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.files.lock().unwrap().remove(key);
        self.deleted.lock().unwrap().push(key.to_string());
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        self.health.lock().unwrap().clone()
    }
}

/// Environment double with everything healthy unless told otherwise
pub struct MockProbe {
    pub network: NetworkStatus,
    pub missing: Vec<CapabilityKind>,
    pub memory: Option<MemoryUsage>,
    pub canary: Result<(), String>,
}

impl MockProbe {
    pub fn healthy() -> Self {
        Self {
            network: NetworkStatus::Online {
                class: ConnectionClass::FourG,
                rtt: Duration::from_millis(40),
            },
            missing: Vec::new(),
            memory: Some(MemoryUsage {
                used_bytes: 2 * 1024 * 1024 * 1024,
                limit_bytes: 8 * 1024 * 1024 * 1024,
            }),
            canary: Ok(()),
        }
    }

    pub fn offline() -> Self {
        Self {
            network: NetworkStatus::Offline,
            canary: Err("error sending request".to_string()),
            ..Self::healthy()
        }
    }
}

#[async_trait]
impl EnvironmentProbe for MockProbe {
    async fn network(&self) -> NetworkStatus {
        self.network
    }

    async fn capabilities(&self) -> Vec<Capability> {
        CapabilityKind::ALL
            .iter()
            .map(|&kind| Capability {
                kind,
                available: !self.missing.contains(&kind),
            })
            .collect()
    }

    async fn memory(&self) -> Option<MemoryUsage> {
        self.memory
    }

    async fn fetch_canary(&self, _url: &str, _timeout: Duration) -> Result<(), String> {
        self.canary.clone()
    }
}

/// A PNG-looking payload of `size` bytes, small enough to skip compression by default
pub fn png_request(size: usize, folder: &str) -> UploadRequest {
    let mut data = vec![0u8; size.max(PNG_MAGIC.len())];
    data[..PNG_MAGIC.len()].copy_from_slice(&PNG_MAGIC);
    UploadRequest::new(data, "image/png", "team photo.png", folder)
        .with_config(&UploadConfig::default())
}
