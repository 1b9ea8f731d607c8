use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use dashmap::DashMap;
use http_body::{Body, Frame, SizeHint};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Characters left untouched when a key segment goes into a URL
const KEY_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const EVENT_BUFFER: usize = 64;

/// Granularity of in-part progress for multipart uploads
const PROGRESS_FRAME: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageErrorCode {
    Unauthorized,
    Canceled,
    QuotaExceeded,
    RetryLimitExceeded,
    NotFound,
    Network,
    Unknown,
}

impl StorageErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageErrorCode::Unauthorized => "storage/unauthorized",
            StorageErrorCode::Canceled => "storage/canceled",
            StorageErrorCode::QuotaExceeded => "storage/quota-exceeded",
            StorageErrorCode::RetryLimitExceeded => "storage/retry-limit-exceeded",
            StorageErrorCode::NotFound => "storage/object-not-found",
            StorageErrorCode::Network => "storage/network",
            StorageErrorCode::Unknown => "storage/unknown",
        }
    }
}

/// Error reported by a storage backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct StorageError {
    pub code: StorageErrorCode,
    pub message: String,
}

impl StorageError {
    pub fn new(code: StorageErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StorageErrorCode::Unauthorized, message)
    }

    pub fn canceled() -> Self {
        Self::new(StorageErrorCode::Canceled, "Transfer canceled")
    }

    pub fn not_found(key: &str) -> Self {
        Self::new(StorageErrorCode::NotFound, format!("Object not found: {}", key))
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(StorageErrorCode::Network, message)
    }
}

/// One object to transfer
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub key: String,
    pub data: Bytes,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
}

/// Notifications emitted by a running transfer, in order
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress {
        bytes_transferred: u64,
        total_bytes: u64,
    },
    Completed {
        key: String,
    },
    Failed(StorageError),
}

/// A running resumable transfer: an ordered event stream plus a cancel control
pub struct TransferHandle {
    pub events: mpsc::Receiver<TransferEvent>,
    cancel: CancellationToken,
}

impl TransferHandle {
    pub fn new(events: mpsc::Receiver<TransferEvent>, cancel: CancellationToken) -> Self {
        Self { events, cancel }
    }

    /// Creates a connected sender / handle pair for backends that drive the transfer themselves
    pub fn channel(cancel: CancellationToken) -> (mpsc::Sender<TransferEvent>, Self) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        (tx, Self::new(rx, cancel))
    }

    /// Requests abort. Safe to call more than once.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[async_trait]
pub trait StorageService: Send + Sync {
    /// Opens a transfer. Returns once the backend accepted it; progress follows on the handle.
    /// Cancelling `cancel` aborts the transfer.
    async fn start_transfer(
        &self,
        request: TransferRequest,
        cancel: CancellationToken,
    ) -> Result<TransferHandle, StorageError>;

    /// Durable retrieval URL for a completed object
    async fn download_url(&self, key: &str) -> Result<String, StorageError>;

    /// Addressable reference for `key`, computed without any network call
    fn object_reference(&self, key: &str) -> Result<String, StorageError>;

    async fn delete_object(&self, key: &str) -> Result<(), StorageError>;

    /// Cheap reachability check
    async fn health_check(&self) -> Result<(), StorageError>;
}

/// `{base}/{percent-encoded key}`, validated as a URL
pub fn build_object_url(base: &str, key: &str) -> Result<String, StorageError> {
    let encoded = key
        .split('/')
        .map(|segment| utf8_percent_encode(segment, KEY_SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/");
    let raw = format!("{}/{}", base.trim_end_matches('/'), encoded);

    url::Url::parse(&raw)
        .map(|u| u.to_string())
        .map_err(|e| StorageError::new(StorageErrorCode::Unknown, format!("Invalid object URL {}: {}", raw, e)))
}

fn classify_sdk_error<E, R>(err: &SdkError<E, R>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let code = match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => StorageErrorCode::Network,
        _ => match err.code() {
            Some("AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken") => {
                StorageErrorCode::Unauthorized
            }
            Some("NoSuchKey" | "NoSuchBucket" | "NoSuchUpload" | "NotFound") => {
                StorageErrorCode::NotFound
            }
            Some("QuotaExceeded" | "EntityTooLarge" | "ServiceUnavailable" | "SlowDown") => {
                StorageErrorCode::QuotaExceeded
            }
            _ => StorageErrorCode::Unknown,
        },
    };

    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| DisplayErrorContext(err).to_string());
    StorageError::new(code, message)
}

pub struct S3StorageService {
    client: Client,
    bucket: String,
    public_base: String,
    part_size: usize,
}

impl S3StorageService {
    pub fn new(client: Client, bucket: String, public_base: String, part_size: usize) -> Self {
        Self {
            client,
            bucket,
            public_base,
            part_size,
        }
    }
}

#[async_trait]
impl StorageService for S3StorageService {
    async fn start_transfer(
        &self,
        request: TransferRequest,
        cancel: CancellationToken,
    ) -> Result<TransferHandle, StorageError> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&request.key)
            .content_type(&request.content_type)
            .set_metadata(Some(request.metadata.clone()))
            .send();

        let created = tokio::select! {
            _ = cancel.cancelled() => return Err(StorageError::canceled()),
            res = create => res.map_err(|e| classify_sdk_error(&e))?,
        };

        let upload_id = created
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::new(StorageErrorCode::Unknown, "No upload ID"))?;

        let (tx, handle) = TransferHandle::channel(cancel.clone());
        let transfer = MultipartTransfer {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: request.key,
            upload_id,
            data: request.data,
            part_size: self.part_size.max(1),
            cancel,
        };
        tokio::spawn(transfer.run(tx));

        Ok(handle)
    }

    async fn download_url(&self, key: &str) -> Result<String, StorageError> {
        self.client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e))?;

        self.object_reference(key)
    }

    fn object_reference(&self, key: &str) -> Result<String, StorageError> {
        build_object_url(&self.public_base, key)
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e))?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e))?;
        Ok(())
    }
}

/// Background part uploader for one multipart upload
struct MultipartTransfer {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    data: Bytes,
    part_size: usize,
    cancel: CancellationToken,
}

impl MultipartTransfer {
    async fn run(self, tx: mpsc::Sender<TransferEvent>) {
        let total = self.data.len() as u64;
        let _ = tx
            .send(TransferEvent::Progress {
                bytes_transferred: 0,
                total_bytes: total,
            })
            .await;

        match self.upload_parts(&tx).await {
            Ok(()) => {
                debug!("S3 multipart upload completed: {}", self.key);
                let _ = tx.send(TransferEvent::Completed { key: self.key.clone() }).await;
            }
            Err(err) => {
                self.abort().await;
                let _ = tx.send(TransferEvent::Failed(err)).await;
            }
        }
    }

    async fn upload_parts(&self, tx: &mpsc::Sender<TransferEvent>) -> Result<(), StorageError> {
        let total = self.data.len() as u64;
        let mut completed_parts = Vec::new();
        let mut sent: u64 = 0;

        for (index, chunk) in self.data.chunks(self.part_size).enumerate() {
            let part_number = (index + 1) as i32;
            let (counter, pulled) = watch::channel(sent);
            let body = ProgressBody::new(self.data.slice_ref(chunk), sent, PROGRESS_FRAME, counter);

            let upload = async {
                self.client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(&self.key)
                    .upload_id(&self.upload_id)
                    .content_length(chunk.len() as i64)
                    .body(ByteStream::from_body_1_x(body))
                    .part_number(part_number)
                    .send()
                    .await
                    .map_err(|e| classify_sdk_error(&e))
            };

            let part = forward_progress(upload, pulled, total, tx, &self.cancel).await?;

            completed_parts.push(
                CompletedPart::builder()
                    .e_tag(part.e_tag().unwrap_or_default())
                    .part_number(part_number)
                    .build(),
            );

            sent += chunk.len() as u64;
            let _ = tx
                .send(TransferEvent::Progress {
                    bytes_transferred: sent,
                    total_bytes: total,
                })
                .await;
        }

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        let complete = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed)
            .send();

        tokio::select! {
            _ = self.cancel.cancelled() => Err(StorageError::canceled()),
            res = complete => res.map(|_| ()).map_err(|e| classify_sdk_error(&e)),
        }
    }

    async fn abort(&self) {
        let res = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await;

        if let Err(e) = res {
            warn!(
                "S3 abort_multipart_upload failed: key={}, error={}",
                self.key,
                DisplayErrorContext(&e)
            );
        }
    }
}

/// Part body that hands its bytes to the HTTP client in small frames and
/// publishes the running object offset as each frame is pulled.
struct ProgressBody {
    data: Bytes,
    offset: usize,
    base: u64,
    frame_size: usize,
    counter: watch::Sender<u64>,
}

impl ProgressBody {
    fn new(data: Bytes, base: u64, frame_size: usize, counter: watch::Sender<u64>) -> Self {
        Self {
            data,
            offset: 0,
            base,
            frame_size: frame_size.max(1),
            counter,
        }
    }
}

impl Body for ProgressBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if self.offset >= self.data.len() {
            return Poll::Ready(None);
        }

        let end = (self.offset + self.frame_size).min(self.data.len());
        let frame = self.data.slice(self.offset..end);
        self.offset = end;
        self.counter.send_replace(self.base + end as u64);

        Poll::Ready(Some(Ok(Frame::data(frame))))
    }

    fn is_end_stream(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact((self.data.len() - self.offset) as u64)
    }
}

/// Awaits one part request, turning body pulls into `Progress` events until it settles
async fn forward_progress<F, T>(
    request: F,
    mut pulled: watch::Receiver<u64>,
    total: u64,
    tx: &mpsc::Sender<TransferEvent>,
    cancel: &CancellationToken,
) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    tokio::pin!(request);
    let mut watching = true;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StorageError::canceled()),
            res = &mut request => return res,
            changed = pulled.changed(), if watching => {
                // Body dropped: nothing more to report for this part
                if changed.is_err() {
                    watching = false;
                    continue;
                }
                let bytes_transferred = *pulled.borrow_and_update();
                let _ = tx
                    .send(TransferEvent::Progress {
                        bytes_transferred,
                        total_bytes: total,
                    })
                    .await;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
}

/// In-process backend for development and the CLI's offline mode
pub struct MemoryStorageService {
    objects: Arc<DashMap<String, StoredObject>>,
    public_base: String,
    chunk_size: usize,
}

impl MemoryStorageService {
    pub fn new(public_base: impl Into<String>) -> Self {
        Self {
            objects: Arc::new(DashMap::new()),
            public_base: public_base.into(),
            chunk_size: 256 * 1024,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl StorageService for MemoryStorageService {
    async fn start_transfer(
        &self,
        request: TransferRequest,
        cancel: CancellationToken,
    ) -> Result<TransferHandle, StorageError> {
        let (tx, handle) = TransferHandle::channel(cancel.clone());
        let objects = Arc::clone(&self.objects);
        let chunk_size = self.chunk_size;

        tokio::spawn(async move {
            let total = request.data.len() as u64;
            let mut sent: u64 = 0;

            for chunk in request.data.chunks(chunk_size) {
                if cancel.is_cancelled() {
                    let _ = tx.send(TransferEvent::Failed(StorageError::canceled())).await;
                    return;
                }
                tokio::task::yield_now().await;
                sent += chunk.len() as u64;
                let _ = tx
                    .send(TransferEvent::Progress {
                        bytes_transferred: sent,
                        total_bytes: total,
                    })
                    .await;
            }

            if cancel.is_cancelled() {
                let _ = tx.send(TransferEvent::Failed(StorageError::canceled())).await;
                return;
            }

            let key = request.key.clone();
            objects.insert(
                request.key,
                StoredObject {
                    data: request.data,
                    content_type: request.content_type,
                    metadata: request.metadata,
                },
            );
            let _ = tx.send(TransferEvent::Completed { key }).await;
        });

        Ok(handle)
    }

    async fn download_url(&self, key: &str) -> Result<String, StorageError> {
        if !self.objects.contains_key(key) {
            return Err(StorageError::not_found(key));
        }
        self.object_reference(key)
    }

    fn object_reference(&self, key: &str) -> Result<String, StorageError> {
        build_object_url(&self.public_base, key)
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        if self.objects.remove(key).is_some() {
            info!("🗑️  Deleted object {}", key);
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn request(key: &str, len: usize) -> TransferRequest {
        TransferRequest {
            key: key.to_string(),
            data: Bytes::from(vec![7u8; len]),
            content_type: "image/png".to_string(),
            metadata: HashMap::from([("original_name".to_string(), "a.png".to_string())]),
        }
    }

    #[test]
    fn test_object_url_encoding() {
        let url = build_object_url("http://localhost:9000/site-assets/", "leaders/17_team photo.png")
            .unwrap();
        assert_eq!(url, "http://localhost:9000/site-assets/leaders/17_team%20photo.png");
    }

    #[test]
    fn test_object_url_rejects_bad_base() {
        let err = build_object_url("not a url", "a.png").unwrap_err();
        assert_eq!(err.code, StorageErrorCode::Unknown);
    }

    #[tokio::test]
    async fn test_memory_transfer_reports_ordered_progress() {
        let storage = MemoryStorageService::new("http://localhost:9000/site-assets").with_chunk_size(4);
        let mut handle = storage
            .start_transfer(request("leaders/1_a.png", 10), CancellationToken::new())
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Some(event) = handle.events.recv().await {
            seen.push(event);
        }

        assert_eq!(
            seen,
            vec![
                TransferEvent::Progress { bytes_transferred: 4, total_bytes: 10 },
                TransferEvent::Progress { bytes_transferred: 8, total_bytes: 10 },
                TransferEvent::Progress { bytes_transferred: 10, total_bytes: 10 },
                TransferEvent::Completed { key: "leaders/1_a.png".to_string() },
            ]
        );

        let stored = storage.get("leaders/1_a.png").unwrap();
        assert_eq!(stored.metadata["original_name"], "a.png");
        assert!(storage.download_url("leaders/1_a.png").await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_transfer_cancel() {
        let storage = MemoryStorageService::new("http://localhost:9000/site-assets");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut handle = storage
            .start_transfer(request("leaders/2_b.png", 10), cancel)
            .await
            .unwrap();

        assert_eq!(
            handle.events.recv().await,
            Some(TransferEvent::Failed(StorageError::canceled()))
        );
        assert!(storage.is_empty());
        assert_eq!(
            storage.download_url("leaders/2_b.png").await.unwrap_err().code,
            StorageErrorCode::NotFound
        );
    }

    #[tokio::test]
    async fn test_single_part_body_reports_bytes_as_pulled() {
        // 1. One part carrying the whole 5 MiB file
        let total = 5 * 1024 * 1024;
        let (counter, pulled) = watch::channel(0);
        let mut body = ProgressBody::new(Bytes::from(vec![1u8; total]), 0, PROGRESS_FRAME, counter);
        assert_eq!(body.size_hint().exact(), Some(total as u64));

        // 2. Every pulled frame moves the counter forward
        let mut offsets = Vec::new();
        while let Some(frame) = body.frame().await {
            let data = frame.unwrap().into_data().unwrap();
            assert!(data.len() <= PROGRESS_FRAME);
            offsets.push(*pulled.borrow());
        }

        assert_eq!(offsets.len(), total / PROGRESS_FRAME);
        assert_eq!(offsets[0], PROGRESS_FRAME as u64);
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*offsets.last().unwrap(), total as u64);
        assert!(body.is_end_stream());
    }

    #[tokio::test]
    async fn test_later_part_offsets_continue_from_base() {
        let (counter, pulled) = watch::channel(0);
        let mut body = ProgressBody::new(Bytes::from(vec![1u8; 10]), 100, 4, counter);

        body.frame().await.unwrap().unwrap();
        assert_eq!(*pulled.borrow(), 104);
        body.frame().await.unwrap().unwrap();
        body.frame().await.unwrap().unwrap();
        assert_eq!(*pulled.borrow(), 110);
        assert!(body.frame().await.is_none());
    }

    #[tokio::test]
    async fn test_stalled_part_still_reports_partial_progress() {
        let total = 1024 * 1024;
        let (counter, pulled) = watch::channel(0);
        let mut body = ProgressBody::new(Bytes::from(vec![1u8; total]), 0, PROGRESS_FRAME, counter);
        let (tx, mut events) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();

        // A request whose connection stops accepting bytes after three frames
        let request = async move {
            for _ in 0..3 {
                body.frame().await.unwrap().unwrap();
                tokio::task::yield_now().await;
            }
            std::future::pending::<Result<(), StorageError>>().await
        };

        let forward = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                forward_progress(request, pulled, total as u64, &tx, &cancel).await
            })
        };

        // 1. Intermediate progress arrives although the part never finished
        let mut last = 0;
        while last < 3 * PROGRESS_FRAME as u64 {
            match events.recv().await.unwrap() {
                TransferEvent::Progress {
                    bytes_transferred,
                    total_bytes,
                } => {
                    assert_eq!(total_bytes, total as u64);
                    assert!(bytes_transferred > last);
                    assert!(bytes_transferred < total_bytes);
                    last = bytes_transferred;
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(last, 3 * PROGRESS_FRAME as u64);

        // 2. Cancelling ends the wait
        cancel.cancel();
        assert_eq!(forward.await.unwrap(), Err(StorageError::canceled()));
    }
}
