// mongodumper/src/backup/s3_upload.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use aws_smithy_types::body::SdkBody;
use bytes::Bytes;
use futures::StreamExt;
use http_body::Frame;
use http_body_util::StreamBody;
use s3::config::{
    BehaviorVersion, Credentials, Region, RequestChecksumCalculation, ResponseChecksumValidation,
};
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::errors::{AppError, Result};
use crate::utils::progress::{ProgressThrottle, bytes_to_mb, format_size, percent_of, throughput};

const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UploadStats {
    pub bytes: u64,
    pub duration: Duration,
}

/// One object found under a listing prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupObject {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<chrono::DateTime<chrono::Utc>>,
}

/// Destination of finished archives.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads `local_path` under `key`, overwriting any existing object.
    async fn upload_file(&self, local_path: &Path, key: &str, cancel: &CancellationToken) -> Result<UploadStats>;
}

/// S3-compatible bucket reached through a custom endpoint with static credentials.
#[derive(Clone)]
pub struct S3Storage {
    client: s3::Client,
    bucket: String,
}

impl std::fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Storage").field("bucket", &self.bucket).finish()
    }
}

impl S3Storage {
    /// Builds the client. No request is made until the first operation.
    pub async fn connect(storage: &StorageConfig) -> Self {
        debug!(
            endpoint = %storage.endpoint_url,
            region = %storage.region,
            bucket = %storage.bucket_name,
            "Configuring S3 client"
        );

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(&storage.endpoint_url)
            .region(Region::new(storage.region.clone()))
            .credentials_provider(Credentials::new(
                &storage.access_key_id,
                &storage.secret_access_key,
                None,
                None,
                "Static",
            ))
            .load()
            .await;

        Self::from_config(s3::config::Builder::from(&sdk_config), &storage.bucket_name)
    }

    /// Finishes an S3 client configuration for a bucket on an S3-compatible endpoint.
    pub(crate) fn from_config(builder: s3::config::Builder, bucket: &str) -> Self {
        // Path-style addressing and opt-in checksums keep non-AWS providers happy.
        let s3_config = builder
            .force_path_style(true)
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .response_checksum_validation(ResponseChecksumValidation::WhenRequired)
            .build();

        Self {
            client: s3::Client::from_conf(s3_config),
            bucket: bucket.to_string(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub(crate) fn client(&self) -> &s3::Client {
        &self.client
    }

    /// Lists every object under `prefix`, following continuation tokens.
    pub async fn list_backups(&self, prefix: &str, cancel: &CancellationToken) -> Result<Vec<BackupObject>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send();

            let response = tokio::select! {
                response = request => response,
                _ = cancel.cancelled() => {
                    return Err(AppError::Cancelled(format!("listing of '{}' was interrupted", prefix)));
                }
            };

            let page = response.map_err(|e| AppError::List {
                prefix: prefix.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                objects.push(BackupObject {
                    key: key.to_string(),
                    size: object.size().unwrap_or_default().max(0) as u64,
                    last_modified: object
                        .last_modified()
                        .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
                });
            }

            match (page.is_truncated(), page.next_continuation_token()) {
                (Some(true), Some(token)) => continuation = Some(token.to_string()),
                _ => break,
            }
        }

        debug!(prefix, count = objects.len(), "Listed backup objects");
        Ok(objects)
    }
}

#[async_trait]
impl ObjectStore for S3Storage {
    async fn upload_file(&self, local_path: &Path, key: &str, cancel: &CancellationToken) -> Result<UploadStats> {
        let upload_err = |message: String| AppError::Upload {
            key: key.to_string(),
            message,
        };

        let total = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| upload_err(format!("failed to stat {}: {}", local_path.display(), e)))?
            .len();

        info!(
            file = %local_path.display(),
            bucket = %self.bucket,
            key,
            size = %format_size(total),
            "Starting upload"
        );

        let attempts = Arc::new(AtomicUsize::new(0));
        let body = ByteStream::new(progress_body(local_path.to_path_buf(), key.to_string(), total, attempts));
        let started = Instant::now();

        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(total as i64)
            .content_type("application/zip")
            .body(body)
            .send();

        // Dropping the request future aborts the transfer.
        let response = tokio::select! {
            response = request => response,
            _ = cancel.cancelled() => {
                warn!(key, "Cancellation requested, aborting upload");
                return Err(AppError::Cancelled(format!("upload of {} was interrupted", key)));
            }
        };
        response.map_err(|e| upload_err(DisplayErrorContext(&e).to_string()))?;

        let duration = started.elapsed();
        info!(
            key,
            bucket = %self.bucket,
            size = %format_size(total),
            duration = ?duration,
            mb_per_sec = bytes_to_mb(throughput(total, duration)),
            "Upload completed"
        );

        Ok(UploadStats {
            bytes: total,
            duration,
        })
    }
}

/// Request body that reopens the file whenever the SDK rebuilds it, so a retry
/// resends the whole archive.
///
/// The SDK also rebuilds bodies it keeps aside as retry checkpoints and never
/// sends, so attempts are counted by the readers that actually start reading.
fn progress_body(path: PathBuf, key: String, total: u64, attempts: Arc<AtomicUsize>) -> SdkBody {
    SdkBody::retryable(move || match std::fs::File::open(&path) {
        Ok(file) => {
            let reader = ProgressReader::new(tokio::fs::File::from_std(file), key.clone(), total)
                .sharing_attempts(Arc::clone(&attempts));
            let stream = ReaderStream::with_capacity(reader, UPLOAD_CHUNK_SIZE)
                .map(|chunk| chunk.map(Frame::data));
            SdkBody::from_body_1_x(StreamBody::new(stream))
        }
        Err(e) => {
            let err = std::io::Error::new(e.kind(), format!("failed to open {}: {}", path.display(), e));
            let stream = futures::stream::once(async move { Err::<Frame<Bytes>, _>(err) });
            SdkBody::from_body_1_x(StreamBody::new(stream))
        }
    })
}

/// Counts bytes pulled through it and logs upload progress in 10% steps.
///
/// Each pass over the data is one attempt. The first read of a pass takes the
/// next number from the shared counter and every progress line carries it, so
/// percentages only restart together with a new attempt number. Seeking back to
/// the start begins a new pass.
#[derive(Debug)]
pub struct ProgressReader<R> {
    inner: R,
    key: String,
    total: u64,
    attempts: Arc<AtomicUsize>,
    attempt: Option<usize>,
    read: u64,
    started: Instant,
    throttle: ProgressThrottle,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, key: String, total: u64) -> Self {
        Self {
            inner,
            key,
            total,
            attempts: Arc::new(AtomicUsize::new(0)),
            attempt: None,
            read: 0,
            started: Instant::now(),
            throttle: ProgressThrottle::new(),
        }
    }

    /// Numbers passes from a counter shared with other readers over the same file.
    pub fn sharing_attempts(mut self, attempts: Arc<AtomicUsize>) -> Self {
        self.attempts = attempts;
        self
    }

    #[cfg(test)]
    fn bytes_read(&self) -> u64 {
        self.read
    }

    #[cfg(test)]
    fn last_logged_percent(&self) -> u8 {
        self.throttle.last_logged()
    }

    fn begin_attempt(&mut self) -> usize {
        if let Some(attempt) = self.attempt {
            return attempt;
        }
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        if attempt > 1 {
            warn!(key = %self.key, attempt, "Retrying upload from the start of the file");
        }
        self.attempt = Some(attempt);
        self.started = Instant::now();
        attempt
    }

    fn record(&mut self, n: usize) {
        let attempt = self.begin_attempt();
        if n == 0 && self.total > 0 {
            return;
        }
        self.read += n as u64;
        if let Some(percent) = self.throttle.observe(percent_of(self.read, self.total)) {
            info!(
                key = %self.key,
                attempt,
                percent_complete = percent,
                uploaded = %format_size(self.read),
                total = %format_size(self.total),
                mb_per_sec = bytes_to_mb(throughput(self.read, self.started.elapsed())),
                "Upload progress"
            );
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let polled = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &polled {
            let n = buf.filled().len() - before;
            self.record(n);
        }
        polled
    }
}

impl<R: AsyncSeek + Unpin> AsyncSeek for ProgressReader<R> {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        Pin::new(&mut self.inner).start_seek(position)?;
        if position == SeekFrom::Start(0) {
            self.read = 0;
            self.attempt = None;
            self.throttle.reset();
        }
        Ok(())
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        Pin::new(&mut self.inner).poll_complete(cx)
    }
}

/// Storage for bucket `backups` whose requests are answered by `http_client`.
#[cfg(test)]
pub(crate) fn test_storage(http_client: impl s3::config::HttpClient + 'static) -> S3Storage {
    let builder = s3::config::Builder::new()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .endpoint_url("http://s3.test")
        .credentials_provider(Credentials::new("test-key", "test-secret", None, None, "Static"))
        .retry_config(s3::config::retry::RetryConfig::disabled())
        .http_client(http_client);
    S3Storage::from_config(builder, "backups")
}
