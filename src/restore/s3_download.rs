// mongodumper/src/restore/s3_download.rs
use aws_sdk_s3::error::DisplayErrorContext;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backup::S3Storage;
use crate::errors::{AppError, Result};
use crate::utils::progress::{bytes_to_mb, format_size, throughput};

/// Parses an S3 URI (`s3://bucket/key`) into bucket and key.
pub fn parse_s3_uri(s3_uri: &str) -> Result<(String, String)> {
    let uri = url::Url::parse(s3_uri)
        .map_err(|e| AppError::Config(format!("Invalid S3 URI format: {}: {}", s3_uri, e)))?;
    if uri.scheme() != "s3" {
        return Err(AppError::Config("S3 URI must start with s3://".to_string()));
    }
    let bucket = uri
        .host_str()
        .filter(|b| !b.is_empty())
        .ok_or_else(|| AppError::Config(format!("S3 URI missing bucket name: {}", s3_uri)))?
        .to_string();
    let key = uri.path().trim_start_matches('/').to_string();
    if key.is_empty() {
        return Err(AppError::Config(format!("S3 URI missing key (object path): {}", s3_uri)));
    }
    Ok((bucket, key))
}

impl S3Storage {
    /// Streams `key` from the configured bucket into `destination`.
    pub async fn download_file(&self, key: &str, destination: &Path, cancel: &CancellationToken) -> Result<PathBuf> {
        self.download_object(self.bucket(), key, destination, cancel).await
    }

    /// Streams `bucket/key` into `destination`, creating parent directories.
    pub async fn download_object(
        &self,
        bucket: &str,
        key: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        tokio::select! {
            downloaded = self.fetch_to_file(bucket, key, destination) => downloaded,
            _ = cancel.cancelled() => {
                // The partial file is useless once the stream is dropped.
                match tokio::fs::remove_file(destination).await {
                    Ok(()) => debug!(path = %destination.display(), "Removed partial download"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        debug!(path = %destination.display(), "No partial download to remove");
                    }
                    Err(e) => warn!(
                        path = %destination.display(),
                        error = %e,
                        "Failed to remove partial download"
                    ),
                }
                Err(AppError::Cancelled(format!("download of {} was interrupted", key)))
            }
        }
    }

    async fn fetch_to_file(&self, bucket: &str, key: &str, destination: &Path) -> Result<PathBuf> {
        let download_err = |message: String| AppError::Download {
            key: key.to_string(),
            message,
        };

        info!(
            bucket,
            key,
            destination = %destination.display(),
            "Starting download"
        );

        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                download_err(format!("failed to create directory {}: {}", parent.display(), e))
            })?;
        }

        let mut object = self
            .client()
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| download_err(DisplayErrorContext(&e).to_string()))?;

        let mut output_file = File::create(destination).await.map_err(|e| {
            download_err(format!("failed to create {}: {}", destination.display(), e))
        })?;

        let started = std::time::Instant::now();
        let mut total_bytes = 0u64;
        while let Some(chunk) = object
            .body
            .try_next()
            .await
            .map_err(|e| download_err(format!("failed to read object body: {}", e)))?
        {
            output_file.write_all(&chunk).await.map_err(|e| {
                download_err(format!("failed to write {}: {}", destination.display(), e))
            })?;
            total_bytes += chunk.len() as u64;
        }
        output_file
            .flush()
            .await
            .map_err(|e| download_err(format!("failed to flush {}: {}", destination.display(), e)))?;

        let duration = started.elapsed();
        info!(
            key,
            destination = %destination.display(),
            size = %format_size(total_bytes),
            duration = ?duration,
            mb_per_sec = bytes_to_mb(throughput(total_bytes, duration)),
            "Download completed"
        );
        Ok(destination.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::s3_upload::test_storage;
    use aws_smithy_http_client::test_util::{NeverClient, infallible_client_fn};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    const NO_SUCH_KEY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Error><Code>NoSuchKey</Code><Message>The specified key does not exist.</Message><RequestId>req-2</RequestId></Error>"#;

    #[tokio::test]
    async fn test_download_file_streams_object_from_configured_bucket() -> anyhow::Result<()> {
        let paths = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&paths);
        let storage = test_storage(infallible_client_fn(move |request| {
            seen.lock().unwrap().push(request.uri().path().to_string());
            http::Response::builder()
                .status(200)
                .header("Content-Length", "13")
                .body("zip contents!")
                .unwrap()
        }));
        let temp = TempDir::new()?;
        let destination = temp.path().join("nested").join("orders.zip");

        let downloaded = storage
            .download_file("staging/2023-04-15/orders.zip", &destination, &CancellationToken::new())
            .await?;

        assert_eq!(downloaded, destination);
        assert_eq!(std::fs::read(&destination)?, b"zip contents!");
        assert_eq!(*paths.lock().unwrap(), vec!["/backups/staging/2023-04-15/orders.zip".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_download_missing_object_names_the_key() -> anyhow::Result<()> {
        let storage = test_storage(infallible_client_fn(|_| {
            http::Response::builder().status(404).body(NO_SUCH_KEY).unwrap()
        }));
        let temp = TempDir::new()?;
        let destination = temp.path().join("orders.zip");

        let err = storage
            .download_object("archive", "staging/missing.zip", &destination, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            AppError::Download { key, message } => {
                assert_eq!(key, "staging/missing.zip");
                assert!(message.contains("NoSuchKey"), "message: {message}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!destination.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_download_cancelled_leaves_no_file() -> anyhow::Result<()> {
        let storage = test_storage(NeverClient::new());
        let temp = TempDir::new()?;
        let destination = temp.path().join("orders.zip");

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = storage
            .download_file("staging/orders.zip", &destination, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(!destination.exists());
        Ok(())
    }

    #[test]
    fn test_parse_s3_uri() -> anyhow::Result<()> {
        let (bucket, key) = parse_s3_uri("s3://backups/staging/2023-04-15/orders-staging-2023-04-15T12-00-00Z.zip")?;
        assert_eq!(bucket, "backups");
        assert_eq!(key, "staging/2023-04-15/orders-staging-2023-04-15T12-00-00Z.zip");
        Ok(())
    }

    #[test]
    fn test_parse_s3_uri_rejects_bad_input() {
        for uri in ["https://backups/key.zip", "s3://backups", "s3://backups/", "not a uri"] {
            let err = parse_s3_uri(uri).unwrap_err();
            assert!(err.is_config(), "unexpected error for {uri:?}: {err}");
        }
    }
}
