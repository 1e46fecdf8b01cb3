// mongodumper/src/restore/mod.rs
pub mod s3_download;

use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backup::archive::extract_zip_archive;
use crate::backup::{BackupArtifact, S3Storage};
use crate::errors::{AppError, Result};
use s3_download::parse_s3_uri;

/// Where a restore reads from: a key in the configured bucket or a full `s3://` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSource {
    pub bucket: Option<String>,
    pub key: String,
}

impl RestoreSource {
    pub fn parse(source: &str) -> Result<Self> {
        if source.starts_with("s3://") {
            let (bucket, key) = parse_s3_uri(source)?;
            return Ok(Self {
                bucket: Some(bucket),
                key,
            });
        }
        let key = source.trim_start_matches('/');
        if key.is_empty() {
            return Err(AppError::Config("restore source must name an object key".to_string()));
        }
        Ok(Self {
            bucket: None,
            key: key.to_string(),
        })
    }

    /// File name of the object, used when no output path is given.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// Resolves the local archive path: `output` as given, inside `output` when it is
/// an existing directory, otherwise the object's file name in the working directory.
pub fn resolve_destination(source: &RestoreSource, output: Option<&Path>) -> PathBuf {
    match output {
        Some(path) if path.is_dir() => path.join(source.file_name()),
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(source.file_name()),
    }
}

/// Downloads a backup archive and optionally unpacks it next to the download.
///
/// Loading the dump into a database is left to `mongorestore`.
pub async fn run_restore(
    storage: &S3Storage,
    source: &str,
    output: Option<&Path>,
    extract: bool,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    let source = RestoreSource::parse(source)?;
    match BackupArtifact::parse_remote_key(&source.key) {
        Some(parts) => info!(
            environment = %parts.environment,
            database = %parts.database,
            created_at = %parts.created_at,
            "Restoring backup"
        ),
        None => warn!(key = %source.key, "Key does not follow the backup naming scheme"),
    }

    let destination = resolve_destination(&source, output);
    let archive = match source.bucket.as_deref() {
        Some(bucket) => storage.download_object(bucket, &source.key, &destination, cancel).await?,
        None => storage.download_file(&source.key, &destination, cancel).await?,
    };

    if !extract {
        info!(archive = %archive.display(), "Backup archive downloaded");
        return Ok(archive);
    }

    let archive_path = archive.clone();
    let target = archive.with_extension("");
    let extracted = tokio::task::spawn_blocking(move || extract_zip_archive(&archive_path, &target))
        .await
        .map_err(|e| AppError::Archive {
            path: archive.clone(),
            source: std::io::Error::other(e),
        })??;

    info!(
        dump_dir = %extracted.display(),
        "Restore ready, run mongorestore against this directory"
    );
    Ok(extracted)
}
