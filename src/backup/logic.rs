// mongodumper/src/backup/logic.rs
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::archive::compress_dir;
use super::artifact::BackupArtifact;
use super::cleanup::{cleanup, cleanup_blocking};
use super::db_dump::MongoDumper;
use super::s3_upload::ObjectStore;
use crate::config::{BackupJob, DEFAULT_ENVIRONMENT};
use crate::errors::{AppError, Result};
use crate::utils::progress::format_size;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageTimings {
    pub dump: Duration,
    pub compress: Duration,
    pub upload: Duration,
    pub cleanup: Duration,
    pub total: Duration,
}

/// Outcome of one run. Cleanup never affects `success`.
#[derive(Debug)]
pub struct RunResult {
    pub success: bool,
    pub remote_key: String,
    pub timings: StageTimings,
    pub original_size: u64,
    pub compressed_size: u64,
    pub compression_ratio: Option<f64>,
    pub collection_count: usize,
    pub error: Option<AppError>,
}

impl RunResult {
    fn new(remote_key: String) -> Self {
        Self {
            success: false,
            remote_key,
            timings: StageTimings::default(),
            original_size: 0,
            compressed_size: 0,
            compression_ratio: None,
            collection_count: 0,
            error: None,
        }
    }

    /// The run's error, if any, as a `Result`.
    pub fn into_result(mut self) -> Result<Self> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Local paths owned by a run. Removed on every exit path; if the async
/// release never happens (the run future was dropped) `Drop` removes them.
struct LocalArtifacts {
    paths: Vec<PathBuf>,
    released: bool,
}

impl LocalArtifacts {
    fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            released: false,
        }
    }

    async fn release(mut self) -> Duration {
        let started = Instant::now();
        cleanup(&self.paths).await;
        self.released = true;
        started.elapsed()
    }
}

impl Drop for LocalArtifacts {
    fn drop(&mut self) {
        if !self.released {
            warn!("Backup run ended without cleanup, removing local artifacts");
            cleanup_blocking(&self.paths);
        }
    }
}

/// Dump, Archive, Upload and Cleanup for one configured source.
pub struct BackupPipeline<S> {
    job: Arc<BackupJob>,
    dumper: MongoDumper,
    store: S,
    run_lock: Mutex<()>,
}

impl<S: ObjectStore> BackupPipeline<S> {
    pub fn new(job: Arc<BackupJob>, dumper: MongoDumper, store: S) -> Self {
        Self {
            job,
            dumper,
            store,
            run_lock: Mutex::new(()),
        }
    }

    pub fn job(&self) -> &BackupJob {
        &self.job
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Performs one backup run. A concurrent call waits for the current run.
    pub async fn run(&self, cancel: &CancellationToken) -> RunResult {
        let _running = self.run_lock.lock().await;
        let started = Instant::now();

        if self.job.environment.is_none() {
            info!(environment = DEFAULT_ENVIRONMENT, "No environment specified, using default");
        }
        let artifact = BackupArtifact::generate(
            &self.job.temp_dir,
            self.job.environment_or_default(),
            self.job.database_or_default(),
            Utc::now(),
        );

        info!(
            database = self.job.database_or_default(),
            environment = self.job.environment_or_default(),
            backup = %artifact.base_name,
            created_at = %artifact.created_at.to_rfc3339(),
            key = %artifact.remote_key,
            "Starting MongoDB backup"
        );

        let local = LocalArtifacts::new(vec![artifact.dump_dir.clone(), artifact.archive_path.clone()]);
        let mut result = RunResult::new(artifact.remote_key.clone());

        let outcome = self.execute_stages(&artifact, &mut result, cancel).await;

        info!("STEP 4/4: Cleaning up local files");
        result.timings.cleanup = local.release().await;
        result.timings.total = started.elapsed();

        match outcome {
            Ok(()) => {
                result.success = true;
                log_summary(&result);
            }
            Err(err) => {
                if err.is_cancelled() {
                    warn!(key = %result.remote_key, error = %err, duration = ?result.timings.total, "Backup run cancelled");
                } else {
                    error!(key = %result.remote_key, error = %err, duration = ?result.timings.total, "Backup run failed");
                }
                result.error = Some(err);
            }
        }

        result
    }

    async fn execute_stages(
        &self,
        artifact: &BackupArtifact,
        result: &mut RunResult,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!("STEP 1/4: Dumping MongoDB database");
        let dump = self.dumper.create_dump(&artifact.dump_dir, cancel).await?;
        result.timings.dump = dump.duration;
        result.original_size = dump.total_size;
        result.collection_count = dump.collection_count;

        info!("STEP 2/4: Compressing dump");
        let archive = compress_dir(&artifact.dump_dir, &artifact.archive_path, dump.total_size, cancel).await?;
        result.timings.compress = archive.duration;
        result.compressed_size = archive.compressed_size;
        result.compression_ratio = archive.compression_ratio();

        info!("STEP 3/4: Uploading to S3");
        let upload = self
            .store
            .upload_file(&artifact.archive_path, &artifact.remote_key, cancel)
            .await?;
        result.timings.upload = upload.duration;
        debug!(bytes = upload.bytes, key = %artifact.remote_key, "Archive stored");

        Ok(())
    }
}

fn log_summary(result: &RunResult) {
    let ratio = result
        .compression_ratio
        .map(|r| format!("{:.2}x", r))
        .unwrap_or_else(|| "n/a".to_string());

    info!(
        key = %result.remote_key,
        collections = result.collection_count,
        original_bytes = result.original_size,
        original_size = %format_size(result.original_size),
        compressed_bytes = result.compressed_size,
        compressed_size = %format_size(result.compressed_size),
        compression_ratio = %ratio,
        dump_time = ?result.timings.dump,
        compress_time = ?result.timings.compress,
        upload_time = ?result.timings.upload,
        cleanup_time = ?result.timings.cleanup,
        total_time = ?result.timings.total,
        "Backup completed successfully"
    );
}
