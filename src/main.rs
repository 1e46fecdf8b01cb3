//! Scheduled MongoDB backups
//!
//! Dumps a MongoDB deployment with `mongodump`, zips the dump, uploads it to an
//! S3-compatible bucket and removes the local files, once or on an interval.

// mongodumper/src/main.rs
mod backup;
mod config;
mod errors;
mod restore;
mod utils;

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use backup::{BackupArtifact, BackupPipeline, MongoDumper, S3Storage, run_scheduler};
use config::{
    Cli, Command, DEFAULT_ENVIRONMENT, RawJsonConfig, env_file_from_args, redact_key, redact_uri,
    resolve_backup_job, resolve_storage,
};
use utils::progress::format_size;

#[tokio::main]
async fn main() -> ExitCode {
    // The .env file has to be loaded before clap reads `env = ...` fallbacks.
    let env_file = env_file_from_args(std::env::args());
    let env_loaded = dotenv::from_path(&env_file);

    let cli = Cli::parse();
    utils::logging::init(cli.log_format);

    match env_loaded {
        Ok(()) => info!(path = %env_file.display(), "Loaded environment file"),
        Err(e) => info!(path = %env_file.display(), reason = %e, "No environment file loaded"),
    }

    match run_app(cli).await {
        Ok(()) => {
            info!("Operation completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            if e.downcast_ref::<errors::AppError>().is_some_and(errors::AppError::is_config) {
                error!("Invalid configuration, check the flags, environment variables and config file");
            }
            error!(error = %format!("{:#}", e), "Fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    let file_config = match &cli.config {
        Some(path) => RawJsonConfig::load_from_json(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => RawJsonConfig::default(),
    };

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    match cli.command.clone().unwrap_or(Command::Backup) {
        Command::Backup => run_backup(&cli, &file_config, &cancel).await,
        Command::List { prefix } => run_list(&cli, &file_config, prefix, &cancel).await,
        Command::Restore {
            source,
            output,
            extract,
        } => {
            let storage = resolve_storage(&cli, &file_config)?;
            let storage = S3Storage::connect(&storage).await;
            let restored = restore::run_restore(&storage, &source, output.as_deref(), extract, &cancel)
                .await
                .context("Restore failed")?;
            println!("{}", restored.display());
            Ok(())
        }
    }
}

async fn run_backup(cli: &Cli, file_config: &RawJsonConfig, cancel: &CancellationToken) -> Result<()> {
    let job = Arc::new(resolve_backup_job(cli, file_config)?);

    info!(
        mongo_uri = %redact_uri(&job.mongo_uri),
        database = job.database.as_deref().unwrap_or("(all)"),
        environment = job.environment_or_default(),
        temp_dir = %job.temp_dir.display(),
        s3_endpoint = %job.storage.endpoint_url,
        s3_region = %job.storage.region,
        s3_bucket = %job.storage.bucket_name,
        s3_access_key = %redact_key(&job.storage.access_key_id),
        interval = ?job.interval,
        one_time = job.is_one_time(),
        "Starting MongoDB backup service"
    );

    tokio::fs::create_dir_all(&job.temp_dir)
        .await
        .with_context(|| format!("Failed to create temp directory {}", job.temp_dir.display()))?;

    let dumper = MongoDumper::new(job.mongo_uri.clone(), job.database.clone())?;
    let storage = S3Storage::connect(&job.storage).await;
    let pipeline = BackupPipeline::new(Arc::clone(&job), dumper, storage);

    run_scheduler(&pipeline, pipeline.job().interval, cancel)
        .await
        .context("Backup failed")?;
    Ok(())
}

async fn run_list(
    cli: &Cli,
    file_config: &RawJsonConfig,
    prefix: Option<String>,
    cancel: &CancellationToken,
) -> Result<()> {
    let storage = resolve_storage(cli, file_config)?;
    let storage = S3Storage::connect(&storage).await;

    let prefix = prefix.unwrap_or_else(|| {
        let environment = cli
            .environment
            .clone()
            .or_else(|| file_config.environment.clone())
            .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string());
        format!("{}/", environment)
    });

    let objects = storage
        .list_backups(&prefix, cancel)
        .await
        .context("Listing backups failed")?;
    if objects.is_empty() {
        info!(prefix = %prefix, bucket = storage.bucket(), "No backups found");
        return Ok(());
    }

    for object in &objects {
        let database = BackupArtifact::parse_remote_key(&object.key)
            .map(|parts| parts.database)
            .unwrap_or_else(|| "-".to_string());
        let modified = object
            .last_modified
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!("{}\t{}\t{}\t{}", object.key, database, format_size(object.size), modified);
    }
    info!(prefix = %prefix, count = objects.len(), "Listed backups");
    Ok(())
}

/// Cancels `cancel` on the first SIGINT/SIGTERM; a second interrupt exits immediately.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Shutdown signal received, press Ctrl+C again to force exit"),
        _ = terminate => info!("Termination signal received"),
    }
    cancel.cancel();

    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("Force exiting");
        std::process::exit(130);
    }
}
