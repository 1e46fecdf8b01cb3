// mongodumper/src/config/mod.rs
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use crate::errors::AppError;
use crate::utils::logging::LogFormat;

pub const DEFAULT_ENVIRONMENT: &str = "default";
pub const DEFAULT_DATABASE: &str = "all-databases";
pub const DEFAULT_REGION: &str = "us-east-1";
const TEMP_DIR_NAME: &str = "mongodb-dumps";
const KNOWN_ENVIRONMENTS: &[&str] = &["staging", "production"];

#[derive(Debug, Parser)]
#[command(name = "mongodumper")]
#[command(about = "Scheduled MongoDB backups to S3-compatible object storage")]
pub struct Cli {
    /// MongoDB connection string URI
    #[arg(long, env = "MONGO_URI", hide_env_values = true)]
    pub mongo_uri: Option<String>,

    /// MongoDB database name (all databases when omitted)
    #[arg(long, env = "MONGO_DATABASE")]
    pub database: Option<String>,

    /// Environment tag used in backup names (staging or production)
    #[arg(long = "env", env = "ENVIRONMENT")]
    pub environment: Option<String>,

    #[arg(long, env = "S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    #[arg(long, env = "S3_REGION")]
    pub s3_region: Option<String>,

    #[arg(long, env = "S3_BUCKET")]
    pub s3_bucket: Option<String>,

    #[arg(long, env = "S3_ACCESS_KEY", hide_env_values = true)]
    pub s3_access_key: Option<String>,

    #[arg(long, env = "S3_SECRET_KEY", hide_env_values = true)]
    pub s3_secret_key: Option<String>,

    /// Temporary directory for dumps and archives
    #[arg(long, env = "TEMP_DIR")]
    pub temp_dir: Option<PathBuf>,

    /// Backup interval such as 30m, 6h or 1h30m; 0 runs once
    #[arg(long, value_parser = parse_interval)]
    pub interval: Option<Duration>,

    /// Run a single backup and exit
    #[arg(long)]
    pub one_time: bool,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Path to a .env file loaded before the flags are read
    #[arg(long, default_value = ".env")]
    pub env_file: PathBuf,

    /// Optional JSON config file; flags and environment variables take precedence
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the backup pipeline (default)
    Backup,
    /// List stored backups
    List {
        /// Key prefix; defaults to "<environment>/"
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Download a stored backup for restoration
    Restore {
        /// Object key or s3://bucket/key URI
        source: String,
        /// Where to write the archive; defaults to the current directory
        #[arg(long)]
        output: Option<PathBuf>,
        /// Also unpack the archive next to the downloaded file
        #[arg(long)]
        extract: bool,
    },
}

// Structs for deserializing the optional JSON config file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub mongo_uri: Option<String>,
    pub database: Option<String>,
    pub environment: Option<String>,
    pub temp_dir: Option<PathBuf>,
    pub interval: Option<String>,
    pub s3_storage: Option<JsonS3StorageConfig>,
}

impl RawJsonConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        serde_json::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })
    }
}

/// Connection settings for the S3-compatible bucket.
#[derive(Clone)]
pub struct StorageConfig {
    pub endpoint_url: String,
    pub region: String,
    pub bucket_name: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("endpoint_url", &self.endpoint_url)
            .field("region", &self.region)
            .field("bucket_name", &self.bucket_name)
            .field("access_key_id", &redact_key(&self.access_key_id))
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

/// Immutable parameters of every backup run, resolved once at start-up.
#[derive(Clone)]
pub struct BackupJob {
    pub mongo_uri: String,
    pub database: Option<String>,
    pub environment: Option<String>,
    pub temp_dir: PathBuf,
    pub storage: StorageConfig,
    /// `None` means a single run.
    pub interval: Option<Duration>,
}

impl fmt::Debug for BackupJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupJob")
            .field("mongo_uri", &redact_uri(&self.mongo_uri))
            .field("database", &self.database)
            .field("environment", &self.environment)
            .field("temp_dir", &self.temp_dir)
            .field("storage", &self.storage)
            .field("interval", &self.interval)
            .finish()
    }
}

impl BackupJob {
    pub fn environment_or_default(&self) -> &str {
        self.environment.as_deref().unwrap_or(DEFAULT_ENVIRONMENT)
    }

    pub fn database_or_default(&self) -> &str {
        self.database.as_deref().unwrap_or(DEFAULT_DATABASE)
    }

    pub fn is_one_time(&self) -> bool {
        self.interval.is_none()
    }
}

/// Merges flags/environment with the optional JSON file and validates the result.
pub fn resolve_backup_job(cli: &Cli, file: &RawJsonConfig) -> std::result::Result<BackupJob, AppError> {
    let mongo_uri = non_empty(cli.mongo_uri.clone())
        .or_else(|| non_empty(file.mongo_uri.clone()))
        .ok_or_else(|| AppError::Config("MongoDB URI is required".to_string()))?;

    let storage = resolve_storage(cli, file)?;

    let environment = non_empty(cli.environment.clone()).or_else(|| non_empty(file.environment.clone()));
    if let Some(env) = environment.as_deref() {
        if !KNOWN_ENVIRONMENTS.contains(&env) {
            warn!(
                environment = env,
                "Environment should be 'staging' or 'production', using provided value anyway"
            );
        }
    }

    let interval = match (cli.interval, file.interval.as_deref()) {
        (Some(interval), _) => Some(interval),
        (None, Some(raw)) => Some(parse_interval(raw).map_err(AppError::Config)?),
        (None, None) => None,
    };
    let interval = if cli.one_time { None } else { interval.filter(|d| !d.is_zero()) };
    if interval.is_none() {
        info!("No interval specified, defaulting to one-time backup");
    }

    let temp_dir = cli
        .temp_dir
        .clone()
        .or_else(|| file.temp_dir.clone())
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| {
            let default_dir = std::env::temp_dir().join(TEMP_DIR_NAME);
            info!(temp_dir = %default_dir.display(), "No temporary directory specified, using default");
            default_dir
        });

    Ok(BackupJob {
        mongo_uri,
        database: non_empty(cli.database.clone()).or_else(|| non_empty(file.database.clone())),
        environment,
        temp_dir,
        storage,
        interval,
    })
}

/// Storage settings alone, for the list and restore commands.
pub fn resolve_storage(cli: &Cli, file: &RawJsonConfig) -> std::result::Result<StorageConfig, AppError> {
    let json = file.s3_storage.clone().unwrap_or_default();

    let endpoint_url = non_empty(cli.s3_endpoint.clone()).or_else(|| non_empty(json.endpoint_url));
    let bucket_name = non_empty(cli.s3_bucket.clone()).or_else(|| non_empty(json.bucket_name));
    let access_key_id = non_empty(cli.s3_access_key.clone()).or_else(|| non_empty(json.access_key_id));
    let secret_access_key =
        non_empty(cli.s3_secret_key.clone()).or_else(|| non_empty(json.secret_access_key));
    let region = non_empty(cli.s3_region.clone())
        .or_else(|| non_empty(json.region))
        .unwrap_or_else(|| DEFAULT_REGION.to_string());

    match (endpoint_url, bucket_name, access_key_id, secret_access_key) {
        (Some(endpoint_url), Some(bucket_name), Some(access_key_id), Some(secret_access_key)) => {
            Ok(StorageConfig {
                endpoint_url,
                region,
                bucket_name,
                access_key_id,
                secret_access_key,
            })
        }
        _ => Err(AppError::Config(
            "S3 configuration is incomplete (endpoint, bucket, access key and secret key are required)"
                .to_string(),
        )),
    }
}

/// Parses intervals written as `90`, `90s`, `30m`, `6h`, `1d` or combinations like `1h30m`.
pub fn parse_interval(raw: &str) -> std::result::Result<Duration, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("interval cannot be empty".to_string());
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in raw.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86_400,
            _ => return Err(format!("invalid interval '{}': unknown unit '{}'", raw, c)),
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid interval '{}': missing number before '{}'", raw, c))?;
        total = value
            .checked_mul(unit)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(|| format!("interval '{}' is too large", raw))?;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(format!("invalid interval '{}': trailing number without unit", raw));
    }
    Ok(Duration::from_secs(total))
}

/// Finds the `--env-file` value before clap runs, so the file can feed `env = ...` defaults.
pub fn env_file_from_args<I>(args: I) -> PathBuf
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--env-file" {
            if let Some(value) = args.next() {
                return PathBuf::from(value);
            }
        } else if let Some(value) = arg.strip_prefix("--env-file=") {
            return PathBuf::from(value);
        }
    }
    PathBuf::from(".env")
}

/// Hides credentials in a connection string before it is logged.
pub fn redact_uri(uri: &str) -> String {
    if uri.is_empty() {
        return String::new();
    }
    match Url::parse(uri) {
        Ok(mut parsed) if parsed.password().is_some() => {
            if parsed.set_password(Some("REDACTED")).is_ok() {
                parsed.to_string()
            } else {
                "[REDACTED_URI]".to_string()
            }
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "[REDACTED_URI]".to_string(),
    }
}

pub fn redact_key(key: &str) -> String {
    if key.is_empty() {
        return String::new();
    }
    match key.char_indices().nth(4) {
        Some((idx, _)) => format!("{}...[REDACTED]", &key[..idx]),
        None => "[REDACTED]".to_string(),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}
