// mongodumper/src/errors.rs
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{tool} executable not found in PATH. Please install the MongoDB Database Tools.")]
    DumpToolMissing { tool: String },

    #[error("Dump stage failed: {0}")]
    Dump(String),

    #[error("Archive stage failed for {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Upload stage failed for key {key}: {message}")]
    Upload { key: String, message: String },

    #[error("Download failed for key {key}: {message}")]
    Download { key: String, message: String },

    #[error("Listing objects under prefix '{prefix}' failed: {message}")]
    List { prefix: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl AppError {
    /// True when the error came from the cancellation token rather than a stage failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled(_))
    }

    /// Configuration-class errors are permanent and never worth retrying.
    pub fn is_config(&self) -> bool {
        matches!(self, AppError::Config(_) | AppError::DumpToolMissing { .. })
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(AppError::Cancelled("dump".into()).is_cancelled());
        assert!(!AppError::Dump("exit status 1".into()).is_cancelled());
        assert!(AppError::DumpToolMissing { tool: "mongodump".into() }.is_config());
        assert!(AppError::Config("MongoDB URI is required".into()).is_config());
        assert!(!AppError::Upload { key: "k".into(), message: "denied".into() }.is_config());
    }

    #[test]
    fn test_archive_error_names_path() {
        let err = AppError::Archive {
            path: PathBuf::from("/tmp/dump.zip"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let message = err.to_string();
        assert!(message.contains("/tmp/dump.zip"));
        assert!(message.contains("denied"));
    }
}
