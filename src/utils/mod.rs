pub mod logging;
pub mod progress;

use std::path::PathBuf;
use which::which;

use crate::errors::{AppError, Result};

/// Finds an external tool in the system PATH.
pub fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).map_err(|_| AppError::DumpToolMissing {
        tool: name.to_string(),
    })
}
