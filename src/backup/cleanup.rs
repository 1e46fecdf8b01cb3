// mongodumper/src/backup/cleanup.rs
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Removes local run artifacts. Failures are logged and never returned.
pub async fn cleanup(paths: &[PathBuf]) {
    for path in paths {
        remove_path(path).await;
    }
}

async fn remove_path(path: &Path) {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "Nothing to clean up");
            return;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to inspect path for cleanup");
            return;
        }
    };

    let removed = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match removed {
        Ok(()) => info!(path = %path.display(), "Removed local artifact"),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "Artifact disappeared before cleanup");
        }
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove local artifact"),
    }
}

/// Blocking variant for drop paths where no runtime can be awaited.
pub fn cleanup_blocking(paths: &[PathBuf]) {
    for path in paths {
        let removed = match std::fs::symlink_metadata(path) {
            Ok(metadata) if metadata.is_dir() => std::fs::remove_dir_all(path),
            Ok(_) => std::fs::remove_file(path),
            Err(e) => Err(e),
        };
        match removed {
            Ok(()) => debug!(path = %path.display(), "Removed leftover artifact"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove leftover artifact"),
        }
    }
}
