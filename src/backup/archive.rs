// mongodumper/src/backup/archive.rs
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive};

use crate::errors::{AppError, Result};
use crate::utils::progress::format_size;

const COPY_BUFFER_SIZE: usize = 32 * 1024;
/// Entries at least this large are written with ZIP64 headers.
const LARGE_FILE_THRESHOLD: u64 = u32::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveStats {
    pub file_count: usize,
    pub original_size: u64,
    pub compressed_size: u64,
    pub duration: Duration,
}

impl ArchiveStats {
    pub fn compression_ratio(&self) -> Option<f64> {
        compression_ratio(self.original_size, self.compressed_size)
    }
}

/// `original / compressed`; undefined when nothing was written.
pub fn compression_ratio(original: u64, compressed: u64) -> Option<f64> {
    if compressed == 0 {
        return None;
    }
    Some(original as f64 / compressed as f64)
}

/// Compresses every regular file under `source_dir` into a Deflate zip at `target`.
///
/// Entry names are relative to `source_dir` and always use `/`. The blocking work
/// runs on tokio's blocking pool and checks `cancel` before every copied chunk.
pub async fn compress_dir(
    source_dir: &Path,
    target: &Path,
    original_size: u64,
    cancel: &CancellationToken,
) -> Result<ArchiveStats> {
    info!(
        source = %source_dir.display(),
        target = %target.display(),
        "Starting compression"
    );

    let source = source_dir.to_path_buf();
    let dest = target.to_path_buf();
    let token = cancel.clone();
    let started = Instant::now();

    let file_count = tokio::task::spawn_blocking(move || write_zip(&source, &dest, &token))
        .await
        .map_err(|e| AppError::Archive {
            path: target.to_path_buf(),
            source: io::Error::other(e),
        })??;

    let compressed_size = tokio::fs::metadata(target)
        .await
        .map_err(|e| AppError::Archive {
            path: target.to_path_buf(),
            source: e,
        })?
        .len();

    let stats = ArchiveStats {
        file_count,
        original_size,
        compressed_size,
        duration: started.elapsed(),
    };

    match stats.compression_ratio() {
        Some(ratio) => info!(
            archive = %target.display(),
            file_count,
            original_size = %format_size(original_size),
            compressed_size = %format_size(compressed_size),
            compression_ratio = %format!("{:.2}x", ratio),
            duration = ?stats.duration,
            "Compression completed"
        ),
        None => info!(
            archive = %target.display(),
            file_count,
            compressed_size = %format_size(compressed_size),
            duration = ?stats.duration,
            "Compression completed"
        ),
    }

    Ok(stats)
}

fn write_zip(source_dir: &Path, target: &Path, cancel: &CancellationToken) -> Result<usize> {
    let archive_err = |source: io::Error| AppError::Archive {
        path: target.to_path_buf(),
        source,
    };

    if !source_dir.is_dir() {
        return Err(archive_err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("source for archival is not a directory: {}", source_dir.display()),
        )));
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(archive_err)?;
    }

    let file = File::create(target).map_err(archive_err)?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut file_count = 0usize;

    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        if cancel.is_cancelled() {
            return Err(interrupted(source_dir));
        }

        let entry = entry.map_err(|e| archive_err(io::Error::other(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let name = entry_name(source_dir, path).map_err(archive_err)?;
        let size = entry.metadata().map_err(|e| archive_err(io::Error::other(e)))?.len();

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(size >= LARGE_FILE_THRESHOLD);

        zip.start_file(name.as_str(), options)
            .map_err(|e| archive_err(io::Error::other(e)))?;

        let mut input = File::open(path).map_err(|e| {
            archive_err(io::Error::new(
                e.kind(),
                format!("failed to open {}: {}", path.display(), e),
            ))
        })?;
        match copy_with_buffer(&mut input, &mut zip, &mut buffer, cancel) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted && cancel.is_cancelled() => {
                return Err(interrupted(source_dir));
            }
            Err(e) => return Err(archive_err(e)),
        }

        debug!(entry = %name, size, "Added file to archive");
        file_count += 1;
    }

    if cancel.is_cancelled() {
        return Err(interrupted(source_dir));
    }
    let mut writer = zip.finish().map_err(|e| archive_err(io::Error::other(e)))?;
    writer.flush().map_err(archive_err)?;

    Ok(file_count)
}

fn interrupted(source_dir: &Path) -> AppError {
    AppError::Cancelled(format!("compression of {} was interrupted", source_dir.display()))
}

fn entry_name(root: &Path, path: &Path) -> io::Result<String> {
    let relative = path.strip_prefix(root).map_err(|e| {
        io::Error::other(format!(
            "failed to strip prefix {} from {}: {}",
            root.display(),
            path.display(),
            e
        ))
    })?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Copies `reader` into `writer`, checking `cancel` before every chunk.
///
/// A cancelled token surfaces as `ErrorKind::Interrupted`; transient EINTR reads are retried.
fn copy_with_buffer<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    buffer: &mut [u8],
    cancel: &CancellationToken,
) -> io::Result<u64> {
    let mut copied = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "copy cancelled"));
        }
        let n = match reader.read(buffer) {
            Ok(0) => return Ok(copied),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buffer[..n])?;
        copied += n as u64;
    }
}

/// Extracts a zip produced by [`compress_dir`] into `extract_to_dir`.
///
/// Entries whose names would escape the destination are rejected.
pub fn extract_zip_archive(archive_path: &Path, extract_to_dir: &Path) -> Result<PathBuf> {
    let archive_err = |source: io::Error| AppError::Archive {
        path: archive_path.to_path_buf(),
        source,
    };

    if !archive_path.is_file() {
        return Err(archive_err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("archive for extraction is not a file: {}", archive_path.display()),
        )));
    }
    if extract_to_dir.exists() && !extract_to_dir.is_dir() {
        return Err(archive_err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "extraction path exists but is not a directory: {}",
                extract_to_dir.display()
            ),
        )));
    }
    std::fs::create_dir_all(extract_to_dir).map_err(archive_err)?;

    info!(
        archive = %archive_path.display(),
        destination = %extract_to_dir.display(),
        "Extracting zip archive"
    );

    let file = File::open(archive_path).map_err(archive_err)?;
    let mut archive = ZipArchive::new(file).map_err(|e| archive_err(io::Error::other(e)))?;
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    // Extraction runs to completion; restore cancels around it.
    let never = CancellationToken::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| archive_err(io::Error::other(e)))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(archive_err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsafe entry name in archive: {}", entry.name()),
            )));
        };
        let out_path = extract_to_dir.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(archive_err)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(archive_err)?;
        }
        let mut output = File::create(&out_path).map_err(archive_err)?;
        copy_with_buffer(&mut entry, &mut output, &mut buffer, &never).map_err(archive_err)?;
    }

    info!(destination = %extract_to_dir.display(), "Zip archive extracted successfully");
    Ok(extract_to_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn zip_entry_names(path: &Path) -> anyhow::Result<Vec<String>> {
        let mut archive = ZipArchive::new(File::open(path)?)?;
        let mut names = Vec::new();
        for i in 0..archive.len() {
            names.push(archive.by_index(i)?.name().to_string());
        }
        Ok(names)
    }

    #[tokio::test]
    async fn test_compress_dir_keeps_relative_names() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let source = temp.path().join("dump");
        fs::create_dir_all(source.join("a"))?;
        fs::write(source.join("a").join("x.bson"), vec![0u8; 10 * 1024])?;
        fs::write(source.join("a").join("y.bson"), vec![0u8; 20 * 1024])?;
        let target = temp.path().join("dump.zip");

        let stats = compress_dir(&source, &target, 30 * 1024, &CancellationToken::new()).await?;

        assert!(target.exists());
        assert_eq!(stats.file_count, 2);
        assert!(stats.compressed_size > 0);
        assert!(stats.compression_ratio().is_some());
        assert_eq!(zip_entry_names(&target)?, vec!["a/x.bson", "a/y.bson"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_compress_then_extract() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let source = temp.path().join("dump");
        fs::create_dir_all(source.join("shop"))?;
        fs::write(source.join("shop").join("orders.bson"), b"order documents")?;
        fs::write(source.join("shop").join("orders.metadata.json"), b"{\"indexes\":[]}")?;
        let target = temp.path().join("dump.zip");
        compress_dir(&source, &target, 0, &CancellationToken::new()).await?;

        let restored = temp.path().join("restored");
        extract_zip_archive(&target, &restored)?;

        assert_eq!(fs::read(restored.join("shop").join("orders.bson"))?, b"order documents");
        assert_eq!(
            fs::read_to_string(restored.join("shop").join("orders.metadata.json"))?,
            "{\"indexes\":[]}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_compress_missing_source_fails() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let err = compress_dir(
            &temp.path().join("missing"),
            &temp.path().join("out.zip"),
            0,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Archive { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_compress_respects_cancellation() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let source = temp.path().join("dump");
        fs::create_dir_all(&source)?;
        fs::write(source.join("x.bson"), b"data")?;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = compress_dir(&source, &temp.path().join("out.zip"), 4, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        Ok(())
    }

    #[tokio::test]
    async fn test_compress_cancelled_inside_large_file() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let source = temp.path().join("dump");
        fs::create_dir_all(&source)?;
        // Pseudo-random bytes so Deflate has real work to do.
        let mut out = BufWriter::new(File::create(source.join("big.bson"))?);
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let mut chunk = vec![0u8; 1024 * 1024];
        for _ in 0..192 {
            for word in chunk.chunks_mut(8) {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                word.copy_from_slice(&state.to_le_bytes());
            }
            out.write_all(&chunk)?;
        }
        out.flush()?;
        drop(out);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = compress_dir(&source, &temp.path().join("out.zip"), 192 * 1024 * 1024, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn test_copy_with_buffer_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut input: &[u8] = b"documents";
        let mut output = Vec::new();
        let err = copy_with_buffer(&mut input, &mut output, &mut [0u8; 4], &cancel).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert!(output.is_empty());
    }

    #[test]
    fn test_compression_ratio() {
        assert_eq!(compression_ratio(10, 0), None);
        assert_eq!(compression_ratio(200, 50), Some(4.0));
        assert_eq!(compression_ratio(0, 22), Some(0.0));
    }
}
