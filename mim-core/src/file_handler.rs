//! JSON sidecar file access
//!
//! Stateless helpers over the filesystem: whole-file JSON reads and
//! atomic whole-file writes, existence checks, a lazy non-recursive
//! directory listing and image format detection from file names.
//!
//! Writes never truncate the destination in place. Content goes to a
//! `<name>.tmp` sibling first, is flushed and synced, then renamed over
//! the target.

use crate::{Error, Result};
use serde_json::Value;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Compound extensions must come before their single-extension suffixes
const FORMAT_EXTENSIONS: &[(&str, &str)] = &[
    (".nii.gz", "NIfTI"),
    (".nii", "NIfTI"),
    (".dcm", "DICOM"),
    (".dicom", "DICOM"),
    (".img", "ANALYZE"),
    (".hdr", "ANALYZE"),
    (".png", "PNG"),
    (".jpg", "JPEG"),
    (".jpeg", "JPEG"),
    (".tiff", "TIFF"),
    (".tif", "TIFF"),
];

/// Format name returned when no extension matches
pub const UNKNOWN_FORMAT: &str = "Unknown";

/// Read and parse a JSON file.
///
/// # Errors
///
/// * [`Error::NotFound`] if `path` does not exist
/// * [`Error::Parse`] if the content is not valid JSON
/// * [`Error::Io`] for any other read failure
pub fn read_json(path: &Path) -> Result<Value> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let value = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
        if e.is_io() {
            Error::Io {
                path: path.to_path_buf(),
                source: e.into(),
            }
        } else {
            Error::Parse {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })?;

    tracing::debug!("Read JSON from {}", path.display());
    Ok(value)
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json(path: &Path, value: &Value) -> Result<()> {
    write_atomic(path, |writer| {
        serde_json::to_writer_pretty(&mut *writer, value).map_err(std::io::Error::from)?;
        writer.write_all(b"\n")
    })?;

    tracing::debug!("Wrote JSON to {}", path.display());
    Ok(())
}

/// Temp-file + rename write shared by JSON records and TOML config.
///
/// The temp file handle is scoped to this call: it is flushed, synced and
/// closed before the rename, and dropped (closed) on every error path.
/// A leftover temp file is removed when any step fails, so the
/// destination is either the old content or the complete new content.
pub fn write_atomic<F>(path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
{
    let temp_path = temp_path_for(path);

    let outcome = (|| -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        fill(&mut writer)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, path)
    })();

    if let Err(e) = outcome {
        if temp_path.exists() {
            if let Err(cleanup) = fs::remove_file(&temp_path) {
                tracing::warn!(
                    "Failed to remove temp file {}: {}",
                    temp_path.display(),
                    cleanup
                );
            }
        }
        return Err(Error::Io {
            path: path.to_path_buf(),
            source: e,
        });
    }

    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Whether `path` exists on disk
pub fn exists(path: &Path) -> bool {
    path.exists()
}

/// Delete a file.
///
/// Returns [`Error::NotFound`] when the file is already gone.
pub fn remove_file(path: &Path) -> Result<()> {
    fs::remove_file(path).map_err(|e| Error::io(path, e))?;
    tracing::debug!("Removed {}", path.display());
    Ok(())
}

/// List regular files directly inside `dir` whose name ends with `suffix`.
///
/// The listing is lazy and non-recursive. Entries come back in the order
/// the filesystem reports them; callers needing determinism must sort.
/// Unreadable entries are logged and skipped.
pub fn list_files<'a>(dir: &Path, suffix: &'a str) -> Result<impl Iterator<Item = PathBuf> + 'a> {
    if !dir.exists() {
        return Err(Error::NotFound(dir.display().to_string()));
    }
    if !dir.is_dir() {
        return Err(Error::Io {
            path: dir.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "not a directory"),
        });
    }

    let entries = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Error accessing entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(move |entry| entry.file_name().to_string_lossy().ends_with(suffix))
        .map(|entry| entry.into_path());

    Ok(entries)
}

/// Detect the image format of a file from its name.
///
/// Matching is case-insensitive; `.nii.gz` wins over `.gz`-less NIfTI.
pub fn detect_format(path: &str) -> &'static str {
    let lower = path.to_lowercase();
    FORMAT_EXTENSIONS
        .iter()
        .find(|(ext, _)| lower.ends_with(ext))
        .map(|(_, format)| *format)
        .unwrap_or(UNKNOWN_FORMAT)
}
