//! Worker runtime files.
//!
//! The worker's application files are installed read-only next to the
//! daemon. On startup they are copied into a writable runtime directory,
//! replacing whatever an earlier run left there.
//!
//! # Async Safety
//!
//! Filesystem work runs via `spawn_blocking`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while preparing the worker's runtime files.
///
/// These are fatal: the daemon cannot launch a worker without them.
#[derive(Debug, Error)]
pub enum AssetError {
    /// The installed asset directory does not exist.
    #[error("asset directory not found: {0}")]
    MissingSource(PathBuf),

    /// Copying failed.
    #[error("failed to copy {path}: {source}")]
    Copy {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The blocking copy task did not complete.
    #[error("asset task failed: {0}")]
    Task(String),
}

/// Replaces `dest` with a fresh copy of `source`.
///
/// Returns the number of files copied.
pub fn unpack(source: &Path, dest: &Path) -> Result<usize, AssetError> {
    if !source.is_dir() {
        return Err(AssetError::MissingSource(source.to_path_buf()));
    }

    if dest.exists() {
        debug!(path = %dest.display(), "Removing previous runtime files");
        fs::remove_dir_all(dest).map_err(|source| copy_error(dest, source))?;
    }

    let copied = copy_tree(source, dest)?;
    info!(
        from = %source.display(),
        to = %dest.display(),
        files = copied,
        "Worker files unpacked"
    );
    Ok(copied)
}

/// Async wrapper around [`unpack`].
pub async fn unpack_async(source: PathBuf, dest: PathBuf) -> Result<usize, AssetError> {
    tokio::task::spawn_blocking(move || unpack(&source, &dest))
        .await
        .map_err(|e| AssetError::Task(e.to_string()))?
}

fn copy_tree(source: &Path, dest: &Path) -> Result<usize, AssetError> {
    fs::create_dir_all(dest).map_err(|e| copy_error(dest, e))?;

    let mut copied = 0;
    let entries = fs::read_dir(source).map_err(|e| copy_error(source, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| copy_error(source, e))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| copy_error(&from, e))?;

        if file_type.is_dir() {
            copied += copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(|e| copy_error(&from, e))?;
            copied += 1;
        }
    }

    Ok(copied)
}

fn copy_error(path: &Path, source: io::Error) -> AssetError {
    AssetError::Copy {
        path: path.to_path_buf(),
        source,
    }
}
