//! Atomic file replacement: temp file in the same directory, fsync, rename,
//! fsync the parent. A reader sees either the old complete file or the new
//! complete file, never a partial write.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum FsAtomicError {
    #[error("json serialization failed: {0}")]
    SerializeFailed(#[source] serde_json::Error),

    #[error("I/O error during {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl FsAtomicError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Writes `data` to `path` atomically.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), FsAtomicError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    if !parent.exists() {
        std::fs::create_dir_all(parent)
            .map_err(|e| FsAtomicError::io(format!("create {}", parent.display()), e))?;
    }

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| FsAtomicError::io("create temp file", e))?;
    tmp.write_all(data)
        .map_err(|e| FsAtomicError::io("write to temp file", e))?;
    tmp.flush()
        .map_err(|e| FsAtomicError::io("flush temp file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| FsAtomicError::io("fsync temp file", e))?;
    tmp.persist(path)
        .map_err(|e| FsAtomicError::io(format!("rename to {}", path.display()), e.error))?;

    fsync_directory(parent)
}

/// Pretty-prints `value` as JSON in memory, then writes it with [`atomic_write`].
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), FsAtomicError> {
    let json = serde_json::to_vec_pretty(value).map_err(FsAtomicError::SerializeFailed)?;
    atomic_write(path, &json)
}

#[cfg(unix)]
fn fsync_directory(dir: &Path) -> Result<(), FsAtomicError> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| FsAtomicError::io(format!("fsync directory {}", dir.display()), e))
}

// Directory handles cannot be synced on this platform; the rename is
// already durable once persist returns.
#[cfg(not(unix))]
fn fsync_directory(_dir: &Path) -> Result<(), FsAtomicError> {
    Ok(())
}
