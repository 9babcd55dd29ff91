use crate::error::TraceError;
use crate::reader::{parse_trace, TraceLine};
use crate::record::{compute_record_hash, format_timestamp, EventType, TraceRecord};
use chrono::{DateTime, Utc};
use closure_core::binding::{canonicalize, BoundHashes, GENESIS_HASH};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

/// Durable line sink behind the writer. `append_line` returns only once the
/// line is durable, or fails leaving the sink as it was.
pub trait TraceStore: Send {
    fn append_line(&mut self, line: &str) -> Result<(), TraceError>;
    fn describe(&self) -> String;
}

#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    file: File,
}

impl FileStore {
    pub fn open(path: &Path) -> Result<Self, TraceError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| TraceError::io(format!("open {}", path.display()), e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TraceStore for FileStore {
    fn append_line(&mut self, line: &str) -> Result<(), TraceError> {
        let before = self
            .file
            .metadata()
            .map_err(|e| TraceError::io("stat trace file", e))?
            .len();

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');

        let written = self
            .file
            .write_all(&buf)
            .and_then(|_| self.file.sync_data());
        if let Err(e) = written {
            // Drop any partial line so the file still ends on a record boundary.
            if let Err(trunc) = self.file.set_len(before) {
                error!(
                    "[TRACE] could not truncate {} after failed append: {}",
                    self.path.display(),
                    trunc
                );
            }
            return Err(TraceError::io("append trace record", e));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory store. Clones share the same lines, so a test can keep a handle
/// while the writer owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    lines: Arc<Mutex<Vec<String>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every append fails with an I/O error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl TraceStore for MemoryStore {
    fn append_line(&mut self, line: &str) -> Result<(), TraceError> {
        let refuse = |why: &str| {
            TraceError::io(
                "append trace record",
                std::io::Error::new(std::io::ErrorKind::Other, why.to_string()),
            )
        };
        if self.failing.load(Ordering::SeqCst) {
            return Err(refuse("store marked failing"));
        }
        let mut lines = self
            .lines
            .lock()
            .map_err(|_| refuse("memory store lock poisoned"))?;
        lines.push(line.to_string());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}

/// Append-only, hash-chained writer. Sequence and chain head advance only
/// after the store confirms the append.
pub struct TraceWriter {
    store: Box<dyn TraceStore>,
    next_seq: u64,
    last_hash: String,
}

impl TraceWriter {
    pub fn new(store: Box<dyn TraceStore>) -> Self {
        Self {
            store,
            next_seq: 1,
            last_hash: GENESIS_HASH.to_string(),
        }
    }

    /// Opens `path` for appending, resuming from its last record if the file
    /// already holds a trace.
    pub fn open_file(path: &Path) -> Result<Self, TraceError> {
        let existing = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(TraceError::io(format!("read {}", path.display()), e)),
        };

        let mut last: Option<TraceRecord> = None;
        for line in parse_trace(&existing) {
            match line {
                TraceLine::Record { record, .. } => last = Some(record),
                TraceLine::Unparseable { line_no, error, .. } => {
                    return Err(TraceError::Corrupt {
                        line: line_no,
                        detail: error,
                    })
                }
            }
        }

        let store = Box::new(FileStore::open(path)?);
        let mut writer = Self::new(store);
        if let Some(tail) = last {
            let recomputed = tail.recompute_hash()?;
            if recomputed != tail.record_hash {
                return Err(TraceError::Corrupt {
                    line: 0,
                    detail: format!("tail record seq {} fails its own hash", tail.seq),
                });
            }
            info!(
                "[TRACE] resuming {} after seq {}",
                path.display(),
                tail.seq
            );
            writer.next_seq = tail.seq + 1;
            writer.last_hash = tail.record_hash;
        }
        Ok(writer)
    }

    pub fn append(
        &mut self,
        at: DateTime<Utc>,
        event_type: EventType,
        payload: Value,
        hashes: Option<&BoundHashes>,
    ) -> Result<TraceRecord, TraceError> {
        let seq = self.next_seq;
        let timestamp = format_timestamp(at);
        let payload = canonicalize(&payload);
        let config_hash = hashes.map(|h| h.config_hash.clone());
        let cal_hash = hashes.map(|h| h.cal_hash.clone());

        let record_hash = compute_record_hash(
            &self.last_hash,
            seq,
            &timestamp,
            event_type,
            &payload,
            config_hash.as_deref(),
            cal_hash.as_deref(),
        )?;
        let record = TraceRecord {
            seq,
            timestamp,
            event_type,
            payload,
            prev_hash: self.last_hash.clone(),
            record_hash,
            config_hash,
            cal_hash,
        };

        let line = record.to_line()?;
        self.store.append_line(&line)?;

        self.next_seq += 1;
        self.last_hash = record.record_hash.clone();
        debug!("[TRACE] appended seq {} ({})", record.seq, record.event_type);
        Ok(record)
    }

    pub fn last_hash(&self) -> &str {
        &self.last_hash
    }

    pub fn record_count(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn describe(&self) -> String {
        self.store.describe()
    }
}
