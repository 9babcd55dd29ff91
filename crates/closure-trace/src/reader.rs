//! Offline reading and forensic verification of a trace.
//!
//! The chain is tamper-evident, not tamper-proof: anyone with write access to
//! the file can rewrite it wholesale and recompute every hash. What the chain
//! guarantees is that a partial edit, deletion or reordering is detected and
//! localized to a sequence number.

use crate::error::{ChainIntegrityError, TraceError};
use crate::record::TraceRecord;
use closure_core::binding::GENESIS_HASH;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone)]
pub enum TraceLine {
    Record {
        line_no: usize,
        /// The stored text, when the record came from a file.
        raw: Option<String>,
        record: TraceRecord,
    },
    Unparseable {
        line_no: usize,
        raw: String,
        error: String,
    },
}

/// Splits a `trace.jsonl` body into lines. Never fails: a line that does not
/// parse is kept as [`TraceLine::Unparseable`] for the verifier to report.
pub fn parse_trace(text: &str) -> Vec<TraceLine> {
    let body = text.strip_suffix('\n').unwrap_or(text);
    if body.is_empty() {
        return Vec::new();
    }
    body.split('\n')
        .enumerate()
        .map(|(i, raw)| match serde_json::from_str::<TraceRecord>(raw) {
            Ok(record) => TraceLine::Record {
                line_no: i + 1,
                raw: Some(raw.to_string()),
                record,
            },
            Err(e) => TraceLine::Unparseable {
                line_no: i + 1,
                raw: raw.to_string(),
                error: e.to_string(),
            },
        })
        .collect()
}

pub fn read_trace(path: &Path) -> Result<Vec<TraceLine>, TraceError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| TraceError::io(format!("read {}", path.display()), e))?;
    Ok(parse_trace(&text))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChainIssueKind {
    SequenceGap { expected: u64, found: u64 },
    BrokenLink { expected_prev: String, found_prev: String },
    HashMismatch { stored: String, recomputed: String },
    /// Parses to the same record but is not the text the writer produces.
    NonCanonical,
    Unparseable { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainIssue {
    pub seq: u64,
    pub line: usize,
    pub kind: ChainIssueKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub records: usize,
    pub last_hash: Option<String>,
    pub issues: Vec<ChainIssue>,
}

impl ChainVerification {
    pub fn into_result(self) -> Result<Self, ChainIntegrityError> {
        if self.valid {
            Ok(self)
        } else {
            Err(ChainIntegrityError {
                issues: self.issues,
            })
        }
    }
}

/// Walks the lines and reports every issue, each attributed to a sequence
/// number.
///
/// A record whose own hash checks out is trusted for its `seq`; a tampered
/// record is attributed to the position it occupies in the sequence.
pub fn verify_lines(lines: &[TraceLine]) -> ChainVerification {
    let mut issues = Vec::new();
    let mut expected: u64 = 1;
    let mut prev: Option<String> = Some(GENESIS_HASH.to_string());
    let mut last_hash = None;
    let mut records = 0;

    for line in lines {
        match line {
            TraceLine::Unparseable { line_no, error, .. } => {
                issues.push(ChainIssue {
                    seq: expected,
                    line: *line_no,
                    kind: ChainIssueKind::Unparseable {
                        error: error.clone(),
                    },
                });
                prev = None;
                last_hash = None;
                expected += 1;
            }
            TraceLine::Record {
                line_no,
                raw,
                record,
            } => {
                records += 1;
                let recomputed = record.recompute_hash();
                let consistent =
                    matches!(&recomputed, Ok(hash) if *hash == record.record_hash);
                let at = if consistent { record.seq } else { expected };
                let mut push = |seq: u64, kind: ChainIssueKind| {
                    issues.push(ChainIssue {
                        seq,
                        line: *line_no,
                        kind,
                    })
                };

                if record.seq != expected {
                    push(
                        expected,
                        ChainIssueKind::SequenceGap {
                            expected,
                            found: record.seq,
                        },
                    );
                }
                if let Some(p) = &prev {
                    if *p != record.prev_hash {
                        push(
                            at,
                            ChainIssueKind::BrokenLink {
                                expected_prev: p.clone(),
                                found_prev: record.prev_hash.clone(),
                            },
                        );
                    }
                }
                match recomputed {
                    Ok(hash) if hash != record.record_hash => push(
                        at,
                        ChainIssueKind::HashMismatch {
                            stored: record.record_hash.clone(),
                            recomputed: hash,
                        },
                    ),
                    Ok(_) => {}
                    Err(e) => push(
                        at,
                        ChainIssueKind::Unparseable {
                            error: e.to_string(),
                        },
                    ),
                }
                if let Some(raw) = raw {
                    let canonical = record.to_line().ok();
                    if canonical.as_deref() != Some(raw.as_str()) {
                        push(at, ChainIssueKind::NonCanonical);
                    }
                }

                prev = Some(record.record_hash.clone());
                last_hash = Some(record.record_hash.clone());
                expected = if consistent { record.seq + 1 } else { expected + 1 };
            }
        }
    }

    for issue in &issues {
        warn!("[TRACE] chain issue at seq {}: {:?}", issue.seq, issue.kind);
    }
    ChainVerification {
        valid: issues.is_empty(),
        records,
        last_hash,
        issues,
    }
}

/// Verifies records already in memory.
pub fn verify_chain(records: &[TraceRecord]) -> ChainVerification {
    let lines: Vec<TraceLine> = records
        .iter()
        .enumerate()
        .map(|(i, record)| TraceLine::Record {
            line_no: i + 1,
            raw: None,
            record: record.clone(),
        })
        .collect();
    verify_lines(&lines)
}

pub fn verify_file(path: &Path) -> Result<ChainVerification, TraceError> {
    Ok(verify_lines(&read_trace(path)?))
}
