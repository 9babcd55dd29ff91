//! Session bundle: the per-session directory that lets a third party replay
//! and verify what the device did.
//!
//! Every file is written atomically and the manifest last, so a manifest on
//! disk always describes a complete bundle.

use crate::error::BundleError;
use chrono::{DateTime, Utc};
use closure_core::binding::hash_canonical;
use closure_core::fs_atomic::atomic_write_json;
use closure_core::{Calibration, DeviceConfig, FaultCause, FsmState, HealthSnapshot, GENESIS_HASH};
use closure_trace::{root_hash, verify_file, ChainVerification};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

pub const BUNDLE_FORMAT_VERSION: &str = "niols-bundle/1";

pub const TRACE_FILE: &str = "trace.jsonl";
pub const CONFIG_FILE: &str = "config.json";
pub const CALIBRATION_FILE: &str = "calibration.json";
pub const HEALTH_START_FILE: &str = "health_start.json";
pub const HEALTH_END_FILE: &str = "health_end.json";
pub const MANIFEST_FILE: &str = "session_manifest.json";

/// Logical names used as keys of the manifest `files` map.
pub const TRACE_ENTRY: &str = "trace";
pub const CONFIG_ENTRY: &str = "config";
pub const CALIBRATION_ENTRY: &str = "calibration";
pub const HEALTH_START_ENTRY: &str = "health_start";
pub const HEALTH_END_ENTRY: &str = "health_end";

/// Fields bound into the root hash together with the last record hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub format_version: String,
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub final_state: FsmState,
    pub config_hash: Option<String>,
    pub cal_hash: Option<String>,
    pub record_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileEntry {
    Present {
        path: String,
        sha256: String,
        bytes: u64,
    },
    Missing {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionManifest {
    pub format_version: String,
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub final_state: FsmState,
    pub fault_reason: Option<String>,
    pub config_hash: Option<String>,
    pub cal_hash: Option<String>,
    pub root_hash: String,
    pub last_record_hash: String,
    pub record_count: u64,
    pub audit_degraded: bool,
    pub files: BTreeMap<String, FileEntry>,
}

impl SessionManifest {
    pub fn metadata(&self) -> SessionMetadata {
        SessionMetadata {
            format_version: self.format_version.clone(),
            session_id: self.session_id,
            started_at: self.started_at,
            ended_at: self.ended_at,
            final_state: self.final_state,
            config_hash: self.config_hash.clone(),
            cal_hash: self.cal_hash.clone(),
            record_count: self.record_count,
        }
    }
}

/// What the session hands over at shutdown.
#[derive(Debug)]
pub struct BundleInputs<'a> {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub final_state: FsmState,
    pub fault: Option<&'a FaultCause>,
    pub bound: Option<(&'a DeviceConfig, &'a Calibration)>,
    pub last_record_hash: &'a str,
    pub record_count: u64,
    pub trace_on_disk: bool,
    pub audit_degraded: bool,
    pub health_start: &'a HealthSnapshot,
    pub health_end: &'a HealthSnapshot,
}

fn hash_file(path: &Path) -> Result<(String, u64), BundleError> {
    let mut file =
        File::open(path).map_err(|e| BundleError::io(format!("open {}", path.display()), e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| BundleError::io(format!("read {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

fn present(dir: &Path, file: &str) -> Result<FileEntry, BundleError> {
    let (sha256, bytes) = hash_file(&dir.join(file))?;
    Ok(FileEntry::Present {
        path: file.to_string(),
        sha256,
        bytes,
    })
}

fn write_entry<T: Serialize>(
    dir: &Path,
    (entry, file): (&str, &str),
    value: &T,
    files: &mut BTreeMap<String, FileEntry>,
) -> Result<(), BundleError> {
    atomic_write_json(&dir.join(file), value)?;
    files.insert(entry.to_string(), present(dir, file)?);
    Ok(())
}

/// Writes the snapshots and the manifest into `dir`.
pub fn assemble(dir: &Path, inputs: &BundleInputs<'_>) -> Result<SessionManifest, BundleError> {
    let mut files = BTreeMap::new();

    if inputs.trace_on_disk {
        files.insert(TRACE_ENTRY.to_string(), present(dir, TRACE_FILE)?);
    } else {
        files.insert(
            TRACE_ENTRY.to_string(),
            FileEntry::Missing {
                reason: "trace kept in a non-file store".into(),
            },
        );
    }

    let (config_hash, cal_hash) = match inputs.bound {
        Some((config, calibration)) => {
            write_entry(dir, (CONFIG_ENTRY, CONFIG_FILE), config, &mut files)?;
            write_entry(dir, (CALIBRATION_ENTRY, CALIBRATION_FILE), calibration, &mut files)?;
            (Some(hash_canonical(config)?), Some(hash_canonical(calibration)?))
        }
        None => {
            for name in [CONFIG_ENTRY, CALIBRATION_ENTRY] {
                files.insert(
                    name.to_string(),
                    FileEntry::Missing {
                        reason: "session never initialized".into(),
                    },
                );
            }
            (None, None)
        }
    };

    write_entry(dir, (HEALTH_START_ENTRY, HEALTH_START_FILE), inputs.health_start, &mut files)?;
    write_entry(dir, (HEALTH_END_ENTRY, HEALTH_END_FILE), inputs.health_end, &mut files)?;

    let mut manifest = SessionManifest {
        format_version: BUNDLE_FORMAT_VERSION.to_string(),
        session_id: inputs.session_id,
        started_at: inputs.started_at,
        ended_at: inputs.ended_at,
        final_state: inputs.final_state,
        fault_reason: inputs.fault.map(|c| c.to_string()),
        config_hash,
        cal_hash,
        root_hash: String::new(),
        last_record_hash: inputs.last_record_hash.to_string(),
        record_count: inputs.record_count,
        audit_degraded: inputs.audit_degraded,
        files,
    };
    manifest.root_hash = root_hash(&manifest.last_record_hash, &manifest.metadata())?;

    atomic_write_json(&dir.join(MANIFEST_FILE), &manifest)?;
    info!(
        "[BUNDLE] session {} sealed: {} records, final state {}, root {}",
        manifest.session_id,
        manifest.record_count,
        manifest.final_state,
        manifest.root_hash.get(..12).unwrap_or(&manifest.root_hash)
    );
    Ok(manifest)
}

/// Result of an offline bundle check. `problems` is empty iff `valid`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BundleReport {
    pub dir: PathBuf,
    pub session_id: Option<Uuid>,
    pub valid: bool,
    pub problems: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainVerification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_hash: Option<String>,
}

/// Bundle entries must name files directly inside the bundle directory.
fn is_plain_file_name(path: &str) -> bool {
    !path.is_empty() && path != "." && path != ".." && !path.contains(['/', '\\'])
}

fn read_manifest(path: &Path) -> Result<SessionManifest, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("manifest unreadable: {e}"))?;
    serde_json::from_str(&text).map_err(|e| format!("manifest malformed: {e}"))
}

fn snapshot_hash<T>(path: &Path) -> Result<String, String>
where
    T: Serialize + for<'de> Deserialize<'de>,
{
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("{} unreadable: {e}", path.display()))?;
    let value: T =
        serde_json::from_str(&text).map_err(|e| format!("{} malformed: {e}", path.display()))?;
    hash_canonical(&value).map_err(|e| e.to_string())
}

fn check_snapshot(
    report: &mut BundleReport,
    manifest: &SessionManifest,
    name: &str,
    expected: Option<&str>,
    actual: impl FnOnce(&str) -> Result<String, String>,
) {
    let (Some(FileEntry::Present { path, .. }), Some(expected)) = (manifest.files.get(name), expected)
    else {
        return;
    };
    if !is_plain_file_name(path) {
        return;
    }
    match actual(path) {
        Ok(hash) if hash == expected => {}
        Ok(_) => report
            .problems
            .push(format!("{name}: content hash differs from bound hash")),
        Err(e) => report.problems.push(e),
    }
}

/// Verifies a bundle directory without trusting anything but its contents.
pub fn verify_bundle(dir: &Path) -> BundleReport {
    let mut report = BundleReport {
        dir: dir.to_path_buf(),
        session_id: None,
        valid: false,
        problems: Vec::new(),
        chain: None,
        root_hash: None,
    };

    let manifest = match read_manifest(&dir.join(MANIFEST_FILE)) {
        Ok(m) => m,
        Err(problem) => {
            report.problems.push(problem);
            return report;
        }
    };
    report.session_id = Some(manifest.session_id);

    if manifest.format_version != BUNDLE_FORMAT_VERSION {
        report
            .problems
            .push(format!("unsupported format version {}", manifest.format_version));
    }

    for (name, entry) in &manifest.files {
        let FileEntry::Present { path, sha256, bytes } = entry else {
            continue;
        };
        if !is_plain_file_name(path) {
            report.problems.push(format!("{name}: entry path {path} not allowed"));
            continue;
        }
        match hash_file(&dir.join(path)) {
            Ok((actual, actual_bytes)) => {
                if &actual != sha256 {
                    report.problems.push(format!("{name}: sha256 mismatch"));
                }
                if actual_bytes != *bytes {
                    report
                        .problems
                        .push(format!("{name}: {actual_bytes} bytes, manifest says {bytes}"));
                }
            }
            Err(e) => report.problems.push(format!("{name}: {e}")),
        }
    }

    match manifest.files.get(TRACE_ENTRY) {
        Some(FileEntry::Present { path, .. }) if is_plain_file_name(path) => match verify_file(&dir.join(path)) {
            Ok(chain) => {
                if let Err(e) = chain.clone().into_result() {
                    report.problems.push(e.to_string());
                }
                let last = chain.last_hash.as_deref().unwrap_or(GENESIS_HASH);
                if last != manifest.last_record_hash {
                    report
                        .problems
                        .push("last record hash differs from manifest".to_string());
                }
                if chain.records as u64 != manifest.record_count {
                    report.problems.push(format!(
                        "trace holds {} records, manifest says {}",
                        chain.records, manifest.record_count
                    ));
                }
                report.chain = Some(chain);
            }
            Err(e) => report.problems.push(format!("trace unreadable: {e}")),
        },
        Some(FileEntry::Present { .. }) => {}
        Some(FileEntry::Missing { reason }) => {
            report.problems.push(format!("trace not included: {reason}"));
        }
        None => report.problems.push("manifest lists no trace".to_string()),
    }

    check_snapshot(&mut report, &manifest, CONFIG_ENTRY, manifest.config_hash.as_deref(), |file| {
        snapshot_hash::<DeviceConfig>(&dir.join(file))
    });
    check_snapshot(&mut report, &manifest, CALIBRATION_ENTRY, manifest.cal_hash.as_deref(), |file| {
        snapshot_hash::<Calibration>(&dir.join(file))
    });

    match root_hash(&manifest.last_record_hash, &manifest.metadata()) {
        Ok(recomputed) => {
            if recomputed != manifest.root_hash {
                report.problems.push("root hash mismatch".to_string());
            }
            report.root_hash = Some(recomputed);
        }
        Err(e) => report.problems.push(format!("root hash: {e}")),
    }

    report.valid = report.problems.is_empty();
    if !report.valid {
        warn!(
            "[BUNDLE] {} failed verification: {}",
            dir.display(),
            report.problems.join("; ")
        );
    }
    report
}
