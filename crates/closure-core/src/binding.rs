//! Hash binding of configuration and calibration.
//!
//! Both inputs are reduced to canonical JSON (compact, object keys sorted
//! recursively) before SHA-256, so two files that differ only in key order or
//! whitespace bind to the same digest.

use crate::config::{Calibration, DeviceConfig};
use crate::error::BindingError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::warn;

/// Sentinel standing in for the hash of the record before the first one.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Separator written after every field of a framed hash.
pub const FIELD_SEPARATOR: u8 = 0x1F;

/// Rebuilds `value` with every object's keys in sorted order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key.as_str()]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

pub fn canonical_json(value: &Value) -> Result<String, BindingError> {
    Ok(serde_json::to_string(&canonicalize(value))?)
}

pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, BindingError> {
    let tree = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&canonicalize(&tree))?)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 over `fields`, each followed by [`FIELD_SEPARATOR`].
pub fn framed_sha256_hex<'a, I>(fields: I) -> String
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field);
        hasher.update([FIELD_SEPARATOR]);
    }
    hex::encode(hasher.finalize())
}

pub fn hash_canonical<T: Serialize>(value: &T) -> Result<String, BindingError> {
    Ok(sha256_hex(&canonical_bytes(value)?))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundHashes {
    pub config_hash: String,
    pub cal_hash: String,
}

pub fn bind(config: &DeviceConfig, calibration: &Calibration) -> Result<BoundHashes, BindingError> {
    Ok(BoundHashes {
        config_hash: hash_canonical(config)?,
        cal_hash: hash_canonical(calibration)?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashDivergence {
    pub bound: String,
    pub recomputed: String,
}

/// Outcome of recomputing bound hashes. Each side is `Some` only if it moved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    pub config: Option<HashDivergence>,
    pub calibration: Option<HashDivergence>,
}

impl DriftReport {
    pub fn is_drifted(&self) -> bool {
        self.config.is_some() || self.calibration.is_some()
    }
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

impl fmt::Display for DriftReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(d) = &self.config {
            parts.push(format!("config {} -> {}", short(&d.bound), short(&d.recomputed)));
        }
        if let Some(d) = &self.calibration {
            parts.push(format!(
                "calibration {} -> {}",
                short(&d.bound),
                short(&d.recomputed)
            ));
        }
        if parts.is_empty() {
            f.write_str("no drift")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}

pub fn detect_drift(
    config: &DeviceConfig,
    calibration: &Calibration,
    bound: &BoundHashes,
) -> Result<DriftReport, BindingError> {
    let now = bind(config, calibration)?;
    let diverge = |bound: &str, recomputed: String| {
        (bound != recomputed).then(|| HashDivergence {
            bound: bound.to_string(),
            recomputed,
        })
    };
    let report = DriftReport {
        config: diverge(&bound.config_hash, now.config_hash),
        calibration: diverge(&bound.cal_hash, now.cal_hash),
    };
    if report.is_drifted() {
        warn!("[BINDER] hash drift detected: {}", report);
    }
    Ok(report)
}

/// `true` when either hash moved away from its bound value.
pub fn check_drift(
    config: &DeviceConfig,
    calibration: &Calibration,
    bound: &BoundHashes,
) -> Result<bool, BindingError> {
    Ok(detect_drift(config, calibration, bound)?.is_drifted())
}
