use crate::error::TraceError;
use chrono::{DateTime, SecondsFormat, Utc};
use closure_core::binding::{
    canonical_bytes, canonical_json, framed_sha256_hex, sha256_hex, FIELD_SEPARATOR,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StateTransition,
    Fault,
    ConfigDrift,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::StateTransition => "state_transition",
            EventType::Fault => "fault",
            EventType::ConfigDrift => "config_drift",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of `trace.jsonl`. Field order is the on-disk order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceRecord {
    pub seq: u64,
    pub timestamp: String,
    pub event_type: EventType,
    pub payload: Value,
    pub prev_hash: String,
    pub record_hash: String,
    pub config_hash: Option<String>,
    pub cal_hash: Option<String>,
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Binding hashes are tagged so an absent hash and an empty one differ:
/// `0` when absent, `1` followed by the hash when present.
fn binding_field(hash: Option<&str>) -> Vec<u8> {
    match hash {
        None => b"0".to_vec(),
        Some(h) => {
            let mut field = Vec::with_capacity(h.len() + 1);
            field.push(b'1');
            field.extend_from_slice(h.as_bytes());
            field
        }
    }
}

/// `H(prev_hash ‖ seq ‖ timestamp ‖ event_type ‖ canonical(payload) ‖ config_hash ‖ cal_hash)`,
/// each field framed by the unit separator.
pub fn compute_record_hash(
    prev_hash: &str,
    seq: u64,
    timestamp: &str,
    event_type: EventType,
    payload: &Value,
    config_hash: Option<&str>,
    cal_hash: Option<&str>,
) -> Result<String, TraceError> {
    let seq = seq.to_string();
    let payload = canonical_json(payload)?;
    let config_hash = binding_field(config_hash);
    let cal_hash = binding_field(cal_hash);
    Ok(framed_sha256_hex([
        prev_hash.as_bytes(),
        seq.as_bytes(),
        timestamp.as_bytes(),
        event_type.as_str().as_bytes(),
        payload.as_bytes(),
        config_hash.as_slice(),
        cal_hash.as_slice(),
    ]))
}

impl TraceRecord {
    pub fn recompute_hash(&self) -> Result<String, TraceError> {
        compute_record_hash(
            &self.prev_hash,
            self.seq,
            &self.timestamp,
            self.event_type,
            &self.payload,
            self.config_hash.as_deref(),
            self.cal_hash.as_deref(),
        )
    }

    /// The exact line the writer emits for this record, without the newline.
    pub fn to_line(&self) -> Result<String, TraceError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// `H(last_record_hash ‖ 0x1F ‖ canonical(metadata))`.
pub fn root_hash<T: Serialize>(last_record_hash: &str, metadata: &T) -> Result<String, TraceError> {
    let mut bytes = last_record_hash.as_bytes().to_vec();
    bytes.push(FIELD_SEPARATOR);
    bytes.extend(canonical_bytes(metadata)?);
    Ok(sha256_hex(&bytes))
}
