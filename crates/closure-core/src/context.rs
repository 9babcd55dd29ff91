use crate::binding::BoundHashes;
use crate::envelope::{BudgetEnvelope, EmitEnvelope};
use crate::predicates::FaultCause;
use crate::state::{FsmEvent, FsmState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveEmission {
    pub granted: EmitEnvelope,
    pub started_at_ms: u64,
}

/// Why the most recent transition attempt was refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub event: FsmEvent,
    pub state: FsmState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Everything one running session owns. There is exactly one per session
/// and it is never shared outside the engine lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub state: FsmState,
    /// Bound at INITIALIZE, immutable until the next INITIALIZE.
    pub hashes: Option<BoundHashes>,
    pub budget: BudgetEnvelope,
    pub armed_at_ms: Option<u64>,
    pub last_emit_end_ms: Option<u64>,
    pub emission: Option<ActiveEmission>,
    pub fault: Option<FaultCause>,
    pub last_rejection: Option<Rejection>,
}

impl SessionContext {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            state: FsmState::Safe,
            hashes: None,
            budget: BudgetEnvelope {
                remaining_emit_ms: 0.0,
                remaining_duty_percent: 0.0,
                cooldown_remaining_ms: 0.0,
            },
            armed_at_ms: None,
            last_emit_end_ms: None,
            emission: None,
            fault: None,
            last_rejection: None,
        }
    }

    pub fn config_hash(&self) -> Option<&str> {
        self.hashes.as_ref().map(|h| h.config_hash.as_str())
    }

    pub fn cal_hash(&self) -> Option<&str> {
        self.hashes.as_ref().map(|h| h.cal_hash.as_str())
    }
}
