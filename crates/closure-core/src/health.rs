use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered from best to worst so the overall status is the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub captured_at: DateTime<Utc>,
    pub overall: HealthStatus,
    pub checks: Vec<HealthCheck>,
}

impl HealthSnapshot {
    pub fn from_checks(captured_at: DateTime<Utc>, checks: Vec<HealthCheck>) -> Self {
        let overall = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self {
            captured_at,
            overall,
            checks,
        }
    }
}
