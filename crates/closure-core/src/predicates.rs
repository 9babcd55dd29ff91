//! Guard predicates, one per guarded transition.
//!
//! Every function here is pure: the caller supplies the context and every
//! external reading (interlock, confirmation, measurement, times) and gets a
//! [`Decision`] whose `evidence` records exactly those inputs. Replaying the
//! evidence through the same function yields the same verdict.

use crate::binding::DriftReport;
use crate::config::{Calibration, DeviceConfig};
use crate::context::SessionContext;
use crate::envelope::{MeasurementEnvelope, CLASS_1M_LIMIT_MW};
use crate::health::HealthStatus;
use crate::state::FsmState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny { reason: String },
    /// The arming window closed; a timeout, not a fault.
    Expired { reason: String },
    Fault { cause: FaultCause },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub predicate: String,
    pub verdict: Verdict,
    pub evidence: Value,
}

impl Decision {
    fn new(predicate: &str, verdict: Verdict, evidence: Value) -> Self {
        Self {
            predicate: predicate.to_string(),
            verdict,
            evidence,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self.verdict, Verdict::Allow)
    }
}

/// Conditions that force FAULT regardless of the requested event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultCause {
    InterlockDrop { state: FsmState },
    ConfigDrift { report: DriftReport },
    ConfigUnverifiable { detail: String },
    InvalidTransition { detail: String },
    Runtime { detail: String },
}

impl FaultCause {
    pub fn label(&self) -> &'static str {
        match self {
            FaultCause::InterlockDrop { .. } => "interlock_drop",
            FaultCause::ConfigDrift { .. } => "config_drift",
            FaultCause::ConfigUnverifiable { .. } => "config_unverifiable",
            FaultCause::InvalidTransition { .. } => "invalid_transition",
            FaultCause::Runtime { .. } => "runtime",
        }
    }
}

impl fmt::Display for FaultCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultCause::InterlockDrop { state } => write!(f, "interlock dropped while {state}"),
            FaultCause::ConfigDrift { report } => write!(f, "hash drift: {report}"),
            FaultCause::ConfigUnverifiable { detail } => {
                write!(f, "bound configuration cannot be re-read: {detail}")
            }
            FaultCause::InvalidTransition { detail } => write!(f, "invalid transition: {detail}"),
            FaultCause::Runtime { detail } => write!(f, "runtime error: {detail}"),
        }
    }
}

fn deny(predicate: &str, reason: impl Into<String>, evidence: Value) -> Decision {
    Decision::new(
        predicate,
        Verdict::Deny {
            reason: reason.into(),
        },
        evidence,
    )
}

/// Interlock sampling rule: unsafe while hot is a fault.
pub fn check_interlock(state: FsmState, interlock_safe: bool) -> Option<FaultCause> {
    (state.is_hot() && !interlock_safe).then_some(FaultCause::InterlockDrop { state })
}

/// SAFE → INITIALIZED.
pub fn check_initialize(
    config: &DeviceConfig,
    calibration: &Calibration,
    start_health: HealthStatus,
) -> Decision {
    const NAME: &str = "initialize";
    let evidence = json!({
        "device_id": config.device_id,
        "schema_version": config.schema_version,
        "calibration_points": calibration.points.len(),
        "start_health": start_health,
    });
    if let Err(e) = config.validate() {
        return deny(NAME, e.to_string(), evidence);
    }
    if let Err(e) = calibration.validate() {
        return deny(NAME, e.to_string(), evidence);
    }
    if start_health == HealthStatus::Critical {
        return deny(NAME, "start health snapshot is critical", evidence);
    }
    Decision::new(NAME, Verdict::Allow, evidence)
}

/// INITIALIZED → ARMED.
pub fn check_arm(
    ctx: &SessionContext,
    config: &DeviceConfig,
    interlock_safe: bool,
    now_ms: u64,
) -> Decision {
    const NAME: &str = "arm";
    let since_emit_ms = ctx.last_emit_end_ms.map(|end| now_ms.saturating_sub(end));
    let evidence = json!({
        "interlock_safe": interlock_safe,
        "hashes_bound": ctx.hashes.is_some(),
        "since_last_emit_ms": since_emit_ms,
        "cooldown_ms": config.safety.cooldown_ms,
    });
    if !interlock_safe {
        return deny(NAME, "interlock not safe", evidence);
    }
    if ctx.hashes.is_none() {
        return deny(NAME, "session parameters not staged", evidence);
    }
    if let Some(elapsed) = since_emit_ms {
        if (elapsed as f64) < config.safety.cooldown_ms {
            return deny(
                NAME,
                format!(
                    "cooldown active: {:.0} ms remaining",
                    config.safety.cooldown_ms - elapsed as f64
                ),
                evidence,
            );
        }
    }
    Decision::new(NAME, Verdict::Allow, evidence)
}

/// True when an ARMED session has outlived its arming window.
pub fn arming_window_expired(ctx: &SessionContext, config: &DeviceConfig, now_ms: u64) -> bool {
    ctx.state == FsmState::Armed
        && ctx
            .armed_at_ms
            .is_some_and(|at| now_ms.saturating_sub(at) > config.safety.arming_window_ms)
}

/// ARMED → EMIT_READY.
pub fn check_confirm_arm(
    ctx: &SessionContext,
    config: &DeviceConfig,
    operator_confirmed: bool,
    interlock_safe: bool,
    now_ms: u64,
) -> Decision {
    const NAME: &str = "confirm_arm";
    let elapsed_ms = ctx.armed_at_ms.map(|at| now_ms.saturating_sub(at));
    let evidence = json!({
        "operator_confirmed": operator_confirmed,
        "interlock_safe": interlock_safe,
        "elapsed_since_arm_ms": elapsed_ms,
        "arming_window_ms": config.safety.arming_window_ms,
    });
    if let Some(cause) = check_interlock(ctx.state, interlock_safe) {
        return Decision::new(NAME, Verdict::Fault { cause }, evidence);
    }
    let Some(elapsed_ms) = elapsed_ms else {
        return deny(NAME, "no arming timestamp recorded", evidence);
    };
    if elapsed_ms > config.safety.arming_window_ms {
        return Decision::new(
            NAME,
            Verdict::Expired {
                reason: format!(
                    "arming window expired: {} ms > {} ms",
                    elapsed_ms, config.safety.arming_window_ms
                ),
            },
            evidence,
        );
    }
    if !operator_confirmed {
        return deny(NAME, "operator confirmation absent", evidence);
    }
    Decision::new(NAME, Verdict::Allow, evidence)
}

/// External readings consulted by the emit guard.
#[derive(Debug, Clone, Copy)]
pub struct EmitInputs<'a> {
    pub interlock_safe: bool,
    pub stop_requested: bool,
    pub power_mw: f64,
    pub duration_ms: f64,
    pub duty_percent: f64,
    pub measurement: Option<&'a MeasurementEnvelope>,
    /// Dark voltage of the bound calibration.
    pub dark_voltage_v: f64,
    pub now: DateTime<Utc>,
}

/// EMIT_READY → EMITTING.
pub fn check_emit(ctx: &SessionContext, config: &DeviceConfig, inputs: &EmitInputs<'_>) -> Decision {
    const NAME: &str = "emit";
    let evidence = json!({
        "interlock_safe": inputs.interlock_safe,
        "stop_requested": inputs.stop_requested,
        "power_mw": inputs.power_mw,
        "duration_ms": inputs.duration_ms,
        "duty_percent": inputs.duty_percent,
        "budget": ctx.budget,
        "measurement": inputs.measurement,
        "dark_voltage_v": inputs.dark_voltage_v,
        "now": inputs.now,
    });

    if let Some(cause) = check_interlock(ctx.state, inputs.interlock_safe) {
        return Decision::new(NAME, Verdict::Fault { cause }, evidence);
    }
    if inputs.stop_requested {
        return deny(NAME, "stop requested", evidence);
    }

    let limit = config.safety.max_power_mw.min(CLASS_1M_LIMIT_MW);
    if !inputs.power_mw.is_finite() || inputs.power_mw <= 0.0 {
        return deny(NAME, "requested power must be finite and > 0", evidence);
    }
    if inputs.power_mw > limit {
        return deny(
            NAME,
            format!("requested power {} mW exceeds limit {} mW", inputs.power_mw, limit),
            evidence,
        );
    }
    if !inputs.duration_ms.is_finite() || inputs.duration_ms <= 0.0 {
        return deny(NAME, "pattern has no emission time", evidence);
    }
    if let Some(reason) = ctx.budget.shortfall(inputs.duration_ms, inputs.duty_percent) {
        return deny(NAME, reason, evidence);
    }

    if let Some(detection) = &config.measurement.detection {
        let Some(m) = inputs.measurement else {
            return deny(NAME, "detection envelope configured but no measurement available", evidence);
        };
        match m.age_ms(inputs.now) {
            None => return deny(NAME, "measurement timestamp is in the future", evidence),
            Some(age) if age > i64::try_from(config.measurement.max_age_ms).unwrap_or(i64::MAX) => {
                return deny(NAME, format!("measurement stale: {age} ms old"), evidence)
            }
            Some(_) => {}
        }
        if !m.is_clean() {
            return deny(NAME, "measurement saturated or clipped", evidence);
        }
        let floor_v = inputs.dark_voltage_v + detection.baseline_above_dark_v;
        if m.voltage.range_v.min < floor_v {
            return deny(
                NAME,
                format!(
                    "voltage [{:.4}, {:.4}] V not entirely above baseline {:.4} V",
                    m.voltage.range_v.min, m.voltage.range_v.max, floor_v
                ),
                evidence,
            );
        }
        let Some(wl) = m.wavelength_nm else {
            return deny(NAME, "measurement outside calibrated range", evidence);
        };
        if wl.confidence.unwrap_or(0.0) < detection.min_confidence {
            return deny(NAME, "wavelength confidence below detection minimum", evidence);
        }
        if !wl.within(detection.wavelength_min_nm, detection.wavelength_max_nm) {
            let reason = if wl.straddles(detection.wavelength_min_nm)
                || wl.straddles(detection.wavelength_max_nm)
            {
                format!(
                    "wavelength [{:.1}, {:.1}] nm straddles detection bound",
                    wl.min, wl.max
                )
            } else {
                format!(
                    "wavelength [{:.1}, {:.1}] nm outside detection envelope",
                    wl.min, wl.max
                )
            };
            return deny(NAME, reason, evidence);
        }
    }

    Decision::new(NAME, Verdict::Allow, evidence)
}

/// FAULT → SAFE.
pub fn check_reset(operator_confirmed: bool) -> Decision {
    const NAME: &str = "reset";
    let evidence = json!({ "operator_confirmed": operator_confirmed });
    if !operator_confirmed {
        return deny(NAME, "reset requires operator confirmation", evidence);
    }
    Decision::new(NAME, Verdict::Allow, evidence)
}

/// ARMED → INITIALIZED when no confirmation arrived in time.
pub fn check_arm_timeout(ctx: &SessionContext, config: &DeviceConfig, now_ms: u64) -> Decision {
    const NAME: &str = "arm_timeout";
    let evidence = json!({
        "elapsed_since_arm_ms": ctx.armed_at_ms.map(|at| now_ms.saturating_sub(at)),
        "arming_window_ms": config.safety.arming_window_ms,
    });
    if !arming_window_expired(ctx, config, now_ms) {
        return deny(NAME, "arming window still open", evidence);
    }
    Decision::new(NAME, Verdict::Allow, evidence)
}

/// EMITTING → EMIT_READY.
pub fn check_emit_complete(ctx: &SessionContext, elapsed_ms: u64) -> Decision {
    const NAME: &str = "emit_complete";
    let evidence = json!({
        "elapsed_ms": elapsed_ms,
        "granted": ctx.emission.as_ref().map(|e| e.granted),
    });
    if ctx.emission.is_none() {
        return deny(NAME, "no active emission", evidence);
    }
    Decision::new(NAME, Verdict::Allow, evidence)
}

/// Stop is never refused by a guard; legality alone decides.
pub fn check_stop(ctx: &SessionContext, reason: &str) -> Decision {
    Decision::new(
        "stop",
        Verdict::Allow,
        json!({ "reason": reason, "was_emitting": ctx.emission.is_some() }),
    )
}
