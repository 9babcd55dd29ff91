use crate::hardware::Hardware;
use closure_core::{Clock, FsmState, HealthCheck, HealthSnapshot, HealthStatus};
use std::path::Path;

fn check(name: &str, status: HealthStatus, message: impl Into<String>) -> HealthCheck {
    HealthCheck {
        name: name.to_string(),
        status,
        message: message.into(),
    }
}

/// Snapshot of the hardware path and the session directory.
pub fn capture(
    hardware: &dyn Hardware,
    session_dir: &Path,
    state: FsmState,
    clock: &dyn Clock,
) -> HealthSnapshot {
    let mut checks = Vec::with_capacity(4);

    checks.push(if hardware.read_interlock() {
        check("interlock", HealthStatus::Healthy, "interlock reports safe")
    } else {
        check("interlock", HealthStatus::Warning, "interlock reports unsafe")
    });

    checks.push(match hardware.read_voltage() {
        Ok(v) => check("voltage_probe", HealthStatus::Healthy, format!("probe reads {v:.4} V")),
        Err(e) => check("voltage_probe", HealthStatus::Error, e.to_string()),
    });

    checks.push(if hardware.output_enabled() && state != FsmState::Emitting {
        check(
            "emission_output",
            HealthStatus::Critical,
            format!("output enabled while {state}"),
        )
    } else {
        check("emission_output", HealthStatus::Healthy, "output consistent with state")
    });

    checks.push(match tempfile::NamedTempFile::new_in(session_dir) {
        Ok(_) => check(
            "session_dir",
            HealthStatus::Healthy,
            format!("{} writable", session_dir.display()),
        ),
        Err(e) => check(
            "session_dir",
            HealthStatus::Critical,
            format!("{} not writable: {e}", session_dir.display()),
        ),
    });

    HealthSnapshot::from_checks(clock.now_utc(), checks)
}
