use closure_core::{FaultCause, FsmEvent, FsmState, SessionContext};
use closure_session::TransitionObserver;
use prometheus::{
    register_gauge_vec_with_registry, register_histogram_with_registry,
    register_int_counter_vec_with_registry, Encoder, GaugeVec, Histogram, IntCounterVec, Registry,
    TextEncoder,
};
use std::time::Duration;

#[cfg(test)]
mod tests;

/// Prometheus view of one or more sessions. Registered on a private
/// registry so several instances can live in one process.
pub struct ClosureMetrics {
    registry: Registry,
    pub transitions_total: IntCounterVec,
    pub rejections_total: IntCounterVec,
    pub faults_total: IntCounterVec,
    pub interlock_cutoff_seconds: Histogram,
    pub budget_remaining: GaugeVec,
    pub state: GaugeVec,
}

impl ClosureMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let transitions_total = register_int_counter_vec_with_registry!(
            "closure_transitions_total",
            "Committed FSM transitions",
            &["from", "to", "event"],
            registry
        )?;

        let rejections_total = register_int_counter_vec_with_registry!(
            "closure_rejections_total",
            "Refused transition attempts by event and rejection kind",
            &["event", "kind"],
            registry
        )?;

        let faults_total = register_int_counter_vec_with_registry!(
            "closure_faults_total",
            "Forced FAULT entries by cause",
            &["cause"],
            registry
        )?;

        let interlock_cutoff_seconds = register_histogram_with_registry!(
            "closure_interlock_cutoff_seconds",
            "Interlock detection to emission cutoff",
            vec![0.0005, 0.001, 0.002, 0.005, 0.01, 0.02, 0.05],
            registry
        )?;

        let budget_remaining = register_gauge_vec_with_registry!(
            "closure_budget_remaining",
            "Remaining budget after the last transition",
            &["resource"],
            registry
        )?;

        let state = register_gauge_vec_with_registry!(
            "closure_state",
            "1 for the current FSM state, 0 otherwise",
            &["state"],
            registry
        )?;

        let metrics = Self {
            registry,
            transitions_total,
            rejections_total,
            faults_total,
            interlock_cutoff_seconds,
            budget_remaining,
            state,
        };
        metrics.set_state(FsmState::Safe);
        Ok(metrics)
    }

    fn set_state(&self, current: FsmState) {
        for s in FsmState::ALL {
            let v = if s == current { 1.0 } else { 0.0 };
            self.state.with_label_values(&[s.as_str()]).set(v);
        }
    }

    /// Text exposition of everything registered.
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

impl TransitionObserver for ClosureMetrics {
    fn on_transition(&self, from: FsmState, to: FsmState, event: FsmEvent, ctx: &SessionContext) {
        self.transitions_total
            .with_label_values(&[from.as_str(), to.as_str(), event.as_str()])
            .inc();
        let budget = ctx.budget;
        self.budget_remaining
            .with_label_values(&["emit_ms"])
            .set(budget.remaining_emit_ms);
        self.budget_remaining
            .with_label_values(&["duty_percent"])
            .set(budget.remaining_duty_percent);
        self.budget_remaining
            .with_label_values(&["cooldown_ms"])
            .set(budget.cooldown_remaining_ms);
        self.set_state(to);
    }

    fn on_rejection(&self, _state: FsmState, event: FsmEvent, kind: &'static str) {
        self.rejections_total
            .with_label_values(&[event.as_str(), kind])
            .inc();
    }

    fn on_fault(&self, cause: &FaultCause, cutoff_latency: Option<Duration>) {
        self.faults_total.with_label_values(&[cause.label()]).inc();
        if let Some(latency) = cutoff_latency {
            self.interlock_cutoff_seconds.observe(latency.as_secs_f64());
        }
        self.set_state(FsmState::Fault);
    }
}
