//! The single-writer FSM engine.
//!
//! One `Engine` per session owns the context and the trace writer together,
//! so `(state, trace sequence)` only ever move as a pair. Callers reach it
//! through one mutex; the watchdog is the only path that acts before taking
//! that mutex, and it only cuts emission and raises the fault latch.

use crate::error::TransitionError;
use crate::hardware::Hardware;
use closure_core::binding::{bind, detect_drift, BoundHashes, DriftReport};
use closure_core::config::{Calibration, ConfigSource, DeviceConfig};
use closure_core::context::{ActiveEmission, Rejection, SessionContext};
use closure_core::envelope::{BudgetEnvelope, EmitEnvelope, MeasurementEnvelope};
use closure_core::predicates::{self, Decision, EmitInputs, FaultCause, Verdict};
use closure_core::state::{target, FsmEvent, FsmState};
use closure_core::{Clock, HealthStatus};
use closure_trace::{EventType, TraceWriter};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, info, warn};

const NO_LATCH: u8 = u8::MAX;

/// Lock-free flags shared by the engine, the watchdog, the poller and the
/// emission runner.
#[derive(Debug)]
pub struct SessionSignals {
    state: AtomicU8,
    latch: AtomicU8,
    stop: AtomicBool,
    shutdown: AtomicBool,
}

impl Default for SessionSignals {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(FsmState::Safe.to_u8()),
            latch: AtomicU8::new(NO_LATCH),
            stop: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }
}

impl SessionSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror of the engine state, readable without the engine lock.
    pub fn state(&self) -> FsmState {
        FsmState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: FsmState) {
        self.state.store(state.to_u8(), Ordering::SeqCst);
    }

    /// Raises the fault latch for an interlock drop seen in `state`.
    /// Returns `false` if it was already raised.
    pub fn latch_fault(&self, state: FsmState) -> bool {
        self.latch
            .compare_exchange(NO_LATCH, state.to_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn fault_latched(&self) -> bool {
        self.latch.load(Ordering::SeqCst) != NO_LATCH
    }

    fn take_latch(&self) -> Option<FsmState> {
        let code = self.latch.swap(NO_LATCH, Ordering::SeqCst);
        (code != NO_LATCH).then(|| FsmState::from_u8(code))
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn clear_stop(&self) {
        self.stop.store(false, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Hook for metrics and other passive consumers of engine activity.
pub trait TransitionObserver: Send + Sync {
    fn on_transition(&self, _from: FsmState, _to: FsmState, _event: FsmEvent, _ctx: &SessionContext) {}
    fn on_rejection(&self, _state: FsmState, _event: FsmEvent, _kind: &'static str) {}
    fn on_fault(&self, _cause: &FaultCause, _cutoff_latency: Option<Duration>) {}
}

/// Event plus the external inputs its guard consumes.
#[derive(Debug, Clone)]
pub enum EventInput {
    Initialize {
        start_health: HealthStatus,
    },
    Arm,
    ConfirmArm {
        operator_confirmed: bool,
    },
    ArmTimeout,
    EmitRequest {
        power_mw: f64,
        duration_ms: f64,
        duty_percent: f64,
        pulse_ms: u64,
        pattern: Value,
        measurement: Option<MeasurementEnvelope>,
    },
    EmitComplete {
        elapsed_ms: u64,
    },
    Stop {
        reason: String,
    },
    Reset {
        operator_confirmed: bool,
    },
}

impl EventInput {
    pub fn event(&self) -> FsmEvent {
        match self {
            EventInput::Initialize { .. } => FsmEvent::Initialize,
            EventInput::Arm => FsmEvent::Arm,
            EventInput::ConfirmArm { .. } => FsmEvent::ConfirmArm,
            EventInput::ArmTimeout => FsmEvent::ArmTimeout,
            EventInput::EmitRequest { .. } => FsmEvent::EmitRequest,
            EventInput::EmitComplete { .. } => FsmEvent::EmitComplete,
            EventInput::Stop { .. } => FsmEvent::Stop,
            EventInput::Reset { .. } => FsmEvent::Reset,
        }
    }
}

/// Configuration and calibration as bound at INITIALIZE.
#[derive(Debug, Clone)]
pub struct BoundSnapshot {
    pub config: DeviceConfig,
    pub calibration: Calibration,
    pub hashes: BoundHashes,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub state: FsmState,
    pub budget: BudgetEnvelope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granted: Option<EmitEnvelope>,
    pub record_seq: u64,
}

pub struct Engine {
    ctx: SessionContext,
    trace: TraceWriter,
    bound: Option<BoundSnapshot>,
    source: Arc<dyn ConfigSource>,
    hardware: Arc<dyn Hardware>,
    clock: Arc<dyn Clock>,
    signals: Arc<SessionSignals>,
    observers: Vec<Arc<dyn TransitionObserver>>,
    audit_degraded: bool,
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

/// Charges the active emission against the budget, capped at what was granted.
fn charge_emission(ctx: &mut SessionContext, elapsed_ms: u64) {
    if let Some(active) = ctx.emission.take() {
        let granted_ms = active.granted.max_duration_ms();
        let elapsed = (elapsed_ms as f64).min(granted_ms);
        let duty = if granted_ms > 0.0 {
            active.granted.max_duty_percent() * elapsed / granted_ms
        } else {
            0.0
        };
        ctx.budget.charge(elapsed, duty);
    }
}

impl Engine {
    pub fn new(
        ctx: SessionContext,
        trace: TraceWriter,
        source: Arc<dyn ConfigSource>,
        hardware: Arc<dyn Hardware>,
        clock: Arc<dyn Clock>,
        signals: Arc<SessionSignals>,
        observers: Vec<Arc<dyn TransitionObserver>>,
    ) -> Self {
        signals.set_state(ctx.state);
        Self {
            ctx,
            trace,
            bound: None,
            source,
            hardware,
            clock,
            signals,
            observers,
            audit_degraded: false,
        }
    }

    pub fn state(&self) -> FsmState {
        self.ctx.state
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn bound(&self) -> Option<&BoundSnapshot> {
        self.bound.as_ref()
    }

    pub fn audit_degraded(&self) -> bool {
        self.audit_degraded
    }

    pub fn trace_head(&self) -> (String, u64) {
        (self.trace.last_hash().to_string(), self.trace.record_count())
    }

    /// Attempts one guarded transition.
    ///
    /// Order: fault pre-checks, graph legality, guard predicate, then a commit
    /// that only replaces the context once the trace record is durable.
    pub fn transition(&mut self, input: EventInput) -> Result<Outcome, TransitionError> {
        let event = input.event();
        let result = self.transition_inner(input);
        if let Err(err) = &result {
            self.note_rejection(event, err);
        }
        result
    }

    fn transition_inner(&mut self, input: EventInput) -> Result<Outcome, TransitionError> {
        let event = input.event();
        if event != FsmEvent::Reset {
            self.fault_prechecks()?;
        }

        let from = self.ctx.state;
        let to = target(from, event).ok_or(TransitionError::IllegalTransition { from, event })?;

        let now_ms = self.clock.monotonic_ms();
        let now = self.clock.now_utc();
        let (decision, snapshot) = self.decide(&input, now_ms, now)?;
        match &decision.verdict {
            Verdict::Allow => {}
            Verdict::Deny { reason } => return Err(TransitionError::PredicateFailed(reason.clone())),
            Verdict::Expired { .. } => return Err(self.expire_arming(&decision, now_ms, now)),
            Verdict::Fault { cause } => return Err(self.force_fault(cause.clone())),
        }

        let (next, granted) = self.apply(&input, to, now_ms, snapshot.as_ref())?;
        let outcome = self.commit(event, from, next, &decision, granted, now)?;
        if let Some(snapshot) = snapshot {
            self.bound = Some(snapshot);
        }
        if event == FsmEvent::Reset {
            self.signals.take_latch();
        }
        Ok(outcome)
    }

    /// Fault-class conditions checked ahead of every event but `Reset`.
    pub fn fault_prechecks(&mut self) -> Result<(), TransitionError> {
        let state = self.ctx.state;
        if state == FsmState::Fault {
            return Ok(());
        }
        if let Some(latched) = self.signals.take_latch() {
            return Err(self.force_fault(FaultCause::InterlockDrop { state: latched }));
        }
        if let Some(cause) = predicates::check_interlock(state, self.hardware.read_interlock()) {
            return Err(self.force_fault(cause));
        }
        if state != FsmState::Safe {
            self.drift_check()?;
        }
        Ok(())
    }

    /// Explicit drift check. SAFE and FAULT have nothing bound to compare.
    pub fn check_drift(&mut self) -> Result<DriftReport, TransitionError> {
        match self.ctx.state {
            FsmState::Safe | FsmState::Fault => Ok(DriftReport::default()),
            _ => self.drift_check(),
        }
    }

    fn drift_check(&mut self) -> Result<DriftReport, TransitionError> {
        let Some(bound) = &self.bound else {
            return Ok(DriftReport::default());
        };
        let recomputed = self
            .source
            .load()
            .map_err(|e| e.to_string())
            .and_then(|(config, calibration)| {
                detect_drift(&config, &calibration, &bound.hashes).map_err(|e| e.to_string())
            });
        match recomputed {
            Ok(report) if report.is_drifted() => {
                Err(self.force_fault(FaultCause::ConfigDrift { report }))
            }
            Ok(report) => Ok(report),
            Err(detail) => Err(self.force_fault(FaultCause::ConfigUnverifiable { detail })),
        }
    }

    /// Expires the arming window when the session has sat in ARMED too long.
    pub fn tick(&mut self) -> Result<FsmState, TransitionError> {
        self.fault_prechecks()?;
        let expired = self.bound.as_ref().is_some_and(|b| {
            predicates::arming_window_expired(&self.ctx, &b.config, self.clock.monotonic_ms())
        });
        if expired {
            self.transition(EventInput::ArmTimeout)?;
        }
        Ok(self.ctx.state)
    }

    fn budget_view(&self, config: &DeviceConfig, now_ms: u64) -> SessionContext {
        let mut view = self.ctx.clone();
        Self::recompute_budget(&mut view, config, now_ms);
        view
    }

    fn recompute_budget(ctx: &mut SessionContext, config: &DeviceConfig, now_ms: u64) {
        let since = ctx.last_emit_end_ms.map(|end| now_ms.saturating_sub(end));
        ctx.budget.recompute_cooldown(since, config.safety.cooldown_ms);
    }

    fn bound_config(&self) -> Result<&DeviceConfig, TransitionError> {
        self.bound
            .as_ref()
            .map(|b| &b.config)
            .ok_or_else(|| TransitionError::PredicateFailed("session not initialized".into()))
    }

    fn decide(
        &self,
        input: &EventInput,
        now_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<(Decision, Option<BoundSnapshot>), TransitionError> {
        let decision = match input {
            EventInput::Initialize { start_health } => {
                let (config, calibration) = self.source.load().map_err(|e| {
                    TransitionError::PredicateFailed(format!("configuration unavailable: {e}"))
                })?;
                let decision = predicates::check_initialize(&config, &calibration, *start_health);
                if !decision.is_allowed() {
                    return Ok((decision, None));
                }
                let hashes = bind(&config, &calibration).map_err(|e| {
                    TransitionError::PredicateFailed(format!("hash binding failed: {e}"))
                })?;
                info!(
                    "[BINDER] bound config {} cal {} for {}",
                    short(&hashes.config_hash),
                    short(&hashes.cal_hash),
                    config.device_id
                );
                return Ok((
                    decision,
                    Some(BoundSnapshot {
                        config,
                        calibration,
                        hashes,
                    }),
                ));
            }
            EventInput::Reset { operator_confirmed } => predicates::check_reset(*operator_confirmed),
            EventInput::Stop { reason } => predicates::check_stop(&self.ctx, reason),
            EventInput::Arm => predicates::check_arm(
                &self.ctx,
                self.bound_config()?,
                self.hardware.read_interlock(),
                now_ms,
            ),
            EventInput::ConfirmArm { operator_confirmed } => predicates::check_confirm_arm(
                &self.ctx,
                self.bound_config()?,
                *operator_confirmed,
                self.hardware.read_interlock(),
                now_ms,
            ),
            EventInput::ArmTimeout => {
                predicates::check_arm_timeout(&self.ctx, self.bound_config()?, now_ms)
            }
            EventInput::EmitRequest {
                power_mw,
                duration_ms,
                duty_percent,
                measurement,
                ..
            } => {
                let config = self.bound_config()?;
                let view = self.budget_view(config, now_ms);
                predicates::check_emit(
                    &view,
                    config,
                    &EmitInputs {
                        interlock_safe: self.hardware.read_interlock(),
                        stop_requested: self.signals.stop_requested(),
                        power_mw: *power_mw,
                        duration_ms: *duration_ms,
                        duty_percent: *duty_percent,
                        measurement: measurement.as_ref(),
                        dark_voltage_v: self
                            .bound
                            .as_ref()
                            .map(|b| b.calibration.dark_voltage_v)
                            .unwrap_or(0.0),
                        now,
                    },
                )
            }
            EventInput::EmitComplete { elapsed_ms } => {
                predicates::check_emit_complete(&self.ctx, *elapsed_ms)
            }
        };
        Ok((decision, None))
    }

    fn apply(
        &self,
        input: &EventInput,
        to: FsmState,
        now_ms: u64,
        snapshot: Option<&BoundSnapshot>,
    ) -> Result<(SessionContext, Option<EmitEnvelope>), TransitionError> {
        let mut next = self.ctx.clone();
        next.state = to;
        let mut granted = None;
        let config = snapshot.map(|s| &s.config).or(self.bound.as_ref().map(|b| &b.config));

        match input {
            EventInput::Initialize { .. } => {
                if let Some(s) = snapshot {
                    next.hashes = Some(s.hashes.clone());
                    next.budget = BudgetEnvelope::full(&s.config.safety);
                }
                next.armed_at_ms = None;
                next.emission = None;
                next.last_emit_end_ms = None;
                next.fault = None;
            }
            EventInput::Arm => next.armed_at_ms = Some(now_ms),
            EventInput::ConfirmArm { .. } => {
                next.armed_at_ms = None;
                if let Some(config) = config {
                    Self::recompute_budget(&mut next, config, now_ms);
                }
            }
            EventInput::ArmTimeout => next.armed_at_ms = None,
            EventInput::EmitRequest {
                power_mw,
                duration_ms,
                duty_percent,
                pulse_ms,
                ..
            } => {
                let envelope = EmitEnvelope::grant(
                    *power_mw,
                    *duty_percent,
                    *duration_ms,
                    Some(*pulse_ms as f64),
                )
                .map_err(|e| TransitionError::PredicateFailed(e.to_string()))?;
                if let Some(config) = config {
                    Self::recompute_budget(&mut next, config, now_ms);
                }
                next.emission = Some(ActiveEmission {
                    granted: envelope,
                    started_at_ms: now_ms,
                });
                granted = Some(envelope);
            }
            EventInput::EmitComplete { elapsed_ms } => {
                charge_emission(&mut next, *elapsed_ms);
                next.last_emit_end_ms = Some(now_ms);
                if let Some(config) = config {
                    Self::recompute_budget(&mut next, config, now_ms);
                }
            }
            EventInput::Stop { .. } => {
                if let Some(started) = next.emission.as_ref().map(|e| e.started_at_ms) {
                    charge_emission(&mut next, now_ms.saturating_sub(started));
                    next.last_emit_end_ms = Some(now_ms);
                }
                next.armed_at_ms = None;
            }
            EventInput::Reset { .. } => {
                next.fault = None;
                next.armed_at_ms = None;
                next.emission = None;
            }
        }
        Ok((next, granted))
    }

    fn commit(
        &mut self,
        event: FsmEvent,
        from: FsmState,
        next: SessionContext,
        decision: &Decision,
        granted: Option<EmitEnvelope>,
        now: DateTime<Utc>,
    ) -> Result<Outcome, TransitionError> {
        let to = next.state;
        let payload = json!({
            "event": event,
            "from": from,
            "to": to,
            "decision": decision,
            "budget": next.budget,
            "granted": granted,
        });

        let record = self
            .trace
            .append(now, EventType::StateTransition, payload, next.hashes.as_ref())
            .map_err(|e| {
                error!("[FSM] trace append failed, {} -> {} not committed: {}", from, to, e);
                TransitionError::TraceWriteFailure(e)
            })?;

        self.ctx = next;
        self.signals.set_state(to);
        if to == FsmState::Emitting && !self.signals.fault_latched() {
            self.hardware.clear_cutoff();
        }
        info!("[FSM] {} --{}--> {} (seq {})", from, event, to, record.seq);
        for observer in &self.observers {
            observer.on_transition(from, to, event, &self.ctx);
        }
        Ok(Outcome {
            state: to,
            budget: self.ctx.budget,
            granted,
            record_seq: record.seq,
        })
    }

    fn expire_arming(&mut self, decision: &Decision, now_ms: u64, now: DateTime<Utc>) -> TransitionError {
        let from = self.ctx.state;
        let elapsed_ms = self
            .ctx
            .armed_at_ms
            .map(|at| now_ms.saturating_sub(at))
            .unwrap_or(0);
        let window_ms = self
            .bound
            .as_ref()
            .map(|b| b.config.safety.arming_window_ms)
            .unwrap_or(0);

        let mut next = self.ctx.clone();
        next.state = FsmState::Initialized;
        next.armed_at_ms = None;
        match self.commit(FsmEvent::ArmTimeout, from, next, decision, None, now) {
            Ok(_) => TransitionError::ArmingWindowExpired {
                elapsed_ms,
                window_ms,
            },
            Err(e) => e,
        }
    }

    pub fn force_fault(&mut self, cause: FaultCause) -> TransitionError {
        self.force_fault_timed(cause, None)
    }

    /// Forces FAULT regardless of the current state or pending request.
    ///
    /// Never rolled back: if the fault record cannot be written the state is
    /// still FAULT and the session is marked audit-degraded.
    pub fn force_fault_timed(
        &mut self,
        cause: FaultCause,
        cutoff_latency: Option<Duration>,
    ) -> TransitionError {
        self.hardware.cut_emission();
        let from = self.ctx.state;
        if from == FsmState::Fault {
            return TransitionError::Faulted(self.ctx.fault.clone().unwrap_or(cause));
        }

        let now_ms = self.clock.monotonic_ms();
        if let Some(started) = self.ctx.emission.as_ref().map(|e| e.started_at_ms) {
            charge_emission(&mut self.ctx, now_ms.saturating_sub(started));
            self.ctx.last_emit_end_ms = Some(now_ms);
        }
        self.ctx.state = FsmState::Fault;
        self.ctx.fault = Some(cause.clone());
        self.ctx.armed_at_ms = None;
        self.signals.set_state(FsmState::Fault);
        error!("[FSM] FAULT forced from {}: {}", from, cause);
        for observer in &self.observers {
            observer.on_fault(&cause, cutoff_latency);
        }

        let event_type = match cause {
            FaultCause::ConfigDrift { .. } => EventType::ConfigDrift,
            _ => EventType::Fault,
        };
        let payload = json!({
            "event": FsmEvent::Fault,
            "from": from,
            "to": FsmState::Fault,
            "cause": cause,
            "cutoff_latency_us": cutoff_latency.map(|d| d.as_micros() as u64),
        });
        if let Err(e) = self
            .trace
            .append(self.clock.now_utc(), event_type, payload, self.ctx.hashes.as_ref())
        {
            self.audit_degraded = true;
            error!("[FSM] fault record not written, audit degraded: {}", e);
            return TransitionError::TraceWriteFailure(e);
        }

        match cause {
            FaultCause::ConfigDrift { report } => TransitionError::ConfigDrift(report),
            other => TransitionError::Faulted(other),
        }
    }

    /// Records a rejection that happened outside `transition`, e.g. a request
    /// refused before it reached a guard.
    pub fn reject(&mut self, event: FsmEvent, err: TransitionError) -> TransitionError {
        self.note_rejection(event, &err);
        err
    }

    fn note_rejection(&mut self, event: FsmEvent, err: &TransitionError) {
        let state = self.ctx.state;
        self.ctx.last_rejection = Some(Rejection {
            event,
            state,
            reason: err.to_string(),
            at: self.clock.now_utc(),
        });
        match err {
            TransitionError::Faulted(_) | TransitionError::ConfigDrift(_) => {}
            _ => warn!("[FSM] {} rejected in {}: {}", event, state, err),
        }
        for observer in &self.observers {
            observer.on_rejection(state, event, err.kind());
        }
    }

    /// Stores new configuration through the source. SAFE only.
    pub fn edit_configuration(
        &mut self,
        config: &DeviceConfig,
        calibration: &Calibration,
    ) -> Result<(), TransitionError> {
        let state = self.ctx.state;
        if state != FsmState::Safe {
            warn!("[BINDER] configuration edit refused in {}", state);
            return Err(TransitionError::ConfigLocked(state));
        }
        config.validate()?;
        calibration.validate()?;
        self.source.store(config, calibration)?;
        info!("[BINDER] configuration updated via {}", self.source.describe());
        Ok(())
    }
}

/// Locks the engine. A poisoned lock means a caller panicked mid-transition,
/// so the session is forced into FAULT before anyone continues.
pub(crate) fn lock(engine: &Mutex<Engine>) -> MutexGuard<'_, Engine> {
    match engine.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            engine.clear_poison();
            let mut guard = poisoned.into_inner();
            guard.force_fault(FaultCause::Runtime {
                detail: "engine lock poisoned".into(),
            });
            guard
        }
    }
}
