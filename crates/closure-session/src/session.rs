//! One operator session: an isolated directory, one engine, its worker
//! threads (watchdog, poller, supervisor), and the bundle written at shutdown.

use crate::bundle::{self, BundleInputs, SessionManifest, TRACE_FILE};
use crate::engine::{self, Engine, EventInput, Outcome, SessionSignals, TransitionObserver};
use crate::error::{HardwareError, SessionError, TransitionError};
use crate::hardware::Hardware;
use crate::health;
use crate::pattern::{EmitRequest, PatternTiming};
use crate::poller::{self, PollerBinding, PollerConfig};
use crate::{supervisor, watchdog};
use chrono::{DateTime, Utc};
use closure_core::config::EncodingConfig;
use closure_core::context::Rejection;
use closure_core::state::target;
use closure_core::{
    BudgetEnvelope, Calibration, Clock, ConfigSource, DeviceConfig, DriftReport, FaultCause,
    FsmEvent, FsmState, HealthSnapshot, MeasurementEnvelope, RuntimeSettings, SessionContext,
    SystemClock,
};
use closure_trace::{TraceStore, TraceWriter};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

pub struct SessionOptions {
    /// Parent directory; each session creates `<root_dir>/<session_id>/`.
    pub root_dir: PathBuf,
    pub source: Arc<dyn ConfigSource>,
    pub hardware: Arc<dyn Hardware>,
    pub clock: Arc<dyn Clock>,
    pub runtime: RuntimeSettings,
    pub observers: Vec<Arc<dyn TransitionObserver>>,
}

impl SessionOptions {
    pub fn new(
        root_dir: impl Into<PathBuf>,
        source: Arc<dyn ConfigSource>,
        hardware: Arc<dyn Hardware>,
    ) -> Self {
        Self {
            root_dir: root_dir.into(),
            source,
            hardware,
            clock: Arc::new(SystemClock::new()),
            runtime: RuntimeSettings::default(),
            observers: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeSettings) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransitionObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

/// Operator-facing view of the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEnvelope {
    pub session_id: Uuid,
    pub state: FsmState,
    pub budget: BudgetEnvelope,
    pub config_hash: Option<String>,
    pub cal_hash: Option<String>,
    pub last_rejection: Option<Rejection>,
    pub fault: Option<FaultCause>,
    pub audit_degraded: bool,
    pub trace_records: u64,
    pub measurement: Option<MeasurementEnvelope>,
}

enum RunEnd {
    Completed,
    Interrupted,
    Hardware(HardwareError),
}

pub struct Session {
    id: Uuid,
    dir: PathBuf,
    started_at: DateTime<Utc>,
    engine: Arc<Mutex<Engine>>,
    hardware: Arc<dyn Hardware>,
    clock: Arc<dyn Clock>,
    signals: Arc<SessionSignals>,
    runtime: RuntimeSettings,
    trace_on_disk: bool,
    health_start: HealthSnapshot,
    binding: watch::Sender<Option<PollerBinding>>,
    latest: Arc<watch::Sender<Option<MeasurementEnvelope>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Session {
    /// Opens a session whose trace lives in `<dir>/trace.jsonl`.
    pub fn open(opts: SessionOptions) -> Result<Self, SessionError> {
        let id = Uuid::new_v4();
        let dir = Self::create_dir(&opts.root_dir, id)?;
        let trace = TraceWriter::open_file(&dir.join(TRACE_FILE))?;
        Self::start(id, dir, trace, true, opts)
    }

    /// Opens a session with a caller-supplied trace store. The bundle then
    /// lists the trace as missing.
    pub fn open_with_store(
        opts: SessionOptions,
        store: Box<dyn TraceStore>,
    ) -> Result<Self, SessionError> {
        let id = Uuid::new_v4();
        let dir = Self::create_dir(&opts.root_dir, id)?;
        Self::start(id, dir, TraceWriter::new(store), false, opts)
    }

    fn create_dir(root: &Path, id: Uuid) -> Result<PathBuf, SessionError> {
        let dir = root.join(id.to_string());
        std::fs::create_dir_all(&dir)
            .map_err(|e| SessionError::io(format!("create {}", dir.display()), e))?;
        Ok(dir)
    }

    fn start(
        id: Uuid,
        dir: PathBuf,
        trace: TraceWriter,
        trace_on_disk: bool,
        opts: SessionOptions,
    ) -> Result<Self, SessionError> {
        let SessionOptions {
            source,
            hardware,
            clock,
            runtime,
            observers,
            ..
        } = opts;

        let signals = Arc::new(SessionSignals::new());
        let health_start = health::capture(hardware.as_ref(), &dir, FsmState::Safe, clock.as_ref());
        let trace_desc = trace.describe();
        let engine = Arc::new(Mutex::new(Engine::new(
            SessionContext::new(id),
            trace,
            source,
            hardware.clone(),
            clock.clone(),
            signals.clone(),
            observers,
        )));

        let (binding, binding_rx) = watch::channel(None);
        let (latest, _) = watch::channel(None);
        let latest = Arc::new(latest);

        let mut workers = Vec::with_capacity(3);
        let spawned = watchdog::spawn(
            engine.clone(),
            hardware.clone(),
            signals.clone(),
            Duration::from_millis(runtime.watchdog_period_ms.max(1)),
        )
        .and_then(|handle| {
            workers.push(handle);
            poller::spawn(
                hardware.clone(),
                clock.clone(),
                signals.clone(),
                binding_rx,
                latest.clone(),
                PollerConfig {
                    interval: Duration::from_millis(runtime.poll_interval_ms.max(1)),
                    samples_per_poll: runtime.samples_per_poll.max(1),
                },
            )
        })
        .and_then(|handle| {
            workers.push(handle);
            supervisor::spawn(
                engine.clone(),
                signals.clone(),
                Duration::from_millis(runtime.supervise_interval_ms.max(1)),
            )
        });
        match spawned {
            Ok(handle) => workers.push(handle),
            Err(e) => {
                signals.request_shutdown();
                return Err(SessionError::io("spawn session workers", e));
            }
        }

        info!(
            "[FSM] session {} opened in {} (trace {}, start health {:?})",
            id,
            dir.display(),
            trace_desc,
            health_start.overall
        );
        Ok(Self {
            id,
            dir,
            started_at: clock.now_utc(),
            engine,
            hardware,
            clock,
            signals,
            runtime,
            trace_on_disk,
            health_start,
            binding,
            latest,
            workers: Mutex::new(workers),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn health_start(&self) -> &HealthSnapshot {
        &self.health_start
    }

    fn ensure_open(&self) -> Result<(), TransitionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransitionError::Closed);
        }
        Ok(())
    }

    fn event(&self, input: EventInput) -> Result<Outcome, TransitionError> {
        self.ensure_open()?;
        engine::lock(&self.engine).transition(input)
    }

    /// SAFE → INITIALIZED: loads, validates and hash-binds the configuration.
    pub fn initialize(&self) -> Result<Outcome, TransitionError> {
        self.ensure_open()?;
        let mut engine = engine::lock(&self.engine);
        let outcome = engine.transition(EventInput::Initialize {
            start_health: self.health_start.overall,
        })?;
        if let Some(bound) = engine.bound() {
            self.binding.send_replace(Some(PollerBinding {
                calibration: bound.calibration.clone(),
                adc_full_scale_v: bound.config.hardware.adc_full_scale_v,
            }));
        }
        Ok(outcome)
    }

    pub fn arm(&self) -> Result<Outcome, TransitionError> {
        self.event(EventInput::Arm)
    }

    pub fn confirm_arm(&self, operator_confirmed: bool) -> Result<Outcome, TransitionError> {
        self.event(EventInput::ConfirmArm { operator_confirmed })
    }

    pub fn reset(&self, operator_confirmed: bool) -> Result<Outcome, TransitionError> {
        self.event(EventInput::Reset { operator_confirmed })
    }

    /// Fault pre-checks plus arming-window expiry.
    pub fn tick(&self) -> Result<FsmState, TransitionError> {
        self.ensure_open()?;
        engine::lock(&self.engine).tick()
    }

    pub fn check_drift(&self) -> Result<DriftReport, TransitionError> {
        self.ensure_open()?;
        engine::lock(&self.engine).check_drift()
    }

    pub fn edit_configuration(
        &self,
        config: &DeviceConfig,
        calibration: &Calibration,
    ) -> Result<(), TransitionError> {
        self.ensure_open()?;
        engine::lock(&self.engine).edit_configuration(config, calibration)
    }

    /// Stops from any non-FAULT active state. The output is cut before the
    /// engine lock is taken.
    pub fn stop(&self, reason: &str) -> Result<Outcome, TransitionError> {
        self.ensure_open()?;
        self.signals.request_stop();
        self.hardware.cut_emission();
        let result = engine::lock(&self.engine).transition(EventInput::Stop {
            reason: reason.to_string(),
        });
        self.signals.clear_stop();
        result
    }

    /// Latest published measurement envelope, if any.
    pub fn current_measurement(&self) -> Option<MeasurementEnvelope> {
        self.latest.borrow().clone()
    }

    /// Takes one sampling burst now instead of waiting for the poller.
    pub fn sample_now(&self) -> Option<MeasurementEnvelope> {
        let bound = self.binding.borrow().clone()?;
        let envelope = poller::poll_once(
            self.hardware.as_ref(),
            self.clock.as_ref(),
            &bound,
            self.runtime.samples_per_poll.max(1),
        )?;
        self.latest.send_replace(Some(envelope.clone()));
        Some(envelope)
    }

    pub fn status(&self) -> StatusEnvelope {
        let engine = engine::lock(&self.engine);
        let ctx = engine.context();
        StatusEnvelope {
            session_id: self.id,
            state: ctx.state,
            budget: ctx.budget,
            config_hash: ctx.config_hash().map(str::to_string),
            cal_hash: ctx.cal_hash().map(str::to_string),
            last_rejection: ctx.last_rejection.clone(),
            fault: ctx.fault.clone(),
            audit_degraded: engine.audit_degraded(),
            trace_records: engine.trace_head().1,
            measurement: self.current_measurement(),
        }
    }

    /// EMIT_READY → EMITTING, runs the pattern, then EMITTING → EMIT_READY.
    ///
    /// The pattern runs outside the engine lock so stop and the watchdog can
    /// interrupt it. An interrupted run returns the state it was left in.
    pub fn emit(&self, request: &EmitRequest) -> Result<Outcome, TransitionError> {
        self.ensure_open()?;
        let (timing, granted) = {
            let mut engine = engine::lock(&self.engine);
            if let Err(reason) = request.pattern.validate() {
                // Fault pre-checks and graph legality outrank a bad pattern.
                let err = match engine.fault_prechecks() {
                    Err(e) => e,
                    Ok(()) if target(engine.state(), FsmEvent::EmitRequest).is_none() => {
                        TransitionError::IllegalTransition {
                            from: engine.state(),
                            event: FsmEvent::EmitRequest,
                        }
                    }
                    Ok(()) => TransitionError::PredicateFailed(reason),
                };
                return Err(engine.reject(FsmEvent::EmitRequest, err));
            }
            let encoding = engine
                .bound()
                .map(|b| b.config.encoding.clone())
                .unwrap_or(EncodingConfig {
                    pulse_duration_ms: 0,
                    gap_duration_ms: 0,
                });
            let timing = request.pattern.timing(&encoding);
            let outcome = engine.transition(EventInput::EmitRequest {
                power_mw: request.power_mw,
                duration_ms: timing.duration_ms,
                duty_percent: timing.duty_percent,
                pulse_ms: timing.pulse_ms,
                pattern: json!({
                    "encoding": request.pattern,
                    "pulses": timing.pulses,
                    "gaps": timing.gaps,
                    "pulse_ms": timing.pulse_ms,
                    "gap_ms": timing.gap_ms,
                }),
                measurement: self.current_measurement(),
            })?;
            (timing, outcome.granted)
        };

        let started = self.clock.monotonic_ms();
        let run = self.run_pattern(&timing);
        let elapsed_ms = self.clock.monotonic_ms().saturating_sub(started);
        if let Err(e) = self.hardware.set_output(false) {
            warn!("[FSM] output off after pattern failed: {}", e);
        }

        let mut engine = engine::lock(&self.engine);
        match engine.state() {
            FsmState::Emitting => {}
            FsmState::Fault => {
                let cause = engine.context().fault.clone().unwrap_or(FaultCause::Runtime {
                    detail: "fault without recorded cause".into(),
                });
                return Err(TransitionError::Faulted(cause));
            }
            FsmState::Safe => {
                let (_, record_seq) = engine.trace_head();
                return Ok(Outcome {
                    state: FsmState::Safe,
                    budget: engine.context().budget,
                    granted,
                    record_seq,
                });
            }
            other => {
                return Err(engine.force_fault(FaultCause::InvalidTransition {
                    detail: format!("emission runner found session in {other}"),
                }));
            }
        }

        match run {
            RunEnd::Completed => engine.transition(EventInput::EmitComplete { elapsed_ms }),
            RunEnd::Interrupted => {
                // A latch or interlock drop not yet committed by the watchdog.
                engine.fault_prechecks()?;
                let (_, record_seq) = engine.trace_head();
                Ok(Outcome {
                    state: engine.state(),
                    budget: engine.context().budget,
                    granted,
                    record_seq,
                })
            }
            RunEnd::Hardware(e) => Err(engine.force_fault(FaultCause::Runtime {
                detail: e.to_string(),
            })),
        }
    }

    fn interrupted(&self) -> bool {
        self.signals.stop_requested()
            || self.signals.fault_latched()
            || self.signals.shutting_down()
            || self.signals.state() != FsmState::Emitting
    }

    fn run_pattern(&self, timing: &PatternTiming) -> RunEnd {
        let pulse = Duration::from_millis(timing.pulse_ms);
        let gap = Duration::from_millis(timing.gap_ms);
        for on in &timing.steps {
            if self.interrupted() {
                return RunEnd::Interrupted;
            }
            if !*on {
                self.clock.sleep(gap);
                continue;
            }
            if let Err(e) = self.hardware.set_output(true) {
                return if self.interrupted() {
                    RunEnd::Interrupted
                } else {
                    RunEnd::Hardware(e)
                };
            }
            self.clock.sleep(pulse);
            if let Err(e) = self.hardware.set_output(false) {
                return RunEnd::Hardware(e);
            }
        }
        RunEnd::Completed
    }

    fn join_workers(&self) {
        let handles = match self.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        let deadline = Instant::now() + Duration::from_millis(self.runtime.join_timeout_ms);
        for handle in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if !handle.is_finished() {
                warn!(
                    "[FSM] {} did not stop within {} ms, detaching",
                    name, self.runtime.join_timeout_ms
                );
                continue;
            }
            if handle.join().is_err() {
                warn!("[FSM] {} panicked", name);
            }
        }
    }

    /// Stops the workers, returns the device to SAFE and seals the bundle.
    /// A second call returns [`SessionError::Closed`].
    pub fn shutdown(&self) -> Result<SessionManifest, SessionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        info!("[FSM] session {} shutting down", self.id);
        self.signals.request_shutdown();
        self.join_workers();
        self.hardware.cut_emission();

        let mut engine = engine::lock(&self.engine);
        if engine.state().is_hot() || engine.state() == FsmState::Initialized {
            if let Err(e) = engine.transition(EventInput::Stop {
                reason: "session shutdown".into(),
            }) {
                warn!("[FSM] shutdown stop not committed: {}", e);
            }
        }

        let health_end =
            health::capture(self.hardware.as_ref(), &self.dir, engine.state(), self.clock.as_ref());
        let (last_record_hash, record_count) = engine.trace_head();
        let ctx = engine.context();
        let inputs = BundleInputs {
            session_id: self.id,
            started_at: self.started_at,
            ended_at: self.clock.now_utc(),
            final_state: ctx.state,
            fault: ctx.fault.as_ref(),
            bound: engine.bound().map(|b| (&b.config, &b.calibration)),
            last_record_hash: &last_record_hash,
            record_count,
            trace_on_disk: self.trace_on_disk,
            audit_degraded: engine.audit_degraded(),
            health_start: &self.health_start,
            health_end: &health_end,
        };
        Ok(bundle::assemble(&self.dir, &inputs)?)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.signals.request_shutdown();
        self.hardware.cut_emission();
    }
}
