use closure_core::fs_atomic::atomic_write;
use closure_core::{
    bind, Calibration, Clock, ConfigSource, DeviceConfig, FaultCause, FileConfigSource, FsmEvent,
    FsmState, ManualClock, MemoryConfigSource, RuntimeSettings, SystemClock,
};
use closure_session::bundle::{TRACE_ENTRY, TRACE_FILE};
use closure_session::{
    verify_bundle, EmitRequest, FileEntry, GeometricShape, Hardware, PatternSpec, Session,
    SessionOptions, SimulatedHardware, TransitionError,
};
use closure_trace::{read_trace, EventType, MemoryStore, TraceLine, TraceRecord};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn square(size: usize, power_mw: f64) -> EmitRequest {
    EmitRequest {
        pattern: PatternSpec::Geometric {
            shape: GeometricShape::Square,
            size,
        },
        power_mw,
    }
}

fn memory_source() -> Arc<MemoryConfigSource> {
    Arc::new(MemoryConfigSource::new(
        DeviceConfig::simulated_default(),
        Calibration::simulated_default(),
    ))
}

fn options(root: &Path, source: Arc<dyn ConfigSource>, hw: Arc<SimulatedHardware>) -> SessionOptions {
    SessionOptions::new(root, source, hw).with_clock(Arc::new(ManualClock::default()))
}

fn trace_records(dir: &Path) -> Vec<TraceRecord> {
    read_trace(&dir.join(TRACE_FILE))
        .unwrap()
        .into_iter()
        .filter_map(|line| match line {
            TraceLine::Record { record, .. } => Some(record),
            TraceLine::Unparseable { .. } => None,
        })
        .collect()
}

fn wait_for_state(session: &Session, state: FsmState) -> bool {
    for _ in 0..2000 {
        if session.status().state == state {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn happy_path_session_seals_a_verifiable_bundle() {
    let root = tempfile::tempdir().unwrap();
    let hw = Arc::new(SimulatedHardware::default());
    let session = Session::open(options(root.path(), memory_source(), hw.clone())).unwrap();

    session.initialize().unwrap();
    let bound = session.status().config_hash.unwrap();
    session.arm().unwrap();
    session.confirm_arm(true).unwrap();
    let outcome = session.emit(&square(12, 0.8)).unwrap();
    assert_eq!(outcome.state, FsmState::EmitReady);
    assert_eq!(hw.pulse_count(), 6);
    assert!(!hw.output_enabled());

    let status = session.status();
    assert_eq!(status.trace_records, 5);
    assert_eq!(status.config_hash.as_deref(), Some(bound.as_str()));
    assert_eq!(status.budget.remaining_duty_percent, 50.0);

    let manifest = session.shutdown().unwrap();
    assert_eq!(manifest.final_state, FsmState::Safe);
    assert_eq!(manifest.record_count, 6);
    assert_eq!(manifest.config_hash.as_deref(), Some(bound.as_str()));
    assert!(!manifest.audit_degraded);

    let records = trace_records(session.dir());
    assert!(records
        .iter()
        .all(|r| r.config_hash.as_deref() == Some(bound.as_str())));

    let report = verify_bundle(session.dir());
    assert!(report.valid, "{:?}", report.problems);
    assert_eq!(report.root_hash.as_deref(), Some(manifest.root_hash.as_str()));
}

#[test]
fn interlock_drop_after_arming_faults_within_latency_target() {
    let root = tempfile::tempdir().unwrap();
    let hw = Arc::new(SimulatedHardware::default());
    let runtime = RuntimeSettings::default();
    let target = Duration::from_millis(runtime.latency_target_ms);
    let session = Session::open(
        options(root.path(), memory_source(), hw.clone()).with_runtime(runtime),
    )
    .unwrap();

    session.initialize().unwrap();
    session.arm().unwrap();
    hw.set_interlock(false);

    assert!(wait_for_state(&session, FsmState::Fault));
    let latency = hw.cutoff_latency().unwrap();
    assert!(latency < target, "cutoff took {latency:?}");
    assert!(matches!(
        session.status().fault,
        Some(FaultCause::InterlockDrop {
            state: FsmState::Armed
        })
    ));

    let err = session.emit(&square(4, 0.5)).unwrap_err();
    assert!(matches!(err, TransitionError::IllegalTransition { .. }));
    assert!(!hw.output_enabled());

    let manifest = session.shutdown().unwrap();
    assert_eq!(manifest.final_state, FsmState::Fault);
    assert!(manifest.fault_reason.is_some());

    let records = trace_records(session.dir());
    let fault = records.last().unwrap();
    assert_eq!(fault.event_type, EventType::Fault);
    assert_eq!(fault.payload["from"], "ARMED");
    assert!(verify_bundle(session.dir()).valid);
}

fn file_source(dir: &Path, config: &DeviceConfig) -> (PathBuf, Arc<FileConfigSource>) {
    let config_path = dir.join("device_config.json");
    let source = Arc::new(FileConfigSource::new(&config_path, &dir.join("calibration.yaml")));
    source.store(config, &Calibration::simulated_default()).unwrap();
    (config_path, source)
}

#[test]
fn on_disk_config_edit_is_recorded_as_drift() {
    let root = tempfile::tempdir().unwrap();
    let (config_path, source) = file_source(root.path(), &DeviceConfig::simulated_default());

    let hw = Arc::new(SimulatedHardware::default());
    let session = Session::open(options(root.path(), source, hw.clone())).unwrap();
    session.initialize().unwrap();
    session.arm().unwrap();
    let bound = bind(&DeviceConfig::simulated_default(), &Calibration::simulated_default()).unwrap();

    let mut edited = DeviceConfig::simulated_default();
    edited.safety.max_emit_ms = 9000.0;
    atomic_write(&config_path, &serde_json::to_vec_pretty(&edited).unwrap()).unwrap();
    let moved = bind(&edited, &Calibration::simulated_default()).unwrap();

    // Nobody calls into the session: the supervisor tick finds the edit.
    assert!(wait_for_state(&session, FsmState::Fault));
    assert!(matches!(session.status().fault, Some(FaultCause::ConfigDrift { .. })));
    assert!(!hw.output_enabled());

    let drift = trace_records(session.dir()).pop().unwrap();
    assert_eq!(drift.event_type, EventType::ConfigDrift);
    assert_eq!(drift.config_hash.as_deref(), Some(bound.config_hash.as_str()));
    assert_eq!(drift.cal_hash.as_deref(), Some(bound.cal_hash.as_str()));
    let report = &drift.payload["cause"]["report"]["config"];
    assert_eq!(report["bound"], bound.config_hash);
    assert_eq!(report["recomputed"], moved.config_hash);

    session.shutdown().unwrap();
    assert!(verify_bundle(session.dir()).valid);
}

#[test]
fn unattended_session_expires_arming_and_catches_drift() {
    let root = tempfile::tempdir().unwrap();
    let mut config = DeviceConfig::simulated_default();
    config.safety.arming_window_ms = 50;
    let (config_path, source) = file_source(root.path(), &config);

    let hw = Arc::new(SimulatedHardware::default());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let session = Session::open(
        SessionOptions::new(root.path(), source, hw.clone()).with_clock(clock),
    )
    .unwrap();
    session.initialize().unwrap();
    session.arm().unwrap();

    assert!(wait_for_state(&session, FsmState::Initialized));
    let expiry = trace_records(session.dir()).pop().unwrap();
    assert_eq!(expiry.payload["event"], serde_json::json!(FsmEvent::ArmTimeout));
    assert_eq!(expiry.payload["from"], "ARMED");

    session.arm().unwrap();
    config.safety.max_emit_ms = 4000.0;
    atomic_write(&config_path, &serde_json::to_vec_pretty(&config).unwrap()).unwrap();
    assert!(wait_for_state(&session, FsmState::Fault));
    assert!(matches!(session.status().fault, Some(FaultCause::ConfigDrift { .. })));

    let manifest = session.shutdown().unwrap();
    assert_eq!(manifest.final_state, FsmState::Fault);
    assert!(verify_bundle(session.dir()).valid);
}

#[test]
fn interlock_drop_in_emit_ready_faults_within_latency_target() {
    let root = tempfile::tempdir().unwrap();
    let hw = Arc::new(SimulatedHardware::default());
    let target = Duration::from_millis(RuntimeSettings::default().latency_target_ms);
    let session = Session::open(options(root.path(), memory_source(), hw.clone())).unwrap();

    session.initialize().unwrap();
    session.arm().unwrap();
    session.confirm_arm(true).unwrap();
    hw.set_interlock(false);

    assert!(wait_for_state(&session, FsmState::Fault));
    assert!(matches!(
        session.status().fault,
        Some(FaultCause::InterlockDrop {
            state: FsmState::EmitReady
        })
    ));
    assert!(!hw.output_enabled());
    let latency = hw.cutoff_latency().unwrap();
    assert!(latency < target, "cutoff took {latency:?}");

    let fault = trace_records(session.dir()).pop().unwrap();
    assert_eq!(fault.event_type, EventType::Fault);
    assert_eq!(fault.payload["from"], "EMIT_READY");
    session.shutdown().unwrap();
}

#[test]
fn interlock_drop_while_emitting_cuts_the_running_pattern() {
    let root = tempfile::tempdir().unwrap();
    let hw = Arc::new(SimulatedHardware::default());
    let target = Duration::from_millis(RuntimeSettings::default().latency_target_ms);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let session = Session::open(
        SessionOptions::new(root.path(), memory_source(), hw.clone()).with_clock(clock),
    )
    .unwrap();
    session.initialize().unwrap();
    session.arm().unwrap();
    session.confirm_arm(true).unwrap();

    let long = square(200, 0.5);
    let result = thread::scope(|scope| {
        let runner = scope.spawn(|| session.emit(&long));
        assert!(wait_for_state(&session, FsmState::Emitting));
        thread::sleep(Duration::from_millis(30));
        hw.set_interlock(false);
        runner.join().unwrap()
    });

    assert!(matches!(
        result,
        Err(TransitionError::Faulted(FaultCause::InterlockDrop {
            state: FsmState::Emitting
        }))
    ));
    assert!(!hw.output_enabled());
    assert!(hw.pulse_count() < 100);
    let latency = hw.cutoff_latency().unwrap();
    assert!(latency < target, "cutoff took {latency:?}");

    let status = session.status();
    assert_eq!(status.state, FsmState::Fault);
    assert!(status.budget.remaining_emit_ms < 5000.0);
    let manifest = session.shutdown().unwrap();
    assert_eq!(manifest.final_state, FsmState::Fault);
    assert!(verify_bundle(session.dir()).valid);
}

#[test]
fn concurrent_sessions_produce_independent_bundles() {
    let root = tempfile::tempdir().unwrap();
    let sessions: Vec<Session> = (0..2)
        .map(|_| {
            Session::open(options(
                root.path(),
                memory_source(),
                Arc::new(SimulatedHardware::default()),
            ))
            .unwrap()
        })
        .collect();
    assert_ne!(sessions[0].id(), sessions[1].id());

    thread::scope(|scope| {
        for session in &sessions {
            scope.spawn(move || {
                session.initialize().unwrap();
                session.arm().unwrap();
                session.confirm_arm(true).unwrap();
                session.emit(&square(8, 0.6)).unwrap();
                session.shutdown().unwrap();
            });
        }
    });

    for session in &sessions {
        let report = verify_bundle(session.dir());
        assert!(report.valid, "{:?}", report.problems);
        assert_eq!(report.session_id, Some(session.id()));
    }

    let trace = sessions[0].dir().join(TRACE_FILE);
    let text = std::fs::read_to_string(&trace).unwrap();
    std::fs::write(&trace, text.replacen("\"ARMED\"", "\"SAFE\"", 1)).unwrap();
    let tampered = verify_bundle(sessions[0].dir());
    assert!(!tampered.valid);
    assert!(
        tampered.problems.iter().any(|p| p.contains("integrity violated")),
        "{:?}",
        tampered.problems
    );
    assert!(verify_bundle(sessions[1].dir()).valid);
}

#[test]
fn duty_budget_exhausts_after_two_half_duty_emits() {
    let root = tempfile::tempdir().unwrap();
    let hw = Arc::new(SimulatedHardware::default());
    let session = Session::open(options(root.path(), memory_source(), hw)).unwrap();
    session.initialize().unwrap();
    session.arm().unwrap();
    session.confirm_arm(true).unwrap();

    session.emit(&square(12, 0.8)).unwrap();
    session.emit(&square(12, 0.8)).unwrap();
    let err = session.emit(&square(12, 0.8)).unwrap_err();
    let TransitionError::PredicateFailed(reason) = &err else {
        panic!("unexpected {err}");
    };
    assert!(reason.contains("duty"), "{reason}");

    let status = session.status();
    assert_eq!(status.state, FsmState::EmitReady);
    assert_eq!(status.budget.remaining_duty_percent, 0.0);
    assert!(status.last_rejection.unwrap().reason.contains("duty"));
    session.shutdown().unwrap();
}

#[test]
fn fractional_duty_emit_seals_a_verifiable_bundle() {
    let root = tempfile::tempdir().unwrap();
    let hw = Arc::new(SimulatedHardware::default());
    let session = Session::open(options(root.path(), memory_source(), hw)).unwrap();
    session.initialize().unwrap();
    session.arm().unwrap();
    session.confirm_arm(true).unwrap();

    // 14 pulses in 29 steps: a duty with no short decimal form.
    let circle = EmitRequest {
        pattern: PatternSpec::Geometric {
            shape: GeometricShape::Circle,
            size: 29,
        },
        power_mw: 0.7,
    };
    let outcome = session.emit(&circle).unwrap();
    assert_eq!(outcome.state, FsmState::EmitReady);
    assert!(outcome.budget.remaining_duty_percent.fract() != 0.0);

    session.shutdown().unwrap();
    let report = verify_bundle(session.dir());
    assert!(report.valid, "{:?}", report.problems);
}

#[test]
fn oversize_pattern_from_safe_is_an_illegal_transition() {
    let root = tempfile::tempdir().unwrap();
    let hw = Arc::new(SimulatedHardware::default());
    let session = Session::open(options(root.path(), memory_source(), hw.clone())).unwrap();

    let oversize = EmitRequest {
        pattern: PatternSpec::Geometric {
            shape: GeometricShape::Spiral,
            size: 4096,
        },
        power_mw: 0.5,
    };
    let err = session.emit(&oversize).unwrap_err();
    assert!(
        matches!(
            err,
            TransitionError::IllegalTransition {
                from: FsmState::Safe,
                event: FsmEvent::EmitRequest
            }
        ),
        "{err}"
    );
    assert_eq!(hw.pulse_count(), 0);

    session.initialize().unwrap();
    session.arm().unwrap();
    session.confirm_arm(true).unwrap();
    let err = session.emit(&oversize).unwrap_err();
    assert!(matches!(err, TransitionError::PredicateFailed(_)), "{err}");
    session.shutdown().unwrap();
}

#[test]
fn stop_interrupts_a_running_pattern() {
    let root = tempfile::tempdir().unwrap();
    let hw = Arc::new(SimulatedHardware::default());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let session = Session::open(
        SessionOptions::new(root.path(), memory_source(), hw.clone()).with_clock(clock),
    )
    .unwrap();
    session.initialize().unwrap();
    session.arm().unwrap();
    session.confirm_arm(true).unwrap();

    // 200 steps at 10 ms each, two seconds if left alone.
    let long = square(200, 0.5);
    let outcome = thread::scope(|scope| {
        let runner = scope.spawn(|| session.emit(&long));
        assert!(wait_for_state(&session, FsmState::Emitting));
        thread::sleep(Duration::from_millis(30));
        session.stop("operator").unwrap();
        runner.join().unwrap()
    })
    .unwrap();

    assert_eq!(outcome.state, FsmState::Safe);
    assert!(hw.pulse_count() < 100);
    assert!(!hw.output_enabled());
    assert!(outcome.budget.remaining_emit_ms < 5000.0);
    session.shutdown().unwrap();
}

#[test]
fn memory_trace_bundle_lists_trace_as_missing() {
    let root = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let session = Session::open_with_store(
        options(
            root.path(),
            memory_source(),
            Arc::new(SimulatedHardware::default()),
        ),
        Box::new(store.clone()),
    )
    .unwrap();
    session.initialize().unwrap();

    let manifest = session.shutdown().unwrap();
    assert!(matches!(
        manifest.files.get(TRACE_ENTRY),
        Some(FileEntry::Missing { .. })
    ));
    assert_eq!(store.lines().len() as u64, manifest.record_count);

    let report = verify_bundle(session.dir());
    assert!(!report.valid);
    assert!(report.problems.iter().any(|p| p.contains("trace not included")));
}

#[test]
fn shutdown_is_final() {
    let root = tempfile::tempdir().unwrap();
    let session = Session::open(options(
        root.path(),
        memory_source(),
        Arc::new(SimulatedHardware::default()),
    ))
    .unwrap();
    session.shutdown().unwrap();
    assert!(session.shutdown().is_err());
    assert!(matches!(session.initialize(), Err(TransitionError::Closed)));

    let manifest = verify_bundle(session.dir());
    assert!(manifest.valid, "{:?}", manifest.problems);
    assert_eq!(manifest.chain.unwrap().records, 0);
}

#[test]
fn poller_publishes_measurements_once_bound() {
    let root = tempfile::tempdir().unwrap();
    let hw = Arc::new(SimulatedHardware::default());
    let session = Session::open(options(root.path(), memory_source(), hw)).unwrap();
    assert!(session.sample_now().is_none());

    session.initialize().unwrap();
    let mut published = None;
    for _ in 0..1000 {
        published = session.current_measurement();
        if published.is_some() {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    let published = published.unwrap();
    assert!(published.is_clean());
    assert_eq!(
        session.status().measurement.map(|m| m.sample_count),
        Some(published.sample_count)
    );

    let sampled = session.sample_now().unwrap();
    let wl = sampled.wavelength_nm.unwrap();
    assert!(wl.min < 532.0 && wl.max > 532.0, "{wl:?}");
    session.shutdown().unwrap();
}
