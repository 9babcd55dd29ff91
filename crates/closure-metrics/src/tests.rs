use crate::ClosureMetrics;
use closure_core::{Calibration, DeviceConfig, FaultCause, FsmState, ManualClock, MemoryConfigSource};
use closure_session::{Session, SessionOptions, SimulatedHardware, TransitionObserver};
use std::sync::Arc;
use std::time::Duration;

fn sample_line<'a>(text: &'a str, metric: &str, labels: &[&str]) -> Option<&'a str> {
    text.lines().find(|line| {
        line.starts_with(metric) && labels.iter().all(|label| line.contains(label))
    })
}

#[test]
fn session_activity_shows_up_in_exposition() {
    let root = tempfile::tempdir().unwrap();
    let metrics = Arc::new(ClosureMetrics::new().unwrap());
    let session = Session::open(
        SessionOptions::new(
            root.path(),
            Arc::new(MemoryConfigSource::new(
                DeviceConfig::simulated_default(),
                Calibration::simulated_default(),
            )),
            Arc::new(SimulatedHardware::default()),
        )
        .with_clock(Arc::new(ManualClock::default()))
        .with_observer(metrics.clone()),
    )
    .unwrap();

    session.initialize().unwrap();
    session.arm().unwrap();
    assert!(session.arm().is_err());
    session.shutdown().unwrap();

    let text = metrics.render().unwrap();
    let armed = sample_line(
        &text,
        "closure_transitions_total{",
        &["from=\"INITIALIZED\"", "to=\"ARMED\"", "event=\"arm\""],
    )
    .unwrap();
    assert!(armed.ends_with(" 1"), "{armed}");

    let refused = sample_line(
        &text,
        "closure_rejections_total{",
        &["event=\"arm\"", "kind=\"illegal_transition\""],
    )
    .unwrap();
    assert!(refused.ends_with(" 1"), "{refused}");

    let safe = sample_line(&text, "closure_state{", &["state=\"SAFE\""]).unwrap();
    assert!(safe.ends_with(" 1"), "{safe}");
    assert!(sample_line(&text, "closure_budget_remaining{", &["resource=\"emit_ms\""]).is_some());
}

#[test]
fn faults_count_by_cause_and_record_latency() {
    let metrics = ClosureMetrics::new().unwrap();
    metrics.on_fault(
        &FaultCause::InterlockDrop {
            state: FsmState::Armed,
        },
        Some(Duration::from_micros(800)),
    );
    metrics.on_fault(
        &FaultCause::Runtime {
            detail: "probe".into(),
        },
        None,
    );

    assert_eq!(
        metrics
            .faults_total
            .with_label_values(&["interlock_drop"])
            .get(),
        1
    );
    assert_eq!(metrics.faults_total.with_label_values(&["runtime"]).get(), 1);
    assert_eq!(metrics.interlock_cutoff_seconds.get_sample_count(), 1);
    assert_eq!(metrics.state.with_label_values(&["FAULT"]).get(), 1.0);
}

#[test]
fn instances_do_not_collide() {
    let a = ClosureMetrics::new().unwrap();
    let b = ClosureMetrics::new().unwrap();
    a.rejections_total
        .with_label_values(&["arm", "predicate_failed"])
        .inc();
    assert_eq!(
        b.rejections_total
            .with_label_values(&["arm", "predicate_failed"])
            .get(),
        0
    );
}
