//! Interlock watchdog.
//!
//! Runs on its own thread and never waits on the engine before cutting
//! emission. It works from the lock-free state mirror and the fault latch,
//! then queues behind the engine lock to commit the FAULT record.

use crate::engine::{self, Engine, SessionSignals};
use crate::hardware::Hardware;
use closure_core::{FaultCause, FsmState};
use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub(crate) fn spawn(
    engine: Arc<Mutex<Engine>>,
    hardware: Arc<dyn Hardware>,
    signals: Arc<SessionSignals>,
    period: Duration,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("closure-watchdog".into())
        .spawn(move || run(&engine, hardware.as_ref(), &signals, period))
}

fn run(engine: &Mutex<Engine>, hardware: &dyn Hardware, signals: &SessionSignals, period: Duration) {
    info!("[WATCHDOG] started, period {:?}", period);
    while !signals.shutting_down() {
        let state = signals.state();
        if state.is_hot() && !hardware.read_interlock() {
            let detected = Instant::now();
            // Latch first: an EMITTING commit skips clear_cutoff once latched.
            let fresh = signals.latch_fault(state);
            hardware.cut_emission();
            let latency = detected.elapsed();
            if fresh {
                warn!(
                    "[WATCHDOG] interlock dropped in {}, output cut after {:?}",
                    state, latency
                );
                let mut guard = engine::lock(engine);
                if guard.state() != FsmState::Fault {
                    guard.force_fault_timed(FaultCause::InterlockDrop { state }, Some(latency));
                }
            }
        }
        thread::sleep(period);
    }
    debug!("[WATCHDOG] stopped");
}
