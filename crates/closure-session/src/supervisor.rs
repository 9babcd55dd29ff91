//! Periodic engine tick.
//!
//! Drives the fault pre-checks and arming-window expiry without an operator
//! call, so an unattended ARMED session times out and an on-disk edit of the
//! bound configuration faults the session within one interval.

use crate::engine::{self, Engine, SessionSignals};
use closure_core::FsmState;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

pub(crate) fn spawn(
    engine: Arc<Mutex<Engine>>,
    signals: Arc<SessionSignals>,
    interval: Duration,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("closure-supervisor".into())
        .spawn(move || run(&engine, &signals, interval))
}

fn run(engine: &Mutex<Engine>, signals: &SessionSignals, interval: Duration) {
    info!("[SUPERVISOR] started, interval {:?}", interval);
    while !signals.shutting_down() {
        thread::sleep(interval);
        if signals.shutting_down() {
            break;
        }
        // A raised latch is committed by the watchdog, with its cutoff latency.
        let state = signals.state();
        if matches!(state, FsmState::Safe | FsmState::Fault) || signals.fault_latched() {
            continue;
        }
        match engine::lock(engine).tick() {
            Ok(now) if now != state => debug!("[SUPERVISOR] {} -> {}", state, now),
            Ok(_) => {}
            // The engine has already logged and recorded the fault.
            Err(e) => debug!("[SUPERVISOR] tick in {}: {}", state, e),
        }
    }
    debug!("[SUPERVISOR] stopped");
}
