//! Measurement poller.
//!
//! Samples the probe at a fixed cadence once a calibration is bound and
//! publishes the latest [`MeasurementEnvelope`] in a watch cell. Readers only
//! ever copy the latest value; nothing queues.

use crate::engine::SessionSignals;
use crate::hardware::Hardware;
use closure_core::{Calibration, Clock, MeasurementEnvelope};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Calibration the poller converts voltages with, published on INITIALIZE.
#[derive(Debug, Clone, PartialEq)]
pub struct PollerBinding {
    pub calibration: Calibration,
    pub adc_full_scale_v: f64,
}

pub(crate) struct PollerConfig {
    pub interval: Duration,
    pub samples_per_poll: usize,
}

pub(crate) fn spawn(
    hardware: Arc<dyn Hardware>,
    clock: Arc<dyn Clock>,
    signals: Arc<SessionSignals>,
    binding: watch::Receiver<Option<PollerBinding>>,
    latest: Arc<watch::Sender<Option<MeasurementEnvelope>>>,
    config: PollerConfig,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("closure-poller".into())
        .spawn(move || {
            info!(
                "[POLLER] started, {} samples every {:?}",
                config.samples_per_poll, config.interval
            );
            while !signals.shutting_down() {
                let bound = binding.borrow().clone();
                if let Some(bound) = bound {
                    if let Some(envelope) =
                        poll_once(hardware.as_ref(), clock.as_ref(), &bound, config.samples_per_poll)
                    {
                        latest.send_replace(Some(envelope));
                    }
                }
                thread::sleep(config.interval);
            }
            debug!("[POLLER] stopped");
        })
}

/// One sampling burst. Probe failures leave the previous envelope in place
/// so it ages out under the staleness rule.
pub(crate) fn poll_once(
    hardware: &dyn Hardware,
    clock: &dyn Clock,
    bound: &PollerBinding,
    samples: usize,
) -> Option<MeasurementEnvelope> {
    let mut readings = Vec::with_capacity(samples);
    for _ in 0..samples {
        match hardware.read_voltage() {
            Ok(v) => readings.push(v),
            Err(e) => {
                warn!("[POLLER] {}", e);
                return None;
            }
        }
    }
    match MeasurementEnvelope::from_samples(
        &readings,
        Some(&bound.calibration),
        bound.adc_full_scale_v,
        clock.now_utc(),
    ) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            warn!("[POLLER] envelope rejected: {}", e);
            None
        }
    }
}
