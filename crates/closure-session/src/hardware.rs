use crate::error::HardwareError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Hardware seam: a photodiode probe, the interlock input and the laser
/// output.
///
/// `cut_emission` forces the output off and latches it off until
/// `clear_cutoff`. It takes no locks beyond the driver's own so the watchdog
/// can call it ahead of the engine.
pub trait Hardware: Send + Sync {
    fn read_voltage(&self) -> Result<f64, HardwareError>;
    /// `false` on any read failure.
    fn read_interlock(&self) -> bool;
    fn set_output(&self, on: bool) -> Result<(), HardwareError>;
    fn cut_emission(&self);
    fn clear_cutoff(&self);
    fn output_enabled(&self) -> bool;
}

/// Bench stand-in with a settable interlock and a noisy probe.
#[derive(Debug)]
pub struct SimulatedHardware {
    interlock_safe: AtomicBool,
    output: AtomicBool,
    cutoff: AtomicBool,
    probe_failing: AtomicBool,
    voltage_bits: AtomicU64,
    noise_v: f64,
    rng: Mutex<StdRng>,
    interlock_dropped_at: Mutex<Option<Instant>>,
    cutoff_at: Mutex<Option<Instant>>,
    pulses: AtomicU64,
}

impl SimulatedHardware {
    pub fn new(seed: u64) -> Self {
        Self {
            interlock_safe: AtomicBool::new(true),
            output: AtomicBool::new(false),
            cutoff: AtomicBool::new(false),
            probe_failing: AtomicBool::new(false),
            voltage_bits: AtomicU64::new(1.25f64.to_bits()),
            noise_v: 0.002,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            interlock_dropped_at: Mutex::new(None),
            cutoff_at: Mutex::new(None),
            pulses: AtomicU64::new(0),
        }
    }

    pub fn set_interlock(&self, safe: bool) {
        let was_safe = self.interlock_safe.swap(safe, Ordering::SeqCst);
        if was_safe && !safe {
            if let Ok(mut at) = self.interlock_dropped_at.lock() {
                *at = Some(Instant::now());
            }
        }
    }

    pub fn set_voltage(&self, volts: f64) {
        self.voltage_bits.store(volts.to_bits(), Ordering::SeqCst);
    }

    pub fn set_probe_failing(&self, failing: bool) {
        self.probe_failing.store(failing, Ordering::SeqCst);
    }

    /// Time from the last interlock drop to the first cutoff after it.
    pub fn cutoff_latency(&self) -> Option<Duration> {
        let dropped = (*self.interlock_dropped_at.lock().ok()?)?;
        let cut = (*self.cutoff_at.lock().ok()?)?;
        cut.checked_duration_since(dropped)
    }

    /// Number of off→on output edges so far.
    pub fn pulse_count(&self) -> u64 {
        self.pulses.load(Ordering::SeqCst)
    }

    pub fn cutoff_latched(&self) -> bool {
        self.cutoff.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedHardware {
    fn default() -> Self {
        Self::new(0x4e49_6f4c)
    }
}

impl Hardware for SimulatedHardware {
    fn read_voltage(&self) -> Result<f64, HardwareError> {
        if self.probe_failing.load(Ordering::SeqCst) {
            return Err(HardwareError::Probe("simulated probe failure".into()));
        }
        let base = f64::from_bits(self.voltage_bits.load(Ordering::SeqCst));
        let noise = match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(-self.noise_v..=self.noise_v),
            Err(_) => 0.0,
        };
        Ok((base + noise).max(0.0))
    }

    fn read_interlock(&self) -> bool {
        self.interlock_safe.load(Ordering::SeqCst)
    }

    fn set_output(&self, on: bool) -> Result<(), HardwareError> {
        if on && self.cutoff.load(Ordering::SeqCst) {
            return Err(HardwareError::Output("emission cutoff latched".into()));
        }
        let was_on = self.output.swap(on, Ordering::SeqCst);
        if on && !was_on {
            self.pulses.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn cut_emission(&self) {
        self.output.store(false, Ordering::SeqCst);
        self.cutoff.store(true, Ordering::SeqCst);
        let dropped = self.interlock_dropped_at.lock().ok().and_then(|at| *at);
        if let Ok(mut at) = self.cutoff_at.lock() {
            // Keep the first cut after the most recent drop.
            let stale = match (*at, dropped) {
                (None, _) => true,
                (Some(cut), Some(drop)) => cut < drop,
                (Some(_), None) => false,
            };
            if stale {
                *at = Some(Instant::now());
            }
        }
    }

    fn clear_cutoff(&self) {
        self.cutoff.store(false, Ordering::SeqCst);
    }

    fn output_enabled(&self) -> bool {
        self.output.load(Ordering::SeqCst)
    }
}
