use crate::envelope::{Bounded, CLASS_1M_LIMIT_MW, WAVELENGTH_CONFIDENCE};
use crate::error::ConfigError;
use crate::fs_atomic::{atomic_write, FsAtomicError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub schema_version: u32,
    pub device_id: String,
    pub hardware: HardwareConfig,
    pub safety: SafetyConfig,
    pub measurement: MeasurementConfig,
    pub encoding: EncodingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HardwareConfig {
    pub laser_pin: u8,
    pub interlock_pin: u8,
    pub adc_full_scale_v: f64,
    pub simulated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SafetyConfig {
    pub max_power_mw: f64,
    pub max_emit_ms: f64,
    pub max_duty_percent: f64,
    pub cooldown_ms: f64,
    pub arming_window_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasurementConfig {
    pub max_age_ms: u64,
    #[serde(default)]
    pub detection: Option<DetectionEnvelope>,
}

/// Wavelength window a fresh measurement must lie entirely inside before an
/// emission is allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectionEnvelope {
    pub wavelength_min_nm: f64,
    pub wavelength_max_nm: f64,
    pub min_confidence: f64,
    /// Signal floor above the calibration dark voltage. The whole voltage
    /// envelope must clear `dark_voltage_v + baseline_above_dark_v`.
    #[serde(default = "default_baseline_above_dark_v")]
    pub baseline_above_dark_v: f64,
}

fn default_baseline_above_dark_v() -> f64 {
    0.02
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncodingConfig {
    pub pulse_duration_ms: u64,
    pub gap_duration_ms: u64,
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(reason.into())
}

fn finite_positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(invalid(format!("{name} must be finite and > 0, got {value}")));
    }
    Ok(())
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema_version != CONFIG_SCHEMA_VERSION {
            return Err(invalid(format!(
                "schema_version {} unsupported (expected {})",
                self.schema_version, CONFIG_SCHEMA_VERSION
            )));
        }
        if self.device_id.trim().is_empty() {
            return Err(invalid("device_id must not be empty"));
        }

        let hw = &self.hardware;
        finite_positive("hardware.adc_full_scale_v", hw.adc_full_scale_v)?;
        if hw.laser_pin == hw.interlock_pin {
            return Err(invalid("laser_pin and interlock_pin must differ"));
        }

        let s = &self.safety;
        finite_positive("safety.max_power_mw", s.max_power_mw)?;
        if s.max_power_mw > CLASS_1M_LIMIT_MW {
            return Err(invalid(format!(
                "safety.max_power_mw {} exceeds Class 1M limit {} mW",
                s.max_power_mw, CLASS_1M_LIMIT_MW
            )));
        }
        finite_positive("safety.max_emit_ms", s.max_emit_ms)?;
        finite_positive("safety.max_duty_percent", s.max_duty_percent)?;
        if s.max_duty_percent > 100.0 {
            return Err(invalid("safety.max_duty_percent must be <= 100"));
        }
        if !s.cooldown_ms.is_finite() || s.cooldown_ms < 0.0 {
            return Err(invalid("safety.cooldown_ms must be finite and >= 0"));
        }
        if s.arming_window_ms == 0 {
            return Err(invalid("safety.arming_window_ms must be > 0"));
        }

        if self.measurement.max_age_ms == 0 {
            return Err(invalid("measurement.max_age_ms must be > 0"));
        }
        if let Some(d) = &self.measurement.detection {
            Bounded::new(d.wavelength_min_nm, d.wavelength_max_nm)
                .map_err(|e| invalid(format!("measurement.detection: {e}")))?;
            if !(0.0..=1.0).contains(&d.min_confidence) {
                return Err(invalid("measurement.detection.min_confidence must be in [0, 1]"));
            }
            if !d.baseline_above_dark_v.is_finite() || d.baseline_above_dark_v < 0.0 {
                return Err(invalid(
                    "measurement.detection.baseline_above_dark_v must be finite and >= 0",
                ));
            }
        }

        if self.encoding.pulse_duration_ms == 0 {
            return Err(invalid("encoding.pulse_duration_ms must be > 0"));
        }
        Ok(())
    }

    /// Configuration for a simulated bench device.
    pub fn simulated_default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            device_id: "niols-sim-01".into(),
            hardware: HardwareConfig {
                laser_pin: 18,
                interlock_pin: 23,
                adc_full_scale_v: 3.3,
                simulated: true,
            },
            safety: SafetyConfig {
                max_power_mw: 1.0,
                max_emit_ms: 5_000.0,
                max_duty_percent: 100.0,
                cooldown_ms: 0.0,
                arming_window_ms: 5_000,
            },
            measurement: MeasurementConfig {
                max_age_ms: 1_000,
                detection: None,
            },
            encoding: EncodingConfig {
                pulse_duration_ms: 10,
                gap_duration_ms: 10,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationPoint {
    pub wavelength_nm: f64,
    pub voltage_v: f64,
}

/// Photodiode response table mapping dark-corrected voltage to wavelength.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Calibration {
    pub points: Vec<CalibrationPoint>,
    #[serde(default)]
    pub dark_voltage_v: f64,
}

impl Calibration {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.points.len() < 2 {
            return Err(invalid(format!(
                "calibration needs at least 2 points, got {}",
                self.points.len()
            )));
        }
        if !self.dark_voltage_v.is_finite() {
            return Err(invalid("calibration.dark_voltage_v must be finite"));
        }
        if self
            .points
            .iter()
            .any(|p| !p.wavelength_nm.is_finite() || !p.voltage_v.is_finite())
        {
            return Err(invalid("calibration points must be finite"));
        }

        let sorted = self.sorted_by_wavelength();
        for pair in sorted.windows(2) {
            if pair[0].wavelength_nm == pair[1].wavelength_nm {
                return Err(invalid(format!(
                    "duplicate calibration wavelength {} nm",
                    pair[0].wavelength_nm
                )));
            }
        }
        // Interpolation needs a one-to-one voltage/wavelength mapping.
        let rising = sorted.windows(2).all(|p| p[1].voltage_v > p[0].voltage_v);
        let falling = sorted.windows(2).all(|p| p[1].voltage_v < p[0].voltage_v);
        if !rising && !falling {
            return Err(invalid(
                "calibration voltages must be strictly monotonic in wavelength",
            ));
        }
        Ok(())
    }

    fn sorted_by_wavelength(&self) -> Vec<CalibrationPoint> {
        let mut pts = self.points.clone();
        pts.sort_by(|a, b| a.wavelength_nm.total_cmp(&b.wavelength_nm));
        pts
    }

    fn sorted_by_voltage(&self) -> Vec<CalibrationPoint> {
        let mut pts = self.points.clone();
        pts.sort_by(|a, b| a.voltage_v.total_cmp(&b.voltage_v));
        pts
    }

    /// Wavelength envelope for a dark-corrected voltage band, widened by the
    /// interpolation error. `None` when the band leaves the calibrated range.
    pub fn wavelength_bounds(&self, v_lo: f64, v_hi: f64) -> Option<Bounded> {
        let pts = self.sorted_by_voltage();
        let first = pts.first()?;
        let last = pts.last()?;
        if pts.len() < 2 || v_lo < first.voltage_v || v_hi > last.voltage_v {
            return None;
        }

        let a = interpolate(&pts, v_lo)?;
        let b = interpolate(&pts, v_hi)?;

        let wl_min = pts.iter().map(|p| p.wavelength_nm).fold(f64::INFINITY, f64::min);
        let wl_max = pts
            .iter()
            .map(|p| p.wavelength_nm)
            .fold(f64::NEG_INFINITY, f64::max);
        let interp_error = 0.05 * (wl_max - wl_min) / pts.len() as f64;

        let lo = (a.min(b) - interp_error).max(wl_min);
        let hi = (a.max(b) + interp_error).min(wl_max);
        Bounded::with_confidence(lo, hi, WAVELENGTH_CONFIDENCE).ok()
    }

    /// Calibration matching the simulated photodiode.
    pub fn simulated_default() -> Self {
        let table = [(405.0, 0.45), (450.0, 0.8), (532.0, 1.2), (589.0, 1.6), (650.0, 2.0)];
        Self {
            points: table
                .iter()
                .map(|&(wavelength_nm, voltage_v)| CalibrationPoint {
                    wavelength_nm,
                    voltage_v,
                })
                .collect(),
            dark_voltage_v: 0.05,
        }
    }
}

fn interpolate(pts: &[CalibrationPoint], v: f64) -> Option<f64> {
    pts.windows(2).find_map(|seg| {
        let (p0, p1) = (seg[0], seg[1]);
        if v < p0.voltage_v || v > p1.voltage_v {
            return None;
        }
        let span = p1.voltage_v - p0.voltage_v;
        if span <= 0.0 {
            return Some(p0.wavelength_nm);
        }
        let t = (v - p0.voltage_v) / span;
        Some(p0.wavelength_nm + t * (p1.wavelength_nm - p0.wavelength_nm))
    })
}

/// Loader seam for device configuration and calibration.
///
/// `load` parses only; validation is the initialize guard's job so that a
/// drift check can still hash content that later fails validation.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<(DeviceConfig, Calibration), ConfigError>;
    fn store(&self, config: &DeviceConfig, calibration: &Calibration) -> Result<(), ConfigError>;
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
}

fn format_of(path: &Path) -> Result<Format, ConfigError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(Format::Json),
        Some("yaml") | Some("yml") => Ok(Format::Yaml),
        _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
    }
}

fn read_typed<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let format = format_of(path)?;
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
    Ok(match format {
        Format::Json => serde_json::from_str(&text)?,
        Format::Yaml => serde_yaml::from_str(&text)?,
    })
}

fn write_typed<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    let bytes = match format_of(path)? {
        Format::Json => serde_json::to_vec_pretty(value)?,
        Format::Yaml => serde_yaml::to_string(value)?.into_bytes(),
    };
    atomic_write(path, &bytes).map_err(|e| match e {
        FsAtomicError::Io { source, .. } => ConfigError::io(path, source),
        other => ConfigError::Unavailable(other.to_string()),
    })
}

/// Reads configuration and calibration from two files, JSON or YAML by
/// extension.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    pub config_path: PathBuf,
    pub calibration_path: PathBuf,
}

impl FileConfigSource {
    pub fn new(config_path: impl Into<PathBuf>, calibration_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            calibration_path: calibration_path.into(),
        }
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<(DeviceConfig, Calibration), ConfigError> {
        let config = read_typed(&self.config_path)?;
        let calibration = read_typed(&self.calibration_path)?;
        Ok((config, calibration))
    }

    fn store(&self, config: &DeviceConfig, calibration: &Calibration) -> Result<(), ConfigError> {
        write_typed(&self.config_path, config)?;
        write_typed(&self.calibration_path, calibration)
    }

    fn describe(&self) -> String {
        format!(
            "files {} + {}",
            self.config_path.display(),
            self.calibration_path.display()
        )
    }
}

/// In-process configuration store.
#[derive(Debug)]
pub struct MemoryConfigSource {
    inner: Mutex<(DeviceConfig, Calibration)>,
}

impl MemoryConfigSource {
    pub fn new(config: DeviceConfig, calibration: Calibration) -> Self {
        Self {
            inner: Mutex::new((config, calibration)),
        }
    }

    /// Swaps the stored content without any state check, standing in for an
    /// out-of-band edit.
    pub fn replace(&self, config: DeviceConfig, calibration: Calibration) -> Result<(), ConfigError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| ConfigError::Unavailable("memory config lock poisoned".into()))?;
        *guard = (config, calibration);
        Ok(())
    }
}

impl ConfigSource for MemoryConfigSource {
    fn load(&self) -> Result<(DeviceConfig, Calibration), ConfigError> {
        self.inner
            .lock()
            .map(|g| g.clone())
            .map_err(|_| ConfigError::Unavailable("memory config lock poisoned".into()))
    }

    fn store(&self, config: &DeviceConfig, calibration: &Calibration) -> Result<(), ConfigError> {
        self.replace(config.clone(), calibration.clone())
    }

    fn describe(&self) -> String {
        "in-memory".into()
    }
}

/// Host runtime knobs. Not part of the hash-bound device configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeSettings {
    pub watchdog_period_ms: u64,
    pub poll_interval_ms: u64,
    pub samples_per_poll: usize,
    pub join_timeout_ms: u64,
    pub latency_target_ms: u64,
    /// Cadence of the session tick: fault pre-checks, drift and arming expiry.
    pub supervise_interval_ms: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            watchdog_period_ms: 1,
            poll_interval_ms: 50,
            samples_per_poll: 16,
            join_timeout_ms: 500,
            latency_target_ms: 10,
            supervise_interval_ms: 20,
        }
    }
}

impl RuntimeSettings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let settings: Self = read_typed(path)?;
        if settings.samples_per_poll == 0 {
            return Err(invalid("samples_per_poll must be > 0"));
        }
        if settings.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms must be > 0"));
        }
        if settings.supervise_interval_ms == 0 {
            return Err(invalid("supervise_interval_ms must be > 0"));
        }
        Ok(settings)
    }
}
