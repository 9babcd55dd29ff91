use crate::config::{Calibration, SafetyConfig};
use crate::error::EnvelopeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Class 1M accessible emission limit, in milliwatts. Code constant, not
/// configuration: no device config may grant more than this.
pub const CLASS_1M_LIMIT_MW: f64 = 1.0;

/// Floor for the ADC noise estimate (ADS1115-class converter, ~0.2 mV RMS).
pub const ADC_NOISE_FLOOR_V: f64 = 0.0002;

/// Confidence attached to wavelength envelopes built from a 3-sigma voltage band.
pub const WAVELENGTH_CONFIDENCE: f64 = 0.95;

/// Headroom below ADC full scale at which a reading is flagged as saturated.
pub const SATURATION_MARGIN_V: f64 = 0.1;

/// A closed range `[min, max]` with an optional confidence. Every measured or
/// granted quantity crosses the interface as one of these, never a bare scalar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Bounded {
    pub min: f64,
    pub max: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl Bounded {
    pub fn new(min: f64, max: f64) -> Result<Self, EnvelopeError> {
        if !min.is_finite() {
            return Err(EnvelopeError::NotFinite("min"));
        }
        if !max.is_finite() {
            return Err(EnvelopeError::NotFinite("max"));
        }
        if min > max {
            return Err(EnvelopeError::Inverted { min, max });
        }
        Ok(Self {
            min,
            max,
            confidence: None,
        })
    }

    pub fn with_confidence(min: f64, max: f64, confidence: f64) -> Result<Self, EnvelopeError> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(EnvelopeError::Confidence(confidence));
        }
        let mut range = Self::new(min, max)?;
        range.confidence = Some(confidence);
        Ok(range)
    }

    /// `[0, max]`, the shape of every granted allowance.
    pub fn up_to(max: f64) -> Result<Self, EnvelopeError> {
        Self::new(0.0, max)
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// True when the whole range lies inside `[lo, hi]`.
    pub fn within(&self, lo: f64, hi: f64) -> bool {
        self.min >= lo && self.max <= hi
    }

    /// True when the threshold falls inside the range, i.e. the measurement
    /// cannot say which side of the threshold the true value is on.
    pub fn straddles(&self, threshold: f64) -> bool {
        self.min <= threshold && self.max >= threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VoltageEnvelope {
    pub range_v: Bounded,
    pub rms_noise_v: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasurementQuality {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr_estimate: Option<f64>,
    pub saturation: bool,
    pub clipping: bool,
}

/// The only shape in which a photodiode reading leaves the measurement path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasurementEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wavelength_nm: Option<Bounded>,
    pub voltage: VoltageEnvelope,
    pub quality: MeasurementQuality,
    pub sample_count: usize,
    pub captured_at: DateTime<Utc>,
}

impl MeasurementEnvelope {
    /// Builds an envelope from raw voltage samples.
    ///
    /// The voltage band is `mean ± (3σ + noise)` where noise is the larger of
    /// σ and [`ADC_NOISE_FLOOR_V`]. A wavelength band is attached only when the
    /// dark-corrected voltage band lies inside the calibration table.
    pub fn from_samples(
        samples: &[f64],
        calibration: Option<&Calibration>,
        adc_full_scale_v: f64,
        captured_at: DateTime<Utc>,
    ) -> Result<Self, EnvelopeError> {
        let finite: Vec<f64> = samples.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return Err(EnvelopeError::NoSamples);
        }
        let n = finite.len() as f64;
        let mean = finite.iter().sum::<f64>() / n;
        let variance = finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let sigma = variance.sqrt();
        let noise = sigma.max(ADC_NOISE_FLOOR_V);

        let uncertainty = 3.0 * sigma + noise;
        let v_min = (mean - uncertainty).max(0.0);
        let v_max = mean + uncertainty;
        let range_v = Bounded::new(v_min, v_max)?;

        let wavelength_nm = calibration.and_then(|cal| {
            cal.wavelength_bounds(v_min - cal.dark_voltage_v, v_max - cal.dark_voltage_v)
        });

        let quality = MeasurementQuality {
            snr_estimate: Some(mean / noise),
            saturation: v_max >= adc_full_scale_v - SATURATION_MARGIN_V,
            clipping: v_min <= 0.0,
        };

        Ok(Self {
            wavelength_nm,
            voltage: VoltageEnvelope {
                range_v,
                rms_noise_v: noise,
            },
            quality,
            sample_count: finite.len(),
            captured_at,
        })
    }

    pub fn is_clean(&self) -> bool {
        !self.quality.saturation && !self.quality.clipping
    }

    /// Age in milliseconds relative to `now`; `None` when the envelope is
    /// stamped in the future, which callers must treat as untrustworthy.
    pub fn age_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        let age = now.signed_duration_since(self.captured_at).num_milliseconds();
        (age >= 0).then_some(age)
    }
}

/// Bounds actually granted to one emission request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmitEnvelope {
    pub power_mw: Bounded,
    pub duty_percent: Bounded,
    pub duration_ms: Bounded,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulse_width_ms: Option<Bounded>,
}

impl EmitEnvelope {
    pub fn grant(
        power_mw: f64,
        duty_percent: f64,
        duration_ms: f64,
        pulse_width_ms: Option<f64>,
    ) -> Result<Self, EnvelopeError> {
        if power_mw > CLASS_1M_LIMIT_MW {
            return Err(EnvelopeError::Exceeds {
                what: "power_mw",
                value: power_mw,
                limit: CLASS_1M_LIMIT_MW,
            });
        }
        if duty_percent > 100.0 {
            return Err(EnvelopeError::Exceeds {
                what: "duty_percent",
                value: duty_percent,
                limit: 100.0,
            });
        }
        let pulse_width_ms = match pulse_width_ms {
            Some(width) => Some(Bounded::new(width, width)?),
            None => None,
        };
        Ok(Self {
            power_mw: Bounded::up_to(power_mw)?,
            duty_percent: Bounded::up_to(duty_percent)?,
            duration_ms: Bounded::up_to(duration_ms)?,
            pulse_width_ms,
        })
    }

    pub fn max_duration_ms(&self) -> f64 {
        self.duration_ms.max
    }

    pub fn max_duty_percent(&self) -> f64 {
        self.duty_percent.max
    }
}

/// Consumable allowance bounding further emission.
///
/// Emit time and duty decrease monotonically while EMITTING. Only a fresh
/// [`BudgetEnvelope::full`] at INITIALIZE raises them again.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetEnvelope {
    pub remaining_emit_ms: f64,
    pub remaining_duty_percent: f64,
    pub cooldown_remaining_ms: f64,
}

impl BudgetEnvelope {
    pub fn full(safety: &SafetyConfig) -> Self {
        Self {
            remaining_emit_ms: safety.max_emit_ms.max(0.0),
            remaining_duty_percent: safety.max_duty_percent.clamp(0.0, 100.0),
            cooldown_remaining_ms: 0.0,
        }
    }

    /// Reason the budget cannot fund any emission at all, if one exists.
    pub fn exhaustion(&self) -> Option<String> {
        if self.remaining_emit_ms <= 0.0 {
            return Some("emit-time budget exhausted".into());
        }
        if self.remaining_duty_percent <= 0.0 {
            return Some("duty-cycle budget exhausted (remaining_duty_percent = 0)".into());
        }
        if self.cooldown_remaining_ms > 0.0 {
            return Some(format!(
                "cooldown active: {:.1} ms remaining",
                self.cooldown_remaining_ms
            ));
        }
        None
    }

    /// Reason the budget cannot fund this particular emission, if one exists.
    pub fn shortfall(&self, duration_ms: f64, duty_percent: f64) -> Option<String> {
        if let Some(reason) = self.exhaustion() {
            return Some(reason);
        }
        if duration_ms > self.remaining_emit_ms {
            return Some(format!(
                "requested {:.1} ms exceeds remaining emit budget {:.1} ms",
                duration_ms, self.remaining_emit_ms
            ));
        }
        if duty_percent > self.remaining_duty_percent {
            return Some(format!(
                "requested duty {:.2}% exceeds remaining duty budget {:.2}%",
                duty_percent, self.remaining_duty_percent
            ));
        }
        None
    }

    /// Charges elapsed emission against the budget. Negative inputs are
    /// ignored so the remaining values can only go down.
    pub fn charge(&mut self, elapsed_ms: f64, duty_percent: f64) {
        let elapsed_ms = elapsed_ms.max(0.0);
        let duty_percent = duty_percent.max(0.0);
        self.remaining_emit_ms = (self.remaining_emit_ms - elapsed_ms).max(0.0);
        self.remaining_duty_percent = (self.remaining_duty_percent - duty_percent).max(0.0);
    }

    /// Recomputes the cooldown from the time since the last emission ended.
    pub fn recompute_cooldown(&mut self, since_emit_end_ms: Option<u64>, cooldown_ms: f64) {
        self.cooldown_remaining_ms = match since_emit_end_ms {
            None => 0.0,
            Some(elapsed) => (cooldown_ms - elapsed as f64).max(0.0),
        };
    }
}
