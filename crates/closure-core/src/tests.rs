use crate::binding::{bind, canonical_json, detect_drift, hash_canonical};
use crate::config::{Calibration, ConfigSource, DetectionEnvelope, DeviceConfig, FileConfigSource};
use crate::context::SessionContext;
use crate::envelope::{Bounded, BudgetEnvelope, MeasurementEnvelope, MeasurementQuality, VoltageEnvelope};
use crate::health::HealthStatus;
use crate::predicates::{
    check_confirm_arm, check_emit, check_initialize, EmitInputs, FaultCause, Verdict,
};
use crate::state::{target, FsmEvent, FsmState};
use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::Value;
use uuid::Uuid;

/// Re-serializes `value` with object keys in random order and random
/// whitespace between tokens.
fn scrambled_json<R: Rng>(value: &Value, rng: &mut R) -> String {
    let ws = |rng: &mut R| [" ", "", "\n  ", "\t"][rng.gen_range(0..4)].to_string();
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.shuffle(rng);
            let mut out = String::from("{");
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&ws(rng));
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                out.push_str(&ws(rng));
                out.push_str(&scrambled_json(&map[key.as_str()], rng));
            }
            out.push_str(&ws(rng));
            out.push('}');
            out
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(|v| scrambled_json(v, rng)).collect();
            format!("[{}{}]", ws(rng), parts.join(","))
        }
        other => other.to_string(),
    }
}

fn emit_ready_context() -> SessionContext {
    let config = DeviceConfig::simulated_default();
    let mut ctx = SessionContext::new(Uuid::new_v4());
    ctx.state = FsmState::EmitReady;
    ctx.hashes = Some(bind(&config, &Calibration::simulated_default()).unwrap());
    ctx.budget = BudgetEnvelope::full(&config.safety);
    ctx
}

fn measurement(wl_min: f64, wl_max: f64) -> MeasurementEnvelope {
    MeasurementEnvelope {
        wavelength_nm: Some(Bounded::with_confidence(wl_min, wl_max, 0.95).unwrap()),
        voltage: VoltageEnvelope {
            range_v: Bounded::new(1.19, 1.21).unwrap(),
            rms_noise_v: 0.002,
        },
        quality: MeasurementQuality {
            snr_estimate: Some(600.0),
            saturation: false,
            clipping: false,
        },
        sample_count: 16,
        captured_at: Utc::now(),
    }
}

fn inputs(m: Option<&MeasurementEnvelope>) -> EmitInputs<'_> {
    EmitInputs {
        interlock_safe: true,
        stop_requested: false,
        power_mw: 0.5,
        duration_ms: 230.0,
        duty_percent: 52.17,
        measurement: m,
        dark_voltage_v: 0.05,
        now: Utc::now(),
    }
}

#[test]
fn config_hash_invariant_under_key_order_and_whitespace() {
    let config = DeviceConfig::simulated_default();
    let calibration = Calibration::simulated_default();
    let expected = bind(&config, &calibration).unwrap();
    let config_tree = serde_json::to_value(&config).unwrap();
    let cal_tree = serde_json::to_value(&calibration).unwrap();

    let mut rng = rand::thread_rng();
    for _ in 0..50 {
        let config_text = scrambled_json(&config_tree, &mut rng);
        let cal_text = scrambled_json(&cal_tree, &mut rng);

        let reparsed: Value = serde_json::from_str(&config_text).unwrap();
        assert_eq!(
            canonical_json(&reparsed).unwrap(),
            canonical_json(&config_tree).unwrap()
        );

        let config2: DeviceConfig = serde_json::from_str(&config_text).unwrap();
        let cal2: Calibration = serde_json::from_str(&cal_text).unwrap();
        assert_eq!(bind(&config2, &cal2).unwrap(), expected);
    }
}

#[test]
fn semantic_change_moves_only_the_affected_hash() {
    let config = DeviceConfig::simulated_default();
    let calibration = Calibration::simulated_default();
    let bound = bind(&config, &calibration).unwrap();

    let mut edited = config.clone();
    edited.safety.max_emit_ms += 1.0;
    let report = detect_drift(&edited, &calibration, &bound).unwrap();
    assert!(report.is_drifted());
    let divergence = report.config.as_ref().unwrap();
    assert_eq!(divergence.bound, bound.config_hash);
    assert_ne!(divergence.recomputed, bound.config_hash);
    assert!(report.calibration.is_none());

    let unchanged = detect_drift(&config, &calibration, &bound).unwrap();
    assert!(!unchanged.is_drifted());
}

#[test]
fn json_and_yaml_files_bind_identically() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = DeviceConfig::simulated_default();
    let calibration = Calibration::simulated_default();

    let json = FileConfigSource::new(dir.path().join("c.json"), dir.path().join("k.json"));
    let yaml = FileConfigSource::new(dir.path().join("c.yaml"), dir.path().join("k.yml"));
    json.store(&config, &calibration).unwrap();
    yaml.store(&config, &calibration).unwrap();

    let (c1, k1) = json.load().unwrap();
    let (c2, k2) = yaml.load().unwrap();
    assert_eq!(bind(&c1, &k1).unwrap(), bind(&c2, &k2).unwrap());
    assert_eq!(hash_canonical(&c1).unwrap(), hash_canonical(&config).unwrap());
}

#[test]
fn unknown_config_fields_are_rejected() {
    let mut tree = serde_json::to_value(DeviceConfig::simulated_default()).unwrap();
    tree["safety"]["override_interlock"] = Value::Bool(true);
    assert!(serde_json::from_value::<DeviceConfig>(tree).is_err());
}

#[test]
fn validation_rejects_power_above_class_limit() {
    let mut config = DeviceConfig::simulated_default();
    config.safety.max_power_mw = 1.5;
    assert!(config.validate().is_err());

    let decision = check_initialize(&config, &Calibration::simulated_default(), HealthStatus::Healthy);
    assert!(matches!(decision.verdict, Verdict::Deny { .. }));
}

#[test]
fn calibration_needs_two_distinct_points() {
    let mut cal = Calibration::simulated_default();
    cal.points.truncate(1);
    assert!(cal.validate().is_err());

    let mut dup = Calibration::simulated_default();
    dup.points[1].wavelength_nm = dup.points[0].wavelength_nm;
    assert!(dup.validate().is_err());
}

#[test]
fn fault_is_exited_only_by_reset() {
    for event in FsmEvent::ALL {
        let next = target(FsmState::Fault, event);
        if event == FsmEvent::Reset {
            assert_eq!(next, Some(FsmState::Safe));
        } else {
            assert_eq!(next, None, "{event} must not leave FAULT");
        }
    }
}

#[test]
fn emitting_is_entered_only_from_emit_ready() {
    for from in FsmState::ALL {
        for event in FsmEvent::ALL {
            if target(from, event) == Some(FsmState::Emitting) {
                assert_eq!(from, FsmState::EmitReady);
                assert_eq!(event, FsmEvent::EmitRequest);
            }
        }
    }
}

#[test]
fn budget_only_decreases_while_charging() {
    let config = DeviceConfig::simulated_default();
    let mut budget = BudgetEnvelope::full(&config.safety);
    let mut rng = rand::thread_rng();

    for _ in 0..500 {
        let before = budget;
        let elapsed = rng.gen_range(-50.0..200.0);
        let duty = rng.gen_range(-5.0..20.0);
        budget.charge(elapsed, duty);
        assert!(budget.remaining_emit_ms <= before.remaining_emit_ms);
        assert!(budget.remaining_duty_percent <= before.remaining_duty_percent);
        assert!(budget.remaining_emit_ms >= 0.0);
        assert!(budget.remaining_duty_percent >= 0.0);
    }
}

#[test]
fn emit_denied_when_duty_budget_is_zero() {
    let mut ctx = emit_ready_context();
    ctx.budget.remaining_duty_percent = 0.0;
    let config = DeviceConfig::simulated_default();

    let decision = check_emit(&ctx, &config, &inputs(None));
    match decision.verdict {
        Verdict::Deny { reason } => assert!(reason.contains("duty")),
        other => panic!("expected deny, got {other:?}"),
    }
}

#[test]
fn straddling_detection_bound_is_not_satisfied() {
    let ctx = emit_ready_context();
    let mut config = DeviceConfig::simulated_default();
    config.measurement.detection = Some(DetectionEnvelope {
        wavelength_min_nm: 500.0,
        wavelength_max_nm: 560.0,
        min_confidence: 0.9,
        baseline_above_dark_v: 0.02,
    });

    let inside = measurement(525.0, 540.0);
    assert!(check_emit(&ctx, &config, &inputs(Some(&inside))).is_allowed());

    let straddling = measurement(555.0, 565.0);
    match check_emit(&ctx, &config, &inputs(Some(&straddling))).verdict {
        Verdict::Deny { reason } => assert!(reason.contains("straddles")),
        other => panic!("expected deny, got {other:?}"),
    }

    assert!(!check_emit(&ctx, &config, &inputs(None)).is_allowed());
}

#[test]
fn detection_needs_signal_above_dark_baseline() {
    let ctx = emit_ready_context();
    let mut config = DeviceConfig::simulated_default();
    config.measurement.detection = Some(DetectionEnvelope {
        wavelength_min_nm: 500.0,
        wavelength_max_nm: 560.0,
        min_confidence: 0.9,
        baseline_above_dark_v: 0.02,
    });

    // In band, but the voltage band dips to the dark + baseline floor of 0.07 V.
    let mut faint = measurement(525.0, 540.0);
    faint.voltage.range_v = Bounded::new(0.065, 0.09).unwrap();
    match check_emit(&ctx, &config, &inputs(Some(&faint))).verdict {
        Verdict::Deny { reason } => assert!(reason.contains("baseline"), "{reason}"),
        other => panic!("expected deny, got {other:?}"),
    }

    faint.voltage.range_v = Bounded::new(0.075, 0.09).unwrap();
    assert!(check_emit(&ctx, &config, &inputs(Some(&faint))).is_allowed());

    let mut negative = config.clone();
    if let Some(d) = negative.measurement.detection.as_mut() {
        d.baseline_above_dark_v = -0.01;
    }
    assert!(negative.validate().is_err());
}

#[test]
fn predicates_are_reproducible_from_their_inputs() {
    let ctx = emit_ready_context();
    let config = DeviceConfig::simulated_default();
    let m = measurement(525.0, 540.0);
    let i = inputs(Some(&m));
    let first = check_emit(&ctx, &config, &i);
    for _ in 0..10 {
        assert_eq!(check_emit(&ctx, &config, &i), first);
    }
}

#[test]
fn interlock_drop_while_hot_is_a_fault() {
    let ctx = emit_ready_context();
    let config = DeviceConfig::simulated_default();
    let mut i = inputs(None);
    i.interlock_safe = false;
    match check_emit(&ctx, &config, &i).verdict {
        Verdict::Fault {
            cause: FaultCause::InterlockDrop { state },
        } => assert_eq!(state, FsmState::EmitReady),
        other => panic!("expected fault, got {other:?}"),
    }
}

#[test]
fn late_confirmation_expires_instead_of_faulting() {
    let config = DeviceConfig::simulated_default();
    let mut ctx = SessionContext::new(Uuid::new_v4());
    ctx.state = FsmState::Armed;
    ctx.armed_at_ms = Some(1_000);

    let on_time = check_confirm_arm(&ctx, &config, true, true, 1_000 + config.safety.arming_window_ms);
    assert!(on_time.is_allowed());

    let late = check_confirm_arm(&ctx, &config, true, true, 1_001 + config.safety.arming_window_ms);
    assert!(matches!(late.verdict, Verdict::Expired { .. }));
}

#[test]
fn measurement_envelope_from_steady_samples() {
    let cal = Calibration::simulated_default();
    let samples = [1.25; 16];
    let m = MeasurementEnvelope::from_samples(&samples, Some(&cal), 3.3, Utc::now()).unwrap();
    assert!(m.voltage.range_v.contains(1.25));
    assert!(m.voltage.rms_noise_v >= 0.0002);
    let wl = m.wavelength_nm.unwrap();
    assert!(wl.contains(532.0));
    assert_eq!(wl.confidence, Some(0.95));
    assert!(m.is_clean());
}

#[test]
fn measurement_flags_saturation_clipping_and_out_of_range() {
    let cal = Calibration::simulated_default();

    let high = MeasurementEnvelope::from_samples(&[3.28; 8], Some(&cal), 3.3, Utc::now()).unwrap();
    assert!(high.quality.saturation);
    assert!(high.wavelength_nm.is_none());

    let low = MeasurementEnvelope::from_samples(&[0.0; 8], Some(&cal), 3.3, Utc::now()).unwrap();
    assert!(low.quality.clipping);

    assert!(MeasurementEnvelope::from_samples(&[], Some(&cal), 3.3, Utc::now()).is_err());
}

#[test]
fn inverted_bounds_are_rejected() {
    assert!(Bounded::new(2.0, 1.0).is_err());
    assert!(Bounded::new(f64::NAN, 1.0).is_err());
    assert!(Bounded::with_confidence(0.0, 1.0, 1.5).is_err());
}

#[test]
fn shipped_sample_configs_load_and_validate() {
    let samples = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config");
    let source = FileConfigSource::new(
        samples.join("device_config.json"),
        samples.join("calibration.json"),
    );
    let (config, calibration) = source.load().unwrap();
    config.validate().unwrap();
    calibration.validate().unwrap();
    assert_eq!(calibration, Calibration::simulated_default());
    assert!(config.measurement.detection.is_some());

    let runtime = crate::config::RuntimeSettings::from_path(&samples.join("runtime.yaml")).unwrap();
    assert_eq!(runtime, crate::config::RuntimeSettings::default());
}
