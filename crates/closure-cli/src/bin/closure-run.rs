//! Runs one scripted session against simulated hardware and seals its
//! bundle. Ctrl-C stops the session and still writes the bundle.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use closure_core::{
    Calibration, ConfigSource, DeviceConfig, FileConfigSource, MemoryConfigSource, RuntimeSettings,
};
use closure_metrics::ClosureMetrics;
use closure_session::{
    EmitRequest, GeometricShape, PatternSpec, Session, SessionOptions, SimulatedHardware,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PatternKind {
    Square,
    Circle,
    Triangle,
    Spiral,
    Morse,
    Binary,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "closure-run", about = "Run a scripted session on simulated hardware")]
struct Args {
    /// Device configuration (JSON or YAML). Simulated defaults when omitted.
    #[arg(long, requires = "calibration")]
    config: Option<PathBuf>,

    /// Calibration table (JSON or YAML).
    #[arg(long, requires = "config")]
    calibration: Option<PathBuf>,

    /// Runtime settings (watchdog period, poll interval, join timeout).
    #[arg(long)]
    runtime: Option<PathBuf>,

    /// Parent directory for session bundles.
    #[arg(long, default_value = "sessions")]
    root: PathBuf,

    #[arg(long, value_enum, default_value = "square")]
    pattern: PatternKind,

    /// Step count for geometric patterns.
    #[arg(long, default_value_t = 12)]
    size: usize,

    /// Message for morse and binary patterns.
    #[arg(long, default_value = "NIOLS")]
    message: String,

    #[arg(long, default_value_t = 0.8)]
    power_mw: f64,

    /// Drop the simulated interlock after arming.
    #[arg(long)]
    drop_interlock: bool,

    /// Keep the session open this long after the script, or until Ctrl-C.
    #[arg(long, default_value_t = 0)]
    hold_ms: u64,

    /// Print the Prometheus exposition after shutdown.
    #[arg(long)]
    metrics: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn request(&self) -> EmitRequest {
        let geometric = |shape| PatternSpec::Geometric {
            shape,
            size: self.size,
        };
        let pattern = match self.pattern {
            PatternKind::Square => geometric(GeometricShape::Square),
            PatternKind::Circle => geometric(GeometricShape::Circle),
            PatternKind::Triangle => geometric(GeometricShape::Triangle),
            PatternKind::Spiral => geometric(GeometricShape::Spiral),
            PatternKind::Morse => PatternSpec::Morse {
                message: self.message.clone(),
            },
            PatternKind::Binary => PatternSpec::Binary {
                message: self.message.clone(),
            },
        };
        EmitRequest {
            pattern,
            power_mw: self.power_mw,
        }
    }

    fn source(&self) -> Arc<dyn ConfigSource> {
        match (&self.config, &self.calibration) {
            (Some(config), Some(calibration)) => {
                Arc::new(FileConfigSource::new(config, calibration))
            }
            _ => {
                warn!("no configuration given, using simulated defaults");
                Arc::new(MemoryConfigSource::new(
                    DeviceConfig::simulated_default(),
                    Calibration::simulated_default(),
                ))
            }
        }
    }
}

/// Each step is logged and the script carries on, so the bundle always
/// records how far it got.
fn run_script(session: &Session, hardware: &SimulatedHardware, args: &Args) {
    let step = |name: &str, result: Result<String, String>| match result {
        Ok(state) => info!("{} -> {}", name, state),
        Err(e) => warn!("{} refused: {}", name, e),
    };
    let show = |r: Result<closure_session::Outcome, closure_session::TransitionError>| {
        r.map(|o| o.state.to_string()).map_err(|e| e.to_string())
    };

    step("initialize", show(session.initialize()));
    step("arm", show(session.arm()));
    if args.drop_interlock {
        hardware.set_interlock(false);
        std::thread::sleep(Duration::from_millis(20));
    }
    step("confirm_arm", show(session.confirm_arm(true)));
    if let Some(m) = session.sample_now() {
        info!(
            "measurement: {:?} nm, clean {}",
            m.wavelength_nm.map(|w| (w.min, w.max)),
            m.is_clean()
        );
    }
    step("emit", show(session.emit(&args.request())));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    closure_cli::init_logging(args.json_logs);

    let runtime = match &args.runtime {
        Some(path) => RuntimeSettings::from_path(path)
            .with_context(|| format!("loading runtime settings from {}", path.display()))?,
        None => RuntimeSettings::default(),
    };
    let hardware = Arc::new(SimulatedHardware::default());
    let metrics = Arc::new(ClosureMetrics::new()?);
    let opts = SessionOptions::new(&args.root, args.source(), hardware.clone())
        .with_runtime(runtime)
        .with_observer(metrics.clone());
    let session = Arc::new(Session::open(opts).context("opening session")?);
    info!("session {} at {}", session.id(), session.dir().display());

    let script = {
        let session = session.clone();
        let hardware = hardware.clone();
        let args = args.clone();
        tokio::task::spawn_blocking(move || run_script(&session, &hardware, &args))
    };
    let hold = Duration::from_millis(args.hold_ms);
    let work = async {
        script.await?;
        tokio::time::sleep(hold).await;
        anyhow::Ok(())
    };

    tokio::select! {
        done = work => done?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for Ctrl-C")?;
            warn!("interrupted, stopping session");
            let session = session.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = session.stop("interrupted") {
                    warn!("stop refused: {}", e);
                }
            })
            .await?;
        }
    }

    let manifest = {
        let session = session.clone();
        tokio::task::spawn_blocking(move || session.shutdown()).await??
    };
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    if args.metrics {
        print!("{}", metrics.render()?);
    }
    Ok(())
}
