//! Offline verifier for sealed session bundles.
//!
//! Prints one JSON report per bundle and exits non-zero if any fails.

use clap::Parser;
use closure_session::verify_bundle;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "closure-verify", about = "Verify session bundle directories")]
struct Args {
    /// Bundle directories (each holding a session_manifest.json).
    #[arg(required = true)]
    bundles: Vec<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    closure_cli::init_logging(args.json_logs);

    let mut failed = 0usize;
    for dir in &args.bundles {
        let report = verify_bundle(dir);
        if report.valid {
            info!("[BUNDLE] {} verified", dir.display());
        } else {
            failed += 1;
        }
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    if failed > 0 {
        info!("[BUNDLE] {} of {} bundle(s) failed", failed, args.bundles.len());
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
