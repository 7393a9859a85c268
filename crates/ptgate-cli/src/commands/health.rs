//! `ptgate health` — run the health gate and report the verdict.

use std::path::PathBuf;

use clap::Args;
use ptgate_core::config::GateConfig;
use ptgate_core::evidence::{resolve_head_ref, EvidenceSnapshotWriter};
use ptgate_core::health::{HealthError, HealthGate, HealthParams};
use ptgate_core::tick::TickObserver;

use crate::commands::{build_context, build_guard};
use crate::exit_codes::codes;

/// Arguments for `ptgate health`.
#[derive(Debug, Args)]
pub struct HealthArgs {
    /// Tick output directory scanned for readiness results
    #[arg(long)]
    pub out_dir: PathBuf,

    /// Evidence store root (a `health/` subdirectory is used)
    #[arg(long)]
    pub store_root: PathBuf,

    /// Safety mode this invocation claims to run in
    #[arg(long, default_value = "shadow")]
    pub mode: String,

    /// Drop the dry-run flag (the guard will reject this)
    #[arg(long)]
    pub no_dry_run: bool,

    /// Pidfile of the readiness-loop supervisor (overrides config)
    #[arg(long)]
    pub pidfile: Option<PathBuf>,

    /// Maximum newest-tick age in seconds (overrides config)
    #[arg(long)]
    pub max_age_sec: Option<u64>,

    /// Enforce per-tick artifact completeness (overrides config)
    #[arg(long)]
    pub require_artifacts: bool,

    /// Print the verdict as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the health gate.
pub fn run(args: &HealthArgs, config: &GateConfig) -> u8 {
    let guard = match build_guard(config) {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("ptgate health: {error}");
            return codes::USAGE;
        },
    };
    let ctx = build_context(&args.mode, args.no_dry_run);
    let observer = TickObserver::new(config.tick_prefix.clone());
    let head_ref = resolve_head_ref(config.repo_dir.as_deref());
    let writer = EvidenceSnapshotWriter::new(args.store_root.join("health"), head_ref);
    let gate = HealthGate::new(&guard, &observer, &writer);

    let pidfile = args.pidfile.clone().or_else(|| config.pidfile.clone());
    let params = HealthParams {
        out_dir: &args.out_dir,
        pidfile: pidfile.as_deref(),
        max_age_sec: args.max_age_sec.unwrap_or(config.thresholds.max_age_sec),
        require_artifacts: args.require_artifacts || config.require_tick_artifacts,
        expected_artifacts: &config.expected_tick_artifacts,
    };

    match gate.check(&ctx, &params) {
        Ok(outcome) => {
            if args.json {
                match serde_json::to_string_pretty(&outcome.verdict) {
                    Ok(json) => println!("{json}"),
                    Err(error) => {
                        eprintln!("ptgate health: {error}");
                        return codes::INTERNAL;
                    },
                }
            } else if outcome.verdict.ok {
                println!("PASS (evidence: {})", outcome.evidence.pin.display());
            } else {
                println!(
                    "FAIL: {} (evidence: {})",
                    outcome.verdict.reason.as_deref().unwrap_or("unknown"),
                    outcome.evidence.pin.display(),
                );
            }
            if outcome.verdict.ok {
                codes::SUCCESS
            } else {
                codes::GATE_FAILED
            }
        },
        Err(error) => {
            eprintln!("ptgate health: {error}");
            match error {
                HealthError::Guard(_) => codes::GATE_FAILED,
                HealthError::Config(_) => codes::USAGE,
                _ => codes::INTERNAL,
            }
        },
    }
}
