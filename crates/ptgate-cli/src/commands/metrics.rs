//! `ptgate metrics` — compute the alerting metrics document.

use std::path::PathBuf;

use clap::Args;
use ptgate_core::config::{GateConfig, Thresholds};
use ptgate_core::evidence::{resolve_head_ref, EvidenceSnapshotWriter};
use ptgate_core::metrics::{MetricsAggregator, MetricsError};
use ptgate_core::tick::TickObserver;

use crate::commands::{build_context, build_guard};
use crate::exit_codes::codes;

/// Arguments for `ptgate metrics`.
#[derive(Debug, Args)]
pub struct MetricsArgs {
    /// Tick output directory scanned for readiness results
    #[arg(long)]
    pub out_dir: PathBuf,

    /// Evidence store root (a `metrics/` subdirectory is used)
    #[arg(long)]
    pub store_root: PathBuf,

    /// Safety mode this invocation claims to run in
    #[arg(long, default_value = "shadow")]
    pub mode: String,

    /// Drop the dry-run flag (the guard will reject this)
    #[arg(long)]
    pub no_dry_run: bool,

    /// Maximum newest-tick age in seconds (overrides config)
    #[arg(long)]
    pub max_age_sec: Option<u64>,

    /// Minimum expected tick count (overrides config)
    #[arg(long)]
    pub min_ticks: Option<u64>,

    /// Print the document as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the metrics aggregator.
pub fn run(args: &MetricsArgs, config: &GateConfig) -> u8 {
    let guard = match build_guard(config) {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("ptgate metrics: {error}");
            return codes::USAGE;
        },
    };
    let ctx = build_context(&args.mode, args.no_dry_run);
    let observer = TickObserver::new(config.tick_prefix.clone());
    let thresholds = Thresholds {
        max_age_sec: args.max_age_sec.unwrap_or(config.thresholds.max_age_sec),
        min_ticks: args.min_ticks.unwrap_or(config.thresholds.min_ticks),
    };
    let aggregator = MetricsAggregator::new(&observer, thresholds);
    let head_ref = resolve_head_ref(config.repo_dir.as_deref());
    let writer = EvidenceSnapshotWriter::new(args.store_root.join("metrics"), head_ref);

    match aggregator.run(&ctx, &guard, &writer, &args.out_dir) {
        Ok(outcome) => {
            if args.json {
                match serde_json::to_string_pretty(&outcome.document) {
                    Ok(json) => println!("{json}"),
                    Err(error) => {
                        eprintln!("ptgate metrics: {error}");
                        return codes::INTERNAL;
                    },
                }
            } else {
                print!("{}", outcome.document.render_text());
                println!("evidence={}", outcome.evidence.pin.display());
            }
            codes::SUCCESS
        },
        Err(error) => {
            eprintln!("ptgate metrics: {error}");
            match error {
                MetricsError::Guard(_) => codes::GATE_FAILED,
                _ => codes::INTERNAL,
            }
        },
    }
}
