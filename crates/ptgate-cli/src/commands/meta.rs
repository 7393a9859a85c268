//! `ptgate meta` — the composed readiness verdict operators and CI
//! consult.

use std::path::PathBuf;

use clap::Args;
use ptgate_core::config::GateConfig;
use ptgate_core::evidence::{resolve_head_ref, EvidenceSnapshotWriter};
use ptgate_core::meta::{MetaError, MetaGate, MetaStores};

use crate::commands::{build_context, build_guard};
use crate::exit_codes::codes;
use crate::systemd::SystemdJobControl;

/// Arguments for `ptgate meta`.
#[derive(Debug, Args)]
pub struct MetaArgs {
    /// Evidence store root holding the health/, metrics/ and meta/
    /// family subdirectories
    #[arg(long)]
    pub store_root: PathBuf,

    /// Optional ingest-gate evidence store consulted as a third
    /// sub-check
    #[arg(long)]
    pub ingest_store: Option<PathBuf>,

    /// Safety mode this invocation claims to run in
    #[arg(long, default_value = "shadow")]
    pub mode: String,

    /// Drop the dry-run flag (the guard will reject this)
    #[arg(long)]
    pub no_dry_run: bool,

    /// Query the per-user service manager (systemctl --user)
    #[arg(long)]
    pub user: bool,

    /// Job to require running (repeatable; overrides config)
    #[arg(long = "job")]
    pub jobs: Vec<String>,

    /// Print the verdict as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the meta gate.
pub fn run(args: &MetaArgs, config: &GateConfig) -> u8 {
    let guard = match build_guard(config) {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("ptgate meta: {error}");
            return codes::USAGE;
        },
    };
    let ctx = build_context(&args.mode, args.no_dry_run);
    let head_ref = resolve_head_ref(config.repo_dir.as_deref());
    let writer = EvidenceSnapshotWriter::new(args.store_root.join("meta"), head_ref);
    let control = SystemdJobControl { user: args.user };
    let gate = MetaGate::new(&guard, &writer, &control, config.thresholds);

    let jobs = if args.jobs.is_empty() {
        config.jobs.clone()
    } else {
        args.jobs.clone()
    };
    let health_store = args.store_root.join("health");
    let metrics_store = args.store_root.join("metrics");
    let stores = MetaStores {
        health: &health_store,
        metrics: &metrics_store,
        ingest: args.ingest_store.as_deref(),
    };

    match gate.evaluate(&ctx, &jobs, &stores) {
        Ok(outcome) => {
            if args.json {
                match serde_json::to_string_pretty(&outcome.verdict) {
                    Ok(json) => println!("{json}"),
                    Err(error) => {
                        eprintln!("ptgate meta: {error}");
                        return codes::INTERNAL;
                    },
                }
            } else if outcome.verdict.ok {
                println!("READY (evidence: {})", outcome.evidence.pin.display());
            } else {
                println!("NOT READY:");
                for reason in &outcome.verdict.reasons {
                    println!("  - {reason}");
                }
                println!("evidence: {}", outcome.evidence.pin.display());
            }
            if outcome.verdict.ok {
                codes::SUCCESS
            } else {
                codes::GATE_FAILED
            }
        },
        Err(error) => {
            eprintln!("ptgate meta: {error}");
            match error {
                MetaError::Guard(_) => codes::GATE_FAILED,
                _ => codes::INTERNAL,
            }
        },
    }
}
