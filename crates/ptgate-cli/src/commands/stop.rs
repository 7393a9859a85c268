//! `ptgate stop` — the operator playbook reversing "start".

use std::path::PathBuf;

use clap::Args;
use ptgate_core::config::GateConfig;
use ptgate_core::evidence::{resolve_head_ref, EvidenceSnapshotWriter};
use ptgate_core::stop::{FailurePolicy, StopError, StopPlaybook};

use crate::commands::{build_context, build_guard};
use crate::exit_codes::codes;
use crate::systemd::SystemdJobControl;

/// Arguments for `ptgate stop`.
#[derive(Debug, Args)]
pub struct StopArgs {
    /// Evidence store root (a `stop/` subdirectory is used)
    #[arg(long)]
    pub store_root: PathBuf,

    /// Safety mode this invocation claims to run in
    #[arg(long, default_value = "shadow")]
    pub mode: String,

    /// Drop the dry-run flag (the guard will reject this)
    #[arg(long)]
    pub no_dry_run: bool,

    /// Talk to the per-user service manager (systemctl --user)
    #[arg(long)]
    pub user: bool,

    /// Job to stop (repeatable; overrides config)
    #[arg(long = "job")]
    pub jobs: Vec<String>,

    /// Keep going past failing jobs instead of aborting
    #[arg(long)]
    pub warn_only: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the stop playbook.
pub fn run(args: &StopArgs, config: &GateConfig) -> u8 {
    let guard = match build_guard(config) {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("ptgate stop: {error}");
            return codes::USAGE;
        },
    };
    let jobs = if args.jobs.is_empty() {
        config.jobs.clone()
    } else {
        args.jobs.clone()
    };
    if jobs.is_empty() {
        eprintln!("ptgate stop: no jobs configured and none passed via --job");
        return codes::USAGE;
    }

    let ctx = build_context(&args.mode, args.no_dry_run);
    let head_ref = resolve_head_ref(config.repo_dir.as_deref());
    let writer = EvidenceSnapshotWriter::new(args.store_root.join("stop"), head_ref);
    let control = SystemdJobControl { user: args.user };
    let policy = if args.warn_only {
        FailurePolicy::WarnOnly
    } else {
        FailurePolicy::FailFast
    };
    let playbook = StopPlaybook::new(&guard, &writer, &control, policy);

    match playbook.run(&ctx, &jobs) {
        Ok(outcome) => {
            if args.json {
                match serde_json::to_string_pretty(&outcome.report) {
                    Ok(json) => println!("{json}"),
                    Err(error) => {
                        eprintln!("ptgate stop: {error}");
                        return codes::INTERNAL;
                    },
                }
            } else {
                print!("{}", outcome.report.render_text());
                println!("evidence={}", outcome.evidence.pin.display());
            }
            if outcome.report.all_stopped {
                codes::SUCCESS
            } else {
                codes::GATE_FAILED
            }
        },
        Err(error) => {
            eprintln!("ptgate stop: {error}");
            match error {
                StopError::Guard(_) | StopError::JobStop { .. } => codes::GATE_FAILED,
                _ => codes::INTERNAL,
            }
        },
    }
}
