//! `ptgate prune` — bound evidence storage by count-based retention.

use std::path::PathBuf;

use clap::Args;
use ptgate_core::retention::{RetentionError, RetentionPolicy};

use crate::exit_codes::codes;

/// Arguments for `ptgate prune`.
#[derive(Debug, Args)]
pub struct PruneArgs {
    /// Evidence store to prune (one gate family, e.g.
    /// /var/lib/ptgate/evidence/health)
    #[arg(long)]
    pub store: PathBuf,

    /// Number of newest evidence units to keep
    #[arg(long, default_value_t = 10)]
    pub keep: usize,

    /// Also delete orphan groups older than every retained unit
    #[arg(long)]
    pub delete_orphans: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the retention pruner.
pub fn run(args: &PruneArgs) -> u8 {
    let policy = RetentionPolicy::new(args.keep).with_delete_orphans(args.delete_orphans);
    match policy.prune(&args.store) {
        Ok(report) => {
            if args.json {
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{json}"),
                    Err(error) => {
                        eprintln!("ptgate prune: {error}");
                        return codes::INTERNAL;
                    },
                }
            } else if report.noop {
                println!(
                    "no-op: {} unit(s) present, keep={} ({} orphan group(s))",
                    report.examined, args.keep, report.orphans,
                );
            } else {
                println!(
                    "deleted {} unit(s), {} remaining ({} orphan(s) deleted, {} error(s))",
                    report.deleted,
                    report.remaining,
                    report.orphans_deleted,
                    report.errors.len(),
                );
                for error in &report.errors {
                    eprintln!("ptgate prune: {error}");
                }
            }
            if report.errors.is_empty() {
                codes::SUCCESS
            } else {
                codes::INTERNAL
            }
        },
        Err(error) => {
            eprintln!("ptgate prune: {error}");
            match error {
                RetentionError::StoreMissing { .. } => codes::USAGE,
                _ => codes::INTERNAL,
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    fn args(store: PathBuf, keep: usize) -> PruneArgs {
        PruneArgs {
            store,
            keep,
            delete_orphans: false,
            json: false,
        }
    }

    #[test]
    fn missing_store_maps_to_usage() {
        let tmp = tempdir().expect("tmp");
        assert_eq!(run(&args(tmp.path().join("nope"), 3)), codes::USAGE);
    }

    #[test]
    fn noop_prune_succeeds() {
        let tmp = tempdir().expect("tmp");
        fs::create_dir(tmp.path().join("store")).expect("store");
        assert_eq!(run(&args(tmp.path().join("store"), 3)), codes::SUCCESS);
    }
}
