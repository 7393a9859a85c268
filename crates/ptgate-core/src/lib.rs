//! Guarded evidence & health-gate supervisor for the paper-trading ops
//! pipeline.
//!
//! The readiness loop for the trading automation writes one directory of
//! result files per periodic "tick". This crate supervises that loop:
//!
//! - **Guard**: every invocation is validated against an allow-listed safety
//!   mode, a mandatory dry-run flag, and a deny-list of armed/secret
//!   environment toggles before anything is written ([`guard`]).
//! - **Evidence**: each check run captures an immutable, checksummed,
//!   bundled evidence unit whose pin file is the completeness marker
//!   ([`manifest`], [`evidence`]).
//! - **Gates**: tick freshness, supervisor liveness and artifact
//!   completeness roll up into a pass/fail health verdict ([`tick`],
//!   [`health`]), an alerting metrics document ([`metrics`]), and a
//!   composed operator-facing meta verdict ([`meta`]).
//! - **Retention**: evidence storage is bounded by count-based pruning of
//!   whole units ([`retention`]).
//! - **Stop**: the operator playbook that stops every feeding job and
//!   records one final evidence unit proving it did ([`stop`]).
//!
//! # Error Model
//!
//! Components return structured errors and never call `process::exit`;
//! only the CLI boundary converts the taxonomy (guard rejection, scan
//! failure, integrity mismatch, config error) into exit codes. Nothing in
//! this crate retries: a stale tick or a missing artifact is an operator
//! signal, not something to paper over.
//!
//! # Concurrency Model
//!
//! Every entry point is a short-lived, single-threaded invocation. All
//! writes land in freshly created, timestamp-named paths, so concurrent
//! invocations do not collide; the retention pruner is the sole deleter
//! and takes an advisory file lock against itself.

pub mod config;
pub mod evidence;
pub mod fsutil;
pub mod guard;
pub mod health;
pub mod manifest;
pub mod meta;
pub mod metrics;
pub mod retention;
pub mod stop;
pub mod tick;

pub use config::{ConfigError, GateConfig, Thresholds};
pub use evidence::{EvidenceError, EvidenceSnapshotWriter, EvidenceUnit, PinRecord};
pub use guard::{ExecutionContext, GuardError, GuardEvaluator, Mode};
pub use health::{HealthGate, HealthOutcome, HealthParams, HealthVerdict};
pub use manifest::IntegrityError;
pub use meta::{JobControl, JobControlError, MetaGate, MetaOutcome, MetaVerdict};
pub use metrics::{MetricsAggregator, MetricsDocument, MetricsOutcome, TickStatus};
pub use retention::{PruneReport, RetentionPolicy};
pub use stop::{FailurePolicy, StopPlaybook, StopReport, StopRun};
pub use tick::{ScanError, TickObserver, TickScan};
