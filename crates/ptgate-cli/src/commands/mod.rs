//! Command implementations. Each `run` returns the process exit code;
//! only this layer converts the core error taxonomy into exit classes
//! and operator-facing text.

pub mod health;
pub mod meta;
pub mod metrics;
pub mod prune;
pub mod stop;
pub mod verify;

use ptgate_core::config::GateConfig;
use ptgate_core::guard::{ExecutionContext, GuardEvaluator, Mode};
use ptgate_core::ConfigError;

/// Build the guard evaluator from configuration.
pub(crate) fn build_guard(config: &GateConfig) -> Result<GuardEvaluator, ConfigError> {
    GuardEvaluator::new(&config.allowed_modes, &config.deny_env_patterns)
}

/// Snapshot the execution context at the process boundary.
pub(crate) fn build_context(mode: &str, no_dry_run: bool) -> ExecutionContext {
    ExecutionContext::from_process_env(Mode::from(mode), !no_dry_run)
}
