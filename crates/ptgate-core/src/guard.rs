//! Execution guard: the validation every other component runs before it
//! is allowed to write anything.
//!
//! The readiness loop must only ever operate in an allow-listed safety
//! mode (`shadow` or `paper`), with the dry-run flag set, and without any
//! deny-listed environment toggle (armed/live switches, secret material)
//! present. The guard is pure: it inspects an [`ExecutionContext`] and
//! either accepts or rejects, with no side effects on either path.
//!
//! Check order is fixed and deterministic — mode, then dry-run, then
//! environment — so the same invalid context always reports the same
//! first failure.

use std::collections::BTreeMap;
use std::fmt;

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

/// Safety mode an invocation claims to run under.
///
/// Anything outside the explicit allow-list (for example `live` or
/// `record`) is carried verbatim as [`Mode::Other`] and only ever
/// rejected; no component defines behavior for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Mode {
    /// Shadow trading: decisions computed, nothing routed anywhere.
    Shadow,
    /// Paper trading: orders routed to the simulated book only.
    Paper,
    /// Any mode outside the allow-list, kept verbatim for reporting.
    Other(String),
}

impl From<String> for Mode {
    fn from(value: String) -> Self {
        match value.as_str() {
            "shadow" => Self::Shadow,
            "paper" => Self::Paper,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for Mode {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<Mode> for String {
    fn from(mode: Mode) -> Self {
        mode.to_string()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shadow => f.write_str("shadow"),
            Self::Paper => f.write_str("paper"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

/// Everything the guard looks at, captured once at the process boundary.
///
/// The environment snapshot is taken when the context is built; deep call
/// paths never read process-wide state.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Claimed safety mode.
    pub mode: Mode,
    /// Whether the invocation runs with mutation disabled downstream.
    pub dry_run: bool,
    /// Environment snapshot (sorted for deterministic reporting).
    pub env: BTreeMap<String, String>,
}

impl ExecutionContext {
    /// Build a context from explicit parts.
    #[must_use]
    pub fn new(mode: Mode, dry_run: bool, env: BTreeMap<String, String>) -> Self {
        Self { mode, dry_run, env }
    }

    /// Build a context by snapshotting the process environment.
    ///
    /// This is the only place ambient environment is read; call it at the
    /// CLI boundary and thread the result through.
    #[must_use]
    pub fn from_process_env(mode: Mode, dry_run: bool) -> Self {
        Self {
            mode,
            dry_run,
            env: std::env::vars().collect(),
        }
    }
}

/// Guard rejection taxonomy. Always fatal, never retried, reported
/// verbatim to the operator before any mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    /// The claimed mode is outside the allow-list.
    #[error("mode '{mode}' is not allow-listed (allowed: {})", format_modes(.allowed))]
    ModeNotAllowed {
        /// The rejected mode.
        mode: Mode,
        /// The configured allow-list at rejection time.
        allowed: Vec<Mode>,
    },

    /// The invocation did not set the dry-run flag.
    #[error("dry-run is required; refusing a live-capable invocation")]
    DryRunRequired,

    /// Deny-listed environment variables are present.
    ///
    /// Carries every matching name so the operator can clear them all in
    /// one pass.
    #[error("deny-listed environment variables present: {}", .names.join(", "))]
    DeniedEnvPresent {
        /// All matching variable names, sorted.
        names: Vec<String>,
    },
}

impl GuardError {
    /// Stable machine-readable code for verdict payloads.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ModeNotAllowed { .. } => "mode_not_allowed",
            Self::DryRunRequired => "dry_run_required",
            Self::DeniedEnvPresent { .. } => "denied_env_present",
        }
    }
}

fn format_modes(modes: &[Mode]) -> String {
    modes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Pure validator for an [`ExecutionContext`].
#[derive(Debug)]
pub struct GuardEvaluator {
    allowed: Vec<Mode>,
    deny: RegexSet,
}

impl GuardEvaluator {
    /// Build an evaluator from an allow-list and deny-patterns.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptyAllowList`] for an empty allow-list,
    /// [`ConfigError::ModeNotAllowListable`] if the list names anything
    /// outside `shadow`/`paper`, and
    /// [`ConfigError::InvalidDenyPattern`] for a pattern that does not
    /// compile.
    pub fn new<S: AsRef<str>>(allowed: &[Mode], deny_patterns: &[S]) -> Result<Self, ConfigError> {
        if allowed.is_empty() {
            return Err(ConfigError::EmptyAllowList);
        }
        for mode in allowed {
            if let Mode::Other(name) = mode {
                return Err(ConfigError::ModeNotAllowListable { mode: name.clone() });
            }
        }
        let deny = RegexSet::new(deny_patterns.iter().map(AsRef::as_ref)).map_err(|e| {
            ConfigError::InvalidDenyPattern {
                detail: e.to_string(),
            }
        })?;
        Ok(Self {
            allowed: allowed.to_vec(),
            deny,
        })
    }

    /// Validate a context. No side effects on either path.
    ///
    /// # Errors
    ///
    /// Returns the first failing check in the fixed order: mode,
    /// dry-run, environment. The environment check itself collects every
    /// matching variable name before failing.
    pub fn evaluate(&self, ctx: &ExecutionContext) -> Result<(), GuardError> {
        if !self.allowed.contains(&ctx.mode) {
            return Err(GuardError::ModeNotAllowed {
                mode: ctx.mode.clone(),
                allowed: self.allowed.clone(),
            });
        }
        if !ctx.dry_run {
            return Err(GuardError::DryRunRequired);
        }
        let names: Vec<String> = ctx
            .env
            .keys()
            .filter(|name| self.deny.is_match(name))
            .cloned()
            .collect();
        if !names.is_empty() {
            return Err(GuardError::DeniedEnvPresent { names });
        }
        Ok(())
    }
}
