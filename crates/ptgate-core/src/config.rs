//! Supervisor configuration.
//!
//! All tunables — safety-mode allow-list, environment deny-patterns,
//! staleness thresholds, tick conventions, job names — live in one
//! [`GateConfig`] struct that is loaded once at the CLI boundary and
//! threaded through every component constructor. No component reads
//! process-wide environment or ambient globals.
//!
//! Configuration is TOML; unknown keys are rejected so a typo fails
//! loudly instead of silently running with defaults.

use std::path::{Path, PathBuf};

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fsutil::{self, FsError};
use crate::guard::Mode;

/// Maximum configuration file size for bounded reads.
pub const MAX_CONFIG_FILE_SIZE: u64 = 64 * 1024;

/// Default staleness threshold: newest tick older than this fails the
/// health gate (15 minutes).
pub const DEFAULT_MAX_AGE_SEC: u64 = 900;

/// Default minimum tick count before the metrics aggregator stops
/// alerting `insufficient_ticks`.
pub const DEFAULT_MIN_TICKS: u64 = 2;

/// Default naming prefix of tick directories under the out dir.
pub const DEFAULT_TICK_PREFIX: &str = "tick_";

/// Default environment deny-patterns.
///
/// Matched against variable *names* only. Two families: secret-like
/// material that must never be present in a supervised invocation, and
/// live/armed toggles that indicate a configuration capable of real
/// trading.
pub const DEFAULT_DENY_ENV_PATTERNS: &[&str] = &[
    "(?i)(secret|token|password|passwd|api_key|credential)",
    "(?i)(^|_)(live|record|armed|arm|enable|enabled|confirm|confirmed)(_|$)",
];

/// Default filenames of which at least one must exist in a complete tick
/// directory.
pub const DEFAULT_EXPECTED_TICK_ARTIFACTS: &[&str] = &["result.json", "result.txt"];

/// Staleness and volume thresholds shared by the health gate, the
/// metrics aggregator and the meta gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Thresholds {
    /// Maximum allowed age of the newest tick, in whole seconds.
    /// The boundary is inclusive: an age exactly equal to this passes.
    pub max_age_sec: u64,
    /// Minimum number of ticks expected in the out dir.
    pub min_ticks: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_age_sec: DEFAULT_MAX_AGE_SEC,
            min_ticks: DEFAULT_MIN_TICKS,
        }
    }
}

/// Configuration error taxonomy. Exit class "usage error" at the CLI
/// boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("cannot read config {}: {detail}", .path.display())]
    Read {
        /// The offending path.
        path: PathBuf,
        /// Human-readable failure detail.
        detail: String,
    },

    /// Configuration file could not be parsed.
    #[error("cannot parse config {}: {detail}", .path.display())]
    Parse {
        /// The offending path.
        path: PathBuf,
        /// Parser diagnostic.
        detail: String,
    },

    /// A threshold value is outside its valid range.
    #[error("invalid threshold {field}={value}: {reason}")]
    InvalidThreshold {
        /// Field name.
        field: &'static str,
        /// Rejected value.
        value: u64,
        /// Why it is rejected.
        reason: &'static str,
    },

    /// A deny-pattern does not compile.
    #[error("invalid deny pattern: {detail}")]
    InvalidDenyPattern {
        /// Regex compiler diagnostic.
        detail: String,
    },

    /// The allow-list names a mode the system refuses to define behavior
    /// for.
    #[error("mode '{mode}' cannot be allow-listed")]
    ModeNotAllowListable {
        /// The rejected mode name.
        mode: String,
    },

    /// The allow-list is empty.
    #[error("allowed_modes must not be empty")]
    EmptyAllowList,

    /// The tick prefix is empty.
    #[error("tick_prefix must not be empty")]
    EmptyTickPrefix,

    /// A pidfile exists but its content is not a decimal PID.
    #[error("malformed pidfile {}: {detail}", .path.display())]
    MalformedPidfile {
        /// The offending pidfile.
        path: PathBuf,
        /// What was wrong with its content.
        detail: String,
    },
}

/// Top-level supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateConfig {
    /// Safety modes the guard accepts. Only `shadow` and `paper` are
    /// ever valid entries; the list may be narrowed, never widened.
    #[serde(default = "default_allowed_modes")]
    pub allowed_modes: Vec<Mode>,

    /// Regex deny-patterns matched against environment variable names.
    #[serde(default = "default_deny_env_patterns")]
    pub deny_env_patterns: Vec<String>,

    /// Staleness and volume thresholds.
    #[serde(default)]
    pub thresholds: Thresholds,

    /// Naming prefix of tick directories under the out dir.
    #[serde(default = "default_tick_prefix")]
    pub tick_prefix: String,

    /// Filenames of which at least one must exist per tick directory
    /// when artifact completeness is enforced.
    #[serde(default = "default_expected_tick_artifacts")]
    pub expected_tick_artifacts: Vec<String>,

    /// Whether the health gate enforces per-tick artifact completeness.
    #[serde(default)]
    pub require_tick_artifacts: bool,

    /// Pidfile of the readiness-loop supervisor, if one runs.
    #[serde(default)]
    pub pidfile: Option<PathBuf>,

    /// Scheduled jobs that feed the tick tree (queried by the meta gate,
    /// stopped by the stop playbook).
    #[serde(default)]
    pub jobs: Vec<String>,

    /// Repository the pin's head reference is resolved from.
    #[serde(default)]
    pub repo_dir: Option<PathBuf>,
}

fn default_allowed_modes() -> Vec<Mode> {
    vec![Mode::Shadow, Mode::Paper]
}

fn default_deny_env_patterns() -> Vec<String> {
    DEFAULT_DENY_ENV_PATTERNS
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn default_tick_prefix() -> String {
    DEFAULT_TICK_PREFIX.to_string()
}

fn default_expected_tick_artifacts() -> Vec<String> {
    DEFAULT_EXPECTED_TICK_ARTIFACTS
        .iter()
        .map(ToString::to_string)
        .collect()
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            allowed_modes: default_allowed_modes(),
            deny_env_patterns: default_deny_env_patterns(),
            thresholds: Thresholds::default(),
            tick_prefix: default_tick_prefix(),
            expected_tick_artifacts: default_expected_tick_artifacts(),
            require_tick_artifacts: false,
            pidfile: None,
            jobs: Vec::new(),
            repo_dir: None,
        }
    }
}

impl GateConfig {
    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read, parsed, or
    /// fails validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let bytes =
            fsutil::read_bounded(path, MAX_CONFIG_FILE_SIZE).map_err(|e| match e {
                FsError::TooLarge { max, .. } => ConfigError::Read {
                    path: path.to_path_buf(),
                    detail: format!("file exceeds {max} bytes"),
                },
                other => ConfigError::Read {
                    path: path.to_path_buf(),
                    detail: other.to_string(),
                },
            })?;
        let content = String::from_utf8(bytes).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { detail, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                detail,
            },
            other => other,
        })
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML and the
    /// validation errors documented on [`GateConfig::validate`].
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            detail: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field ranges and cross-field rules.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidThreshold`] for zero thresholds,
    /// [`ConfigError::EmptyAllowList`] /
    /// [`ConfigError::ModeNotAllowListable`] for allow-list violations,
    /// [`ConfigError::InvalidDenyPattern`] for patterns that do not
    /// compile, and [`ConfigError::EmptyTickPrefix`] for an empty tick
    /// prefix.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thresholds.max_age_sec == 0 {
            return Err(ConfigError::InvalidThreshold {
                field: "max_age_sec",
                value: 0,
                reason: "must be at least 1 second",
            });
        }
        if self.thresholds.min_ticks == 0 {
            return Err(ConfigError::InvalidThreshold {
                field: "min_ticks",
                value: 0,
                reason: "must be at least 1 tick",
            });
        }
        if self.allowed_modes.is_empty() {
            return Err(ConfigError::EmptyAllowList);
        }
        for mode in &self.allowed_modes {
            if let Mode::Other(name) = mode {
                return Err(ConfigError::ModeNotAllowListable { mode: name.clone() });
            }
        }
        RegexSet::new(&self.deny_env_patterns).map_err(|e| ConfigError::InvalidDenyPattern {
            detail: e.to_string(),
        })?;
        if self.tick_prefix.is_empty() {
            return Err(ConfigError::EmptyTickPrefix);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        GateConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config = GateConfig::from_toml("").expect("parse");
        assert_eq!(config.thresholds.max_age_sec, DEFAULT_MAX_AGE_SEC);
        assert_eq!(config.thresholds.min_ticks, DEFAULT_MIN_TICKS);
        assert_eq!(config.tick_prefix, DEFAULT_TICK_PREFIX);
        assert_eq!(config.allowed_modes, vec![Mode::Shadow, Mode::Paper]);
    }

    #[test]
    fn rejects_zero_max_age() {
        let err = GateConfig::from_toml("[thresholds]\nmax_age_sec = 0\nmin_ticks = 2\n")
            .expect_err("zero max_age_sec is invalid");
        assert!(matches!(
            err,
            ConfigError::InvalidThreshold {
                field: "max_age_sec",
                ..
            }
        ));
    }

    #[test]
    fn rejects_live_in_allow_list() {
        let err = GateConfig::from_toml("allowed_modes = [\"shadow\", \"live\"]\n")
            .expect_err("live is never allow-listable");
        assert!(matches!(err, ConfigError::ModeNotAllowListable { .. }));
    }

    #[test]
    fn rejects_bad_deny_pattern() {
        let err = GateConfig::from_toml("deny_env_patterns = [\"(unclosed\"]\n")
            .expect_err("pattern must compile");
        assert!(matches!(err, ConfigError::InvalidDenyPattern { .. }));
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(GateConfig::from_toml("no_such_key = 1\n").is_err());
    }

    #[test]
    fn parses_full_config() {
        let config = GateConfig::from_toml(
            r#"
allowed_modes = ["shadow"]
tick_prefix = "tick_"
require_tick_artifacts = true
jobs = ["pt-readiness.timer", "pt-ingest.timer"]
pidfile = "/run/pt/readiness.pid"

[thresholds]
max_age_sec = 600
min_ticks = 3
"#,
        )
        .expect("parse");
        assert_eq!(config.thresholds.max_age_sec, 600);
        assert_eq!(config.jobs.len(), 2);
        assert!(config.require_tick_artifacts);
    }
}
