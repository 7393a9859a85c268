//! Health gate: pass/fail verdict over the tick tree plus supervisor
//! liveness, with one evidence unit per evaluated run.
//!
//! Gates run in a fixed order and stop at the first terminal failure:
//!
//! 1. guard evaluation (a rejection writes nothing at all),
//! 2. ticks exist,
//! 3. newest tick is fresh (inclusive boundary: age equal to the
//!    threshold still passes),
//! 4. the supervisor pidfile, when present, names a live process,
//! 5. every tick directory carries at least one expected artifact
//!    (only when enforcement is enabled).
//!
//! Whatever the verdict, an evaluated run captures it as an evidence
//! unit so health history is itself auditable.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::evidence::{EvidenceError, EvidenceSnapshotWriter, EvidenceUnit};
use crate::fsutil::{self, MAX_PIDFILE_SIZE};
use crate::guard::{ExecutionContext, GuardError, GuardEvaluator};
use crate::tick::{ScanError, TickObserver, TickScan};

/// Schema identifier for health verdict payloads.
pub const HEALTH_VERDICT_SCHEMA: &str = "ptgate.health_verdict.v1";

/// Evidence label used by the health gate.
pub const HEALTH_LABEL: &str = "health";

/// Machine-readable verdict payload inside each evidence unit.
pub const VERDICT_FILE_NAME: &str = "verdict.json";

/// Plain-text verdict mirror for operators.
pub const VERDICT_TEXT_FILE_NAME: &str = "verdict.txt";

/// Verdict reason: no tick directories found (or the out dir is gone).
pub const REASON_NO_TICKS: &str = "no_ticks_found";

/// Verdict reason: newest tick is older than the threshold.
pub const REASON_TICKS_STALE: &str = "ticks_stale";

/// Verdict reason: pidfile present but empty or process unreachable.
pub const REASON_PIDFILE_STALE: &str = "pidfile_stale";

/// Verdict reason: at least one tick is missing all expected artifacts.
pub const REASON_MISSING_ARTIFACTS: &str = "missing_tick_artifacts";

/// Health gate error taxonomy. A FAIL verdict is not an error; these are
/// the conditions that prevent producing a verdict at all.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HealthError {
    /// Guard rejected the context before anything was written.
    #[error(transparent)]
    Guard(#[from] GuardError),

    /// Configuration problem (malformed pidfile content).
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Tick scan failed for a reason other than missing data.
    #[error(transparent)]
    Scan(#[from] ScanError),

    /// Evidence capture failed.
    #[error(transparent)]
    Evidence(#[from] EvidenceError),
}

/// Parameters of one health-gate run.
#[derive(Debug, Clone)]
pub struct HealthParams<'a> {
    /// Tick out dir to scan.
    pub out_dir: &'a Path,
    /// Supervisor pidfile, if one is expected.
    pub pidfile: Option<&'a Path>,
    /// Maximum allowed newest-tick age, whole seconds, inclusive.
    pub max_age_sec: u64,
    /// Whether per-tick artifact completeness is enforced.
    pub require_artifacts: bool,
    /// Filenames of which at least one must exist per tick.
    pub expected_artifacts: &'a [String],
}

/// The health verdict document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthVerdict {
    /// Schema identifier.
    pub schema: String,
    /// Overall pass/fail.
    pub ok: bool,
    /// Terminal failure reason code, absent on PASS.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Claimed safety mode of the run.
    pub mode: String,
    /// Newest tick directory name, if any.
    pub newest_tick: Option<String>,
    /// Age of the newest tick in whole seconds, if any.
    pub newest_tick_age_sec: Option<u64>,
    /// Ticks missing all expected artifacts (0 when not enforced).
    pub missing_tick_artifacts: u64,
    /// Pidfile consulted, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pidfile: Option<PathBuf>,
    /// Whether the pidfile named a live process.
    pub pid_alive: bool,
    /// Evaluation timestamp, ISO-basic UTC.
    pub checked_at_utc: String,
}

impl HealthVerdict {
    /// Plain-text mirror of the verdict, `key=value` per line.
    #[must_use]
    pub fn render_text(&self) -> String {
        format!(
            "ok={}\nreason={}\nmode={}\nnewest_tick={}\nnewest_tick_age_sec={}\n\
             missing_tick_artifacts={}\npid_alive={}\nchecked_at_utc={}\n",
            self.ok,
            self.reason.as_deref().unwrap_or("-"),
            self.mode,
            self.newest_tick.as_deref().unwrap_or("-"),
            self.newest_tick_age_sec
                .map_or_else(|| "-".to_string(), |v| v.to_string()),
            self.missing_tick_artifacts,
            self.pid_alive,
            self.checked_at_utc,
        )
    }
}

/// Outcome of a health-gate run: the verdict plus the evidence unit that
/// recorded it.
#[derive(Debug)]
pub struct HealthOutcome {
    /// The verdict.
    pub verdict: HealthVerdict,
    /// The evidence unit carrying the verdict payload.
    pub evidence: EvidenceUnit,
}

/// The health gate itself.
#[derive(Debug)]
pub struct HealthGate<'a> {
    guard: &'a GuardEvaluator,
    observer: &'a TickObserver,
    writer: &'a EvidenceSnapshotWriter,
}

impl<'a> HealthGate<'a> {
    /// Assemble a gate from its collaborators.
    #[must_use]
    pub fn new(
        guard: &'a GuardEvaluator,
        observer: &'a TickObserver,
        writer: &'a EvidenceSnapshotWriter,
    ) -> Self {
        Self {
            guard,
            observer,
            writer,
        }
    }

    /// Run the gate.
    ///
    /// # Errors
    ///
    /// Returns [`HealthError::Guard`] on guard rejection (nothing is
    /// written in that case), [`HealthError::Config`] for a malformed
    /// pidfile, and scan/evidence failures that prevent a verdict.
    pub fn check(
        &self,
        ctx: &ExecutionContext,
        params: &HealthParams<'_>,
    ) -> Result<HealthOutcome, HealthError> {
        // Guard before anything else; a rejection must leave the store
        // untouched.
        self.guard.evaluate(ctx)?;

        let scan = match self.observer.scan(params.out_dir) {
            Ok(scan) => scan,
            Err(ScanError::OutDirMissing { path }) => {
                tracing::warn!(out_dir = %path.display(), "tick out dir missing");
                TickScan::default()
            },
            Err(other) => return Err(other.into()),
        };

        let verdict = self.evaluate(ctx, params, &scan)?;
        tracing::info!(
            ok = verdict.ok,
            reason = verdict.reason.as_deref().unwrap_or("-"),
            newest_tick = verdict.newest_tick.as_deref().unwrap_or("-"),
            "health gate evaluated"
        );

        let payload = serde_json::to_vec_pretty(&verdict).map_err(|e| {
            EvidenceError::Producer {
                label: HEALTH_LABEL.to_string(),
                detail: format!("serializing verdict: {e}"),
            }
        })?;
        let text = verdict.render_text();
        let evidence = self.writer.write(HEALTH_LABEL, |dir| {
            fsutil::atomic_write(&dir.join(VERDICT_FILE_NAME), &payload)?;
            fsutil::atomic_write(&dir.join(VERDICT_TEXT_FILE_NAME), text.as_bytes())?;
            Ok(())
        })?;

        Ok(HealthOutcome { verdict, evidence })
    }

    fn evaluate(
        &self,
        ctx: &ExecutionContext,
        params: &HealthParams<'_>,
        scan: &TickScan,
    ) -> Result<HealthVerdict, HealthError> {
        let mut verdict = HealthVerdict {
            schema: HEALTH_VERDICT_SCHEMA.to_string(),
            ok: false,
            reason: None,
            mode: ctx.mode.to_string(),
            newest_tick: scan.newest_name(),
            newest_tick_age_sec: scan.newest_age_sec,
            missing_tick_artifacts: 0,
            pidfile: params.pidfile.map(Path::to_path_buf),
            pid_alive: false,
            checked_at_utc: chrono::Utc::now()
                .format(crate::evidence::TIMESTAMP_FORMAT)
                .to_string(),
        };

        if scan.newest.is_none() {
            verdict.reason = Some(REASON_NO_TICKS.to_string());
            return Ok(verdict);
        }

        if let Some(age) = scan.newest_age_sec {
            if !age_within_threshold(age, params.max_age_sec) {
                verdict.reason = Some(REASON_TICKS_STALE.to_string());
                return Ok(verdict);
            }
        }

        match self.probe_pidfile(params.pidfile)? {
            PidProbe::NoPidfile => {},
            PidProbe::Alive => verdict.pid_alive = true,
            PidProbe::Stale => {
                verdict.reason = Some(REASON_PIDFILE_STALE.to_string());
                return Ok(verdict);
            },
        }

        if params.require_artifacts {
            let missing = count_ticks_missing_artifacts(&scan.ticks, params.expected_artifacts);
            verdict.missing_tick_artifacts = missing;
            if missing > 0 {
                verdict.reason = Some(REASON_MISSING_ARTIFACTS.to_string());
                return Ok(verdict);
            }
        }

        verdict.ok = true;
        Ok(verdict)
    }

    fn probe_pidfile(&self, pidfile: Option<&Path>) -> Result<PidProbe, HealthError> {
        let Some(path) = pidfile else {
            return Ok(PidProbe::NoPidfile);
        };
        if !path.exists() {
            // An absent pidfile is not a failure: the health check runs
            // independently of a supervisor daemon.
            return Ok(PidProbe::NoPidfile);
        }
        let bytes = fsutil::read_bounded(path, MAX_PIDFILE_SIZE).map_err(|e| {
            ConfigError::MalformedPidfile {
                path: path.to_path_buf(),
                detail: e.to_string(),
            }
        })?;
        let content = String::from_utf8_lossy(&bytes);
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Ok(PidProbe::Stale);
        }
        let pid: u32 = trimmed
            .parse()
            .map_err(|_| ConfigError::MalformedPidfile {
                path: path.to_path_buf(),
                detail: format!("not a decimal PID: '{trimmed}'"),
            })?;
        if fsutil::is_pid_alive(pid) {
            Ok(PidProbe::Alive)
        } else {
            Ok(PidProbe::Stale)
        }
    }
}

enum PidProbe {
    NoPidfile,
    Alive,
    Stale,
}

/// Inclusive staleness boundary: an age exactly equal to the threshold
/// still passes; one second past it fails.
#[must_use]
pub fn age_within_threshold(age_sec: u64, max_age_sec: u64) -> bool {
    age_sec <= max_age_sec
}

/// Count tick directories carrying none of the expected artifact names.
fn count_ticks_missing_artifacts(ticks: &[PathBuf], expected: &[String]) -> u64 {
    ticks
        .iter()
        .filter(|tick| !expected.iter().any(|name| tick.join(name).is_file()))
        .count() as u64
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;

    use tempfile::tempdir;

    use super::*;
    use crate::config::DEFAULT_DENY_ENV_PATTERNS;
    use crate::evidence::latest_pin;
    use crate::guard::Mode;

    struct Fixture {
        guard: GuardEvaluator,
        observer: TickObserver,
        writer: EvidenceSnapshotWriter,
        out_dir: PathBuf,
        _tmp: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let tmp = tempdir().expect("tmp");
        let out_dir = tmp.path().join("out");
        fs::create_dir(&out_dir).expect("out dir");
        Fixture {
            guard: GuardEvaluator::new(&[Mode::Shadow, Mode::Paper], DEFAULT_DENY_ENV_PATTERNS)
                .expect("guard"),
            observer: TickObserver::new("tick_"),
            writer: EvidenceSnapshotWriter::new(tmp.path().join("store"), "test-head"),
            out_dir,
            _tmp: tmp,
        }
    }

    fn safe_ctx() -> ExecutionContext {
        ExecutionContext::new(Mode::Shadow, true, BTreeMap::new())
    }

    fn tick(fx: &Fixture, name: &str, artifacts: &[&str]) -> PathBuf {
        let dir = fx.out_dir.join(name);
        fs::create_dir(&dir).expect("tick dir");
        for artifact in artifacts {
            fs::write(dir.join(artifact), b"ready\n").expect("artifact");
        }
        dir
    }

    fn params<'a>(fx: &'a Fixture, expected: &'a [String]) -> HealthParams<'a> {
        HealthParams {
            out_dir: &fx.out_dir,
            pidfile: None,
            max_age_sec: 900,
            require_artifacts: false,
            expected_artifacts: expected,
        }
    }

    #[test]
    fn passes_with_fresh_ticks() {
        let fx = fixture();
        tick(&fx, "tick_001", &["result.txt"]);
        let gate = HealthGate::new(&fx.guard, &fx.observer, &fx.writer);
        let outcome = gate.check(&safe_ctx(), &params(&fx, &[])).expect("check");
        assert!(outcome.verdict.ok);
        assert!(outcome.verdict.reason.is_none());
        assert!(outcome.evidence.pin.is_file());
    }

    #[test]
    fn fails_without_ticks_but_still_writes_evidence() {
        let fx = fixture();
        let gate = HealthGate::new(&fx.guard, &fx.observer, &fx.writer);
        let outcome = gate.check(&safe_ctx(), &params(&fx, &[])).expect("check");
        assert!(!outcome.verdict.ok);
        assert_eq!(outcome.verdict.reason.as_deref(), Some(REASON_NO_TICKS));
        assert!(outcome.evidence.pin.is_file());
    }

    #[test]
    fn missing_out_dir_reads_as_no_ticks() {
        let fx = fixture();
        fs::remove_dir(&fx.out_dir).expect("remove out dir");
        let gate = HealthGate::new(&fx.guard, &fx.observer, &fx.writer);
        let outcome = gate.check(&safe_ctx(), &params(&fx, &[])).expect("check");
        assert_eq!(outcome.verdict.reason.as_deref(), Some(REASON_NO_TICKS));
    }

    #[test]
    fn age_threshold_boundary_is_inclusive() {
        assert!(age_within_threshold(900, 900));
        assert!(!age_within_threshold(901, 900));
        assert!(age_within_threshold(0, 900));
    }

    #[test]
    fn tick_near_threshold_still_passes() {
        let fx = fixture();
        let dir = tick(&fx, "tick_001", &[]);
        let now = filetime::FileTime::now();
        let past = filetime::FileTime::from_unix_time(now.unix_seconds() - 895, 0);
        filetime::set_file_mtime(&dir, past).expect("mtime");
        let gate = HealthGate::new(&fx.guard, &fx.observer, &fx.writer);
        let outcome = gate.check(&safe_ctx(), &params(&fx, &[])).expect("check");
        assert!(
            outcome.verdict.ok,
            "age just under the threshold must pass (got {:?})",
            outcome.verdict.reason,
        );
    }

    #[test]
    fn age_past_threshold_fails_stale() {
        let fx = fixture();
        let dir = tick(&fx, "tick_001", &[]);
        let now = filetime::FileTime::now();
        let past = filetime::FileTime::from_unix_time(now.unix_seconds() - 905, 0);
        filetime::set_file_mtime(&dir, past).expect("mtime");
        let gate = HealthGate::new(&fx.guard, &fx.observer, &fx.writer);
        let outcome = gate.check(&safe_ctx(), &params(&fx, &[])).expect("check");
        assert!(!outcome.verdict.ok);
        assert_eq!(outcome.verdict.reason.as_deref(), Some(REASON_TICKS_STALE));
    }

    #[test]
    fn absent_pidfile_is_not_a_failure() {
        let fx = fixture();
        tick(&fx, "tick_001", &[]);
        let gate = HealthGate::new(&fx.guard, &fx.observer, &fx.writer);
        let missing = fx.out_dir.join("no-such.pid");
        let mut p = params(&fx, &[]);
        p.pidfile = Some(&missing);
        let outcome = gate.check(&safe_ctx(), &p).expect("check");
        assert!(outcome.verdict.ok);
        assert!(!outcome.verdict.pid_alive);
    }

    #[test]
    fn dead_pid_fails_stale() {
        let fx = fixture();
        tick(&fx, "tick_001", &[]);
        let pidfile = fx.out_dir.join("loop.pid");
        // PID near the kernel maximum is effectively never alive.
        fs::write(&pidfile, b"4194000\n").expect("pidfile");
        let gate = HealthGate::new(&fx.guard, &fx.observer, &fx.writer);
        let mut p = params(&fx, &[]);
        p.pidfile = Some(&pidfile);
        let outcome = gate.check(&safe_ctx(), &p).expect("check");
        assert!(!outcome.verdict.ok);
        assert_eq!(outcome.verdict.reason.as_deref(), Some(REASON_PIDFILE_STALE));
    }

    #[test]
    fn live_pid_passes() {
        let fx = fixture();
        tick(&fx, "tick_001", &[]);
        let pidfile = fx.out_dir.join("loop.pid");
        fs::write(&pidfile, format!("{}\n", std::process::id())).expect("pidfile");
        let gate = HealthGate::new(&fx.guard, &fx.observer, &fx.writer);
        let mut p = params(&fx, &[]);
        p.pidfile = Some(&pidfile);
        let outcome = gate.check(&safe_ctx(), &p).expect("check");
        assert!(outcome.verdict.ok);
        assert!(outcome.verdict.pid_alive);
    }

    #[test]
    fn empty_pidfile_fails_stale() {
        let fx = fixture();
        tick(&fx, "tick_001", &[]);
        let pidfile = fx.out_dir.join("loop.pid");
        fs::write(&pidfile, b"").expect("pidfile");
        let gate = HealthGate::new(&fx.guard, &fx.observer, &fx.writer);
        let mut p = params(&fx, &[]);
        p.pidfile = Some(&pidfile);
        let outcome = gate.check(&safe_ctx(), &p).expect("check");
        assert_eq!(outcome.verdict.reason.as_deref(), Some(REASON_PIDFILE_STALE));
    }

    #[test]
    fn garbage_pidfile_is_a_config_error() {
        let fx = fixture();
        tick(&fx, "tick_001", &[]);
        let pidfile = fx.out_dir.join("loop.pid");
        fs::write(&pidfile, b"not-a-pid\n").expect("pidfile");
        let gate = HealthGate::new(&fx.guard, &fx.observer, &fx.writer);
        let mut p = params(&fx, &[]);
        p.pidfile = Some(&pidfile);
        let err = gate.check(&safe_ctx(), &p).expect_err("must error");
        assert!(matches!(err, HealthError::Config(_)));
    }

    #[test]
    fn counts_every_incomplete_tick() {
        let fx = fixture();
        let expected = vec!["result.json".to_string(), "result.txt".to_string()];
        tick(&fx, "tick_001", &["result.txt"]);
        tick(&fx, "tick_002", &[]);
        tick(&fx, "tick_003", &["unrelated.log"]);
        let gate = HealthGate::new(&fx.guard, &fx.observer, &fx.writer);
        let mut p = params(&fx, &expected);
        p.require_artifacts = true;
        let outcome = gate.check(&safe_ctx(), &p).expect("check");
        assert!(!outcome.verdict.ok);
        assert_eq!(
            outcome.verdict.reason.as_deref(),
            Some(REASON_MISSING_ARTIFACTS),
        );
        assert_eq!(outcome.verdict.missing_tick_artifacts, 2);
    }

    #[test]
    fn guard_rejection_writes_nothing() {
        let fx = fixture();
        tick(&fx, "tick_001", &[]);
        let gate = HealthGate::new(&fx.guard, &fx.observer, &fx.writer);
        let ctx = ExecutionContext::new(Mode::from("live"), true, BTreeMap::new());
        let err = gate.check(&ctx, &params(&fx, &[])).expect_err("must reject");
        assert!(matches!(err, HealthError::Guard(_)));
        assert!(
            latest_pin(fx.writer.store_root()).expect("scan").is_none(),
            "guard rejection must not produce evidence",
        );
        assert!(!fx.writer.store_root().exists());
    }

    #[test]
    fn verdict_payload_is_readable_from_evidence() {
        let fx = fixture();
        tick(&fx, "tick_001", &[]);
        let gate = HealthGate::new(&fx.guard, &fx.observer, &fx.writer);
        let outcome = gate.check(&safe_ctx(), &params(&fx, &[])).expect("check");
        let raw = fs::read(outcome.evidence.dir.join(VERDICT_FILE_NAME)).expect("payload");
        let parsed: HealthVerdict = serde_json::from_slice(&raw).expect("parse");
        assert_eq!(parsed.ok, outcome.verdict.ok);
        assert_eq!(parsed.schema, HEALTH_VERDICT_SCHEMA);
    }
}
