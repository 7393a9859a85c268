//! Meta gate: the single overall readiness verdict operators and CI
//! consult.
//!
//! Composes three sub-checks without recomputing any of them:
//!
//! 1. the scheduled jobs feeding the tick tree are running (queried
//!    through the [`JobControl`] seam);
//! 2. the most recent health evidence — located through its pin, never
//!    recomputed — is a PASS and fresh;
//! 3. the most recent metrics run has no alerts and a ready status.
//!
//! Every failing sub-check lands in `reasons`: an operator fixing a
//! broken pipeline needs the full picture in one pass, not the first
//! failure of several.

use std::path::Path;

use chrono::{NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Thresholds;
use crate::evidence::{
    self, EvidenceError, EvidenceSnapshotWriter, EvidenceUnit, TIMESTAMP_FORMAT,
};
use crate::fsutil;
use crate::guard::{ExecutionContext, GuardError, GuardEvaluator};
use crate::health::{HealthVerdict, VERDICT_FILE_NAME};
use crate::metrics::{MetricsDocument, TickStatus, METRICS_FILE_NAME};

/// Schema identifier for meta verdict payloads.
pub const META_VERDICT_SCHEMA: &str = "ptgate.meta_verdict.v1";

/// Evidence label used by the meta gate.
pub const META_LABEL: &str = "meta";

/// Machine-readable meta verdict payload inside each evidence unit.
pub const META_FILE_NAME: &str = "meta.json";

/// Plain-text meta verdict mirror for operators.
pub const META_TEXT_FILE_NAME: &str = "meta.txt";

/// Maximum payload size read back from referenced evidence units.
pub const MAX_GATE_PAYLOAD_SIZE: u64 = 256 * 1024;

/// Error from the job-liveness / job-control collaborator.
#[derive(Debug, Error)]
pub enum JobControlError {
    /// Liveness query failed.
    #[error("cannot query job '{job}': {detail}")]
    Query {
        /// Job identifier.
        job: String,
        /// Transport diagnostic.
        detail: String,
    },

    /// Stop request failed.
    #[error("cannot stop job '{job}': {detail}")]
    Stop {
        /// Job identifier.
        job: String,
        /// Transport diagnostic.
        detail: String,
    },
}

/// Seam to the external process/service manager.
///
/// The transport (systemd, a process supervisor, a test fake) is the
/// caller's concern; this subsystem only asks two questions.
pub trait JobControl {
    /// Whether the named job is currently running.
    ///
    /// # Errors
    ///
    /// Returns [`JobControlError::Query`] when the manager cannot be
    /// asked.
    fn is_alive(&self, job: &str) -> Result<bool, JobControlError>;

    /// Stop the named job.
    ///
    /// # Errors
    ///
    /// Returns [`JobControlError::Stop`] when the stop request fails.
    fn stop(&self, job: &str) -> Result<(), JobControlError>;
}

/// Meta gate error taxonomy.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MetaError {
    /// Guard rejected the context before anything was written.
    #[error(transparent)]
    Guard(#[from] GuardError),

    /// Evidence capture failed.
    #[error(transparent)]
    Evidence(#[from] EvidenceError),
}

/// The meta verdict document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetaVerdict {
    /// Schema identifier.
    pub schema: String,
    /// Overall readiness.
    pub ok: bool,
    /// Every failing sub-check, empty on PASS.
    pub reasons: Vec<String>,
    /// Evaluation timestamp, ISO-basic UTC.
    pub checked_at_utc: String,
}

impl MetaVerdict {
    /// Plain-text mirror of the verdict.
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = format!("ok={}\nchecked_at_utc={}\n", self.ok, self.checked_at_utc);
        for reason in &self.reasons {
            out.push_str("reason=");
            out.push_str(reason);
            out.push('\n');
        }
        out
    }
}

/// Outcome of a meta-gate run.
#[derive(Debug)]
pub struct MetaOutcome {
    /// The verdict.
    pub verdict: MetaVerdict,
    /// The evidence unit carrying the verdict payload.
    pub evidence: EvidenceUnit,
}

/// Store roots of the gate families the meta gate reads.
#[derive(Debug, Clone, Copy)]
pub struct MetaStores<'a> {
    /// Health gate store root.
    pub health: &'a Path,
    /// Metrics store root.
    pub metrics: &'a Path,
    /// Optional ingest gate store root.
    pub ingest: Option<&'a Path>,
}

/// The meta gate.
pub struct MetaGate<'a> {
    guard: &'a GuardEvaluator,
    writer: &'a EvidenceSnapshotWriter,
    control: &'a dyn JobControl,
    thresholds: Thresholds,
}

impl<'a> MetaGate<'a> {
    /// Assemble a gate from its collaborators.
    #[must_use]
    pub fn new(
        guard: &'a GuardEvaluator,
        writer: &'a EvidenceSnapshotWriter,
        control: &'a dyn JobControl,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            guard,
            writer,
            control,
            thresholds,
        }
    }

    /// Evaluate overall readiness.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError::Guard`] on guard rejection (nothing is
    /// written), [`MetaError::Evidence`] when the verdict cannot be
    /// captured.
    pub fn evaluate(
        &self,
        ctx: &ExecutionContext,
        jobs: &[String],
        stores: &MetaStores<'_>,
    ) -> Result<MetaOutcome, MetaError> {
        self.guard.evaluate(ctx)?;

        let mut reasons = Vec::new();
        self.check_jobs(jobs, &mut reasons);
        self.check_health(stores.health, &mut reasons);
        self.check_metrics(stores.metrics, &mut reasons);
        if let Some(ingest) = stores.ingest {
            self.check_ingest(ingest, &mut reasons);
        }

        let verdict = MetaVerdict {
            schema: META_VERDICT_SCHEMA.to_string(),
            ok: reasons.is_empty(),
            reasons,
            checked_at_utc: Utc::now().format(TIMESTAMP_FORMAT).to_string(),
        };
        tracing::info!(
            ok = verdict.ok,
            reasons = verdict.reasons.len(),
            "meta gate evaluated"
        );

        let payload = serde_json::to_vec_pretty(&verdict).map_err(|e| {
            EvidenceError::Producer {
                label: META_LABEL.to_string(),
                detail: format!("serializing meta verdict: {e}"),
            }
        })?;
        let text = verdict.render_text();
        let evidence = self.writer.write(META_LABEL, |dir| {
            fsutil::atomic_write(&dir.join(META_FILE_NAME), &payload)?;
            fsutil::atomic_write(&dir.join(META_TEXT_FILE_NAME), text.as_bytes())?;
            Ok(())
        })?;
        Ok(MetaOutcome { verdict, evidence })
    }

    fn check_jobs(&self, jobs: &[String], reasons: &mut Vec<String>) {
        for job in jobs {
            match self.control.is_alive(job) {
                Ok(true) => {},
                Ok(false) => reasons.push(format!("job_not_running:{job}")),
                Err(error) => {
                    tracing::warn!(job, %error, "job liveness query failed");
                    reasons.push(format!("job_liveness_unknown:{job}"));
                },
            }
        }
    }

    fn check_health(&self, store: &Path, reasons: &mut Vec<String>) {
        let pin_path = match evidence::latest_pin(store) {
            Ok(Some(path)) => path,
            Ok(None) => {
                reasons.push("health_evidence_missing".to_string());
                return;
            },
            Err(error) => {
                tracing::warn!(%error, "health store scan failed");
                reasons.push("health_evidence_unreadable".to_string());
                return;
            },
        };
        let pin = match evidence::read_pin(&pin_path) {
            Ok(pin) => pin,
            Err(error) => {
                tracing::warn!(%error, "health pin unreadable");
                reasons.push("health_evidence_unreadable".to_string());
                return;
            },
        };
        match pin_age_seconds(&pin.timestamp_utc) {
            Some(age) if age <= self.thresholds.max_age_sec => {},
            Some(_) => reasons.push("health_evidence_stale".to_string()),
            None => {
                reasons.push("health_evidence_unreadable".to_string());
                return;
            },
        }
        match read_json::<HealthVerdict>(&pin.evi.join(VERDICT_FILE_NAME)) {
            Some(verdict) if verdict.ok => {},
            Some(_) => reasons.push("health_gate_failed".to_string()),
            None => reasons.push("health_evidence_unreadable".to_string()),
        }
    }

    fn check_metrics(&self, store: &Path, reasons: &mut Vec<String>) {
        let pin_path = match evidence::latest_pin(store) {
            Ok(Some(path)) => path,
            Ok(None) => {
                reasons.push("metrics_evidence_missing".to_string());
                return;
            },
            Err(error) => {
                tracing::warn!(%error, "metrics store scan failed");
                reasons.push("metrics_evidence_unreadable".to_string());
                return;
            },
        };
        let pin = match evidence::read_pin(&pin_path) {
            Ok(pin) => pin,
            Err(error) => {
                tracing::warn!(%error, "metrics pin unreadable");
                reasons.push("metrics_evidence_unreadable".to_string());
                return;
            },
        };
        let Some(document) = read_json::<MetricsDocument>(&pin.evi.join(METRICS_FILE_NAME))
        else {
            reasons.push("metrics_evidence_unreadable".to_string());
            return;
        };
        if !document.alerts.is_empty() {
            let joined = document.alerts.iter().cloned().collect::<Vec<_>>().join(",");
            reasons.push(format!("metrics_alerts_active:{joined}"));
        }
        if document.latest_status != TickStatus::Ready {
            reasons.push("metrics_status_not_ready".to_string());
        }
    }

    fn check_ingest(&self, store: &Path, reasons: &mut Vec<String>) {
        let pin_path = match evidence::latest_pin(store) {
            Ok(Some(path)) => path,
            Ok(None) => {
                reasons.push("ingest_evidence_missing".to_string());
                return;
            },
            Err(error) => {
                tracing::warn!(%error, "ingest store scan failed");
                reasons.push("ingest_evidence_unreadable".to_string());
                return;
            },
        };
        let pin = match evidence::read_pin(&pin_path) {
            Ok(pin) => pin,
            Err(_) => {
                reasons.push("ingest_evidence_unreadable".to_string());
                return;
            },
        };
        // The ingest gate is third-party; only its `ok` field is relied
        // upon.
        let Some(value) =
            read_json::<serde_json::Value>(&pin.evi.join(VERDICT_FILE_NAME))
        else {
            reasons.push("ingest_evidence_unreadable".to_string());
            return;
        };
        match value.get("ok").and_then(serde_json::Value::as_bool) {
            Some(true) => {},
            Some(false) => reasons.push("ingest_gate_failed".to_string()),
            None => reasons.push("ingest_evidence_unreadable".to_string()),
        }
    }
}

/// Age of a pin timestamp in whole seconds, `None` when unparseable.
fn pin_age_seconds(timestamp_utc: &str) -> Option<u64> {
    let naive = NaiveDateTime::parse_from_str(timestamp_utc, TIMESTAMP_FORMAT).ok()?;
    let stamped = Utc.from_utc_datetime(&naive);
    let delta = Utc::now().signed_duration_since(stamped).num_seconds();
    Some(delta.max(0) as u64)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = fsutil::read_bounded(path, MAX_GATE_PAYLOAD_SIZE).ok()?;
    serde_json::from_slice(&bytes).ok()
}
