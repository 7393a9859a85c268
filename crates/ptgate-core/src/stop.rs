//! Stop playbook: the operator-invoked reverse of "start".
//!
//! Stops every known periodic job feeding the tick tree through the
//! [`JobControl`] seam, confirms each is down, and captures one final
//! evidence unit proving the stop occurred.
//!
//! Failure handling is an explicit, named policy rather than ambient
//! best-effort: [`FailurePolicy::FailFast`] aborts on the first job that
//! will not stop (and writes no evidence — the stop did not occur),
//! [`FailurePolicy::WarnOnly`] records the failure, keeps going, and
//! still captures evidence of the partial stop.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::evidence::{EvidenceError, EvidenceSnapshotWriter, EvidenceUnit, TIMESTAMP_FORMAT};
use crate::fsutil;
use crate::guard::{ExecutionContext, GuardError, GuardEvaluator};
use crate::meta::{JobControl, JobControlError};

/// Schema identifier for stop report payloads.
pub const STOP_REPORT_SCHEMA: &str = "ptgate.stop_report.v1";

/// Evidence label used by the stop playbook.
pub const STOP_LABEL: &str = "stop";

/// Machine-readable stop report inside the final evidence unit.
pub const STOP_REPORT_FILE_NAME: &str = "stop_report.json";

/// Plain-text stop report mirror for operators.
pub const STOP_REPORT_TEXT_FILE_NAME: &str = "stop_report.txt";

/// How job-stop failures are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort on the first failing job; no evidence is written.
    FailFast,
    /// Record the failure, continue with the remaining jobs, and still
    /// capture evidence of the partial stop.
    WarnOnly,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailFast => f.write_str("fail_fast"),
            Self::WarnOnly => f.write_str("warn_only"),
        }
    }
}

/// Stop playbook error taxonomy.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StopError {
    /// Guard rejected the context before anything was written.
    #[error(transparent)]
    Guard(#[from] GuardError),

    /// A job would not stop under [`FailurePolicy::FailFast`].
    #[error("stop failed for job '{job}': {detail}")]
    JobStop {
        /// The job that would not stop.
        job: String,
        /// Transport diagnostic.
        detail: String,
    },

    /// Evidence capture failed.
    #[error(transparent)]
    Evidence(#[from] EvidenceError),
}

/// Per-job outcome of the playbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobStopOutcome {
    /// Job identifier.
    pub job: String,
    /// Whether the stop request was accepted.
    pub stopped: bool,
    /// Whether the job was confirmed down afterwards.
    pub confirmed_down: bool,
    /// Failure detail, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The stop report document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StopReport {
    /// Schema identifier.
    pub schema: String,
    /// Policy the run executed under.
    pub policy: FailurePolicy,
    /// Per-job outcomes, in request order.
    pub outcomes: Vec<JobStopOutcome>,
    /// Whether every job stopped and was confirmed down.
    pub all_stopped: bool,
    /// Run timestamp, ISO-basic UTC.
    pub stopped_at_utc: String,
}

impl StopReport {
    /// Plain-text mirror of the report.
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = format!(
            "policy={}\nall_stopped={}\nstopped_at_utc={}\n",
            self.policy, self.all_stopped, self.stopped_at_utc,
        );
        for outcome in &self.outcomes {
            out.push_str(&format!(
                "job={} stopped={} confirmed_down={} error={}\n",
                outcome.job,
                outcome.stopped,
                outcome.confirmed_down,
                outcome.error.as_deref().unwrap_or("-"),
            ));
        }
        out
    }
}

/// Outcome of a playbook run: the report plus the evidence unit proving
/// it.
#[derive(Debug)]
pub struct StopRun {
    /// The report.
    pub report: StopReport,
    /// The final evidence unit.
    pub evidence: EvidenceUnit,
}

/// The stop playbook.
pub struct StopPlaybook<'a> {
    guard: &'a GuardEvaluator,
    writer: &'a EvidenceSnapshotWriter,
    control: &'a dyn JobControl,
    policy: FailurePolicy,
}

impl<'a> StopPlaybook<'a> {
    /// Assemble a playbook from its collaborators.
    #[must_use]
    pub fn new(
        guard: &'a GuardEvaluator,
        writer: &'a EvidenceSnapshotWriter,
        control: &'a dyn JobControl,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            guard,
            writer,
            control,
            policy,
        }
    }

    /// Stop every job, then capture the final evidence unit.
    ///
    /// # Errors
    ///
    /// Returns [`StopError::Guard`] on guard rejection,
    /// [`StopError::JobStop`] for the first failing job under
    /// [`FailurePolicy::FailFast`], and [`StopError::Evidence`] when the
    /// final capture fails.
    pub fn run(&self, ctx: &ExecutionContext, jobs: &[String]) -> Result<StopRun, StopError> {
        self.guard.evaluate(ctx)?;

        let mut outcomes = Vec::with_capacity(jobs.len());
        for job in jobs {
            let outcome = self.stop_one(job)?;
            outcomes.push(outcome);
        }

        let all_stopped = !outcomes.is_empty()
            && outcomes.iter().all(|o| o.stopped && o.confirmed_down);
        let report = StopReport {
            schema: STOP_REPORT_SCHEMA.to_string(),
            policy: self.policy,
            outcomes,
            all_stopped,
            stopped_at_utc: Utc::now().format(TIMESTAMP_FORMAT).to_string(),
        };
        tracing::info!(
            all_stopped = report.all_stopped,
            jobs = report.outcomes.len(),
            "stop playbook finished"
        );

        let payload = serde_json::to_vec_pretty(&report).map_err(|e| {
            EvidenceError::Producer {
                label: STOP_LABEL.to_string(),
                detail: format!("serializing stop report: {e}"),
            }
        })?;
        let text = report.render_text();
        let evidence = self.writer.write(STOP_LABEL, |dir| {
            fsutil::atomic_write(&dir.join(STOP_REPORT_FILE_NAME), &payload)?;
            fsutil::atomic_write(&dir.join(STOP_REPORT_TEXT_FILE_NAME), text.as_bytes())?;
            Ok(())
        })?;
        Ok(StopRun { report, evidence })
    }

    fn stop_one(&self, job: &str) -> Result<JobStopOutcome, StopError> {
        match self.control.stop(job) {
            Ok(()) => {},
            Err(error) => {
                let detail = job_error_detail(&error);
                if self.policy == FailurePolicy::FailFast {
                    return Err(StopError::JobStop {
                        job: job.to_string(),
                        detail,
                    });
                }
                tracing::warn!(job, %detail, "job stop failed; continuing");
                return Ok(JobStopOutcome {
                    job: job.to_string(),
                    stopped: false,
                    confirmed_down: false,
                    error: Some(detail),
                });
            },
        }

        match self.control.is_alive(job) {
            Ok(false) => Ok(JobStopOutcome {
                job: job.to_string(),
                stopped: true,
                confirmed_down: true,
                error: None,
            }),
            Ok(true) => {
                let detail = "still alive after stop".to_string();
                if self.policy == FailurePolicy::FailFast {
                    return Err(StopError::JobStop {
                        job: job.to_string(),
                        detail,
                    });
                }
                tracing::warn!(job, "job still alive after stop; continuing");
                Ok(JobStopOutcome {
                    job: job.to_string(),
                    stopped: true,
                    confirmed_down: false,
                    error: Some(detail),
                })
            },
            Err(error) => {
                // Stop was accepted; a failed liveness confirmation is
                // recorded but never escalated.
                let detail = job_error_detail(&error);
                tracing::warn!(job, %detail, "liveness confirmation failed");
                Ok(JobStopOutcome {
                    job: job.to_string(),
                    stopped: true,
                    confirmed_down: false,
                    error: Some(detail),
                })
            },
        }
    }
}

fn job_error_detail(error: &JobControlError) -> String {
    match error {
        JobControlError::Query { detail, .. } | JobControlError::Stop { detail, .. } => {
            detail.clone()
        },
    }
}
