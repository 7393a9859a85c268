//! Alerting metrics over the tick tree.
//!
//! The aggregator reads the tick scan plus the newest tick's result
//! file and produces a [`MetricsDocument`]: counts, age, a classified
//! latest status, and the derived alert set. Alert membership is a pure
//! function of `(tick_count, age_sec, latest_status, thresholds)` — no
//! hidden state, so identical inputs always produce the identical set.
//!
//! # Result Classification
//!
//! The tick producer owns its result format. Preferred is the typed
//! `result.json` (`ptgate.tick_result.v1`); the plain-text `result.txt`
//! mirror is scanned for the two literal markers `ready` / `not_ready`.
//! A result that is absent or unparseable classifies as `unknown` —
//! never fabricated as `ready`.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Thresholds;
use crate::evidence::{EvidenceError, EvidenceSnapshotWriter, EvidenceUnit};
use crate::fsutil;
use crate::guard::{ExecutionContext, GuardError, GuardEvaluator};
use crate::health::age_within_threshold;
use crate::tick::{ScanError, TickObserver, TickScan};

/// Schema identifier for metrics payloads.
pub const METRICS_SCHEMA: &str = "ptgate.metrics.v1";

/// Schema identifier of the typed tick result file.
pub const TICK_RESULT_SCHEMA: &str = "ptgate.tick_result.v1";

/// Evidence label used by metrics runs.
pub const METRICS_LABEL: &str = "metrics";

/// Machine-readable metrics payload inside each evidence unit.
pub const METRICS_FILE_NAME: &str = "metrics.json";

/// Plain-text metrics mirror for operators.
pub const METRICS_TEXT_FILE_NAME: &str = "metrics.txt";

/// Typed result file inside a tick directory.
pub const TICK_RESULT_JSON: &str = "result.json";

/// Plain-text result mirror inside a tick directory.
pub const TICK_RESULT_TEXT: &str = "result.txt";

/// Maximum tick result file size for bounded reads.
pub const MAX_TICK_RESULT_SIZE: u64 = 64 * 1024;

/// Alert raised when `tick_count < min_ticks`.
pub const ALERT_INSUFFICIENT_TICKS: &str = "insufficient_ticks";

/// Alert raised when `age_sec` exceeds `max_age_sec`.
pub const ALERT_TICKS_STALE: &str = "ticks_stale";

/// Alert raised when the latest status is anything but `ready`.
pub const ALERT_STATUS_NOT_READY: &str = "status_not_ready_or_missing";

/// Classified status of the newest tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickStatus {
    /// The readiness check reported ready.
    Ready,
    /// The readiness check reported not ready.
    NotReady,
    /// No result, or a result this subsystem cannot interpret.
    Unknown,
}

impl fmt::Display for TickStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("ready"),
            Self::NotReady => f.write_str("not_ready"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Typed result record written by the tick producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickResultV1 {
    /// Schema identifier.
    pub schema: String,
    /// Reported status.
    pub status: TickStatus,
    /// Optional free-form detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The metrics document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsDocument {
    /// Schema identifier.
    pub schema: String,
    /// Number of ticks found.
    pub tick_count: u64,
    /// Newest tick directory name, if any.
    pub latest_tick: Option<String>,
    /// Age of the newest tick in whole seconds, if any.
    pub age_sec: Option<u64>,
    /// Classified status of the newest tick.
    pub latest_status: TickStatus,
    /// Thresholds the alerts were derived from.
    pub thresholds: Thresholds,
    /// Named alerts (sorted for deterministic output).
    pub alerts: BTreeSet<String>,
}

impl MetricsDocument {
    /// Plain-text mirror of the document, `key=value` per line.
    #[must_use]
    pub fn render_text(&self) -> String {
        format!(
            "tick_count={}\nlatest_tick={}\nage_sec={}\nlatest_status={}\n\
             max_age_sec={}\nmin_ticks={}\nalerts={}\n",
            self.tick_count,
            self.latest_tick.as_deref().unwrap_or("-"),
            self.age_sec
                .map_or_else(|| "-".to_string(), |v| v.to_string()),
            self.latest_status,
            self.thresholds.max_age_sec,
            self.thresholds.min_ticks,
            if self.alerts.is_empty() {
                "-".to_string()
            } else {
                self.alerts.iter().cloned().collect::<Vec<_>>().join(",")
            },
        )
    }
}

/// Metrics run error taxonomy.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MetricsError {
    /// Guard rejected the context before anything was written.
    #[error(transparent)]
    Guard(#[from] GuardError),

    /// Tick scan failed for a reason other than missing data.
    #[error(transparent)]
    Scan(#[from] ScanError),

    /// Evidence capture failed.
    #[error(transparent)]
    Evidence(#[from] EvidenceError),
}

/// Outcome of a metrics run: the document plus its evidence unit.
#[derive(Debug)]
pub struct MetricsOutcome {
    /// The computed document.
    pub document: MetricsDocument,
    /// The evidence unit carrying the document payload.
    pub evidence: EvidenceUnit,
}

/// The metrics aggregator.
#[derive(Debug)]
pub struct MetricsAggregator<'a> {
    observer: &'a TickObserver,
    thresholds: Thresholds,
}

impl<'a> MetricsAggregator<'a> {
    /// Assemble an aggregator from its collaborators.
    #[must_use]
    pub fn new(observer: &'a TickObserver, thresholds: Thresholds) -> Self {
        Self {
            observer,
            thresholds,
        }
    }

    /// Compute the metrics document for `out_dir`.
    ///
    /// A missing out dir reads as zero ticks, not an error: the derived
    /// alerts already tell the operator everything is missing.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::Io`] on listing failures.
    pub fn compute(&self, out_dir: &Path) -> Result<MetricsDocument, ScanError> {
        let scan = match self.observer.scan(out_dir) {
            Ok(scan) => scan,
            Err(ScanError::OutDirMissing { path }) => {
                tracing::warn!(out_dir = %path.display(), "tick out dir missing");
                TickScan::default()
            },
            Err(other) => return Err(other),
        };
        let latest_status = scan
            .newest
            .as_deref()
            .map_or(TickStatus::Unknown, read_tick_status);
        Ok(build_document(&scan, latest_status, self.thresholds))
    }

    /// Run the aggregator under guard and capture the document as an
    /// evidence unit.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Guard`] on guard rejection (nothing is
    /// written), scan and evidence failures otherwise.
    pub fn run(
        &self,
        ctx: &ExecutionContext,
        guard: &GuardEvaluator,
        writer: &EvidenceSnapshotWriter,
        out_dir: &Path,
    ) -> Result<MetricsOutcome, MetricsError> {
        guard.evaluate(ctx)?;
        let document = self.compute(out_dir)?;
        tracing::info!(
            tick_count = document.tick_count,
            latest_status = %document.latest_status,
            alerts = document.alerts.len(),
            "metrics computed"
        );

        let payload = serde_json::to_vec_pretty(&document).map_err(|e| {
            EvidenceError::Producer {
                label: METRICS_LABEL.to_string(),
                detail: format!("serializing metrics: {e}"),
            }
        })?;
        let text = document.render_text();
        let evidence = writer.write(METRICS_LABEL, |dir| {
            fsutil::atomic_write(&dir.join(METRICS_FILE_NAME), &payload)?;
            fsutil::atomic_write(&dir.join(METRICS_TEXT_FILE_NAME), text.as_bytes())?;
            Ok(())
        })?;
        Ok(MetricsOutcome { document, evidence })
    }
}

/// Derive the alert set. Pure: same inputs, same alerts.
#[must_use]
pub fn compute_alerts(
    tick_count: u64,
    age_sec: Option<u64>,
    latest_status: TickStatus,
    thresholds: &Thresholds,
) -> BTreeSet<String> {
    let mut alerts = BTreeSet::new();
    if tick_count < thresholds.min_ticks {
        alerts.insert(ALERT_INSUFFICIENT_TICKS.to_string());
    }
    if let Some(age) = age_sec {
        if !age_within_threshold(age, thresholds.max_age_sec) {
            alerts.insert(ALERT_TICKS_STALE.to_string());
        }
    }
    if latest_status != TickStatus::Ready {
        alerts.insert(ALERT_STATUS_NOT_READY.to_string());
    }
    alerts
}

fn build_document(
    scan: &TickScan,
    latest_status: TickStatus,
    thresholds: Thresholds,
) -> MetricsDocument {
    MetricsDocument {
        schema: METRICS_SCHEMA.to_string(),
        tick_count: scan.tick_count(),
        latest_tick: scan.newest_name(),
        age_sec: scan.newest_age_sec,
        latest_status,
        alerts: compute_alerts(
            scan.tick_count(),
            scan.newest_age_sec,
            latest_status,
            &thresholds,
        ),
        thresholds,
    }
}

/// Classify the newest tick's result.
///
/// Tries the typed `result.json` first, then the plain-text mirror.
#[must_use]
pub fn read_tick_status(tick_dir: &Path) -> TickStatus {
    let json_path = tick_dir.join(TICK_RESULT_JSON);
    if let Ok(bytes) = fsutil::read_bounded(&json_path, MAX_TICK_RESULT_SIZE) {
        if let Ok(result) = serde_json::from_slice::<TickResultV1>(&bytes) {
            if result.schema == TICK_RESULT_SCHEMA {
                return result.status;
            }
        }
        // An unparseable typed result falls through to the text mirror
        // rather than classifying as ready.
    }

    let text_path = tick_dir.join(TICK_RESULT_TEXT);
    if let Ok(bytes) = fsutil::read_bounded(&text_path, MAX_TICK_RESULT_SIZE) {
        let content = String::from_utf8_lossy(&bytes);
        // Order matters: "not_ready" contains "ready".
        if content.contains("not_ready") {
            return TickStatus::NotReady;
        }
        if content.contains("ready") {
            return TickStatus::Ready;
        }
    }
    TickStatus::Unknown
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    fn thresholds(max_age_sec: u64, min_ticks: u64) -> Thresholds {
        Thresholds {
            max_age_sec,
            min_ticks,
        }
    }

    fn tick_with_text(out_dir: &Path, name: &str, result: &str) {
        let dir = out_dir.join(name);
        fs::create_dir_all(&dir).expect("tick dir");
        fs::write(dir.join(TICK_RESULT_TEXT), result).expect("result");
    }

    #[test]
    fn healthy_pipeline_has_no_alerts() {
        // Three ticks, newest 10 minutes old, 15-minute threshold,
        // minimum of two, latest ready.
        let alerts = compute_alerts(3, Some(600), TickStatus::Ready, &thresholds(900, 2));
        assert!(alerts.is_empty());
    }

    #[test]
    fn single_tick_alerts_insufficient_regardless_of_age_and_status() {
        let alerts = compute_alerts(1, Some(1), TickStatus::Ready, &thresholds(900, 2));
        assert!(alerts.contains(ALERT_INSUFFICIENT_TICKS));
        let alerts = compute_alerts(1, None, TickStatus::Unknown, &thresholds(900, 2));
        assert!(alerts.contains(ALERT_INSUFFICIENT_TICKS));
    }

    #[test]
    fn stale_age_boundary_is_inclusive() {
        let fresh = compute_alerts(3, Some(900), TickStatus::Ready, &thresholds(900, 2));
        assert!(!fresh.contains(ALERT_TICKS_STALE));
        let stale = compute_alerts(3, Some(901), TickStatus::Ready, &thresholds(900, 2));
        assert!(stale.contains(ALERT_TICKS_STALE));
    }

    #[test]
    fn non_ready_status_alerts() {
        for status in [TickStatus::NotReady, TickStatus::Unknown] {
            let alerts = compute_alerts(3, Some(1), status, &thresholds(900, 2));
            assert!(alerts.contains(ALERT_STATUS_NOT_READY), "status {status}");
        }
    }

    #[test]
    fn alerts_are_pure() {
        let first = compute_alerts(1, Some(1200), TickStatus::NotReady, &thresholds(900, 2));
        let second = compute_alerts(1, Some(1200), TickStatus::NotReady, &thresholds(900, 2));
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn typed_result_wins_over_text_mirror() {
        let tmp = tempdir().expect("tmp");
        let dir = tmp.path().join("tick_001");
        fs::create_dir(&dir).expect("tick dir");
        let typed = serde_json::json!({
            "schema": TICK_RESULT_SCHEMA,
            "status": "not_ready",
        });
        fs::write(dir.join(TICK_RESULT_JSON), typed.to_string()).expect("json");
        fs::write(dir.join(TICK_RESULT_TEXT), "ready").expect("text");
        assert_eq!(read_tick_status(&dir), TickStatus::NotReady);
    }

    #[test]
    fn text_mirror_not_ready_wins_over_ready_substring() {
        let tmp = tempdir().expect("tmp");
        tick_with_text(tmp.path(), "tick_001", "status: not_ready\n");
        assert_eq!(
            read_tick_status(&tmp.path().join("tick_001")),
            TickStatus::NotReady,
        );
    }

    #[test]
    fn absent_result_is_unknown_never_ready() {
        let tmp = tempdir().expect("tmp");
        let dir = tmp.path().join("tick_001");
        fs::create_dir(&dir).expect("tick dir");
        assert_eq!(read_tick_status(&dir), TickStatus::Unknown);
    }

    #[test]
    fn unparseable_typed_result_falls_back_to_text() {
        let tmp = tempdir().expect("tmp");
        let dir = tmp.path().join("tick_001");
        fs::create_dir(&dir).expect("tick dir");
        fs::write(dir.join(TICK_RESULT_JSON), b"{not json").expect("json");
        fs::write(dir.join(TICK_RESULT_TEXT), "ready\n").expect("text");
        assert_eq!(read_tick_status(&dir), TickStatus::Ready);
    }

    #[test]
    fn compute_reads_newest_tick_only() {
        let tmp = tempdir().expect("tmp");
        tick_with_text(tmp.path(), "tick_001", "not_ready");
        tick_with_text(tmp.path(), "tick_002", "ready");
        let observer = TickObserver::new("tick_");
        let aggregator = MetricsAggregator::new(&observer, thresholds(900, 2));
        let document = aggregator.compute(tmp.path()).expect("compute");
        assert_eq!(document.tick_count, 2);
        assert_eq!(document.latest_status, TickStatus::Ready);
        assert_eq!(document.latest_tick.as_deref(), Some("tick_002"));
        assert!(document.alerts.is_empty());
    }

    #[test]
    fn missing_out_dir_reads_as_zero_ticks() {
        let tmp = tempdir().expect("tmp");
        let observer = TickObserver::new("tick_");
        let aggregator = MetricsAggregator::new(&observer, thresholds(900, 2));
        let document = aggregator
            .compute(&tmp.path().join("nope"))
            .expect("compute");
        assert_eq!(document.tick_count, 0);
        assert_eq!(document.latest_status, TickStatus::Unknown);
        assert!(document.alerts.contains(ALERT_INSUFFICIENT_TICKS));
        assert!(document.alerts.contains(ALERT_STATUS_NOT_READY));
    }

    #[test]
    fn run_captures_document_as_evidence() {
        use std::collections::BTreeMap;

        use crate::config::DEFAULT_DENY_ENV_PATTERNS;
        use crate::guard::Mode;

        let tmp = tempdir().expect("tmp");
        tick_with_text(tmp.path(), "tick_001", "ready");
        tick_with_text(tmp.path(), "tick_002", "ready");
        let observer = TickObserver::new("tick_");
        let aggregator = MetricsAggregator::new(&observer, thresholds(900, 2));
        let guard = GuardEvaluator::new(&[Mode::Shadow], DEFAULT_DENY_ENV_PATTERNS)
            .expect("guard");
        let writer = EvidenceSnapshotWriter::new(tmp.path().join("store"), "test-head");
        let ctx = ExecutionContext::new(Mode::Shadow, true, BTreeMap::new());
        let outcome = aggregator
            .run(&ctx, &guard, &writer, tmp.path())
            .expect("run");
        assert!(outcome.evidence.pin.is_file());
        let raw = fs::read(outcome.evidence.dir.join(METRICS_FILE_NAME)).expect("payload");
        let parsed: MetricsDocument = serde_json::from_slice(&raw).expect("parse");
        assert_eq!(parsed, outcome.document);
    }
}
