//! Count-based retention over an evidence store.
//!
//! Every artifact belonging to one evidence unit embeds the same
//! timestamp, so retention groups the store's directory listing by that
//! stamp and deletes whole groups — directory, bundle, sidecars and pin
//! together, never individual members. Retention is count-based only:
//! the newest `keep_n` pinned units are never deleted, whatever their
//! size.
//!
//! Groups without a pin are orphans from interrupted writers. They are
//! counted and reported but deleted only on explicit request, and even
//! then only when older than every retained unit — a writer may be
//! mid-flight on the newest group right now.
//!
//! The pruner is the only component that deletes anything, and it
//! refuses to run concurrently with itself via an advisory lock file in
//! the store root.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt as _;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::evidence::PIN_LABEL;
use crate::fsutil::{self, RemoveOutcome};

/// Name of the advisory lock file in the store root.
pub const RETENTION_LOCK_FILE: &str = ".retention.lock";

/// Embedded-timestamp pattern (ISO-basic UTC with an optional collision
/// suffix).
const STAMP_PATTERN: &str = r"\d{8}T\d{6}Z(?:-\d+)?";

/// Retention error taxonomy.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RetentionError {
    /// The store root does not exist.
    #[error("evidence store missing: {}", .path.display())]
    StoreMissing {
        /// The configured store root.
        path: PathBuf,
    },

    /// Another pruner instance holds the lock.
    #[error("another retention run holds {}", .path.display())]
    AlreadyRunning {
        /// The contended lock file.
        path: PathBuf,
    },

    /// Wrapped I/O failure.
    #[error("{context}: {source}")]
    Io {
        /// Description of the failing operation.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl RetentionError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Report of one prune run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PruneReport {
    /// Pinned unit groups found.
    pub examined: u64,
    /// Pinned unit groups deleted.
    pub deleted: u64,
    /// Pinned unit groups remaining.
    pub remaining: u64,
    /// Individual members removed across all deleted groups.
    pub deleted_members: u64,
    /// Members that were already absent during group deletion.
    pub skipped_missing_members: u64,
    /// Orphan groups (no pin) observed.
    pub orphans: u64,
    /// Orphan groups deleted (only with explicit opt-in).
    pub orphans_deleted: u64,
    /// Per-member failure descriptions; deletion never aborts early.
    pub errors: Vec<String>,
    /// Whether the run deleted nothing.
    pub noop: bool,
}

#[derive(Debug, Default)]
struct UnitGroup {
    dirs: Vec<PathBuf>,
    files: Vec<PathBuf>,
    has_pin: bool,
}

/// The retention pruner.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    keep_n: usize,
    delete_orphans: bool,
}

impl RetentionPolicy {
    /// Keep the newest `keep_n` pinned units.
    #[must_use]
    pub fn new(keep_n: usize) -> Self {
        Self {
            keep_n,
            delete_orphans: false,
        }
    }

    /// Opt into deleting orphan groups older than every retained unit.
    #[must_use]
    pub fn with_delete_orphans(mut self, delete_orphans: bool) -> Self {
        self.delete_orphans = delete_orphans;
        self
    }

    /// Prune a store root.
    ///
    /// A run that has nothing to delete is an explicit no-op: it is
    /// logged and reported as such rather than silently doing nothing.
    ///
    /// # Errors
    ///
    /// Returns [`RetentionError::StoreMissing`] for an absent store,
    /// [`RetentionError::AlreadyRunning`] when another instance holds
    /// the lock, and [`RetentionError::Io`] on listing failures.
    /// Per-member deletion failures are accumulated in the report, not
    /// raised.
    pub fn prune(&self, store_root: &Path) -> Result<PruneReport, RetentionError> {
        if !store_root.is_dir() {
            return Err(RetentionError::StoreMissing {
                path: store_root.to_path_buf(),
            });
        }
        let _lock = self.acquire_lock(store_root)?;

        let groups = scan_groups(store_root)?;
        let pinned: Vec<&String> = groups
            .iter()
            .filter(|(_, g)| g.has_pin)
            .map(|(stamp, _)| stamp)
            .collect();
        let orphan_count = groups.len() as u64 - pinned.len() as u64;

        let mut report = PruneReport {
            examined: pinned.len() as u64,
            orphans: orphan_count,
            ..PruneReport::default()
        };

        let delete_pinned: Vec<String> = if pinned.len() > self.keep_n {
            pinned[..pinned.len() - self.keep_n]
                .iter()
                .map(|s| (*s).clone())
                .collect()
        } else {
            Vec::new()
        };

        // Orphans are deletable only below every retained pinned unit;
        // the newest groups may belong to writers still in flight.
        let cutoff: Option<String> = pinned
            .len()
            .checked_sub(self.keep_n.min(pinned.len()))
            .and_then(|idx| pinned.get(idx).map(|s| (*s).clone()));
        let delete_orphan: Vec<String> = if self.delete_orphans {
            match &cutoff {
                Some(cutoff) => groups
                    .iter()
                    .filter(|(stamp, g)| !g.has_pin && stamp.as_str() < cutoff.as_str())
                    .map(|(stamp, _)| stamp.clone())
                    .collect(),
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        if delete_pinned.is_empty() && delete_orphan.is_empty() {
            report.remaining = report.examined;
            report.noop = true;
            tracing::info!(
                store = %store_root.display(),
                examined = report.examined,
                keep_n = self.keep_n,
                "retention no-op: nothing to delete"
            );
            return Ok(report);
        }

        for stamp in &delete_pinned {
            if let Some(group) = groups.get(stamp) {
                delete_group(store_root, group, &mut report);
                report.deleted += 1;
            }
        }
        for stamp in &delete_orphan {
            if let Some(group) = groups.get(stamp) {
                delete_group(store_root, group, &mut report);
                report.orphans_deleted += 1;
            }
        }
        report.remaining = report.examined - report.deleted;
        tracing::info!(
            store = %store_root.display(),
            deleted = report.deleted,
            remaining = report.remaining,
            orphans_deleted = report.orphans_deleted,
            errors = report.errors.len(),
            "retention pruned"
        );
        Ok(report)
    }

    fn acquire_lock(&self, store_root: &Path) -> Result<fs::File, RetentionError> {
        let lock_path = store_root.join(RETENTION_LOCK_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| RetentionError::io(format!("opening {}", lock_path.display()), e))?;
        match lock_file.try_lock_exclusive() {
            Ok(()) => Ok(lock_file),
            Err(_) => Err(RetentionError::AlreadyRunning { path: lock_path }),
        }
    }
}

/// Group the store's immediate entries by embedded timestamp.
fn scan_groups(store_root: &Path) -> Result<BTreeMap<String, UnitGroup>, RetentionError> {
    // Compiled per run; the pruner is a short-lived invocation.
    let stamp_re = Regex::new(STAMP_PATTERN).unwrap_or_else(|_| {
        // The pattern is a constant; failure here is unreachable.
        unreachable!("embedded stamp pattern must compile")
    });
    let pin_prefix = format!("{PIN_LABEL}_");

    let mut groups: BTreeMap<String, UnitGroup> = BTreeMap::new();
    let entries = fs::read_dir(store_root)
        .map_err(|e| RetentionError::io(format!("listing {}", store_root.display()), e))?;
    for entry in entries {
        let entry = entry
            .map_err(|e| RetentionError::io(format!("listing {}", store_root.display()), e))?;
        let Some(name) = entry.file_name().to_str().map(ToString::to_string) else {
            continue;
        };
        let Some(stamp) = stamp_re.find(&name).map(|m| m.as_str().to_string()) else {
            continue;
        };
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let group = groups.entry(stamp).or_default();
        if file_type.is_dir() {
            group.dirs.push(entry.path());
        } else {
            group.files.push(entry.path());
            if name.starts_with(&pin_prefix) && name.ends_with(".txt") {
                group.has_pin = true;
            }
        }
    }
    Ok(groups)
}

/// Delete every member of one group. A missing member is skipped, not an
/// error; real failures are accumulated and deletion continues.
fn delete_group(store_root: &Path, group: &UnitGroup, report: &mut PruneReport) {
    for dir in &group.dirs {
        match fsutil::remove_dir_tree_guarded(dir, store_root) {
            Ok(RemoveOutcome::Deleted) => report.deleted_members += 1,
            Ok(RemoveOutcome::AlreadyAbsent) => report.skipped_missing_members += 1,
            Err(error) => report.errors.push(error.to_string()),
        }
    }
    for file in &group.files {
        match fsutil::remove_file_if_exists(file) {
            Ok(true) => report.deleted_members += 1,
            Ok(false) => report.skipped_missing_members += 1,
            Err(error) => report.errors.push(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::evidence::EvidenceSnapshotWriter;
    use crate::fsutil::atomic_write;

    fn seed_unit(root: &Path, stamp: &str) {
        // Lay the unit out by hand so tests control the embedded stamp.
        let dir = root.join(format!("health_{stamp}"));
        fs::create_dir_all(&dir).expect("unit dir");
        fs::write(dir.join("verdict.json"), b"{}").expect("payload");
        fs::write(root.join(format!("health_{stamp}.bundle.tgz")), b"tgz").expect("bundle");
        fs::write(
            root.join(format!("health_{stamp}.bundle.tgz.sha256")),
            b"digest",
        )
        .expect("sidecar");
        fs::write(root.join(format!("pin_{stamp}.txt")), b"pin").expect("pin");
        fs::write(root.join(format!("pin_{stamp}.txt.sha256")), b"digest").expect("sidecar");
    }

    fn seed_orphan(root: &Path, stamp: &str) {
        let dir = root.join(format!("health_{stamp}"));
        fs::create_dir_all(&dir).expect("orphan dir");
        fs::write(dir.join("half.json"), b"{}").expect("payload");
        fs::write(root.join(format!("health_{stamp}.bundle.tgz")), b"tgz").expect("bundle");
    }

    fn stamps(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("2026010{}T000000Z", i + 1)).collect()
    }

    #[test]
    fn under_count_is_an_observable_noop() {
        let tmp = tempdir().expect("tmp");
        for stamp in stamps(3) {
            seed_unit(tmp.path(), &stamp);
        }
        let report = RetentionPolicy::new(5).prune(tmp.path()).expect("prune");
        assert!(report.noop);
        assert_eq!(report.deleted, 0);
        assert_eq!(report.remaining, 3);
    }

    #[test]
    fn deletes_oldest_groups_completely() {
        let tmp = tempdir().expect("tmp");
        let all = stamps(5);
        for stamp in &all {
            seed_unit(tmp.path(), stamp);
        }
        let report = RetentionPolicy::new(2).prune(tmp.path()).expect("prune");
        assert_eq!(report.deleted, 3);
        assert_eq!(report.remaining, 2);
        assert!(!report.noop);
        // Oldest three gone in full.
        for stamp in &all[..3] {
            assert!(!tmp.path().join(format!("health_{stamp}")).exists());
            assert!(!tmp.path().join(format!("pin_{stamp}.txt")).exists());
            assert!(!tmp
                .path()
                .join(format!("health_{stamp}.bundle.tgz"))
                .exists());
        }
        // Newest two intact in full.
        for stamp in &all[3..] {
            assert!(tmp.path().join(format!("health_{stamp}")).is_dir());
            assert!(tmp.path().join(format!("pin_{stamp}.txt")).is_file());
            assert!(tmp
                .path()
                .join(format!("health_{stamp}.bundle.tgz.sha256"))
                .is_file());
        }
    }

    #[test]
    fn prune_is_idempotent() {
        let tmp = tempdir().expect("tmp");
        for stamp in stamps(5) {
            seed_unit(tmp.path(), &stamp);
        }
        let policy = RetentionPolicy::new(2);
        let first = policy.prune(tmp.path()).expect("first");
        assert_eq!(first.deleted, 3);
        let second = policy.prune(tmp.path()).expect("second");
        assert_eq!(second.deleted, 0);
        assert!(second.noop);
        assert_eq!(second.remaining, 2);
    }

    #[test]
    fn missing_member_is_skipped_not_an_error() {
        let tmp = tempdir().expect("tmp");
        let all = stamps(3);
        for stamp in &all {
            seed_unit(tmp.path(), stamp);
        }
        // Simulate a prior crash: the oldest group lost its bundle.
        fs::remove_file(tmp.path().join(format!("health_{}.bundle.tgz", all[0])))
            .expect("remove");
        let report = RetentionPolicy::new(1).prune(tmp.path()).expect("prune");
        assert_eq!(report.deleted, 2);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn orphans_are_reported_but_kept_by_default() {
        let tmp = tempdir().expect("tmp");
        seed_orphan(tmp.path(), "20250101T000000Z");
        for stamp in stamps(2) {
            seed_unit(tmp.path(), &stamp);
        }
        let report = RetentionPolicy::new(1).prune(tmp.path()).expect("prune");
        assert_eq!(report.orphans, 1);
        assert_eq!(report.orphans_deleted, 0);
        assert!(tmp.path().join("health_20250101T000000Z").is_dir());
    }

    #[test]
    fn opt_in_deletes_only_old_orphans() {
        let tmp = tempdir().expect("tmp");
        // One orphan older than everything, one newer than every pinned
        // unit (a writer could be mid-flight on it).
        seed_orphan(tmp.path(), "20250101T000000Z");
        seed_orphan(tmp.path(), "20270101T000000Z");
        for stamp in stamps(2) {
            seed_unit(tmp.path(), &stamp);
        }
        let report = RetentionPolicy::new(2)
            .with_delete_orphans(true)
            .prune(tmp.path())
            .expect("prune");
        assert_eq!(report.orphans, 2);
        assert_eq!(report.orphans_deleted, 1);
        assert!(!tmp.path().join("health_20250101T000000Z").exists());
        assert!(tmp.path().join("health_20270101T000000Z").is_dir());
    }

    #[test]
    fn missing_store_is_an_error() {
        let tmp = tempdir().expect("tmp");
        let err = RetentionPolicy::new(2)
            .prune(&tmp.path().join("nope"))
            .expect_err("must error");
        assert!(matches!(err, RetentionError::StoreMissing { .. }));
    }

    #[test]
    fn lock_file_is_not_treated_as_a_member() {
        let tmp = tempdir().expect("tmp");
        for stamp in stamps(2) {
            seed_unit(tmp.path(), &stamp);
        }
        let report = RetentionPolicy::new(1).prune(tmp.path()).expect("prune");
        assert_eq!(report.deleted, 1);
        assert!(tmp.path().join(RETENTION_LOCK_FILE).exists());
    }

    #[test]
    fn prunes_real_writer_output() {
        let tmp = tempdir().expect("tmp");
        let writer = EvidenceSnapshotWriter::new(tmp.path(), "test-head");
        for i in 0..4 {
            writer
                .write("health", |dir| {
                    atomic_write(&dir.join("verdict.json"), format!("{{\"n\":{i}}}").as_bytes())?;
                    Ok(())
                })
                .expect("unit");
        }
        let report = RetentionPolicy::new(2).prune(tmp.path()).expect("prune");
        assert_eq!(report.examined, 4);
        assert_eq!(report.deleted, 2);
        assert_eq!(report.remaining, 2);
        assert!(report.errors.is_empty());
    }
}
