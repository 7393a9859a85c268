//! Read-only scanner over the externally produced tick tree.
//!
//! The tick producer owns the out dir: one subdirectory per tick, named
//! with an embedded creation order that sorts chronologically. This
//! observer lists matching subdirectories, picks the newest, and reports
//! its age — and deliberately knows nothing about what is *inside* a
//! tick. Content interpretation belongs to the health gate (artifact
//! presence) and the metrics aggregator (status classification).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;

/// Scan failure taxonomy. Fatal to the calling gate but never a crash:
/// callers surface a specific verdict instead of a stack trace.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ScanError {
    /// The out dir does not exist.
    #[error("tick out dir missing: {}", .path.display())]
    OutDirMissing {
        /// The configured out dir.
        path: PathBuf,
    },

    /// Wrapped I/O failure while scanning.
    #[error("{context}: {source}")]
    Io {
        /// Description of the failing operation.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Result of one tick-tree scan.
#[derive(Debug, Clone, Default)]
pub struct TickScan {
    /// All matching tick directories, ascending by name (and therefore
    /// chronological by construction).
    pub ticks: Vec<PathBuf>,
    /// The newest tick, if any.
    pub newest: Option<PathBuf>,
    /// Age of the newest tick in whole seconds, if any.
    pub newest_age_sec: Option<u64>,
}

impl TickScan {
    /// Number of ticks found.
    #[must_use]
    pub fn tick_count(&self) -> u64 {
        self.ticks.len() as u64
    }

    /// File name of the newest tick, for reporting.
    #[must_use]
    pub fn newest_name(&self) -> Option<String> {
        self.newest
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    }
}

/// Scanner for tick directories under a configured prefix.
#[derive(Debug, Clone)]
pub struct TickObserver {
    prefix: String,
}

impl TickObserver {
    /// Create an observer matching `<prefix>*` subdirectories.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Scan `out_dir` for tick directories.
    ///
    /// Zero matching subdirectories is "no data yet", not an error: the
    /// scan succeeds with `newest = None`.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::OutDirMissing`] when `out_dir` does not
    /// exist, [`ScanError::Io`] on other listing failures.
    pub fn scan(&self, out_dir: &Path) -> Result<TickScan, ScanError> {
        let entries = match fs::read_dir(out_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ScanError::OutDirMissing {
                    path: out_dir.to_path_buf(),
                });
            },
            Err(e) => {
                return Err(ScanError::Io {
                    context: format!("listing {}", out_dir.display()),
                    source: e,
                });
            },
        };

        let mut names: Vec<String> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ScanError::Io {
                context: format!("listing {}", out_dir.display()),
                source: e,
            })?;
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(ToString::to_string) else {
                continue;
            };
            if name.starts_with(&self.prefix) {
                names.push(name);
            }
        }
        names.sort();

        let ticks: Vec<PathBuf> = names.iter().map(|n| out_dir.join(n)).collect();
        let newest = ticks.last().cloned();
        let newest_age_sec = match &newest {
            Some(path) => Some(age_seconds(path)?),
            None => None,
        };
        Ok(TickScan {
            ticks,
            newest,
            newest_age_sec,
        })
    }
}

/// Whole-second age of a path's mtime. Clock skew (mtime in the future)
/// clamps to zero.
fn age_seconds(path: &Path) -> Result<u64, ScanError> {
    let metadata = fs::metadata(path).map_err(|e| ScanError::Io {
        context: format!("inspecting {}", path.display()),
        source: e,
    })?;
    let mtime = metadata.modified().map_err(|e| ScanError::Io {
        context: format!("reading mtime of {}", path.display()),
        source: e,
    })?;
    Ok(SystemTime::now()
        .duration_since(mtime)
        .map(|d| d.as_secs())
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn missing_out_dir_is_a_scan_error() {
        let tmp = tempdir().expect("tmp");
        let err = TickObserver::new("tick_")
            .scan(&tmp.path().join("nope"))
            .expect_err("must report missing dir");
        assert!(matches!(err, ScanError::OutDirMissing { .. }));
    }

    #[test]
    fn empty_out_dir_is_no_data_not_an_error() {
        let tmp = tempdir().expect("tmp");
        let scan = TickObserver::new("tick_").scan(tmp.path()).expect("scan");
        assert_eq!(scan.tick_count(), 0);
        assert!(scan.newest.is_none());
        assert!(scan.newest_age_sec.is_none());
    }

    #[test]
    fn picks_newest_by_name_order() {
        let tmp = tempdir().expect("tmp");
        for name in ["tick_002", "tick_010", "tick_001"] {
            fs::create_dir(tmp.path().join(name)).expect("tick dir");
        }
        let scan = TickObserver::new("tick_").scan(tmp.path()).expect("scan");
        assert_eq!(scan.tick_count(), 3);
        assert_eq!(scan.newest_name().as_deref(), Some("tick_010"));
        assert_eq!(
            scan.ticks
                .iter()
                .map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .collect::<Vec<_>>(),
            vec![
                Some("tick_001".to_string()),
                Some("tick_002".to_string()),
                Some("tick_010".to_string()),
            ],
        );
    }

    #[test]
    fn ignores_files_and_foreign_directories() {
        let tmp = tempdir().expect("tmp");
        fs::create_dir(tmp.path().join("tick_001")).expect("tick dir");
        fs::create_dir(tmp.path().join("scratch")).expect("foreign dir");
        fs::write(tmp.path().join("tick_notadir"), b"x").expect("file");
        let scan = TickObserver::new("tick_").scan(tmp.path()).expect("scan");
        assert_eq!(scan.tick_count(), 1);
    }

    #[test]
    fn fresh_tick_has_near_zero_age() {
        let tmp = tempdir().expect("tmp");
        fs::create_dir(tmp.path().join("tick_001")).expect("tick dir");
        let scan = TickObserver::new("tick_").scan(tmp.path()).expect("scan");
        assert!(scan.newest_age_sec.unwrap_or(u64::MAX) < 60);
    }

    #[test]
    fn old_mtime_yields_old_age() {
        let tmp = tempdir().expect("tmp");
        let tick = tmp.path().join("tick_001");
        fs::create_dir(&tick).expect("tick dir");
        let past = filetime::FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(&tick, past).expect("set mtime");
        let scan = TickObserver::new("tick_").scan(tmp.path()).expect("scan");
        assert!(scan.newest_age_sec.unwrap_or(0) > 3600);
    }
}
