//! Shared filesystem primitives: atomic writes, bounded reads, pid
//! probing, and guarded tree deletion.
//!
//! Everything that touches the evidence store goes through these helpers
//! so the store-wide invariants hold in one place:
//!
//! - writes are temp-file-then-rename, so readers never observe a partial
//!   file;
//! - reads are bounded, so a crafted or corrupted file cannot exhaust
//!   memory;
//! - deletions refuse symlinked roots and anything outside the allowed
//!   parent directory.

use std::fs;
use std::io::{self, Read as _, Write as _};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Maximum pidfile size for bounded reads.
///
/// A pidfile is a single decimal PID plus optional trailing newline; 64
/// bytes is generous headroom.
pub const MAX_PIDFILE_SIZE: u64 = 64;

/// Filesystem error taxonomy shared by the store-facing helpers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FsError {
    /// Wrapped I/O error with the operation that failed.
    #[error("{context}: {source}")]
    Io {
        /// Description of the failing operation, including the path.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Refused to operate on a symlink.
    #[error("refusing symlink at {}", .path.display())]
    SymlinkRefused {
        /// The symlinked path.
        path: PathBuf,
    },

    /// A deletion target escaped its allowed parent directory.
    #[error("{} is outside allowed parent {}", .path.display(), .allowed_parent.display())]
    OutsideAllowedParent {
        /// The rejected deletion target.
        path: PathBuf,
        /// The directory deletions are confined to.
        allowed_parent: PathBuf,
    },

    /// A bounded read found more bytes than the caller allows.
    #[error("{} exceeds {max} bytes", .path.display())]
    TooLarge {
        /// The oversized file.
        path: PathBuf,
        /// The configured bound.
        max: u64,
    },
}

impl FsError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Outcome of a guarded tree deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The tree existed and was deleted.
    Deleted,
    /// Nothing was present at the path.
    AlreadyAbsent,
}

/// Atomic write: write to a temp file in the target's directory, sync,
/// then rename over the target.
///
/// Refuses directory and symlink targets so a rename can never follow a
/// link out of the store.
///
/// # Errors
///
/// Returns [`FsError`] when the parent is missing, the target is a
/// directory or symlink, or any I/O step fails.
pub fn atomic_write(target: &Path, data: &[u8]) -> Result<(), FsError> {
    let parent = target.parent().ok_or_else(|| {
        FsError::io(
            format!("path has no parent: {}", target.display()),
            io::Error::new(io::ErrorKind::InvalidInput, "no parent directory"),
        )
    })?;
    if let Ok(metadata) = fs::symlink_metadata(target) {
        if metadata.is_symlink() {
            return Err(FsError::SymlinkRefused {
                path: target.to_path_buf(),
            });
        }
        if metadata.is_dir() {
            return Err(FsError::io(
                format!("target path is a directory: {}", target.display()),
                io::Error::new(io::ErrorKind::InvalidInput, "target must be a file"),
            ));
        }
    }

    let temp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| FsError::io(format!("creating temp file in {}", parent.display()), e))?;
    let mut file = temp.as_file();
    file.write_all(data)
        .map_err(|e| FsError::io(format!("writing temp file for {}", target.display()), e))?;
    file.sync_all()
        .map_err(|e| FsError::io(format!("syncing temp file for {}", target.display()), e))?;
    temp.persist(target).map_err(|e| {
        FsError::io(
            format!("renaming temp file to {}", target.display()),
            e.error,
        )
    })?;
    Ok(())
}

/// Read a file into memory, refusing files larger than `max` bytes.
///
/// The reader takes `max + 1` bytes so an oversized file is detected
/// during the read rather than after loading it whole.
///
/// # Errors
///
/// Returns [`FsError::TooLarge`] past the bound, [`FsError::Io`] on any
/// other failure (including a missing file).
pub fn read_bounded(path: &Path, max: u64) -> Result<Vec<u8>, FsError> {
    let file = fs::File::open(path)
        .map_err(|e| FsError::io(format!("opening {}", path.display()), e))?;
    let mut buf = Vec::new();
    let mut reader = file.take(max.saturating_add(1));
    reader
        .read_to_end(&mut buf)
        .map_err(|e| FsError::io(format!("reading {}", path.display()), e))?;
    if buf.len() as u64 > max {
        return Err(FsError::TooLarge {
            path: path.to_path_buf(),
            max,
        });
    }
    Ok(buf)
}

/// Check whether a given PID is alive via a non-destructive signal probe.
///
/// `EPERM` counts as alive: the process exists, we merely lack permission
/// to signal it.
#[must_use]
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    #[cfg(unix)]
    {
        #[allow(unsafe_code)]
        let result = unsafe { libc::kill(pid_i32, 0) };
        if result == 0 {
            return true;
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        errno == libc::EPERM
    }
    #[cfg(not(unix))]
    {
        let _ = pid_i32;
        true
    }
}

/// Delete a directory tree, but only if it sits directly under
/// `allowed_parent` and is not itself a symlink.
///
/// # Errors
///
/// Returns [`FsError::OutsideAllowedParent`] when the containment check
/// fails, [`FsError::SymlinkRefused`] for a symlinked root.
pub fn remove_dir_tree_guarded(
    root: &Path,
    allowed_parent: &Path,
) -> Result<RemoveOutcome, FsError> {
    let metadata = match fs::symlink_metadata(root) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RemoveOutcome::AlreadyAbsent),
        Err(e) => return Err(FsError::io(format!("inspecting {}", root.display()), e)),
    };
    if metadata.is_symlink() {
        return Err(FsError::SymlinkRefused {
            path: root.to_path_buf(),
        });
    }

    let canonical_parent = allowed_parent.canonicalize().map_err(|e| {
        FsError::io(
            format!("canonicalizing {}", allowed_parent.display()),
            e,
        )
    })?;
    let actual_parent = root
        .parent()
        .and_then(|p| p.canonicalize().ok())
        .ok_or_else(|| FsError::OutsideAllowedParent {
            path: root.to_path_buf(),
            allowed_parent: allowed_parent.to_path_buf(),
        })?;
    if actual_parent != canonical_parent {
        return Err(FsError::OutsideAllowedParent {
            path: root.to_path_buf(),
            allowed_parent: allowed_parent.to_path_buf(),
        });
    }

    fs::remove_dir_all(root)
        .map_err(|e| FsError::io(format!("removing {}", root.display()), e))?;
    Ok(RemoveOutcome::Deleted)
}

/// Remove a file, treating absence as success.
///
/// Returns `true` when a file was actually removed.
///
/// # Errors
///
/// Returns [`FsError::Io`] on any failure other than the file being
/// absent.
pub fn remove_file_if_exists(path: &Path) -> Result<bool, FsError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(FsError::io(format!("removing {}", path.display()), e)),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn atomic_write_creates_file() {
        let dir = tempdir().expect("tmp");
        let target = dir.path().join("out.txt");
        atomic_write(&target, b"hello").expect("write");
        assert_eq!(fs::read(&target).expect("read"), b"hello");
    }

    #[test]
    fn atomic_write_overwrites_existing() {
        let dir = tempdir().expect("tmp");
        let target = dir.path().join("out.txt");
        fs::write(&target, b"old").expect("seed");
        atomic_write(&target, b"new").expect("write");
        assert_eq!(fs::read(&target).expect("read"), b"new");
    }

    #[test]
    fn atomic_write_rejects_directory_target() {
        let dir = tempdir().expect("tmp");
        let target = dir.path().join("sub");
        fs::create_dir(&target).expect("dir");
        assert!(atomic_write(&target, b"x").is_err());
    }

    #[test]
    fn read_bounded_rejects_oversized_file() {
        let dir = tempdir().expect("tmp");
        let target = dir.path().join("big.bin");
        fs::write(&target, vec![0u8; 128]).expect("seed");
        let err = read_bounded(&target, 64).expect_err("must exceed bound");
        assert!(matches!(err, FsError::TooLarge { max: 64, .. }));
    }

    #[test]
    fn read_bounded_reads_exact_bound() {
        let dir = tempdir().expect("tmp");
        let target = dir.path().join("ok.bin");
        fs::write(&target, vec![7u8; 64]).expect("seed");
        let buf = read_bounded(&target, 64).expect("read");
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn pid_zero_is_never_alive() {
        assert!(!is_pid_alive(0));
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(is_pid_alive(std::process::id()));
    }

    #[test]
    fn remove_guarded_refuses_outside_parent() {
        let dir = tempdir().expect("tmp");
        let elsewhere = tempdir().expect("tmp2");
        let victim = elsewhere.path().join("victim");
        fs::create_dir(&victim).expect("dir");
        let err = remove_dir_tree_guarded(&victim, dir.path()).expect_err("must refuse");
        assert!(matches!(err, FsError::OutsideAllowedParent { .. }));
        assert!(victim.exists());
    }

    #[test]
    fn remove_guarded_deletes_contained_tree() {
        let dir = tempdir().expect("tmp");
        let victim = dir.path().join("victim");
        fs::create_dir(&victim).expect("dir");
        fs::write(victim.join("f"), b"x").expect("seed");
        let outcome = remove_dir_tree_guarded(&victim, dir.path()).expect("remove");
        assert_eq!(outcome, RemoveOutcome::Deleted);
        assert!(!victim.exists());
    }

    #[test]
    fn remove_guarded_tolerates_absent_tree() {
        let dir = tempdir().expect("tmp");
        let outcome =
            remove_dir_tree_guarded(&dir.path().join("nope"), dir.path()).expect("remove");
        assert_eq!(outcome, RemoveOutcome::AlreadyAbsent);
    }
}
