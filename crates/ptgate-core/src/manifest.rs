//! Deterministic directory manifests and SHA-256 checksum files.
//!
//! Two runs over identical content must produce byte-identical output:
//! enumeration is recursive over regular files only, relative paths use
//! `/` separators, and ordering is plain byte-wise path comparison with
//! no locale involvement.
//!
//! # Checksum File Format
//!
//! One line per file, `"<64-hex-char SHA-256>  <relative-path>"` (two
//! spaces), sorted by path — independently verifiable with any standard
//! `sha256sum -c` style tool.
//!
//! The checksum writer excludes its own output path plus any exclusions
//! the caller passes, and re-verifies the file it just wrote against the
//! directory before returning. A checksum file that does not verify
//! against its own directory is worse than none, so a mismatch here is a
//! fatal [`IntegrityError`], never silently ignored.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::fsutil::{self, FsError};

/// File name of the manifest written into an evidence directory.
pub const MANIFEST_FILE_NAME: &str = "MANIFEST";

/// File name of the checksum file written into an evidence directory.
pub const CHECKSUM_FILE_NAME: &str = "SHA256SUMS";

/// Maximum checksum file size for bounded reads during verification.
pub const MAX_CHECKSUM_FILE_SIZE: u64 = 1024 * 1024;

/// Maximum directory recursion depth during enumeration.
const MAX_TRAVERSAL_DEPTH: usize = 64;

/// Integrity violation: a checksum file disagrees with the directory it
/// describes. Fatal and loud — this is either a bug or filesystem
/// corruption.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IntegrityError {
    /// Recomputed digest differs from the recorded one.
    #[error("digest mismatch for {}: recorded {recorded}, actual {actual}", .path.display())]
    DigestMismatch {
        /// File the digest was recorded for.
        path: PathBuf,
        /// Digest found in the checksum file.
        recorded: String,
        /// Digest recomputed from the file bytes.
        actual: String,
    },

    /// A file named by the checksum file is gone.
    #[error("file listed in checksum file is missing: {}", .path.display())]
    MissingFile {
        /// The missing file.
        path: PathBuf,
    },

    /// A checksum line does not match the expected format.
    #[error("malformed checksum line {line}: {detail}")]
    MalformedLine {
        /// 1-based line number.
        line: usize,
        /// What was wrong.
        detail: String,
    },
}

/// Errors from manifest building and checksum writing.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManifestError {
    /// The target path is not a directory.
    #[error("not a directory: {}", .path.display())]
    NotADirectory {
        /// The offending path.
        path: PathBuf,
    },

    /// A file name under the directory is not valid UTF-8 and cannot be
    /// recorded deterministically.
    #[error("non-UTF-8 path under manifest root: {}", .path.display())]
    NonUtf8Path {
        /// The offending path (lossy rendering).
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

    /// Filesystem helper failure.
    #[error(transparent)]
    Fs(#[from] FsError),

    /// Checksum self-verification failure.
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

impl ManifestError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Ordered enumeration of a directory's regular files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Relative paths, `/`-separated, sorted byte-wise.
    pub entries: Vec<String>,
}

/// Compute the hex SHA-256 digest of a file's bytes.
///
/// # Errors
///
/// Returns [`ManifestError::Io`] when the file cannot be read.
pub fn sha256_file_hex(path: &Path) -> Result<String, ManifestError> {
    let bytes =
        fs::read(path).map_err(|e| ManifestError::io(format!("reading {}", path.display()), e))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Enumerate all regular files under `dir`, recursively, sorted by
/// byte-wise relative path.
///
/// Symlinks are skipped; only regular files are listed. The enumeration
/// refuses non-UTF-8 names rather than recording a lossy rendering two
/// runs could disagree on.
///
/// # Errors
///
/// Returns [`ManifestError::NotADirectory`] for a non-directory root,
/// [`ManifestError::NonUtf8Path`] for undecodable names, and
/// [`ManifestError::Io`] on traversal failures.
pub fn build_manifest(dir: &Path) -> Result<Manifest, ManifestError> {
    if !dir.is_dir() {
        return Err(ManifestError::NotADirectory {
            path: dir.to_path_buf(),
        });
    }

    let mut entries = Vec::new();
    let mut stack = vec![(dir.to_path_buf(), 0usize)];
    while let Some((current, depth)) = stack.pop() {
        if depth >= MAX_TRAVERSAL_DEPTH {
            continue;
        }
        let read = fs::read_dir(&current)
            .map_err(|e| ManifestError::io(format!("listing {}", current.display()), e))?;
        for entry in read {
            let entry = entry
                .map_err(|e| ManifestError::io(format!("listing {}", current.display()), e))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .map_err(|e| ManifestError::io(format!("inspecting {}", path.display()), e))?;
            if file_type.is_dir() {
                stack.push((path, depth + 1));
            } else if file_type.is_file() {
                let relative = path.strip_prefix(dir).map_err(|_| ManifestError::Io {
                    context: format!("relativizing {}", path.display()),
                    source: io::Error::new(io::ErrorKind::InvalidData, "not under manifest root"),
                })?;
                let mut parts = Vec::new();
                for component in relative.components() {
                    match component.as_os_str().to_str() {
                        Some(s) => parts.push(s),
                        None => {
                            return Err(ManifestError::NonUtf8Path {
                                path: path.clone(),
                            });
                        },
                    }
                }
                entries.push(parts.join("/"));
            }
            // Symlinks and other special files are intentionally absent.
        }
    }
    entries.sort();
    Ok(Manifest { entries })
}

/// Write the manifest file (one relative path per line) into `dir`.
///
/// # Errors
///
/// Returns [`ManifestError::Fs`] when the atomic write fails.
pub fn write_manifest(dir: &Path, manifest: &Manifest) -> Result<PathBuf, ManifestError> {
    let path = dir.join(MANIFEST_FILE_NAME);
    let mut content = manifest.entries.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    fsutil::atomic_write(&path, content.as_bytes())?;
    Ok(path)
}

/// Compute SHA-256 digests for every regular file under `dir` (minus the
/// checksum file itself and `exclude`), write the checksum file, then
/// re-verify it against the directory.
///
/// `exclude` holds relative `/`-separated paths.
///
/// # Errors
///
/// Propagates enumeration and I/O failures; returns
/// [`ManifestError::Integrity`] when the just-written file fails its own
/// verification.
pub fn write_checksums(dir: &Path, exclude: &BTreeSet<String>) -> Result<PathBuf, ManifestError> {
    let manifest = build_manifest(dir)?;
    let mut lines = String::new();
    for entry in &manifest.entries {
        if entry == CHECKSUM_FILE_NAME || exclude.contains(entry) {
            continue;
        }
        let digest = sha256_file_hex(&dir.join(entry))?;
        lines.push_str(&digest);
        lines.push_str("  ");
        lines.push_str(entry);
        lines.push('\n');
    }
    let path = dir.join(CHECKSUM_FILE_NAME);
    fsutil::atomic_write(&path, lines.as_bytes())?;

    // Self-verification: a checksum file that does not verify against
    // its own directory must never be left behind.
    verify_checksums(dir)?;
    Ok(path)
}

/// Re-read the directory's checksum file and recompute every digest.
///
/// Returns the number of verified files.
///
/// # Errors
///
/// Returns [`ManifestError::Integrity`] on any mismatch, missing file,
/// or malformed line; [`ManifestError::Io`] when the checksum file
/// cannot be read.
pub fn verify_checksums(dir: &Path) -> Result<usize, ManifestError> {
    let path = dir.join(CHECKSUM_FILE_NAME);
    verify_checksum_file(dir, &path)
}

/// Verify an explicit checksum file against a directory.
///
/// # Errors
///
/// See [`verify_checksums`].
pub fn verify_checksum_file(dir: &Path, checksum_path: &Path) -> Result<usize, ManifestError> {
    let bytes = fsutil::read_bounded(checksum_path, MAX_CHECKSUM_FILE_SIZE)?;
    let content = String::from_utf8(bytes).map_err(|e| {
        IntegrityError::MalformedLine {
            line: 0,
            detail: format!("checksum file is not UTF-8: {e}"),
        }
    })?;

    let mut verified = 0usize;
    for (index, line) in content.lines().enumerate() {
        let line_no = index + 1;
        let (digest, rest) = parse_checksum_line(line, line_no)?;
        let target = dir.join(rest);
        if !target.is_file() {
            return Err(IntegrityError::MissingFile { path: target }.into());
        }
        let actual = sha256_file_hex(&target)?;
        if actual != digest {
            return Err(IntegrityError::DigestMismatch {
                path: target,
                recorded: digest.to_string(),
                actual,
            }
            .into());
        }
        verified += 1;
    }
    Ok(verified)
}

fn parse_checksum_line(line: &str, line_no: usize) -> Result<(&str, &str), IntegrityError> {
    let (digest, rest) = line.split_once("  ").ok_or(IntegrityError::MalformedLine {
        line: line_no,
        detail: "expected '<digest>  <path>'".to_string(),
    })?;
    if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(IntegrityError::MalformedLine {
            line: line_no,
            detail: "digest is not 64 hex characters".to_string(),
        });
    }
    if rest.is_empty() || rest.starts_with('/') || rest.split('/').any(|part| part == "..") {
        return Err(IntegrityError::MalformedLine {
            line: line_no,
            detail: "path must be relative and free of '..'".to_string(),
        });
    }
    Ok((digest, rest))
}
