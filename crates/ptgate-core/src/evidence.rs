//! Immutable evidence units: directory + compressed bundle + pin.
//!
//! One evidence unit proves that a check ran and what it found. The
//! on-disk layout under a store root is:
//!
//! ```text
//! <root>/<label>_<UTC-ISO-basic>/            payload + MANIFEST + SHA256SUMS
//! <root>/<label>_<ts>.bundle.tgz             compressed archive of the dir
//! <root>/<label>_<ts>.bundle.tgz.sha256      bundle digest sidecar
//! <root>/pin_<ts>.txt                        key=value pin record
//! <root>/pin_<ts>.txt.sha256                 pin digest sidecar
//! ```
//!
//! The pin is written last and is the only artifact a downstream
//! consumer may trust as "this unit exists and is complete". If the
//! process dies before the pin lands, whatever else was written is an
//! orphan: later scans must treat it as garbage, and the retention
//! pruner may delete it.
//!
//! Units are never mutated after the pin is written; they are destroyed
//! only by the retention pruner, which removes all members together.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::fsutil::{self, FsError};
use crate::manifest::{self, IntegrityError, ManifestError, MANIFEST_FILE_NAME};

/// Label of pin files under a store root.
pub const PIN_LABEL: &str = "pin";

/// Suffix of the compressed bundle next to an evidence directory.
pub const BUNDLE_SUFFIX: &str = ".bundle.tgz";

/// Suffix of every digest sidecar.
pub const SHA256_SUFFIX: &str = ".sha256";

/// Embedded-timestamp format (UTC, ISO-basic, second resolution).
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Maximum pin file size for bounded reads.
pub const MAX_PIN_FILE_SIZE: u64 = 8 * 1024;

/// How many same-second name collisions the writer will disambiguate
/// before giving up.
const MAX_STAMP_COLLISIONS: u32 = 8;

/// Evidence lifecycle error taxonomy.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EvidenceError {
    /// The unit label is unusable.
    #[error("invalid evidence label '{label}'")]
    InvalidLabel {
        /// The rejected label.
        label: String,
    },

    /// Could not create a uniquely named unit directory.
    #[error("cannot allocate unit directory under {}", .store_root.display())]
    StampExhausted {
        /// The store root that kept colliding.
        store_root: PathBuf,
    },

    /// Payload producer failure; the unit was abandoned before its pin.
    #[error("evidence producer failed for '{label}': {detail}")]
    Producer {
        /// Unit label.
        label: String,
        /// Producer diagnostic.
        detail: String,
    },

    /// A pin file is missing.
    #[error("pin not found: {}", .path.display())]
    PinMissing {
        /// The expected pin path.
        path: PathBuf,
    },

    /// A pin file does not parse as `key=value` lines with the expected
    /// keys.
    #[error("malformed pin {}: {detail}", .path.display())]
    PinMalformed {
        /// The offending pin.
        path: PathBuf,
        /// What was wrong.
        detail: String,
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

    /// Manifest or checksum failure.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Integrity mismatch discovered during verification.
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

impl EvidenceError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// The pin record: the small pointer file that marks a unit complete and
/// lets any later consumer locate and trust it without re-scanning the
/// store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinRecord {
    /// Creation timestamp, ISO-basic UTC.
    pub timestamp_utc: String,
    /// Code/version reference of the producing checkout.
    pub head_ref: String,
    /// Evidence directory path.
    pub evi: PathBuf,
    /// Bundle path.
    pub bundle: PathBuf,
    /// Hex SHA-256 digest of the bundle.
    pub bundle_sha256: String,
}

impl PinRecord {
    /// Render the pin as `key=value` lines.
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "timestamp_utc={}\nhead_ref={}\nevi={}\nbundle={}\nbundle_sha256={}\n",
            self.timestamp_utc,
            self.head_ref,
            self.evi.display(),
            self.bundle.display(),
            self.bundle_sha256,
        )
    }

    /// Parse a pin from its `key=value` text.
    ///
    /// # Errors
    ///
    /// Returns [`EvidenceError::PinMalformed`] when a required key is
    /// absent or a line has no `=`.
    pub fn parse(path: &Path, content: &str) -> Result<Self, EvidenceError> {
        let mut timestamp_utc = None;
        let mut head_ref = None;
        let mut evi = None;
        let mut bundle = None;
        let mut bundle_sha256 = None;
        for line in content.lines() {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                EvidenceError::PinMalformed {
                    path: path.to_path_buf(),
                    detail: format!("line without '=': {line}"),
                }
            })?;
            match key {
                "timestamp_utc" => timestamp_utc = Some(value.to_string()),
                "head_ref" => head_ref = Some(value.to_string()),
                "evi" => evi = Some(PathBuf::from(value)),
                "bundle" => bundle = Some(PathBuf::from(value)),
                "bundle_sha256" => bundle_sha256 = Some(value.to_string()),
                // Unknown keys are tolerated for forward compatibility.
                _ => {},
            }
        }
        let missing = |key: &str| EvidenceError::PinMalformed {
            path: path.to_path_buf(),
            detail: format!("missing key '{key}'"),
        };
        Ok(Self {
            timestamp_utc: timestamp_utc.ok_or_else(|| missing("timestamp_utc"))?,
            head_ref: head_ref.ok_or_else(|| missing("head_ref"))?,
            evi: evi.ok_or_else(|| missing("evi"))?,
            bundle: bundle.ok_or_else(|| missing("bundle"))?,
            bundle_sha256: bundle_sha256.ok_or_else(|| missing("bundle_sha256"))?,
        })
    }
}

/// A fully written evidence unit.
#[derive(Debug, Clone)]
pub struct EvidenceUnit {
    /// Evidence directory.
    pub dir: PathBuf,
    /// Relative paths of the payload files, sorted.
    pub manifest: Vec<String>,
    /// Checksum file inside the directory.
    pub checksum_file: PathBuf,
    /// Compressed bundle of the directory.
    pub bundle: PathBuf,
    /// Bundle digest sidecar.
    pub bundle_checksum: PathBuf,
    /// Pin file.
    pub pin: PathBuf,
    /// Pin digest sidecar.
    pub pin_checksum: PathBuf,
    /// Creation timestamp, ISO-basic UTC.
    pub created_at: String,
    /// Code/version reference recorded in the pin.
    pub head_ref: String,
}

/// Report of a unit re-verification.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    /// The pin the verification started from.
    pub pin: PathBuf,
    /// Files verified inside the evidence directory.
    pub files_verified: usize,
    /// Whether the bundle digest matched the pin.
    pub bundle_verified: bool,
}

/// Writer for evidence units under one store root.
#[derive(Debug, Clone)]
pub struct EvidenceSnapshotWriter {
    store_root: PathBuf,
    head_ref: String,
}

impl EvidenceSnapshotWriter {
    /// Create a writer rooted at `store_root`, stamping pins with
    /// `head_ref`.
    #[must_use]
    pub fn new(store_root: impl Into<PathBuf>, head_ref: impl Into<String>) -> Self {
        Self {
            store_root: store_root.into(),
            head_ref: head_ref.into(),
        }
    }

    /// The store root units are written under.
    #[must_use]
    pub fn store_root(&self) -> &Path {
        &self.store_root
    }

    /// Write one evidence unit.
    ///
    /// `producer` populates the freshly created unit directory with the
    /// caller-specific payload. After it returns, the writer builds the
    /// manifest and checksum file, packs the bundle, and writes the pin
    /// last. A failure at any earlier step leaves no pin behind, so the
    /// partial unit reads as an orphan to every later scan.
    ///
    /// # Errors
    ///
    /// Returns [`EvidenceError`] on label, producer, I/O, or integrity
    /// failure. A returned unit is always fully populated.
    pub fn write<F>(&self, label: &str, producer: F) -> Result<EvidenceUnit, EvidenceError>
    where
        F: FnOnce(&Path) -> Result<(), EvidenceError>,
    {
        validate_label(label)?;
        fs::create_dir_all(&self.store_root).map_err(|e| {
            EvidenceError::io(format!("creating store root {}", self.store_root.display()), e)
        })?;

        let base_stamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        let (dir, stamp) = self.allocate_unit_dir(label, &base_stamp)?;

        if let Err(error) = producer(&dir) {
            tracing::warn!(
                dir = %dir.display(),
                %error,
                "evidence producer failed; leaving orphan without pin"
            );
            return Err(error);
        }

        let built = manifest::build_manifest(&dir)?;
        manifest::write_manifest(&dir, &built)?;
        let mut exclude = BTreeSet::new();
        exclude.insert(MANIFEST_FILE_NAME.to_string());
        let checksum_file = manifest::write_checksums(&dir, &exclude)?;

        let bundle = self.pack_bundle(&dir, label, &stamp)?;
        let bundle_digest = manifest::sha256_file_hex(&bundle)?;
        let bundle_checksum = write_digest_sidecar(&bundle, &bundle_digest)?;

        let pin_record = PinRecord {
            timestamp_utc: base_stamp.clone(),
            head_ref: self.head_ref.clone(),
            evi: dir.clone(),
            bundle: bundle.clone(),
            bundle_sha256: bundle_digest,
        };
        let pin = self
            .store_root
            .join(format!("{PIN_LABEL}_{stamp}.txt"));
        fsutil::atomic_write(&pin, pin_record.render().as_bytes())?;
        let pin_digest = manifest::sha256_file_hex(&pin)?;
        let pin_checksum = write_digest_sidecar(&pin, &pin_digest)?;

        tracing::info!(
            label,
            dir = %dir.display(),
            pin = %pin.display(),
            "evidence unit written"
        );

        Ok(EvidenceUnit {
            dir,
            manifest: built.entries,
            checksum_file,
            bundle,
            bundle_checksum,
            pin,
            pin_checksum,
            created_at: base_stamp,
            head_ref: self.head_ref.clone(),
        })
    }

    fn allocate_unit_dir(
        &self,
        label: &str,
        base_stamp: &str,
    ) -> Result<(PathBuf, String), EvidenceError> {
        for attempt in 0..MAX_STAMP_COLLISIONS {
            let stamp = if attempt == 0 {
                base_stamp.to_string()
            } else {
                format!("{base_stamp}-{}", attempt + 1)
            };
            let dir = self.store_root.join(format!("{label}_{stamp}"));
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((dir, stamp)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {},
                Err(e) => {
                    return Err(EvidenceError::io(
                        format!("creating unit directory {}", dir.display()),
                        e,
                    ));
                },
            }
        }
        Err(EvidenceError::StampExhausted {
            store_root: self.store_root.clone(),
        })
    }

    fn pack_bundle(&self, dir: &Path, label: &str, stamp: &str) -> Result<PathBuf, EvidenceError> {
        let bundle_path = self
            .store_root
            .join(format!("{label}_{stamp}{BUNDLE_SUFFIX}"));
        let temp = tempfile::NamedTempFile::new_in(&self.store_root).map_err(|e| {
            EvidenceError::io(
                format!("creating temp bundle in {}", self.store_root.display()),
                e,
            )
        })?;
        {
            let encoder = GzEncoder::new(temp.as_file(), Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder
                .append_dir_all(format!("{label}_{stamp}"), dir)
                .map_err(|e| {
                    EvidenceError::io(format!("archiving {}", dir.display()), e)
                })?;
            let encoder = builder
                .into_inner()
                .map_err(|e| EvidenceError::io("finishing archive".to_string(), e))?;
            encoder
                .finish()
                .map_err(|e| EvidenceError::io("finishing compression".to_string(), e))?;
        }
        temp.as_file()
            .sync_all()
            .map_err(|e| EvidenceError::io("syncing bundle".to_string(), e))?;
        temp.persist(&bundle_path).map_err(|e| {
            EvidenceError::io(
                format!("renaming bundle to {}", bundle_path.display()),
                e.error,
            )
        })?;
        Ok(bundle_path)
    }
}

/// Write a `sha256sum`-style digest sidecar next to `target`.
fn write_digest_sidecar(target: &Path, digest: &str) -> Result<PathBuf, EvidenceError> {
    let sidecar = sidecar_path(target);
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let line = format!("{digest}  {name}\n");
    fsutil::atomic_write(&sidecar, line.as_bytes())?;
    Ok(sidecar)
}

fn sidecar_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(SHA256_SUFFIX);
    target.with_file_name(name)
}

/// Locate the newest pin under a store root.
///
/// Pins sort chronologically by name, so the maximum file name wins.
/// An absent store root reads as "no pins yet".
///
/// # Errors
///
/// Returns [`EvidenceError::Io`] on listing failures other than the
/// root being absent.
pub fn latest_pin(store_root: &Path) -> Result<Option<PathBuf>, EvidenceError> {
    let entries = match fs::read_dir(store_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(EvidenceError::io(
                format!("listing {}", store_root.display()),
                e,
            ));
        },
    };
    let mut newest: Option<(String, PathBuf)> = None;
    for entry in entries {
        let entry =
            entry.map_err(|e| EvidenceError::io(format!("listing {}", store_root.display()), e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&format!("{PIN_LABEL}_")) || !name.ends_with(".txt") {
            continue;
        }
        if !entry.path().is_file() {
            continue;
        }
        // Compare embedded stamps, not file names: the ".txt" suffix
        // would otherwise sort a base stamp after its "-2" collision
        // sibling.
        let stamp = name.trim_end_matches(".txt").to_string();
        if newest.as_ref().is_none_or(|(best, _)| stamp > *best) {
            newest = Some((stamp, entry.path()));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

/// Read and parse a pin file.
///
/// # Errors
///
/// Returns [`EvidenceError::PinMissing`] when the file is absent,
/// [`EvidenceError::PinMalformed`] when it does not parse.
pub fn read_pin(path: &Path) -> Result<PinRecord, EvidenceError> {
    let bytes = match fsutil::read_bounded(path, MAX_PIN_FILE_SIZE) {
        Ok(bytes) => bytes,
        Err(FsError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            return Err(EvidenceError::PinMissing {
                path: path.to_path_buf(),
            });
        },
        Err(e) => return Err(e.into()),
    };
    let content = String::from_utf8(bytes).map_err(|e| EvidenceError::PinMalformed {
        path: path.to_path_buf(),
        detail: format!("not UTF-8: {e}"),
    })?;
    PinRecord::parse(path, &content)
}

/// Re-verify a complete evidence unit starting from its pin.
///
/// Checks, in order: the pin's own digest sidecar, the bundle digest
/// recorded in the pin, and every digest in the evidence directory's
/// checksum file.
///
/// # Errors
///
/// Returns [`EvidenceError::Integrity`] (or
/// [`EvidenceError::Manifest`]) on any mismatch; pin and I/O errors as
/// documented on [`read_pin`].
pub fn verify_unit(pin_path: &Path) -> Result<VerifyReport, EvidenceError> {
    let pin_bytes = match fsutil::read_bounded(pin_path, MAX_PIN_FILE_SIZE) {
        Ok(bytes) => bytes,
        Err(FsError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            return Err(EvidenceError::PinMissing {
                path: pin_path.to_path_buf(),
            });
        },
        Err(e) => return Err(e.into()),
    };

    // Pin sidecar first: the pin is the trust anchor.
    let sidecar = sidecar_path(pin_path);
    let recorded = read_sidecar_digest(&sidecar)?;
    let mut hasher = Sha256::new();
    hasher.update(&pin_bytes);
    let actual = hex::encode(hasher.finalize());
    if actual != recorded {
        return Err(IntegrityError::DigestMismatch {
            path: pin_path.to_path_buf(),
            recorded,
            actual,
        }
        .into());
    }

    let content = String::from_utf8(pin_bytes).map_err(|e| EvidenceError::PinMalformed {
        path: pin_path.to_path_buf(),
        detail: format!("not UTF-8: {e}"),
    })?;
    let pin = PinRecord::parse(pin_path, &content)?;

    if !pin.bundle.is_file() {
        return Err(IntegrityError::MissingFile { path: pin.bundle }.into());
    }
    let bundle_actual = manifest::sha256_file_hex(&pin.bundle)?;
    if bundle_actual != pin.bundle_sha256 {
        return Err(IntegrityError::DigestMismatch {
            path: pin.bundle,
            recorded: pin.bundle_sha256,
            actual: bundle_actual,
        }
        .into());
    }

    let files_verified = manifest::verify_checksums(&pin.evi)?;
    Ok(VerifyReport {
        pin: pin_path.to_path_buf(),
        files_verified,
        bundle_verified: true,
    })
}

fn read_sidecar_digest(sidecar: &Path) -> Result<String, EvidenceError> {
    let bytes = match fsutil::read_bounded(sidecar, MAX_PIN_FILE_SIZE) {
        Ok(bytes) => bytes,
        Err(FsError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            return Err(EvidenceError::PinMissing {
                path: sidecar.to_path_buf(),
            });
        },
        Err(e) => return Err(e.into()),
    };
    let content = String::from_utf8(bytes).map_err(|e| EvidenceError::PinMalformed {
        path: sidecar.to_path_buf(),
        detail: format!("not UTF-8: {e}"),
    })?;
    let digest = content
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string();
    if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(EvidenceError::PinMalformed {
            path: sidecar.to_path_buf(),
            detail: "sidecar digest is not 64 hex characters".to_string(),
        });
    }
    Ok(digest)
}

fn validate_label(label: &str) -> Result<(), EvidenceError> {
    let ok = !label.is_empty()
        && label != PIN_LABEL
        && label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(EvidenceError::InvalidLabel {
            label: label.to_string(),
        })
    }
}

/// Resolve the code/version reference recorded in pins.
///
/// Asks `git rev-parse HEAD` in `repo_dir` (or the working directory),
/// falling back to the crate version when git is unavailable — a missing
/// checkout must not block evidence capture.
#[must_use]
pub fn resolve_head_ref(repo_dir: Option<&Path>) -> String {
    let mut cmd = Command::new("git");
    cmd.args(["rev-parse", "HEAD"]);
    if let Some(dir) = repo_dir {
        cmd.current_dir(dir);
    }
    if let Ok(output) = cmd.output() {
        if output.status.success() {
            let head = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !head.is_empty() {
                return head;
            }
        }
    }
    format!("ptgate-{}", env!("CARGO_PKG_VERSION"))
}
