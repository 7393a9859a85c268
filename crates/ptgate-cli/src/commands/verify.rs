//! `ptgate verify` — re-verify an evidence unit from its pin.

use std::path::PathBuf;

use clap::Args;
use ptgate_core::evidence::{self, EvidenceError};

use crate::exit_codes::codes;

/// Arguments for `ptgate verify`.
#[derive(Debug, Args)]
pub struct VerifyArgs {
    /// Pin file of the evidence unit to verify
    pub pin: PathBuf,
}

/// Re-verify one evidence unit.
pub fn run(args: &VerifyArgs) -> u8 {
    match evidence::verify_unit(&args.pin) {
        Ok(report) => {
            println!(
                "OK: {} file(s) verified, bundle digest matches ({})",
                report.files_verified,
                report.pin.display(),
            );
            codes::SUCCESS
        },
        Err(error) => {
            eprintln!("ptgate verify: {error}");
            match error {
                EvidenceError::PinMissing { .. } => codes::USAGE,
                EvidenceError::Integrity(_)
                | EvidenceError::Manifest(_)
                | EvidenceError::PinMalformed { .. } => codes::GATE_FAILED,
                _ => codes::INTERNAL,
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::*;
    use ptgate_core::evidence::EvidenceSnapshotWriter;
    use ptgate_core::fsutil::atomic_write;

    fn write_unit(root: &Path) -> ptgate_core::evidence::EvidenceUnit {
        EvidenceSnapshotWriter::new(root, "test-head")
            .write("health", |dir| {
                atomic_write(&dir.join("verdict.json"), b"{\"ok\":true}")?;
                Ok(())
            })
            .expect("unit")
    }

    #[test]
    fn intact_unit_verifies() {
        let tmp = tempdir().expect("tmp");
        let unit = write_unit(tmp.path());
        assert_eq!(run(&VerifyArgs { pin: unit.pin }), codes::SUCCESS);
    }

    #[test]
    fn missing_pin_maps_to_usage() {
        let tmp = tempdir().expect("tmp");
        let args = VerifyArgs {
            pin: tmp.path().join("pin_20260101T000000Z.txt"),
        };
        assert_eq!(run(&args), codes::USAGE);
    }

    #[test]
    fn tampered_bundle_maps_to_gate_failed() {
        let tmp = tempdir().expect("tmp");
        let unit = write_unit(tmp.path());
        fs::write(&unit.bundle, b"garbage").expect("tamper");
        assert_eq!(run(&VerifyArgs { pin: unit.pin }), codes::GATE_FAILED);
    }
}
