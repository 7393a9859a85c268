//! Property tests for the stability requirement on manifests and
//! checksum files: identical content must always produce byte-identical
//! output.

use std::collections::BTreeSet;
use std::fs;

use proptest::prelude::*;
use ptgate_core::manifest::{
    build_manifest, verify_checksums, write_checksums, CHECKSUM_FILE_NAME,
};

/// Component names that are safe on any filesystem and unambiguous
/// across runs.
fn file_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_-]{0,12}\\.(json|txt|log)"
}

fn file_tree() -> impl Strategy<Value = Vec<(String, Option<String>, Vec<u8>)>> {
    prop::collection::vec(
        (
            file_name(),
            prop::option::of("[a-z][a-z0-9]{0,8}"),
            prop::collection::vec(any::<u8>(), 0..256),
        ),
        1..12,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn checksum_output_is_stable_across_runs(tree in file_tree()) {
        let tmp = tempfile::tempdir().expect("tmp");
        for (name, subdir, content) in &tree {
            let dir = match subdir {
                Some(sub) => {
                    let d = tmp.path().join(sub);
                    fs::create_dir_all(&d).expect("subdir");
                    d
                },
                None => tmp.path().to_path_buf(),
            };
            fs::write(dir.join(name), content).expect("seed");
        }

        let first_manifest = build_manifest(tmp.path()).expect("manifest");
        let path = write_checksums(tmp.path(), &BTreeSet::new()).expect("first");
        let first = fs::read(&path).expect("read");

        let second_manifest = build_manifest(tmp.path()).expect("manifest");
        write_checksums(tmp.path(), &BTreeSet::new()).expect("second");
        let second = fs::read(&path).expect("read");

        // Manifest entries may differ between runs only by the checksum
        // file the first run left behind.
        let filtered: Vec<_> = second_manifest
            .entries
            .iter()
            .filter(|e| e.as_str() != CHECKSUM_FILE_NAME)
            .cloned()
            .collect();
        prop_assert_eq!(first_manifest.entries, filtered);
        prop_assert_eq!(first, second);

        let verified = verify_checksums(tmp.path()).expect("verify");
        prop_assert!(verified >= 1);
    }

    #[test]
    fn entries_are_strictly_sorted(tree in file_tree()) {
        let tmp = tempfile::tempdir().expect("tmp");
        for (name, _, content) in &tree {
            fs::write(tmp.path().join(name), content).expect("seed");
        }
        let manifest = build_manifest(tmp.path()).expect("manifest");
        let mut sorted = manifest.entries.clone();
        sorted.sort();
        sorted.dedup();
        prop_assert_eq!(manifest.entries, sorted);
    }
}
