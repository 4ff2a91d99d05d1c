//! Property-based tests for the invariants the store is built on.

use gencodedoc::diff::SnapshotDiff;
use gencodedoc::types::FileEntry;
use gencodedoc::versioning::snapshot_hash;
use proptest::prelude::*;

fn arb_entry() -> impl Strategy<Value = FileEntry> {
    (
        "[a-z]{1,8}(/[a-z]{1,8}){0,2}\\.[a-z]{1,3}",
        "[0-9a-f]{64}",
        0u64..1_000_000,
    )
        .prop_map(|(path, hash, size)| FileEntry {
            path,
            hash,
            size,
            mode: 0o644,
        })
}

fn arb_entries() -> impl Strategy<Value = Vec<FileEntry>> {
    prop::collection::vec(arb_entry(), 0..12).prop_map(|mut entries| {
        // A snapshot never records the same path twice
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries.dedup_by(|a, b| a.path == b.path);
        entries
    })
}

proptest! {
    #[test]
    fn snapshot_hash_invariant_under_permutation(entries in arb_entries(), seed in any::<u64>()) {
        let mut shuffled = entries.clone();
        // Deterministic shuffle driven by the seed
        let len = shuffled.len();
        if len > 1 {
            for i in 0..len {
                let j = ((seed as usize).wrapping_mul(31).wrapping_add(i * 17)) % len;
                shuffled.swap(i, j);
            }
        }
        prop_assert_eq!(snapshot_hash(&entries), snapshot_hash(&shuffled));
    }

    #[test]
    fn snapshot_hash_ignores_size_and_mode(entries in arb_entries()) {
        let mut altered = entries.clone();
        for entry in &mut altered {
            entry.size = entry.size.wrapping_add(1);
            entry.mode = 0o600;
        }
        // Only (path, content-hash) pairs feed the snapshot hash
        prop_assert_eq!(snapshot_hash(&entries), snapshot_hash(&altered));
    }

    #[test]
    fn snapshot_hash_sensitive_to_content(entries in arb_entries()) {
        prop_assume!(!entries.is_empty());
        let mut altered = entries.clone();
        altered[0].hash = if altered[0].hash.starts_with('0') {
            format!("1{}", &altered[0].hash[1..])
        } else {
            format!("0{}", &altered[0].hash[1..])
        };
        prop_assert_ne!(snapshot_hash(&entries), snapshot_hash(&altered));
    }

    #[test]
    fn diff_sets_are_symmetric(a in arb_entries(), b in arb_entries()) {
        let ab = SnapshotDiff::compute(1, 2, &a, &b);
        let ba = SnapshotDiff::compute(2, 1, &b, &a);

        prop_assert_eq!(&ab.files_added, &ba.files_removed);
        prop_assert_eq!(&ab.files_removed, &ba.files_added);
        prop_assert_eq!(ab.files_modified.len(), ba.files_modified.len());
        prop_assert_eq!(ab.total_changes, ba.total_changes);
    }

    #[test]
    fn diff_self_is_empty(a in arb_entries()) {
        let aa = SnapshotDiff::compute(1, 1, &a, &a);
        prop_assert_eq!(aa.total_changes, 0);
        prop_assert_eq!(aa.significance, 0.0);
    }

    #[test]
    fn significance_zero_iff_no_changes(a in arb_entries(), b in arb_entries()) {
        let diff = SnapshotDiff::compute(1, 2, &a, &b);
        prop_assert!(diff.significance >= 0.0);
        prop_assert_eq!(diff.significance == 0.0, diff.total_changes == 0);
    }
}
