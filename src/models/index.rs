//! Per-application version index used by the filesystem repository.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry in a `bundle_id` index document.
///
/// The index only tells which uploads belong to an app and in what order;
/// the upload's own `build_info.json` stays the source of truth.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub upload_id: String,
    pub created_at: DateTime<Utc>,
}

/// Insert `entry` and restore newest-first order.
///
/// Re-adding an `upload_id` that is already present replaces the old entry.
pub fn insert_entry(entries: &mut Vec<IndexEntry>, entry: IndexEntry) {
    entries.retain(|e| e.upload_id != entry.upload_id);
    entries.push(entry);
    sort_newest_first(entries);
}

/// Sort by `created_at` descending, ties by `upload_id` descending.
pub fn sort_newest_first(entries: &mut [IndexEntry]) {
    entries.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.upload_id.cmp(&a.upload_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(id: &str, secs: i64) -> IndexEntry {
        IndexEntry {
            upload_id: id.into(),
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_insert_keeps_newest_first() {
        let mut entries = Vec::new();
        insert_entry(&mut entries, entry("u2", 200));
        insert_entry(&mut entries, entry("u1", 100));
        insert_entry(&mut entries, entry("u3", 300));
        let ids: Vec<_> = entries.iter().map(|e| e.upload_id.as_str()).collect();
        assert_eq!(ids, ["u3", "u2", "u1"]);
    }

    #[test]
    fn test_insert_replaces_duplicate_upload_id() {
        let mut entries = vec![entry("u1", 100)];
        insert_entry(&mut entries, entry("u1", 100));
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_equal_timestamps_are_deterministic() {
        let mut a = vec![entry("b", 5), entry("a", 5), entry("c", 5)];
        let mut b = vec![entry("c", 5), entry("b", 5), entry("a", 5)];
        sort_newest_first(&mut a);
        sort_newest_first(&mut b);
        assert_eq!(a, b);
        assert_eq!(a[0].upload_id, "c");
    }
}
