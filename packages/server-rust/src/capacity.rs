//! Per-type capacity enforcement.
//!
//! When a type's live-record count exceeds its configured capacity, the
//! oldest records are soft-deleted until the count is back at the bound.
//! Age is `modified_at`, ties broken by lowest version and then lowest id.
//! The record written by the triggering Put is always ranked newest, so it
//! is only evicted when the capacity is zero.

use gatebroker_core::Record;

/// Selects the ids to evict from `live` so that at most `capacity` remain.
///
/// `live` must contain only non-deleted records of a single type. `written_id`
/// is the id touched by the triggering write, if any.
#[must_use]
pub fn select_evictions(
    live: &[&Record],
    capacity: u64,
    written_id: Option<&str>,
) -> Vec<String> {
    let capacity = usize::try_from(capacity).unwrap_or(usize::MAX);
    if live.len() <= capacity {
        return Vec::new();
    }

    let mut ranked: Vec<&Record> = live.to_vec();
    ranked.sort_by(|a, b| {
        let a_written = written_id == Some(a.id.as_str());
        let b_written = written_id == Some(b.id.as_str());
        a_written
            .cmp(&b_written)
            .then_with(|| a.modified_at.cmp(&b.modified_at))
            .then_with(|| a.version.cmp(&b.version))
            .then_with(|| a.id.cmp(&b.id))
    });

    let excess = live.len() - capacity;
    ranked
        .into_iter()
        .take(excess)
        .map(|r| r.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, version: u64, modified_at: i64) -> Record {
        Record {
            record_type: "widget".to_string(),
            id: id.to_string(),
            version,
            data: Vec::new(),
            modified_at,
            deleted_at: None,
        }
    }

    #[test]
    fn under_capacity_evicts_nothing() {
        let a = record("a", 1, 10);
        let b = record("b", 1, 20);
        assert!(select_evictions(&[&a, &b], 2, None).is_empty());
    }

    #[test]
    fn evicts_least_recently_modified_first() {
        let a = record("a", 1, 30);
        let b = record("b", 4, 10);
        let c = record("c", 1, 20);
        assert_eq!(select_evictions(&[&a, &b, &c], 1, None), vec!["b", "c"]);
    }

    #[test]
    fn ties_break_by_version_then_id() {
        let a = record("a", 3, 10);
        let b = record("b", 2, 10);
        let c = record("c", 2, 10);
        assert_eq!(select_evictions(&[&a, &b, &c], 1, None), vec!["b", "c"]);
    }

    #[test]
    fn written_record_is_ranked_newest() {
        let old = record("old", 9, 10);
        let fresh = record("fresh", 1, 10);
        assert_eq!(select_evictions(&[&old, &fresh], 1, Some("fresh")), vec!["old"]);
    }

    #[test]
    fn zero_capacity_evicts_everything() {
        let a = record("a", 1, 10);
        let b = record("b", 1, 20);
        assert_eq!(select_evictions(&[&a, &b], 0, Some("a")), vec!["b", "a"]);
    }
}
