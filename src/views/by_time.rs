//! Timestamp-ordered range indexes.
//!
//! Every valid entry is inserted under an order-preserving encoding of its
//! effective timestamp; there is no merge by id. Replays are idempotent
//! because the effective timestamp is deterministic, so the same entry maps
//! to the same key and overwrites itself.

use std::ops::Bound;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::debug;

use super::{candidates, time_key, Index, SEP, SEP_END};
use crate::engine::View;
use crate::entry::{MergedEntry, Object};
use crate::store::{IndexStore, Op};
use crate::validate;

const TAIL_CAP: usize = 256;

/// Bounds for a time-ordered read, newest first by default.
#[derive(Debug, Clone)]
pub struct RangeQuery {
    pub greater_than: Option<u64>,
    pub less_than: Option<u64>,
    pub reverse: bool,
}

impl Default for RangeQuery {
    fn default() -> Self {
        RangeQuery {
            greater_than: None,
            less_than: None,
            reverse: true,
        }
    }
}

fn time_bounds(query: &RangeQuery) -> (Option<String>, Option<String>) {
    let from = query.greater_than.map(|t| format!("{}{SEP}", time_key(t)));
    let to = query.less_than.map(|t| format!("{}{SEP_END}", time_key(t)));
    (from, to)
}

fn read_rows(idx: &Index, query: &RangeQuery) -> Result<Vec<Object>> {
    let (from, to) = time_bounds(query);
    let rows = idx.store.range(
        idx.table,
        from.as_deref().map_or(Bound::Unbounded, Bound::Excluded),
        to.as_deref().map_or(Bound::Unbounded, Bound::Excluded),
        query.reverse,
    )?;
    rows.into_iter()
        .map(|(_, bytes)| Ok(serde_json::from_slice(&bytes)?))
        .collect()
}

/// Plates in creation order. Keys are bare timestamps.
#[derive(Debug)]
pub struct TimeView {
    idx: Index,
}

impl TimeView {
    pub fn plates(store: IndexStore) -> Arc<Self> {
        Arc::new(TimeView {
            idx: Index::new(store, "lab.plates_by_time"),
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<Object>> {
        self.idx.get_json(key)
    }

    pub fn read(&self, query: &RangeQuery) -> Result<Vec<Object>> {
        read_rows(&self.idx, query)
    }
}

impl View for TimeView {
    fn name(&self) -> &'static str {
        self.idx.table
    }

    fn apply(&self, batch: &[MergedEntry]) -> Result<Vec<Op>> {
        let mut ops = Vec::new();
        for candidate in candidates(batch, validate::plate) {
            let mut obj = candidate.obj;
            obj.synchronized_at = Some(candidate.received_at);
            ops.push(Op::put(time_key(candidate.eff), serde_json::to_vec(&obj)?));
        }
        Ok(ops)
    }
}

/// Error from [`TailTimeView::mark_synced`].
#[derive(Debug, thiserror::Error)]
pub enum MarkError {
    /// No row under that key.
    #[error("row not found")]
    NotFound,
    /// Storage-level failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Swab tubes in creation order, with a live tail.
///
/// Keys carry the object id as suffix so tubes created within the same
/// millisecond keep distinct rows. The tail feed is fed after each batch
/// commits, so a subscriber only sees rows that a gated reader could
/// already query; a new subscription starts from "now".
#[derive(Debug)]
pub struct TailTimeView {
    idx: Index,
    tail: broadcast::Sender<Object>,
}

impl TailTimeView {
    pub fn swab_tubes(store: IndexStore) -> Arc<Self> {
        let (tail, _) = broadcast::channel(TAIL_CAP);
        Arc::new(TailTimeView {
            idx: Index::new(store, "lab.swab_tubes_by_time"),
            tail,
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<Object>> {
        self.idx.get_json(key)
    }

    pub fn read(&self, query: &RangeQuery) -> Result<Vec<Object>> {
        read_rows(&self.idx, query)
    }

    /// Live feed of rows as they are committed.
    pub fn subscribe(&self) -> broadcast::Receiver<Object> {
        self.tail.subscribe()
    }

    /// Flags a row as reported upstream. Idempotent: returns `Ok(false)`
    /// when the row was already flagged.
    pub fn mark_synced(&self, key: &str) -> Result<bool, MarkError> {
        let mut missing = false;
        let wrote = self
            .idx
            .store
            .update(self.idx.table, key, |current| {
                let Some(bytes) = current else {
                    missing = true;
                    return Ok(None);
                };
                let mut obj: Object = serde_json::from_slice(&bytes)?;
                if obj.uplink_synced == Some(true) {
                    debug!(key, "already marked synced");
                    return Ok(None);
                }
                obj.uplink_synced = Some(true);
                Ok(Some(serde_json::to_vec(&obj)?))
            })
            .map_err(MarkError::Other)?;
        if missing {
            return Err(MarkError::NotFound);
        }
        if wrote {
            debug!(key, "marked synced");
        }
        Ok(wrote)
    }
}

impl View for TailTimeView {
    fn name(&self) -> &'static str {
        self.idx.table
    }

    fn apply(&self, batch: &[MergedEntry]) -> Result<Vec<Op>> {
        let mut ops = Vec::new();
        for candidate in candidates(batch, validate::swab_tube) {
            let mut obj = candidate.obj;
            obj.synchronized_at = Some(candidate.received_at);
            let key = format!("{}{SEP}{}", time_key(candidate.eff), obj.id);
            ops.push(Op::put(key, serde_json::to_vec(&obj)?));
        }
        Ok(ops)
    }

    fn committed(&self, ops: &[Op]) {
        for op in ops {
            if let Op::Put { value, .. } = op {
                if let Ok(obj) = serde_json::from_slice::<Object>(value) {
                    // Only fails when nobody is tailing.
                    let _ = self.tail.send(obj);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::views::testutil::*;

    fn setup_tubes() -> (tempfile::TempDir, IndexStore, Arc<TailTimeView>) {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::open(&dir.path().join("views.redb")).unwrap();
        let view = TailTimeView::swab_tubes(store.clone());
        store.ensure_table(view.name()).unwrap();
        (dir, store, view)
    }

    #[test]
    fn reads_newest_first_within_bounds() {
        let (_dir, store, view) = setup_tubes();
        let now = 1_700_000_000_000;
        let batch: Vec<_> = (0..4u64)
            .map(|i| merged(&tube(&uuid(), now + i * 100, "b", "f"), i + 1, now + 1_000))
            .collect();
        let ops = view.apply(&batch).unwrap();
        store.commit(view.name(), &ops, 4).unwrap();

        let all = view.read(&RangeQuery::default()).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].created_at.millis(), Some(now + 300));
        assert_eq!(all[3].created_at.millis(), Some(now));

        let bounded = view
            .read(&RangeQuery {
                greater_than: Some(now),
                less_than: Some(now + 200),
                reverse: true,
            })
            .unwrap();
        let stamps: Vec<_> = bounded
            .iter()
            .map(|o| o.created_at.millis().unwrap())
            .collect();
        assert_eq!(stamps, vec![now + 200, now + 100, now]);
    }

    #[test]
    fn same_millisecond_tubes_keep_distinct_rows() {
        let (_dir, store, view) = setup_tubes();
        let now = 1_700_000_000_000;
        let batch = vec![
            merged(&tube(&uuid(), now, "b1", "f1"), 1, now + 10),
            merged(&tube(&uuid(), now, "b2", "f2"), 2, now + 10),
        ];
        let ops = view.apply(&batch).unwrap();
        store.commit(view.name(), &ops, 2).unwrap();
        assert_eq!(view.read(&RangeQuery::default()).unwrap().len(), 2);
    }

    #[test]
    fn tail_fires_after_commit() {
        let (_dir, store, view) = setup_tubes();
        let mut tail = view.subscribe();
        let now = 1_700_000_000_000;
        let obj = tube(&uuid(), now, "b", "f");
        let ops = view.apply(&[merged(&obj, 1, now)]).unwrap();
        store.commit(view.name(), &ops, 1).unwrap();
        view.committed(&ops);

        let seen = tail.try_recv().unwrap();
        assert_eq!(seen.id, obj.id);
    }

    #[test]
    fn mark_synced_is_idempotent() {
        let (_dir, store, view) = setup_tubes();
        let now = 1_700_000_000_000;
        let obj = tube(&uuid(), now, "b", "f");
        let ops = view.apply(&[merged(&obj, 1, now)]).unwrap();
        store.commit(view.name(), &ops, 1).unwrap();

        let key = format!("{}!{}", time_key(now), obj.id);
        assert!(view.mark_synced(&key).unwrap());
        assert!(!view.mark_synced(&key).unwrap());
        let row = view.get(&key).unwrap().unwrap();
        assert_eq!(row.uplink_synced, Some(true));

        assert!(matches!(
            view.mark_synced("no-such-key"),
            Err(MarkError::NotFound)
        ));
    }

    #[test]
    fn plates_collapse_within_one_millisecond() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::open(&dir.path().join("views.redb")).unwrap();
        let view = TimeView::plates(store.clone());
        store.ensure_table(view.name()).unwrap();

        // Plate keys are bare timestamps; two plates in the same millisecond
        // share a key and the later write wins.
        let now = 1_700_000_000_000;
        let batch = vec![
            merged(&plate(&uuid(), now, "p1"), 1, now + 10),
            merged(&plate(&uuid(), now, "p2"), 2, now + 10),
        ];
        let ops = view.apply(&batch).unwrap();
        store.commit(view.name(), &ops, 2).unwrap();

        let all = view.read(&RangeQuery::default()).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].kind.barcode(), Some("p2"));
    }
}
