//! Primary index: every object keyed by its id.

use std::ops::Bound;
use std::sync::Arc;

use anyhow::Result;

use super::{lww_ops, Index};
use crate::engine::View;
use crate::entry::{MergedEntry, Object};
use crate::store::{IndexStore, Op};
use crate::validate;

/// Last-write-wins primary index by object id.
///
/// Registered once per log: over the lab log it accepts any structurally
/// valid object, over the admin log only users.
#[derive(Debug)]
pub struct IdView {
    idx: Index,
    accept: fn(&Object) -> bool,
}

impl IdView {
    /// Everything in the lab log, by GUID.
    pub fn objects(store: IndexStore) -> Arc<Self> {
        Arc::new(IdView {
            idx: Index::new(store, "lab.objects_by_id"),
            accept: validate::object,
        })
    }

    /// Users in the admin log, by GUID.
    pub fn users(store: IndexStore) -> Arc<Self> {
        Arc::new(IdView {
            idx: Index::new(store, "admin.users_by_id"),
            accept: validate::user,
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<Object>> {
        self.idx.get_json(id)
    }

    /// Id-ordered scan, bounds inclusive of neither end.
    pub fn scan(&self, after: Option<&str>, before: Option<&str>) -> Result<Vec<Object>> {
        let from = after.map_or(Bound::Unbounded, Bound::Excluded);
        let to = before.map_or(Bound::Unbounded, Bound::Excluded);
        let rows = self.idx.store.range(self.idx.table, from, to, false)?;
        rows.into_iter()
            .map(|(_, bytes)| Ok(serde_json::from_slice(&bytes)?))
            .collect()
    }
}

impl View for IdView {
    fn name(&self) -> &'static str {
        self.idx.table
    }

    fn apply(&self, batch: &[MergedEntry]) -> Result<Vec<Op>> {
        lww_ops(
            &self.idx,
            batch,
            self.accept,
            |obj| Some(obj.id.clone()),
            |_| None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::views::testutil::*;

    fn setup() -> (tempfile::TempDir, IndexStore, Arc<IdView>) {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::open(&dir.path().join("views.redb")).unwrap();
        let view = IdView::objects(store.clone());
        store.ensure_table(view.name()).unwrap();
        (dir, store, view)
    }

    fn commit(store: &IndexStore, view: &IdView, batch: &[crate::entry::MergedEntry], at: u64) {
        let ops = view.apply(batch).unwrap();
        store.commit(view.name(), &ops, at).unwrap();
    }

    #[test]
    fn newest_revision_wins_in_either_order() {
        let (_dir, store, view) = setup();
        let id = uuid();
        let now = 1_700_000_000_000;
        let old = tube(&id, now + 100, "b", "f-old");
        let new = tube(&id, now + 200, "b", "f-new");

        // Old then new.
        commit(&store, &view, &[merged(&old, 1, now + 300)], 1);
        commit(&store, &view, &[merged(&new, 2, now + 300)], 2);
        let got = view.get(&id).unwrap().unwrap();
        assert_eq!(got.created_at.millis(), Some(now + 200));

        // New then old: the late-arriving older revision is ignored.
        commit(&store, &view, &[merged(&old, 3, now + 400)], 3);
        let got = view.get(&id).unwrap().unwrap();
        assert_eq!(got.created_at.millis(), Some(now + 200));
    }

    #[test]
    fn both_revisions_in_one_batch() {
        let (_dir, store, view) = setup();
        let id = uuid();
        let now = 1_700_000_000_000;
        let new = tube(&id, now + 200, "b", "f-new");
        let old = tube(&id, now + 100, "b", "f-old");

        // Delivered newest-first within the batch; the sort still makes the
        // newest revision win.
        let batch = vec![merged(&new, 1, now + 300), merged(&old, 2, now + 300)];
        commit(&store, &view, &batch, 2);
        let got = view.get(&id).unwrap().unwrap();
        assert_eq!(got.created_at.millis(), Some(now + 200));
    }

    #[test]
    fn replay_is_idempotent_and_keeps_synchronized_at() {
        let (_dir, store, view) = setup();
        let id = uuid();
        let now = 1_700_000_000_000;
        let obj = tube(&id, now, "b", "f");

        let batch = vec![merged(&obj, 1, now + 5)];
        commit(&store, &view, &batch, 1);
        let first = view.get(&id).unwrap().unwrap();
        assert_eq!(first.synchronized_at, Some(now + 5));

        // Replaying the identical batch produces no ops at all.
        let ops = view.apply(&batch).unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn future_stamp_does_not_shadow_honest_writes() {
        let (_dir, store, view) = setup();
        let id = uuid();
        let now = 1_700_000_000_000;

        // A writer with a clock an hour ahead.
        let skewed = tube(&id, now + 3_600_000, "b", "f-skewed");
        commit(&store, &view, &[merged(&skewed, 1, now)], 1);

        // The stored value keeps the original stamp...
        let got = view.get(&id).unwrap().unwrap();
        assert_eq!(got.created_at.millis(), Some(now + 3_600_000));

        // ...but an honest later write still wins, because ordering used the
        // clamped effective timestamp.
        let honest = tube(&id, now + 1_000, "b", "f-honest");
        commit(&store, &view, &[merged(&honest, 2, now + 1_000)], 2);
        let got = view.get(&id).unwrap().unwrap();
        assert_eq!(got.created_at.millis(), Some(now + 1_000));
    }
}
