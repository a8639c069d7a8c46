//! The concrete index views.
//!
//! Every view follows the same shape: filter the batch through its
//! validator, derive an effective ordering timestamp (future stamps are
//! clamped to the local application time), then either merge by key with a
//! last-write-wins check (fetch-before-write) or insert every entry under a
//! time-ordered key. The resulting ops are committed by the engine as one
//! atomic batch per view.

use anyhow::Result;
use serde::de::DeserializeOwned;

use crate::entry::{MergedEntry, Object};
use crate::store::{IndexStore, Op};

pub mod by_id;
pub mod by_name;
pub mod by_time;
pub mod secondary;
pub mod well_results;

pub use by_id::IdView;
pub use by_name::UserNameView;
pub use by_time::{MarkError, RangeQuery, TailTimeView, TimeView};
pub use secondary::SecondaryView;
pub use well_results::{SampleResult, WellResultView};

/// Key separator between a secondary value and its disambiguator.
pub(crate) const SEP: char = '!';
/// Sorts after every character that occurs in ids, names and barcodes.
pub(crate) const SEP_END: char = '~';

/// Order-preserving key encoding for millisecond timestamps: zero-padded
/// decimal, so byte order equals numeric order.
pub(crate) fn time_key(millis: u64) -> String {
    format!("{millis:020}")
}

/// One entry that passed a view's validator.
pub(crate) struct Candidate {
    pub obj: Object,
    /// Effective ordering timestamp: `created_at` clamped to the local
    /// application time, so a clock-skewed writer cannot permanently shadow
    /// future honest writes. Deterministic across replays because
    /// `received_at` is persisted with the arrival record.
    pub eff: u64,
    pub received_at: u64,
}

/// Filters and stamps a batch, sorted by effective timestamp ascending so
/// that when one batch carries several revisions of the same id the newest
/// lands last and wins.
pub(crate) fn candidates(
    batch: &[MergedEntry],
    accept: impl Fn(&Object) -> bool,
) -> Vec<Candidate> {
    let mut out: Vec<Candidate> = batch
        .iter()
        .filter_map(|entry| {
            let obj = entry.object()?;
            if !accept(&obj) {
                return None;
            }
            let created = obj.created_at.millis()?;
            Some(Candidate {
                obj,
                eff: created.min(entry.received_at),
                received_at: entry.received_at,
            })
        })
        .collect();
    out.sort_by_key(|c| c.eff);
    out
}

/// The effective timestamp a stored row was indexed under.
///
/// Stored rows keep the writer's original `created_at`; if it was clamped at
/// application time the clamp value equals the row's `synchronized_at`.
pub(crate) fn stored_effective(obj: &Object) -> u64 {
    let created = obj.created_at.millis().unwrap_or(0);
    match obj.synchronized_at {
        Some(synced) => created.min(synced),
        None => created,
    }
}

/// A view's slice of the index store.
#[derive(Debug, Clone)]
pub(crate) struct Index {
    pub store: IndexStore,
    pub table: &'static str,
}

impl Index {
    pub fn new(store: IndexStore, table: &'static str) -> Self {
        Index { store, table }
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(self.table, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Shared merge-by-key algorithm for the LWW views.
///
/// For each candidate, fetch the row currently stored under the view's key
/// and skip the write unless the candidate is strictly newer (ties keep the
/// first applied entry, which also makes replays no-ops). On a rename the
/// stale key's delete rides in the same batch as the insert.
pub(crate) fn lww_ops(
    idx: &Index,
    batch: &[MergedEntry],
    accept: impl Fn(&Object) -> bool,
    key_of: impl Fn(&Object) -> Option<String>,
    old_key_of: impl Fn(&Object) -> Option<String>,
) -> Result<Vec<Op>> {
    let mut ops = Vec::new();
    for candidate in candidates(batch, accept) {
        let Some(key) = key_of(&candidate.obj) else {
            continue;
        };
        if let Some(stored) = idx.get_json::<Object>(&key)? {
            if candidate.eff <= stored_effective(&stored) {
                continue;
            }
        }
        let old_key = old_key_of(&candidate.obj).filter(|old| *old != key);
        let mut obj = candidate.obj;
        obj.synchronized_at = Some(candidate.received_at);
        ops.push(Op::put(key, serde_json::to_vec(&obj)?));
        if let Some(old_key) = old_key {
            ops.push(Op::del(old_key));
        }
    }
    Ok(ops)
}
