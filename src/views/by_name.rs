//! Users by username.
//!
//! Usernames are not unique, so the key is `name!id`; looking a name up
//! returns every user carrying it.

use std::ops::Bound;
use std::sync::Arc;

use anyhow::Result;

use super::{lww_ops, Index, SEP, SEP_END};
use crate::engine::View;
use crate::entry::{Kind, MergedEntry, Object};
use crate::store::{IndexStore, Op};
use crate::validate;

fn make_key(name: &str, id: &str) -> String {
    format!("{name}{SEP}{id}")
}

// Bounds for all keys of exactly this name. The end bound caps the id
// segment, not the name, so `kim` never matches `kimberly!...`.
fn name_floor(name: &str) -> String {
    format!("{name}{SEP}")
}

fn name_ceil(name: &str) -> String {
    format!("{name}{SEP}{SEP_END}")
}

#[derive(Debug)]
pub struct UserNameView {
    idx: Index,
}

impl UserNameView {
    pub fn new(store: IndexStore) -> Arc<Self> {
        Arc::new(UserNameView {
            idx: Index::new(store, "admin.users_by_name"),
        })
    }

    /// All users with exactly this name.
    pub fn get(&self, name: &str) -> Result<Vec<Object>> {
        let from = name_floor(name);
        let to = name_ceil(name);
        let rows = self.idx.store.range(
            self.idx.table,
            Bound::Excluded(from.as_str()),
            Bound::Excluded(to.as_str()),
            false,
        )?;
        rows.into_iter()
            .map(|(_, bytes)| Ok(serde_json::from_slice(&bytes)?))
            .collect()
    }

    /// Name-ordered scan, bounds inclusive.
    pub fn read(&self, from_name: Option<&str>, to_name: Option<&str>) -> Result<Vec<Object>> {
        let from = from_name.map(name_floor);
        let to = to_name.map(name_ceil);
        let rows = self.idx.store.range(
            self.idx.table,
            from.as_deref().map_or(Bound::Unbounded, Bound::Excluded),
            to.as_deref().map_or(Bound::Unbounded, Bound::Excluded),
            false,
        )?;
        rows.into_iter()
            .map(|(_, bytes)| Ok(serde_json::from_slice(&bytes)?))
            .collect()
    }
}

impl View for UserNameView {
    fn name(&self) -> &'static str {
        self.idx.table
    }

    fn apply(&self, batch: &[MergedEntry]) -> Result<Vec<Op>> {
        lww_ops(
            &self.idx,
            batch,
            validate::user,
            |obj| match &obj.kind {
                Kind::User(user) => user.name.as_ref().map(|name| make_key(name, &obj.id)),
                _ => None,
            },
            |obj| {
                obj.changed_field("name")
                    .map(|old_name| make_key(old_name, &obj.id))
            },
        )
    }
}
