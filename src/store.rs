//! Index storage for the views.
//!
//! One redb database holds every view's table plus a watermark table
//! recording how far into the log's arrival order each view has applied.
//! A view's batch and its watermark are committed in a single write
//! transaction, so a reader never observes a half-applied batch and a
//! restart resumes exactly after the last committed batch.

use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};

// Watermarks
// Key: &str # view name
// Value: u64 # highest applied arrival position
const VIEW_STATE_TABLE: TableDefinition<&str, u64> = TableDefinition::new("view-state-1");

fn def(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

/// One write of a view batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Put { key: String, value: Vec<u8> },
    Del { key: String },
}

impl Op {
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Self {
        Op::Put {
            key: key.into(),
            value,
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Op::Del { key: key.into() }
    }
}

/// Shared handle to the views database.
#[derive(Debug, Clone)]
pub struct IndexStore {
    db: Arc<Database>,
}

impl IndexStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)
            .with_context(|| format!("opening index store at {}", path.display()))?;
        let tx = db.begin_write()?;
        {
            let _ = tx.open_table(VIEW_STATE_TABLE)?;
        }
        tx.commit()?;
        Ok(IndexStore { db: Arc::new(db) })
    }

    /// Creates a view's table if it does not exist yet.
    pub fn ensure_table(&self, table: &str) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let _ = tx.open_table(def(table))?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(def(table))?;
        Ok(table.get(key)?.map(|guard| guard.value().to_vec()))
    }

    /// Key-ordered scan between the given bounds, optionally newest-first.
    ///
    /// Returns a finite collected sequence; a fresh call restarts the scan.
    pub fn range(
        &self,
        table: &str,
        from: Bound<&str>,
        to: Bound<&str>,
        reverse: bool,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(def(table))?;
        let iter = table.range::<&str>((from, to))?;
        let mut rows = Vec::new();
        if reverse {
            for row in iter.rev() {
                let (key, value) = row?;
                rows.push((key.value().to_string(), value.value().to_vec()));
            }
        } else {
            for row in iter {
                let (key, value) = row?;
                rows.push((key.value().to_string(), value.value().to_vec()));
            }
        }
        Ok(rows)
    }

    /// Applies a view batch and advances the view's watermark atomically.
    ///
    /// Ops apply in order, so a later put to the same key wins within one
    /// batch, and a rename's del/put pair becomes visible together.
    pub fn commit(&self, view: &str, ops: &[Op], applied: u64) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(def(view))?;
            for op in ops {
                match op {
                    Op::Put { key, value } => {
                        table.insert(key.as_str(), value.as_slice())?;
                    }
                    Op::Del { key } => {
                        table.remove(key.as_str())?;
                    }
                }
            }
            let mut state = tx.open_table(VIEW_STATE_TABLE)?;
            state.insert(view, applied)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// The view's last committed watermark, 0 when it has never run.
    pub fn applied(&self, view: &str) -> Result<u64> {
        let tx = self.db.begin_read()?;
        let state = tx.open_table(VIEW_STATE_TABLE)?;
        Ok(state.get(view)?.map(|g| g.value()).unwrap_or(0))
    }

    /// Read-modify-write of a single row in one transaction.
    ///
    /// The closure returns the new value, or `None` to leave the row alone.
    /// Returns whether the row was written.
    pub fn update(
        &self,
        table: &str,
        key: &str,
        f: impl FnOnce(Option<Vec<u8>>) -> Result<Option<Vec<u8>>>,
    ) -> Result<bool> {
        let tx = self.db.begin_write()?;
        let changed;
        {
            let mut table = tx.open_table(def(table))?;
            let current = table.get(key)?.map(|guard| guard.value().to_vec());
            match f(current)? {
                Some(value) => {
                    table.insert(key, value.as_slice())?;
                    changed = true;
                }
                None => changed = false,
            }
        }
        tx.commit()?;
        Ok(changed)
    }
}
