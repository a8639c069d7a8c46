//! Append-only multi-writer logs.
//!
//! Each logical log (`lab`, `admin`) is a set of per-writer append-only
//! segments stored in one redb database, merged locally into a single
//! arrival order. Entries are immutable once written; merge from peers is
//! deduplicated per writer by sequence number, so replaying a delta is
//! harmless.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::entry::{now_millis, LogEntry, MergedEntry, WriterId};

// Entries
// Key: ([u8; 32], u64) # (WriterId, seq), seq starts at 1
// Value: &[u8]         # raw JSON payload
const ENTRIES_TABLE: TableDefinition<(&[u8; 32], u64), &[u8]> = TableDefinition::new("entries-1");

// Heads
// Key: [u8; 32] # WriterId
// Value: u64    # highest seq for that writer
const HEADS_TABLE: TableDefinition<&[u8; 32], u64> = TableDefinition::new("heads-1");

// Arrivals: the local merge order
// Key: u64                      # arrival seq, starts at 1
// Value: ([u8; 32], u64, u64)   # (WriterId, seq, received_at millis)
const ARRIVALS_TABLE: TableDefinition<u64, (&[u8; 32], u64, u64)> =
    TableDefinition::new("arrivals-1");

// Meta
// Key: &str # currently only "writer"
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta-1");

const EVENTS_CAP: usize = 256;

/// Highest known sequence number per writer.
///
/// Exchanged during replication handshakes; the difference between two state
/// vectors is exactly the delta one side is missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    heads: BTreeMap<WriterId, u64>,
}

impl StateVector {
    /// Insert a new head, keeping the maximum.
    pub fn insert(&mut self, writer: WriterId, seq: u64) {
        self.heads
            .entry(writer)
            .and_modify(|s| *s = (*s).max(seq))
            .or_insert(seq);
    }

    /// Highest seq known for `writer`, 0 when the writer is unknown.
    pub fn get(&self, writer: &WriterId) -> u64 {
        self.heads.get(writer).copied().unwrap_or(0)
    }

    /// Whether this state already covers the given entry.
    pub fn contains(&self, writer: &WriterId, seq: u64) -> bool {
        seq <= self.get(writer)
    }

    /// Merge another state vector into this one.
    pub fn merge(&mut self, other: &Self) {
        for (writer, seq) in other.heads.iter() {
            self.insert(*writer, *seq);
        }
    }

    pub fn iter(&self) -> std::collections::btree_map::Iter<'_, WriterId, u64> {
        self.heads.iter()
    }
}

#[derive(Debug)]
struct Shared {
    tip: watch::Sender<u64>,
    events: broadcast::Sender<MergedEntry>,
    // Serializes append/merge so that arrival order and event order agree.
    write: Mutex<()>,
}

/// One logical multi-writer log.
#[derive(Debug, Clone)]
pub struct MultiLog {
    name: &'static str,
    db: Arc<Database>,
    writer: WriterId,
    shared: Arc<Shared>,
}

impl MultiLog {
    /// Opens (or creates) the log database at `path`.
    ///
    /// The local writer id is generated on first open and persisted.
    pub fn open(name: &'static str, path: &Path) -> Result<Self> {
        let db = Database::create(path)
            .with_context(|| format!("opening {} log at {}", name, path.display()))?;

        let (writer, tip) = {
            let tx = db.begin_write()?;
            let writer;
            let tip;
            {
                let _entries = tx.open_table(ENTRIES_TABLE)?;
                let _heads = tx.open_table(HEADS_TABLE)?;
                let arrivals = tx.open_table(ARRIVALS_TABLE)?;
                let mut meta = tx.open_table(META_TABLE)?;

                // Copy the stored id out before inserting; the access guard
                // borrows the table.
                let existing = meta.get("writer")?.map(|guard| guard.value().to_vec());
                writer = match existing {
                    Some(bytes) => {
                        let bytes: [u8; 32] = bytes
                            .as_slice()
                            .try_into()
                            .context("corrupt writer id in log meta")?;
                        WriterId::from_bytes(bytes)
                    }
                    None => {
                        let id = WriterId::generate(&mut rand::thread_rng());
                        meta.insert("writer", id.as_bytes().as_slice())?;
                        id
                    }
                };
                tip = arrivals.last()?.map(|(k, _)| k.value()).unwrap_or(0);
            }
            tx.commit()?;
            (writer, tip)
        };

        debug!(log = name, writer = %writer.fmt_short(), tip, "log opened");
        let (tip_tx, _) = watch::channel(tip);
        let (events_tx, _) = broadcast::channel(EVENTS_CAP);
        Ok(MultiLog {
            name,
            db: Arc::new(db),
            writer,
            shared: Arc::new(Shared {
                tip: tip_tx,
                events: events_tx,
                write: Mutex::new(()),
            }),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The id under which this node appends.
    pub fn writer_id(&self) -> WriterId {
        self.writer
    }

    /// Position of the newest merged entry.
    pub fn tip(&self) -> u64 {
        *self.shared.tip.borrow()
    }

    /// Watch channel following [`Self::tip`].
    pub fn watch_tip(&self) -> watch::Receiver<u64> {
        self.shared.tip.subscribe()
    }

    /// Subscribe to entries as they are merged, starting from now.
    pub fn subscribe(&self) -> broadcast::Receiver<MergedEntry> {
        self.shared.events.subscribe()
    }

    /// Appends a record under the local writer id.
    pub fn append(&self, value: impl Into<Bytes>) -> Result<MergedEntry> {
        let value = value.into();
        let _guard = self.shared.write.lock();
        let received_at = now_millis();
        let arrival = self.tip() + 1;

        let entry = {
            let tx = self.db.begin_write()?;
            let entry;
            {
                let mut entries = tx.open_table(ENTRIES_TABLE)?;
                let mut heads = tx.open_table(HEADS_TABLE)?;
                let mut arrivals = tx.open_table(ARRIVALS_TABLE)?;

                let seq = heads
                    .get(self.writer.as_bytes())?
                    .map(|g| g.value())
                    .unwrap_or(0)
                    + 1;
                entries.insert((self.writer.as_bytes(), seq), value.as_ref())?;
                heads.insert(self.writer.as_bytes(), seq)?;
                arrivals.insert(arrival, (self.writer.as_bytes(), seq, received_at))?;
                entry = LogEntry {
                    writer: self.writer,
                    seq,
                    value,
                };
            }
            tx.commit()?;
            entry
        };

        let merged = MergedEntry {
            entry,
            arrival,
            received_at,
        };
        self.publish(std::slice::from_ref(&merged), arrival);
        Ok(merged)
    }

    /// Merges entries received from a peer, returning the ones that were new.
    ///
    /// Per-writer segments stay gapless: duplicates are dropped and an entry
    /// arriving ahead of its predecessor is skipped (the next delta exchange
    /// will carry it again in order).
    pub fn apply_remote(&self, batch: &[LogEntry]) -> Result<Vec<MergedEntry>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = self.shared.write.lock();
        let received_at = now_millis();
        let mut arrival = self.tip();
        let mut merged = Vec::new();

        let tx = self.db.begin_write()?;
        {
            let mut entries = tx.open_table(ENTRIES_TABLE)?;
            let mut heads = tx.open_table(HEADS_TABLE)?;
            let mut arrivals = tx.open_table(ARRIVALS_TABLE)?;

            for entry in batch {
                let writer = entry.writer;
                let head = heads
                    .get(writer.as_bytes())?
                    .map(|g| g.value())
                    .unwrap_or(0);
                if entry.seq <= head {
                    continue; // already have it
                }
                if entry.seq != head + 1 {
                    warn!(
                        log = self.name,
                        writer = %writer.fmt_short(),
                        have = head,
                        got = entry.seq,
                        "out of order entry, skipping"
                    );
                    continue;
                }
                arrival += 1;
                entries.insert((writer.as_bytes(), entry.seq), entry.value.as_ref())?;
                heads.insert(writer.as_bytes(), entry.seq)?;
                arrivals.insert(arrival, (writer.as_bytes(), entry.seq, received_at))?;
                merged.push(MergedEntry {
                    entry: entry.clone(),
                    arrival,
                    received_at,
                });
            }
        }
        tx.commit()?;

        if !merged.is_empty() {
            self.publish(&merged, arrival);
        }
        Ok(merged)
    }

    /// Highest seq per writer known locally.
    pub fn state_vector(&self) -> Result<StateVector> {
        let tx = self.db.begin_read()?;
        let heads = tx.open_table(HEADS_TABLE)?;
        let mut state = StateVector::default();
        for row in heads.iter()? {
            let (writer, seq) = row?;
            state.insert(WriterId::from_bytes(*writer.value()), seq.value());
        }
        Ok(state)
    }

    /// Every entry a remote with state `remote` is missing.
    pub fn entries_since(&self, remote: &StateVector) -> Result<Vec<LogEntry>> {
        let local = self.state_vector()?;
        let tx = self.db.begin_read()?;
        let entries = tx.open_table(ENTRIES_TABLE)?;
        let mut missing = Vec::new();
        for (writer, head) in local.iter() {
            let from = remote.get(writer) + 1;
            if from > *head {
                continue;
            }
            let bytes = *writer.as_bytes();
            for row in entries.range((&bytes, from)..=(&bytes, *head))? {
                let (key, value) = row?;
                let (_, seq) = key.value();
                missing.push(LogEntry {
                    writer: *writer,
                    seq,
                    value: Bytes::from(value.value().to_vec()),
                });
            }
        }
        Ok(missing)
    }

    /// Up to `limit` merged entries with arrival position greater than `after`.
    pub fn read_after(&self, after: u64, limit: usize) -> Result<Vec<MergedEntry>> {
        let tx = self.db.begin_read()?;
        let arrivals = tx.open_table(ARRIVALS_TABLE)?;
        let entries = tx.open_table(ENTRIES_TABLE)?;
        let mut out = Vec::new();
        for row in arrivals.range((after + 1)..)?.take(limit) {
            let (arrival, value) = row?;
            let (writer, seq, received_at) = value.value();
            let writer = WriterId::from_bytes(*writer);
            let payload = entries
                .get((writer.as_bytes(), seq))?
                .context("arrival record without entry")?;
            out.push(MergedEntry {
                entry: LogEntry {
                    writer,
                    seq,
                    value: Bytes::from(payload.value().to_vec()),
                },
                arrival: arrival.value(),
                received_at,
            });
        }
        Ok(out)
    }

    fn publish(&self, merged: &[MergedEntry], tip: u64) {
        self.shared.tip.send_replace(tip);
        for entry in merged {
            // Only fails when nobody is subscribed, which is fine.
            let _ = self.shared.events.send(entry.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp(name: &'static str) -> (tempfile::TempDir, MultiLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = MultiLog::open(name, &dir.path().join("log.redb")).unwrap();
        (dir, log)
    }

    #[test]
    fn append_and_read() {
        let (_dir, log) = open_temp("lab");
        let a = log.append(&br#"{"n":1}"#[..]).unwrap();
        let b = log.append(&br#"{"n":2}"#[..]).unwrap();
        assert_eq!((a.arrival, a.entry.seq), (1, 1));
        assert_eq!((b.arrival, b.entry.seq), (2, 2));
        assert_eq!(log.tip(), 2);

        let read = log.read_after(0, 10).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].entry.value.as_ref(), br#"{"n":1}"#);

        let page = log.read_after(1, 10).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].arrival, 2);
    }

    #[test]
    fn writer_id_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.redb");
        let first = MultiLog::open("lab", &path).unwrap().writer_id();
        let second = MultiLog::open("lab", &path).unwrap().writer_id();
        assert_eq!(first, second);
    }

    #[test]
    fn merge_dedups_and_keeps_order() {
        let (_dir, local) = open_temp("lab");
        let (_dir2, remote) = open_temp("lab");
        remote.append(&br#"{"n":1}"#[..]).unwrap();
        remote.append(&br#"{"n":2}"#[..]).unwrap();

        let delta = remote.entries_since(&local.state_vector().unwrap()).unwrap();
        assert_eq!(delta.len(), 2);

        let merged = local.apply_remote(&delta).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(local.tip(), 2);

        // Replaying the same delta merges nothing.
        let replay = local.apply_remote(&delta).unwrap();
        assert!(replay.is_empty());
        assert_eq!(local.tip(), 2);

        // Now the remote has nothing new for us.
        let delta = remote.entries_since(&local.state_vector().unwrap()).unwrap();
        assert!(delta.is_empty());
    }

    #[test]
    fn out_of_order_entries_are_skipped() {
        let (_dir, local) = open_temp("lab");
        let (_dir2, remote) = open_temp("lab");
        remote.append(&br#"{"n":1}"#[..]).unwrap();
        let gap = remote.append(&br#"{"n":2}"#[..]).unwrap();

        // Deliver seq 2 without seq 1.
        let merged = local.apply_remote(&[gap.entry.clone()]).unwrap();
        assert!(merged.is_empty());
        assert_eq!(local.tip(), 0);

        // The full delta still applies cleanly afterwards.
        let delta = remote.entries_since(&local.state_vector().unwrap()).unwrap();
        let merged = local.apply_remote(&delta).unwrap();
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn events_follow_merges() {
        let (_dir, log) = open_temp("lab");
        let mut events = log.subscribe();
        log.append(&br#"{"n":1}"#[..]).unwrap();
        let seen = events.try_recv().unwrap();
        assert_eq!(seen.arrival, 1);
    }
}
