//! Incremental view indexing over a log.
//!
//! Each registered view gets its own sequential worker task: read the next
//! batch of merged entries above the view's watermark, let the view derive
//! its index ops, commit ops and watermark atomically, repeat. Views never
//! see a batch twice with effect (replay after a crash is made harmless by
//! the views' own idempotence) and never process two batches concurrently
//! with themselves, which is what makes their fetch-before-write conflict
//! checks correct without per-key locking. Distinct views own disjoint
//! tables and run concurrently with each other.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, error_span, Instrument};

use crate::entry::MergedEntry;
use crate::log::MultiLog;
use crate::store::{IndexStore, Op};

/// How many merged entries a worker hands to a view at once.
const BATCH_SIZE: usize = 64;

/// One incrementally maintained index over a log.
///
/// `apply` must be idempotent: re-delivery of an already applied batch must
/// leave the index unchanged. It returns the batch of index writes; the
/// engine commits them atomically together with the view's watermark.
pub trait View: Send + Sync + 'static {
    /// Unique name, also the index table name.
    fn name(&self) -> &'static str;

    fn apply(&self, batch: &[MergedEntry]) -> Result<Vec<Op>>;

    /// Called after a batch has been committed. Used by the live tail.
    fn committed(&self, _ops: &[Op]) {}
}

/// Blocks readers until every registered view has caught up with the log.
#[derive(Debug, Clone)]
pub struct ReadyGate {
    tip: watch::Receiver<u64>,
    views: Arc<parking_lot::Mutex<Vec<watch::Receiver<u64>>>>,
}

impl ReadyGate {
    /// Resolves once all views have applied the log up to the tip observed
    /// at the time of the call. Queries issued after a known write therefore
    /// see that write (monotonic reads / read-your-writes).
    pub async fn ready(&self) -> Result<()> {
        let tip = *self.tip.borrow();
        let views: Vec<_> = self.views.lock().clone();
        for mut applied in views {
            applied
                .wait_for(|at| *at >= tip)
                .await
                .context("view worker stopped")?;
        }
        Ok(())
    }
}

/// Read access to a view, gated on the engine having caught up.
#[derive(Debug)]
pub struct ViewHandle<V> {
    view: Arc<V>,
    gate: ReadyGate,
}

impl<V> Clone for ViewHandle<V> {
    fn clone(&self) -> Self {
        ViewHandle {
            view: self.view.clone(),
            gate: self.gate.clone(),
        }
    }
}

impl<V> ViewHandle<V> {
    /// Waits for all views to catch up, then exposes the view's query API.
    pub async fn read(&self) -> Result<&V> {
        self.gate.ready().await?;
        Ok(&self.view)
    }

    /// Ungated access, for subscriptions and out-of-band mutations.
    pub fn view(&self) -> &V {
        &self.view
    }
}

/// Runs the registered views of one log.
#[derive(Debug)]
pub struct ViewEngine {
    log: MultiLog,
    store: IndexStore,
    gate: ReadyGate,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ViewEngine {
    pub fn new(log: MultiLog, store: IndexStore) -> Self {
        let gate = ReadyGate {
            tip: log.watch_tip(),
            views: Arc::new(parking_lot::Mutex::new(Vec::new())),
        };
        ViewEngine {
            log,
            store,
            gate,
            workers: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn ready_gate(&self) -> ReadyGate {
        self.gate.clone()
    }

    /// Registers a view and spawns its worker.
    ///
    /// The worker resumes from the view's persisted watermark, so entries
    /// already applied before a restart are replayed at most into `apply`
    /// of an idempotent view, never duplicated in the index.
    pub fn register<V: View>(&self, view: Arc<V>) -> Result<ViewHandle<V>> {
        let name = view.name();
        self.store.ensure_table(name)?;
        let applied = self.store.applied(name)?;
        let (applied_tx, applied_rx) = watch::channel(applied);
        self.gate.views.lock().push(applied_rx);

        let worker = Worker {
            log: self.log.clone(),
            store: self.store.clone(),
            view: view.clone(),
            applied,
            applied_tx,
        };
        let handle = tokio::spawn(
            worker
                .run()
                .instrument(error_span!("view", log = self.log.name(), name)),
        );
        self.workers.lock().push(handle);

        debug!(log = self.log.name(), view = name, applied, "view registered");
        Ok(ViewHandle {
            view,
            gate: self.gate.clone(),
        })
    }

    /// Stops the workers and waits until they have dropped their store
    /// handles, so the data directory can be reopened afterwards.
    pub async fn shutdown(&self) {
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            worker.abort();
            // Cancellation is the expected way out here.
            let _ = worker.await;
        }
    }
}

impl Drop for ViewEngine {
    fn drop(&mut self) {
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
    }
}

struct Worker<V> {
    log: MultiLog,
    store: IndexStore,
    view: Arc<V>,
    applied: u64,
    applied_tx: watch::Sender<u64>,
}

impl<V: View> Worker<V> {
    async fn run(mut self) {
        let mut tip = self.log.watch_tip();
        loop {
            if *tip.borrow() <= self.applied {
                if tip.wait_for(|t| *t > self.applied).await.is_err() {
                    break; // log dropped, shutting down
                }
            }
            if let Err(err) = self.step() {
                // A storage failure must not half-apply; the failed batch was
                // not committed and this view stops until restart.
                error!("view failed: {err:#}");
                break;
            }
        }
    }

    fn step(&mut self) -> Result<()> {
        let batch = self.log.read_after(self.applied, BATCH_SIZE)?;
        let Some(last) = batch.last() else {
            return Ok(());
        };
        let up_to = last.arrival;
        let ops = self.view.apply(&batch)?;
        self.store.commit(self.view.name(), &ops, up_to)?;
        self.view.committed(&ops);
        self.applied = up_to;
        self.applied_tx.send_replace(up_to);
        Ok(())
    }
}
