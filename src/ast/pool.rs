//! Blocking-callback worker pool.
//!
//! Blocking callbacks and batched cancels are handed to a fixed set of tokio
//! tasks sharing one FIFO queue. Closing the queue stops the workers once the
//! queued work is drained.

use crate::lock::LockRef;
use crate::namespace::Namespace;
use crate::types::LockDesc;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One queued item.
pub enum BlockingWork {
    /// Run the blocking callback of `lock`.
    Blocking {
        ns: Arc<Namespace>,
        lock: LockRef,
        desc: Option<LockDesc>,
    },
    /// Cancel locks already marked CANCELING, typically from the unused cache.
    Cancel {
        ns: Arc<Namespace>,
        locks: Vec<LockRef>,
    },
}

/// Whoever owns the pool executes its work.
#[async_trait]
pub trait BlockingWorker: Send + Sync + 'static {
    async fn handle_work(&self, work: BlockingWork);
}

#[derive(Default)]
struct PoolCounters {
    queued: AtomicUsize,
    processed: AtomicU64,
}

/// Fixed-size pool of blocking-callback workers.
pub struct BlockingPool {
    tx: Mutex<Option<mpsc::UnboundedSender<BlockingWork>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<PoolCounters>,
}

impl BlockingPool {
    /// Spawn `threads` workers. Must be called inside a tokio runtime.
    ///
    /// Workers hold only a weak reference to their owner and stop once it is
    /// dropped.
    pub fn start<W: BlockingWorker>(threads: usize, worker: Weak<W>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(PoolCounters::default());
        let workers = (0..threads.max(1))
            .map(|id| {
                let rx = rx.clone();
                let worker = worker.clone();
                let counters = counters.clone();
                tokio::spawn(async move {
                    run_worker(id, rx, worker, counters).await;
                })
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            counters,
        }
    }

    /// Queue work. Hands the work back if the pool is shut down so the caller
    /// can run it inline.
    pub fn submit(&self, work: BlockingWork) -> Result<(), BlockingWork> {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return Err(work);
        };
        self.counters.queued.fetch_add(1, Ordering::AcqRel);
        tx.send(work).map_err(|e| {
            self.counters.queued.fetch_sub(1, Ordering::AcqRel);
            e.0
        })
    }

    /// Close the queue and wait for the workers to drain it.
    pub async fn shutdown(&self) {
        self.tx.lock().take();
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "blocking worker ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.tx.lock().is_some()
    }

    /// Items queued but not yet finished.
    pub fn queued(&self) -> usize {
        self.counters.queued.load(Ordering::Acquire)
    }

    pub fn processed(&self) -> u64 {
        self.counters.processed.load(Ordering::Acquire)
    }
}

async fn run_worker<W: BlockingWorker>(
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<BlockingWork>>>,
    worker: Weak<W>,
    counters: Arc<PoolCounters>,
) {
    debug!(worker = id, "blocking worker started");
    loop {
        let work = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(work) = work else {
            break;
        };
        let Some(worker) = worker.upgrade() else {
            counters.queued.fetch_sub(1, Ordering::AcqRel);
            break;
        };
        worker.handle_work(work).await;
        counters.queued.fetch_sub(1, Ordering::AcqRel);
        counters.processed.fetch_add(1, Ordering::AcqRel);
    }
    debug!(worker = id, "blocking worker stopped");
}
