//! The per-index update queue.
//!
//! Single producer (the binlog consumer), multiple consumers (the worker
//! pool), FIFO. Unbounded in principle; in practice bounded by
//! replication-stream flow control. Workers block on `recv` and exit
//! when the producer side is dropped.

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::cdc::IndexUpdate;

/// The queue owns the only producing [`Sender`]; dropping the queue
/// disconnects every worker once the backlog drains.
pub struct UpdateQueue {
    tx: Sender<IndexUpdate>,
    rx: Receiver<IndexUpdate>,
}

impl Default for UpdateQueue {
    fn default() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, item: IndexUpdate) {
        // Send fails only when all receivers are gone, meaning the worker
        // pool already shut down; the update is dropped with the stream.
        if self.tx.send(item).is_err() {
            tracing::warn!("update queue has no consumers, dropping row");
        }
    }

    /// Handle for a worker thread. Receivers share one FIFO; each item is
    /// delivered to exactly one worker.
    pub fn consumer(&self) -> Receiver<IndexUpdate> {
        self.rx.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }
}
