//! Ordered MPSC queues drained once per tick
//!
//! Producers are host notification threads and RPC tasks; the scheduler owns the
//! only `QueueConsumer`. The queue is unbounded: dropping items would lose
//! notifications and bounding would block host threads.

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::trace;

/// Sending half, cheap to clone across threads
pub struct QueueProducer<T> {
    tx: Sender<T>,
}

impl<T> Clone for QueueProducer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> QueueProducer<T> {
    /// Enqueue an item; never blocks
    ///
    /// Returns false only when the consumer has been dropped.
    pub fn push(&self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }
}

/// Receiving half, owned by exactly one drainer
pub struct QueueConsumer<T> {
    rx: Receiver<T>,
}

impl<T> QueueConsumer<T> {
    /// Remove every item queued when the drain starts, in FIFO order
    ///
    /// Items pushed while draining are left for the next call.
    pub fn drain_all(&self) -> Vec<T> {
        let pending = self.rx.len();
        let batch: Vec<T> = self.rx.try_iter().take(pending).collect();
        if !batch.is_empty() {
            trace!(count = batch.len(), "Drained queue");
        }
        batch
    }

    /// A handle that can empty this queue without draining it
    pub fn discarder(&self) -> QueueDiscard<T> {
        QueueDiscard {
            rx: self.rx.clone(),
        }
    }
}

/// Drops queued items that must never reach the drainer
pub struct QueueDiscard<T> {
    rx: Receiver<T>,
}

impl<T> QueueDiscard<T> {
    /// Drop every item queued right now; returns how many were dropped
    pub fn discard(&self) -> usize {
        let pending = self.rx.len();
        self.rx.try_iter().take(pending).count()
    }
}

/// Create a connected producer/consumer pair
pub fn channel<T>() -> (QueueProducer<T>, QueueConsumer<T>) {
    let (tx, rx) = unbounded();
    (QueueProducer { tx }, QueueConsumer { rx })
}
