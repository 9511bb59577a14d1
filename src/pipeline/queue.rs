//! Bounded FIFO queue connecting two pipeline stages.
//!
//! Both halves are cloneable: several writers may feed one queue and several
//! workers may compete for its items (first available receiver wins). The
//! queue closes once every [`QueueSender`] has been dropped; receivers then
//! drain whatever is still buffered and get `None`.
//!
//! A capacity of 0 gives a synchronous handoff: `send` only completes once a
//! receiver has actually taken the item. A rendezvous send that is abandoned
//! (cancelled or dropped) withdraws its item; receivers skip it.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::StageError;

/// Every receiver is gone; the item could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queue closed")]
pub struct QueueClosed;

struct Envelope<T> {
    item: T,
    /// Present only for rendezvous queues. Fired when a receiver takes the
    /// item; a closed ack means the sender gave up and the item is discarded.
    taken: Option<oneshot::Sender<()>>,
}

/// Writing half of a queue.
pub struct QueueSender<T> {
    tx: mpsc::Sender<Envelope<T>>,
    rendezvous: bool,
}

/// Reading half of a queue.
pub struct QueueReceiver<T> {
    rx: Arc<Mutex<mpsc::Receiver<Envelope<T>>>>,
}

/// Create a queue buffering at most `capacity` items.
pub fn bounded<T: Send>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    // A rendezvous queue still needs one slot to park the envelope while the
    // sender waits for the taken signal.
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        QueueSender {
            tx,
            rendezvous: capacity == 0,
        },
        QueueReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

impl<T: Send> QueueSender<T> {
    /// Send an item, waiting while the queue is full.
    pub async fn send(&self, item: T) -> Result<(), QueueClosed> {
        if !self.rendezvous {
            return self
                .tx
                .send(Envelope { item, taken: None })
                .await
                .map_err(|_| QueueClosed);
        }

        let (taken_tx, taken_rx) = oneshot::channel();
        self.tx
            .send(Envelope {
                item,
                taken: Some(taken_tx),
            })
            .await
            .map_err(|_| QueueClosed)?;

        // Receiver dropped the envelope unread.
        taken_rx.await.map_err(|_| QueueClosed)
    }

    /// Like [`send`](Self::send), but gives up when `cancel` fires.
    ///
    /// On a rendezvous queue a cancelled send is never delivered. If a
    /// receiver takes the item at the same instant the token fires, the item
    /// is delivered and `Cancelled` is still returned.
    pub async fn send_until(&self, item: T, cancel: &CancellationToken) -> Result<(), StageError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StageError::Cancelled),
            sent = self.send(item) => sent.map_err(|_| StageError::Disconnected),
        }
    }

    /// True once every receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<T: Send> QueueReceiver<T> {
    /// Take the next item. Returns `None` once the queue is closed and empty.
    pub async fn recv(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        loop {
            let envelope = rx.recv().await?;
            if let Some(taken) = envelope.taken {
                if taken.send(()).is_err() {
                    continue;
                }
            }
            return Some(envelope.item);
        }
    }

    /// Like [`recv`](Self::recv), but gives up when `cancel` fires.
    pub async fn recv_until(&self, cancel: &CancellationToken) -> Result<Option<T>, StageError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StageError::Cancelled),
            item = self.recv() => Ok(item),
        }
    }
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rendezvous: self.rendezvous,
        }
    }
}

impl<T> Clone for QueueReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<T> std::fmt::Debug for QueueSender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueSender")
            .field("rendezvous", &self.rendezvous)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<T> std::fmt::Debug for QueueReceiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueReceiver").finish_non_exhaustive()
    }
}
