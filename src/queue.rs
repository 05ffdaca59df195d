//! Bounded outbound command queue.
//!
//! The queue is the one piece of channel state that outlives a session: it
//! is drained by the dispatcher of whichever connection generation is
//! active, and commands enqueued while disconnected simply wait for the
//! next one. Producers block when the queue is full (backpressure, never
//! drop, never error).

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

use crate::protocol::Command;

/// Maximum number of queued commands before `enqueue` blocks.
pub const CAPACITY: usize = 20;

/// Bounded FIFO of outbound commands, safe for concurrent producers and a
/// single consumer at a time.
///
/// Clones share the same queue. The consumer half is guarded so that
/// exactly one [`QueueConsumer`] exists at any instant; a superseded
/// dispatcher's remaining items persist for the next one.
#[derive(Clone)]
pub struct CommandQueue {
    tx: mpsc::Sender<Command>,
    rx: Arc<Mutex<mpsc::Receiver<Command>>>,
}

impl CommandQueue {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(CAPACITY);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Appends a command at the tail, awaiting a free slot when the queue
    /// is at capacity.
    ///
    /// Delivery failures are invisible to the caller; a command is retried
    /// across reconnects until some dispatcher picks it up.
    pub async fn enqueue(&self, command: Command) {
        // The receiver half lives inside this queue, so the channel cannot
        // close while a handle exists.
        if self.tx.send(command).await.is_err() {
            error!("command queue closed");
        }
    }

    /// Takes the exclusive consumer half, awaiting release by any previous
    /// holder.
    pub async fn consumer(&self) -> QueueConsumer {
        QueueConsumer {
            rx: Arc::clone(&self.rx).lock_owned().await,
        }
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive drain handle over the queue.
///
/// Dropping the handle releases the queue to the next consumer without
/// discarding undelivered commands.
pub struct QueueConsumer {
    rx: OwnedMutexGuard<mpsc::Receiver<Command>>,
}

impl QueueConsumer {
    /// Removes and returns the head of the queue, awaiting one if empty.
    pub async fn next(&mut self) -> Option<Command> {
        self.rx.recv().await
    }
}
