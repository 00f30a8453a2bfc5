//! Bounded fan-out of mutation events.
//!
//! Built on `tokio::sync::broadcast`: publishers never block, and a
//! subscriber that falls more than the buffer behind loses the oldest
//! events rather than stalling the partition actor. That no
//! head-of-line-blocking guarantee is the contract; loss on slow
//! consumers is the documented cost.

use tokio::sync::broadcast;

/// Buffer length for mutation subscribers.
pub const MUTATION_BROADCAST_BUFFER: usize = 100;

/// A cloneable fan-out handle.
pub struct Broadcaster<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    /// Creates a broadcaster with the given per-subscriber buffer.
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Broadcaster { tx }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn submit(&self, event: T) {
        let _ = self.tx.send(event);
    }

    /// Registers a new subscriber; it sees events submitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Broadcaster { tx: self.tx.clone() }
    }
}
