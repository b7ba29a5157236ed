//! Match Queue
//!
//! Strict FIFO pairing: whenever two connections are waiting, the two
//! oldest are paired. Waiting time is never traded for anything else.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::network::gateway::{ConnectionHandle, ConnectionId};

/// A waiting connection.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Connection to pair.
    pub connection: ConnectionHandle,
    /// Name given when queueing.
    pub display_name: Option<String>,
    /// When the entry was queued.
    pub queued_at: Instant,
}

impl QueueEntry {
    /// Entry queued now.
    pub fn new(connection: ConnectionHandle, display_name: Option<String>) -> Self {
        Self { connection, display_name, queued_at: Instant::now() }
    }

    /// Time spent waiting.
    pub fn waited(&self) -> Duration {
        self.queued_at.elapsed()
    }
}

/// Result of [`MatchQueue::enqueue`].
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// Waiting for an opponent.
    Waiting {
        /// Entries waiting, including this one.
        waiting: usize,
    },
    /// Connection was already waiting; nothing changed.
    AlreadyQueued {
        /// Entries waiting.
        waiting: usize,
    },
    /// The two oldest entries were paired, oldest first.
    Paired(QueueEntry, QueueEntry),
}

/// Queue errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// A pairing would put one connection on both sides.
    #[error("pairing invariant violated: connection {0} paired with itself")]
    PairingInvariant(ConnectionId),
}

/// Matchmaking queue.
#[derive(Debug, Default)]
pub struct MatchQueue {
    entries: VecDeque<QueueEntry>,
}

impl MatchQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries waiting.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No entries waiting.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a connection is waiting.
    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.entries.iter().any(|e| e.connection.id() == connection_id)
    }

    /// Add an entry and pair the two oldest if possible.
    ///
    /// Entries whose connection has closed are dropped before pairing.
    pub fn enqueue(&mut self, entry: QueueEntry) -> Result<EnqueueOutcome, QueueError> {
        if self.contains(entry.connection.id()) {
            return Ok(EnqueueOutcome::AlreadyQueued { waiting: self.entries.len() });
        }
        self.entries.push_back(entry);
        self.remove_closed();

        if self.entries.len() < 2 {
            return Ok(EnqueueOutcome::Waiting { waiting: self.entries.len() });
        }

        let (first, second) = match (self.entries.pop_front(), self.entries.pop_front()) {
            (Some(first), Some(second)) => (first, second),
            (Some(first), None) => {
                self.entries.push_front(first);
                return Ok(EnqueueOutcome::Waiting { waiting: 1 });
            }
            _ => return Ok(EnqueueOutcome::Waiting { waiting: 0 }),
        };

        if first.connection.id() == second.connection.id() {
            let id = first.connection.id();
            warn!("Queue held connection {} twice; dropping duplicate", id);
            self.entries.push_front(first);
            return Err(QueueError::PairingInvariant(id));
        }

        debug!(
            "Paired connections {} and {} (waited {:?})",
            first.connection.id(),
            second.connection.id(),
            first.waited()
        );
        Ok(EnqueueOutcome::Paired(first, second))
    }

    /// Put an entry back at the head of the queue.
    ///
    /// Used when a session could not be created for a fresh pair; callers
    /// requeue the younger entry first to keep FIFO order.
    pub fn requeue_front(&mut self, entry: QueueEntry) {
        if !self.contains(entry.connection.id()) {
            self.entries.push_front(entry);
        }
    }

    /// Remove a connection. No-op if it is not waiting.
    pub fn dequeue(&mut self, connection_id: ConnectionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.connection.id() != connection_id);
        before != self.entries.len()
    }

    /// Drop entries whose connection has gone away.
    pub fn remove_closed(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !e.connection.is_closed());
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use crate::network::protocol::ServerMessage;

    fn entry(id: ConnectionId) -> (QueueEntry, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(8);
        (QueueEntry::new(ConnectionHandle::new(id, tx), None), rx)
    }

    fn ids(outcome: EnqueueOutcome) -> (ConnectionId, ConnectionId) {
        match outcome {
            EnqueueOutcome::Paired(a, b) => (a.connection.id(), b.connection.id()),
            other => panic!("expected pair, got {:?}", other),
        }
    }

    #[test]
    fn test_fifo_pairing() {
        let mut queue = MatchQueue::new();
        let (a, _ra) = entry(1);
        let (b, _rb) = entry(2);
        let (c, _rc) = entry(3);
        let (d, _rd) = entry(4);

        assert!(matches!(queue.enqueue(a).unwrap(), EnqueueOutcome::Waiting { waiting: 1 }));
        assert_eq!(ids(queue.enqueue(b).unwrap()), (1, 2));
        assert!(queue.is_empty());

        queue.enqueue(c).unwrap();
        assert_eq!(ids(queue.enqueue(d).unwrap()), (3, 4));
    }

    #[test]
    fn test_double_enqueue_is_noop() {
        let mut queue = MatchQueue::new();
        let (a, _ra) = entry(1);
        queue.enqueue(a.clone()).unwrap();
        assert!(matches!(queue.enqueue(a).unwrap(), EnqueueOutcome::AlreadyQueued { waiting: 1 }));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_dequeue() {
        let mut queue = MatchQueue::new();
        let (a, _ra) = entry(1);
        let (b, _rb) = entry(2);
        queue.enqueue(a).unwrap();

        assert!(!queue.dequeue(9));
        assert!(queue.dequeue(1));
        assert!(!queue.dequeue(1));

        // Queue is empty again; b waits
        assert!(matches!(queue.enqueue(b).unwrap(), EnqueueOutcome::Waiting { waiting: 1 }));
    }

    #[test]
    fn test_closed_connections_skipped() {
        let mut queue = MatchQueue::new();
        let (a, ra) = entry(1);
        let (b, _rb) = entry(2);
        let (c, _rc) = entry(3);
        queue.enqueue(a).unwrap();
        drop(ra);

        assert!(matches!(queue.enqueue(b).unwrap(), EnqueueOutcome::Waiting { waiting: 1 }));
        assert_eq!(ids(queue.enqueue(c).unwrap()), (2, 3));
    }

    #[test]
    fn test_requeue_front_keeps_order() {
        let mut queue = MatchQueue::new();
        let (a, _ra) = entry(1);
        let (b, _rb) = entry(2);
        let (c, _rc) = entry(3);
        queue.enqueue(a).unwrap();
        let (first, second) = match queue.enqueue(b).unwrap() {
            EnqueueOutcome::Paired(first, second) => (first, second),
            other => panic!("expected pair, got {:?}", other),
        };
        queue.requeue_front(second);
        queue.requeue_front(first);
        assert_eq!(queue.len(), 2);
        queue.dequeue(2);
        assert_eq!(ids(queue.enqueue(c).unwrap()), (1, 3));
    }
}
