//! Topic-based multicast for realtime connections.
//!
//! A [`RoomHub`] maps room names to the set of connections subscribed to
//! them. Each attached connection owns a bounded outbound queue; emitting to a
//! room clones the event into the queue of every current member.
//!
//! # Backpressure
//!
//! Queues never block the emitter. If a member's queue is full the event is
//! dropped for that member only and a warning is logged, so one slow client
//! cannot stall delivery to the rest of the room.
//!
//! # Example
//!
//! ```rust
//! use gatehouse_server::rooms::RoomHub;
//! use uuid::Uuid;
//!
//! let hub: RoomHub<String> = RoomHub::new();
//! let alice = Uuid::new_v4();
//! let mut inbox = hub.attach(alice);
//!
//! hub.join(alice, "lobby");
//! assert_eq!(hub.emit("lobby", "hello".to_string()), 1);
//! assert_eq!(inbox.try_recv().unwrap(), "hello");
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Identifier of one realtime connection.
pub type ConnectionId = Uuid;

/// Default per-connection outbound queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

struct HubState<T> {
    rooms: HashMap<String, HashSet<ConnectionId>>,
    outboxes: HashMap<ConnectionId, Sender<T>>,
}

/// Shared room membership table and per-connection outboxes.
///
/// Cloning is cheap; all clones share the same state.
pub struct RoomHub<T> {
    state: Arc<RwLock<HubState<T>>>,
    queue_capacity: usize,
}

impl<T> Clone for RoomHub<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            queue_capacity: self.queue_capacity,
        }
    }
}

impl<T: Clone + Send + 'static> RoomHub<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Creates a hub whose connection queues hold `capacity` events.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn with_queue_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            state: Arc::new(RwLock::new(HubState {
                rooms: HashMap::new(),
                outboxes: HashMap::new(),
            })),
            queue_capacity: capacity,
        }
    }

    /// Registers a connection and returns the receiving end of its queue.
    ///
    /// Attaching an id that is already attached replaces its queue.
    pub fn attach(&self, connection: ConnectionId) -> Receiver<T> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.state.write().outboxes.insert(connection, tx);
        debug!(connection = %connection, "Connection attached to room hub");
        rx
    }

    /// Removes a connection from every room and drops its queue.
    pub fn detach(&self, connection: ConnectionId) {
        let mut state = self.state.write();
        state.outboxes.remove(&connection);
        state.rooms.retain(|_, members| {
            members.remove(&connection);
            !members.is_empty()
        });
        debug!(connection = %connection, "Connection detached from room hub");
    }

    /// Adds a connection to a room. Returns `false` if it was already a
    /// member or is not attached.
    pub fn join(&self, connection: ConnectionId, room: &str) -> bool {
        let mut state = self.state.write();
        if !state.outboxes.contains_key(&connection) {
            return false;
        }
        state
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection)
    }

    /// Removes a connection from a room. Returns `false` if it was not a
    /// member. Empty rooms are discarded.
    pub fn leave(&self, connection: ConnectionId, room: &str) -> bool {
        let mut state = self.state.write();
        let Some(members) = state.rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(&connection);
        if members.is_empty() {
            state.rooms.remove(room);
        }
        removed
    }

    /// Delivers an event to every current member of `room`.
    ///
    /// Returns the number of members whose queue accepted the event.
    pub fn emit(&self, room: &str, event: T) -> usize {
        let state = self.state.read();
        let Some(members) = state.rooms.get(room) else {
            trace!(room, "Emit to empty room");
            return 0;
        };

        let mut delivered = 0;
        for connection in members {
            let Some(outbox) = state.outboxes.get(connection) else {
                continue;
            };
            match outbox.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(connection = %connection, room, "Connection queue full, event dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    trace!(connection = %connection, room, "Connection queue closed");
                }
            }
        }

        trace!(room, delivered, "Room emit complete");
        delivered
    }

    /// Returns the current members of a room.
    #[must_use]
    pub fn members(&self, room: &str) -> Vec<ConnectionId> {
        self.state
            .read()
            .rooms
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_member(&self, connection: ConnectionId, room: &str) -> bool {
        self.state
            .read()
            .rooms
            .get(room)
            .is_some_and(|members| members.contains(&connection))
    }

    /// Number of attached connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.read().outboxes.len()
    }

    /// Number of non-empty rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.state.read().rooms.len()
    }
}

impl<T: Clone + Send + 'static> Default for RoomHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for RoomHub<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("RoomHub")
            .field("connections", &state.outboxes.len())
            .field("rooms", &state.rooms.len())
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_reaches_only_members() {
        let hub: RoomHub<u32> = RoomHub::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_a = hub.attach(a);
        let mut rx_b = hub.attach(b);

        hub.join(a, "room1");

        assert_eq!(hub.emit("room1", 7), 1);
        assert_eq!(rx_a.try_recv().unwrap(), 7);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn emit_to_unknown_room_is_noop() {
        let hub: RoomHub<u32> = RoomHub::new();
        assert_eq!(hub.emit("nowhere", 1), 0);
    }

    #[test]
    fn join_is_idempotent_and_requires_attach() {
        let hub: RoomHub<u32> = RoomHub::new();
        let a = Uuid::new_v4();

        assert!(!hub.join(a, "room1"));

        let _rx = hub.attach(a);
        assert!(hub.join(a, "room1"));
        assert!(!hub.join(a, "room1"));
        assert_eq!(hub.members("room1"), vec![a]);
    }

    #[test]
    fn leave_removes_membership_and_empty_rooms() {
        let hub: RoomHub<u32> = RoomHub::new();
        let a = Uuid::new_v4();
        let mut rx = hub.attach(a);
        hub.join(a, "room1");

        assert!(hub.leave(a, "room1"));
        assert!(!hub.leave(a, "room1"));
        assert_eq!(hub.room_count(), 0);

        assert_eq!(hub.emit("room1", 1), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn detach_clears_all_memberships() {
        let hub: RoomHub<u32> = RoomHub::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let _rx_a = hub.attach(a);
        let _rx_b = hub.attach(b);
        hub.join(a, "x");
        hub.join(a, "y");
        hub.join(b, "y");

        hub.detach(a);

        assert_eq!(hub.connection_count(), 1);
        assert!(!hub.is_member(a, "y"));
        assert!(hub.is_member(b, "y"));
        assert_eq!(hub.room_count(), 1);
    }

    #[test]
    fn full_queue_drops_for_that_member_only() {
        let hub: RoomHub<u32> = RoomHub::with_queue_capacity(1);
        let slow = Uuid::new_v4();
        let fast = Uuid::new_v4();
        let _rx_slow = hub.attach(slow);
        let mut rx_fast = hub.attach(fast);
        hub.join(slow, "r");
        hub.join(fast, "r");

        assert_eq!(hub.emit("r", 1), 2);
        rx_fast.try_recv().unwrap();

        // slow never drained, fast did
        assert_eq!(hub.emit("r", 2), 1);
        assert_eq!(rx_fast.try_recv().unwrap(), 2);
    }

    #[test]
    fn clones_share_state() {
        let hub: RoomHub<u32> = RoomHub::new();
        let clone = hub.clone();
        let a = Uuid::new_v4();
        let _rx = hub.attach(a);
        clone.join(a, "shared");
        assert!(hub.is_member(a, "shared"));
    }

    #[test]
    fn debug_reports_counts() {
        let hub: RoomHub<u32> = RoomHub::new();
        let _rx = hub.attach(Uuid::new_v4());
        let debug_str = format!("{hub:?}");
        assert!(debug_str.contains("connections: 1"));
    }
}
