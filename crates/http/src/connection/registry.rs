//! Generation-checked slot table owning every live [`Connection`].
//!
//! The table replaces per-connection reference counting for deferred
//! destruction: closing a connection removes its slot and bumps the slot's
//! generation, so any reactor completion or queue command still in flight
//! — which always addresses the connection by `(slot, generation)` — comes
//! back empty instead of touching freed or recycled state. The driver only
//! removes a slot once every pump task for the socket has wound down, so
//! nothing is freed while a completion for it is still pending.
//!
//! Lives on, and is mutated by, the background I/O thread only.

use tracing::trace;

use crate::connection::Connection;
use crate::protocol::ConnectionId;

#[derive(Debug)]
struct Slot {
    generation: u32,
    conn: Option<Connection>,
}

/// Slab of connections keyed by [`ConnectionId`].
#[derive(Debug, Default)]
pub struct ConnectionTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocates a slot and builds the connection with its identity.
    pub fn insert(&mut self, build: impl FnOnce(ConnectionId) -> Connection) -> ConnectionId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                let id = ConnectionId::new(index, slot.generation);
                slot.conn = Some(build(id));
                id
            }
            None => {
                let index = self.slots.len() as u32;
                let id = ConnectionId::new(index, 0);
                self.slots.push(Slot { generation: 0, conn: Some(build(id)) });
                id
            }
        }
    }

    /// Looks a connection up, failing on a stale generation. This is the
    /// tombstone check every late callback goes through.
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        let slot = self.slots.get_mut(id.slot() as usize)?;
        if slot.generation != id.generation() {
            trace!(conn = %id, "lookup with stale generation");
            return None;
        }
        slot.conn.as_mut()
    }

    /// Frees a slot, bumping its generation so outstanding references to
    /// the old occupant stop resolving.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let slot = self.slots.get_mut(id.slot() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        let conn = slot.conn.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.slot());
        Some(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_one() -> (ConnectionTable, ConnectionId) {
        let mut table = ConnectionTable::new();
        let id = table.insert(|id| Connection::new(id, None));
        (table, id)
    }

    #[test]
    fn insert_and_lookup() {
        let (mut table, id) = table_with_one();
        assert_eq!(table.len(), 1);
        assert!(table.get_mut(id).is_some());
    }

    #[test]
    fn removed_id_stops_resolving() {
        let (mut table, id) = table_with_one();
        assert!(table.remove(id).is_some());
        assert!(table.get_mut(id).is_none());
        assert!(table.remove(id).is_none(), "double remove is inert");
        assert!(table.is_empty());
    }

    #[test]
    fn reused_slot_gets_a_fresh_generation() {
        let (mut table, stale) = table_with_one();
        table.remove(stale);

        let fresh = table.insert(|id| Connection::new(id, None));
        // same slot, different identity
        assert_ne!(stale, fresh);
        assert!(table.get_mut(stale).is_none(), "stale id must not reach the new occupant");
        assert!(table.get_mut(fresh).is_some());
    }

    #[test]
    fn ids_are_stable_across_unrelated_removals() {
        let mut table = ConnectionTable::new();
        let first = table.insert(|id| Connection::new(id, None));
        let second = table.insert(|id| Connection::new(id, None));

        table.remove(first);
        assert!(table.get_mut(second).is_some());
    }
}
