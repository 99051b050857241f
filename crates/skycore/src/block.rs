//! The per-process registry of connections and known peers.
//!
//! Every Skywatch process owns exactly one `Block`: the arena of live
//! connections (stable small-integer ids, monotonically assigned), the
//! address book of known devices (independent of whether a live connection
//! exists, enabling lazy reconnect), and the pointer to the connection
//! currently holding priority. Broadcast and query helpers live here.
//!
//! The connection arena is only mutated from the owning reactor's
//! single-threaded sweep; handlers add and remove connections through these
//! registry methods, never by destroying objects mid-iteration.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use tracing::{debug, info};

use skyproto::value::value_line;
use skyproto::{DeviceType, ValueData};

use crate::connection::Connection;
use crate::error::CoreError;
use crate::ConnId;

/// Address-book entry for a known device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    pub port: u16,
    pub device_type: DeviceType,
}

#[derive(Debug, Default)]
pub struct Block {
    /// Live connections by id. BTreeMap keeps sweep order deterministic.
    connections: BTreeMap<u32, Connection>,
    next_id: u32,
    addresses: HashMap<String, Address>,
    priority_client: Option<ConnId>,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    // --- arena ------------------------------------------------------------

    /// Register a freshly accepted connection and assign its id.
    pub fn add_accepted(&mut self, now: Instant) -> ConnId {
        self.next_id += 1;
        let id = ConnId(self.next_id);
        self.connections.insert(id.0, Connection::accepted(id, now));
        debug!(conn = id.0, "connection added");
        id
    }

    /// Register an outbound connection attempt.
    pub fn add_connecting(&mut self, now: Instant) -> ConnId {
        self.next_id += 1;
        let id = ConnId(self.next_id);
        self.connections.insert(id.0, Connection::connecting(id, now));
        id
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(&id.0)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(&id.0)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnId> {
        self.connections.keys().map(|&k| ConnId(k)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    /// Find a live connection by registered device name.
    pub fn find_by_name(&self, name: &str) -> Option<&Connection> {
        self.connections.values().find(|c| c.name() == Some(name))
    }

    pub fn name_in_use(&self, name: &str) -> bool {
        self.find_by_name(name).is_some()
    }

    /// Graceful removal. Refuses while the connection is non-deletable
    /// (still holding priority) — the caller must reassign priority first.
    pub fn delete_connection(&mut self, id: ConnId) -> Result<Connection, CoreError> {
        let conn = self.connections.get(&id.0).ok_or(CoreError::NoSuchConnection(id))?;
        if !conn.deletable() {
            return Err(CoreError::NotDeletable(id));
        }
        let conn = self.connections.remove(&id.0).expect("checked above");
        if self.priority_client == Some(id) {
            self.priority_client = None;
        }
        if let Some(name) = conn.name() {
            self.addresses.remove(name);
        }
        info!(conn = id.0, peer = conn.label(), "connection removed");
        Ok(conn)
    }

    /// Clear dangling originator references to a destroyed connection on
    /// every remaining connection.
    pub fn clear_originator_refs(&mut self, gone: ConnId) {
        for conn in self.connections.values_mut() {
            conn.clear_originator(gone);
        }
    }

    /// Does any connection (optionally: one specific connection) still hold
    /// a queued or running command with this originator?
    pub fn originator_pending(&self, originator: ConnId, on: Option<ConnId>) -> bool {
        match on {
            Some(id) => self
                .get(id)
                .is_some_and(|c| c.originator_pending(originator)),
            None => self
                .connections
                .values()
                .any(|c| c.originator_pending(originator)),
        }
    }

    // --- broadcast / query ------------------------------------------------

    /// Send one line to every live connection.
    pub fn send_all(&mut self, line: &str, now: Instant) {
        for conn in self.connections.values_mut() {
            conn.send_line(line.to_string(), now);
        }
    }

    /// Broadcast a `value` update to every live connection.
    pub fn send_value_all(&mut self, name: &str, data: &ValueData, now: Instant) {
        let line = value_line(name, data);
        self.send_all(&line, now);
    }

    /// The connection with the numerically smallest view of a value —
    /// the queue balancer's "least loaded peer" selector. Connections that
    /// never declared the value do not participate.
    pub fn min_connection_by_value(&self, name: &str) -> Option<ConnId> {
        self.connections
            .values()
            .filter_map(|c| c.values().numeric(name).map(|v| (v, c.id())))
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, id)| id)
    }

    // --- address book -----------------------------------------------------

    pub fn add_address(&mut self, name: &str, address: Address) {
        self.addresses.insert(name.to_string(), address);
    }

    pub fn delete_address(&mut self, name: &str) {
        self.addresses.remove(name);
    }

    pub fn address(&self, name: &str) -> Option<&Address> {
        self.addresses.get(name)
    }

    pub fn addresses(&self) -> impl Iterator<Item = (&str, &Address)> {
        self.addresses.iter().map(|(k, v)| (k.as_str(), v))
    }

    // --- priority pointer -------------------------------------------------

    pub fn priority_client(&self) -> Option<ConnId> {
        self.priority_client
    }

    pub fn set_priority_client(&mut self, id: Option<ConnId>) {
        self.priority_client = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use skyproto::{TypeWord, ValueKind};

    use crate::command::Command;

    fn block_with_two() -> (Block, ConnId, ConnId) {
        let now = Instant::now();
        let mut block = Block::new();
        let a = block.add_accepted(now);
        let b = block.add_accepted(now);
        (block, a, b)
    }

    #[test]
    fn ids_are_stable_and_monotonic() {
        let (mut block, a, b) = block_with_two();
        assert_eq!((a.0, b.0), (1, 2));
        block.delete_connection(a).unwrap();
        let c = block.add_accepted(Instant::now());
        // Freed ids are never reused.
        assert_eq!(c.0, 3);
    }

    #[test]
    fn find_by_name_sees_only_identified_peers() {
        let (mut block, a, _) = block_with_two();
        assert!(block.find_by_name("CAM").is_none());
        block
            .get_mut(a)
            .unwrap()
            .identify_device("CAM", DeviceType::Camera, "localhost", 5554);
        assert_eq!(block.find_by_name("CAM").unwrap().id(), a);
        assert!(block.name_in_use("CAM"));
    }

    #[test]
    fn priority_holder_is_not_deletable() {
        let (mut block, a, _) = block_with_two();
        block.get_mut(a).unwrap().set_have_priority(true);
        block.set_priority_client(Some(a));

        assert!(matches!(
            block.delete_connection(a),
            Err(CoreError::NotDeletable(_))
        ));

        // After priority is reassigned, removal goes through.
        block.get_mut(a).unwrap().set_have_priority(false);
        block.set_priority_client(None);
        assert!(block.delete_connection(a).is_ok());
    }

    #[test]
    fn address_book_independent_of_connections() {
        let (mut block, _, _) = block_with_two();
        block.add_address(
            "W0",
            Address { host: "obs1".into(), port: 5560, device_type: DeviceType::Dome },
        );
        // Known address, no live connection.
        assert!(block.address("W0").is_some());
        assert!(block.find_by_name("W0").is_none());
        block.delete_address("W0");
        assert!(block.address("W0").is_none());
    }

    #[test]
    fn send_all_reaches_every_connection() {
        let (mut block, a, b) = block_with_two();
        block.send_all("S 3", Instant::now());
        for id in [a, b] {
            assert_eq!(block.get(id).unwrap().staged_lines(), vec!["S 3"]);
        }
    }

    #[test]
    fn min_connection_by_value_picks_least_loaded() {
        let (mut block, a, b) = block_with_two();
        for (id, load) in [(a, 5), (b, 2)] {
            let conn = block.get_mut(id).unwrap();
            conn.values_mut()
                .declare(TypeWord::new(ValueKind::Integer), "que_size", "pending work")
                .unwrap();
            conn.values_mut()
                .set("que_size", ValueData::Integer(load))
                .unwrap();
        }
        assert_eq!(block.min_connection_by_value("que_size"), Some(b));
        // A peer without the value is simply ignored.
        assert_eq!(block.min_connection_by_value("nonexistent"), None);
    }

    #[test]
    fn originator_pending_scans_all_or_one() {
        let (mut block, a, b) = block_with_two();
        let client = ConnId(99);
        block
            .get_mut(a)
            .unwrap()
            .queue_command(Command::new("status_info").with_originator(client));

        assert!(block.originator_pending(client, None));
        assert!(block.originator_pending(client, Some(a)));
        assert!(!block.originator_pending(client, Some(b)));

        block.clear_originator_refs(client);
        assert!(!block.originator_pending(client, None));
    }
}
