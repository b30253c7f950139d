//! Client registry
//!
//! Tracks the connected clients of a running server; the single source of
//! truth for "who is connected". Ids come from a monotonic counter seeded
//! with a fixed base offset, so the first client of a run gets 313, and ids
//! are never reused within a run even after disconnects.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::time::SystemTime;

use crate::error::RegistryError;
use crate::transport::ConnHandle;

/// Offset applied to the id counter; the first assigned id is `BASE + 1`.
pub const CLIENT_ID_BASE: u64 = 312;

/// Identifier of one registered client, unique within a server run.
///
/// Ids are only ever minted by a server; applications receive them through
/// events and snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u64);

impl ClientId {
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Public view of one registered client.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: ClientId,
    pub remote_addr: SocketAddr,
    pub connected_at: SystemTime,
}

/// Registry entry: the public info plus the connection handle used to write
/// to the client and to shut it down.
pub(crate) struct ClientRecord {
    pub(crate) info: ClientInfo,
    pub(crate) conn: ConnHandle,
    /// Whether a receive worker has been attached for this client.
    pub(crate) receiver: bool,
}

impl ClientRecord {
    pub(crate) fn new(info: ClientInfo, conn: ConnHandle) -> Self {
        Self {
            info,
            conn,
            receiver: false,
        }
    }
}

/// Bounded table of connected clients, keyed by id.
///
/// The registry itself is not synchronized; the server wraps it in a mutex
/// and keeps register/remove atomic with the observations that depend on
/// them. Removal hands the record back to the caller, which owns closing
/// the handle, so an entry present in the table always has an open handle.
pub(crate) struct ClientRegistry {
    capacity: usize,
    next_id: u64,
    clients: BTreeMap<ClientId, ClientRecord>,
    by_addr: HashMap<SocketAddr, ClientId>,
}

impl ClientRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_id: CLIENT_ID_BASE + 1,
            clients: BTreeMap::new(),
            by_addr: HashMap::new(),
        }
    }

    /// Hands out the next id. Every accepted connection consumes one, even
    /// when registration is refused afterwards, so ids may have gaps but
    /// are strictly increasing.
    pub(crate) fn allocate_id(&mut self) -> ClientId {
        let id = ClientId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn register(&mut self, record: ClientRecord) -> Result<(), RegistryError> {
        if self.clients.len() >= self.capacity {
            return Err(RegistryError::CapacityExceeded(self.capacity));
        }
        self.by_addr.insert(record.info.remote_addr, record.info.id);
        self.clients.insert(record.info.id, record);
        Ok(())
    }

    pub(crate) fn remove(&mut self, id: ClientId) -> Result<ClientRecord, RegistryError> {
        match self.clients.remove(&id) {
            Some(record) => {
                self.by_addr.remove(&record.info.remote_addr);
                Ok(record)
            }
            None => Err(RegistryError::NotFound(id)),
        }
    }

    pub(crate) fn lookup(&self, id: ClientId) -> Result<&ClientRecord, RegistryError> {
        self.clients.get(&id).ok_or(RegistryError::NotFound(id))
    }

    pub(crate) fn find_by_addr(&self, addr: &SocketAddr) -> Option<ClientId> {
        self.by_addr.get(addr).copied()
    }

    /// Marks a receive worker as attached for the client.
    pub(crate) fn attach_receiver(&mut self, id: ClientId) -> Result<&ClientRecord, RegistryError> {
        let record = self
            .clients
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))?;
        if record.receiver {
            return Err(RegistryError::ReceiverAttached(id));
        }
        record.receiver = true;
        Ok(&*record)
    }

    /// Point-in-time copy of every client, ordered by id. Never a live
    /// alias: callers can hold it while the registry keeps changing.
    pub(crate) fn snapshot(&self) -> Vec<ClientInfo> {
        self.clients.values().map(|r| r.info.clone()).collect()
    }

    /// Copies of every connection handle, for shutdown fan-out.
    pub(crate) fn handles(&self) -> Vec<ConnHandle> {
        self.clients.values().map(|r| r.conn.clone()).collect()
    }

    /// Empties the table, handing every record to the caller in id order.
    pub(crate) fn drain(&mut self) -> Vec<ClientRecord> {
        self.by_addr.clear();
        std::mem::take(&mut self.clients).into_values().collect()
    }

    /// Fresh state for a new server run: empty table, id counter back at
    /// the base offset.
    pub(crate) fn reset(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.next_id = CLIENT_ID_BASE + 1;
        self.clients.clear();
        self.by_addr.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.clients.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::sync::Arc;

    fn test_record(registry: &mut ClientRegistry, port: u16) -> ClientRecord {
        let id = registry.allocate_id();
        let peer: SocketAddr = ([127, 0, 0, 1], port).into();
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        ClientRecord::new(
            ClientInfo {
                id,
                remote_addr: peer,
                connected_at: SystemTime::now(),
            },
            ConnHandle::Udp { socket, peer },
        )
    }

    #[test]
    fn test_ids_start_after_base_and_increase() {
        let mut registry = ClientRegistry::new(8);
        let first = registry.allocate_id();
        let second = registry.allocate_id();
        assert_eq!(first.raw(), CLIENT_ID_BASE + 1);
        assert_eq!(second.raw(), CLIENT_ID_BASE + 2);
        assert!(second > first);
    }

    #[test]
    fn test_register_and_snapshot_ordered() {
        let mut registry = ClientRegistry::new(8);
        for port in [9001, 9002, 9003] {
            let record = test_record(&mut registry, port);
            registry.register(record).unwrap();
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 3);
        let ids: Vec<u64> = snapshot.iter().map(|c| c.id.raw()).collect();
        assert_eq!(ids, vec![313, 314, 315]);
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut registry = ClientRegistry::new(2);
        for port in [9001, 9002] {
            let record = test_record(&mut registry, port);
            registry.register(record).unwrap();
        }

        let third = test_record(&mut registry, 9003);
        match registry.register(third) {
            Err(RegistryError::CapacityExceeded(2)) => {}
            other => panic!("expected CapacityExceeded, got {:?}", other.map(|_| ())),
        }
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_ids_not_reused_after_remove() {
        let mut registry = ClientRegistry::new(4);
        let record = test_record(&mut registry, 9001);
        let first_id = record.info.id;
        registry.register(record).unwrap();
        registry.remove(first_id).unwrap();

        let next = registry.allocate_id();
        assert!(next > first_id);
    }

    #[test]
    fn test_remove_unknown_id() {
        let mut registry = ClientRegistry::new(4);
        let ghost = ClientId::from_raw(999);
        assert!(matches!(
            registry.remove(ghost),
            Err(RegistryError::NotFound(id)) if id == ghost
        ));
    }

    #[test]
    fn test_find_by_addr() {
        let mut registry = ClientRegistry::new(4);
        let record = test_record(&mut registry, 9007);
        let id = record.info.id;
        let addr = record.info.remote_addr;
        registry.register(record).unwrap();

        assert_eq!(registry.find_by_addr(&addr), Some(id));
        registry.remove(id).unwrap();
        assert_eq!(registry.find_by_addr(&addr), None);
    }

    #[test]
    fn test_attach_receiver_once() {
        let mut registry = ClientRegistry::new(4);
        let record = test_record(&mut registry, 9001);
        let id = record.info.id;
        registry.register(record).unwrap();

        assert!(registry.attach_receiver(id).is_ok());
        assert!(matches!(
            registry.attach_receiver(id),
            Err(RegistryError::ReceiverAttached(attached)) if attached == id
        ));
    }

    #[test]
    fn test_reset_rewinds_id_counter() {
        let mut registry = ClientRegistry::new(4);
        let record = test_record(&mut registry, 9001);
        registry.register(record).unwrap();
        registry.allocate_id();

        registry.reset(2);
        assert!(registry.is_empty());
        assert_eq!(registry.capacity(), 2);
        assert_eq!(registry.allocate_id().raw(), CLIENT_ID_BASE + 1);
    }

    #[test]
    fn test_drain_returns_all_records() {
        let mut registry = ClientRegistry::new(4);
        for port in [9001, 9002] {
            let record = test_record(&mut registry, port);
            registry.register(record).unwrap();
        }

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }
}
