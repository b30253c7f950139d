//! Module `recv`
//!
//! Receive workers. TCP gets one blocking worker per client that reassembles
//! frames across reads; UDP gets a single worker on the shared socket where
//! each datagram is one message and peers are registered on first contact.
//! Either way, a worker failure is local to its client and never touches
//! sibling clients or the accept loop.

use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

use crate::error::{FrameError, ServerError};
use crate::events::Admission;
use crate::message::{FrameDecoder, HEADER_LEN, MAX_EXTENSION, Message};
use crate::registry::{ClientId, ClientInfo, ClientRecord};
use crate::server::core::Shared;
use crate::transport::{ConnHandle, TcpConn};

/// Read chunk for TCP workers. Frames larger than this simply take several
/// reads to assemble.
const RECV_CHUNK: usize = 2048;

/// Attaches a receive worker to a registered TCP client.
///
/// Used by the accept loop when `auto_receive` is on, and by
/// `Server::start_receiver` otherwise. When the thread cannot be spawned
/// the client is unreadable for good, so it is removed and its disconnect
/// event fires here.
pub(crate) fn spawn_receiver(shared: &Arc<Shared>, id: ClientId) -> Result<(), ServerError> {
    let conn = {
        let mut registry = shared.registry.lock().unwrap();
        let record = registry
            .attach_receiver(id)
            .map_err(|_| ServerError::InvalidClient(id))?;
        match &record.conn {
            ConnHandle::Tcp(conn) => Arc::clone(conn),
            // UDP clients are read by the shared socket worker from birth.
            ConnHandle::Udp { .. } => return Err(ServerError::InvalidClient(id)),
        }
    };

    let worker_shared = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(format!("sockline-recv-{}", id))
        .spawn(move || tcp_worker(worker_shared, id, conn));

    match spawned {
        Ok(handle) => {
            shared.workers.lock().unwrap().push((id, handle));
            Ok(())
        }
        Err(e) => {
            if let Ok(record) = shared.registry.lock().unwrap().remove(id) {
                record.conn.shutdown();
                shared.emit_client_disconnected(&record.info);
            }
            Err(ServerError::Thread(e))
        }
    }
}

/// Per-client blocking read loop.
///
/// Exits on orderly close, on a read error (including the shutdown issued
/// by `stop` or `disconnect`), or on a malformed frame, which leaves the
/// stream unsynchronized and is therefore terminal for the client.
fn tcp_worker(shared: Arc<Shared>, id: ClientId, conn: Arc<TcpConn>) {
    let mut decoder = FrameDecoder::new(shared.config.max_payload);
    let mut buf = vec![0u8; RECV_CHUNK];

    loop {
        match conn.read_chunk(&mut buf) {
            Ok(0) => {
                info!("Client {} closed the connection", id);
                break;
            }
            Ok(n) => {
                decoder.extend(&buf[..n]);
                if let Err(e) = drain_messages(&shared, id, &mut decoder) {
                    warn!("Client {} sent an invalid frame: {}", id, e);
                    break;
                }
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                info!("Read from client {} ended: {}", id, e);
                break;
            }
        }
    }

    finish(&shared, id);
}

/// Dispatches every complete message sitting in the decoder.
fn drain_messages(
    shared: &Shared,
    id: ClientId,
    decoder: &mut FrameDecoder,
) -> Result<(), FrameError> {
    while let Some(mut msg) = decoder.next_message()? {
        // The connection, not the wire header, is the authoritative origin.
        msg.source = id.raw();
        debug!("Message from client {}: {} bytes", id, msg.size());
        shared.emit_message(&msg);
    }
    Ok(())
}

/// Disconnect path shared by every exit reason. Removal from the registry
/// is the linearization point: the remover closes the handle and fires the
/// disconnect event, so both happen exactly once per client.
fn finish(shared: &Shared, id: ClientId) {
    let removed = shared.registry.lock().unwrap().remove(id);
    if let Ok(record) = removed {
        record.conn.shutdown();
        shared.emit_client_disconnected(&record.info);
        info!("Client {} disconnected", id);
    }
}

/// The UDP receive worker: one thread for the whole server.
///
/// Peers are registered through the admission flow on their first datagram;
/// refused peers are remembered and ignored afterwards. A malformed
/// datagram is dropped without disconnecting its peer, unlike TCP, because
/// the next datagram starts a fresh frame. On exit the worker emits the
/// disconnect event for every registered peer, since it owns all of their
/// lifecycles.
pub(crate) fn udp_worker(shared: Arc<Shared>, socket: Arc<UdpSocket>) {
    let max_payload = shared.config.max_payload;
    let mut buf = vec![0u8; HEADER_LEN + MAX_EXTENSION + max_payload];
    let mut refused: HashSet<SocketAddr> = HashSet::new();

    while !shared.stopping() {
        let (n, peer) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            // Read timeout tick; WouldBlock on Unix, TimedOut on Windows.
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(ref e) if e.kind() == ErrorKind::TimedOut => continue,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Receive on the shared UDP socket failed: {}", e);
                shared.fail(ServerError::Receive(e));
                break;
            }
        };

        if refused.contains(&peer) {
            continue;
        }

        let id = match lookup_or_admit(&shared, &socket, peer, &mut refused) {
            Some(id) => id,
            None => continue,
        };

        match Message::decode(&buf[..n], max_payload) {
            Ok(mut msg) => {
                msg.source = id.raw();
                debug!("Datagram from client {}: {} bytes", id, msg.size());
                shared.emit_message(&msg);
            }
            Err(e) => {
                warn!("Client {} sent an invalid datagram: {}", id, e);
            }
        }
    }

    let records = shared.registry.lock().unwrap().drain();
    for record in records {
        shared.emit_client_disconnected(&record.info);
        info!("Client {} disconnected", record.info.id);
    }
}

/// Finds the peer's id, or runs the admission flow for a first contact.
/// Returns `None` when the peer was refused; its datagram is not delivered.
fn lookup_or_admit(
    shared: &Shared,
    socket: &Arc<UdpSocket>,
    peer: SocketAddr,
    refused: &mut HashSet<SocketAddr>,
) -> Option<ClientId> {
    {
        let registry = shared.registry.lock().unwrap();
        if let Some(id) = registry.find_by_addr(&peer) {
            return Some(id);
        }
    }

    let (id, info, outcome) = {
        let mut registry = shared.registry.lock().unwrap();
        let id = registry.allocate_id();
        let info = ClientInfo {
            id,
            remote_addr: peer,
            connected_at: SystemTime::now(),
        };
        let mut record = ClientRecord::new(
            info.clone(),
            ConnHandle::Udp {
                socket: Arc::clone(socket),
                peer,
            },
        );
        // This worker is the receiver for every UDP client.
        record.receiver = true;
        (id, info, registry.register(record))
    };

    match outcome {
        Ok(()) => {
            let mut admission = Admission::granted();
            shared.emit_client_connected(&info, &mut admission);
            if admission.is_accepted() {
                info!("Client {} registered from {} (udp)", id, peer);
                Some(id)
            } else {
                info!("Client {} from {} refused by handler", id, peer);
                let _ = shared.registry.lock().unwrap().remove(id);
                refused.insert(peer);
                None
            }
        }
        Err(e) => {
            warn!("Rejecting {}: {}", peer, e);
            let mut admission = Admission::denied_capacity();
            shared.emit_client_connected(&info, &mut admission);
            refused.insert(peer);
            None
        }
    }
}
