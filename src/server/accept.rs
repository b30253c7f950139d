//! Module `accept`
//!
//! The TCP accept loop: one long-lived worker that turns inbound
//! connections into registered clients. Every connection goes through the
//! admission flow (capacity check, then the refusable new-client event)
//! before a receive worker is attached.

use log::{error, info, warn};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

use crate::error::ServerError;
use crate::events::Admission;
use crate::registry::{ClientInfo, ClientRecord};
use crate::server::core::Shared;
use crate::server::recv;
use crate::transport::{ConnHandle, POLL_INTERVAL, TcpConn};

/// Accepts until the stop flag is raised or the listener fails.
///
/// The listener is non-blocking and polled against the stop flag, which is
/// what bounds how long `stop` waits for this loop. Accept failures are not
/// retried: a failing listening socket usually means a permanent OS-level
/// condition, so the first fatal error moves the server to `Failed` and
/// ends the loop. Dropping the listener on exit closes it.
pub(crate) fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    while !shared.stopping() {
        match listener.accept() {
            Ok((stream, addr)) => admit(&shared, stream, addr),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                reap_finished(&shared);
                thread::sleep(POLL_INTERVAL);
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                error!("Fatal error accepting connection: {}", e);
                shared.fail(ServerError::Accept(e));
                break;
            }
        }
    }
}

/// Runs the admission flow for one accepted connection.
///
/// The record is registered before the new-client event fires, so a
/// snapshot taken from inside the handler already sees the client. On
/// refusal (capacity or handler decision) the connection is closed and no
/// disconnect event will ever fire for it.
fn admit(shared: &Arc<Shared>, stream: TcpStream, addr: SocketAddr) {
    // Accepted from a non-blocking listener; the workers expect blocking.
    if let Err(e) = stream.set_nonblocking(false) {
        warn!("Failed to set stream for {} to blocking mode: {}", addr, e);
        return;
    }

    let conn = Arc::new(TcpConn::new(stream));
    let (id, info, outcome) = {
        let mut registry = shared.registry.lock().unwrap();
        let id = registry.allocate_id();
        let info = ClientInfo {
            id,
            remote_addr: addr,
            connected_at: SystemTime::now(),
        };
        let record = ClientRecord::new(info.clone(), ConnHandle::Tcp(Arc::clone(&conn)));
        (id, info, registry.register(record))
    };

    match outcome {
        Ok(()) => {
            let mut admission = Admission::granted();
            shared.emit_client_connected(&info, &mut admission);
            if !admission.is_accepted() {
                info!("Client {} from {} refused by handler", id, addr);
                if let Ok(record) = shared.registry.lock().unwrap().remove(id) {
                    record.conn.shutdown();
                }
                return;
            }

            let (count, capacity) = {
                let registry = shared.registry.lock().unwrap();
                (registry.len(), registry.capacity())
            };
            info!(
                "Client {} connected from {} ({}/{} clients)",
                id, addr, count, capacity
            );

            if shared.config.auto_receive {
                if let Err(e) = recv::spawn_receiver(shared, id) {
                    error!("Failed to start receive worker for client {}: {}", id, e);
                }
            }
        }
        Err(e) => {
            // Accept-but-refuse: the handler is told about the rejection,
            // then the connection is closed. The registry never grew.
            warn!("Rejecting {}: {}", addr, e);
            let mut admission = Admission::denied_capacity();
            shared.emit_client_connected(&info, &mut admission);
            conn.shutdown();
        }
    }
}

/// Drops join handles of workers that already exited, so the worker table
/// does not grow for the lifetime of the run.
fn reap_finished(shared: &Shared) {
    let mut workers = shared.workers.lock().unwrap();
    workers.retain(|(_, handle)| !handle.is_finished());
}
