//! Module `core`
//!
//! The `Server` type: owns the client registry, the handler table and the
//! lifecycle status for one endpoint, and drives the accept loop and the
//! receive workers. Nothing is process-global, so several independent
//! servers can run side by side.

use log::{debug, info, warn};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use crate::config::{ServerConfig, Transport};
use crate::error::ServerError;
use crate::events::{Admission, ServerHandlers};
use crate::message::Message;
use crate::registry::{ClientId, ClientInfo, ClientRegistry};
use crate::server::{accept, recv};
use crate::transport::{self, ConnHandle, POLL_INTERVAL};

/// Lifecycle states of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// Initial state, and the state after a clean `stop`.
    Stopped,
    /// Bound and accepting; clients are being served.
    Running,
    /// A systemic failure (socket, bind, listen, accept) ended the run.
    /// A fresh `start` call is required to leave this state.
    Failed,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Stopped => write!(f, "stopped"),
            ServerStatus::Running => write!(f, "running"),
            ServerStatus::Failed => write!(f, "failed"),
        }
    }
}

/// State shared between the server handle, the accept loop and every
/// receive worker.
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) registry: Mutex<ClientRegistry>,
    pub(crate) workers: Mutex<Vec<(ClientId, JoinHandle<()>)>>,
    handlers: RwLock<ServerHandlers>,
    status: Mutex<ServerStatus>,
    status_cv: Condvar,
    stop: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    last_error: Mutex<Option<ServerError>>,
}

impl Shared {
    pub(crate) fn status(&self) -> ServerStatus {
        *self.status.lock().unwrap()
    }

    /// True once `stop` (or drop) has asked the workers to wind down.
    pub(crate) fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Escalates a systemic worker failure: records the error, moves a
    /// running server to `Failed` and fires status-changed. A server that
    /// already left `Running` (e.g. a concurrent `stop`) is left alone.
    pub(crate) fn fail(&self, err: ServerError) {
        *self.last_error.lock().unwrap() = Some(err);
        {
            let mut status = self.status.lock().unwrap();
            if *status != ServerStatus::Running {
                return;
            }
            *status = ServerStatus::Failed;
            self.status_cv.notify_all();
        }
        self.emit_status_changed(ServerStatus::Failed);
    }

    /// Snapshot of the handler table. Dispatch goes through the copy so no
    /// lock is held while a handler runs; handlers may re-enter the server.
    fn handler_table(&self) -> ServerHandlers {
        self.handlers.read().unwrap().clone()
    }

    pub(crate) fn emit_status_changed(&self, status: ServerStatus) {
        self.handler_table().fire_status_changed(status);
    }

    pub(crate) fn emit_message(&self, msg: &Message) {
        self.handler_table().fire_message(msg);
    }

    pub(crate) fn emit_message_sent(&self, msg: &Message) {
        self.handler_table().fire_message_sent(msg);
    }

    pub(crate) fn emit_client_connected(&self, info: &ClientInfo, admission: &mut Admission) {
        self.handler_table().fire_client_connected(info, admission);
    }

    pub(crate) fn emit_client_disconnected(&self, info: &ClientInfo) {
        self.handler_table().fire_client_disconnected(info);
    }
}

/// One server endpoint.
///
/// Construct it, register handlers, then `start`. All methods take `&self`
/// and are safe to call from any thread; start/stop transitions are
/// serialized internally.
pub struct Server {
    shared: Arc<Shared>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
    lifecycle: Mutex<()>,
}

impl Server {
    /// Creates a server with the given configuration. Nothing is bound or
    /// spawned until `start`.
    pub fn new(config: ServerConfig) -> Self {
        let capacity = config.max_clients;
        Self {
            shared: Arc::new(Shared {
                config,
                registry: Mutex::new(ClientRegistry::new(capacity)),
                workers: Mutex::new(Vec::new()),
                handlers: RwLock::new(ServerHandlers::default()),
                status: Mutex::new(ServerStatus::Stopped),
                status_cv: Condvar::new(),
                stop: AtomicBool::new(false),
                local_addr: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
            accept_handle: Mutex::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Registers the new-message handler. Replaces any previous handler.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.shared.handlers.write().unwrap().message = Some(Arc::new(handler));
    }

    /// Registers the message-sent handler. Replaces any previous handler.
    pub fn on_message_sent<F>(&self, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.shared.handlers.write().unwrap().message_sent = Some(Arc::new(handler));
    }

    /// Registers the status-changed handler. Replaces any previous handler.
    pub fn on_status_changed<F>(&self, handler: F)
    where
        F: Fn(ServerStatus) + Send + Sync + 'static,
    {
        self.shared.handlers.write().unwrap().status_changed = Some(Arc::new(handler));
    }

    /// Registers the new-client handler. The handler receives the admission
    /// decision slot and may refuse the client. Replaces any previous
    /// handler.
    pub fn on_client_connected<F>(&self, handler: F)
    where
        F: Fn(&ClientInfo, &mut Admission) + Send + Sync + 'static,
    {
        self.shared.handlers.write().unwrap().client_connected = Some(Arc::new(handler));
    }

    /// Registers the client-disconnected handler. Replaces any previous
    /// handler.
    pub fn on_client_disconnected<F>(&self, handler: F)
    where
        F: Fn(&ClientInfo) + Send + Sync + 'static,
    {
        self.shared.handlers.write().unwrap().client_disconnected = Some(Arc::new(handler));
    }

    /// Validates the configuration, binds the socket and spawns the
    /// listening worker. On success status becomes `Running` and the
    /// status-changed handler fires.
    ///
    /// Configuration errors are returned without touching the status; any
    /// later stage failure (socket, bind, listen, thread spawn) moves the
    /// server to `Failed`, fires status-changed and returns the stage error
    /// synchronously. Restarting a stopped or failed server first tears
    /// down whatever the previous run left behind.
    pub fn start(&self) -> Result<(), ServerError> {
        let _lifecycle = self.lifecycle.lock().unwrap();

        {
            let status = self.shared.status.lock().unwrap();
            if *status == ServerStatus::Running {
                return Err(ServerError::InvalidStatus(*status));
            }
        }

        self.shared
            .config
            .validate()
            .map_err(|e| ServerError::InvalidConfig(e.to_string()))?;

        // A failed run keeps its clients alive until restart or drop.
        if let Err(e) = self.teardown_run() {
            warn!("Leftovers of the previous run: {}", e);
        }

        let config = &self.shared.config;
        info!(
            "Starting server on {}:{} ({}, {})",
            config.bind_addr, config.port, config.transport, config.ip_version
        );

        self.shared.stop.store(false, Ordering::Release);
        *self.shared.last_error.lock().unwrap() = None;
        self.shared
            .registry
            .lock()
            .unwrap()
            .reset(config.max_clients);

        let (handle, local) = match self.bind_and_spawn() {
            Ok(pair) => pair,
            Err(e) => {
                self.mark_failed();
                return Err(e);
            }
        };
        *self.accept_handle.lock().unwrap() = Some(handle);
        *self.shared.local_addr.lock().unwrap() = Some(local);

        {
            let mut status = self.shared.status.lock().unwrap();
            *status = ServerStatus::Running;
            self.shared.status_cv.notify_all();
        }
        self.shared.emit_status_changed(ServerStatus::Running);
        info!(
            "Server running on {} (capacity {} clients)",
            local, config.max_clients
        );
        Ok(())
    }

    /// Resolves, binds and spawns the listening worker for the configured
    /// transport. Each stage maps to its own error variant.
    fn bind_and_spawn(&self) -> Result<(JoinHandle<()>, SocketAddr), ServerError> {
        let config = &self.shared.config;
        let addr = transport::resolve(&config.bind_addr, config.port, config.ip_version)
            .map_err(ServerError::Bind)?;

        match config.transport {
            Transport::Tcp => {
                let listener = transport::tcp_listener(addr, config.ip_version)?;
                // Polled against the stop flag; accept must not block forever.
                listener
                    .set_nonblocking(true)
                    .map_err(ServerError::Socket)?;
                let local = listener.local_addr().map_err(ServerError::Socket)?;

                let shared = Arc::clone(&self.shared);
                let handle = thread::Builder::new()
                    .name("sockline-accept".to_string())
                    .spawn(move || accept::accept_loop(shared, listener))
                    .map_err(ServerError::Thread)?;
                Ok((handle, local))
            }
            Transport::Udp => {
                let socket = transport::udp_listener(addr, config.ip_version)?;
                socket
                    .set_read_timeout(Some(POLL_INTERVAL))
                    .map_err(ServerError::Socket)?;
                let local = socket.local_addr().map_err(ServerError::Socket)?;

                let socket = Arc::new(socket);
                let shared = Arc::clone(&self.shared);
                let handle = thread::Builder::new()
                    .name("sockline-udp".to_string())
                    .spawn(move || recv::udp_worker(shared, socket))
                    .map_err(ServerError::Thread)?;
                Ok((handle, local))
            }
        }
    }

    /// Moves the server to `Failed` after a start-stage error and fires
    /// status-changed. Unlike `Shared::fail` this runs before the server is
    /// `Running`, so it transitions from whatever state start found.
    fn mark_failed(&self) {
        {
            let mut status = self.shared.status.lock().unwrap();
            *status = ServerStatus::Failed;
            self.shared.status_cv.notify_all();
        }
        self.shared.emit_status_changed(ServerStatus::Failed);
    }

    /// Stops a running server: fires status-changed, cancels the listening
    /// worker, disconnects every registered client (their disconnect
    /// handlers fire) and joins all workers before returning.
    ///
    /// Calling it in any other state returns `InvalidStatus` and alters
    /// nothing.
    pub fn stop(&self) -> Result<(), ServerError> {
        let _lifecycle = self.lifecycle.lock().unwrap();

        {
            let mut status = self.shared.status.lock().unwrap();
            if *status != ServerStatus::Running {
                return Err(ServerError::InvalidStatus(*status));
            }
            *status = ServerStatus::Stopped;
            self.shared.status_cv.notify_all();
        }
        self.shared.emit_status_changed(ServerStatus::Stopped);
        info!("Server stopping; draining clients");

        self.teardown_run()
    }

    /// Blocks until the server leaves `Running`, by `stop` or by a systemic
    /// failure. Returns `InvalidStatus` immediately when it is not running.
    pub fn wait(&self) -> Result<(), ServerError> {
        let mut status = self.shared.status.lock().unwrap();
        if *status != ServerStatus::Running {
            return Err(ServerError::InvalidStatus(*status));
        }
        while *status == ServerStatus::Running {
            status = self.shared.status_cv.wait(status).unwrap();
        }
        Ok(())
    }

    pub fn status(&self) -> ServerStatus {
        self.shared.status()
    }

    /// Address the listening socket actually bound, useful with port 0.
    /// `None` before the first successful `start`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock().unwrap()
    }

    /// The error that ended the current run, if a worker failed
    /// asynchronously. Taking it clears the slot.
    pub fn take_error(&self) -> Option<ServerError> {
        self.shared.last_error.lock().unwrap().take()
    }

    /// Point-in-time copy of the connected clients, ordered by id.
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.shared.registry.lock().unwrap().snapshot()
    }

    /// Sends one message to a registered client and fires the message-sent
    /// handler on success.
    pub fn send(&self, id: ClientId, msg: &Message) -> Result<(), ServerError> {
        let status = self.shared.status();
        if status != ServerStatus::Running {
            return Err(ServerError::InvalidStatus(status));
        }

        let frame = msg.encode(self.shared.config.max_payload)?;
        let conn = {
            let registry = self.shared.registry.lock().unwrap();
            match registry.lookup(id) {
                Ok(record) => record.conn.clone(),
                Err(_) => return Err(ServerError::InvalidClient(id)),
            }
        };

        conn.send_frame(&frame).map_err(ServerError::Send)?;
        debug!("Sent {} bytes to client {}", msg.size(), id);
        self.shared.emit_message_sent(msg);
        Ok(())
    }

    /// Attaches a receive worker to a client that was accepted without one
    /// (`auto_receive = false`). Fails with `InvalidClient` when the id is
    /// unknown or a worker is already attached.
    pub fn start_receiver(&self, id: ClientId) -> Result<(), ServerError> {
        let status = self.shared.status();
        if status != ServerStatus::Running {
            return Err(ServerError::InvalidStatus(status));
        }
        recv::spawn_receiver(&self.shared, id)
    }

    /// Disconnects one client.
    ///
    /// For a TCP client with a receive worker this shuts the connection
    /// down and lets the worker run the normal disconnect path, so the
    /// client-disconnected event fires from the worker shortly after this
    /// returns. UDP peers and worker-less records are removed and
    /// dispatched right here: shutting down the shared UDP socket would
    /// kill every peer, so the record is settled on the calling thread and
    /// the peer's next datagram re-admits it as a new client.
    pub fn disconnect(&self, id: ClientId) -> Result<(), ServerError> {
        let status = self.shared.status();
        if status != ServerStatus::Running {
            return Err(ServerError::InvalidStatus(status));
        }

        let mut registry = self.shared.registry.lock().unwrap();
        let (conn, worker_owned) = match registry.lookup(id) {
            Ok(record) => (
                record.conn.clone(),
                record.receiver && matches!(record.conn, ConnHandle::Tcp(_)),
            ),
            Err(_) => return Err(ServerError::InvalidClient(id)),
        };

        if worker_owned {
            drop(registry);
            conn.shutdown();
            return Ok(());
        }

        let record = match registry.remove(id) {
            Ok(record) => record,
            Err(_) => return Err(ServerError::InvalidClient(id)),
        };
        drop(registry);
        record.conn.shutdown();
        self.shared.emit_client_disconnected(&record.info);
        Ok(())
    }

    /// Winds down everything a run spawned: the listening worker, every
    /// receive worker, and any record that never had a worker attached.
    /// Idempotent; used by `stop`, by `start` when recycling a previous
    /// run, and by drop.
    fn teardown_run(&self) -> Result<(), ServerError> {
        self.shared.stop.store(true, Ordering::Release);

        let mut stop_error = None;
        if let Some(handle) = self.accept_handle.lock().unwrap().take() {
            if handle.thread().id() == thread::current().id() {
                // Teardown requested from a handler running on the listening
                // worker itself; it exits on its own once the handler returns.
            } else if handle.join().is_err() {
                stop_error = Some("listening worker panicked".to_string());
            }
        }

        // Wake workers blocked in read. Records stay registered so each
        // worker can remove its own and fire the disconnect event.
        let handles = self.shared.registry.lock().unwrap().handles();
        for conn in &handles {
            conn.shutdown();
        }

        let workers = std::mem::take(&mut *self.shared.workers.lock().unwrap());
        for (id, handle) in workers {
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            if handle.join().is_err() {
                warn!("Receive worker for client {} panicked", id);
                stop_error.get_or_insert_with(|| {
                    format!("receive worker for client {} panicked", id)
                });
            }
        }

        // Records without a worker still owe their disconnect event.
        let leftovers = self.shared.registry.lock().unwrap().drain();
        for record in leftovers {
            record.conn.shutdown();
            self.shared.emit_client_disconnected(&record.info);
        }
        debug_assert!(self.shared.registry.lock().unwrap().is_empty());

        match stop_error {
            Some(msg) => Err(ServerError::Stop(msg)),
            None => Ok(()),
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let transitioned = {
            let mut status = self.shared.status.lock().unwrap();
            if *status == ServerStatus::Running {
                *status = ServerStatus::Stopped;
                self.shared.status_cv.notify_all();
                true
            } else {
                false
            }
        };
        if transitioned {
            self.shared.emit_status_changed(ServerStatus::Stopped);
        }
        if let Err(e) = self.teardown_run() {
            warn!("Teardown on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(ServerStatus::Stopped.to_string(), "stopped");
        assert_eq!(ServerStatus::Running.to_string(), "running");
        assert_eq!(ServerStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_new_server_is_stopped() {
        let server = Server::new(ServerConfig::default());
        assert_eq!(server.status(), ServerStatus::Stopped);
        assert!(server.local_addr().is_none());
        assert!(server.clients().is_empty());
    }

    #[test]
    fn test_stop_before_start_is_invalid() {
        let server = Server::new(ServerConfig::default());
        assert!(matches!(
            server.stop(),
            Err(ServerError::InvalidStatus(ServerStatus::Stopped))
        ));
    }

    #[test]
    fn test_wait_before_start_is_invalid() {
        let server = Server::new(ServerConfig::default());
        assert!(matches!(
            server.wait(),
            Err(ServerError::InvalidStatus(ServerStatus::Stopped))
        ));
    }

    #[test]
    fn test_invalid_config_surfaces_synchronously() {
        let config = ServerConfig {
            max_clients: 0,
            ..ServerConfig::default()
        };
        let server = Server::new(config);
        assert!(matches!(server.start(), Err(ServerError::InvalidConfig(_))));
        // Config errors must not move the status machine.
        assert_eq!(server.status(), ServerStatus::Stopped);
    }

    #[test]
    fn test_send_requires_running() {
        let server = Server::new(ServerConfig::default());
        let msg = Message::new(1, 313, 0, vec![0u8; 4]);
        assert!(matches!(
            server.send(ClientId::from_raw(313), &msg),
            Err(ServerError::InvalidStatus(ServerStatus::Stopped))
        ));
    }
}
