//! Module `client`
//!
//! The client side of a connection. A `Client` holds one connection to a
//! server, a handler table and a single receive worker that turns inbound
//! bytes into message events. Connect, send and disconnect run on the
//! caller's thread; only the receive path is backgrounded.

use log::{debug, info, warn};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use crate::config::{ClientConfig, IpVersion, Transport};
use crate::error::ClientError;
use crate::events::ClientHandlers;
use crate::message::{FrameDecoder, HEADER_LEN, MAX_EXTENSION, Message};
use crate::transport::{self, POLL_INTERVAL, TcpConn};

/// Read buffer size for the receive worker.
const RECV_CHUNK: usize = 2048;

/// Point-in-time view of the connection, handed to the status-changed
/// handler and returned by `Client::status`.
#[derive(Debug, Clone)]
pub struct ConnStatus {
    pub connected: bool,
    /// Resolved server address of the current (or last) connection.
    pub remote_addr: Option<SocketAddr>,
    pub transport: Transport,
    pub ip_version: IpVersion,
}

/// The live connection, shared between the handle and the receive worker.
#[derive(Clone)]
enum ClientConn {
    Tcp(Arc<TcpConn>),
    Udp(Arc<UdpSocket>),
}

impl ClientConn {
    fn send_frame(&self, frame: &[u8]) -> std::io::Result<()> {
        match self {
            ClientConn::Tcp(conn) => conn.write_frame(frame),
            ClientConn::Udp(socket) => {
                let sent = socket.send(frame)?;
                if sent != frame.len() {
                    return Err(std::io::Error::new(
                        ErrorKind::WriteZero,
                        "datagram truncated",
                    ));
                }
                Ok(())
            }
        }
    }

    fn shutdown(&self) {
        // The UDP worker polls with a read timeout, so there is nothing to
        // shut down; it notices the stop flag on its next wake.
        if let ClientConn::Tcp(conn) = self {
            conn.shutdown();
        }
    }
}

struct ClientShared {
    config: ClientConfig,
    handlers: RwLock<ClientHandlers>,
    conn: Mutex<Option<ClientConn>>,
    remote: Mutex<Option<SocketAddr>>,
    connected: AtomicBool,
    /// One-shot latch for the disconnected/status events of a session.
    done: AtomicBool,
    stop: AtomicBool,
}

impl ClientShared {
    fn conn_status(&self) -> ConnStatus {
        ConnStatus {
            connected: self.connected.load(Ordering::Acquire),
            remote_addr: *self.remote.lock().unwrap(),
            transport: self.config.transport,
            ip_version: self.config.ip_version,
        }
    }

    /// Ends the session exactly once, no matter which path gets here first
    /// (worker seeing EOF, explicit disconnect, drop). Fires disconnected
    /// and status-changed for the session that actually connected.
    fn finish_disconnect(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connected.store(false, Ordering::Release);
        let peer = *self.remote.lock().unwrap();
        if let Some(peer) = peer {
            info!("Disconnected from {}", peer);
            self.emit_disconnected(peer);
        }
        self.emit_status_changed(&self.conn_status());
    }

    /// Snapshot of the handler table; dispatch never holds the lock.
    fn handler_table(&self) -> ClientHandlers {
        self.handlers.read().unwrap().clone()
    }

    fn emit_message(&self, msg: &Message) {
        self.handler_table().fire_message(msg);
    }

    fn emit_message_sent(&self, msg: &Message) {
        self.handler_table().fire_message_sent(msg);
    }

    fn emit_status_changed(&self, status: &ConnStatus) {
        self.handler_table().fire_status_changed(status);
    }

    fn emit_connected(&self, peer: SocketAddr) {
        self.handler_table().fire_connected(peer);
    }

    fn emit_disconnected(&self, peer: SocketAddr) {
        self.handler_table().fire_disconnected(peer);
    }
}

/// One client connection.
///
/// Construct it, register handlers, then `connect`. All methods take
/// `&self`; a disconnected client can `connect` again and the handler table
/// survives reconnects.
pub struct Client {
    shared: Arc<ClientShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Creates a client with the given configuration. Nothing is connected
    /// until `connect`.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                config,
                handlers: RwLock::new(ClientHandlers::default()),
                conn: Mutex::new(None),
                remote: Mutex::new(None),
                connected: AtomicBool::new(false),
                done: AtomicBool::new(false),
                stop: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
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
        F: Fn(&ConnStatus) + Send + Sync + 'static,
    {
        self.shared.handlers.write().unwrap().status_changed = Some(Arc::new(handler));
    }

    /// Registers the connected handler. Replaces any previous handler.
    pub fn on_connected<F>(&self, handler: F)
    where
        F: Fn(SocketAddr) + Send + Sync + 'static,
    {
        self.shared.handlers.write().unwrap().connected = Some(Arc::new(handler));
    }

    /// Registers the disconnected handler. Replaces any previous handler.
    pub fn on_disconnected<F>(&self, handler: F)
    where
        F: Fn(SocketAddr) + Send + Sync + 'static,
    {
        self.shared.handlers.write().unwrap().disconnected = Some(Arc::new(handler));
    }

    /// Validates the configuration, connects and spawns the receive worker.
    /// On success the connected and status-changed handlers fire before this
    /// returns. Connecting while already connected returns `InvalidStatus`.
    pub fn connect(&self) -> Result<(), ClientError> {
        if self.shared.connected.load(Ordering::Acquire) {
            return Err(ClientError::InvalidStatus(
                "already connected".to_string(),
            ));
        }
        self.shared
            .config
            .validate()
            .map_err(|e| ClientError::InvalidConfig(e.to_string()))?;

        // Recycle whatever a previous session left behind.
        self.teardown_conn();

        let config = &self.shared.config;
        let addr = transport::resolve(&config.server_addr, config.port, config.ip_version)
            .map_err(ClientError::Connect)?;

        let conn = match config.transport {
            Transport::Tcp => {
                let stream = transport::tcp_connect(addr, config.ip_version)?;
                ClientConn::Tcp(Arc::new(TcpConn::new(stream)))
            }
            Transport::Udp => {
                let socket = transport::udp_connect(addr, config.ip_version)?;
                // Polled against the stop flag; recv must not block forever.
                socket
                    .set_read_timeout(Some(POLL_INTERVAL))
                    .map_err(ClientError::Socket)?;
                ClientConn::Udp(Arc::new(socket))
            }
        };

        *self.shared.conn.lock().unwrap() = Some(conn.clone());
        *self.shared.remote.lock().unwrap() = Some(addr);
        self.shared.stop.store(false, Ordering::Release);
        self.shared.done.store(false, Ordering::Release);
        self.shared.connected.store(true, Ordering::Release);

        info!("Connected to {} ({})", addr, config.transport);
        self.shared.emit_connected(addr);
        self.shared.emit_status_changed(&self.shared.conn_status());

        // Spawned after the connected event so the first message event can
        // never outrun it.
        let worker_shared = Arc::clone(&self.shared);
        let worker_conn = conn;
        let spawned = thread::Builder::new()
            .name("sockline-client".to_string())
            .spawn(move || recv_worker(worker_shared, worker_conn));
        match spawned {
            Ok(handle) => {
                *self.worker.lock().unwrap() = Some(handle);
                Ok(())
            }
            Err(e) => {
                // No reader means no usable session; close it back down.
                if let Some(conn) = self.shared.conn.lock().unwrap().take() {
                    conn.shutdown();
                }
                self.shared.finish_disconnect();
                Err(ClientError::Concurrency(e))
            }
        }
    }

    /// Sends one message and fires the message-sent handler on success.
    pub fn send(&self, msg: &Message) -> Result<(), ClientError> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(ClientError::InvalidStatus("not connected".to_string()));
        }

        let frame = msg.encode(self.shared.config.max_payload)?;
        let conn = {
            let guard = self.shared.conn.lock().unwrap();
            match &*guard {
                Some(conn) => conn.clone(),
                None => return Err(ClientError::InvalidStatus("not connected".to_string())),
            }
        };

        conn.send_frame(&frame).map_err(ClientError::Send)?;
        debug!("Sent {} bytes to server", msg.size());
        self.shared.emit_message_sent(msg);
        Ok(())
    }

    /// Closes the connection and joins the receive worker. The disconnected
    /// and status-changed handlers fire once, from whichever side noticed
    /// the close first. Disconnecting while not connected returns
    /// `InvalidStatus`.
    pub fn disconnect(&self) -> Result<(), ClientError> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(ClientError::InvalidStatus("not connected".to_string()));
        }
        self.teardown_conn();
        Ok(())
    }

    pub fn status(&self) -> ConnStatus {
        self.shared.conn_status()
    }

    /// Winds the session down: raises the stop flag, closes the connection
    /// to wake a blocked read, joins the worker and settles the disconnect
    /// events. Idempotent.
    fn teardown_conn(&self) {
        self.shared.stop.store(true, Ordering::Release);
        let had_conn = {
            let mut guard = self.shared.conn.lock().unwrap();
            match guard.take() {
                Some(conn) => {
                    conn.shutdown();
                    true
                }
                None => false,
            }
        };
        if let Some(handle) = self.worker.lock().unwrap().take() {
            if handle.thread().id() == thread::current().id() {
                // Disconnect requested from inside a handler on the worker
                // itself; it exits on its own once the handler returns.
            } else if handle.join().is_err() {
                warn!("Receive worker panicked");
            }
        }
        // The worker normally fires the events on its way out; this covers
        // sessions that never had one.
        if had_conn {
            self.shared.finish_disconnect();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.teardown_conn();
    }
}

/// Body of the receive worker: drains the connection until it ends, then
/// settles the disconnect events for the session.
fn recv_worker(shared: Arc<ClientShared>, conn: ClientConn) {
    match conn {
        ClientConn::Tcp(stream) => tcp_recv_loop(&shared, &stream),
        ClientConn::Udp(socket) => udp_recv_loop(&shared, &socket),
    }
    shared.finish_disconnect();
}

fn tcp_recv_loop(shared: &ClientShared, conn: &TcpConn) {
    let mut decoder = FrameDecoder::new(shared.config.max_payload);
    let mut buf = vec![0u8; RECV_CHUNK];

    loop {
        match conn.read_chunk(&mut buf) {
            Ok(0) => {
                info!("Server closed the connection");
                break;
            }
            Ok(n) => {
                decoder.extend(&buf[..n]);
                if let Err(e) = drain_inbound(shared, &mut decoder) {
                    warn!("Invalid frame from server: {}", e);
                    break;
                }
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                if !shared.stop.load(Ordering::Acquire) {
                    info!("Connection read ended: {}", e);
                }
                break;
            }
        }
    }
}

fn drain_inbound(
    shared: &ClientShared,
    decoder: &mut FrameDecoder,
) -> Result<(), crate::error::FrameError> {
    while let Some(msg) = decoder.next_message()? {
        debug!("Received {} bytes from server", msg.size());
        shared.emit_message(&msg);
    }
    Ok(())
}

fn udp_recv_loop(shared: &ClientShared, socket: &UdpSocket) {
    let max_payload = shared.config.max_payload;
    let mut buf = vec![0u8; HEADER_LEN + MAX_EXTENSION + max_payload];

    while !shared.stop.load(Ordering::Acquire) {
        match socket.recv(&mut buf) {
            Ok(n) => match Message::decode(&buf[..n], max_payload) {
                Ok(msg) => {
                    debug!("Received {} bytes from server", msg.size());
                    shared.emit_message(&msg);
                }
                // A bad datagram costs one datagram, not the session.
                Err(e) => warn!("Invalid datagram from server: {}", e),
            },
            Err(ref e)
                if e.kind() == ErrorKind::WouldBlock
                    || e.kind() == ErrorKind::TimedOut
                    || e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("Receive failed: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DEFAULT_MAX_PAYLOAD;
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::Duration;

    fn tcp_config(port: u16) -> ClientConfig {
        ClientConfig {
            server_addr: "127.0.0.1".to_string(),
            port,
            ..ClientConfig::default()
        }
    }

    #[test]
    fn test_status_before_connect() {
        let client = Client::new(ClientConfig::default());
        let status = client.status();
        assert!(!status.connected);
        assert!(status.remote_addr.is_none());
    }

    #[test]
    fn test_send_before_connect_is_invalid() {
        let client = Client::new(ClientConfig::default());
        let msg = Message::new(1, 313, 0, b"hi".to_vec());
        assert!(matches!(
            client.send(&msg),
            Err(ClientError::InvalidStatus(_))
        ));
    }

    #[test]
    fn test_disconnect_before_connect_is_invalid() {
        let client = Client::new(ClientConfig::default());
        assert!(matches!(
            client.disconnect(),
            Err(ClientError::InvalidStatus(_))
        ));
    }

    #[test]
    fn test_connect_rejects_invalid_config() {
        let client = Client::new(tcp_config(0));
        assert!(matches!(
            client.connect(),
            Err(ClientError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_connect_to_dead_port_fails() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = Client::new(tcp_config(port));
        assert!(matches!(client.connect(), Err(ClientError::Connect(_))));
        assert!(!client.status().connected);
    }

    #[test]
    fn test_receives_message_and_settles_on_server_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let frame = Message::new(1, 313, 7, b"hello".to_vec())
                .encode(DEFAULT_MAX_PAYLOAD)
                .unwrap();
            stream.write_all(&frame).unwrap();
            // Dropping the stream closes the connection.
        });

        let (msg_tx, msg_rx) = mpsc::channel();
        let (gone_tx, gone_rx) = mpsc::channel();
        let client = Client::new(tcp_config(port));
        client.on_message(move |msg| {
            msg_tx.send(msg.payload.clone()).unwrap();
        });
        client.on_disconnected(move |peer| {
            gone_tx.send(peer).unwrap();
        });

        client.connect().unwrap();
        assert!(client.status().connected);

        let payload = msg_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(payload, b"hello");

        gone_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!client.status().connected);
        assert!(matches!(
            client.disconnect(),
            Err(ClientError::InvalidStatus(_))
        ));
        server.join().unwrap();
    }

    #[test]
    fn test_message_sent_event_fires() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            // Hold the connection open until the client is done.
            std::thread::sleep(Duration::from_millis(200));
            drop(stream);
        });

        let (sent_tx, sent_rx) = mpsc::channel();
        let client = Client::new(tcp_config(port));
        client.on_message_sent(move |msg| {
            sent_tx.send(msg.payload.len()).unwrap();
        });

        client.connect().unwrap();
        let msg = Message::new(313, 1, 0, vec![0u8; 10]);
        client.send(&msg).unwrap();
        assert_eq!(sent_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 10);

        client.disconnect().unwrap();
        server.join().unwrap();
    }
}
