//! Socket plumbing
//!
//! Bridges configuration onto `std::net` sockets. Creation is staged through
//! `socket2` so each stage (socket, bind, listen, connect) surfaces its own
//! error, and so the listen backlog is explicit rather than whatever the
//! standard library picks.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{
    IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs,
    UdpSocket,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{IpVersion, Transport};
use crate::error::{ClientError, ServerError};

/// Pending-connection queue length for TCP listeners.
pub(crate) const LISTEN_BACKLOG: i32 = 32;

/// How often blocking-free poll loops wake to check their stop flag.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Resolves a host/port pair to the first address of the requested family.
pub(crate) fn resolve(host: &str, port: u16, ip: IpVersion) -> io::Result<SocketAddr> {
    for addr in (host, port).to_socket_addrs()? {
        let matches = match ip {
            IpVersion::V4 => addr.is_ipv4(),
            IpVersion::V6 => addr.is_ipv6(),
        };
        if matches {
            return Ok(addr);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        format!("no {} address found for {}", ip, host),
    ))
}

fn open_socket(ip: IpVersion, transport: Transport) -> io::Result<Socket> {
    let (ty, proto) = match transport {
        Transport::Tcp => (Type::STREAM, Protocol::TCP),
        Transport::Udp => (Type::DGRAM, Protocol::UDP),
    };
    let domain = match ip {
        IpVersion::V4 => Domain::IPV4,
        IpVersion::V6 => Domain::IPV6,
    };
    let socket = Socket::new(domain, ty, Some(proto))?;
    if ip == IpVersion::V6 {
        // Keep the two families strictly separated.
        socket.set_only_v6(true)?;
    }
    Ok(socket)
}

/// Opens, binds and listens, returning a listener ready for `accept`.
pub(crate) fn tcp_listener(addr: SocketAddr, ip: IpVersion) -> Result<TcpListener, ServerError> {
    let socket = open_socket(ip, Transport::Tcp).map_err(ServerError::Socket)?;
    socket.set_reuse_address(true).map_err(ServerError::Socket)?;
    socket
        .bind(&SockAddr::from(addr))
        .map_err(ServerError::Bind)?;
    socket.listen(LISTEN_BACKLOG).map_err(ServerError::Listen)?;
    Ok(socket.into())
}

/// Opens and binds the server-side UDP socket.
pub(crate) fn udp_listener(addr: SocketAddr, ip: IpVersion) -> Result<UdpSocket, ServerError> {
    let socket = open_socket(ip, Transport::Udp).map_err(ServerError::Socket)?;
    socket
        .bind(&SockAddr::from(addr))
        .map_err(ServerError::Bind)?;
    Ok(socket.into())
}

/// Opens a TCP socket and connects it to the server.
pub(crate) fn tcp_connect(addr: SocketAddr, ip: IpVersion) -> Result<TcpStream, ClientError> {
    let socket = open_socket(ip, Transport::Tcp).map_err(ClientError::Socket)?;
    socket
        .connect(&SockAddr::from(addr))
        .map_err(ClientError::Connect)?;
    Ok(socket.into())
}

/// Opens a UDP socket on an ephemeral local port and associates it with the
/// server, so `recv` only yields that peer's datagrams.
pub(crate) fn udp_connect(addr: SocketAddr, ip: IpVersion) -> Result<UdpSocket, ClientError> {
    let socket = open_socket(ip, Transport::Udp).map_err(ClientError::Socket)?;
    let local = match ip {
        IpVersion::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpVersion::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    socket
        .bind(&SockAddr::from(local))
        .map_err(ClientError::Socket)?;
    socket
        .connect(&SockAddr::from(addr))
        .map_err(ClientError::Connect)?;
    Ok(socket.into())
}

/// One TCP connection shared between a receive worker and writer threads.
///
/// Reads go through `&TcpStream` directly; writes serialize through the lock
/// so frames written from different threads never interleave on the wire.
pub(crate) struct TcpConn {
    stream: TcpStream,
    write_lock: Mutex<()>,
}

impl TcpConn {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            write_lock: Mutex::new(()),
        }
    }

    /// Blocking read of whatever bytes the transport has; 0 means the peer
    /// closed in an orderly way.
    pub(crate) fn read_chunk(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    pub(crate) fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        (&self.stream).write_all(frame)
    }

    /// Closes both directions, which also unblocks any thread sitting in
    /// `read_chunk`. Safe to call more than once.
    pub(crate) fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Write/shutdown handle stored in the registry. TCP owns its connection;
/// UDP shares the server socket and remembers the peer address.
#[derive(Clone)]
pub(crate) enum ConnHandle {
    Tcp(Arc<TcpConn>),
    Udp {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
}

impl ConnHandle {
    pub(crate) fn send_frame(&self, frame: &[u8]) -> io::Result<()> {
        match self {
            ConnHandle::Tcp(conn) => conn.write_frame(frame),
            ConnHandle::Udp { socket, peer } => {
                let sent = socket.send_to(frame, peer)?;
                if sent != frame.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "datagram truncated on send",
                    ));
                }
                Ok(())
            }
        }
    }

    /// Closes the transport under the handle. The UDP socket is shared with
    /// every other peer, so there this is a no-op.
    pub(crate) fn shutdown(&self) {
        if let ConnHandle::Tcp(conn) = self {
            conn.shutdown();
        }
    }
}
