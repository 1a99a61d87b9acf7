//! Socket creation, binding, and bounded connect.
//!
//! `std::net` does not expose `SO_SNDBUF`/`SO_RCVBUF`/`TCP_NODELAY`/IP-ToS
//! tuning, so socket construction goes through [`socket2`] for the raw
//! knobs and is handed to `tokio` only once it is ready to be driven by the
//! async runtime.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::warn;

use zap_wire::SERVICE_PORT;

/// Interval between `bind_service` retries on `EADDRINUSE`.
pub const BIND_RETRY_DELAY: Duration = Duration::from_micros(500);

/// Errors produced by socket setup.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The underlying socket could not be created.
    #[error("failed to create socket: {0}")]
    Create(#[source] io::Error),
    /// A `setsockopt`-style call failed.
    #[error("failed to set socket option: {0}")]
    SetOpt(#[source] io::Error),
    /// Binding failed for a reason other than `EADDRINUSE`.
    #[error("failed to bind socket: {0}")]
    Bind(#[source] io::Error),
    /// Handing the socket to the tokio reactor failed.
    #[error("failed to register socket with the async runtime: {0}")]
    IntoTokio(#[source] io::Error),
    /// `listen()` failed.
    #[error("failed to listen: {0}")]
    Listen(#[source] io::Error),
    /// The connect attempt did not complete before the deadline.
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Address we were connecting to.
        addr: SocketAddr,
        /// The deadline that elapsed.
        timeout: Duration,
    },
    /// The connect attempt completed with an error.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        /// Address we were connecting to.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Create a fresh TCP (with `TCP_NODELAY`) or UDP socket, optionally sizing
/// its send/receive buffers to `buf` bytes when nonzero.
pub fn make_socket(buf: u32, tcp: bool) -> Result<Socket, Error> {
    let (ty, proto) = if tcp {
        (Type::STREAM, Protocol::TCP)
    } else {
        (Type::DGRAM, Protocol::UDP)
    };
    let socket = Socket::new(Domain::IPV4, ty, Some(proto)).map_err(Error::Create)?;
    if tcp {
        socket.set_nodelay(true).map_err(Error::SetOpt)?;
    }
    if buf > 0 {
        socket
            .set_send_buffer_size(buf as usize)
            .map_err(Error::SetOpt)?;
        socket
            .set_recv_buffer_size(buf as usize)
            .map_err(Error::SetOpt)?;
    }
    Ok(socket)
}

/// Resize a live socket's send/receive buffers. Used to grow the shared
/// UDP transmit socket's buffer to the largest `batch_size * payload_length`
/// across live stations, by design.
pub fn resize_buffers(socket: &UdpSocket, buf: u32) -> Result<(), Error> {
    let sock_ref = SockRef::from(socket);
    sock_ref
        .set_send_buffer_size(buf as usize)
        .map_err(Error::SetOpt)?;
    sock_ref
        .set_recv_buffer_size(buf as usize)
        .map_err(Error::SetOpt)
}

/// Apply an IP type-of-service value to a live UDP socket. Because the
/// socket is shared across every transmitting station on this server, the
/// last station to configure wins — see DESIGN.md for why this ambiguity
/// is preserved rather than resolved here.
pub fn set_ip_tos(socket: &UdpSocket, tos: u32) -> Result<(), Error> {
    SockRef::from(socket).set_tos(tos).map_err(Error::SetOpt)
}

/// Bind `sock` to `0.0.0.0:SERVICE_PORT`, retrying on `EADDRINUSE` with a
/// short sleep rather than failing outright.
pub async fn bind_service(sock: &Socket) -> Result<(), Error> {
    let addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, SERVICE_PORT).into();
    loop {
        match sock.bind(&addr.into()) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                warn!(port = SERVICE_PORT, delay = ?BIND_RETRY_DELAY, "service port in use, retrying");
                tokio::time::sleep(BIND_RETRY_DELAY).await;
            }
            Err(e) => return Err(Error::Bind(e)),
        }
    }
}

/// Turn a bound, listen-ready [`Socket`] into a [`TcpListener`] the tokio
/// reactor can drive.
pub fn into_tcp_listener(socket: Socket) -> Result<TcpListener, Error> {
    socket.listen(128).map_err(Error::Listen)?;
    socket.set_nonblocking(true).map_err(Error::SetOpt)?;
    TcpListener::from_std(socket.into()).map_err(Error::IntoTokio)
}

/// Turn a bound [`Socket`] into a [`UdpSocket`] the tokio reactor can drive.
pub fn into_udp_socket(socket: Socket) -> Result<UdpSocket, Error> {
    socket.set_nonblocking(true).map_err(Error::SetOpt)?;
    UdpSocket::from_std(socket.into()).map_err(Error::IntoTokio)
}

/// Connect to `addr`, failing if the connection does not complete within
/// `timeout`. `tokio::net::TcpStream::connect` already performs the
/// non-blocking connect / writable-select / `SO_ERROR`-check dance
/// internally, so wrapping it in a deadline is all that's needed here.
pub async fn connect_with_deadline(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, Error> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true).map_err(Error::SetOpt)?;
            Ok(stream)
        }
        Ok(Err(source)) => Err(Error::Connect { addr, source }),
        Err(_) => Err(Error::ConnectTimeout { addr, timeout }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_to_closed_port_fails_promptly() {
        // Port 1 is privileged/unused in test sandboxes; connecting should
        // fail well before any unreasonable deadline.
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = connect_with_deadline(addr, Duration::from_secs(2)).await;
        assert!(result.is_err());
    }

    #[test]
    fn make_socket_sets_nodelay_for_tcp() {
        let socket = make_socket(0, true).expect("socket created");
        // set_nodelay without an active connection is only checkable via
        // the getsockopt roundtrip; we at least assert construction
        // succeeds with no buffer sizing requested.
        drop(socket);
    }
}
