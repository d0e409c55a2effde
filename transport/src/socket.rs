//! Socket setup that tokio does not expose directly: address reuse (so that a receiver or
//!  sender can be restarted right away on the same port) and the receive buffer size.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use tokio::net::{TcpListener, UdpSocket};
use tracing::debug;

const LISTEN_BACKLOG: i32 = 16;

/// NB: must be called from inside a tokio runtime
pub fn bind_udp(addr: SocketAddr, recv_buffer_size: Option<usize>) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if let Some(size) = recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
        debug!("requested receive buffer of {} bytes, got {}", size, socket.recv_buffer_size()?);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    Ok(UdpSocket::from_std(socket.into())?)
}

/// NB: must be called from inside a tokio runtime
pub fn bind_tcp_listener(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(TcpListener::from_std(socket.into())?)
}

/// Unbound address of the same family as `peer`, for sockets that only send
pub fn unspecified_for(peer: SocketAddr) -> SocketAddr {
    if peer.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    }
    else {
        SocketAddr::from(([0u16; 8], 0))
    }
}
