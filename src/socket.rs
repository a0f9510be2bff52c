// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Raw socket construction shared by every transport: `SO_REUSEADDR`/
//! `SO_REUSEPORT` for multisocket fan-out, and IPv4/IPv6 dual-stack
//! handling via `socket2` before handing the fd to Tokio.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};

use crate::error::ListenError;

fn domain_for(addr: SocketAddr) -> Domain {
    if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    }
}

fn new_socket(addr: SocketAddr, ty: Type, proto: Protocol) -> Result<Socket, std::io::Error> {
    let socket = Socket::new(domain_for(addr), ty, Some(proto))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    if addr.is_ipv6() {
        // accept only v6 traffic on this socket; "::" + a separate v4
        // socket is how dual-stack listening is expressed explicitly.
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn bind_udp(addr: SocketAddr) -> Result<Socket, ListenError> {
    let socket =
        new_socket(addr, Type::DGRAM, Protocol::UDP).map_err(|source| ListenError::Bind {
            transport: "udp",
            addr,
            source,
        })?;
    socket
        .bind(&addr.into())
        .map_err(|source| ListenError::Bind {
            transport: "udp",
            addr,
            source,
        })?;
    Ok(socket)
}

/// Build one UDP socket bound to `addr`. Call once per fan-out worker when
/// `multisocket` requests more than one.
pub fn build_udp_socket(addr: SocketAddr) -> Result<UdpSocket, ListenError> {
    let socket = bind_udp(addr)?;
    UdpSocket::from_std(socket.into()).map_err(|source| ListenError::Bind {
        transport: "udp",
        addr,
        source,
    })
}

/// Same as [`build_udp_socket`], but handed back as a blocking-API std
/// socket for `quinn::Endpoint::new`, which takes ownership of the fd
/// itself rather than a Tokio-wrapped one.
pub fn build_std_udp_socket(addr: SocketAddr) -> Result<std::net::UdpSocket, ListenError> {
    let socket = bind_udp(addr)?;
    Ok(socket.into())
}

/// Build one TCP listener bound to `addr`, used directly for plain DNS-TCP
/// and wrapped with a TLS acceptor for TLS/HTTPS/gRPC-over-TLS.
pub fn build_tcp_listener(addr: SocketAddr) -> Result<TcpListener, ListenError> {
    let socket =
        new_socket(addr, Type::STREAM, Protocol::TCP).map_err(|source| ListenError::Bind {
            transport: "tcp",
            addr,
            source,
        })?;
    socket
        .bind(&addr.into())
        .map_err(|source| ListenError::Bind {
            transport: "tcp",
            addr,
            source,
        })?;
    socket.listen(1024).map_err(|source| ListenError::Bind {
        transport: "tcp",
        addr,
        source,
    })?;
    TcpListener::from_std(socket.into()).map_err(|source| ListenError::Bind {
        transport: "tcp",
        addr,
        source,
    })
}
