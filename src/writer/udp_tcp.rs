// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! UDP/TCP and TLS response writer. TLS reuses this verbatim: the
//! transport layer alone handles
//! the handshake, the writer just pushes bytes to whatever `AsyncWrite`
//! sink it was built around.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use super::{guard_single_write, ResponseWriter, TsigStatus};
use crate::wire;

/// Sink abstraction so one writer type serves both UDP (send back to a
/// peer address on a shared socket) and TCP/TLS (write to a per-connection
/// stream half).
pub enum Sink {
    Udp {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
    Stream(Box<dyn StreamHalf>),
}

/// Minimal `AsyncWrite`-like surface for the TCP/TLS half; boxed so UDP and
/// stream writers can share one enum without generics leaking into every
/// call site.
#[async_trait]
pub trait StreamHalf: Send {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    async fn shutdown(&mut self) -> io::Result<()>;
}

pub struct TcpHalf(pub tokio::net::tcp::OwnedWriteHalf);

#[async_trait]
impl StreamHalf for TcpHalf {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.write_all(buf).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.0.shutdown().await
    }
}

pub struct TlsHalf(pub tokio::io::WriteHalf<tokio_rustls::server::TlsStream<tokio::net::TcpStream>>);

#[async_trait]
impl StreamHalf for TlsHalf {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.write_all(buf).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.0.shutdown().await
    }
}

pub struct DatagramStreamWriter {
    sink: Arc<Mutex<Sink>>,
    local: SocketAddr,
    remote: SocketAddr,
    /// `true` for TCP/TLS, which length-prefix every message; UDP sends
    /// raw datagrams with no framing.
    stream_framed: bool,
    written: bool,
    transport: &'static str,
}

impl DatagramStreamWriter {
    pub fn udp(socket: Arc<UdpSocket>, local: SocketAddr, remote: SocketAddr) -> Self {
        DatagramStreamWriter {
            sink: Arc::new(Mutex::new(Sink::Udp { socket, peer: remote })),
            local,
            remote,
            stream_framed: false,
            written: false,
            transport: "udp",
        }
    }

    pub fn stream(
        half: Box<dyn StreamHalf>,
        local: SocketAddr,
        remote: SocketAddr,
        transport: &'static str,
    ) -> Self {
        DatagramStreamWriter {
            sink: Arc::new(Mutex::new(Sink::Stream(half))),
            local,
            remote,
            stream_framed: true,
            written: false,
            transport,
        }
    }
}

#[async_trait]
impl ResponseWriter for DatagramStreamWriter {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    async fn write_msg(&mut self, reply: &Message) -> io::Result<()> {
        let bytes = wire::encode(reply).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.write(&bytes).await
    }

    async fn write(&mut self, raw: &[u8]) -> io::Result<()> {
        if !guard_single_write(&mut self.written, self.transport) {
            return Ok(());
        }
        let framed;
        let out: &[u8] = if self.stream_framed {
            framed = wire::add_prefix(raw);
            &framed
        } else {
            raw
        };

        let mut sink = self.sink.lock().await;
        match &mut *sink {
            Sink::Udp { socket, peer } => {
                socket.send_to(out, *peer).await?;
            }
            Sink::Stream(half) => {
                half.write_all(out).await?;
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        let mut sink = self.sink.lock().await;
        if let Sink::Stream(half) = &mut *sink {
            half.shutdown().await?;
        }
        Ok(())
    }

    fn tsig_status(&self) -> TsigStatus {
        TsigStatus::NotPresent
    }

    fn has_written(&self) -> bool {
        self.written
    }

    fn max_udp_payload(&self) -> Option<usize> {
        if self.stream_framed {
            None
        } else {
            Some(512)
        }
    }
}

impl DatagramStreamWriter {
    /// A persistent TCP/TLS connection carries many messages; the
    /// "write at most once" guard is per-message, so the core resets it
    /// between reads on the same connection.
    pub fn reset_for_next_message(&mut self) {
        self.written = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, MessageType};
    use tokio::net::UdpSocket as TokioUdpSocket;

    #[tokio::test]
    async fn udp_writer_single_write_enforced() {
        let socket = Arc::new(TokioUdpSocket::bind("127.0.0.1:0").await.unwrap());
        let local = socket.local_addr().unwrap();
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut writer = DatagramStreamWriter::udp(socket, local, peer);

        let mut reply = Message::new();
        reply.set_message_type(MessageType::Response);
        writer.write_msg(&reply).await.unwrap();
        assert!(writer.has_written());

        // second write is a dropped no-op, not an error
        writer.write_msg(&reply).await.unwrap();
    }
}
