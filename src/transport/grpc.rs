// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! DNS queries carried as opaque bytes over a unary gRPC RPC. Generated
//! client/server code lives in
//! [`dns_proto`], compiled from `proto/dns.proto` at build time.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tonic::transport::server::Connected;
use tonic::transport::{Identity, Server as TonicServer, ServerTlsConfig};
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::config::block::TlsMaterial;
use crate::dispatch::dispatch;
use crate::error::ListenError;
use crate::transport::ListenerHandle;
use crate::writer::grpc::GrpcWriter;

pub mod dns_proto {
    tonic::include_proto!("flexdns.grpc");
}

use dns_proto::dns_service_server::{DnsService, DnsServiceServer};
use dns_proto::DnsPacket;

/// A DNS wire message larger than this is rejected both inbound and
/// outbound (matches the cap every other transport's framing enforces).
const MAX_GRPC_MESSAGE_LEN: usize = 65535;

struct DnsGrpcService {
    handle: ListenerHandle,
}

#[tonic::async_trait]
impl DnsService for DnsGrpcService {
    async fn query(&self, request: Request<DnsPacket>) -> Result<Response<DnsPacket>, Status> {
        let remote = request
            .remote_addr()
            .ok_or_else(|| Status::invalid_argument("missing peer address"))?;
        let local: SocketAddr = "0.0.0.0:0".parse().unwrap();
        let payload = request.into_inner().msg;
        if payload.len() > MAX_GRPC_MESSAGE_LEN {
            return Err(Status::invalid_argument("dns message exceeds size limit"));
        }

        let mut writer = GrpcWriter::new(local, remote);
        dispatch(
            &self.handle.routes(),
            &self.handle.listener_key,
            self.handle.cancel.clone(),
            &payload,
            &mut writer,
            self.handle.stacktrace,
        )
        .await;

        let reply = writer.take_reply().unwrap_or_default();
        if reply.len() > MAX_GRPC_MESSAGE_LEN {
            return Err(Status::internal("dns message exceeds size limit"));
        }
        Ok(Response::new(DnsPacket { msg: reply }))
    }
}

/// A TCP connection wrapped with the connection-cap permit that admitted
/// it; dropping the stream (tonic drops it once the connection closes)
/// frees the slot.
struct LimitedConnection {
    inner: TcpStream,
    _permit: OwnedSemaphorePermit,
}

impl AsyncRead for LimitedConnection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for LimitedConnection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Connected for LimitedConnection {
    type ConnectInfo = <TcpStream as Connected>::ConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.inner.connect_info()
    }
}

/// Accept loop gated by a connection-cap semaphore, handed to tonic as its
/// incoming stream. `max_connections` of `None` admits effectively
/// unbounded connections.
fn limited_incoming(
    listener: TcpListener,
    max_connections: Option<usize>,
) -> impl Stream<Item = io::Result<LimitedConnection>> {
    let capacity = max_connections.unwrap_or(Semaphore::MAX_PERMITS);
    let semaphore = Arc::new(Semaphore::new(capacity));
    futures::stream::unfold((listener, semaphore), |(listener, semaphore)| async move {
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => return Some((Err(e), (listener, semaphore))),
            };
            match semaphore.clone().try_acquire_owned() {
                Ok(permit) => {
                    let conn = LimitedConnection { inner: stream, _permit: permit };
                    return Some((Ok(conn), (listener, semaphore)));
                }
                Err(_) => {
                    debug!(%remote, "grpc connection cap reached, rejecting");
                    continue;
                }
            }
        }
    })
}

/// Run the gRPC server on `listener` until cancelled. A `tls` block is
/// required wherever a `grpc://` key appears; tonic negotiates TLS itself
/// from the certificate/key PEM material named by the block's directive.
/// `max_streams` caps concurrent in-flight RPCs per connection;
/// `max_connections` caps concurrently accepted TCP connections.
pub async fn serve_grpc(
    listener: tokio::net::TcpListener,
    handle: ListenerHandle,
    tls: &TlsMaterial,
    max_streams: Option<usize>,
    max_connections: Option<usize>,
) -> Result<(), ListenError> {
    let service = DnsServiceServer::new(DnsGrpcService { handle: handle.clone() });
    let incoming = limited_incoming(listener, max_connections);

    let cert = std::fs::read(&tls.cert_path)
        .map_err(|e| ListenError::Tls(format!("{}: {e}", tls.cert_path.display())))?;
    let key = std::fs::read(&tls.key_path)
        .map_err(|e| ListenError::Tls(format!("{}: {e}", tls.key_path.display())))?;
    let tls_config = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));

    let mut builder = TonicServer::builder();
    if let Some(limit) = max_streams {
        builder = builder.concurrency_limit_per_connection(limit);
    }
    let builder = builder.tls_config(tls_config).map_err(|e| ListenError::Tls(e.to_string()))?;

    builder
        .add_service(service)
        .serve_with_incoming_shutdown(incoming, handle.cancel.cancelled())
        .await
        .map_err(|e| ListenError::Grpc(e.to_string()))
}
