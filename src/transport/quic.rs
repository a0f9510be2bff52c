// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! DNS over QUIC (RFC 9250). One bidirectional stream per
//! query/response pair; protocol violations close the connection with the
//! matching DoQ application error code instead of a DNS-level reply.

use std::sync::Arc;

use hickory_proto::rr::rdata::opt::EdnsCode;
use quinn::{Endpoint, ServerConfig as QuinnServerConfig, VarInt};
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::dispatch::dispatch;
use crate::error::RequestError;
use crate::transport::ListenerHandle;
use crate::writer::quic::{DoqErrorCode, DoqWriter};

const MAX_DOQ_MESSAGE_LEN: usize = 65535;

/// `worker_pool_size` bounds how many streams, across every connection on
/// this endpoint, are being processed at once; a connection's own
/// `max_streams` only bounds how many of its streams are outstanding.
/// Excess stream acceptance is backpressured by the pool, not rejected.
pub async fn serve_quic(endpoint: Endpoint, handle: ListenerHandle, max_streams: usize, worker_pool_size: usize) {
    let worker_pool = Arc::new(Semaphore::new(worker_pool_size));
    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => break,
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else { break };
                let handle = handle.clone();
                let worker_pool = worker_pool.clone();
                handle.tracker.clone().spawn(async move {
                    match incoming.await {
                        Ok(conn) => serve_connection(conn, handle, max_streams, worker_pool).await,
                        Err(e) => debug!(error = %e, "quic handshake failed"),
                    }
                });
            }
        }
    }
}

pub fn build_server_config(
    tls: std::sync::Arc<rustls::ServerConfig>,
) -> Result<QuinnServerConfig, crate::error::ListenError> {
    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from((*tls).clone())
        .map_err(|e| crate::error::ListenError::Quic(e.to_string()))?;
    Ok(QuinnServerConfig::with_crypto(std::sync::Arc::new(crypto)))
}

async fn serve_connection(
    conn: quinn::Connection,
    handle: ListenerHandle,
    max_streams: usize,
    worker_pool: Arc<Semaphore>,
) {
    let remote = conn.remote_address();
    let local = conn.local_ip().map(|ip| std::net::SocketAddr::new(ip, 0));
    let stream_slots = Arc::new(Semaphore::new(max_streams));

    loop {
        // acquired in order: a full worker pool holds off the next
        // `accept_bi` entirely, which is what backpressures acceptance.
        let worker_permit = tokio::select! {
            _ = handle.cancel.cancelled() => return,
            permit = worker_pool.clone().acquire_owned() => permit,
        };
        let stream_permit = stream_slots.clone().acquire_owned().await;
        tokio::select! {
            _ = handle.cancel.cancelled() => return,
            accepted = conn.accept_bi() => {
                let (send, recv) = match accepted {
                    Ok(pair) => pair,
                    Err(_) => return, // connection closed
                };
                let handle = handle.clone();
                let local = local.unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());
                let conn = conn.clone();
                handle.tracker.clone().spawn(async move {
                    let _worker_permit = worker_permit;
                    let _stream_permit = stream_permit;
                    serve_stream(send, recv, local, remote, handle, conn).await;
                });
            }
        }
    }
}

async fn serve_stream(
    send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    local: std::net::SocketAddr,
    remote: std::net::SocketAddr,
    handle: ListenerHandle,
    conn: quinn::Connection,
) {
    let payload = match read_framed(&mut recv).await {
        Ok(payload) => payload,
        Err(e) => {
            warn!(%remote, error = %e, "doq protocol violation, closing connection");
            conn.close(VarInt::from(DoqErrorCode::ProtocolError), b"protocol error");
            return;
        }
    };

    // RFC 9250 §4.2.1 forbids a non-zero message ID and §4.2.2 the
    // TCP-keepalive EDNS option on a DoQ stream. A message that fails to
    // decode here is left to the core, which replies FORMERR as usual.
    if let Ok(msg) = crate::wire::decode(&payload) {
        let keepalive = msg.edns().map(|edns| edns.options().get(EdnsCode::Keepalive).is_some()).unwrap_or(false);
        if msg.id() != 0 || keepalive {
            warn!(%remote, id = msg.id(), keepalive, "doq message violates protocol, closing connection");
            conn.close(VarInt::from(DoqErrorCode::ProtocolError), b"protocol error");
            return;
        }
    }

    let mut writer = DoqWriter::new(send, local, remote);
    dispatch(
        &handle.routes(),
        &handle.listener_key,
        handle.cancel.clone(),
        &payload,
        &mut writer,
        handle.stacktrace,
    )
    .await;
}

/// Read one 2-byte-length-prefixed DoQ message off `recv`, rejecting
/// oversize or truncated frames as a protocol error (RFC 9250 §4.2).
async fn read_framed(recv: &mut quinn::RecvStream) -> Result<Vec<u8>, RequestError> {
    let mut len_buf = [0u8; 2];
    recv.read_exact(&mut len_buf)
        .await
        .map_err(|_| RequestError::DoqProtocol("truncated length prefix"))?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(RequestError::DoqProtocol("zero-length message"));
    }
    if len > MAX_DOQ_MESSAGE_LEN {
        return Err(RequestError::Oversize { len });
    }
    let mut payload = vec![0u8; len];
    recv.read_exact(&mut payload)
        .await
        .map_err(|_| RequestError::DoqProtocol("truncated message body"))?;
    Ok(payload)
}
