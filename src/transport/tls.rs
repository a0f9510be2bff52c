// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! DNS over TLS: the TCP length-prefix framing wrapped in
//! a TLS handshake. Reuses [`crate::writer::udp_tcp::DatagramStreamWriter`]
//! exactly as plain TCP does, just built from a [`TlsHalf`] instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::dispatch::dispatch;
use crate::transport::ListenerHandle;
use crate::writer::udp_tcp::{DatagramStreamWriter, TlsHalf};

/// A TLS connection that sends nothing for this long is closed.
const TLS_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handle: ListenerHandle,
    max_connections: Option<usize>,
) {
    let semaphore = max_connections.map(|n| Arc::new(tokio::sync::Semaphore::new(n)));

    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "tls accept failed");
                        continue;
                    }
                };
                let permit = match &semaphore {
                    Some(sem) => match sem.clone().try_acquire_owned() {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            debug!(%remote, "tls connection cap reached, rejecting");
                            continue;
                        }
                    },
                    None => None,
                };
                let acceptor = acceptor.clone();
                let handle = handle.clone();
                handle.tracker.clone().spawn(async move {
                    let _permit = permit;
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => serve_tls_connection(tls_stream, remote, handle).await,
                        Err(e) => debug!(%remote, error = %e, "tls handshake failed"),
                    }
                });
            }
        }
    }
}

async fn serve_tls_connection(
    stream: tokio_rustls::server::TlsStream<TcpStream>,
    remote: std::net::SocketAddr,
    handle: ListenerHandle,
) {
    let local = stream
        .get_ref()
        .0
        .local_addr()
        .unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
    let (mut read_half, write_half) = tokio::io::split(stream);
    let mut writer = DatagramStreamWriter::stream(Box::new(TlsHalf(write_half)), local, remote, "tls");

    loop {
        let mut len_buf = [0u8; 2];
        tokio::select! {
            _ = handle.cancel.cancelled() => return,
            _ = tokio::time::sleep(TLS_IDLE_TIMEOUT) => {
                debug!(%remote, "tls connection idle timeout, closing");
                return;
            }
            result = read_half.read_exact(&mut len_buf) => {
                if result.is_err() {
                    return;
                }
            }
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        if read_half.read_exact(&mut payload).await.is_err() {
            return;
        }

        dispatch(
            &handle.routes(),
            &handle.listener_key,
            handle.cancel.clone(),
            &payload,
            &mut writer,
            handle.stacktrace,
        )
        .await;
        writer.reset_for_next_message();
    }
}
