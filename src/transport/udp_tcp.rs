// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Plain DNS over UDP and TCP.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, warn};

use crate::dispatch::dispatch;
use crate::transport::ListenerHandle;
use crate::writer::udp_tcp::{DatagramStreamWriter, TcpHalf};

const UDP_BUFFER_SIZE: usize = 65535;

/// A TCP connection that sends nothing for this long is closed.
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub async fn serve_udp(socket: UdpSocket, handle: ListenerHandle) {
    let socket = Arc::new(socket);
    let local = socket.local_addr().unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                let (len, remote) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "udp recv_from failed");
                        continue;
                    }
                };
                let datagram = buf[..len].to_vec();
                let socket = socket.clone();
                let handle = handle.clone();
                handle.tracker.clone().spawn(async move {
                    let mut writer = DatagramStreamWriter::udp(socket, local, remote);
                    dispatch(
                        &handle.routes(),
                        &handle.listener_key,
                        handle.cancel.clone(),
                        &datagram,
                        &mut writer,
                        handle.stacktrace,
                    )
                    .await;
                });
            }
        }
    }
}

pub async fn serve_tcp(listener: TcpListener, handle: ListenerHandle, max_connections: Option<usize>) {
    let semaphore = max_connections.map(|n| Arc::new(tokio::sync::Semaphore::new(n)));

    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "tcp accept failed");
                        continue;
                    }
                };
                let permit = match &semaphore {
                    Some(sem) => match sem.clone().try_acquire_owned() {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            debug!(%remote, "tcp connection cap reached, rejecting");
                            continue;
                        }
                    },
                    None => None,
                };
                let handle = handle.clone();
                handle.tracker.clone().spawn(async move {
                    let _permit = permit;
                    serve_tcp_connection(stream, remote, handle).await;
                });
            }
        }
    }
}

async fn serve_tcp_connection(
    stream: TcpStream,
    remote: std::net::SocketAddr,
    handle: ListenerHandle,
) {
    let local = stream.local_addr().unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
    let (mut read_half, write_half) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(DatagramStreamWriter::stream(
        Box::new(TcpHalf(write_half)),
        local,
        remote,
        "tcp",
    )));

    loop {
        let mut len_buf = [0u8; 2];
        tokio::select! {
            _ = handle.cancel.cancelled() => return,
            _ = tokio::time::sleep(TCP_IDLE_TIMEOUT) => {
                debug!(%remote, "tcp connection idle timeout, closing");
                return;
            }
            result = read_half.read_exact(&mut len_buf) => {
                if result.is_err() {
                    return; // EOF or reset: connection is done
                }
            }
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        if read_half.read_exact(&mut payload).await.is_err() {
            return;
        }

        // each query on the connection gets its own writer view so a slow
        // chain on one message can't block framing of the next; all share
        // the one underlying stream serialized by the mutex.
        let mut guard = writer.lock().await;
        dispatch(
            &handle.routes(),
            &handle.listener_key,
            handle.cancel.clone(),
            &payload,
            &mut *guard,
            handle.stacktrace,
        )
        .await;
        guard.reset_for_next_message();
        drop(guard);
    }
}
