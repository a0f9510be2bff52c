// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! DoH / DoH3 response writer.
//!
//! The HTTP-level behaviour is identical for both transports; only the
//! underlying connection (HTTP/1.1+H2 over TLS vs HTTP/3 over QUIC) differs,
//! and that lives entirely in the transport server, not here. The writer
//! hands its one allowed response to the waiting HTTP handler over a
//! oneshot channel.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderValue, Response, StatusCode};
use hickory_proto::op::Message;
use tokio::sync::oneshot;

use super::{guard_single_write, min_answer_ttl, ResponseWriter, TsigStatus};
use crate::wire;

pub struct HttpsWriter {
    local: SocketAddr,
    remote: SocketAddr,
    written: bool,
    reply_tx: Option<oneshot::Sender<Response<Body>>>,
}

impl HttpsWriter {
    pub fn new(
        local: SocketAddr,
        remote: SocketAddr,
    ) -> (Self, oneshot::Receiver<Response<Body>>) {
        let (tx, rx) = oneshot::channel();
        (
            HttpsWriter {
                local,
                remote,
                written: false,
                reply_tx: Some(tx),
            },
            rx,
        )
    }

    fn send_response(&mut self, body: Vec<u8>, max_age: u32) -> io::Result<()> {
        let Some(tx) = self.reply_tx.take() else {
            return Ok(());
        };
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(
                "Content-Type",
                HeaderValue::from_static("application/dns-message"),
            )
            .header(
                "Cache-Control",
                HeaderValue::from_str(&format!("max-age={max_age}"))
                    .unwrap_or_else(|_| HeaderValue::from_static("max-age=0")),
            )
            .body(Body::from(body))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        // The receiver may have been dropped if the request was cancelled
        // (client disconnect); that is not a writer-level error.
        let _ = tx.send(response);
        Ok(())
    }
}

#[async_trait]
impl ResponseWriter for HttpsWriter {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    async fn write_msg(&mut self, reply: &Message) -> io::Result<()> {
        if !guard_single_write(&mut self.written, "https") {
            return Ok(());
        }
        let max_age = min_answer_ttl(reply);
        let bytes = wire::encode(reply).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.send_response(bytes, max_age)
    }

    async fn write(&mut self, raw: &[u8]) -> io::Result<()> {
        if !guard_single_write(&mut self.written, "https") {
            return Ok(());
        }
        let max_age = wire::decode(raw).map(|m| min_answer_ttl(&m)).unwrap_or(0);
        self.send_response(raw.to_vec(), max_age)
    }

    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn tsig_status(&self) -> TsigStatus {
        TsigStatus::NotPresent
    }

    fn has_written(&self) -> bool {
        self.written
    }
}
