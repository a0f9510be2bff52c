// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! DoQ response writer.
//!
//! Holds the QUIC send half of one bidirectional stream; exactly one
//! request/response pair lives on a DoQ stream (RFC 9250 §4.2), so
//! `write_msg` finishes (closes) the stream after sending.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use hickory_proto::op::Message;
use quinn::SendStream;

use super::{guard_single_write, ResponseWriter, TsigStatus};
use crate::wire;

pub struct DoqWriter {
    send: SendStream,
    local: SocketAddr,
    remote: SocketAddr,
    written: bool,
}

impl DoqWriter {
    pub fn new(send: SendStream, local: SocketAddr, remote: SocketAddr) -> Self {
        DoqWriter {
            send,
            local,
            remote,
            written: false,
        }
    }
}

#[async_trait]
impl ResponseWriter for DoqWriter {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    async fn write_msg(&mut self, reply: &Message) -> io::Result<()> {
        if !guard_single_write(&mut self.written, "doq") {
            return Ok(());
        }
        // DoQ requires the wire ID to be zero (RFC 9250 §4.2.1).
        let mut zeroed = reply.clone();
        zeroed.set_id(0);
        let bytes = wire::encode(&zeroed).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let framed = wire::add_prefix(&bytes);
        self.send
            .write_all(&framed)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.send
            .finish()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(())
    }

    async fn write(&mut self, raw: &[u8]) -> io::Result<()> {
        if !guard_single_write(&mut self.written, "doq") {
            return Ok(());
        }
        let framed = wire::add_prefix(raw);
        self.send
            .write_all(&framed)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.send
            .finish()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        // finish() is already called by write_msg/write; closing an
        // already-finished stream is a no-op for DoQ's one-shot streams.
        Ok(())
    }

    fn tsig_status(&self) -> TsigStatus {
        TsigStatus::NotPresent
    }

    fn hijack(&mut self) {
        // no-op: DoQ streams carry exactly one request/response pair, there
        // is nothing meaningful to hand over to a plugin.
    }

    fn has_written(&self) -> bool {
        self.written
    }
}

/// DoQ application-level error codes (RFC 9250 §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DoqErrorCode {
    NoError = 0,
    InternalError = 1,
    ProtocolError = 2,
}

impl From<DoqErrorCode> for quinn::VarInt {
    fn from(code: DoqErrorCode) -> Self {
        quinn::VarInt::from_u32(code as u32)
    }
}
