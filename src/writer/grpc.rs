// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! gRPC response writer.
//!
//! No streaming: the reply is buffered and handed back directly as the
//! unary RPC's return value once the chain completes.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use hickory_proto::op::Message;

use super::{guard_single_write, ResponseWriter, TsigStatus};
use crate::wire;

pub struct GrpcWriter {
    local: SocketAddr,
    remote: SocketAddr,
    written: bool,
    buffer: Option<Vec<u8>>,
}

impl GrpcWriter {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        GrpcWriter {
            local,
            remote,
            written: false,
            buffer: None,
        }
    }

    /// Take the buffered reply once the chain has returned. `None` means no
    /// reply was written (the caller should translate this to a rcode).
    pub fn take_reply(&mut self) -> Option<Vec<u8>> {
        self.buffer.take()
    }
}

#[async_trait]
impl ResponseWriter for GrpcWriter {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    async fn write_msg(&mut self, reply: &Message) -> io::Result<()> {
        if !guard_single_write(&mut self.written, "grpc") {
            return Ok(());
        }
        let bytes = wire::encode(reply).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.buffer = Some(bytes);
        Ok(())
    }

    async fn write(&mut self, raw: &[u8]) -> io::Result<()> {
        if !guard_single_write(&mut self.written, "grpc") {
            return Ok(());
        }
        self.buffer = Some(raw.to_vec());
        Ok(())
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
