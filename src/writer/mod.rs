// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Response writer adapters.
//!
//! One writer instance is created by the transport server per inbound DNS
//! message and handed to the core; it is discarded once the chain returns.
//! Every concrete adapter enforces "`write_msg` at most once": a second
//! call logs a warning and the second write is silently dropped.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tracing::warn;

pub mod grpc;
pub mod https;
pub mod quic;
pub mod udp_tcp;

/// TSIG verification status surfaced to plugins; transports that don't
/// carry TSIG (QUIC, gRPC, HTTP) report `NotPresent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsigStatus {
    NotPresent,
    Verified,
    Failed,
}

/// The polymorphic response writer.
#[async_trait]
pub trait ResponseWriter: Send {
    fn local_addr(&self) -> SocketAddr;
    fn remote_addr(&self) -> SocketAddr;

    /// Encode and send `reply`. Transport-specific framing (length
    /// prefixes, HTTP headers, gRPC response buffering) happens here.
    async fn write_msg(&mut self, reply: &Message) -> io::Result<()>;

    /// Send pre-encoded bytes, applying the same framing as `write_msg`.
    async fn write(&mut self, raw: &[u8]) -> io::Result<()>;

    async fn close(&mut self) -> io::Result<()>;

    fn tsig_status(&self) -> TsigStatus {
        TsigStatus::NotPresent
    }

    /// Take over the underlying connection for a plugin that wants to
    /// manage raw bytes itself (e.g. zone transfer). A no-op for adapters
    /// that have nothing to hand over (QUIC, gRPC).
    fn hijack(&mut self) {}

    /// Whether `write_msg`/`write` has already produced a reply on this
    /// writer. Used by the core to decide whether to synthesise one.
    fn has_written(&self) -> bool;

    /// The datagram size cap a reply on this writer must fit in before the
    /// truncated flag needs to be set, or `None` for a stream transport
    /// (TCP, TLS, QUIC, HTTPS, HTTPS/3, gRPC), which never truncates.
    fn max_udp_payload(&self) -> Option<usize> {
        None
    }
}

/// Shared "second write is a bug" guard used by every concrete adapter's
/// `write_msg`/`write` implementation.
pub(crate) fn guard_single_write(written: &mut bool, transport: &'static str) -> bool {
    if *written {
        warn!(transport, "plugin wrote a second reply on one response writer; dropping it");
        false
    } else {
        *written = true;
        true
    }
}

/// Smallest TTL across the answer section, used by the DoH writer's
/// `Cache-Control: max-age=N`; `0` if there is no answer.
pub fn min_answer_ttl(reply: &Message) -> u32 {
    reply.answers().iter().map(|r| r.ttl()).min().unwrap_or(0)
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// An in-memory writer used by plugin unit tests; records the reply
    /// without touching any real transport.
    pub struct RecordingWriter {
        remote: SocketAddr,
        local: SocketAddr,
        written: bool,
        reply: Option<Message>,
    }

    impl RecordingWriter {
        pub fn new(remote: SocketAddr) -> Self {
            RecordingWriter {
                remote,
                local: "0.0.0.0:53".parse().unwrap(),
                written: false,
                reply: None,
            }
        }

        pub fn written(&self) -> Option<&Message> {
            self.reply.as_ref()
        }
    }

    #[async_trait]
    impl ResponseWriter for RecordingWriter {
        fn local_addr(&self) -> SocketAddr {
            self.local
        }

        fn remote_addr(&self) -> SocketAddr {
            self.remote
        }

        async fn write_msg(&mut self, reply: &Message) -> io::Result<()> {
            if guard_single_write(&mut self.written, "test") {
                self.reply = Some(reply.clone());
            }
            Ok(())
        }

        async fn write(&mut self, raw: &[u8]) -> io::Result<()> {
            if let Ok(msg) = crate::wire::decode(raw) {
                self.write_msg(&msg).await?;
            }
            Ok(())
        }

        async fn close(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn has_written(&self) -> bool {
            self.written
        }
    }
}
