// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `whoami` — a terminal plugin that answers every query with an empty
//! answer section and two additional records describing the client: its
//! address and the source port it queried from. Mirrors the reference
//! CoreDNS `whoami` plugin closely enough to exercise an end-to-end DoH
//! request against it.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, SRV};
use hickory_proto::rr::{Name, RData, Record};

use crate::config::loader::DirectiveController;
use crate::context::RequestContext;
use crate::plugin::{ChainBuilder, Handler, ServeResult};
use crate::writer::ResponseWriter;

pub struct Whoami;

/// `whoami` never delegates, so its chain-builder ignores `next`.
pub fn builder() -> ChainBuilder {
    Arc::new(|_next| Arc::new(Whoami) as Arc<dyn Handler>)
}

/// Setup routine registered for the `whoami` directive.
pub fn setup(ctrl: &mut DirectiveController) -> Result<(), String> {
    ctrl.register_chain_builder("whoami", builder());
    Ok(())
}

#[async_trait]
impl Handler for Whoami {
    fn name(&self) -> &'static str {
        "whoami"
    }

    async fn serve(
        &self,
        _ctx: &RequestContext,
        writer: &mut dyn ResponseWriter,
        msg: &Message,
    ) -> ServeResult {
        let mut reply = Message::new();
        reply.set_id(msg.id());
        reply.set_message_type(hickory_proto::op::MessageType::Response);
        reply.set_op_code(msg.op_code());
        reply.set_response_code(ResponseCode::NoError);
        reply.add_queries(msg.queries().iter().cloned());

        let remote = writer.remote_addr();
        reply.add_additional(address_record(remote));
        reply.add_additional(port_record(remote));

        if let Err(e) = writer.write_msg(&reply).await {
            return (
                ResponseCode::ServFail,
                Some(super::PluginError {
                    plugin: "whoami",
                    message: e.to_string(),
                }),
            );
        }
        (ResponseCode::NoError, None)
    }
}

fn address_record(remote: SocketAddr) -> Record {
    let name = Name::from_str(".").unwrap();
    match remote.ip() {
        IpAddr::V4(v4) => Record::from_rdata(name, 0, RData::A(A(v4))),
        IpAddr::V6(v6) => Record::from_rdata(name, 0, RData::AAAA(AAAA(v6))),
    }
}

fn port_record(remote: SocketAddr) -> Record {
    let name = Name::from_str(".").unwrap();
    Record::from_rdata(
        name.clone(),
        0,
        RData::SRV(SRV::new(0, 0, remote.port(), name)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::test_support::RecordingWriter;
    use hickory_proto::op::{Message, MessageType, OpCode, Query};
    use hickory_proto::rr::RecordType;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn answers_with_two_additional_records() {
        let mut q = Message::new();
        q.set_id(42);
        q.set_message_type(MessageType::Query);
        q.set_op_code(OpCode::Query);
        q.add_query(Query::query(
            Name::from_str("whoami.example.org.").unwrap(),
            RecordType::A,
        ));

        let mut writer = RecordingWriter::new("127.0.0.1:5300".parse().unwrap());
        let ctx = RequestContext::new("dns://0.0.0.0:53", CancellationToken::new());

        let (rcode, err) = Whoami.serve(&ctx, &mut writer, &q).await;

        assert_eq!(rcode, ResponseCode::NoError);
        assert!(err.is_none());
        let reply = writer.written().expect("reply written");
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert_eq!(reply.queries().len(), 1);
        assert_eq!(reply.additionals().len(), 2);
    }
}
