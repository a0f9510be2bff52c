// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Core request dispatch: decode, route, run the plugin chain, and make
//! sure exactly one reply leaves on the wire no matter how the chain
//! behaved.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::context::{HttpRequestInfo, RequestContext};
use crate::listener::RoutingTable;
use crate::writer::ResponseWriter;

/// Run one request to completion against `table`. Always leaves exactly one
/// reply written on `writer`, synthesising one itself if the chain didn't.
pub async fn dispatch(
    table: &RoutingTable,
    listener_key: &str,
    cancel: CancellationToken,
    raw: &[u8],
    writer: &mut dyn ResponseWriter,
    stacktrace: bool,
) {
    dispatch_with_http_info(table, listener_key, cancel, raw, writer, stacktrace, None).await
}

/// Same as [`dispatch`], but stashes `http_info` on the request context so
/// plugins serving a DoH/DoH3 request can read the originating HTTP
/// request's method, path and headers.
pub async fn dispatch_with_http_info(
    table: &RoutingTable,
    listener_key: &str,
    cancel: CancellationToken,
    raw: &[u8],
    writer: &mut dyn ResponseWriter,
    stacktrace: bool,
    http_info: Option<HttpRequestInfo>,
) {
    let query = match crate::wire::decode(raw) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(error = %e, "failed to decode inbound message, replying FORMERR");
            send_synthetic(writer, 0, OpCode::Query, &[], ResponseCode::FormErr, None).await;
            return;
        }
    };
    let edns_max_payload = query.edns().map(|edns| edns.max_payload());

    let qname = query.queries().first().map(|q| q.name().to_string());
    let chain = match qname.as_deref().and_then(|n| table.lookup(n)) {
        Some(chain) => chain.clone(),
        None => {
            send_synthetic(
                writer,
                query.id(),
                query.op_code(),
                query.queries(),
                ResponseCode::Refused,
                edns_max_payload,
            )
            .await;
            return;
        }
    };

    let ctx = RequestContext::new(listener_key.to_string(), cancel);
    let ctx = match http_info {
        Some(info) => ctx.with_http_request(info),
        None => ctx,
    };

    let outcome = AssertUnwindSafe(chain.serve(&ctx, writer, &query))
        .catch_unwind()
        .await;

    let (rcode, plugin_error) = match outcome {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            if stacktrace {
                error!(qname = ?qname, reason = %reason, "plugin chain panicked");
            } else {
                error!("plugin chain panicked while serving request");
            }
            (ResponseCode::ServFail, None)
        }
    };

    if let Some(err) = plugin_error {
        warn!(plugin = err.plugin, message = %err.message, "plugin reported an error");
    }

    if !writer.has_written() {
        send_synthetic(
            writer,
            query.id(),
            query.op_code(),
            query.queries(),
            rcode,
            edns_max_payload,
        )
        .await;
    }
}

/// Effective truncation cap for a reply leaving on `writer`: the writer's
/// own datagram limit (`None` for stream transports, which never truncate),
/// narrowed to the requester's advertised EDNS buffer size when it is
/// smaller, never widened past it.
fn truncation_cap(writer: &dyn ResponseWriter, edns_max_payload: Option<u16>) -> Option<usize> {
    let writer_cap = writer.max_udp_payload()?;
    match edns_max_payload {
        Some(edns_cap) => Some(writer_cap.min(edns_cap as usize)),
        None => Some(writer_cap),
    }
}

/// If `reply` encodes larger than `cap`, set the truncated flag and drop the
/// answer/authority/additional sections so the requester falls back to TCP.
/// No-op when `cap` is `None` (stream transports).
fn clamp_truncation(reply: &mut Message, cap: Option<usize>) {
    let Some(cap) = cap else { return };
    let fits = crate::wire::encode(reply)
        .map(|bytes| bytes.len() <= cap)
        .unwrap_or(false);
    if fits {
        return;
    }
    reply.set_truncated(true);
    reply.take_answers();
    reply.take_name_servers();
    reply.take_additionals();
}

async fn send_synthetic(
    writer: &mut dyn ResponseWriter,
    id: u16,
    op_code: OpCode,
    queries: &[hickory_proto::op::Query],
    rcode: ResponseCode,
    edns_max_payload: Option<u16>,
) {
    let mut reply = Message::new();
    reply.set_id(id);
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(op_code);
    reply.set_response_code(rcode);
    reply.add_queries(queries.iter().cloned());
    clamp_truncation(&mut reply, truncation_cap(writer, edns_max_payload));
    if let Err(e) = writer.write_msg(&reply).await {
        warn!(error = %e, "failed to write synthesised reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{load, PluginRegistry};
    use crate::listener::group;
    use crate::writer::test_support::RecordingWriter;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn encode_query(name: &str) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(7);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        crate::wire::encode(&msg).unwrap()
    }

    #[tokio::test]
    async fn routing_miss_returns_refused() {
        let blocks = load("example.org {\n  whoami\n}\n", PluginRegistry::with_builtins()).unwrap();
        let groups = group(blocks).unwrap();
        let mut writer = RecordingWriter::new("127.0.0.1:9".parse().unwrap());
        let raw = encode_query("other.test.");

        dispatch(
            &groups[0].routing_table,
            &groups[0].listener_key,
            CancellationToken::new(),
            &raw,
            &mut writer,
            false,
        )
        .await;

        assert_eq!(
            writer.written().unwrap().response_code(),
            ResponseCode::Refused
        );
    }

    #[tokio::test]
    async fn malformed_message_returns_formerr() {
        let blocks = load("example.org {\n  whoami\n}\n", PluginRegistry::with_builtins()).unwrap();
        let groups = group(blocks).unwrap();
        let mut writer = RecordingWriter::new("127.0.0.1:9".parse().unwrap());

        dispatch(
            &groups[0].routing_table,
            &groups[0].listener_key,
            CancellationToken::new(),
            &[0xff, 0x00, 0x01],
            &mut writer,
            false,
        )
        .await;

        assert_eq!(
            writer.written().unwrap().response_code(),
            ResponseCode::FormErr
        );
    }

    #[tokio::test]
    async fn matched_zone_is_served_by_its_chain() {
        let blocks = load("example.org {\n  whoami\n}\n", PluginRegistry::with_builtins()).unwrap();
        let groups = group(blocks).unwrap();
        let mut writer = RecordingWriter::new("127.0.0.1:9".parse().unwrap());
        let raw = encode_query("host.example.org.");

        dispatch(
            &groups[0].routing_table,
            &groups[0].listener_key,
            CancellationToken::new(),
            &raw,
            &mut writer,
            false,
        )
        .await;

        let reply = writer.written().unwrap();
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert_eq!(reply.additionals().len(), 2);
    }
}
