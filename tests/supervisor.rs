// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end tests against a real `Supervisor`: bound sockets and actual
//! UDP round trips, not just the dispatch path in isolation.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flexdns::config::loader::DirectiveController;
use flexdns::config::{load, PluginRegistry};
use flexdns::context::RequestContext;
use flexdns::plugin::{ChainBuilder, Handler, ServeResult};
use flexdns::supervisor::Supervisor;
use flexdns::writer::ResponseWriter;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use tokio::net::UdpSocket;
use tokio::time::timeout;

fn encode_query(name: &str) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(99);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
    flexdns::wire::encode(&msg).unwrap()
}

async fn send_udp_query(port: u16, name: &str) -> Message {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let raw = encode_query(name);
    socket.send_to(&raw, ("127.0.0.1", port)).await.unwrap();
    let mut buf = [0u8; 512];
    let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("reply within 2s")
        .unwrap();
    flexdns::wire::decode(&buf[..len]).unwrap()
}

#[tokio::test]
async fn udp_routing_miss_returns_refused() {
    let blocks = load(
        "example.org:15301 {\n  bind 127.0.0.1\n  whoami\n}\n",
        PluginRegistry::with_builtins(),
    )
    .unwrap();
    let supervisor = Supervisor::start(blocks).await.unwrap();

    let reply = send_udp_query(15301, "other.test.").await;
    assert_eq!(reply.response_code(), ResponseCode::Refused);

    supervisor.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn matched_zone_whoami_reply_carries_two_additional_records() {
    let blocks = load(
        "example.org:15302 {\n  bind 127.0.0.1\n  whoami\n}\n",
        PluginRegistry::with_builtins(),
    )
    .unwrap();
    let supervisor = Supervisor::start(blocks).await.unwrap();

    let reply = send_udp_query(15302, "host.example.org.").await;
    assert_eq!(reply.response_code(), ResponseCode::NoError);
    assert_eq!(reply.additionals().len(), 2);

    supervisor.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn multisocket_fanout_binds_expected_socket_count() {
    let blocks = load(
        ".:15303 {\n  bind 127.0.0.1\n  multisocket 2\n  whoami\n}\n",
        PluginRegistry::with_builtins(),
    )
    .unwrap();
    let supervisor = Supervisor::start(blocks).await.unwrap();

    // one listener key (single bind host, single port), 2 multisocket
    // workers each running one UDP and one TCP accept loop.
    assert_eq!(supervisor.listener_keys().len(), 1);
    assert_eq!(supervisor.task_count(), 4);

    let reply = send_udp_query(15303, "anything.").await;
    assert_eq!(reply.response_code(), ResponseCode::NoError);

    supervisor.shutdown(Duration::from_secs(2)).await.unwrap();
}

/// A handler that never returns, used to exercise the graceful-shutdown
/// deadline: nothing in this crate's own plugins blocks forever, so the
/// property under test needs one built for the occasion.
struct Stall;

#[async_trait]
impl Handler for Stall {
    fn name(&self) -> &'static str {
        "stall"
    }

    async fn serve(&self, _ctx: &RequestContext, _writer: &mut dyn ResponseWriter, _msg: &Message) -> ServeResult {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        (ResponseCode::NoError, None)
    }
}

fn stall_setup(ctrl: &mut DirectiveController) -> Result<(), String> {
    let builder: ChainBuilder = Arc::new(|_next| Arc::new(Stall) as Arc<dyn Handler>);
    ctrl.register_chain_builder("stall", builder);
    Ok(())
}

#[tokio::test]
async fn shutdown_returns_deadline_exceeded_when_a_handler_hangs() {
    let mut registry = PluginRegistry::new();
    registry.register("stall", stall_setup, false);
    let blocks = load("example.org:15304 {\n  bind 127.0.0.1\n  stall\n}\n", registry).unwrap();
    let supervisor = Supervisor::start(blocks).await.unwrap();

    // fire the query and move on without waiting for a reply: none will
    // ever come, the handler just needs to be mid-flight when shutdown runs.
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&encode_query("anything."), ("127.0.0.1", 15304))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let result = supervisor.shutdown(Duration::from_millis(500)).await;
    let elapsed = started.elapsed();

    assert!(result.is_err());
    assert!(elapsed < Duration::from_millis(600), "took {elapsed:?}");
}

#[tokio::test]
async fn reload_same_endpoint_reuses_the_listener_and_swaps_the_chain() {
    let blocks_a = load(
        "example.org:15305 {\n  bind 127.0.0.1\n  whoami\n}\n",
        PluginRegistry::with_builtins(),
    )
    .unwrap();
    let supervisor = Supervisor::start(blocks_a).await.unwrap();
    let keys_before: Vec<String> = supervisor.listener_keys().iter().map(|s| s.to_string()).collect();

    let reply = send_udp_query(15305, "host.example.org.").await;
    assert_eq!(reply.response_code(), ResponseCode::NoError);

    // same endpoint, no plugin this time: the chain falls through to the
    // terminal handler and refuses instead of answering.
    let blocks_b = load("example.org:15305 {\n  bind 127.0.0.1\n}\n", PluginRegistry::with_builtins()).unwrap();
    let supervisor = supervisor.reload(blocks_b).await;
    let keys_after: Vec<String> = supervisor.listener_keys().iter().map(|s| s.to_string()).collect();

    assert_eq!(keys_after, keys_before);

    let reply = send_udp_query(15305, "host.example.org.").await;
    assert_eq!(reply.response_code(), ResponseCode::Refused);

    supervisor.shutdown(Duration::from_secs(2)).await.unwrap();
}
