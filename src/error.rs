// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Typed error surfaces for each concern of the server runtime.
//!
//! Configuration and listener-setup errors are fatal and bubble up to
//! `main`; per-request errors never take this path (see [`crate::dispatch`]).

use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ZoneAddressError {
    #[error("empty zone key")]
    Empty,
    #[error("unknown transport scheme {0:?}")]
    UnknownTransport(String),
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("zone {0:?} is not valid RFC1035 preferred syntax")]
    NotPreferredSyntax(String),
    #[error("zone key {0:?} and {1:?} normalize to the same address")]
    DuplicateKey(String, String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read Corefile at {path:?}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("syntax error at line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("zone address error: {0}")]
    ZoneAddress(#[from] ZoneAddressError),
    #[error("plugin {plugin:?} ({position}): {message}")]
    Directive {
        plugin: String,
        position: String,
        message: String,
    },
    #[error("duplicate plugin {0:?} in block (plugin does not permit repetition)")]
    DuplicatePlugin(String),
    #[error("unknown plugin directive {0:?}")]
    UnknownDirective(String),
    #[error("two blocks in listener group {listener_key:?} declare overlapping zones: {zone:?}")]
    OverlappingZones { listener_key: String, zone: String },
}

#[derive(Debug, Error)]
pub enum ListenError {
    #[error("failed to bind {transport} socket on {addr}: {source}")]
    Bind {
        transport: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("tls material error: {0}")]
    Tls(String),
    #[error("quic endpoint error: {0}")]
    Quic(String),
    #[error("http server error: {0}")]
    Http(String),
    #[error("grpc server error: {0}")]
    Grpc(String),
    #[error("configuration error while (re)binding listeners: {0}")]
    Config(#[from] ConfigError),
}

/// Per-request error kinds; always translated into a DNS rcode or a
/// transport-native close, never propagated as a process-level failure.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("failed to decode DNS message: {0}")]
    Decode(#[from] hickory_proto::ProtoError),
    #[error("no route for query, and no root zone fallback configured")]
    RoutingMiss,
    #[error("plugin {plugin:?} returned an error: {message}")]
    Plugin { plugin: String, message: String },
    #[error("handler panicked while serving {qname}/{qtype}")]
    Panic { qname: String, qtype: String },
    #[error("doq protocol violation: {0}")]
    DoqProtocol(&'static str),
    #[error("oversize message: {len} bytes exceeds 65535")]
    Oversize { len: usize },
}
