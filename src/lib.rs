// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A pluggable, Corefile-driven DNS server: UDP/TCP, DNS-over-TLS,
//! DNS-over-QUIC, DNS-over-HTTPS (HTTP/1.1, h2, and HTTP/3), and gRPC,
//! all dispatched through one plugin chain per zone.

pub mod cli;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod logging;
pub mod plugin;
pub mod socket;
pub mod supervisor;
pub mod tls_config;
pub mod transport;
pub mod wire;
pub mod writer;
pub mod zone_address;
