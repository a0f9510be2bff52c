// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Wire transport servers. Each accept loop turns bytes off the network
//! into a call to [`crate::dispatch::dispatch`] behind a transport-specific
//! [`crate::writer::ResponseWriter`], and nothing here knows about plugins,
//! Corefile syntax, or routing beyond "zone name in, chain out".

pub mod grpc;
pub mod https;
pub mod https3;
pub mod quic;
pub mod tls;
pub mod udp_tcp;

use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::listener::RoutingTable;

/// Everything a running accept loop needs: its identity for request
/// contexts, the shutdown signal, and a routing table that a reload can
/// swap out from under in-flight accept loops without rebinding the socket.
/// A request that already grabbed a snapshot via [`ListenerHandle::routes`]
/// finishes against that snapshot even if a reload swaps the table a moment
/// later.
///
/// Every task spawned while handling this listener (the accept loop itself
/// and every per-connection/per-request task it spawns) goes through
/// `tracker` rather than a bare `tokio::spawn`, so graceful shutdown can
/// actually wait for in-flight requests instead of only the accept loop.
#[derive(Clone)]
pub struct ListenerHandle {
    pub table: Arc<ArcSwap<RoutingTable>>,
    pub listener_key: String,
    pub stacktrace: bool,
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
}

impl ListenerHandle {
    pub fn routes(&self) -> Guard<Arc<RoutingTable>> {
        self.table.load()
    }
}
