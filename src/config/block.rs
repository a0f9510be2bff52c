// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Server block config.

use std::path::PathBuf;
use std::sync::Arc;

use crate::plugin::{Chain, ChainBuilder};
use crate::zone_address::ZoneAddress;

/// TLS material named by a block's `tls` directive; used by tls/quic/https/https3/grpc.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: Option<PathBuf>,
    pub server_name: Option<String>,
}

/// Transport-specific caps the user set via the core's reserved directives.
#[derive(Debug, Clone, Default)]
pub struct TransportLimits {
    pub multisocket: Option<usize>,
    pub quic_max_streams: Option<usize>,
    pub quic_worker_pool_size: Option<usize>,
    pub grpc_max_streams: Option<usize>,
    pub grpc_max_connections: Option<usize>,
    pub https_max_connections: Option<usize>,
    pub https3_max_streams: Option<usize>,
}

impl TransportLimits {
    pub fn quic_max_streams(&self) -> usize {
        self.quic_max_streams.unwrap_or(256)
    }

    pub fn quic_worker_pool_size(&self) -> usize {
        self.quic_worker_pool_size
            .unwrap_or_else(|| 4 * self.quic_max_streams())
    }

    pub fn https_max_connections(&self) -> usize {
        self.https_max_connections.unwrap_or(200)
    }

    pub fn https3_max_streams(&self) -> usize {
        self.https3_max_streams.unwrap_or(256)
    }
}

/// A lifecycle callback registered by a directive's setup routine:
/// `on-startup`, `on-restart`, `on-restart-failed`, `on-shutdown`,
/// `on-final-shutdown`.
pub type LifecycleHook = Arc<dyn Fn() -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default, Clone)]
pub struct LifecycleHooks {
    pub on_startup: Vec<LifecycleHook>,
    pub on_startup_complete: Vec<LifecycleHook>,
    pub on_restart: Vec<LifecycleHook>,
    pub on_restart_failed: Vec<LifecycleHook>,
    pub on_shutdown: Vec<LifecycleHook>,
    pub on_final_shutdown: Vec<LifecycleHook>,
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("on_startup", &self.on_startup.len())
            .field("on_startup_complete", &self.on_startup_complete.len())
            .field("on_restart", &self.on_restart.len())
            .field("on_restart_failed", &self.on_restart_failed.len())
            .field("on_shutdown", &self.on_shutdown.len())
            .field("on_final_shutdown", &self.on_final_shutdown.len())
            .finish()
    }
}

/// A per-zone bundle produced by the config loader.
#[derive(Clone)]
pub struct ServerBlockConfig {
    pub zone_address: ZoneAddress,
    pub listen_hosts: Vec<String>,
    pub tls: Option<TlsMaterial>,
    pub debug: bool,
    pub stacktrace: bool,
    /// DoH path validator; `None` means the default `/dns-query`.
    pub http_validator: Option<String>,
    pub transport_limits: TransportLimits,
    pub chain_builders: Vec<(String, ChainBuilder)>,
    pub hooks: LifecycleHooks,
    pub source_line: usize,
}

impl ServerBlockConfig {
    pub fn new(zone_address: ZoneAddress, source_line: usize) -> Self {
        ServerBlockConfig {
            zone_address,
            listen_hosts: Vec::new(),
            tls: None,
            debug: false,
            stacktrace: false,
            http_validator: None,
            transport_limits: TransportLimits::default(),
            chain_builders: Vec::new(),
            hooks: LifecycleHooks::default(),
            source_line,
        }
    }

    pub fn http_path(&self) -> &str {
        self.http_validator.as_deref().unwrap_or("/dns-query")
    }

    /// Materialise this block's plugin chain by applying its chain-builders,
    /// in directive order, over a terminal no-next handler.
    pub fn build_chain(&self) -> Chain {
        let builders: Vec<ChainBuilder> =
            self.chain_builders.iter().map(|(_, b)| b.clone()).collect();
        Chain::build(&builders)
    }

    pub fn plugin_names(&self) -> impl Iterator<Item = &str> {
        self.chain_builders.iter().map(|(n, _)| n.as_str())
    }
}
