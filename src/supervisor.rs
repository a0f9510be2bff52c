// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Lifecycle supervisor: binds every listener group, runs the
//! `on-startup`/`on-startup-complete` hooks, and owns graceful shutdown and
//! reload.
//!
//! A reload never rebinds a socket whose listener key is unchanged: each
//! listener's routing table lives behind an [`arc_swap::ArcSwap`] reachable
//! through [`crate::transport::ListenerHandle`], so swapping it only
//! affects requests that haven't already grabbed a snapshot.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::block::{LifecycleHook, ServerBlockConfig, TlsMaterial};
use crate::error::ListenError;
use crate::listener::{group, ListenerGroup, RoutingTable};
use crate::socket;
use crate::tls_config;
use crate::transport::{grpc, https, https3, quic, tls, udp_tcp, ListenerHandle};
use crate::zone_address::Transport;

/// One bound listener: its cancellation scope, the tracker that every
/// accept-loop and per-request task spawned for it runs through, and the
/// routing table handle a reload can swap.
struct RunningListener {
    listener_key: String,
    cancel: CancellationToken,
    tracker: TaskTracker,
    table: Arc<ArcSwap<RoutingTable>>,
}

/// The running server: every bound listener plus the lifecycle hooks
/// collected from the server blocks that produced them.
pub struct Supervisor {
    listeners: Vec<RunningListener>,
    on_shutdown: Vec<LifecycleHook>,
    on_final_shutdown: Vec<LifecycleHook>,
    on_restart: Vec<LifecycleHook>,
    on_restart_failed: Vec<LifecycleHook>,
}

impl Supervisor {
    /// Listener keys currently bound, in bind order. Used by operators
    /// inspecting a running process and by tests asserting fan-out counts.
    pub fn listener_keys(&self) -> Vec<&str> {
        self.listeners.iter().map(|l| l.listener_key.as_str()).collect()
    }

    /// Tasks currently tracked across every listener: the accept loops
    /// (`multisocket` fan-out times sockets per worker) plus any in-flight
    /// per-connection/per-request task spawned while handling traffic.
    pub fn task_count(&self) -> usize {
        self.listeners.iter().map(|l| l.tracker.len()).sum()
    }

    /// Bind every listener group and run their `on-startup`/
    /// `on-startup-complete` hooks. Returns once every listener has bound
    /// successfully and is accepting; a bind failure anywhere aborts the
    /// whole startup (nothing partial is left running).
    pub async fn start(blocks: Vec<ServerBlockConfig>) -> Result<Supervisor, ListenError> {
        run_hooks(blocks.iter().flat_map(|b| b.hooks.on_startup.iter())).await;

        let groups = group(blocks.clone())?;
        let mut listeners = Vec::with_capacity(groups.len());
        for group in groups {
            listeners.push(bind_group(group).await?);
        }

        run_hooks(blocks.iter().flat_map(|b| b.hooks.on_startup_complete.iter())).await;
        for listener in &listeners {
            info!(listener = %listener.listener_key, "listening");
        }

        Ok(Supervisor {
            listeners,
            on_shutdown: blocks.iter().flat_map(|b| b.hooks.on_shutdown.iter().cloned()).collect(),
            on_final_shutdown: blocks
                .iter()
                .flat_map(|b| b.hooks.on_final_shutdown.iter().cloned())
                .collect(),
            on_restart: blocks.iter().flat_map(|b| b.hooks.on_restart.iter().cloned()).collect(),
            on_restart_failed: blocks
                .iter()
                .flat_map(|b| b.hooks.on_restart_failed.iter().cloned())
                .collect(),
        })
    }

    /// Stop accepting new connections, cancel every in-flight request's
    /// context, and wait up to `grace_timeout` for the accept loops and
    /// every task they spawned to finish. Returns `Err` ("deadline-exceeded")
    /// if the grace period elapses with tasks still running; those tasks
    /// are abandoned (not awaited further) rather than forcibly killed,
    /// since Tokio has no API to interrupt a task that isn't observing its
    /// cancellation token.
    pub async fn shutdown(self, grace_timeout: Duration) -> Result<(), ShutdownError> {
        run_hooks(self.on_shutdown.iter()).await;
        let result = RunningListeners(self.listeners).shutdown(grace_timeout).await;
        run_hooks(self.on_final_shutdown.iter()).await;
        result
    }

    /// Reload: reparse and regroup the new configuration, then reconcile
    /// against the listeners already running. A listener whose key is
    /// unchanged keeps its socket and accept-loop tasks; only its routing
    /// table is swapped via [`ArcSwap::store`], so in-flight requests that
    /// already took a snapshot via [`ListenerHandle::routes`] finish on the
    /// old chain while anything arriving after the swap runs the new one.
    /// Listener keys that disappeared are shut down; listener keys that are
    /// new are bound fresh. If the new Corefile fails to parse or a new
    /// listener fails to bind, the current configuration keeps running and
    /// `on-restart-failed` hooks run instead.
    pub async fn reload(mut self, new_blocks: Vec<ServerBlockConfig>) -> Supervisor {
        let new_groups = match group(new_blocks.clone()) {
            Ok(groups) => groups,
            Err(e) => {
                error!(error = %e, "reload failed to parse the new configuration, keeping current listeners");
                run_hooks(self.on_restart_failed.iter()).await;
                return self;
            }
        };

        let mut reused = Vec::with_capacity(new_groups.len());
        for new_group in new_groups {
            match self
                .listeners
                .iter()
                .position(|l| l.listener_key == new_group.listener_key)
            {
                Some(index) => {
                    let listener = self.listeners.remove(index);
                    listener.table.store(Arc::new(new_group.routing_table));
                    reused.push(listener);
                }
                None => match bind_group(new_group).await {
                    Ok(listener) => reused.push(listener),
                    Err(e) => {
                        error!(error = %e, "reload failed to bind a new listener, keeping current listeners");
                        self.listeners.extend(reused);
                        run_hooks(self.on_restart_failed.iter()).await;
                        return self;
                    }
                },
            }
        }

        // whatever is left in self.listeners had no counterpart in the new
        // config: its listener key was dropped, so it is torn down.
        let retired = RunningListeners(std::mem::take(&mut self.listeners));
        let grace = Duration::from_secs(5);
        let _ = retired.shutdown(grace).await;

        run_hooks(new_blocks.iter().flat_map(|b| b.hooks.on_restart.iter())).await;

        Supervisor {
            listeners: reused,
            on_shutdown: new_blocks.iter().flat_map(|b| b.hooks.on_shutdown.iter().cloned()).collect(),
            on_final_shutdown: new_blocks
                .iter()
                .flat_map(|b| b.hooks.on_final_shutdown.iter().cloned())
                .collect(),
            on_restart: new_blocks.iter().flat_map(|b| b.hooks.on_restart.iter().cloned()).collect(),
            on_restart_failed: new_blocks
                .iter()
                .flat_map(|b| b.hooks.on_restart_failed.iter().cloned())
                .collect(),
        }
    }
}

/// A bag of listeners with no further lifecycle hooks attached, used only
/// to drain the retired half of a reload through the same shutdown path
/// `Supervisor` uses for a full stop.
struct RunningListeners(Vec<RunningListener>);

impl RunningListeners {
    async fn shutdown(self, grace_timeout: Duration) -> Result<(), ShutdownError> {
        for listener in &self.0 {
            listener.cancel.cancel();
            listener.tracker.close();
        }
        let waits = self.0.iter().map(|l| l.tracker.wait());
        match tokio::time::timeout(grace_timeout, futures::future::join_all(waits)).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(?grace_timeout, "graceful shutdown grace period elapsed, abandoning remaining tasks");
                Err(ShutdownError::DeadlineExceeded)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("graceful shutdown deadline exceeded")]
    DeadlineExceeded,
}

async fn run_hooks<'a>(hooks: impl Iterator<Item = &'a LifecycleHook>) {
    for hook in hooks {
        hook().await;
    }
}

fn multisocket_count(group: &ListenerGroup) -> usize {
    group
        .blocks
        .iter()
        .filter_map(|b| b.transport_limits.multisocket)
        .max()
        .unwrap_or_else(num_cpus::get)
}

fn shared_tls_material(group: &ListenerGroup) -> Option<&TlsMaterial> {
    group.blocks.iter().find_map(|b| b.tls.as_ref())
}

fn listen_addr(group: &ListenerGroup) -> Result<SocketAddr, ListenError> {
    format!("{}:{}", group.listen_host, group.port)
        .parse()
        .map_err(|_| ListenError::Tls(format!("invalid listen address {}:{}", group.listen_host, group.port)))
}

async fn bind_group(group: ListenerGroup) -> Result<RunningListener, ListenError> {
    let listener_key = group.listener_key.clone();
    let cancel = CancellationToken::new();
    let table = Arc::new(ArcSwap::new(Arc::new(group.routing_table)));
    let stacktrace = group.blocks.iter().any(|b| b.stacktrace);
    let addr = listen_addr(&group)?;
    let fan_out = multisocket_count(&group);
    let tracker = TaskTracker::new();

    match group.transport {
        Transport::Dns => {
            for _ in 0..fan_out {
                let handle = make_handle(&table, &listener_key, stacktrace, &cancel, &tracker);
                let udp = socket::build_udp_socket(addr)?;
                tracker.spawn(udp_tcp::serve_udp(udp, handle.clone()));
                let tcp = socket::build_tcp_listener(addr)?;
                tracker.spawn(udp_tcp::serve_tcp(tcp, handle, None));
            }
        }
        Transport::Tls => {
            let material = shared_tls_material(&group)
                .ok_or_else(|| ListenError::Tls(format!("{listener_key}: tls transport requires a tls directive")))?;
            let tls_config = tls_config::server_config_with_alpn(material, &[b"dot"])?;
            let acceptor = TlsAcceptor::from(tls_config);
            for _ in 0..fan_out {
                let handle = make_handle(&table, &listener_key, stacktrace, &cancel, &tracker);
                let tcp = socket::build_tcp_listener(addr)?;
                tracker.spawn(tls::serve_tls(tcp, acceptor.clone(), handle, None));
            }
        }
        Transport::Quic => {
            let material = shared_tls_material(&group)
                .ok_or_else(|| ListenError::Tls(format!("{listener_key}: quic transport requires a tls directive")))?;
            let tls_config = tls_config::server_config_with_alpn(material, &[b"doq"])?;
            let server_config = quic::build_server_config(tls_config)?;
            let max_streams = group
                .blocks
                .iter()
                .map(|b| b.transport_limits.quic_max_streams())
                .max()
                .unwrap_or(256);
            let worker_pool_size = group
                .blocks
                .iter()
                .map(|b| b.transport_limits.quic_worker_pool_size())
                .max()
                .unwrap_or(4 * max_streams);
            for _ in 0..fan_out {
                let handle = make_handle(&table, &listener_key, stacktrace, &cancel, &tracker);
                let endpoint = build_quic_endpoint(addr, server_config.clone())?;
                tracker.spawn(quic::serve_quic(endpoint, handle, max_streams, worker_pool_size));
            }
        }
        Transport::Https => {
            let material = shared_tls_material(&group)
                .ok_or_else(|| ListenError::Tls(format!("{listener_key}: https transport requires a tls directive")))?;
            let tls_config = tls_config::server_config_with_alpn(material, &[b"h2", b"http/1.1"])?;
            let acceptor = TlsAcceptor::from(tls_config);
            let path = group
                .blocks
                .first()
                .map(|b| b.http_path().to_string())
                .unwrap_or_else(|| "/dns-query".to_string());
            let max_connections = group
                .blocks
                .iter()
                .map(|b| b.transport_limits.https_max_connections())
                .max();
            for _ in 0..fan_out {
                let handle = make_handle(&table, &listener_key, stacktrace, &cancel, &tracker);
                let tcp = socket::build_tcp_listener(addr)?;
                tracker.spawn(https::serve_https(
                    tcp,
                    acceptor.clone(),
                    handle,
                    path.clone(),
                    max_connections,
                ));
            }
        }
        Transport::Https3 => {
            let material = shared_tls_material(&group)
                .ok_or_else(|| ListenError::Tls(format!("{listener_key}: https3 transport requires a tls directive")))?;
            let tls_config = tls_config::server_config_with_alpn(material, &[b"h3"])?;
            let server_config = quic::build_server_config(tls_config)?;
            let max_streams = group
                .blocks
                .iter()
                .map(|b| b.transport_limits.https3_max_streams())
                .max()
                .unwrap_or(256);
            for _ in 0..fan_out {
                let handle = make_handle(&table, &listener_key, stacktrace, &cancel, &tracker);
                let endpoint = build_quic_endpoint(addr, server_config.clone())?;
                tracker.spawn(https3::serve_https3(endpoint, handle, max_streams));
            }
        }
        Transport::Grpc => {
            let material = shared_tls_material(&group)
                .ok_or_else(|| ListenError::Tls(format!("{listener_key}: grpc transport requires a tls directive")))?
                .clone();
            let max_streams = group.blocks.iter().filter_map(|b| b.transport_limits.grpc_max_streams).max();
            let max_connections =
                group.blocks.iter().filter_map(|b| b.transport_limits.grpc_max_connections).max();
            for _ in 0..fan_out {
                let handle = make_handle(&table, &listener_key, stacktrace, &cancel, &tracker);
                let tcp = socket::build_tcp_listener(addr)?;
                let material = material.clone();
                tracker.spawn(async move {
                    if let Err(e) = grpc::serve_grpc(tcp, handle, &material, max_streams, max_connections).await {
                        error!(error = %e, "grpc listener exited with an error");
                    }
                });
            }
        }
    }

    Ok(RunningListener {
        listener_key,
        cancel,
        tracker,
        table,
    })
}

fn make_handle(
    table: &Arc<ArcSwap<RoutingTable>>,
    listener_key: &str,
    stacktrace: bool,
    cancel: &CancellationToken,
    tracker: &TaskTracker,
) -> ListenerHandle {
    ListenerHandle {
        table: table.clone(),
        listener_key: listener_key.to_string(),
        stacktrace,
        cancel: cancel.clone(),
        tracker: tracker.clone(),
    }
}

fn build_quic_endpoint(
    addr: SocketAddr,
    server_config: quinn::ServerConfig,
) -> Result<quinn::Endpoint, ListenError> {
    let socket = socket::build_std_udp_socket(addr)?;
    let runtime = quinn::default_runtime()
        .ok_or_else(|| ListenError::Quic("no compatible async runtime found for quic".to_string()))?;
    quinn::Endpoint::new(quinn::EndpointConfig::default(), Some(server_config), socket, runtime)
        .map_err(|e| ListenError::Quic(e.to_string()))
}
