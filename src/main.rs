// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The `flexdns` binary: parses CLI args, loads a Corefile, and runs the
//! lifecycle supervisor until a stop signal.

use std::time::Duration;

use flexdns::cli::Cli;
use flexdns::config::{load, read_corefile, PluginRegistry};
use flexdns::listener::group;
use flexdns::logging;
use flexdns::supervisor::Supervisor;

use clap::Parser;
use tokio::runtime;
use tracing::info;

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Main method for running flexdns.
fn main() -> Result<(), String> {
    // this is essential for custom formatting the returned error message.
    // the displayed message of a terminating impl trait is not pretty.
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> Result<(), String> {
    let args = Cli::parse();

    logging::init(args.quiet, args.debug)?;

    info!("flexdns {} starting...", env!("CARGO_PKG_VERSION"));

    let mut runtime = runtime::Builder::new_multi_thread();
    runtime.enable_all().thread_name("flexdns-runtime");
    if let Some(workers) = args.workers {
        runtime.worker_threads(workers);
    }
    let runtime = runtime
        .build()
        .map_err(|err| format!("failed to initialize Tokio runtime: {err}"))?;

    runtime.block_on(async_run(args))
}

async fn async_run(args: Cli) -> Result<(), String> {
    info!("loading configuration from: {:?}", args.config);

    let source = read_corefile(&args.config).map_err(|e| e.to_string())?;
    let blocks = load(&source, PluginRegistry::with_builtins()).map_err(|e| e.to_string())?;

    if args.validate {
        group(blocks).map_err(|e| e.to_string())?;
        info!("configuration OK");
        return Ok(());
    }

    let supervisor = Supervisor::start(blocks).await.map_err(|e| e.to_string())?;

    banner();

    wait_for_stop_signal().await;
    info!("stop signal received, shutting down");

    if supervisor.shutdown(DEFAULT_SHUTDOWN_GRACE).await.is_err() {
        return Err("graceful shutdown deadline exceeded".to_string());
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_stop_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut interrupt = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = terminate.recv() => {}
        _ = interrupt.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_stop_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn banner() {
    const LOGO: &str = "flexdns";

    info!("");
    for line in LOGO.lines() {
        info!(" {line}");
    }
    info!("");
}
