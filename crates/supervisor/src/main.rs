//! The in-container supervisor binary (§4.4): reads its config file and the
//! base64-encoded runtime config, launches one OS process per configured
//! proc on a deterministic port, restarts each with exponential backoff,
//! and exposes a single fronting HTTP listener that reverse-proxies to
//! whichever proc hosts a gateway.
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod config;
mod log_format;
mod proc;
mod proxy;

use config::{Args, LogConfig, BASE_PORT};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let runtime_config = config::load_runtime_config().context("load runtime config")?;
    init_logger(&runtime_config.log_config);

    let supervisor_config =
        config::load_supervisor_config(&args.config).context("load supervisor config")?;

    let ports: Vec<u16> = (0..supervisor_config.procs.len())
        .map(|i| BASE_PORT + i as u16)
        .collect();

    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);

    let mut proc_tasks = Vec::with_capacity(supervisor_config.procs.len());
    for (proc, port) in supervisor_config
        .procs
        .iter()
        .cloned()
        .zip(ports.iter().copied())
    {
        let state = Arc::new(proc::ProcState::default());
        proc_tasks.push(tokio::spawn(proc::run(
            proc,
            port,
            state,
            cancel_rx.clone(),
        )));
    }

    let target_port = proxy::first_gateway_host_port(&supervisor_config.procs, &ports);
    let listen_addr = config::listen_addr();
    let proxy_task = tokio::spawn(proxy::run(
        listen_addr,
        target_port,
        supervisor_config.noop_gateways,
        cancel_rx,
    ));

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping fronting proxy and proc supervision loops");
    let _ = cancel_tx.send(true);

    // Child processes are not explicitly terminated here; per the design
    // note in spec.md §9, this supervisor relies on the container runtime
    // killing the process group on container exit rather than sending
    // SIGTERM/SIGKILL itself.
    let _ = proxy_task.await;
    for task in proc_tasks {
        let _ = task.await;
    }

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Configures the root logger. Most cloud log collectors are happy with the
/// default `tracing_subscriber` JSON field names; GCP's expects
/// `severity`/`time` instead of `level`/`timestamp`, selected by the
/// runtime config (§4.4 "for certain cloud providers use alternate field
/// names").
fn init_logger(log_config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if log_config.uses_alternate_field_names() {
        tracing_subscriber::fmt()
            .event_format(log_format::CloudFieldNames)
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    }
}
