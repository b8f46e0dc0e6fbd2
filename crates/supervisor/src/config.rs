//! Startup configuration: the supervisor config file (§6) and the
//! base64-encoded runtime config passed through `ENCORE_RUNTIME_CONFIG`.
use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use clap::Parser;
use serde::Deserialize;
use supervisor_config::SupervisorConfig;

pub const RUNTIME_CONFIG_ENV: &str = "ENCORE_RUNTIME_CONFIG";
pub const LISTEN_ADDR_ENV: &str = "ENCORE_LISTEN_ADDR";
pub const PORT_ENV: &str = "PORT";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
/// Port assigned to the first supervised proc; subsequent procs get
/// `BASE_PORT + index`.
pub const BASE_PORT: u16 = 12000;

#[derive(Debug, Parser)]
#[clap(about, long_about = None, version)]
pub struct Args {
    /// Path to the supervisor configuration JSON written by the image
    /// builder.
    #[clap(short = 'c', long = "config")]
    pub config: PathBuf,
}

/// The subset of the runtime configuration this supervisor actually reads:
/// which log field names to use. The full runtime config is an opaque,
/// serialized blob produced upstream; this core only needs to know how to
/// format its own logs for the target cloud provider.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub log_config: LogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    /// Certain cloud log collectors expect `severity`/`time` instead of
    /// the default `level`/`timestamp` field names.
    #[serde(default)]
    pub cloud_provider: Option<String>,
}

impl LogConfig {
    pub fn uses_alternate_field_names(&self) -> bool {
        matches!(self.cloud_provider.as_deref(), Some("gcp"))
    }
}

pub fn load_supervisor_config(path: &std::path::Path) -> Result<SupervisorConfig> {
    let bytes =
        std::fs::read(path).with_context(|| format!("read supervisor config {}", path.display()))?;
    SupervisorConfig::from_json(&bytes)
        .with_context(|| format!("parse supervisor config {}", path.display()))
}

/// Reads and decodes `ENCORE_RUNTIME_CONFIG`, then unsets it so it isn't
/// inherited by any child process this supervisor spawns.
pub fn load_runtime_config() -> Result<RuntimeConfig> {
    let encoded = std::env::var(RUNTIME_CONFIG_ENV)
        .with_context(|| format!("{RUNTIME_CONFIG_ENV} is not set"))?;
    std::env::remove_var(RUNTIME_CONFIG_ENV);

    let decoded = STANDARD
        .decode(encoded)
        .context("base64-decode runtime config")?;
    if decoded.is_empty() {
        return Ok(RuntimeConfig::default());
    }
    serde_json::from_slice(&decoded).context("parse runtime config JSON")
}

/// Resolves the fronting proxy's listen address: `ENCORE_LISTEN_ADDR` if
/// set, else `PORT` (as `0.0.0.0:<port>`), else the default.
pub fn listen_addr() -> String {
    if let Ok(addr) = std::env::var(LISTEN_ADDR_ENV) {
        return addr;
    }
    if let Ok(port) = std::env::var(PORT_ENV) {
        return format!("0.0.0.0:{port}");
    }
    DEFAULT_LISTEN_ADDR.to_string()
}
