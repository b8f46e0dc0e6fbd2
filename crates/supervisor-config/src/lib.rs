//! The JSON wire format shared between `packager`, which writes
//! `supervisor.config.json` into the image, and `supervisor`, which reads it
//! back at container startup. Kept as its own tiny crate, the way
//! `buildsys-config` keeps two binaries' idea of a format in sync, so the two
//! sides can never drift independently.
use serde::{Deserialize, Serialize};

/// One supervised OS process inside the container, bound to a unique port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Proc {
    pub id: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub gateways: Vec<String>,
}

/// Description of a gateway not hosted by any proc in the image, served
/// in-process by the supervisor instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoopGatewayDescription {
    pub name: String,
    #[serde(default)]
    pub routes: Vec<String>,
}

/// The full configuration written by the image builder and read by the
/// in-container supervisor binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub procs: Vec<Proc>,
    #[serde(default)]
    pub noop_gateways: std::collections::BTreeMap<String, NoopGatewayDescription>,
}

impl SupervisorConfig {
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }
}
