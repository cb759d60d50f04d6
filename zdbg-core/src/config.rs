//! Backend selection.
//!
//! A configuration file is a JSON object tagged with the backend name:
//!
//! ```json
//! { "backend": "mame", "host": "localhost", "port": 12000 }
//! ```

use crate::memory::MemoryModel;
use crate::remote::simulator::DEFAULT_DMA_PORT;
use crate::remote::{dzrp, mame, zesarux};
use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_host() -> String {
    "localhost".to_string()
}

const fn default_zesarux_port() -> u16 {
    zesarux::DEFAULT_PORT
}

const fn default_mame_port() -> u16 {
    mame::DEFAULT_PORT
}

const fn default_dzrp_port() -> u16 {
    dzrp::DEFAULT_PORT
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum RemoteConfig {
    /// ASCII status protocol of the ZEsarUX emulator.
    Zesarux {
        #[serde(default = "default_host")]
        host: String,
        #[serde(default = "default_zesarux_port")]
        port: u16,
        /// Paging scheme of the emulated machine, used to decode slots.
        #[serde(default)]
        memory_model: MemoryModel,
    },
    /// MAME gdbstub.
    Mame {
        #[serde(default = "default_host")]
        host: String,
        #[serde(default = "default_mame_port")]
        port: u16,
    },
    /// DeZog Remote Protocol.
    Dzrp {
        #[serde(default = "default_host")]
        host: String,
        #[serde(default = "default_dzrp_port")]
        port: u16,
    },
    Simulator(SimulatorConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub memory_model: MemoryModel,
    pub dma_port: u16,
    /// Raw binary loaded at `load_address` on connect.
    pub program: Option<PathBuf>,
    pub load_address: u16,
    /// Initial PC, `load_address` when absent.
    pub entry: Option<u16>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            memory_model: MemoryModel::Unknown,
            dma_port: DEFAULT_DMA_PORT,
            program: None,
            load_address: 0x8000,
            entry: None,
        }
    }
}

impl RemoteConfig {
    /// Default configuration for a backend name, as used on the command line.
    pub fn for_backend(name: &str) -> Option<Self> {
        let host = default_host();
        match name {
            "zesarux" => Some(Self::Zesarux { host, port: zesarux::DEFAULT_PORT, memory_model: MemoryModel::Unknown }),
            "mame" => Some(Self::Mame { host, port: mame::DEFAULT_PORT }),
            "dzrp" => Some(Self::Dzrp { host, port: dzrp::DEFAULT_PORT }),
            "simulator" => Some(Self::Simulator(SimulatorConfig::default())),
            _ => None,
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Invalid backend configuration")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Override the endpoint of a network backend. The simulator ignores it.
    pub fn with_endpoint(mut self, new_host: Option<String>, new_port: Option<u16>) -> Self {
        match &mut self {
            Self::Zesarux { host, port, .. } | Self::Mame { host, port } | Self::Dzrp { host, port } => {
                if let Some(new_host) = new_host {
                    *host = new_host;
                }
                if let Some(new_port) = new_port {
                    *port = new_port;
                }
            }
            Self::Simulator(_) => {}
        }
        self
    }
}
