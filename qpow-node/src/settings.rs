//! Node configuration file and its defaults

use crate::{NodeError, Result};
use qpow_consensus::ConsensusParams;
use qpow_miner::{EnumerationMiner, MctsConfig, MctsMiner, Miner, MiningBudget};
use qpow_network::NetworkConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// File name of the configuration inside the data directory
pub const CONFIG_FILE: &str = "config.toml";

/// File name of the chain snapshot inside the data directory
pub const SNAPSHOT_FILE: &str = "chain.qpow";

/// `~/.local/share/qpow-node` or the platform equivalent
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("qpow-node")
}

/// Random node id of the form `node-1a2b3c4d`
pub fn generate_node_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("node-{}", &id[..8])
}

/// A peer given as `node_id@host:port`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub node_id: String,
    pub host: String,
    pub port: u16,
}

impl FromStr for PeerAddress {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || NodeError::Config(format!("peer {s:?} is not of the form id@host:port"));
        let (node_id, address) = s.split_once('@').ok_or_else(invalid)?;
        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse().map_err(|_| invalid())?;
        if node_id.is_empty() || host.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            node_id: node_id.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.node_id, self.host, self.port)
    }
}

/// Which search strategy the worker runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinerKind {
    Mcts,
    Enumeration,
}

/// Mining worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningSettings {
    pub enabled: bool,

    pub miner: MinerKind,

    /// Hash evaluations per attempt
    pub max_iterations: u64,

    /// Wall-clock limit per attempt (milliseconds)
    pub time_limit_ms: u64,

    /// Pooled transactions included per candidate
    pub max_transactions: usize,

    /// Reward recipient; defaults to the node id
    pub reward_address: Option<String>,

    pub mcts: MctsConfig,
}

impl Default for MiningSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            miner: MinerKind::Mcts,
            max_iterations: 10_000,
            time_limit_ms: 10_000,
            max_transactions: 100,
            reward_address: None,
            mcts: MctsConfig::default(),
        }
    }
}

impl MiningSettings {
    /// Budget for one mining attempt
    pub fn budget(&self) -> MiningBudget {
        MiningBudget::new(self.max_iterations, Duration::from_millis(self.time_limit_ms))
    }

    /// Fresh miner for one attempt; `attempt` perturbs the MCTS seed
    pub fn build_miner(&self, attempt: u64) -> Box<dyn Miner> {
        match self.miner {
            MinerKind::Mcts => Box::new(MctsMiner::new(MctsConfig {
                seed: self.mcts.seed.wrapping_add(attempt),
                ..self.mcts.clone()
            })),
            MinerKind::Enumeration => Box::new(EnumerationMiner::new()),
        }
    }
}

/// Everything a node process needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub network: NetworkConfig,

    /// Initial peers as `id@host:port`
    pub peers: Vec<String>,

    /// Where the snapshot lives; `None` keeps the chain in memory
    pub data_dir: Option<PathBuf>,

    /// Compact bits of the genesis block; defaults to the initial PoW target
    pub genesis_bits: Option<u32>,

    pub mining: MiningSettings,

    pub consensus: ConsensusParams,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            network: NetworkConfig {
                node_id: generate_node_id(),
                ..NetworkConfig::default()
            },
            peers: Vec::new(),
            data_dir: Some(default_data_dir()),
            genesis_bits: None,
            mining: MiningSettings::default(),
            consensus: ConsensusParams::default(),
        }
    }
}

impl NodeSettings {
    /// Settings for an in-memory node on a loopback testnet
    pub fn testnet(node_id: impl Into<String>) -> Self {
        Self {
            network: NetworkConfig {
                node_id: node_id.into(),
                port: 0,
                ..NetworkConfig::default()
            },
            data_dir: None,
            consensus: ConsensusParams::testnet(),
            ..Self::default()
        }
    }

    /// Read settings from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| NodeError::Config(format!("{}: {e}", path.display())))
    }

    /// Write settings as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| NodeError::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn genesis_bits(&self) -> u32 {
        self.genesis_bits.unwrap_or_else(|| self.consensus.initial_bits())
    }

    pub fn parsed_peers(&self) -> Result<Vec<PeerAddress>> {
        self.peers.iter().map(|p| p.parse()).collect()
    }

    /// Chain snapshot location inside the data directory
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(SNAPSHOT_FILE))
    }

    pub fn reward_address(&self) -> String {
        self.mining
            .reward_address
            .clone()
            .unwrap_or_else(|| self.network.node_id.clone())
    }

    /// Reject settings the node cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.network.node_id.is_empty() {
            return Err(NodeError::Config("node_id must not be empty".to_string()));
        }
        if self.consensus.retarget_window == 0 {
            return Err(NodeError::Config("retarget_window must be positive".to_string()));
        }
        if self.mining.enabled && self.mining.max_iterations == 0 {
            return Err(NodeError::Config("mining needs a positive iteration budget".to_string()));
        }
        self.parsed_peers()?;
        Ok(())
    }
}
