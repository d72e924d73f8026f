//! A running node: chain, network listener and optional miner

use crate::settings::NodeSettings;
use crate::worker::MiningWorker;
use crate::{NodeError, Result};
use qpow_consensus::{default_genesis, ChainManager};
use qpow_network::Node;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct NodeRuntime {
    settings: NodeSettings,
    node: Arc<Node>,
    address: SocketAddr,
    miner: Option<(Arc<MiningWorker>, JoinHandle<()>)>,
}

impl NodeRuntime {
    /// Restore or create the chain, start listening, add peers and miner
    pub async fn start(settings: NodeSettings) -> Result<Self> {
        settings.validate()?;
        let chain = load_chain(&settings)?;
        info!(
            node = %settings.network.node_id,
            height = chain.length().saturating_sub(1),
            "Chain ready"
        );

        let node = Arc::new(Node::new(settings.network.clone(), Arc::new(RwLock::new(chain))));
        let address = node.start().await?;

        for peer in settings.parsed_peers()? {
            node.connect_to_peer(peer.node_id, peer.host, peer.port).await;
        }

        let miner = if settings.mining.enabled {
            let worker = Arc::new(MiningWorker::new(
                Arc::clone(&node),
                settings.mining.clone(),
                settings.reward_address(),
            ));
            let handle = worker.spawn();
            Some((worker, handle))
        } else {
            None
        };

        Ok(Self {
            settings,
            node,
            address,
            miner,
        })
    }

    /// Network node of this runtime
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    /// Bound listener address
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Mining worker, when mining is enabled
    pub fn miner(&self) -> Option<&Arc<MiningWorker>> {
        self.miner.as_ref().map(|(worker, _)| worker)
    }

    /// Height of the current head
    pub async fn height(&self) -> u64 {
        self.node.chain().read().await.length().saturating_sub(1) as u64
    }

    /// Stop mining, close the network and persist the chain
    pub async fn stop(mut self) -> Result<()> {
        if let Some((worker, handle)) = self.miner.take() {
            worker.stop();
            if let Err(e) = handle.await {
                warn!(error = %e, "Mining task ended abnormally");
            }
        }
        self.node.shutdown().await;

        if let Some(path) = self.settings.snapshot_path() {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            self.node.chain().read().await.save_snapshot(&path)?;
        }
        Ok(())
    }
}

/// Snapshot from the data directory if one exists, else a fresh genesis
fn load_chain(settings: &NodeSettings) -> Result<ChainManager> {
    if let Some(path) = settings.snapshot_path().filter(|p| p.exists()) {
        info!(path = %path.display(), "Loading chain snapshot");
        return ChainManager::load_snapshot(&path, settings.consensus.clone()).map_err(|e| {
            NodeError::Config(format!("cannot restore {}: {e}", path.display()))
        });
    }

    let mut chain = ChainManager::new(settings.consensus.clone());
    chain.initialize(default_genesis(settings.genesis_bits())?)?;
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qpow_consensus::constants::TRIVIAL_BITS;

    fn settings(dir: &std::path::Path) -> NodeSettings {
        let mut settings = NodeSettings::testnet("solo");
        settings.data_dir = Some(dir.to_path_buf());
        settings.genesis_bits = Some(TRIVIAL_BITS);
        settings
    }

    #[tokio::test]
    async fn test_fresh_start_uses_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = NodeRuntime::start(settings(dir.path())).await.unwrap();
        assert_eq!(runtime.height().await, 0);
        assert!(runtime.miner().is_none());
        assert_ne!(runtime.address().port(), 0);
        runtime.stop().await.unwrap();
        assert!(dir.path().join(crate::settings::SNAPSHOT_FILE).exists());
    }

    #[tokio::test]
    async fn test_restart_restores_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = NodeRuntime::start(settings(dir.path())).await.unwrap();
        {
            let mut chain = runtime.node().chain().write().await;
            let mut block = chain.candidate("solo", vec![]).unwrap();
            while !block.header.meets_target() {
                block.header.nonce += 1;
            }
            assert!(chain.add_block(block));
        }
        runtime.stop().await.unwrap();

        let runtime = NodeRuntime::start(settings(dir.path())).await.unwrap();
        assert_eq!(runtime.height().await, 1);
        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_settings_refused() {
        let mut bad = NodeSettings::testnet("x");
        bad.data_dir = None;
        bad.peers.push("missing-port@host".to_string());
        assert!(matches!(NodeRuntime::start(bad).await, Err(NodeError::Config(_))));
    }
}
