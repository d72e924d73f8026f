//! Several nodes in one process on loopback, fully meshed

use crate::runtime::NodeRuntime;
use crate::settings::NodeSettings;
use crate::Result;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::info;

/// How often height polling looks at the chains
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct Testnet {
    nodes: Vec<NodeRuntime>,
}

impl Testnet {
    /// Start `count` nodes built by `configure`, then introduce every pair
    ///
    /// `configure` receives the node index and its default testnet settings.
    pub async fn start<F>(count: usize, mut configure: F) -> Result<Self>
    where
        F: FnMut(usize, NodeSettings) -> NodeSettings,
    {
        let mut nodes = Vec::with_capacity(count);
        for index in 0..count {
            let settings = configure(index, NodeSettings::testnet(format!("node-{index}")));
            nodes.push(NodeRuntime::start(settings).await?);
        }

        for (i, a) in nodes.iter().enumerate() {
            for (j, b) in nodes.iter().enumerate() {
                if i != j {
                    let address = b.address();
                    a.node()
                        .connect_to_peer(b.node().node_id(), address.ip().to_string(), address.port())
                        .await;
                }
            }
        }
        info!(nodes = count, "Testnet up");
        Ok(Self { nodes })
    }

    /// `count` nodes where the first `miners` mine
    pub async fn with_miners(count: usize, miners: usize) -> Result<Self> {
        Self::start(count, |index, mut settings| {
            settings.mining.enabled = index < miners;
            settings
        })
        .await
    }

    pub fn nodes(&self) -> &[NodeRuntime] {
        &self.nodes
    }

    /// Head height of every node, in start order
    pub async fn heights(&self) -> Vec<u64> {
        let mut heights = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            heights.push(node.height().await);
        }
        heights
    }

    /// Wait until every node is at `height` or above; false on timeout
    pub async fn wait_for_height(&self, height: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.heights().await.iter().all(|h| *h >= height) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Whether every node has the same head block
    pub async fn converged(&self) -> bool {
        let mut heads = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            heads.push(node.node().chain().read().await.latest().map(|b| b.id()));
        }
        heads.windows(2).all(|pair| pair[0] == pair[1])
    }

    /// Stop every node and persist its chain
    pub async fn shutdown(self) -> Result<()> {
        for node in self.nodes {
            node.stop().await?;
        }
        Ok(())
    }
}
