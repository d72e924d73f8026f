//! Mining worker and in-process testnet

use qpow_consensus::constants::TRIVIAL_BITS;
use qpow_consensus::{default_genesis, ChainManager, ConsensusParams, Transaction};
use qpow_network::{NetworkConfig, Node};
use qpow_node::{MinerKind, MiningOutcome, MiningSettings, MiningWorker, Testnet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

fn trivial_node(id: &str) -> Arc<Node> {
    let mut chain = ChainManager::new(ConsensusParams::testnet());
    chain.initialize(default_genesis(TRIVIAL_BITS).unwrap()).unwrap();
    let config = NetworkConfig {
        node_id: id.to_string(),
        port: 0,
        shutdown_grace_ms: 200,
        ..NetworkConfig::default()
    };
    Arc::new(Node::new(config, Arc::new(RwLock::new(chain))))
}

fn mining(miner: MinerKind) -> MiningSettings {
    MiningSettings {
        enabled: true,
        miner,
        max_iterations: 5_000,
        time_limit_ms: 5_000,
        ..MiningSettings::default()
    }
}

#[tokio::test]
async fn test_worker_admits_block_and_clears_pool() {
    let node = trivial_node("m");
    let tx = Transaction::new("alice", "bob", 2.5, vec![7; 8]).with_nonce(1);
    let txid = node.pool().write().await.add_transaction(tx.clone()).unwrap();

    let worker = MiningWorker::new(Arc::clone(&node), mining(MinerKind::Enumeration), "m");
    let outcome = worker.mine_once(0).await.unwrap();
    assert!(matches!(outcome, MiningOutcome::Admitted { height: 1, .. }));

    let chain = node.chain().read().await;
    assert_eq!(chain.length(), 2);
    let head = chain.latest().unwrap();
    assert!(head.transactions[0].is_coinbase());
    assert_eq!(head.transactions[0].recipient, "m");
    assert_eq!(head.transactions[1], tx);
    drop(chain);

    assert!(!node.pool().read().await.contains(&txid));
    let stats = worker.stats().await;
    assert_eq!(stats.attempts, 1);
    assert_eq!(stats.admitted, 1);
}

#[tokio::test]
async fn test_mcts_worker_extends_chain() {
    let node = trivial_node("m");
    let worker = MiningWorker::new(Arc::clone(&node), mining(MinerKind::Mcts), "m");
    for attempt in 0..3 {
        let outcome = worker.mine_once(attempt).await.unwrap();
        assert!(matches!(outcome, MiningOutcome::Admitted { .. }), "{outcome:?}");
    }
    assert_eq!(node.chain().read().await.length(), 4);
}

#[tokio::test]
async fn test_stopped_worker_exhausts_immediately() {
    let node = trivial_node("m");
    let worker = MiningWorker::new(Arc::clone(&node), mining(MinerKind::Enumeration), "m");
    worker.stop();
    assert!(!worker.is_running());

    // The first hash may still meet the trivial target
    let outcome = worker.mine_once(0).await.unwrap();
    match outcome {
        MiningOutcome::Exhausted { iterations } => assert!(iterations <= 1),
        MiningOutcome::Admitted { .. } => {}
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn test_testnet_converges_on_one_chain() {
    let testnet = Testnet::start(3, |index, mut settings| {
        settings.genesis_bits = Some(TRIVIAL_BITS);
        settings.network.shutdown_grace_ms = 200;
        settings.mining = MiningSettings {
            enabled: index == 0,
            ..mining(MinerKind::Mcts)
        };
        settings
    })
    .await
    .unwrap();

    assert!(testnet.wait_for_height(3, Duration::from_secs(30)).await);
    testnet.nodes()[0].miner().unwrap().stop();

    // Let the last propagated block land everywhere
    let mut converged = false;
    for _ in 0..100 {
        if testnet.converged().await {
            converged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(converged, "heights {:?}", testnet.heights().await);
    testnet.shutdown().await.unwrap();
}
