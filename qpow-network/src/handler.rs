//! Per-type message handlers

use crate::message::{decode_block, decode_transaction, Envelope, Message};
use crate::node::NodeContext;
use crate::{NetworkError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reacts to one message type; the returned envelope is sent back on the
/// connection the message arrived on
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &NodeContext, envelope: Envelope) -> Result<Option<Envelope>>;
}

/// `type -> handler`
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    /// Registry with no handlers
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the block, transaction and sync handlers
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Message::BLOCK, Arc::new(BlockHandler));
        registry.register(Message::TRANSACTION, Arc::new(TransactionHandler));
        registry.register(Message::GET_BLOCKS, Arc::new(GetBlocksHandler));
        registry.register(Message::GET_TRANSACTIONS, Arc::new(GetTransactionsHandler));
        registry.register(Message::CHAIN, Arc::new(ChainHandler));
        registry.register(Message::TRANSACTIONS, Arc::new(TransactionsHandler));
        registry
    }

    /// Install a handler, returning the one it replaces
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.insert(kind.into(), handler)
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(kind).cloned()
    }

    /// Registered types in sorted order
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

fn unexpected(expected: &str, got: &Message) -> NetworkError {
    NetworkError::Decode(format!("expected {expected} message, got {}", got.kind()))
}

/// Admits offered blocks and relays the ones that extend the head
pub struct BlockHandler;

#[async_trait]
impl MessageHandler for BlockHandler {
    async fn handle(&self, ctx: &NodeContext, envelope: Envelope) -> Result<Option<Envelope>> {
        let message = envelope.into_message()?;
        let Message::Block { block } = message else {
            return Err(unexpected(Message::BLOCK, &message));
        };
        let block = decode_block(&block)?;
        let id = hex::encode(block.id());

        if ctx.has_seen(&id).await {
            debug!(id = %id, "Dropping already seen block");
            return Ok(None);
        }

        let mut chain = ctx.chain().write().await;
        if chain.contains(&block.id()) {
            ctx.mark_seen(&id).await;
            return Ok(None);
        }

        // Only admitted blocks are remembered, so a tampered copy sharing the
        // header id cannot shadow the genuine block
        let outcome = chain.submit_block(block.clone());
        match outcome {
            Ok(()) => {
                let height = chain.length() - 1;
                drop(chain);
                ctx.mark_seen(&id).await;
                ctx.pool().write().await.remove_included(&block.transactions);
                info!(id = %id, height, "Accepted block from peer");
                ctx.broadcast(Message::block(&block)?).await?;
                Ok(None)
            }
            Err(e) if !chain.contains(&block.header.prev_block_hash) => {
                // Unknown parent: the sender may be ahead of us
                let from_height = chain.length() as u64;
                debug!(id = %id, from_height, error = %e, "Block does not extend our chain, requesting peer blocks");
                let request = Message::GetBlocks {
                    from_height,
                    max: ctx.config().max_blocks_per_message,
                };
                Ok(Some(request.into_envelope()?))
            }
            Err(e) => {
                warn!(id = %id, error = %e, "Rejected block from peer");
                Ok(None)
            }
        }
    }
}

/// Pools offered transactions and relays new ones
pub struct TransactionHandler;

#[async_trait]
impl MessageHandler for TransactionHandler {
    async fn handle(&self, ctx: &NodeContext, envelope: Envelope) -> Result<Option<Envelope>> {
        let message = envelope.into_message()?;
        let Message::Transaction { transaction } = message else {
            return Err(unexpected(Message::TRANSACTION, &message));
        };
        let tx = decode_transaction(&transaction)?;
        let txid = tx.txid().map_err(|e| NetworkError::Decode(e.to_string()))?;

        if !ctx.mark_seen(&txid).await {
            return Ok(None);
        }

        let added = ctx.pool().write().await.add_transaction(tx.clone());
        match added {
            Ok(txid) => {
                debug!(txid = %txid, "Pooled transaction from peer");
                ctx.broadcast(Message::transaction(&tx)?).await?;
            }
            Err(e) => debug!(txid = %txid, error = %e, "Refused transaction from peer"),
        }
        Ok(None)
    }
}

/// Answers `get_blocks` with a `chain` message
pub struct GetBlocksHandler;

#[async_trait]
impl MessageHandler for GetBlocksHandler {
    async fn handle(&self, ctx: &NodeContext, envelope: Envelope) -> Result<Option<Envelope>> {
        let message = envelope.into_message()?;
        let Message::GetBlocks { from_height, max } = message else {
            return Err(unexpected(Message::GET_BLOCKS, &message));
        };
        let max = max.min(ctx.config().max_blocks_per_message) as usize;
        let blocks = ctx.chain().read().await.blocks_from(from_height, max);
        debug!(from_height, count = blocks.len(), "Serving blocks");
        Ok(Some(Message::chain(&blocks)?.into_envelope()?))
    }
}

/// Answers `get_transactions` with the requested pooled transactions
pub struct GetTransactionsHandler;

#[async_trait]
impl MessageHandler for GetTransactionsHandler {
    async fn handle(&self, ctx: &NodeContext, envelope: Envelope) -> Result<Option<Envelope>> {
        let message = envelope.into_message()?;
        let Message::GetTransactions { ids } = message else {
            return Err(unexpected(Message::GET_TRANSACTIONS, &message));
        };
        let found: Vec<_> = {
            let pool = ctx.pool().read().await;
            ids.iter().filter_map(|id| pool.get(id).cloned()).collect()
        };
        Ok(Some(Message::transactions(&found)?.into_envelope()?))
    }
}

/// Applies a peer's chain: a full chain competes through conflict
/// resolution, a partial one is appended block by block
pub struct ChainHandler;

#[async_trait]
impl MessageHandler for ChainHandler {
    async fn handle(&self, ctx: &NodeContext, envelope: Envelope) -> Result<Option<Envelope>> {
        let message = envelope.into_message()?;
        let Message::Chain { blocks } = message else {
            return Err(unexpected(Message::CHAIN, &message));
        };
        let blocks = blocks
            .iter()
            .map(|encoded| decode_block(encoded))
            .collect::<Result<Vec<_>>>()?;
        let Some(first) = blocks.first() else {
            return Ok(None);
        };

        let page = ctx.config().max_blocks_per_message;
        let full_page = blocks.len() as u64 >= u64::from(page);
        let from_genesis = first.header.prev_block_hash == [0u8; 32];
        let mut chain = ctx.chain().write().await;
        let before = chain.length();

        if from_genesis && chain.is_initialized() {
            if chain.resolve_conflicts(blocks.clone()) {
                info!(old = before, new = chain.length(), "Replaced chain with longer peer chain");
            } else {
                debug!(offered = blocks.len(), ours = before, "Kept our chain");
                return Ok(None);
            }
        } else {
            for block in &blocks {
                if chain.contains(&block.id()) {
                    continue;
                }
                let head = chain.latest().map(|b| b.id());
                if chain.is_initialized() && head != Some(block.header.prev_block_hash) {
                    // Forked below our head: compete with the whole peer chain
                    debug!(ours = chain.length(), "Peer blocks do not extend our head, requesting from genesis");
                    let request = Message::GetBlocks { from_height: 0, max: page };
                    return Ok(Some(request.into_envelope()?));
                }
                if !chain.add_block(block.clone()) {
                    break;
                }
            }
        }
        let after = chain.length();
        drop(chain);

        let mut pool = ctx.pool().write().await;
        for block in &blocks {
            pool.remove_included(&block.transactions);
        }
        drop(pool);

        if full_page && after > before {
            debug!(from_height = after, "Requesting next page of peer blocks");
            let request = Message::GetBlocks {
                from_height: after as u64,
                max: page,
            };
            return Ok(Some(request.into_envelope()?));
        }
        Ok(None)
    }
}

/// Pools every transaction of a `transactions` reply
pub struct TransactionsHandler;

#[async_trait]
impl MessageHandler for TransactionsHandler {
    async fn handle(&self, ctx: &NodeContext, envelope: Envelope) -> Result<Option<Envelope>> {
        let message = envelope.into_message()?;
        let Message::Transactions { transactions } = message else {
            return Err(unexpected(Message::TRANSACTIONS, &message));
        };
        let decoded = transactions
            .iter()
            .map(|encoded| decode_transaction(encoded))
            .collect::<Result<Vec<_>>>()?;

        let mut pool = ctx.pool().write().await;
        let added = decoded
            .into_iter()
            .filter(|tx| pool.add_transaction(tx.clone()).is_ok())
            .count();
        debug!(added, "Pooled transactions from reply");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NetworkConfig;
    use qpow_consensus::constants::TRIVIAL_BITS;
    use qpow_consensus::{default_genesis, Block, ChainManager, ConsensusParams, Transaction};
    use tokio::sync::RwLock;

    fn solve(mut block: Block) -> Block {
        while !block.header.meets_target() {
            block.header.nonce += 1;
        }
        block
    }

    fn chain_of(len: usize) -> ChainManager {
        let mut chain = ChainManager::new(ConsensusParams::default());
        chain.initialize(default_genesis(TRIVIAL_BITS).unwrap()).unwrap();
        while chain.length() < len {
            let block = solve(chain.candidate("miner", vec![]).unwrap());
            assert!(chain.add_block(block));
        }
        chain
    }

    fn context(chain: ChainManager) -> NodeContext {
        NodeContext::new(NetworkConfig::default(), Arc::new(RwLock::new(chain)))
    }

    #[test]
    fn test_defaults_cover_protocol() {
        let kinds = HandlerRegistry::with_defaults().kinds();
        assert_eq!(
            kinds,
            vec!["block", "chain", "get_blocks", "get_transactions", "transaction", "transactions"]
        );
    }

    #[tokio::test]
    async fn test_block_extending_head_is_admitted() {
        let source = chain_of(2);
        let ctx = context(chain_of(1));
        let envelope = Message::block(source.latest().unwrap()).unwrap().into_envelope().unwrap();

        let reply = ctx.dispatch(envelope.clone()).await.unwrap();
        assert!(reply.is_none());
        assert_eq!(ctx.chain().read().await.length(), 2);

        // A second copy is dropped as already seen
        assert!(ctx.dispatch(envelope).await.unwrap().is_none());
        assert_eq!(ctx.chain().read().await.length(), 2);
    }

    fn paged_context(chain: ChainManager, page: u32) -> NodeContext {
        let config = NetworkConfig {
            max_blocks_per_message: page,
            ..NetworkConfig::default()
        };
        NodeContext::new(config, Arc::new(RwLock::new(chain)))
    }

    #[tokio::test]
    async fn test_orphan_block_requests_from_our_height() {
        let source = chain_of(4);
        let ctx = context(chain_of(2));
        let envelope = Message::block(source.latest().unwrap()).unwrap().into_envelope().unwrap();

        let reply = ctx.dispatch(envelope).await.unwrap().unwrap();
        assert_eq!(
            reply.into_message().unwrap(),
            Message::GetBlocks { from_height: 2, max: 10_000 }
        );
        assert_eq!(ctx.chain().read().await.length(), 2);
    }

    #[tokio::test]
    async fn test_tampered_copy_does_not_shadow_block() {
        let ctx = context(chain_of(1));
        let tx = Transaction::new("alice", "bob", 1.0, vec![7; 4]).with_nonce(1);
        let genuine = {
            let chain = ctx.chain().read().await;
            solve(chain.candidate("miner", vec![tx]).unwrap())
        };
        let mut tampered = genuine.clone();
        tampered.transactions[1].amount = 1.0e6;
        assert_eq!(tampered.id(), genuine.id());

        let envelope = Message::block(&tampered).unwrap().into_envelope().unwrap();
        assert!(ctx.dispatch(envelope).await.unwrap().is_none());
        assert_eq!(ctx.chain().read().await.length(), 1);

        let envelope = Message::block(&genuine).unwrap().into_envelope().unwrap();
        assert!(ctx.dispatch(envelope).await.unwrap().is_none());
        let chain = ctx.chain().read().await;
        assert_eq!(chain.length(), 2);
        assert_eq!(chain.latest().unwrap().hash(), genuine.hash());
    }

    #[tokio::test]
    async fn test_full_page_requests_next_page() {
        let source = chain_of(6);
        let ctx = paged_context(chain_of(1), 2);

        // Catch up two blocks at a time until the peer runs out
        let mut from_height = 1;
        loop {
            let page = source.blocks_from(from_height, 2);
            let reply = Message::chain(&page).unwrap().into_envelope().unwrap();
            match ctx.dispatch(reply).await.unwrap() {
                Some(request) => {
                    let Message::GetBlocks { from_height: next, max } = request.into_message().unwrap() else {
                        panic!("expected a get_blocks request");
                    };
                    assert_eq!(max, 2);
                    assert_eq!(next, from_height + 2);
                    from_height = next;
                }
                None => break,
            }
        }
        let chain = ctx.chain().read().await;
        assert_eq!(chain.length(), 6);
        assert_eq!(chain.latest().unwrap().hash(), source.latest().unwrap().hash());
    }

    #[tokio::test]
    async fn test_forked_partial_chain_requests_genesis() {
        let ours = chain_of(3);
        let mut theirs = chain_of(2);
        // Different payload makes a sibling of our block at height 2
        let tx = Transaction::new("carol", "dave", 2.0, vec![1; 4]).with_nonce(1);
        let sibling = solve(theirs.candidate("other", vec![tx]).unwrap());
        assert!(theirs.add_block(sibling));
        let next = solve(theirs.candidate("other", vec![]).unwrap());
        assert!(theirs.add_block(next));

        let ctx = context(ours);
        let reply = Message::chain(&theirs.blocks_from(2, 10)).unwrap().into_envelope().unwrap();
        let request = ctx.dispatch(reply).await.unwrap().unwrap();
        assert_eq!(
            request.into_message().unwrap(),
            Message::GetBlocks { from_height: 0, max: 10_000 }
        );
        assert_eq!(ctx.chain().read().await.length(), 3);
    }

    #[tokio::test]
    async fn test_get_blocks_serves_range() {
        let ctx = context(chain_of(5));
        let request = Message::GetBlocks { from_height: 2, max: 2 }.into_envelope().unwrap();
        let reply = ctx.dispatch(request).await.unwrap().unwrap();
        let Message::Chain { blocks } = reply.into_message().unwrap() else {
            panic!("expected a chain reply");
        };
        assert_eq!(blocks.len(), 2);
        let expected = ctx.chain().read().await.block_at(2).unwrap().hash();
        assert_eq!(decode_block(&blocks[0]).unwrap().hash(), expected);
    }

    #[tokio::test]
    async fn test_chain_reply_replaces_shorter_chain() {
        let longer = chain_of(5);
        let ctx = context(chain_of(2));
        let reply = Message::chain(longer.blocks()).unwrap().into_envelope().unwrap();

        assert!(ctx.dispatch(reply).await.unwrap().is_none());
        let chain = ctx.chain().read().await;
        assert_eq!(chain.length(), 5);
        assert_eq!(chain.latest().unwrap().hash(), longer.latest().unwrap().hash());
    }

    #[tokio::test]
    async fn test_transaction_pooled_and_served() {
        let ctx = context(chain_of(1));
        let tx = Transaction::new("alice", "bob", 3.0, vec![7; 4]).with_nonce(1);
        let txid = tx.txid().unwrap();

        let offer = Message::transaction(&tx).unwrap().into_envelope().unwrap();
        assert!(ctx.dispatch(offer).await.unwrap().is_none());
        assert!(ctx.pool().read().await.contains(&txid));

        let request = Message::GetTransactions { ids: vec![txid, "missing".into()] }
            .into_envelope()
            .unwrap();
        let reply = ctx.dispatch(request).await.unwrap().unwrap();
        let Message::Transactions { transactions } = reply.into_message().unwrap() else {
            panic!("expected a transactions reply");
        };
        assert_eq!(transactions.len(), 1);
        assert_eq!(decode_transaction(&transactions[0]).unwrap(), tx);
    }

    #[tokio::test]
    async fn test_unknown_type_ignored() {
        let ctx = context(chain_of(1));
        let reply = ctx.dispatch(Envelope::new("ping")).await.unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_malformed_block_is_decode_error() {
        let ctx = context(chain_of(1));
        let envelope = Message::Block { block: "%%%".into() }.into_envelope().unwrap();
        assert!(ctx.dispatch(envelope).await.unwrap_err().is_decode());
    }
}
