//! The listening node, its connections and propagation

use crate::handler::{HandlerRegistry, MessageHandler};
use crate::message::{read_frame, write_frame, Envelope, Message};
use crate::peer::{PeerInfo, PeerTable, SeenCache};
use crate::{NetworkConfig, NetworkError, Result};
use qpow_consensus::{Block, ChainManager, Transaction, TransactionPool};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::AbortHandle;
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, info, warn};

/// Chain shared between the network, the miner and the process
pub type SharedChain = Arc<RwLock<ChainManager>>;

/// Transaction pool shared the same way
pub type SharedPool = Arc<RwLock<TransactionPool>>;

/// Running tasks keyed by a local id; finished tasks remove themselves
#[derive(Default)]
struct TaskSet {
    next_id: u64,
    handles: HashMap<u64, AbortHandle>,
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// State shared by the listener, every connection and every handler
#[derive(Clone)]
pub struct NodeContext {
    config: Arc<NetworkConfig>,
    chain: SharedChain,
    pool: SharedPool,
    peers: Arc<RwLock<PeerTable>>,
    connections: Arc<RwLock<HashMap<String, mpsc::Sender<Envelope>>>>,
    seen: Arc<Mutex<SeenCache>>,
    handlers: Arc<RwLock<HandlerRegistry>>,
    tasks: Arc<Mutex<TaskSet>>,
    running: Arc<AtomicBool>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl NodeContext {
    /// Context with the default handlers and an empty pool
    pub fn new(config: NetworkConfig, chain: SharedChain) -> Self {
        let pool = Arc::new(RwLock::new(TransactionPool::new(config.pool_capacity)));
        Self::with_pool(config, chain, pool)
    }

    /// Context around an existing pool
    pub fn with_pool(config: NetworkConfig, chain: SharedChain, pool: SharedPool) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            seen: Arc::new(Mutex::new(SeenCache::new(config.seen_capacity))),
            config: Arc::new(config),
            chain,
            pool,
            peers: Arc::new(RwLock::new(PeerTable::new())),
            connections: Arc::new(RwLock::new(HashMap::new())),
            handlers: Arc::new(RwLock::new(HandlerRegistry::with_defaults())),
            tasks: Arc::new(Mutex::new(TaskSet::default())),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Network settings this node runs with
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Identifier announced to peers
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Chain shared with the miner and handlers
    pub fn chain(&self) -> &SharedChain {
        &self.chain
    }

    /// Pending transactions shared with the miner
    pub fn pool(&self) -> &SharedPool {
        &self.pool
    }

    /// Whether the listener is accepting connections
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether a block or transaction hash is already recorded
    pub async fn has_seen(&self, key: &str) -> bool {
        self.seen.lock().await.contains(key)
    }

    /// Record a block or transaction hash; false if it was already seen
    pub async fn mark_seen(&self, key: &str) -> bool {
        self.seen.lock().await.insert(key.to_string())
    }

    /// Route an envelope to its handler; unknown types are ignored
    pub async fn dispatch(&self, envelope: Envelope) -> Result<Option<Envelope>> {
        let handler = self.handlers.read().await.get(&envelope.kind);
        match handler {
            Some(handler) => handler.handle(self, envelope).await,
            None => {
                warn!(kind = %envelope.kind, "Ignoring message of unknown type");
                Ok(None)
            }
        }
    }

    /// Queue `message` for every known peer without waiting on any of them
    pub async fn broadcast(&self, message: Message) -> Result<usize> {
        let envelope = message.into_envelope()?;
        let ids = self.peers.read().await.ids();
        for id in &ids {
            let ctx = self.clone();
            let id = id.clone();
            let envelope = envelope.clone();
            self.spawn(async move {
                if let Err(e) = ctx.send_to_peer(&id, envelope).await {
                    debug!(peer = %id, error = %e, "Propagation to peer failed");
                }
            })
            .await;
        }
        Ok(ids.len())
    }

    /// Send one envelope to a known peer, connecting on first use
    pub async fn send_to_peer(&self, node_id: &str, envelope: Envelope) -> Result<()> {
        let result = match self.outbox_for(node_id).await {
            Ok(outbox) => outbox
                .send(envelope)
                .await
                .map_err(|_| NetworkError::ConnectionClosed(node_id.to_string())),
            Err(e) => Err(e),
        };

        if let Some(peer) = self.peers.write().await.get_mut(node_id) {
            match result {
                Ok(()) => peer.record_success(),
                Err(_) => peer.record_failure(),
            }
        }
        result
    }

    async fn outbox_for(&self, node_id: &str) -> Result<mpsc::Sender<Envelope>> {
        if let Some(outbox) = self.connections.read().await.get(node_id) {
            if !outbox.is_closed() {
                return Ok(outbox.clone());
            }
        }

        let peer = self
            .peers
            .read()
            .await
            .get(node_id)
            .cloned()
            .ok_or_else(|| NetworkError::PeerNotFound(node_id.to_string()))?;

        let connect = TcpStream::connect((peer.host.as_str(), peer.port));
        let stream = match timeout(self.config.connect_timeout(), connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(NetworkError::ConnectionFailed(format!("{}: {e}", peer.address())))
            }
            Err(_) => return Err(NetworkError::Timeout(format!("connecting to {}", peer.address()))),
        };
        debug!(peer = %node_id, address = %peer.address(), "Connected to peer");

        let outbox = self.spawn_connection(stream, Some(node_id.to_string())).await;
        self.connections
            .write()
            .await
            .insert(node_id.to_string(), outbox.clone());
        Ok(outbox)
    }

    /// Run `task` as a tracked task that shutdown can wait for or abort
    async fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tasks = Arc::clone(&self.tasks);
        let mut guard = self.tasks.lock().await;
        let id = guard.next_id;
        guard.next_id += 1;
        let handle = tokio::spawn(async move {
            task.await;
            tasks.lock().await.handles.remove(&id);
        });
        guard.handles.insert(id, handle.abort_handle());
    }

    /// Start the reader and writer tasks for a connection
    async fn spawn_connection(&self, stream: TcpStream, peer: Option<String>) -> mpsc::Sender<Envelope> {
        let label = match (&peer, stream.peer_addr()) {
            (Some(id), _) => id.clone(),
            (None, Ok(addr)) => addr.to_string(),
            (None, Err(_)) => "unknown".to_string(),
        };
        let (reader, writer) = stream.into_split();
        let (outbox, inbox) = mpsc::channel(self.config.outbox_capacity.max(1));

        let max_frame_len = self.config.max_frame_len;
        let writer_task = tokio::spawn(write_loop(writer, inbox, max_frame_len, label.clone()));
        let writer_guard = AbortOnDrop(writer_task.abort_handle());

        let ctx = self.clone();
        let replies = outbox.clone();
        self.spawn(async move {
            ctx.serve_connection(reader, &replies, &label).await;
            drop(writer_guard);
            if let Some(id) = peer {
                ctx.forget_connection(&id, &replies).await;
            }
        })
        .await;
        outbox
    }

    async fn forget_connection(&self, node_id: &str, outbox: &mpsc::Sender<Envelope>) {
        let mut connections = self.connections.write().await;
        if connections.get(node_id).is_some_and(|known| known.same_channel(outbox)) {
            connections.remove(node_id);
        }
    }

    /// Read frames until the peer leaves, a read times out, the decode
    /// error limit is reached or the node shuts down
    async fn serve_connection(&self, mut reader: OwnedReadHalf, outbox: &mpsc::Sender<Envelope>, label: &str) {
        let mut shutdown = self.shutdown.subscribe();
        let read_timeout = self.config.read_timeout();
        let mut decode_errors = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let read = tokio::select! {
                _ = shutdown.changed() => break,
                read = timeout(read_timeout, read_frame(&mut reader, self.config.max_frame_len)) => read,
            };

            let body = match read {
                Ok(Ok(Some(body))) => body,
                Ok(Ok(None)) => {
                    debug!(peer = %label, "Connection closed by peer");
                    break;
                }
                Ok(Err(e)) => {
                    warn!(peer = %label, error = %e, "Closing connection after read error");
                    break;
                }
                Err(_) => {
                    debug!(peer = %label, "Connection idle past read timeout");
                    break;
                }
            };

            let outcome = match Envelope::from_slice(&body) {
                Ok(envelope) => self.dispatch(envelope).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(Some(reply)) => {
                    if outbox.send(reply).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_decode() => {
                    decode_errors += 1;
                    warn!(peer = %label, error = %e, decode_errors, "Malformed message");
                    if decode_errors >= self.config.decode_error_threshold {
                        warn!(peer = %label, "Too many malformed messages, closing connection");
                        break;
                    }
                }
                Err(e) => warn!(peer = %label, error = %e, "Handler failed"),
            }
        }
    }

    /// Stop accepting, give tasks the grace period, then abort the rest
    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);
        self.connections.write().await.clear();

        let deadline = Instant::now() + self.config.shutdown_grace();
        while Instant::now() < deadline && !self.tasks.lock().await.handles.is_empty() {
            sleep(Duration::from_millis(20)).await;
        }

        let mut tasks = self.tasks.lock().await;
        if !tasks.handles.is_empty() {
            warn!(remaining = tasks.handles.len(), "Aborting tasks after grace period");
        }
        for (_, handle) in tasks.handles.drain() {
            handle.abort();
        }
    }

    async fn accept_loop(self, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, address)) => {
                        debug!(%address, "Accepted connection");
                        self.spawn_connection(stream, None).await;
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
            }
        }
        info!(node = %self.node_id(), "Listener stopped");
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut inbox: mpsc::Receiver<Envelope>,
    max_frame_len: usize,
    label: String,
) {
    while let Some(envelope) = inbox.recv().await {
        if let Err(e) = write_frame(&mut writer, &envelope, max_frame_len).await {
            debug!(peer = %label, error = %e, "Write failed, dropping connection");
            break;
        }
    }
}

/// A peer-to-peer node bound to one chain
pub struct Node {
    ctx: NodeContext,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
}

impl Node {
    /// Node with the default handlers and an empty pool
    pub fn new(config: NetworkConfig, chain: SharedChain) -> Self {
        Self::from_context(NodeContext::new(config, chain))
    }

    /// Node sharing an existing transaction pool
    pub fn with_pool(config: NetworkConfig, chain: SharedChain, pool: SharedPool) -> Self {
        Self::from_context(NodeContext::with_pool(config, chain, pool))
    }

    fn from_context(ctx: NodeContext) -> Self {
        Self {
            ctx,
            local_addr: std::sync::Mutex::new(None),
        }
    }

    /// State shared with connections and handlers
    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    /// Identifier announced to peers
    pub fn node_id(&self) -> &str {
        self.ctx.node_id()
    }

    /// Chain shared with the miner and handlers
    pub fn chain(&self) -> &SharedChain {
        self.ctx.chain()
    }

    /// Pending transactions shared with the miner
    pub fn pool(&self) -> &SharedPool {
        self.ctx.pool()
    }

    /// Whether the listener is accepting connections
    pub fn is_running(&self) -> bool {
        self.ctx.is_running()
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|addr| *addr)
    }

    /// Bind the listener and start accepting connections
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.ctx.running.swap(true, Ordering::SeqCst) {
            return Err(NetworkError::AlreadyRunning);
        }
        let config = self.ctx.config();
        let listener = match TcpListener::bind((config.host.as_str(), config.port)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.ctx.running.store(false, Ordering::SeqCst);
                return Err(NetworkError::ConnectionFailed(format!(
                    "failed to bind {}:{}: {e}",
                    config.host, config.port
                )));
            }
        };
        let address = listener.local_addr()?;
        if let Ok(mut slot) = self.local_addr.lock() {
            *slot = Some(address);
        }

        self.ctx.spawn(self.ctx.clone().accept_loop(listener)).await;
        info!(node = %self.node_id(), %address, "Node listening");
        Ok(address)
    }

    /// Stop the listener and every connection
    pub async fn shutdown(&self) {
        info!(node = %self.node_id(), "Shutting down node");
        self.ctx.stop().await;
    }

    /// Install or replace the handler for a message type
    pub async fn register_handler(&self, kind: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.ctx.handlers.write().await.register(kind, handler);
    }

    /// Remember a peer; the connection is opened on first send
    pub async fn connect_to_peer(&self, node_id: impl Into<String>, host: impl Into<String>, port: u16) -> bool {
        let info = PeerInfo::new(node_id, host, port);
        debug!(peer = %info.node_id, address = %info.address(), "Recorded peer");
        self.ctx.peers.write().await.insert(info)
    }

    /// Snapshot of the peer table
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let peers = self.ctx.peers.read().await;
        peers.ids().iter().filter_map(|id| peers.get(id).cloned()).collect()
    }

    /// Push a locally admitted block to every peer
    pub async fn propagate_block(&self, block: &Block) -> Result<usize> {
        self.ctx.mark_seen(&hex::encode(block.id())).await;
        self.ctx.broadcast(Message::block(block)?).await
    }

    /// Push a transaction to every peer
    pub async fn propagate_transaction(&self, tx: &Transaction) -> Result<usize> {
        let txid = tx.txid()?;
        self.ctx.mark_seen(&txid).await;
        self.ctx.broadcast(Message::transaction(tx)?).await
    }

    /// Pool a local transaction and propagate it
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<String> {
        let txid = self.ctx.pool.write().await.add_transaction(tx.clone())?;
        self.propagate_transaction(&tx).await?;
        Ok(txid)
    }

    /// Send one message to a known peer
    pub async fn send_to_peer(&self, node_id: &str, message: Message) -> Result<()> {
        self.ctx.send_to_peer(node_id, message.into_envelope()?).await
    }
}
