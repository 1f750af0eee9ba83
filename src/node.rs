//! The exchange node: the state machine that ties the want manager, the
//! decision engine, the blockstore and the waiter registry together.
//!
//! An [`ExchangeNode`] is a cheap-to-clone handle (everything lives behind an
//! inner `Arc`), so transports, background tasks and tests can all hold one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use tracing::{debug, trace, warn};

use crate::core::{
    retry, Block, BlockEvent, BlockKey, Blockstore, BlockWaiters, Contact, ExchangeNetwork,
    PeerId, Priority, RetryPolicy, WantEntry, DEFAULT_PRIORITY, INGEST_CONCURRENCY,
    PUT_RETRY_ATTEMPTS, PUT_RETRY_INTERVAL,
};
use crate::engine::DecisionEngine;
use crate::protocol::ExchangeMessage;
use crate::wantmanager::WantManager;

/// Observability snapshot of a running node.
#[derive(Clone, Debug, Default)]
pub struct StatSnapshot {
    /// The local outgoing want-list.
    pub wantlist: Vec<WantEntry>,
    /// Blocks delivered through inbound messages.
    pub blocks_received: u64,
    /// Deliveries whose key was already present in the blockstore.
    pub dup_blocks_received: u64,
    /// Payload bytes of those duplicate deliveries.
    pub dup_data_received: u64,
    /// Peers with a ledger.
    pub peers: Vec<PeerId>,
}

struct NodeInner<S: Blockstore, N: ExchangeNetwork> {
    blockstore: Arc<S>,
    network: Arc<N>,
    want_manager: WantManager<N>,
    engine: DecisionEngine<S, N>,
    waiters: BlockWaiters,
    blocks_received: AtomicU64,
    dup_blocks_received: AtomicU64,
    dup_data_received: AtomicU64,
}

/// A content-addressed block exchange node.
///
/// The node broadcasts a refcounted want-list to connected peers, serves
/// their want-lists from the local blockstore, ingests delivered blocks, and
/// resolves local [`get_block`](ExchangeNode::get_block) calls from either a
/// local put or a remote delivery, whichever happens first.
pub struct ExchangeNode<S: Blockstore, N: ExchangeNetwork> {
    inner: Arc<NodeInner<S, N>>,
}

impl<S: Blockstore, N: ExchangeNetwork> Clone for ExchangeNode<S, N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Blockstore, N: ExchangeNetwork> ExchangeNode<S, N> {
    pub fn new(blockstore: S, network: N) -> Self {
        let blockstore = Arc::new(blockstore);
        let network = Arc::new(network);
        Self {
            inner: Arc::new(NodeInner {
                want_manager: WantManager::new(network.clone()),
                engine: DecisionEngine::new(blockstore.clone(), network.clone()),
                waiters: BlockWaiters::new(),
                blocks_received: AtomicU64::new(0),
                dup_blocks_received: AtomicU64::new(0),
                dup_data_received: AtomicU64::new(0),
                blockstore,
                network,
            }),
        }
    }

    /// Bring the engine worker and the transport up.
    pub async fn start(&self) -> Result<()> {
        self.inner.engine.start().await;
        self.inner.network.start().await?;
        Ok(())
    }

    /// Teardown in reverse order of [`start`](ExchangeNode::start): network,
    /// engine worker, then every per-peer queue.
    pub async fn stop(&self) -> Result<()> {
        self.inner.network.stop().await?;
        self.inner.engine.stop().await;
        self.inner.want_manager.stop().await;
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────
    // Transport hooks
    // ────────────────────────────────────────────────────────────────────

    /// A session to `contact` exists. Idempotent; the first call sends the
    /// peer a full want-list snapshot.
    pub async fn peer_connected(&self, contact: Contact) {
        self.inner.want_manager.connected(contact).await;
    }

    /// The session to `peer` is gone. Their queued tasks are dropped, their
    /// ledger is retained for a reconnect.
    pub async fn peer_disconnected(&self, peer: &PeerId) {
        self.inner.want_manager.disconnected(peer).await;
        self.inner.engine.peer_disconnected(peer).await;
    }

    /// An inbound message from `from`.
    ///
    /// The engine sees it first (ledger update, task scheduling); cancels for
    /// any wanted keys among the delivered blocks go out immediately to cut
    /// duplicate deliveries still in flight; then every block is ingested
    /// with bounded concurrency. Returns only after each block has been
    /// stored or counted as a duplicate.
    pub async fn handle_message(&self, from: &Contact, message: ExchangeMessage) -> Result<()> {
        self.inner.engine.message_received(from, &message).await;

        if message.blocks.is_empty() {
            return Ok(());
        }

        let mut to_cancel = Vec::new();
        for block in &message.blocks {
            if self.inner.want_manager.contains(&block.key).await {
                to_cancel.push(block.key.clone());
            } else {
                debug!(
                    peer = %hex::encode(&from.id[..8]),
                    key = %block.key,
                    "unwanted block"
                );
            }
        }
        self.inner.want_manager.cancel_wants(&to_cancel).await;

        let node = self.clone();
        futures::stream::iter(message.blocks)
            .for_each_concurrent(INGEST_CONCURRENCY, |block| {
                let node = node.clone();
                async move {
                    node.inner.blocks_received.fetch_add(1, Ordering::Relaxed);
                    match node.inner.blockstore.has(&block.key).await {
                        Ok(true) => {
                            node.inner.dup_blocks_received.fetch_add(1, Ordering::Relaxed);
                            node.inner
                                .dup_data_received
                                .fetch_add(block.data.len() as u64, Ordering::Relaxed);
                            trace!(key = %block.key, "duplicate delivery");
                        }
                        Ok(false) => {
                            if let Err(err) = node.put_block(block).await {
                                debug!("failed to ingest delivered block: {err:#}");
                            }
                        }
                        Err(err) => {
                            debug!(key = %block.key, "dedup probe failed: {err:#}");
                        }
                    }
                }
            })
            .await;

        Ok(())
    }

    /// Transport-level receive failure; the session handling stays up.
    pub fn handle_receive_error(&self, err: &anyhow::Error) {
        warn!("receive error: {err:#}");
    }

    // ────────────────────────────────────────────────────────────────────
    // Block ingestion
    // ────────────────────────────────────────────────────────────────────

    /// Make a block locally available: persist it (with retry), wake every
    /// pending local request for its key, and let the engine queue it for
    /// peers that asked.
    ///
    /// The wakeup fires exactly once per call, strictly after the put has
    /// completed.
    pub async fn put_block(&self, block: Block) -> Result<()> {
        let store = self.inner.blockstore.clone();
        retry(
            RetryPolicy::fixed(PUT_RETRY_ATTEMPTS, PUT_RETRY_INTERVAL),
            || {
                let store = store.clone();
                let block = block.clone();
                async move { store.put(block).await }
            },
        )
        .await?;

        self.inner.waiters.arrived(&block).await;
        self.inner.engine.received_block(&block).await;
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────
    // Retrieval
    // ────────────────────────────────────────────────────────────────────

    /// Fetch one block, from the local store if possible, otherwise by
    /// wanting it from the network.
    ///
    /// Concurrent calls for the same key share a single want-list entry via
    /// refcounting and are all woken by the same arrival.
    /// [`unwant_blocks`](ExchangeNode::unwant_blocks) aborts every pending
    /// call with a `manual unwant` error.
    pub async fn get_block(&self, key: &BlockKey) -> Result<Block> {
        if self.inner.blockstore.has(key).await? {
            if let Some(block) = self.inner.blockstore.get(key).await? {
                return Ok(block);
            }
            // Evicted between the probes; fall through to a fetch.
        }

        let rx = self.inner.waiters.register(key).await?;

        // Re-check after registering: a put that raced the registration has
        // already fired, one that lands later will. Either way no wakeup is
        // lost.
        match self.inner.blockstore.get(key).await? {
            Some(block) => {
                self.inner.waiters.arrived(&block).await;
            }
            None => {
                self.inner
                    .want_manager
                    .want_blocks(std::slice::from_ref(key), DEFAULT_PRIORITY)
                    .await;
            }
        }

        match rx.await {
            Ok(BlockEvent::Arrived(block)) => {
                self.inner.want_manager.cancel_wants(std::slice::from_ref(key)).await;
                Ok(block)
            }
            Ok(BlockEvent::Unwanted) => Err(anyhow!("manual unwant: {}", key.to_base58())),
            Err(_) => Err(anyhow!("node shut down while waiting for {key}")),
        }
    }

    /// Fan-in over [`get_block`](ExchangeNode::get_block): resolves every key
    /// and yields the results in completion order.
    pub fn get_blocks(&self, keys: Vec<BlockKey>) -> impl Stream<Item = Result<Block>> {
        let futures: FuturesUnordered<_> = keys
            .into_iter()
            .map(|key| {
                let node = self.clone();
                async move { node.get_block(&key).await }
            })
            .collect();
        futures
    }

    // ────────────────────────────────────────────────────────────────────
    // Want-list management
    // ────────────────────────────────────────────────────────────────────

    /// Announce wants for `keys` at the given priority.
    pub async fn want_blocks(&self, keys: &[BlockKey], priority: Priority) {
        self.inner.want_manager.want_blocks(keys, priority).await;
    }

    /// Drop one reference per key, broadcasting cancels for keys nobody
    /// wants anymore.
    pub async fn cancel_wants(&self, keys: &[BlockKey]) {
        self.inner.want_manager.cancel_wants(keys).await;
    }

    /// Abort all interest in `keys`: force-remove them from the want-list,
    /// broadcast cancels, and fail every pending local get with
    /// `"manual unwant: <key>"`.
    pub async fn unwant_blocks(&self, keys: &[BlockKey]) {
        self.inner.want_manager.unwant_blocks(keys).await;
        for key in keys {
            self.inner.waiters.unwanted(key).await;
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Observability
    // ────────────────────────────────────────────────────────────────────

    /// The local outgoing want-list.
    pub async fn wantlist(&self) -> Vec<WantEntry> {
        self.inner.want_manager.wantlist().await
    }

    /// What `peer` currently wants from us.
    pub async fn wantlist_for(&self, peer: &PeerId) -> Vec<WantEntry> {
        self.inner.engine.wantlist_for(peer).await
    }

    /// Every peer the engine keeps a ledger for.
    pub async fn peers(&self) -> Vec<PeerId> {
        self.inner.engine.peers().await
    }

    /// The peer's sent-to-received ratio, if we have a ledger for it.
    pub async fn debt_ratio(&self, peer: &PeerId) -> Option<f64> {
        self.inner.engine.debt_ratio(peer).await
    }

    /// Bytes the envelope loop has successfully sent to `peer`.
    pub async fn bytes_sent_to(&self, peer: &PeerId) -> u64 {
        self.inner.engine.bytes_sent_to(peer).await
    }

    /// Current counters and want-list snapshot.
    pub async fn stat(&self) -> StatSnapshot {
        StatSnapshot {
            wantlist: self.inner.want_manager.wantlist().await,
            blocks_received: self.inner.blocks_received.load(Ordering::Relaxed),
            dup_blocks_received: self.inner.dup_blocks_received.load(Ordering::Relaxed),
            dup_data_received: self.inner.dup_data_received.load(Ordering::Relaxed),
            peers: self.inner.engine.peers().await,
        }
    }
}
