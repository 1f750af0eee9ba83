//! Outgoing want-list state and its fan-out to connected peers.
//!
//! The [`WantManager`] owns the node's single [`WantList`] and one
//! [`MessageQueue`] per connected peer. Queues coalesce pending additions and
//! cancels into at most one in-flight message per peer; a failed send backs
//! off exponentially while the change set stays pending, so a flapping peer
//! eventually receives one merged update instead of a burst.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::core::{
    BlockKey, Contact, ExchangeNetwork, PeerId, Priority, WantEntry, WantList, SEND_RETRY_CAP,
    SEND_RETRY_INITIAL,
};
use crate::protocol::ExchangeMessage;

/// Changes accumulated for one peer between sends.
#[derive(Debug, Default)]
struct PendingWants {
    /// Next composed message replaces the peer's view of our want-list.
    full: bool,
    adds: HashMap<BlockKey, Priority>,
    cancels: HashSet<BlockKey>,
}

impl PendingWants {
    fn is_empty(&self) -> bool {
        !self.full && self.adds.is_empty() && self.cancels.is_empty()
    }

    fn add(&mut self, key: BlockKey, priority: Priority) {
        self.cancels.remove(&key);
        let slot = self.adds.entry(key).or_insert(priority);
        *slot = (*slot).max(priority);
    }

    fn cancel(&mut self, key: BlockKey) {
        self.adds.remove(&key);
        self.cancels.insert(key);
    }

    /// Drain everything into one wire message.
    fn compose(&mut self) -> ExchangeMessage {
        let mut message = ExchangeMessage::new();
        message.full = std::mem::take(&mut self.full);
        for (key, priority) in self.adds.drain() {
            message.want_block(key, priority);
        }
        for key in self.cancels.drain() {
            message.cancel_block(key);
        }
        message
    }

    /// Put a failed message's changes back, deferring to anything enqueued
    /// while the send was in flight.
    fn merge_back(&mut self, message: ExchangeMessage) {
        self.full |= message.full;
        for entry in message.entries {
            if entry.cancel {
                if !self.adds.contains_key(&entry.key) {
                    self.cancels.insert(entry.key);
                }
            } else if !self.cancels.contains(&entry.key) {
                let slot = self.adds.entry(entry.key).or_insert(entry.priority);
                *slot = (*slot).max(entry.priority);
            }
        }
    }
}

/// Serializes want-list traffic toward one peer.
struct MessageQueue {
    pending: Arc<Mutex<PendingWants>>,
    wake: Arc<Notify>,
    drainer: JoinHandle<()>,
}

impl MessageQueue {
    fn spawn<N: ExchangeNetwork>(contact: Contact, network: Arc<N>) -> Self {
        let pending: Arc<Mutex<PendingWants>> = Arc::default();
        let wake = Arc::new(Notify::new());
        let drainer = tokio::spawn(run_queue(contact, network, pending.clone(), wake.clone()));
        Self {
            pending,
            wake,
            drainer,
        }
    }

    async fn enqueue_full(&self, entries: Vec<WantEntry>) {
        {
            let mut pending = self.pending.lock().await;
            pending.full = true;
            pending.adds = entries.into_iter().map(|e| (e.key, e.priority)).collect();
            pending.cancels.clear();
        }
        self.wake.notify_one();
    }

    async fn enqueue_adds(&self, wants: &[(BlockKey, Priority)]) {
        {
            let mut pending = self.pending.lock().await;
            for (key, priority) in wants {
                pending.add(key.clone(), *priority);
            }
        }
        self.wake.notify_one();
    }

    async fn enqueue_cancels(&self, keys: &[BlockKey]) {
        {
            let mut pending = self.pending.lock().await;
            for key in keys {
                pending.cancel(key.clone());
            }
        }
        self.wake.notify_one();
    }

    fn stop(self) {
        self.drainer.abort();
    }
}

/// Drainer task for one peer: one message in flight at a time, FIFO for that
/// peer, exponential backoff while the peer is unreachable.
async fn run_queue<N: ExchangeNetwork>(
    contact: Contact,
    network: Arc<N>,
    pending: Arc<Mutex<PendingWants>>,
    wake: Arc<Notify>,
) {
    if let Err(err) = network.connect_to(&contact).await {
        debug!(
            peer = %hex::encode(&contact.id[..8]),
            "connect failed, relying on send-time dialing: {err:#}"
        );
    }

    let mut delay = SEND_RETRY_INITIAL;
    loop {
        wake.notified().await;
        loop {
            let message = {
                let mut pending = pending.lock().await;
                if pending.is_empty() {
                    break;
                }
                pending.compose()
            };
            match network.send_message(&contact, message.clone()).await {
                Ok(()) => {
                    trace!(
                        peer = %hex::encode(&contact.id[..8]),
                        entries = message.entries.len(),
                        full = message.full,
                        "want-list update delivered"
                    );
                    delay = SEND_RETRY_INITIAL;
                }
                Err(err) => {
                    debug!(
                        peer = %hex::encode(&contact.id[..8]),
                        "want-list send failed, backing off {delay:?}: {err:#}"
                    );
                    pending.lock().await.merge_back(message);
                    sleep(delay).await;
                    delay = (delay * 2).min(SEND_RETRY_CAP);
                }
            }
        }
    }
}

/// Owner of the local want-list and the per-peer broadcast queues.
pub struct WantManager<N: ExchangeNetwork> {
    wantlist: Mutex<WantList>,
    peers: Mutex<HashMap<PeerId, MessageQueue>>,
    network: Arc<N>,
}

impl<N: ExchangeNetwork> WantManager<N> {
    pub fn new(network: Arc<N>) -> Self {
        Self {
            wantlist: Mutex::new(WantList::new()),
            peers: Mutex::new(HashMap::new()),
            network,
        }
    }

    /// Add `keys` to the local want-list and announce the new entries to
    /// every connected peer.
    pub async fn want_blocks(&self, keys: &[BlockKey], priority: Priority) {
        if keys.is_empty() {
            return;
        }
        let wants: Vec<(BlockKey, Priority)> = {
            let mut wantlist = self.wantlist.lock().await;
            keys.iter()
                .map(|key| {
                    wantlist.add(key.clone(), priority);
                    (key.clone(), priority)
                })
                .collect()
        };
        let peers = self.peers.lock().await;
        for queue in peers.values() {
            queue.enqueue_adds(&wants).await;
        }
    }

    /// Drop one reference per key; keys whose refcount reached zero are
    /// cancelled toward every peer. Returns the keys actually dropped.
    pub async fn cancel_wants(&self, keys: &[BlockKey]) -> Vec<BlockKey> {
        let dropped: Vec<BlockKey> = {
            let mut wantlist = self.wantlist.lock().await;
            keys.iter()
                .filter(|key| wantlist.remove(key).is_some())
                .cloned()
                .collect()
        };
        self.broadcast_cancels(&dropped).await;
        dropped
    }

    /// Force-remove `keys` regardless of refcount and cancel them toward
    /// every peer. Returns the keys that were present.
    pub async fn unwant_blocks(&self, keys: &[BlockKey]) -> Vec<BlockKey> {
        let dropped: Vec<BlockKey> = {
            let mut wantlist = self.wantlist.lock().await;
            keys.iter()
                .filter(|key| wantlist.remove_force(key).is_some())
                .cloned()
                .collect()
        };
        self.broadcast_cancels(&dropped).await;
        dropped
    }

    async fn broadcast_cancels(&self, keys: &[BlockKey]) {
        if keys.is_empty() {
            return;
        }
        let peers = self.peers.lock().await;
        for queue in peers.values() {
            queue.enqueue_cancels(keys).await;
        }
    }

    /// Ensure a queue for `contact`. The first call for a peer enqueues a
    /// full want-list snapshot; later calls are no-ops, so transports may
    /// report the same session repeatedly.
    pub async fn connected(&self, contact: Contact) {
        let mut peers = self.peers.lock().await;
        if peers.contains_key(&contact.id) {
            return;
        }
        let queue = MessageQueue::spawn(contact.clone(), self.network.clone());
        let snapshot = self.wantlist.lock().await.entries();
        queue.enqueue_full(snapshot).await;
        peers.insert(contact.id, queue);
    }

    /// Tear down the peer's queue. Pending unsent changes are discarded; a
    /// reconnect starts over with a full snapshot.
    pub async fn disconnected(&self, peer: &PeerId) {
        let queue = self.peers.lock().await.remove(peer);
        if let Some(queue) = queue {
            queue.stop();
        }
    }

    pub async fn contains(&self, key: &BlockKey) -> bool {
        self.wantlist.lock().await.contains(key)
    }

    /// Snapshot of the local want-list.
    pub async fn wantlist(&self) -> Vec<WantEntry> {
        self.wantlist.lock().await.entries()
    }

    /// Halt every per-peer drainer.
    pub async fn stop(&self) {
        let mut peers = self.peers.lock().await;
        for (_, queue) in peers.drain() {
            queue.stop();
        }
    }
}
