//! The decision engine: who gets which block next.
//!
//! Remote want-lists land in per-peer [`Ledger`]s; every want the local
//! blockstore can satisfy becomes a task. The envelope loop drains the task
//! queue into single-block messages, selecting peers round-robin and, within
//! a peer, highest priority first with FIFO tie-breaks. Ledgers outlive
//! disconnects so a returning peer is still owed what it asked for.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::core::{Block, BlockKey, Blockstore, Contact, ExchangeNetwork, Ledger, PeerId, Priority, WantEntry};
use crate::protocol::ExchangeMessage;

/// A prospective outbound send: one block to one peer.
#[derive(Clone, Debug)]
pub struct Task {
    pub contact: Contact,
    pub key: BlockKey,
    pub priority: Priority,
}

#[derive(Debug)]
struct QueuedTask {
    key: BlockKey,
    priority: Priority,
    seq: u64,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // Max-heap: highest priority wins, earliest enqueue breaks ties.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct PeerTasks {
    contact: Contact,
    heap: BinaryHeap<QueuedTask>,
}

/// Fair task queue: round-robin across peers, priority order within a peer,
/// at most one queued task per `(peer, key)` pair.
#[derive(Debug, Default)]
struct TaskQueue {
    by_peer: HashMap<PeerId, PeerTasks>,
    round: VecDeque<PeerId>,
    queued: HashSet<(PeerId, BlockKey)>,
    next_seq: u64,
}

impl TaskQueue {
    fn push(&mut self, contact: &Contact, key: BlockKey, priority: Priority) {
        if !self.queued.insert((contact.id, key.clone())) {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let tasks = self.by_peer.entry(contact.id).or_insert_with(|| {
            self.round.push_back(contact.id);
            PeerTasks {
                contact: contact.clone(),
                heap: BinaryHeap::new(),
            }
        });
        tasks.heap.push(QueuedTask { key, priority, seq });
    }

    fn pop(&mut self) -> Option<Task> {
        while let Some(peer) = self.round.pop_front() {
            let Some(tasks) = self.by_peer.get_mut(&peer) else {
                continue;
            };
            let Some(next) = tasks.heap.pop() else {
                self.by_peer.remove(&peer);
                continue;
            };
            let contact = tasks.contact.clone();
            if tasks.heap.is_empty() {
                self.by_peer.remove(&peer);
            } else {
                self.round.push_back(peer);
            }
            self.queued.remove(&(peer, next.key.clone()));
            return Some(Task {
                contact,
                key: next.key,
                priority: next.priority,
            });
        }
        None
    }

    fn remove_peer(&mut self, peer: &PeerId) {
        self.by_peer.remove(peer);
        self.queued.retain(|(id, _)| id != peer);
        // Stale round entries are skipped by pop().
    }
}

/// Per-peer ledgers plus the queue and worker that serve them.
pub struct DecisionEngine<S: Blockstore, N: ExchangeNetwork> {
    ledgers: Arc<Mutex<HashMap<PeerId, Arc<Mutex<Ledger>>>>>,
    queue: Arc<Mutex<TaskQueue>>,
    wake: Arc<Notify>,
    blockstore: Arc<S>,
    network: Arc<N>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Blockstore, N: ExchangeNetwork> DecisionEngine<S, N> {
    pub fn new(blockstore: Arc<S>, network: Arc<N>) -> Self {
        Self {
            ledgers: Arc::default(),
            queue: Arc::default(),
            wake: Arc::new(Notify::new()),
            blockstore,
            network,
            worker: Mutex::new(None),
        }
    }

    /// Spawn the envelope loop. Idempotent.
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }
        *worker = Some(tokio::spawn(envelope_loop(
            self.queue.clone(),
            self.wake.clone(),
            self.ledgers.clone(),
            self.blockstore.clone(),
            self.network.clone(),
        )));
    }

    /// Abort the envelope loop; queued tasks stay queued.
    pub async fn stop(&self) {
        if let Some(worker) = self.worker.lock().await.take() {
            worker.abort();
        }
    }

    async fn ledger(&self, contact: &Contact) -> Arc<Mutex<Ledger>> {
        let mut ledgers = self.ledgers.lock().await;
        ledgers
            .entry(contact.id)
            .or_insert_with(|| Arc::new(Mutex::new(Ledger::new(contact.clone()))))
            .clone()
    }

    /// Fold an inbound message into the sender's ledger.
    ///
    /// Cancels drop their wants; adds are recorded and, when the blockstore
    /// already holds the key, queued for sending. Blocks carried in the
    /// message only count toward receive accounting here; storage is the
    /// caller's job. Blockstore probe errors are logged and skipped so one
    /// bad key never poisons the rest of the message.
    pub async fn message_received(&self, from: &Contact, message: &ExchangeMessage) {
        let ledger = self.ledger(from).await;
        let mut ledger = ledger.lock().await;

        if message.full {
            ledger.wants = Default::default();
        }

        let mut queued = false;
        for entry in &message.entries {
            if entry.cancel {
                trace!(
                    peer = %hex::encode(&from.id[..8]),
                    key = %entry.key,
                    "want cancelled"
                );
                ledger.wants.remove_force(&entry.key);
                continue;
            }
            ledger.wants.add(entry.key.clone(), entry.priority);
            match self.blockstore.has(&entry.key).await {
                Ok(true) => {
                    self.queue
                        .lock()
                        .await
                        .push(from, entry.key.clone(), entry.priority);
                    queued = true;
                }
                Ok(false) => {}
                Err(err) => {
                    debug!(key = %entry.key, "blockstore probe failed: {err:#}");
                }
            }
        }

        for block in &message.blocks {
            ledger.bytes_recv += block.data.len() as u64;
        }

        if queued {
            self.wake.notify_one();
        }
    }

    /// A block just became available locally: queue it for every peer that
    /// asked, and consider those asks answered.
    pub async fn received_block(&self, block: &Block) {
        let ledgers: Vec<Arc<Mutex<Ledger>>> = {
            let ledgers = self.ledgers.lock().await;
            ledgers.values().cloned().collect()
        };

        let mut queued = false;
        for ledger in ledgers {
            let mut ledger = ledger.lock().await;
            if let Some(want) = ledger.wants.remove_force(&block.key) {
                let contact = ledger.contact.clone();
                self.queue
                    .lock()
                    .await
                    .push(&contact, want.key, want.priority);
                queued = true;
            }
        }
        if queued {
            self.wake.notify_one();
        }
    }

    /// Drop the peer's queued tasks. The ledger is kept: its wants may still
    /// be served when the peer returns.
    pub async fn peer_disconnected(&self, peer: &PeerId) {
        self.queue.lock().await.remove_peer(peer);
    }

    /// What `peer` currently wants from us.
    pub async fn wantlist_for(&self, peer: &PeerId) -> Vec<WantEntry> {
        let ledger = {
            let ledgers = self.ledgers.lock().await;
            ledgers.get(peer).cloned()
        };
        match ledger {
            Some(ledger) => ledger.lock().await.wants.entries(),
            None => Vec::new(),
        }
    }

    /// Every peer with a ledger.
    pub async fn peers(&self) -> Vec<PeerId> {
        self.ledgers.lock().await.keys().copied().collect()
    }

    /// The peer's sent-to-received ratio. Exposed for observability and
    /// future send weighting; selection does not consult it yet.
    pub async fn debt_ratio(&self, peer: &PeerId) -> Option<f64> {
        let ledger = {
            let ledgers = self.ledgers.lock().await;
            ledgers.get(peer).cloned()
        };
        match ledger {
            Some(ledger) => Some(ledger.lock().await.debt_ratio()),
            None => None,
        }
    }

    /// Bytes successfully sent to `peer`.
    pub async fn bytes_sent_to(&self, peer: &PeerId) -> u64 {
        let ledger = {
            let ledgers = self.ledgers.lock().await;
            ledgers.get(peer).cloned()
        };
        match ledger {
            Some(ledger) => ledger.lock().await.bytes_sent,
            None => 0,
        }
    }
}

/// Drains the task queue into outbound single-block messages.
///
/// A miss in the blockstore drops the task silently (the store evicted the
/// block since the task was queued); a failed send drops it too, since the
/// peer re-requests via its next full want-list.
async fn envelope_loop<S: Blockstore, N: ExchangeNetwork>(
    queue: Arc<Mutex<TaskQueue>>,
    wake: Arc<Notify>,
    ledgers: Arc<Mutex<HashMap<PeerId, Arc<Mutex<Ledger>>>>>,
    blockstore: Arc<S>,
    network: Arc<N>,
) {
    loop {
        loop {
            let task = queue.lock().await.pop();
            let Some(task) = task else { break };

            let block = match blockstore.get(&task.key).await {
                Ok(Some(block)) => block,
                Ok(None) => {
                    trace!(key = %task.key, "block gone from store, dropping task");
                    continue;
                }
                Err(err) => {
                    debug!(key = %task.key, "blockstore read failed, dropping task: {err:#}");
                    continue;
                }
            };

            let size = block.data.len() as u64;
            let mut message = ExchangeMessage::new();
            message.add_block(block);

            match network.send_message(&task.contact, message).await {
                Ok(()) => {
                    let ledger = {
                        let ledgers = ledgers.lock().await;
                        ledgers.get(&task.contact.id).cloned()
                    };
                    if let Some(ledger) = ledger {
                        let mut ledger = ledger.lock().await;
                        ledger.bytes_sent += size;
                        ledger.exchange_count += 1;
                    }
                    trace!(
                        peer = %hex::encode(&task.contact.id[..8]),
                        key = %task.key,
                        size,
                        "block sent"
                    );
                }
                Err(err) => {
                    debug!(
                        peer = %hex::encode(&task.contact.id[..8]),
                        key = %task.key,
                        "block send failed, dropping task: {err:#}"
                    );
                }
            }
        }
        wake.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(byte: u8) -> Contact {
        Contact {
            id: [byte; 32],
            addr: format!("peer-{byte}"),
        }
    }

    fn key(byte: u8) -> BlockKey {
        BlockKey::hash(&[byte])
    }

    #[test]
    fn queue_orders_by_priority_then_fifo_within_a_peer() {
        let mut queue = TaskQueue::default();
        let peer = contact(1);
        queue.push(&peer, key(1), 1);
        queue.push(&peer, key(2), 9);
        queue.push(&peer, key(3), 9);

        let order: Vec<BlockKey> = std::iter::from_fn(|| queue.pop().map(|t| t.key)).collect();
        assert_eq!(order, vec![key(2), key(3), key(1)]);
    }

    #[test]
    fn queue_round_robins_across_peers() {
        let mut queue = TaskQueue::default();
        let a = contact(1);
        let b = contact(2);
        queue.push(&a, key(1), 1);
        queue.push(&a, key(2), 1);
        queue.push(&b, key(3), 1);

        let owners: Vec<PeerId> =
            std::iter::from_fn(|| queue.pop().map(|t| t.contact.id)).collect();
        assert_eq!(owners, vec![a.id, b.id, a.id]);
    }

    #[test]
    fn queue_deduplicates_peer_key_pairs() {
        let mut queue = TaskQueue::default();
        let peer = contact(1);
        queue.push(&peer, key(1), 1);
        queue.push(&peer, key(1), 5);

        assert!(queue.pop().is_some());
        assert!(queue.pop().is_none(), "second push was a duplicate");

        // Once popped, the pair may be queued again.
        queue.push(&peer, key(1), 1);
        assert!(queue.pop().is_some());
    }

    #[test]
    fn removing_a_peer_drops_only_its_tasks() {
        let mut queue = TaskQueue::default();
        let a = contact(1);
        let b = contact(2);
        queue.push(&a, key(1), 1);
        queue.push(&b, key(2), 1);

        queue.remove_peer(&a.id);
        let rest: Vec<PeerId> = std::iter::from_fn(|| queue.pop().map(|t| t.contact.id)).collect();
        assert_eq!(rest, vec![b.id]);
    }
}
