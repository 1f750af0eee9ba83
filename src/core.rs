//! Transport-agnostic building blocks of the block exchange:
//!
//! - **Identity & Hashing**: [`BlockKey`], [`PeerId`], [`derive_peer_id`]
//! - **Data**: [`Block`], [`Contact`]
//! - **Want state**: [`WantList`], [`WantEntry`], [`Ledger`]
//! - **Collaborators**: the [`Blockstore`] and [`ExchangeNetwork`] traits,
//!   plus the in-memory [`MemoryBlockstore`]
//! - **Wakeups**: [`BlockWaiters`], the keyed registry that multicasts block
//!   arrivals and unwants to pending local requests
//! - **Retry**: [`RetryPolicy`] and the [`retry`] helper

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use iroh_blake3::Hasher;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::protocol::ExchangeMessage;

// ============================================================================
// Type Aliases
// ============================================================================

/// A 256-bit identifier for exchange peers.
///
/// Peer IDs are derived from the peer's transport public key with BLAKE3,
/// giving a uniform distribution across the identifier space.
pub type PeerId = [u8; 32];

/// Want priority; higher values are served first.
pub type Priority = i32;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Priority assigned to wants that do not specify one.
pub const DEFAULT_PRIORITY: Priority = 1;

/// Attempts made to persist a block before giving up.
pub(crate) const PUT_RETRY_ATTEMPTS: usize = 4;

/// Pause between blockstore put attempts.
pub(crate) const PUT_RETRY_INTERVAL: Duration = Duration::from_millis(400);

/// How many blocks of a single inbound message are ingested concurrently.
pub(crate) const INGEST_CONCURRENCY: usize = 10;

/// First pause after a failed want-list send to a peer.
pub(crate) const SEND_RETRY_INITIAL: Duration = Duration::from_millis(100);

/// Ceiling for the send backoff; doubling stops here.
pub(crate) const SEND_RETRY_CAP: Duration = Duration::from_secs(10);

/// Maximum pending local requests per key before registration is refused.
const MAX_WAITERS_PER_KEY: usize = 1024;

/// Default entry capacity of the in-memory blockstore.
const MEMORY_STORE_MAX_BLOCKS: usize = 100_000;

/// Multihash code for BLAKE3 (32-byte digest).
const MULTIHASH_BLAKE3: u8 = 0x1e;

/// Digest length used by the crate's native hash function.
const BLAKE3_DIGEST_LEN: u8 = 32;

// ============================================================================
// Hashing & Identity
// ============================================================================

fn blake3_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(data);
    let digest = hasher.finalize();

    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_bytes());
    out
}

/// Derive a stable 32-byte [`PeerId`] by hashing arbitrary input with BLAKE3.
///
/// Typically used to derive a peer's exchange identity from its transport
/// public key:
///
/// ```
/// use iroh_blockswap::derive_peer_id;
///
/// let public_key = b"example-public-key-bytes";
/// let peer_id = derive_peer_id(public_key);
/// assert_eq!(peer_id.len(), 32);
/// ```
pub fn derive_peer_id(data: &[u8]) -> PeerId {
    blake3_digest(data)
}

/// Short hex form of a peer id for log lines.
pub fn peer_id_hex(id: &PeerId) -> String {
    hex::encode(id)
}

/// Canonical base58 form of a peer id.
pub fn peer_id_base58(id: &PeerId) -> String {
    bs58::encode(id).into_string()
}

/// A content address: a binary multihash kept in its encoded form
/// (hash code, digest length, digest).
///
/// Equality, ordering and hashing are byte-wise over the encoded form, so
/// keys are directly usable in maps and sorted structures. Only single-byte
/// varint codes are handled, which covers every hash function this crate
/// produces or accepts.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockKey(Vec<u8>);

impl BlockKey {
    /// Hash `data` with BLAKE3 and wrap the digest as a multihash key.
    ///
    /// ```
    /// use iroh_blockswap::BlockKey;
    ///
    /// let key = BlockKey::hash(b"hello world");
    /// // The same content always produces the same key
    /// assert_eq!(key, BlockKey::hash(b"hello world"));
    /// ```
    pub fn hash(data: &[u8]) -> Self {
        let digest = blake3_digest(data);
        let mut bytes = Vec::with_capacity(2 + digest.len());
        bytes.push(MULTIHASH_BLAKE3);
        bytes.push(BLAKE3_DIGEST_LEN);
        bytes.extend_from_slice(&digest);
        Self(bytes)
    }

    /// Wrap an already-encoded multihash. Rejects inputs whose declared
    /// digest length does not match the payload.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < 2 {
            bail!("multihash too short: {} bytes", bytes.len());
        }
        if bytes[0] >= 0x80 || bytes[1] >= 0x80 {
            bail!("multi-byte varint multihash headers are not supported");
        }
        let declared = bytes[1] as usize;
        if bytes.len() != 2 + declared {
            bail!(
                "multihash digest length mismatch: declared {declared}, got {}",
                bytes.len() - 2
            );
        }
        Ok(Self(bytes))
    }

    /// The encoded multihash.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The hash function code.
    pub fn hash_code(&self) -> u8 {
        self.0[0]
    }

    /// The raw digest, without the header.
    pub fn digest(&self) -> &[u8] {
        &self.0[2..]
    }

    /// Canonical base58 rendering, used in logs and error messages.
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockKey({})", self.to_base58())
    }
}

/// An immutable `(key, data)` pair. The key is presumed to be the multihash
/// of the data; [`Block::verify`] checks that presumption where it can.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub key: BlockKey,
    pub data: Vec<u8>,
}

impl Block {
    /// Build a block from raw content, deriving the key.
    pub fn new(data: Vec<u8>) -> Self {
        let key = BlockKey::hash(&data);
        Self { key, data }
    }

    /// Pair an externally supplied key with content.
    pub fn with_key(key: BlockKey, data: Vec<u8>) -> Self {
        Self { key, data }
    }

    /// Check the key against the data. Keys carrying a hash function this
    /// crate cannot compute are accepted as-is.
    pub fn verify(&self) -> bool {
        if self.key.hash_code() != MULTIHASH_BLAKE3 {
            return true;
        }
        blake3_digest(&self.data) == self.key.digest()
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("key", &self.key)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Another exchange peer: its id plus a serialized transport address.
///
/// The address is stored as a JSON-serialized iroh endpoint address so the
/// engine can push blocks back without a live session object.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Contact {
    /// The peer's unique identifier (BLAKE3 hash of its public key).
    pub id: PeerId,
    /// JSON-serialized endpoint address for connecting to this peer.
    pub addr: String,
}

// ============================================================================
// Want List
// ============================================================================

/// A live desire for one block.
#[derive(Clone, Debug)]
pub struct WantEntry {
    pub key: BlockKey,
    pub priority: Priority,
    /// Number of outstanding local requests holding this entry open.
    pub refcount: usize,
    seq: u64,
}

/// Ordered, reference-counted set of want entries keyed by block key.
///
/// "Ordered" means [`WantList::entries`] iterates by descending priority with
/// insertion order breaking ties. The structure does no locking of its own;
/// callers serialize access.
#[derive(Debug, Default, Clone)]
pub struct WantList {
    entries: HashMap<BlockKey, WantEntry>,
    next_seq: u64,
}

impl WantList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one more request for `key`. An existing entry gains a
    /// reference and keeps the higher of the two priorities. Returns true
    /// when the entry is new.
    pub fn add(&mut self, key: BlockKey, priority: Priority) -> bool {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.refcount += 1;
                entry.priority = entry.priority.max(priority);
                false
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.entries.insert(
                    key.clone(),
                    WantEntry {
                        key,
                        priority,
                        refcount: 1,
                        seq,
                    },
                );
                true
            }
        }
    }

    /// Drop one reference. The entry is returned only when the refcount hits
    /// zero and it is actually removed, so the caller knows when to emit a
    /// cancel. Removing an absent key is a no-op.
    pub fn remove(&mut self, key: &BlockKey) -> Option<WantEntry> {
        let entry = self.entries.get_mut(key)?;
        entry.refcount -= 1;
        if entry.refcount == 0 {
            return self.entries.remove(key);
        }
        None
    }

    /// Remove the entry regardless of how many references hold it open.
    pub fn remove_force(&mut self, key: &BlockKey) -> Option<WantEntry> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &BlockKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &BlockKey) -> Option<&WantEntry> {
        self.entries.get(key)
    }

    /// Stable snapshot, ordered by `(-priority, insertion)`.
    pub fn entries(&self) -> Vec<WantEntry> {
        let mut all: Vec<WantEntry> = self.entries.values().cloned().collect();
        all.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// Per-peer accounting record kept by the decision engine.
///
/// Ledgers survive disconnects: the peer may still be owed blocks when it
/// returns.
#[derive(Debug)]
pub struct Ledger {
    pub contact: Contact,
    /// Payload bytes shipped to this peer.
    pub bytes_sent: u64,
    /// Payload bytes delivered by this peer.
    pub bytes_recv: u64,
    /// Blocks successfully sent to this peer.
    pub exchange_count: u64,
    /// What this peer currently asks of us.
    pub wants: WantList,
}

impl Ledger {
    pub fn new(contact: Contact) -> Self {
        Self {
            contact,
            bytes_sent: 0,
            bytes_recv: 0,
            exchange_count: 0,
            wants: WantList::new(),
        }
    }

    /// Sent-to-received ratio, the fairness input for future send weighting.
    pub fn debt_ratio(&self) -> f64 {
        self.bytes_sent as f64 / (self.bytes_recv.max(1)) as f64
    }
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// A persistent content-addressed byte store.
///
/// The store owns the key-matches-data invariant; the exchange core never
/// re-hashes delivered payloads. Implementations must tolerate concurrent
/// calls from inbound message handlers and the envelope loop.
#[async_trait]
pub trait Blockstore: Send + Sync + 'static {
    async fn has(&self, key: &BlockKey) -> Result<bool>;

    async fn get(&self, key: &BlockKey) -> Result<Option<Block>>;

    /// Insert a block. Idempotent with respect to the key.
    async fn put(&self, block: Block) -> Result<()>;
}

#[async_trait]
impl<T: Blockstore> Blockstore for Arc<T> {
    async fn has(&self, key: &BlockKey) -> Result<bool> {
        Blockstore::has(self.as_ref(), key).await
    }

    async fn get(&self, key: &BlockKey) -> Result<Option<Block>> {
        Blockstore::get(self.as_ref(), key).await
    }

    async fn put(&self, block: Block) -> Result<()> {
        Blockstore::put(self.as_ref(), block).await
    }
}

/// Transport abstraction for exchange traffic.
///
/// Messages are best-effort advisories; a failed send is reported but never
/// retried at this layer. Tests use an in-memory implementation, production
/// uses [`crate::net::IrohNetwork`].
#[async_trait]
pub trait ExchangeNetwork: Send + Sync + 'static {
    /// Ensure a session to `peer` exists.
    async fn connect_to(&self, peer: &Contact) -> Result<()>;

    /// Deliver one message. Returns once the peer acknowledged receipt, or
    /// with the delivery failure.
    async fn send_message(&self, to: &Contact, message: ExchangeMessage) -> Result<()>;

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory Blockstore
// ─────────────────────────────────────────────────────────────────────────────

/// LRU-bounded in-memory [`Blockstore`].
///
/// Validates blake3-coded keys on `put`; eviction is capacity-driven, so the
/// envelope loop has to tolerate a miss for a task it queued earlier.
pub struct MemoryBlockstore {
    blocks: Mutex<LruCache<BlockKey, Vec<u8>>>,
}

impl MemoryBlockstore {
    pub fn new() -> Self {
        Self::with_capacity(MEMORY_STORE_MAX_BLOCKS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).expect("capacity must be non-zero");
        Self {
            blocks: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Number of resident blocks.
    pub async fn len(&self) -> usize {
        self.blocks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blocks.lock().await.is_empty()
    }
}

impl Default for MemoryBlockstore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Blockstore for MemoryBlockstore {
    async fn has(&self, key: &BlockKey) -> Result<bool> {
        Ok(self.blocks.lock().await.contains(key))
    }

    async fn get(&self, key: &BlockKey) -> Result<Option<Block>> {
        let mut blocks = self.blocks.lock().await;
        Ok(blocks
            .get(key)
            .map(|data| Block::with_key(key.clone(), data.clone())))
    }

    async fn put(&self, block: Block) -> Result<()> {
        if !block.verify() {
            bail!("block data does not match key {}", block.key);
        }
        self.blocks.lock().await.put(block.key, block.data);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Block Event Waiters
// ─────────────────────────────────────────────────────────────────────────────

/// What a pending local request is woken with.
#[derive(Clone, Debug)]
pub enum BlockEvent {
    /// The block is now locally available.
    Arrived(Block),
    /// The want was withdrawn before the block arrived.
    Unwanted,
}

/// Keyed one-shot waiter registry.
///
/// Every concurrent `get` for a key registers its own receiver; firing an
/// event drains and wakes all of them, so N callers share one fetch.
/// Registration and firing are serialized by the same mutex; the get path
/// closes the remaining register-vs-put race by re-checking the store after
/// registering.
#[derive(Debug, Default)]
pub struct BlockWaiters {
    waiters: Mutex<HashMap<BlockKey, Vec<oneshot::Sender<BlockEvent>>>>,
}

impl BlockWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `key`. Fails when the per-key cap is reached.
    pub async fn register(&self, key: &BlockKey) -> Result<oneshot::Receiver<BlockEvent>> {
        let mut waiters = self.waiters.lock().await;
        let slot = waiters.entry(key.clone()).or_default();
        if slot.len() >= MAX_WAITERS_PER_KEY {
            return Err(anyhow!("too many pending requests for {key}"));
        }
        let (tx, rx) = oneshot::channel();
        slot.push(tx);
        Ok(rx)
    }

    /// Wake every waiter for the block's key with the block itself.
    pub async fn arrived(&self, block: &Block) {
        let pending = {
            let mut waiters = self.waiters.lock().await;
            waiters.remove(&block.key)
        };
        if let Some(pending) = pending {
            for tx in pending {
                // Receiver may have given up; nothing to do then.
                let _ = tx.send(BlockEvent::Arrived(block.clone()));
            }
        }
    }

    /// Wake every waiter for `key` with [`BlockEvent::Unwanted`].
    pub async fn unwanted(&self, key: &BlockKey) {
        let pending = {
            let mut waiters = self.waiters.lock().await;
            waiters.remove(key)
        };
        if let Some(pending) = pending {
            for tx in pending {
                let _ = tx.send(BlockEvent::Unwanted);
            }
        }
    }

    /// Waiters currently registered for `key`.
    pub async fn pending(&self, key: &BlockKey) -> usize {
        let waiters = self.waiters.lock().await;
        waiters.get(key).map(Vec::len).unwrap_or(0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Retry
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded retry schedule for a fallible async operation.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub initial_delay: Duration,
    pub backoff_factor: u32,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Fixed-interval schedule: `attempts` tries, `interval` apart.
    pub const fn fixed(attempts: usize, interval: Duration) -> Self {
        Self {
            attempts,
            initial_delay: interval,
            backoff_factor: 1,
            max_delay: interval,
        }
    }

    /// Doubling schedule starting at `initial`, capped at `max`.
    pub const fn exponential(attempts: usize, initial: Duration, max: Duration) -> Self {
        Self {
            attempts,
            initial_delay: initial,
            backoff_factor: 2,
            max_delay: max,
        }
    }
}

/// Run `op` until it succeeds or the policy's attempts are exhausted; the
/// last error is returned.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = policy.initial_delay;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= policy.attempts.max(1) => return Err(err),
            Err(err) => {
                debug!(attempt, "retryable operation failed: {err:#}");
                sleep(delay).await;
                delay = (delay * policy.backoff_factor).min(policy.max_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(byte: u8) -> BlockKey {
        BlockKey::hash(&[byte])
    }

    #[test]
    fn block_key_is_deterministic_and_prefixed() {
        let a = BlockKey::hash(b"hello world");
        let b = BlockKey::hash(b"hello world");
        assert_eq!(a, b, "keys of identical data should match");
        assert_ne!(a, BlockKey::hash(b"goodbye world"));

        assert_eq!(a.hash_code(), 0x1e);
        assert_eq!(a.digest().len(), 32);
        assert_eq!(a.as_bytes().len(), 34);
    }

    #[test]
    fn block_key_round_trips_through_bytes() {
        let original = BlockKey::hash(b"payload");
        let parsed = BlockKey::from_bytes(original.as_bytes().to_vec()).expect("valid multihash");
        assert_eq!(original, parsed);

        assert!(BlockKey::from_bytes(vec![0x1e]).is_err());
        assert!(BlockKey::from_bytes(vec![0x1e, 32, 0, 0]).is_err());
    }

    #[test]
    fn block_verify_detects_mismatched_data() {
        let block = Block::new(b"my data".to_vec());
        assert!(block.verify());

        let forged = Block::with_key(block.key.clone(), b"wrong data".to_vec());
        assert!(!forged.verify());
    }

    #[test]
    fn wantlist_refcounts_shared_keys() {
        let mut wl = WantList::new();
        assert!(wl.add(key(1), 1));
        assert!(!wl.add(key(1), 5));

        let entry = wl.get(&key(1)).expect("entry present");
        assert_eq!(entry.refcount, 2);
        assert_eq!(entry.priority, 5, "priority keeps the max");

        assert!(wl.remove(&key(1)).is_none(), "first decref keeps the entry");
        assert!(wl.contains(&key(1)));
        let dropped = wl.remove(&key(1)).expect("second decref removes");
        assert_eq!(dropped.key, key(1));
        assert!(!wl.contains(&key(1)));

        assert!(wl.remove(&key(1)).is_none(), "removing absent key is a no-op");
    }

    #[test]
    fn wantlist_orders_by_priority_then_insertion() {
        let mut wl = WantList::new();
        wl.add(key(1), 1);
        wl.add(key(2), 9);
        wl.add(key(3), 9);
        wl.add(key(4), 4);

        let order: Vec<BlockKey> = wl.entries().into_iter().map(|e| e.key).collect();
        assert_eq!(order, vec![key(2), key(3), key(4), key(1)]);
    }

    #[test]
    fn wantlist_force_remove_ignores_refcount() {
        let mut wl = WantList::new();
        wl.add(key(7), 1);
        wl.add(key(7), 1);
        let removed = wl.remove_force(&key(7)).expect("entry removed");
        assert_eq!(removed.refcount, 2);
        assert!(wl.is_empty());
    }

    #[test]
    fn ledger_debt_ratio_never_divides_by_zero() {
        let mut ledger = Ledger::new(Contact {
            id: [0u8; 32],
            addr: String::new(),
        });
        assert_eq!(ledger.debt_ratio(), 0.0);
        ledger.bytes_sent = 10;
        assert_eq!(ledger.debt_ratio(), 10.0);
        ledger.bytes_recv = 4;
        assert_eq!(ledger.debt_ratio(), 2.5);
    }

    #[tokio::test]
    async fn memory_blockstore_round_trips_blocks() {
        let store = MemoryBlockstore::new();
        let block = Block::new(b"round trip".to_vec());

        assert!(!store.has(&block.key).await.unwrap());
        store.put(block.clone()).await.unwrap();
        assert!(store.has(&block.key).await.unwrap());
        assert_eq!(store.get(&block.key).await.unwrap(), Some(block));
    }

    #[tokio::test]
    async fn memory_blockstore_rejects_forged_keys() {
        let store = MemoryBlockstore::new();
        let forged = Block::with_key(BlockKey::hash(b"a"), b"b".to_vec());
        assert!(store.put(forged).await.is_err());
    }

    #[tokio::test]
    async fn waiters_multicast_to_every_registration() {
        let waiters = BlockWaiters::new();
        let block = Block::new(b"wanted".to_vec());

        let rx1 = waiters.register(&block.key).await.unwrap();
        let rx2 = waiters.register(&block.key).await.unwrap();
        assert_eq!(waiters.pending(&block.key).await, 2);

        waiters.arrived(&block).await;
        assert!(matches!(rx1.await.unwrap(), BlockEvent::Arrived(b) if b == block));
        assert!(matches!(rx2.await.unwrap(), BlockEvent::Arrived(b) if b == block));
        assert_eq!(waiters.pending(&block.key).await, 0);
    }

    #[tokio::test]
    async fn waiters_fire_unwants() {
        let waiters = BlockWaiters::new();
        let k = key(9);
        let rx = waiters.register(&k).await.unwrap();
        waiters.unwanted(&k).await;
        assert!(matches!(rx.await.unwrap(), BlockEvent::Unwanted));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_after_configured_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry(RetryPolicy::fixed(4, Duration::from_millis(400)), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow!("still broken")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_returns_first_success() {
        let calls = AtomicUsize::new(0);
        let value = retry(
            RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10)),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(anyhow!("not yet"))
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(value, 2);
    }
}
