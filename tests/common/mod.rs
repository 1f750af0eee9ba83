use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use iroh_blockswap::{
    Block, Contact, ExchangeMessage, ExchangeNetwork, ExchangeNode, MemoryBlockstore, PeerId,
};

pub type TestExchangeNode = ExchangeNode<Arc<MemoryBlockstore>, TestNetwork>;

/// In-memory [`ExchangeNetwork`]: deliveries are dispatched straight into the
/// receiving node's handler through a shared registry, with per-peer failure
/// injection and a log of successful sends.
#[derive(Clone)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    self_contact: Contact,
    failures: Arc<Mutex<HashSet<PeerId>>>,
    sent: Arc<Mutex<Vec<(PeerId, ExchangeMessage)>>>,
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>, self_contact: Contact) -> Self {
        Self {
            registry,
            self_contact,
            failures: Arc::new(Mutex::new(HashSet::new())),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn set_failure(&self, peer: PeerId, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(peer);
        } else {
            failures.remove(&peer);
        }
    }

    /// Messages successfully delivered, in send order.
    pub async fn sent_messages(&self) -> Vec<(PeerId, ExchangeMessage)> {
        self.sent.lock().await.clone()
    }

    /// Messages successfully delivered to one peer.
    pub async fn sent_to(&self, peer: &PeerId) -> Vec<ExchangeMessage> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(id, _)| id == peer)
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    async fn should_fail(&self, peer: &PeerId) -> bool {
        self.failures.lock().await.contains(peer)
    }
}

#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<PeerId, TestExchangeNode>>,
}

impl NetworkRegistry {
    pub async fn register(&self, contact: &Contact, node: &TestExchangeNode) {
        let mut peers = self.peers.write().await;
        peers.insert(contact.id, node.clone());
    }

    pub async fn get(&self, id: &PeerId) -> Option<TestExchangeNode> {
        let peers = self.peers.read().await;
        peers.get(id).cloned()
    }
}

#[async_trait]
impl ExchangeNetwork for TestNetwork {
    async fn connect_to(&self, peer: &Contact) -> Result<()> {
        if self.should_fail(&peer.id).await {
            return Err(anyhow!("injected network failure"));
        }
        Ok(())
    }

    async fn send_message(&self, to: &Contact, message: ExchangeMessage) -> Result<()> {
        if self.should_fail(&to.id).await {
            return Err(anyhow!("injected network failure"));
        }
        let Some(peer) = self.registry.get(&to.id).await else {
            return Err(anyhow!("peer not reachable"));
        };
        peer.handle_message(&self.self_contact, message.clone())
            .await?;
        let mut sent = self.sent.lock().await;
        sent.push((to.id, message));
        Ok(())
    }
}

pub struct TestNode {
    pub node: TestExchangeNode,
    pub network: TestNetwork,
    pub store: Arc<MemoryBlockstore>,
    contact: Contact,
}

impl TestNode {
    pub async fn new(registry: Arc<NetworkRegistry>, index: u32) -> Self {
        let fixture = Self::new_stopped(registry, index).await;
        fixture.node.start().await.expect("node starts");
        fixture
    }

    /// A node whose envelope loop has not been started yet; queued tasks
    /// stay queued until `node.start()`.
    pub async fn new_stopped(registry: Arc<NetworkRegistry>, index: u32) -> Self {
        let contact = make_contact(index);
        let network = TestNetwork::new(registry.clone(), contact.clone());
        let store = Arc::new(MemoryBlockstore::new());
        let node = ExchangeNode::new(store.clone(), network.clone());
        registry.register(&contact, &node).await;
        Self {
            node,
            network,
            store,
            contact,
        }
    }

    pub fn contact(&self) -> Contact {
        self.contact.clone()
    }

    pub fn id(&self) -> PeerId {
        self.contact.id
    }
}

pub fn make_peer_id(index: u32) -> PeerId {
    let mut id = [0u8; 32];
    id[..4].copy_from_slice(&index.to_be_bytes());
    id
}

pub fn make_contact(index: u32) -> Contact {
    Contact {
        id: make_peer_id(index),
        addr: format!("peer-{index}"),
    }
}

pub fn make_block(tag: &str) -> Block {
    Block::new(format!("block-{tag}").into_bytes())
}
