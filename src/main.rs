use anyhow::Result;
use futures::future;
use iroh::protocol::Router;
use iroh::{Endpoint, NodeAddr, RelayMode, Watcher};
use tokio::time::{self, Duration};
use tracing_subscriber::EnvFilter;

use iroh_blockswap::{
    derive_peer_id, Contact, ExchangeNode, ExchangeProtocolHandler, IrohNetwork,
    MemoryBlockstore, PeerId, EXCHANGE_ALPN,
};

fn endpoint_peer_id(endpoint: &Endpoint) -> PeerId {
    derive_peer_id(endpoint.node_id().as_bytes())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let endpoint = Endpoint::builder()
        // Any peer selecting `EXCHANGE_ALPN` is routed to the
        // `ExchangeProtocolHandler` registered below.
        .alpns(vec![EXCHANGE_ALPN.to_vec()])
        .relay_mode(RelayMode::Default)
        .discovery_local_network()
        .bind()
        .await?;

    println!("mDNS discovery enabled; will fall back to relay if unavailable");

    let peer_id = endpoint_peer_id(&endpoint);
    let endpoint_addr: NodeAddr = endpoint.node_addr().initialized().await;

    let addr_json = serde_json::to_string(&endpoint_addr)?;
    let self_contact = Contact {
        id: peer_id,
        addr: addr_json.clone(),
    };

    println!("Block exchange node started");
    println!("  PeerId (hex): {}", hex::encode(peer_id));
    println!("  Endpoint addr JSON: {}", addr_json);

    let network = IrohNetwork {
        endpoint: endpoint.clone(),
        self_contact: self_contact.clone(),
    };

    let node = ExchangeNode::new(MemoryBlockstore::new(), network);
    node.start().await?;

    let _router = Router::builder(endpoint.clone())
        .accept(EXCHANGE_ALPN, ExchangeProtocolHandler::new(node.clone()))
        .spawn();

    let stat_node = node.clone();
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let stat = stat_node.stat().await;
            println!(
                "Stat: wantlist={}, received={}, dup_blocks={}, dup_bytes={}, peers={}",
                stat.wantlist.len(),
                stat.blocks_received,
                stat.dup_blocks_received,
                stat.dup_data_received,
                stat.peers.len(),
            );
        }
    });

    // Park the main task; peers drive the node through the router, local
    // callers through `node.get_block()` / `node.put_block()`.
    future::pending::<()>().await;
    Ok(())
}
