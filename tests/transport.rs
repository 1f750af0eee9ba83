//! End-to-end checks of the iroh transport path: framed deliveries over a
//! real QUIC connection, and session survival across malformed frames.

use anyhow::Result;
use iroh::{protocol::Router, Endpoint, RelayMode, Watcher};
use tokio::io::AsyncWriteExt;
use tokio::time::{sleep, timeout, Duration};

use iroh_blockswap::framing::{read_frame, write_frame, MAX_FRAME_LEN};
use iroh_blockswap::protocol::encode_delivery;
use iroh_blockswap::{
    derive_peer_id, Block, Contact, Delivery, ExchangeMessage, ExchangeNode,
    ExchangeProtocolHandler, IrohNetwork, MemoryBlockstore, EXCHANGE_ALPN,
};

async fn bind_endpoint() -> Result<Endpoint> {
    let endpoint = Endpoint::builder()
        .alpns(vec![EXCHANGE_ALPN.to_vec()])
        .relay_mode(RelayMode::Disabled)
        .bind()
        .await?;
    // Give the socket a moment to learn its direct addresses.
    sleep(Duration::from_millis(100)).await;
    Ok(endpoint)
}

async fn contact_for(endpoint: &Endpoint) -> Result<Contact> {
    Ok(Contact {
        id: derive_peer_id(endpoint.node_id().as_bytes()),
        addr: serde_json::to_string(&endpoint.node_addr().initialized().await)?,
    })
}

#[tokio::test]
async fn malformed_frames_do_not_tear_down_the_session() -> Result<()> {
    let server_endpoint = bind_endpoint().await?;
    let server_contact = contact_for(&server_endpoint).await?;
    let network = IrohNetwork {
        endpoint: server_endpoint.clone(),
        self_contact: server_contact,
    };
    let node = ExchangeNode::new(MemoryBlockstore::new(), network);
    node.start().await?;
    let _router = Router::builder(server_endpoint.clone())
        .accept(EXCHANGE_ALPN, ExchangeProtocolHandler::new(node.clone()))
        .spawn();

    let client_endpoint = bind_endpoint().await?;
    let client_contact = contact_for(&client_endpoint).await?;
    let connection = client_endpoint
        .connect(server_endpoint.node_addr().initialized().await, EXCHANGE_ALPN)
        .await?;

    // An announced length over the cap is rejected before allocation.
    {
        let (mut send, _recv) = connection.open_bi().await?;
        send.write_u32_le((MAX_FRAME_LEN + 1) as u32).await?;
        send.finish()?;
    }
    sleep(Duration::from_millis(100)).await;

    // A frame that ends before its announced length.
    {
        let (mut send, _recv) = connection.open_bi().await?;
        send.write_u32_le(512).await?;
        send.write_all(b"short").await?;
        send.finish()?;
    }
    sleep(Duration::from_millis(100)).await;

    // A well-framed payload that is not a delivery.
    {
        let (mut send, _recv) = connection.open_bi().await?;
        write_frame(&mut send, b"not a delivery").await?;
        send.finish()?;
    }
    sleep(Duration::from_millis(100)).await;

    // The same connection still carries a valid delivery to completion.
    let block = Block::new(b"survives-garbage".to_vec());
    let mut message = ExchangeMessage::new();
    message.add_block(block.clone());
    let payload = encode_delivery(&Delivery {
        from: client_contact,
        message,
    })?;

    let (mut send, mut recv) = connection.open_bi().await?;
    write_frame(&mut send, &payload).await?;
    send.finish()?;
    let ack = timeout(Duration::from_secs(5), read_frame(&mut recv))
        .await
        .expect("session should still acknowledge valid deliveries")?;
    assert!(ack.is_some(), "valid delivery is acknowledged");

    let stat = node.stat().await;
    assert_eq!(stat.blocks_received, 1);
    assert_eq!(node.get_block(&block.key).await?, block);
    Ok(())
}
