//! Accept side of the exchange protocol.
//!
//! [`ExchangeProtocolHandler`] plugs into iroh's router for connections
//! negotiated with [`EXCHANGE_ALPN`](crate::net::EXCHANGE_ALPN). Streams on a
//! connection are processed one at a time, which is what gives a peer FIFO
//! delivery of its messages; the ack frame is written only after the node has
//! finished storing or deduplicating every block in the message.
//!
//! # Usage
//!
//! ```ignore
//! let handler = ExchangeProtocolHandler::new(node);
//! let router = Router::builder(endpoint.clone())
//!     .accept(EXCHANGE_ALPN, handler)
//!     .spawn();
//! ```

use std::fmt;

use anyhow::Result;
use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler};
use tracing::{debug, trace};

use crate::core::{Blockstore, ExchangeNetwork};
use crate::framing::{read_frame, write_frame};
use crate::node::ExchangeNode;
use crate::protocol::decode_delivery;

/// Protocol handler feeding inbound exchange connections into a node.
pub struct ExchangeProtocolHandler<S: Blockstore, N: ExchangeNetwork> {
    node: ExchangeNode<S, N>,
}

impl<S: Blockstore, N: ExchangeNetwork> ExchangeProtocolHandler<S, N> {
    pub fn new(node: ExchangeNode<S, N>) -> Self {
        Self { node }
    }
}

impl<S: Blockstore, N: ExchangeNetwork> Clone for ExchangeProtocolHandler<S, N> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<S: Blockstore, N: ExchangeNetwork> fmt::Debug for ExchangeProtocolHandler<S, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeProtocolHandler").finish()
    }
}

impl<S: Blockstore, N: ExchangeNetwork> ProtocolHandler for ExchangeProtocolHandler<S, N> {
    fn accept(
        &self,
        connection: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let node = self.node.clone();
        async move {
            // A failed connection is this peer's problem, not the router's.
            if let Err(err) = handle_connection(node, connection).await {
                debug!("connection handler failed: {err:#}");
            }
            Ok(())
        }
    }
}

/// Serve one inbound connection until the peer closes it.
///
/// A frame that cannot be read (oversized, truncated) or decoded is logged
/// and skipped; the connection survives a malformed message. Only the
/// transport closing the connection ends the loop.
pub async fn handle_connection<S: Blockstore, N: ExchangeNetwork>(
    node: ExchangeNode<S, N>,
    connection: Connection,
) -> Result<()> {
    loop {
        let (mut send, mut recv) = match connection.accept_bi().await {
            Ok(streams) => streams,
            Err(err) => {
                trace!("connection closed: {err:#}");
                break;
            }
        };

        let payload = match read_frame(&mut recv).await {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(err) => {
                debug!("discarding unreadable frame: {err:#}");
                continue;
            }
        };
        let delivery = match decode_delivery(&payload) {
            Ok(delivery) => delivery,
            Err(err) => {
                debug!("discarding malformed message: {err:#}");
                continue;
            }
        };

        trace!(
            peer = %hex::encode(&delivery.from.id[..8]),
            entries = delivery.message.entries.len(),
            blocks = delivery.message.blocks.len(),
            full = delivery.message.full,
            "handling delivery"
        );

        // A delivery proves the peer is reachable; idempotent after the first.
        node.peer_connected(delivery.from.clone()).await;

        if let Err(err) = node.handle_message(&delivery.from, delivery.message).await {
            node.handle_receive_error(&err);
        }

        // The message is already processed; a lost ack only costs the
        // sender a retry, never the session.
        if let Err(err) = write_frame(&mut send, &[1]).await {
            debug!("ack write failed: {err:#}");
            continue;
        }
        send.finish().ok();
    }
    Ok(())
}
