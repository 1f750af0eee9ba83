//! # Iroh Blockswap
//!
//! This crate exposes a content-addressed block exchange built on top of the
//! [`iroh`](https://crates.io/crates/iroh) transport stack. A node maintains
//! a want-list of blocks it needs, broadcasts it to connected peers, answers
//! their want-lists from a local blockstore, and ingests blocks pushed back
//! in response, coping with concurrent requests, peer churn, duplicate
//! deliveries and partial failure.
//!
//! The crate is split into a handful of modules that can be reused
//! independently:
//!
//! - [`core`]: the transport-agnostic exchange state: keys and blocks, the
//!   refcounted [`WantList`], per-peer [`Ledger`]s, the [`Blockstore`] and
//!   [`ExchangeNetwork`] traits, and the block-event waiter registry.
//! - [`wantmanager`]: the outgoing side, with per-peer message queues that
//!   coalesce want-list changes and back off on failed sends.
//! - [`engine`]: the incoming side: the decision engine's task queue and
//!   the envelope loop that sends blocks to the peers that asked.
//! - [`node`]: the [`ExchangeNode`] orchestrator with the `get` API and the
//!   [`stat`](ExchangeNode::stat) snapshot.
//! - [`protocol`]: the bincode-serialized wire messages.
//! - [`framing`]: helpers for length-prefixed frames over QUIC streams.
//! - [`net`] / [`server`]: the iroh-based transport and its accept side.
//!
//! ## Getting started
//!
//! Construct a node from a blockstore and a network, start it, and hand its
//! protocol handler to the transport's router:
//!
//! ```no_run
//! use anyhow::Result;
//! use iroh::{Endpoint, Watcher, protocol::Router};
//! use iroh_blockswap::{
//!     derive_peer_id, Contact, ExchangeNode, ExchangeProtocolHandler, IrohNetwork,
//!     MemoryBlockstore, EXCHANGE_ALPN,
//! };
//!
//! # async fn launch(endpoint: Endpoint) -> Result<()> {
//! let self_contact = Contact {
//!     id: derive_peer_id(endpoint.node_id().as_bytes()),
//!     addr: serde_json::to_string(&endpoint.node_addr().initialized().await)?,
//! };
//! let network = IrohNetwork {
//!     endpoint: endpoint.clone(),
//!     self_contact,
//! };
//! let node = ExchangeNode::new(MemoryBlockstore::new(), network);
//! node.start().await?;
//! let router = Router::builder(endpoint)
//!     .accept(EXCHANGE_ALPN, ExchangeProtocolHandler::new(node.clone()))
//!     .spawn();
//! // The node can now serve peers and fetch blocks.
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` wires these pieces into a self-contained
//! exchange node that discovers peers via mDNS with relay fallback.

pub mod core;
pub mod engine;
pub mod framing;
pub mod net;
pub mod node;
pub mod protocol;
pub mod server;
pub mod wantmanager;

pub use self::core::{
    derive_peer_id, peer_id_base58, peer_id_hex, retry, Block, BlockEvent, BlockKey, Blockstore,
    BlockWaiters, Contact, ExchangeNetwork, Ledger, MemoryBlockstore, PeerId, Priority,
    RetryPolicy, WantEntry, WantList, DEFAULT_PRIORITY,
};
pub use self::engine::DecisionEngine;
pub use self::net::{IrohNetwork, EXCHANGE_ALPN};
pub use self::node::{ExchangeNode, StatSnapshot};
pub use self::protocol::{Delivery, ExchangeMessage, MessageEntry};
pub use self::server::{handle_connection, ExchangeProtocolHandler};
pub use self::wantmanager::WantManager;
