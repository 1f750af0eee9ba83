use anyhow::{ensure, Result};
use async_trait::async_trait;
use iroh::Endpoint;
use iroh::NodeAddr;

use crate::core::{Contact, ExchangeNetwork};
use crate::framing::{read_frame, write_frame};
use crate::protocol::{encode_delivery, Delivery, ExchangeMessage};

pub const EXCHANGE_ALPN: &[u8] = b"myapp/blockswap/1";

/// [`ExchangeNetwork`] over iroh QUIC sessions.
///
/// Each delivery travels on its own bidirectional stream: one frame out, one
/// ack frame back, so a send only succeeds once the peer has processed the
/// message. Connection reuse is the endpoint's business.
pub struct IrohNetwork {
    pub endpoint: Endpoint,
    pub self_contact: Contact,
}

impl IrohNetwork {
    fn parse_addr(&self, contact: &Contact) -> Result<NodeAddr> {
        Ok(serde_json::from_str(&contact.addr)?)
    }
}

#[async_trait]
impl ExchangeNetwork for IrohNetwork {
    async fn connect_to(&self, peer: &Contact) -> Result<()> {
        let addr = self.parse_addr(peer)?;
        self.endpoint.connect(addr, EXCHANGE_ALPN).await?;
        Ok(())
    }

    async fn send_message(&self, to: &Contact, message: ExchangeMessage) -> Result<()> {
        let addr = self.parse_addr(to)?;
        let connection = self.endpoint.connect(addr, EXCHANGE_ALPN).await?;
        let (mut send, mut recv) = connection.open_bi().await?;

        let payload = encode_delivery(&Delivery {
            from: self.self_contact.clone(),
            message,
        })?;
        write_frame(&mut send, &payload).await?;
        send.finish()?;

        let ack = read_frame(&mut recv).await?;
        ensure!(ack.is_some(), "stream closed before acknowledgement");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.endpoint.close().await;
        Ok(())
    }
}
