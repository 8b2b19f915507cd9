//! The channel contract the core depends on.
//!
//! A channel is a bidirectional, message-oriented pipe of raw JSON values. It
//! can close at any time; closure is observed as [`Channel::recv`] returning
//! `None` or a send failing. Adapters (native port, worker thread) pump their
//! real transport into this shape and stop when the shutdown token fires.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::protocol::WireMessage;
use crate::error::RpcError;
use crate::transport::TransportError;

/// Cloneable send half, handed to tasks that reply outside the event loop.
#[derive(Clone, Debug)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<Value>,
}

impl ChannelSender {
    pub fn send(&self, message: impl Into<WireMessage>) -> Result<(), RpcError> {
        self.send_raw(message.into().encode())
    }

    pub fn send_raw(&self, value: Value) -> Result<(), RpcError> {
        self.tx.send(value).map_err(|_| RpcError::Disconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct Channel {
    peer: String,
    sender: ChannelSender,
    inbound: mpsc::UnboundedReceiver<Value>,
    shutdown: CancellationToken,
}

impl Channel {
    pub fn new(
        peer: impl Into<String>,
        outbound: mpsc::UnboundedSender<Value>,
        inbound: mpsc::UnboundedReceiver<Value>,
    ) -> Self {
        Self {
            peer: peer.into(),
            sender: ChannelSender { tx: outbound },
            inbound,
            shutdown: CancellationToken::new(),
        }
    }

    /// Two connected in-memory ends.
    pub fn pair(peer: impl Into<String>) -> (Channel, Channel) {
        let peer = peer.into();
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Channel::new(peer.clone(), a_tx, a_rx),
            Channel::new(peer, b_tx, b_rx),
        )
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Token cancelled when this end is closed or dropped. Adapters tie their
    /// pump tasks to it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub fn send(&self, message: impl Into<WireMessage>) -> Result<(), RpcError> {
        self.sender.send(message)
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.inbound.recv().await
    }

    /// Stop accepting inbound messages and signal the adapter to tear down.
    pub fn close(&mut self) {
        self.inbound.close();
        self.shutdown.cancel();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.peer)
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

/// Produces a fresh channel for every connection attempt.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn open(&self, peer: &str) -> Result<Channel, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Request;
    use serde_json::json;

    #[tokio::test]
    async fn pair_delivers_in_order() {
        let (a, mut b) = Channel::pair("test");
        for sequence in 0..3 {
            a.send(Request {
                action: "ping".to_string(),
                params: json!({}),
                sequence,
            })
            .unwrap();
        }

        for expected in 0..3 {
            let value = b.recv().await.unwrap();
            assert_eq!(value["sequenceId"], expected);
        }
    }

    #[tokio::test]
    async fn dropping_one_end_closes_the_other() {
        let (a, mut b) = Channel::pair("test");
        let token = a.shutdown_token();
        drop(a);

        assert!(token.is_cancelled());
        assert!(b.recv().await.is_none());
        assert_eq!(b.sender().send_raw(json!({})), Err(RpcError::Disconnected));
    }
}
