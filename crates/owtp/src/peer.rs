//! Transport-independent peer contract.
//!
//! Every transport (WebSocket, HTTP, message queue) exposes its connections
//! as [`Peer`]s and reports inbound packets and disconnects to a
//! [`PeerHandler`], which is the node.

use crate::auth::Authorization;
use async_trait::async_trait;
use owtp_types::{ConnectConfig, DataPacket, NodeConfig, OwtpResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// One remote endpoint reachable over a single transport.
#[async_trait]
pub trait Peer: Send + Sync + 'static {
    /// Remote peer ID.
    fn pid(&self) -> &str;

    /// Whether the local node dialed this peer.
    fn is_host(&self) -> bool;

    fn is_connected(&self) -> bool;

    fn connect_config(&self) -> &ConnectConfig;

    fn local_addr(&self) -> String;

    fn remote_addr(&self) -> String;

    fn auth(&self) -> &Authorization;

    /// Queue a packet for delivery.
    async fn send(&self, packet: DataPacket) -> OwtpResult<()>;

    /// Start the read/write pumps. Calling it again is a no-op.
    async fn open_pipe(&self) -> OwtpResult<()>;

    /// Disconnect. Idempotent; the handler hears about it exactly once.
    async fn close(&self) -> OwtpResult<()>;
}

/// Receiver of everything peers observe.
#[async_trait]
pub trait PeerHandler: Send + Sync + 'static {
    /// A packet arrived from `peer`.
    async fn on_packet(&self, peer: Arc<dyn Peer>, packet: DataPacket);

    /// `peer` closed. Called once per peer.
    fn on_peer_closed(&self, peer: Arc<dyn Peer>);
}

/// Deadlines shared by all transports of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportTimings {
    pub heartbeat_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Bounds HTTP round trips and dial handshakes.
    pub http_timeout: Duration,
}

impl TransportTimings {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
            http_timeout: config.http_timeout(),
        }
    }
}

impl Default for TransportTimings {
    fn default() -> Self {
        Self::from_config(&NodeConfig::default())
    }
}

/// Hand a packet to the handler on its own task so a slow handler never
/// stalls the reader.
pub(crate) fn dispatch(handler: &Arc<dyn PeerHandler>, peer: Arc<dyn Peer>, packet: DataPacket) {
    let handler = Arc::clone(handler);
    tokio::spawn(async move {
        handler.on_packet(peer, packet).await;
    });
}

/// Resolve once the shutdown flag is (or already was) raised.
pub(crate) async fn wait_closed(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timings_follow_config() {
        let config = NodeConfig {
            heartbeat_interval_ms: 1_000,
            read_timeout_ms: 2_000,
            write_timeout_ms: 300,
            http_timeout_ms: 4_000,
            ..Default::default()
        };
        let timings = TransportTimings::from_config(&config);
        assert_eq!(timings.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(timings.read_timeout, Duration::from_secs(2));
        assert_eq!(timings.write_timeout, Duration::from_millis(300));
        assert_eq!(timings.http_timeout, Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_wait_closed_sees_prior_flag() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), wait_closed(&mut rx))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_closed_on_dropped_sender() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), wait_closed(&mut rx))
            .await
            .unwrap();
    }
}
