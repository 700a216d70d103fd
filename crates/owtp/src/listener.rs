//! Inbound connection sources.

use crate::peer::Peer;
use async_trait::async_trait;
use owtp_types::{ConnectType, OwtpResult};
use std::sync::Arc;

/// Accepts inbound peers of one transport.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Wait for the next inbound peer. Fails with
    /// [`owtp_types::OwtpError::ListenerClosed`] once closed.
    async fn accept(&self) -> OwtpResult<Arc<dyn Peer>>;

    /// Stop accepting and unblock pending `accept` calls.
    async fn close(&self) -> OwtpResult<()>;

    /// Bound socket address, or the consumed queue for MQ.
    fn local_addr(&self) -> String;

    fn connect_type(&self) -> ConnectType;
}
