//! Message broker abstraction for the MQ transport.
//!
//! [`MqBroker`] is the small slice of AMQP the MQ peers need: credentials,
//! publishing to an exchange with a routing key and consuming a queue.
//! [`MemoryBroker`] implements it in process with direct-exchange semantics.

use async_trait::async_trait;
use dashmap::DashMap;
use owtp_types::{OwtpError, OwtpResult};
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// One broker message: string headers plus a JSON body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MqMessage {
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl MqMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// A message as seen by the broker's publish tap.
#[derive(Debug, Clone)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub message: MqMessage,
}

#[async_trait]
pub trait MqBroker: Send + Sync + 'static {
    async fn authenticate(&self, account: &str, password: &str) -> OwtpResult<()>;

    /// Route `message` through `exchange` to the queue bound to
    /// `routing_key`.
    async fn publish(&self, exchange: &str, routing_key: &str, message: MqMessage)
        -> OwtpResult<()>;

    /// Become the consumer of `queue`.
    async fn consume(&self, queue: &str) -> OwtpResult<mpsc::UnboundedReceiver<MqMessage>>;
}

struct Queue {
    tx: mpsc::UnboundedSender<MqMessage>,
    /// Held until a consumer attaches.
    rx: Option<mpsc::UnboundedReceiver<MqMessage>>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

/// In-process broker. Every queue has at most one live consumer; messages
/// published before a consumer attaches are buffered.
pub struct MemoryBroker {
    queues: DashMap<String, Queue>,
    credentials: Option<(String, String)>,
    tap: broadcast::Sender<Published>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (tap, _) = broadcast::channel(1024);
        Self {
            queues: DashMap::new(),
            credentials: None,
            tap,
        }
    }

    /// Broker that only admits `account` / `password`.
    pub fn with_credentials(account: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Some((account.into(), password.into())),
            ..Self::new()
        }
    }

    /// Observe every published message.
    pub fn subscribe_tap(&self) -> broadcast::Receiver<Published> {
        self.tap.subscribe()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MqBroker for MemoryBroker {
    async fn authenticate(&self, account: &str, password: &str) -> OwtpResult<()> {
        match &self.credentials {
            Some((a, p)) if a != account || p != password => {
                Err(OwtpError::Mq(format!("access refused for account '{account}'")))
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: MqMessage,
    ) -> OwtpResult<()> {
        if routing_key.is_empty() {
            return Err(OwtpError::Mq("empty routing key".into()));
        }
        let _ = self.tap.send(Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message: message.clone(),
        });

        let mut queue = self
            .queues
            .entry(routing_key.to_string())
            .or_insert_with(Queue::new);
        if let Err(mpsc::error::SendError(message)) = queue.tx.send(message) {
            // Consumer went away: start buffering for the next one
            debug!("OWTP: queue {} lost its consumer, buffering", routing_key);
            let fresh = Queue::new();
            let _ = fresh.tx.send(message);
            *queue = fresh;
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> OwtpResult<mpsc::UnboundedReceiver<MqMessage>> {
        if queue.is_empty() {
            return Err(OwtpError::Mq("empty queue name".into()));
        }
        let mut entry = self
            .queues
            .entry(queue.to_string())
            .or_insert_with(Queue::new);
        if let Some(rx) = entry.rx.take() {
            return Ok(rx);
        }
        if entry.tx.is_closed() {
            let mut fresh = Queue::new();
            let rx = fresh.rx.take();
            *entry = fresh;
            return rx.ok_or_else(|| OwtpError::Mq("queue unavailable".into()));
        }
        Err(OwtpError::Mq(format!("queue '{queue}' already has a consumer")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: &str) -> MqMessage {
        MqMessage {
            headers: HashMap::from([("x".to_string(), "1".to_string())]),
            body: body.to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_before_consume_is_buffered() {
        let broker = MemoryBroker::new();
        broker.publish("owtp", "q1", message("a")).await.unwrap();
        let mut rx = broker.consume("q1").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().body, "a");
        broker.publish("owtp", "q1", message("b")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().body, "b");
    }

    #[tokio::test]
    async fn test_single_consumer() {
        let broker = MemoryBroker::new();
        let rx = broker.consume("q1").await.unwrap();
        assert!(broker.consume("q1").await.is_err());
        drop(rx);
        let mut rx = broker.consume("q1").await.unwrap();
        broker.publish("owtp", "q1", message("c")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().header("x"), Some("1"));
    }

    #[test]
    fn test_credentials() {
        let broker = MemoryBroker::with_credentials("wallet", "secret");
        tokio_test::assert_ok!(tokio_test::block_on(broker.authenticate("wallet", "secret")));
        tokio_test::assert_err!(tokio_test::block_on(broker.authenticate("wallet", "nope")));
        tokio_test::assert_ok!(tokio_test::block_on(MemoryBroker::new().authenticate("", "")));
    }

    #[tokio::test]
    async fn test_tap_sees_published() {
        let broker = MemoryBroker::new();
        let mut tap = broker.subscribe_tap();
        broker.publish("owtp", "q9", message("d")).await.unwrap();
        let seen = tap.recv().await.unwrap();
        assert_eq!(seen.exchange, "owtp");
        assert_eq!(seen.routing_key, "q9");
        assert_eq!(seen.message.body, "d");
    }
}
