//! [`MqBroker`] backed by an AMQP 0-9-1 server.
//!
//! The connection is opened lazily by [`MqBroker::authenticate`], which is
//! where the MQ peers hand over `account` / `password`. Packets go through
//! a durable direct exchange; every consumed queue is bound to it under its
//! own name, matching the routing of [`super::MemoryBroker`].

use super::broker::{MqBroker, MqMessage};
use async_trait::async_trait;
use dashmap::DashSet;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use owtp_types::{ConnectConfig, OwtpError, OwtpResult};
use std::collections::HashMap;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

pub const DEFAULT_AMQP_PORT: u16 = 5672;
pub const DEFAULT_AMQPS_PORT: u16 = 5671;

fn mq_error(context: &str, e: lapin::Error) -> OwtpError {
    OwtpError::Mq(format!("{context}: {e}"))
}

struct Link {
    connection: Connection,
    channel: Channel,
}

/// A broker reached over the network.
pub struct AmqpBroker {
    uri: AMQPUri,
    exchange: String,
    link: OnceCell<Link>,
    declared: DashSet<String>,
}

impl AmqpBroker {
    /// Broker at `config.address` (`host` or `host:port`), routing through
    /// `config.exchange`. Nothing is dialed until `authenticate`.
    pub fn new(config: &ConnectConfig) -> OwtpResult<Self> {
        Ok(Self {
            uri: broker_uri(config)?,
            exchange: config.exchange.clone(),
            link: OnceCell::new(),
            declared: DashSet::new(),
        })
    }

    /// `host:port` this broker dials.
    pub fn address(&self) -> String {
        format!("{}:{}", self.uri.authority.host, self.uri.authority.port)
    }

    pub fn is_connected(&self) -> bool {
        self.link
            .get()
            .is_some_and(|link| link.connection.status().connected())
    }

    /// Close the connection, if one was opened.
    pub async fn close(&self) {
        if let Some(link) = self.link.get() {
            if let Err(e) = link.connection.close(200, "owtp node closed").await {
                debug!("OWTP: closing AMQP connection to {} failed: {}", self.address(), e);
            }
        }
    }

    fn channel(&self) -> OwtpResult<&Channel> {
        self.link
            .get()
            .map(|link| &link.channel)
            .ok_or_else(|| OwtpError::Mq(format!("not connected to {}", self.address())))
    }

    async fn declare_exchange(&self, channel: &Channel, exchange: &str) -> OwtpResult<()> {
        if exchange.is_empty() || self.declared.contains(exchange) {
            return Ok(());
        }
        let options = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };
        channel
            .exchange_declare(exchange, ExchangeKind::Direct, options, FieldTable::default())
            .await
            .map_err(|e| mq_error("exchange declare failed", e))?;
        self.declared.insert(exchange.to_string());
        Ok(())
    }
}

/// Connection URI for `config`; an `amqp://` or `amqps://` address is
/// taken as is.
fn broker_uri(config: &ConnectConfig) -> OwtpResult<AMQPUri> {
    let address = config.address.trim();
    if address.is_empty() {
        return Err(OwtpError::Config("MQ broker address is empty".into()));
    }
    if address.starts_with("amqp://") || address.starts_with("amqps://") {
        return address
            .parse::<AMQPUri>()
            .map_err(|e| OwtpError::Config(format!("invalid broker URI '{address}': {e}")));
    }

    let (host, port) = match address.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| OwtpError::Config(format!("invalid broker port in '{address}'")))?;
            (host.to_string(), port)
        }
        None if config.enable_ssl => (address.to_string(), DEFAULT_AMQPS_PORT),
        None => (address.to_string(), DEFAULT_AMQP_PORT),
    };
    let scheme = if config.enable_ssl {
        AMQPScheme::AMQPS
    } else {
        AMQPScheme::AMQP
    };
    Ok(AMQPUri {
        scheme,
        authority: AMQPAuthority {
            host,
            port,
            ..Default::default()
        },
        ..Default::default()
    })
}

fn to_field_table(headers: &HashMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in headers {
        table.insert(
            ShortString::from(name.as_str()),
            AMQPValue::LongString(LongString::from(value.as_str())),
        );
    }
    table
}

fn to_message(delivery: &Delivery) -> Option<MqMessage> {
    let body = String::from_utf8(delivery.data.clone()).ok()?;
    let mut headers = HashMap::new();
    if let Some(table) = delivery.properties.headers() {
        for (name, value) in table.inner() {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => continue,
            };
            headers.insert(name.as_str().to_string(), value);
        }
    }
    Some(MqMessage { headers, body })
}

#[async_trait]
impl MqBroker for AmqpBroker {
    async fn authenticate(&self, account: &str, password: &str) -> OwtpResult<()> {
        let mut uri = self.uri.clone();
        if !account.is_empty() {
            uri.authority.userinfo = AMQPUserInfo {
                username: account.to_string(),
                password: password.to_string(),
            };
        }
        let address = self.address();
        self.link
            .get_or_try_init(|| async move {
                let connection = Connection::connect_uri(uri, ConnectionProperties::default())
                    .await
                    .map_err(|e| mq_error(&format!("connect to {address} failed"), e))?;
                let channel = connection
                    .create_channel()
                    .await
                    .map_err(|e| mq_error("open channel failed", e))?;
                info!("OWTP: connected to AMQP broker {}", address);
                Ok::<_, OwtpError>(Link {
                    connection,
                    channel,
                })
            })
            .await?;
        Ok(())
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
        let channel = self.channel()?;
        self.declare_exchange(channel, exchange).await?;
        let properties = BasicProperties::default().with_headers(to_field_table(&message.headers));
        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                message.body.as_bytes(),
                properties,
            )
            .await
            .map_err(|e| mq_error("publish failed", e))?
            .await
            .map_err(|e| mq_error("publish not confirmed", e))?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> OwtpResult<mpsc::UnboundedReceiver<MqMessage>> {
        if queue.is_empty() {
            return Err(OwtpError::Mq("empty queue name".into()));
        }
        let channel = self.channel()?;
        channel
            .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(|e| mq_error("queue declare failed", e))?;
        if !self.exchange.is_empty() {
            self.declare_exchange(channel, &self.exchange).await?;
            channel
                .queue_bind(
                    queue,
                    &self.exchange,
                    queue,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| mq_error("queue bind failed", e))?;
        }

        // Exclusive: a queue has one consumer, as with the in-process broker
        let options = BasicConsumeOptions {
            no_ack: true,
            exclusive: true,
            ..Default::default()
        };
        let tag = format!("owtp-{queue}");
        let mut consumer = channel
            .basic_consume(queue, &tag, options, FieldTable::default())
            .await
            .map_err(|e| mq_error(&format!("consume '{queue}' failed"), e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = channel.clone();
        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let Some(message) = to_message(&delivery) else {
                            warn!("OWTP: dropping non-UTF-8 message on {}", queue);
                            continue;
                        };
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("OWTP: consumer of {} failed: {}", queue, e);
                        break;
                    }
                }
            }
            if let Err(e) = channel.basic_cancel(&tag, BasicCancelOptions::default()).await {
                debug!("OWTP: cancelling consumer of {} failed: {}", queue, e);
            }
            debug!("OWTP: consumer of {} stopped", queue);
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use owtp_types::ConnectType;

    fn mq(address: &str) -> ConnectConfig {
        ConnectConfig {
            exchange: "owtp".to_string(),
            ..ConnectConfig::new(ConnectType::Mq, address)
        }
    }

    #[test]
    fn test_broker_uri_from_address() {
        let uri = broker_uri(&mq("10.0.0.5:5673")).unwrap();
        assert_eq!(uri.authority.host, "10.0.0.5");
        assert_eq!(uri.authority.port, 5673);
        assert!(matches!(uri.scheme, AMQPScheme::AMQP));

        let mut tls = mq("mq.example.com");
        tls.enable_ssl = true;
        let uri = broker_uri(&tls).unwrap();
        assert_eq!(uri.authority.port, DEFAULT_AMQPS_PORT);
        assert!(matches!(uri.scheme, AMQPScheme::AMQPS));

        let uri = broker_uri(&mq("amqp://wallet:pw@mq.example.com:5680/%2f")).unwrap();
        assert_eq!(uri.authority.userinfo.username, "wallet");
        assert_eq!(uri.authority.port, 5680);
    }

    #[test]
    fn test_broker_uri_rejects_bad_addresses() {
        assert!(matches!(broker_uri(&mq("")), Err(OwtpError::Config(_))));
        assert!(matches!(
            broker_uri(&mq("localhost:notaport")),
            Err(OwtpError::Config(_))
        ));
    }

    #[test]
    fn test_headers_round_trip_through_field_table() {
        let headers = HashMap::from([
            ("x-owtp-kind".to_string(), "packet".to_string()),
            ("reply-to".to_string(), "client.in".to_string()),
        ]);
        let table = to_field_table(&headers);
        assert_eq!(table.inner().len(), 2);
        let kind = table.inner().get(&ShortString::from("x-owtp-kind"));
        assert!(matches!(kind, Some(AMQPValue::LongString(s)) if s.as_bytes() == b"packet"));
    }

    #[tokio::test]
    async fn test_unreachable_broker() {
        let broker = AmqpBroker::new(&mq("127.0.0.1:1")).unwrap();
        let err = broker.authenticate("guest", "guest").await.unwrap_err();
        assert!(matches!(err, OwtpError::Mq(_)));
        assert!(!broker.is_connected());
        // Nothing to publish on before a connection exists
        let err = broker
            .publish("owtp", "q1", MqMessage::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OwtpError::Mq(_)));
    }
}
