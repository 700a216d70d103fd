//! Transport implementations of [`crate::peer::Peer`] and
//! [`crate::listener::Listener`].

pub mod amqp;
pub mod broker;
pub mod http;
pub mod mq;
pub mod socket;

pub use amqp::AmqpBroker;
pub use broker::{MemoryBroker, MqBroker, MqMessage, Published};
pub use http::{HttpClientPeer, HttpListener, HttpServerPeer};
pub use mq::{MqListener, MqPeer};
pub use socket::{SocketListener, SocketPeer};
