//! Open Wallet Transfer Protocol (OWTP).
//!
//! Peer-to-peer request/response messaging between wallet components over
//! WebSocket, HTTP or a message queue, with Ed25519 signatures and optional
//! X25519 key agreement for payload encryption.
//!
//! [`OwtpNode`] is the entry point: register handlers with
//! [`OwtpNode::handle_func`], accept peers with [`OwtpNode::listen`] and
//! reach them with [`OwtpNode::connect`] and [`OwtpNode::call`].

pub mod auth;
pub mod config;
pub mod listener;
pub mod mux;
pub mod node;
pub mod nonce;
pub mod peer;
pub mod peerstore;
pub mod transport;

pub use auth::{Authorization, Certificate, SessionKey, ENCRYPT_TYPE_AES_GCM};
pub use config::load_config;
pub use listener::Listener;
pub use mux::{Context, HandlerFunc, ServeMux};
pub use node::{NodeOptions, OwtpNode, KEY_AGREEMENT_METHOD};
pub use nonce::NonceGenerator;
pub use peer::{Peer, PeerHandler, TransportTimings};
pub use peerstore::{
    MemoryPeerstore, MemorySessionStore, PeerInfo, Peerstore, SessionPeerstore, SessionStore,
};
pub use transport::{AmqpBroker, MemoryBroker, MqBroker, MqMessage};

pub use owtp_types::{
    ConnectConfig, ConnectType, DataPacket, KeyAgreement, NodeConfig, OwtpError, OwtpResult,
    PacketKind, Response, StatusCode,
};
