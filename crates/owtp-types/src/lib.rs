//! Core types for the Open Wallet Transfer Protocol (OWTP).
//!
//! This crate defines the wire envelope, the response status taxonomy, the
//! connection/node configuration surface and the shared error type used by
//! the `owtp` node. It contains no I/O.

pub mod config;
pub mod error;
pub mod packet;
pub mod response;

pub use config::{ConnectConfig, ConnectType, NodeConfig};
pub use error::{OwtpError, OwtpResult};
pub use packet::{DataPacket, KeyAgreement, PacketKind};
pub use response::{Response, StatusCode};
