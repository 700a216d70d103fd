//! Wire envelope exchanged over every OWTP transport.
//!
//! A [`DataPacket`] is serialized as a flat JSON object with single-letter
//! keys (`r`, `m`, `n`, `t`, `d`, `s`, `k`). The same envelope travels over
//! WebSocket text frames, HTTP bodies and message-queue payloads.

use crate::response::Response;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved method carrying key agreement handshakes.
pub const KEY_AGREEMENT_METHOD: &str = "internal_key_agreement";

/// Request/response discriminator (`r` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PacketKind {
    /// Outbound call expecting a response.
    Request,
    /// Answer to a previously received request.
    Response,
}

impl From<PacketKind> for u8 {
    fn from(kind: PacketKind) -> u8 {
        match kind {
            PacketKind::Request => 1,
            PacketKind::Response => 2,
        }
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketKind::Request),
            2 => Ok(PacketKind::Response),
            other => Err(format!("unknown packet kind {other}")),
        }
    }
}

/// Key agreement parameters (`k` on the wire).
///
/// Handshake packets carry the full structure. Encrypted data packets only
/// carry the encryption type and the session key fingerprint (`id`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAgreement {
    /// Encryption type identifier.
    #[serde(rename = "t", default)]
    pub encrypt_type: String,
    /// Initiator identity public key (hex).
    #[serde(rename = "pi", default, skip_serializing_if = "String::is_empty")]
    pub initiator_public_key: String,
    /// Initiator ephemeral public key (hex).
    #[serde(rename = "ti", default, skip_serializing_if = "String::is_empty")]
    pub initiator_tmp_public_key: String,
    /// Responder identity public key (hex).
    #[serde(rename = "pr", default, skip_serializing_if = "String::is_empty")]
    pub responder_public_key: String,
    /// Responder ephemeral public key (hex).
    #[serde(rename = "tr", default, skip_serializing_if = "String::is_empty")]
    pub responder_tmp_public_key: String,
    /// Responder verification tag (hex).
    #[serde(rename = "v", default, skip_serializing_if = "String::is_empty")]
    pub verify_tag: String,
    /// Session key fingerprint.
    #[serde(rename = "id", default, skip_serializing_if = "String::is_empty")]
    pub key_id: String,
}

impl KeyAgreement {
    /// Marker attached to packets encrypted under an established session key.
    pub fn session_marker(encrypt_type: &str, key_id: &str) -> Self {
        Self {
            encrypt_type: encrypt_type.to_string(),
            key_id: key_id.to_string(),
            ..Default::default()
        }
    }

    /// Whether this carries the initiator half of a handshake.
    pub fn is_initiation(&self) -> bool {
        !self.initiator_public_key.is_empty() && !self.initiator_tmp_public_key.is_empty()
    }
}

/// The OWTP wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPacket {
    /// Request or response.
    #[serde(rename = "r")]
    pub kind: PacketKind,
    /// Method name.
    #[serde(rename = "m", default)]
    pub method: String,
    /// Nonce, unique per peer and in-flight request.
    #[serde(rename = "n", default)]
    pub nonce: u64,
    /// Unix timestamp in seconds.
    #[serde(rename = "t", default)]
    pub timestamp: i64,
    /// Payload: request params, a [`Response`] object or ciphertext.
    #[serde(rename = "d", default)]
    pub data: Value,
    /// Hex signature over the canonical fields.
    #[serde(rename = "s", default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
    /// Key agreement parameters.
    #[serde(rename = "k", default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<KeyAgreement>,
}

impl DataPacket {
    /// Build a request packet stamped with the current time.
    pub fn request(method: impl Into<String>, nonce: u64, params: Value) -> Self {
        Self {
            kind: PacketKind::Request,
            method: method.into(),
            nonce,
            timestamp: chrono::Utc::now().timestamp(),
            data: params,
            signature: String::new(),
            secret: None,
        }
    }

    /// Build the response packet answering `request`.
    pub fn response_to(request: &DataPacket, response: &Response) -> Self {
        Self {
            kind: PacketKind::Response,
            method: request.method.clone(),
            nonce: request.nonce,
            timestamp: chrono::Utc::now().timestamp(),
            data: response.to_value(),
            signature: String::new(),
            secret: None,
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind == PacketKind::Request
    }

    /// Canonical bytes covered by the signature: `r‖m‖n‖t‖d`.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let r: u8 = self.kind.into();
        format!(
            "{}{}{}{}{}",
            r, self.method, self.nonce, self.timestamp, self.data
        )
        .into_bytes()
    }

    /// The session key fingerprint this packet was encrypted under, if any.
    /// Handshake packets carry a fingerprint but never ciphertext.
    pub fn session_key_id(&self) -> Option<&str> {
        if self.method == KEY_AGREEMENT_METHOD {
            return None;
        }
        self.secret
            .as_ref()
            .map(|k| k.key_id.as_str())
            .filter(|id| !id.is_empty())
    }
}

/// Encode a packet to its JSON wire form.
pub fn encode_packet(packet: &DataPacket) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(packet)
}

/// Decode a packet from its JSON wire form.
pub fn decode_packet(body: &[u8]) -> Result<DataPacket, serde_json::Error> {
    serde_json::from_slice(body)
}
