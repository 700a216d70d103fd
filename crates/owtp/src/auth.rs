//! Node identity, packet signatures and session key agreement.
//!
//! A [`Certificate`] is the node's Ed25519 identity; its peer ID is the
//! truncated SHA-256 of the public key. Every peer gets an
//! [`Authorization`] that pairs the local certificate with whatever the
//! transport learned about the remote identity.
//!
//! Key agreement is a single round trip of ephemeral X25519 keys:
//!
//! 1. The initiator sends its identity key and an ephemeral public key.
//! 2. The responder answers with its own pair and a verification tag
//!    `HMAC-SHA256(session_key, "owtp-ka" ‖ ti ‖ tr)`.
//! 3. The initiator derives the same key and checks the tag.
//!
//! The session key is `HMAC-SHA256(shared_secret, pi ‖ pr ‖ ti ‖ tr)` and
//! payloads are sealed with AES-256-GCM using the packet nonce as
//! associated data.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use owtp_types::{DataPacket, KeyAgreement, OwtpError, OwtpResult};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, RwLock};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// The only supported payload cipher.
pub const ENCRYPT_TYPE_AES_GCM: &str = "aes-256-gcm";

/// Handshake header: hex Ed25519 public key of the sender.
pub const HEADER_PUBLIC_KEY: &str = "x-owtp-public-key";
/// Handshake header: random challenge.
pub const HEADER_NONCE: &str = "x-owtp-nonce";
/// Handshake header: unix seconds.
pub const HEADER_TIMESTAMP: &str = "x-owtp-timestamp";
/// Handshake header: hex signature over `nonce ‖ timestamp`.
pub const HEADER_SIGNATURE: &str = "x-owtp-signature";

/// Accepted clock skew for handshake timestamps.
const HANDSHAKE_WINDOW_SECS: i64 = 300;

const GCM_NONCE_LEN: usize = 12;

/// Derive the stable peer ID of a public key.
pub fn derive_pid(public_key: &VerifyingKey) -> String {
    let digest = hex::encode(Sha256::digest(public_key.as_bytes()));
    digest[..40].to_string()
}

/// Parse a hex-encoded Ed25519 public key.
pub fn parse_public_key(hex_key: &str) -> OwtpResult<VerifyingKey> {
    let bytes: [u8; 32] = hex::decode(hex_key)
        .map_err(|e| OwtpError::Crypto(format!("invalid public key hex: {e}")))?
        .try_into()
        .map_err(|_| OwtpError::Crypto("invalid public key length (expected 32 bytes)".into()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| OwtpError::Crypto(format!("invalid public key: {e}")))
}

fn decode_x25519(hex_key: &str) -> OwtpResult<X25519PublicKey> {
    let bytes: [u8; 32] = hex::decode(hex_key)
        .map_err(|e| OwtpError::KeyAgreementFailed(format!("invalid ephemeral key hex: {e}")))?
        .try_into()
        .map_err(|_| OwtpError::KeyAgreementFailed("invalid ephemeral key length".into()))?;
    Ok(X25519PublicKey::from(bytes))
}

fn check_encrypt_type(encrypt_type: &str) -> OwtpResult<()> {
    if encrypt_type == ENCRYPT_TYPE_AES_GCM {
        Ok(())
    } else {
        Err(OwtpError::KeyAgreementFailed(format!(
            "unsupported encryption type '{encrypt_type}'"
        )))
    }
}

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> OwtpResult<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| OwtpError::Crypto(format!("HMAC key rejected: {e}")))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn derive_session_key(shared: &[u8], ka: &KeyAgreement) -> OwtpResult<Zeroizing<[u8; 32]>> {
    let key = hmac_sha256(
        shared,
        &[
            ka.initiator_public_key.as_bytes(),
            ka.responder_public_key.as_bytes(),
            ka.initiator_tmp_public_key.as_bytes(),
            ka.responder_tmp_public_key.as_bytes(),
        ],
    )?;
    Ok(Zeroizing::new(key))
}

fn verification_tag(key: &[u8], ka: &KeyAgreement) -> OwtpResult<String> {
    let tag = hmac_sha256(
        key,
        &[
            b"owtp-ka",
            ka.initiator_tmp_public_key.as_bytes(),
            ka.responder_tmp_public_key.as_bytes(),
        ],
    )?;
    Ok(hex::encode(tag))
}

/// A node's long-lived identity.
pub struct Certificate {
    signing_key: SigningKey,
    pid: String,
}

impl Certificate {
    /// Build from a private key seed, or a random one when `None`.
    pub fn new(seed: Option<[u8; 32]>) -> Self {
        let signing_key = match seed {
            Some(seed) => SigningKey::from_bytes(&seed),
            None => SigningKey::generate(&mut OsRng),
        };
        let pid = derive_pid(&signing_key.verifying_key());
        Self { signing_key, pid }
    }

    pub fn random() -> Self {
        Self::new(None)
    }

    /// Build from a hex-encoded 32-byte seed.
    pub fn from_hex_seed(seed: &str) -> OwtpResult<Self> {
        let bytes = Zeroizing::new(
            hex::decode(seed.trim())
                .map_err(|e| OwtpError::Config(format!("private_key is not hex: {e}")))?,
        );
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| OwtpError::Config("private_key must be 32 bytes".into()))?;
        Ok(Self::new(Some(seed)))
    }

    pub fn pid(&self) -> &str {
        &self.pid
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key().as_bytes())
    }

    /// Hex Ed25519 signature over `data`.
    pub fn sign(&self, data: &[u8]) -> String {
        hex::encode(self.signing_key.sign(data).to_bytes())
    }

    /// Identity headers sent when opening a socket or posting over HTTP.
    pub fn handshake_headers(&self) -> Vec<(&'static str, String)> {
        let mut challenge = [0u8; 16];
        OsRng.fill_bytes(&mut challenge);
        let nonce = hex::encode(challenge);
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = self.sign(format!("{nonce}{timestamp}").as_bytes());
        vec![
            (HEADER_PUBLIC_KEY, self.public_key_hex()),
            (HEADER_NONCE, nonce),
            (HEADER_TIMESTAMP, timestamp),
            (HEADER_SIGNATURE, signature),
        ]
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Verify identity headers of an inbound handshake and return the
/// sender's public key. The signature is only checked when required.
pub fn verify_handshake<F>(header: F, require_signature: bool) -> OwtpResult<VerifyingKey>
where
    F: Fn(&str) -> Option<String>,
{
    let public_key = header(HEADER_PUBLIC_KEY)
        .ok_or_else(|| OwtpError::HandshakeFailed("missing public key header".into()))?;
    let public_key = parse_public_key(&public_key)?;
    if !require_signature {
        return Ok(public_key);
    }

    let missing = |name: &str| OwtpError::HandshakeFailed(format!("missing {name} header"));
    let nonce = header(HEADER_NONCE).ok_or_else(|| missing(HEADER_NONCE))?;
    let timestamp = header(HEADER_TIMESTAMP).ok_or_else(|| missing(HEADER_TIMESTAMP))?;
    let signature = header(HEADER_SIGNATURE).ok_or_else(|| missing(HEADER_SIGNATURE))?;

    let ts: i64 = timestamp
        .parse()
        .map_err(|_| OwtpError::HandshakeFailed("invalid timestamp header".into()))?;
    if (chrono::Utc::now().timestamp() - ts).abs() > HANDSHAKE_WINDOW_SECS {
        return Err(OwtpError::HandshakeFailed("handshake timestamp expired".into()));
    }
    if !verify_hex_signature(&public_key, format!("{nonce}{timestamp}").as_bytes(), &signature) {
        return Err(OwtpError::HandshakeFailed("handshake signature invalid".into()));
    }
    Ok(public_key)
}

fn verify_hex_signature(public_key: &VerifyingKey, data: &[u8], signature: &str) -> bool {
    let Ok(bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(bytes) = <[u8; 64]>::try_from(bytes.as_slice()) else {
        return false;
    };
    public_key
        .verify(data, &Signature::from_bytes(&bytes))
        .is_ok()
}

/// A negotiated symmetric key, as cached in the peerstore.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKey {
    pub encrypt_type: String,
    /// Hex key material.
    pub key: String,
    /// Fingerprint carried in the `id` field of encrypted packets.
    pub id: String,
}

impl SessionKey {
    fn from_bytes(encrypt_type: &str, key: &[u8; 32]) -> Self {
        let digest = hex::encode(Sha256::digest(key));
        Self {
            encrypt_type: encrypt_type.to_string(),
            key: hex::encode(key),
            id: digest[..16].to_string(),
        }
    }

    fn key_bytes(&self) -> OwtpResult<Zeroizing<Vec<u8>>> {
        hex::decode(&self.key)
            .map(Zeroizing::new)
            .map_err(|e| OwtpError::Crypto(format!("corrupt session key: {e}")))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("encrypt_type", &self.encrypt_type)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Initiator state kept between sending and receiving the handshake.
pub struct PendingAgreement {
    secret: EphemeralSecret,
    agreement: KeyAgreement,
}

impl PendingAgreement {
    /// The initiator half to send to the responder.
    pub fn agreement(&self) -> &KeyAgreement {
        &self.agreement
    }
}

/// Per-peer signing, verification and encryption context.
pub struct Authorization {
    cert: Arc<Certificate>,
    remote_key: RwLock<Option<VerifyingKey>>,
    enable_signature: bool,
}

impl Authorization {
    pub fn new(cert: Arc<Certificate>, enable_signature: bool) -> Self {
        Self {
            cert,
            remote_key: RwLock::new(None),
            enable_signature,
        }
    }

    /// Authorization for a peer whose identity key is already known.
    pub fn with_remote(
        cert: Arc<Certificate>,
        remote: Option<VerifyingKey>,
        enable_signature: bool,
    ) -> Self {
        Self {
            cert,
            remote_key: RwLock::new(remote),
            enable_signature,
        }
    }

    pub fn local_pid(&self) -> &str {
        self.cert.pid()
    }

    pub fn certificate(&self) -> &Arc<Certificate> {
        &self.cert
    }

    /// Peer ID derived from the remote public key, once known.
    pub fn remote_pid(&self) -> Option<String> {
        self.remote_public_key().map(|k| derive_pid(&k))
    }

    pub fn remote_public_key(&self) -> Option<VerifyingKey> {
        *self.remote_key.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_remote_public_key(&self, key: VerifyingKey) {
        let mut remote = self.remote_key.write().unwrap_or_else(|e| e.into_inner());
        *remote = Some(key);
    }

    /// Record the remote identity from a hex header unless already known.
    pub fn learn_remote_public_key(&self, hex_key: &str) -> OwtpResult<()> {
        if self.remote_public_key().is_some() {
            return Ok(());
        }
        let key = parse_public_key(hex_key)?;
        self.set_remote_public_key(key);
        Ok(())
    }

    pub fn signature_enabled(&self) -> bool {
        self.enable_signature
    }

    /// Start a key agreement as initiator.
    pub fn init_key_agreement(&self, encrypt_type: &str) -> OwtpResult<PendingAgreement> {
        check_encrypt_type(encrypt_type)?;
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        let agreement = KeyAgreement {
            encrypt_type: encrypt_type.to_string(),
            initiator_public_key: self.cert.public_key_hex(),
            initiator_tmp_public_key: hex::encode(public.as_bytes()),
            ..Default::default()
        };
        Ok(PendingAgreement { secret, agreement })
    }

    /// Answer an initiation as responder. Fills in the responder fields,
    /// verification tag and key fingerprint of `ka` and returns the key.
    pub fn request_key_agreement(&self, ka: &mut KeyAgreement) -> OwtpResult<SessionKey> {
        check_encrypt_type(&ka.encrypt_type)?;
        if !ka.is_initiation() {
            return Err(OwtpError::KeyAgreementFailed(
                "missing initiator parameters".into(),
            ));
        }
        let their_tmp = decode_x25519(&ka.initiator_tmp_public_key)?;

        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        let shared = secret.diffie_hellman(&their_tmp);
        if !shared.was_contributory() {
            return Err(OwtpError::KeyAgreementFailed(
                "non-contributory ephemeral key".into(),
            ));
        }

        ka.responder_public_key = self.cert.public_key_hex();
        ka.responder_tmp_public_key = hex::encode(public.as_bytes());
        let key = derive_session_key(shared.as_bytes(), ka)?;
        let session = SessionKey::from_bytes(&ka.encrypt_type, &key);
        ka.verify_tag = verification_tag(key.as_slice(), ka)?;
        ka.key_id = session.id.clone();
        Ok(session)
    }

    /// Complete a key agreement as initiator from the responder's answer.
    pub fn response_key_agreement(
        &self,
        ka: &KeyAgreement,
        pending: PendingAgreement,
    ) -> OwtpResult<SessionKey> {
        if ka.initiator_tmp_public_key != pending.agreement.initiator_tmp_public_key
            || ka.initiator_public_key != pending.agreement.initiator_public_key
        {
            return Err(OwtpError::KeyAgreementFailed(
                "answer does not match this initiation".into(),
            ));
        }
        if ka.encrypt_type != pending.agreement.encrypt_type {
            return Err(OwtpError::KeyAgreementFailed(
                "encryption type changed during agreement".into(),
            ));
        }
        let their_tmp = decode_x25519(&ka.responder_tmp_public_key)?;
        let shared = pending.secret.diffie_hellman(&their_tmp);
        if !shared.was_contributory() {
            return Err(OwtpError::KeyAgreementFailed(
                "non-contributory ephemeral key".into(),
            ));
        }

        let key = derive_session_key(shared.as_bytes(), ka)?;
        let expected = verification_tag(key.as_slice(), ka)?;
        let matches: bool =
            subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), ka.verify_tag.as_bytes()).into();
        if !matches {
            return Err(OwtpError::KeyAgreementFailed(
                "verification tag mismatch".into(),
            ));
        }
        Ok(SessionKey::from_bytes(&ka.encrypt_type, &key))
    }

    /// Whether `cached` is the key the sender of `ka` used.
    pub fn verify_key_agreement(&self, ka: &KeyAgreement, cached: Option<&SessionKey>) -> bool {
        cached.is_some_and(|key| key.id == ka.key_id && key.encrypt_type == ka.encrypt_type)
    }

    /// Sign the packet's canonical fields. No-op when signing is disabled.
    pub fn generate_signature(&self, packet: &mut DataPacket) -> bool {
        if !self.enable_signature {
            return true;
        }
        packet.signature = self.cert.sign(&packet.signing_bytes());
        true
    }

    /// Check the packet signature against the remote identity key.
    pub fn verify_signature(&self, packet: &DataPacket) -> bool {
        if !self.enable_signature {
            return true;
        }
        match self.remote_public_key() {
            Some(key) => verify_hex_signature(&key, &packet.signing_bytes(), &packet.signature),
            None => false,
        }
    }

    /// Encrypt the payload in place and mark the packet with the key id.
    pub fn encrypt_data_packet(
        &self,
        packet: &mut DataPacket,
        key: Option<&SessionKey>,
    ) -> OwtpResult<()> {
        let Some(key) = key else {
            return Ok(());
        };
        check_encrypt_type(&key.encrypt_type).map_err(|e| OwtpError::Crypto(e.to_string()))?;
        let cipher = Aes256Gcm::new_from_slice(&key.key_bytes()?)
            .map_err(|e| OwtpError::Crypto(format!("invalid session key: {e}")))?;

        let plaintext = serde_json::to_vec(&packet.data)?;
        let mut nonce = [0u8; GCM_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let aad = packet.nonce.to_be_bytes();
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| OwtpError::Crypto(format!("AES-GCM encryption failed: {e}")))?;

        let mut sealed = Vec::with_capacity(GCM_NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        packet.data = Value::String(BASE64.encode(sealed));
        packet.secret = Some(KeyAgreement::session_marker(&key.encrypt_type, &key.id));
        Ok(())
    }

    /// Decrypt the payload in place. Plaintext packets pass through.
    pub fn decrypt_data_packet(
        &self,
        packet: &mut DataPacket,
        key: Option<&SessionKey>,
    ) -> OwtpResult<()> {
        let Some(key_id) = packet.session_key_id() else {
            return Ok(());
        };
        let key = key.ok_or_else(|| OwtpError::Crypto("no session key established".into()))?;
        if key.id != key_id {
            return Err(OwtpError::Crypto(format!(
                "packet encrypted under unknown key {key_id}"
            )));
        }
        let sealed = packet
            .data
            .as_str()
            .ok_or_else(|| OwtpError::Crypto("encrypted payload is not a string".into()))
            .and_then(|s| {
                BASE64
                    .decode(s)
                    .map_err(|e| OwtpError::Crypto(format!("invalid ciphertext encoding: {e}")))
            })?;
        if sealed.len() < GCM_NONCE_LEN {
            return Err(OwtpError::Crypto("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(GCM_NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(&key.key_bytes()?)
            .map_err(|e| OwtpError::Crypto(format!("invalid session key: {e}")))?;
        let aad = packet.nonce.to_be_bytes();
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(nonce),
                    Payload {
                        msg: ciphertext,
                        aad: &aad,
                    },
                )
                .map_err(|e| OwtpError::Crypto(format!("AES-GCM decryption failed: {e}")))?,
        );
        packet.data = serde_json::from_slice(&plaintext)?;
        packet.secret = None;
        Ok(())
    }
}

impl fmt::Debug for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authorization")
            .field("local_pid", &self.local_pid())
            .field("remote_pid", &self.remote_pid())
            .field("enable_signature", &self.enable_signature)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pair(sign: bool) -> (Authorization, Authorization) {
        let a = Arc::new(Certificate::random());
        let b = Arc::new(Certificate::random());
        let a_to_b = Authorization::with_remote(a.clone(), Some(b.public_key()), sign);
        let b_to_a = Authorization::with_remote(b, Some(a.public_key()), sign);
        (a_to_b, b_to_a)
    }

    fn negotiate(a: &Authorization, b: &Authorization) -> (SessionKey, SessionKey) {
        let pending = a.init_key_agreement(ENCRYPT_TYPE_AES_GCM).unwrap();
        let mut ka = pending.agreement().clone();
        let responder_key = b.request_key_agreement(&mut ka).unwrap();
        let initiator_key = a.response_key_agreement(&ka, pending).unwrap();
        (initiator_key, responder_key)
    }

    #[test]
    fn test_certificate_is_deterministic_from_seed() {
        let c1 = Certificate::new(Some([7u8; 32]));
        let c2 = Certificate::from_hex_seed(&hex::encode([7u8; 32])).unwrap();
        assert_eq!(c1.pid(), c2.pid());
        assert_eq!(c1.pid().len(), 40);
        assert_ne!(c1.pid(), Certificate::random().pid());
    }

    #[test]
    fn test_bad_seed_rejected() {
        assert!(Certificate::from_hex_seed("zz").is_err());
        assert!(Certificate::from_hex_seed("0011").is_err());
    }

    #[test]
    fn test_remote_pid_matches_certificate() {
        let (a, b) = pair(false);
        assert_eq!(a.remote_pid().as_deref(), Some(b.local_pid()));
        assert_eq!(b.remote_pid().as_deref(), Some(a.local_pid()));
    }

    #[test]
    fn test_signature_roundtrip_and_tamper() {
        let (a, b) = pair(true);
        let mut packet = DataPacket::request("echo", 1, json!({"x": 1}));
        assert!(a.generate_signature(&mut packet));
        assert!(!packet.signature.is_empty());
        assert!(b.verify_signature(&packet));

        packet.data = json!({"x": 2});
        assert!(!b.verify_signature(&packet));
    }

    #[test]
    fn test_signature_requires_known_remote() {
        let cert = Arc::new(Certificate::random());
        let signer = Authorization::new(Arc::new(Certificate::random()), true);
        let verifier = Authorization::new(cert, true);
        let mut packet = DataPacket::request("echo", 1, json!(null));
        signer.generate_signature(&mut packet);
        assert!(!verifier.verify_signature(&packet));
    }

    #[test]
    fn test_signature_disabled_is_noop() {
        let (a, b) = pair(false);
        let mut packet = DataPacket::request("echo", 1, json!(null));
        assert!(a.generate_signature(&mut packet));
        assert!(packet.signature.is_empty());
        assert!(b.verify_signature(&packet));
    }

    #[test]
    fn test_key_agreement_derives_same_key() {
        let (a, b) = pair(false);
        let (k1, k2) = negotiate(&a, &b);
        assert_eq!(k1, k2);
        assert_eq!(k1.id.len(), 16);
    }

    #[test]
    fn test_key_agreement_tag_mismatch_fails() {
        let (a, b) = pair(false);
        let pending = a.init_key_agreement(ENCRYPT_TYPE_AES_GCM).unwrap();
        let mut ka = pending.agreement().clone();
        b.request_key_agreement(&mut ka).unwrap();
        ka.verify_tag = "00".repeat(32);
        let err = a.response_key_agreement(&ka, pending).unwrap_err();
        assert!(matches!(err, OwtpError::KeyAgreementFailed(_)));
    }

    #[test]
    fn test_unsupported_encrypt_type() {
        let (a, _) = pair(false);
        assert!(a.init_key_agreement("rot13").is_err());
    }

    #[test]
    fn test_verify_key_agreement() {
        let (a, b) = pair(false);
        let (key, _) = negotiate(&a, &b);
        let marker = KeyAgreement::session_marker(ENCRYPT_TYPE_AES_GCM, &key.id);
        assert!(a.verify_key_agreement(&marker, Some(&key)));
        assert!(!a.verify_key_agreement(&marker, None));
        let stale = KeyAgreement::session_marker(ENCRYPT_TYPE_AES_GCM, "deadbeefdeadbeef");
        assert!(!a.verify_key_agreement(&stale, Some(&key)));
    }

    #[test]
    fn test_encrypt_decrypt_payload() {
        let (a, b) = pair(false);
        let (ka, kb) = negotiate(&a, &b);
        let params = json!({"walletID": "W1", "amount": "0.5"});
        let mut packet = DataPacket::request("submitTransaction", 99, params.clone());

        a.encrypt_data_packet(&mut packet, Some(&ka)).unwrap();
        let ciphertext = packet.data.as_str().unwrap().to_string();
        assert!(serde_json::from_str::<Value>(&ciphertext).is_err());
        assert!(!ciphertext.contains("walletID"));
        assert_eq!(packet.session_key_id(), Some(ka.id.as_str()));

        b.decrypt_data_packet(&mut packet, Some(&kb)).unwrap();
        assert_eq!(packet.data, params);
        assert!(packet.secret.is_none());
    }

    #[test]
    fn test_decrypt_rejects_other_nonce() {
        let (a, b) = pair(false);
        let (ka, kb) = negotiate(&a, &b);
        let mut packet = DataPacket::request("echo", 1, json!({"x": 1}));
        a.encrypt_data_packet(&mut packet, Some(&ka)).unwrap();
        packet.nonce = 2;
        assert!(b.decrypt_data_packet(&mut packet, Some(&kb)).is_err());
    }

    #[test]
    fn test_encryption_without_key_is_noop() {
        let (a, _) = pair(false);
        let mut packet = DataPacket::request("echo", 1, json!({"x": 1}));
        a.encrypt_data_packet(&mut packet, None).unwrap();
        assert_eq!(packet.data, json!({"x": 1}));
        a.decrypt_data_packet(&mut packet, None).unwrap();
        assert_eq!(packet.data, json!({"x": 1}));
    }

    #[test]
    fn test_handshake_headers_verify() {
        let cert = Certificate::random();
        let headers = cert.handshake_headers();
        let lookup = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.clone())
        };
        let key = verify_handshake(lookup, true).unwrap();
        assert_eq!(derive_pid(&key), cert.pid());

        let forged = |name: &str| {
            if name == HEADER_SIGNATURE {
                Some("00".repeat(64))
            } else {
                lookup(name)
            }
        };
        assert!(verify_handshake(forged, true).is_err());
        // Identity alone is enough when signatures are not required
        assert!(verify_handshake(forged, false).is_ok());
    }
}
