//! Response object and the closed status taxonomy.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status codes carried in [`Response::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Success,
    BadRequest,
    /// Signature verification failed.
    Unauthorized,
    /// The payload was encrypted under a key the receiver does not hold.
    SecretKeyInvalid,
    NotFoundMethod,
    RequestTimeout,
    /// Duplicate or missing nonce inside the replay window.
    ReplayAttack,
    /// Peer closed while the request was pending.
    NetworkDisconnected,
    InternalServerError,
    ResponseMethodDiffer,
    KeyAgreementFailed,
    /// Reserved.
    DenialOfService,
    /// Application-defined code (600 and above).
    Custom(u64),
}

/// First code of the application-defined range.
pub const CUSTOM_ERROR_BASE: u64 = 600;

impl StatusCode {
    pub fn code(self) -> u64 {
        match self {
            StatusCode::Success => 200,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::SecretKeyInvalid => 402,
            StatusCode::NotFoundMethod => 404,
            StatusCode::RequestTimeout => 408,
            StatusCode::ReplayAttack => 409,
            StatusCode::NetworkDisconnected => 430,
            StatusCode::InternalServerError => 500,
            StatusCode::ResponseMethodDiffer => 501,
            StatusCode::KeyAgreementFailed => 502,
            StatusCode::DenialOfService => 503,
            StatusCode::Custom(code) => code,
        }
    }

    /// Map a numeric code back to the taxonomy. Unknown codes below the
    /// custom range are `None`.
    pub fn from_code(code: u64) -> Option<Self> {
        let status = match code {
            200 => StatusCode::Success,
            400 => StatusCode::BadRequest,
            401 => StatusCode::Unauthorized,
            402 => StatusCode::SecretKeyInvalid,
            404 => StatusCode::NotFoundMethod,
            408 => StatusCode::RequestTimeout,
            409 => StatusCode::ReplayAttack,
            430 => StatusCode::NetworkDisconnected,
            500 => StatusCode::InternalServerError,
            501 => StatusCode::ResponseMethodDiffer,
            502 => StatusCode::KeyAgreementFailed,
            503 => StatusCode::DenialOfService,
            c if c >= CUSTOM_ERROR_BASE => StatusCode::Custom(c),
            _ => return None,
        };
        Some(status)
    }

    /// Default human-readable message for the status.
    pub fn default_message(self) -> &'static str {
        match self {
            StatusCode::Success => "success",
            StatusCode::BadRequest => "bad request",
            StatusCode::Unauthorized => "signature verification failed",
            StatusCode::SecretKeyInvalid => "secret key is invalid",
            StatusCode::NotFoundMethod => "method not found",
            StatusCode::RequestTimeout => "request timed out",
            StatusCode::ReplayAttack => "replay attack detected",
            StatusCode::NetworkDisconnected => "network disconnected",
            StatusCode::InternalServerError => "internal server error",
            StatusCode::ResponseMethodDiffer => "response method differs from request",
            StatusCode::KeyAgreementFailed => "key agreement failed",
            StatusCode::DenialOfService => "denial of service",
            StatusCode::Custom(_) => "custom error",
        }
    }
}

/// Result of a call, carried in the `d` field of a response packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u64,
    #[serde(default, alias = "message")]
    pub msg: String,
    #[serde(default)]
    pub result: Value,
}

impl Response {
    pub fn new(status: u64, msg: impl Into<String>, result: Value) -> Self {
        Self {
            status,
            msg: msg.into(),
            result,
        }
    }

    /// Status 200 with the given result.
    pub fn success(result: Value) -> Self {
        Self::new(StatusCode::Success.code(), "success", result)
    }

    /// A failure response with the taxonomy's default message.
    pub fn from_status(status: StatusCode) -> Self {
        Self::new(status.code(), status.default_message(), Value::Null)
    }

    /// A failure response with a specific message.
    pub fn error(status: StatusCode, msg: impl Into<String>) -> Self {
        Self::new(status.code(), msg, Value::Null)
    }

    pub fn is_success(&self) -> bool {
        self.status == StatusCode::Success.code()
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        StatusCode::from_code(self.status)
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "status": self.status,
            "msg": self.msg,
            "result": self.result,
        })
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::success(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_codes_roundtrip() {
        for status in [
            StatusCode::Success,
            StatusCode::BadRequest,
            StatusCode::Unauthorized,
            StatusCode::SecretKeyInvalid,
            StatusCode::NotFoundMethod,
            StatusCode::RequestTimeout,
            StatusCode::ReplayAttack,
            StatusCode::NetworkDisconnected,
            StatusCode::InternalServerError,
            StatusCode::ResponseMethodDiffer,
            StatusCode::KeyAgreementFailed,
            StatusCode::DenialOfService,
            StatusCode::Custom(612),
        ] {
            assert_eq!(StatusCode::from_code(status.code()), Some(status));
        }
        assert_eq!(StatusCode::from_code(418), None);
    }

    #[test]
    fn test_well_known_codes() {
        assert_eq!(StatusCode::NotFoundMethod.code(), 404);
        assert_eq!(StatusCode::NetworkDisconnected.code(), 430);
        assert_eq!(StatusCode::Success.code(), 200);
    }

    #[test]
    fn test_response_accepts_message_alias() {
        let resp: Response =
            serde_json::from_value(json!({"status": 404, "message": "nope"})).unwrap();
        assert_eq!(resp.msg, "nope");
        assert_eq!(resp.result, Value::Null);
        assert_eq!(resp.status_code(), Some(StatusCode::NotFoundMethod));
    }

    #[test]
    fn test_to_value_matches_serde() {
        let resp = Response::success(json!({"x": 1}));
        assert_eq!(resp.to_value(), serde_json::to_value(&resp).unwrap());
        assert!(resp.is_success());
    }
}
