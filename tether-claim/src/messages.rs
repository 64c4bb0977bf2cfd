//! JSON bodies exchanged with the claim service.
//!
//! ```text
//! POST claim/initiate  {"mac_addr":"7CDFA1B3926C","platform":"esp32s2"}
//!                  <-  {"auth_id":"...","challenge":"..."}
//! POST claim/verify    {"auth_id":"...","challenge_response":"<128 hex>","csr":"<escaped PEM>"}
//!                  <-  {"certificate":"<escaped PEM>"}
//! ```

use serde::{Deserialize, Serialize, Serializer};
use serde_json::value::RawValue;

use crate::error::EnrollError;
use crate::pem::{escape_newlines, unescape_newlines};

/// Longest `auth_id` the device accepts.
pub const MAX_AUTH_ID_LEN: usize = 63;

/// Longest `challenge` the device accepts.
pub const MAX_CHALLENGE_LEN: usize = 129;

/// Body of the initiate request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitRequest {
    pub mac_addr: String,
    pub platform: String,
}

/// Parsed initiate response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitResponse {
    pub auth_id: String,
    pub challenge: String,
}

#[derive(Deserialize)]
struct RawInitResponse {
    #[serde(default)]
    auth_id: Option<String>,
    #[serde(default)]
    challenge: Option<String>,
}

impl InitResponse {
    /// Parse the initiate response; both fields are required.
    pub fn parse(body: &[u8]) -> Result<Self, EnrollError> {
        let raw: RawInitResponse = serde_json::from_slice(body).map_err(|e| {
            EnrollError::ProtocolViolation(format!("initiate response is not JSON: {e}"))
        })?;
        let auth_id = required(raw.auth_id, "auth_id", MAX_AUTH_ID_LEN)?;
        let challenge = required(raw.challenge, "challenge", MAX_CHALLENGE_LEN)?;
        Ok(Self { auth_id, challenge })
    }
}

/// CSR text in its single-line escaped form.
///
/// Serialized verbatim as the content of a JSON string, so the escaped `\n`
/// sequences reach the service as JSON newline escapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscapedPem(String);

impl EscapedPem {
    /// Escape a PEM document for embedding.
    pub fn from_pem(pem: &str) -> Result<Self, EnrollError> {
        let escaped = escape_newlines(pem);
        // Anything that is not valid as raw JSON string content is refused up front.
        RawValue::from_string(format!("\"{escaped}\"")).map_err(|e| {
            EnrollError::Crypto(format!("PEM is not embeddable in JSON: {e}"))
        })?;
        Ok(Self(escaped))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the multi-line PEM.
    pub fn to_pem(&self) -> String {
        unescape_newlines(&self.0)
    }
}

impl Serialize for EscapedPem {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let raw = RawValue::from_string(format!("\"{}\"", self.0))
            .map_err(serde::ser::Error::custom)?;
        raw.serialize(serializer)
    }
}

/// Body of the verify request.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyRequest {
    pub auth_id: String,
    pub challenge_response: String,
    pub csr: EscapedPem,
}

#[derive(Deserialize)]
struct RawVerifyResponse {
    #[serde(default)]
    certificate: Option<String>,
}

/// Parse the verify response and return the certificate as multi-line PEM.
pub fn parse_verify_response(body: &[u8]) -> Result<String, EnrollError> {
    let raw: RawVerifyResponse = serde_json::from_slice(body).map_err(|e| {
        EnrollError::ProtocolViolation(format!("verify response is not JSON: {e}"))
    })?;
    let certificate = raw
        .certificate
        .filter(|c| !c.is_empty())
        .ok_or_else(|| EnrollError::ProtocolViolation("verify response lacks certificate".into()))?;
    Ok(unescape_newlines(&certificate))
}

fn required(value: Option<String>, field: &str, max_len: usize) -> Result<String, EnrollError> {
    let value = value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EnrollError::ProtocolViolation(format!("initiate response lacks {field}")))?;
    if value.len() > max_len {
        return Err(EnrollError::ProtocolViolation(format!(
            "{field} is {} bytes (max {max_len})",
            value.len()
        )));
    }
    Ok(value)
}
