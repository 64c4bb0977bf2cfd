//! Challenge-response using the device-unique HMAC key.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha512;
use zeroize::Zeroizing;

use crate::error::EnrollError;

/// Length of the device-unique secret in bytes.
pub const HMAC_KEY_LEN: usize = 16;

/// Length of the hex-encoded challenge response.
pub const RESPONSE_HEX_LEN: usize = 128;

type HmacSha512 = Hmac<Sha512>;

/// The 128-bit device-unique secret. Zeroed on drop.
pub struct HmacKey(Zeroizing<[u8; HMAC_KEY_LEN]>);

impl HmacKey {
    pub fn new(bytes: [u8; HMAC_KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Build a key from a slice that must be exactly [`HMAC_KEY_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnrollError> {
        let array: [u8; HMAC_KEY_LEN] = bytes.try_into().map_err(|_| {
            EnrollError::HmacKey(format!(
                "expected {HMAC_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::new(array))
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

impl std::fmt::Debug for HmacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HmacKey(..)")
    }
}

/// Read access to the device-unique secret.
///
/// On hardware this is a read-protected fuse block; hosts read a file.
#[async_trait]
pub trait HmacKeySource: Send + Sync {
    async fn read_key(&self) -> Result<HmacKey, EnrollError>;
}

/// Fixed key, for tests and bench setups.
#[derive(Clone)]
pub struct StaticHmacKey([u8; HMAC_KEY_LEN]);

impl StaticHmacKey {
    pub fn new(bytes: [u8; HMAC_KEY_LEN]) -> Self {
        Self(bytes)
    }
}

#[async_trait]
impl HmacKeySource for StaticHmacKey {
    async fn read_key(&self) -> Result<HmacKey, EnrollError> {
        Ok(HmacKey::new(self.0))
    }
}

/// HMAC-SHA512 over the challenge text, as 128 uppercase hex digits.
pub fn challenge_response(key: &HmacKey, challenge: &str) -> Result<String, EnrollError> {
    let mut mac = HmacSha512::new_from_slice(key.as_bytes())
        .map_err(|e| EnrollError::Crypto(format!("hmac init: {e}")))?;
    mac.update(challenge.as_bytes());
    let digest = mac.finalize().into_bytes();
    Ok(hex::encode_upper(digest))
}
