//! Device secret read from a file standing in for the read-protected eFuse block.

use std::path::PathBuf;

use async_trait::async_trait;
use tether_claim::challenge::HMAC_KEY_LEN;
use tether_claim::{EnrollError, HmacKey, HmacKeySource};
use zeroize::Zeroizing;

/// Reads the 16-byte secret from `path` on every call.
///
/// The file holds either the raw bytes or 32 hex digits.
#[derive(Debug, Clone)]
pub struct FileHmacKey {
    path: PathBuf,
}

impl FileHmacKey {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl HmacKeySource for FileHmacKey {
    async fn read_key(&self) -> Result<HmacKey, EnrollError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| EnrollError::HmacKey(format!("{}: {e}", self.path.display())))?;
        let bytes = Zeroizing::new(bytes);

        if bytes.len() == HMAC_KEY_LEN {
            return HmacKey::from_slice(&bytes);
        }

        let text = std::str::from_utf8(&bytes)
            .map_err(|_| EnrollError::HmacKey(format!("{}: not a key file", self.path.display())))?
            .trim();
        let mut key = Zeroizing::new([0u8; HMAC_KEY_LEN]);
        hex::decode_to_slice(text, &mut key[..]).map_err(|_| {
            EnrollError::HmacKey(format!(
                "{}: expected {HMAC_KEY_LEN} raw bytes or {} hex digits",
                self.path.display(),
                HMAC_KEY_LEN * 2
            ))
        })?;
        Ok(HmacKey::new(*key))
    }
}
