//! Credential store contract.
//!
//! Values are addressed by `(partition, namespace, key)` and survive reboot.
//! Backends provide their own atomic read/write per key; callers add no
//! locking. There is no transaction spanning multiple keys.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

/// Partition holding every value the device persists.
pub const PARTITION: &str = "nvs";

/// Namespace written by the provisioning tool before first boot.
pub const NS_PROVISION: &str = "provision";

/// Namespace owned by the enrollment flow.
pub const NS_CLAIM: &str = "claim";

/// Access point SSID (provisioning namespace).
pub const KEY_WIFI_SSID: &str = "wifiSsid";
/// Access point passphrase (provisioning namespace).
pub const KEY_WIFI_PASS: &str = "wifiPass";
/// Broker endpoint host name (provisioning namespace).
pub const KEY_ENDPOINT: &str = "endpoint";
/// Signed device certificate PEM (claim namespace).
pub const KEY_CERTIFICATE: &str = "certificate";
/// Device private key PEM (claim namespace).
pub const KEY_PRIVATE_KEY: &str = "key";
/// Stable device identifier (claim namespace).
pub const KEY_NODE_ID: &str = "nodeid";

/// Errors reported by a credential store backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// A required entry is absent.
    #[error("no entry for {namespace}/{key}")]
    NotFound { namespace: String, key: String },

    /// The backend could not read an entry.
    #[error("read failed: {0}")]
    ReadFailure(String),

    /// The backend could not durably write an entry.
    #[error("write failed: {0}")]
    WriteFailure(String),

    /// The stored bytes are not valid UTF-8 text.
    #[error("entry {namespace}/{key} is not valid UTF-8")]
    NotText { namespace: String, key: String },
}

/// Durable key-value persistence.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Read an entry, returning `None` when it was never written.
    async fn get(
        &self,
        partition: &str,
        namespace: &str,
        key: &str,
    ) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write an entry, replacing any previous value.
    async fn set(
        &self,
        partition: &str,
        namespace: &str,
        key: &str,
        value: &[u8],
    ) -> Result<(), StoreError>;

    /// Read an entry from [`PARTITION`] as UTF-8 text.
    async fn get_string(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
        match self.get(PARTITION, namespace, key).await? {
            Some(bytes) => String::from_utf8(bytes).map(Some).map_err(|_| StoreError::NotText {
                namespace: namespace.to_string(),
                key: key.to_string(),
            }),
            None => Ok(None),
        }
    }

    /// Read a text entry from [`PARTITION`] that must be present.
    async fn require_string(&self, namespace: &str, key: &str) -> Result<String, StoreError> {
        self.get_string(namespace, key)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                namespace: namespace.to_string(),
                key: key.to_string(),
            })
    }

    /// Write a text entry into [`PARTITION`].
    async fn set_string(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.set(PARTITION, namespace, key, value.as_bytes()).await
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String, String), Vec<u8>>>,
    fail_writes: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set` fail with [`StoreError::WriteFailure`].
    pub fn fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap_or_else(|e| e.into_inner()) = fail;
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(
        &self,
        partition: &str,
        namespace: &str,
        key: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(&(partition.to_string(), namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn set(
        &self,
        partition: &str,
        namespace: &str,
        key: &str,
        value: &[u8],
    ) -> Result<(), StoreError> {
        if *self.fail_writes.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(StoreError::WriteFailure(format!(
                "{namespace}/{key}: store is read-only"
            )));
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            (partition.to_string(), namespace.to_string(), key.to_string()),
            value.to_vec(),
        );
        Ok(())
    }
}
