//! Device identity.
//!
//! The device identifier is derived once from the station hardware address
//! plus two bytes of entropy, persisted, and reused across reboots. It is the
//! enrollment CSR subject and the messaging client identifier.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::store::{CredentialStore, StoreError, KEY_NODE_ID, NS_CLAIM};

/// Maximum identifier length accepted by the messaging client id field.
pub const MAX_DEVICE_ID_LEN: usize = 23;

/// Errors that can occur while building a device identity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum IdentityError {
    /// The hardware address text is not six colon- or dash-separated octets.
    #[error("invalid hardware address: {0}")]
    InvalidMac(String),

    /// A persisted identifier is empty, too long or contains unsupported characters.
    #[error("invalid device identifier: {0:?}")]
    InvalidDeviceId(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A 48-bit station hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Twelve uppercase hex digits with no separators, e.g. `7CDFA1B3926C`.
    pub fn to_hex_upper(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Parse `7c:df:a1:b3:92:6c`, `7C-DF-A1-B3-92-6C` or `7CDFA1B3926C`.
    pub fn parse(text: &str) -> Result<Self, IdentityError> {
        let digits: String = text
            .trim()
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();
        if digits.len() != 12 {
            return Err(IdentityError::InvalidMac(text.to_string()));
        }
        let mut octets = [0u8; 6];
        hex::decode_to_slice(&digits, &mut octets)
            .map_err(|_| IdentityError::InvalidMac(text.to_string()))?;
        Ok(Self(octets))
    }
}

impl FromStr for MacAddress {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// Stable identifier used as CSR common name and messaging client id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Validate an identifier read from storage or configuration.
    pub fn new(id: impl Into<String>) -> Result<Self, IdentityError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= MAX_DEVICE_ID_LEN
            && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(id))
        } else {
            Err(IdentityError::InvalidDeviceId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hardware address plus the derived stable identifier.
///
/// Computed once at startup and shared read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub mac: MacAddress,
    pub id: DeviceId,
}

impl DeviceIdentity {
    /// Derive an identifier as `<MAC hex>-<entropy hex>`, e.g. `7CDFA1B3926C-A1B2`.
    pub fn derive(mac: MacAddress, entropy: [u8; 2]) -> Self {
        let id = DeviceId(format!("{}-{}", mac.to_hex_upper(), hex::encode_upper(entropy)));
        Self { mac, id }
    }

    /// Load the persisted identifier, or derive and persist a new one.
    pub async fn load_or_derive(
        store: &dyn CredentialStore,
        mac: MacAddress,
    ) -> Result<Self, IdentityError> {
        if let Some(existing) = store.get_string(NS_CLAIM, KEY_NODE_ID).await? {
            let id = DeviceId::new(existing)?;
            return Ok(Self { mac, id });
        }

        let mut entropy = [0u8; 2];
        rand::rngs::OsRng.fill_bytes(&mut entropy);
        let identity = Self::derive(mac, entropy);
        store
            .set_string(NS_CLAIM, KEY_NODE_ID, identity.id.as_str())
            .await?;
        Ok(identity)
    }
}
