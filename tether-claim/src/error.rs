//! Enrollment error types.

use tether_core::StoreError;

use crate::session::ClaimState;

/// Errors that can occur during an enrollment attempt.
///
/// None are retried inside a single call; the caller restarts the whole
/// sequence.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum EnrollError {
    /// The enrollment service could not be reached or the connection broke.
    #[error("network error: {0}")]
    Network(String),

    /// The service answered with a status other than 200.
    #[error("{path} returned HTTP {status}")]
    HttpStatus { path: String, status: u16 },

    /// The response is malformed or incomplete.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A request or response does not fit the scratch buffer.
    #[error("scratch buffer exhausted (capacity {capacity} bytes)")]
    BufferExhausted { capacity: usize },

    /// Key generation, CSR construction or MAC computation failed.
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// The device-unique HMAC key could not be read.
    #[error("hmac key unavailable: {0}")]
    HmacKey(String),

    /// The private key could not be persisted or reloaded.
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),

    /// A session step was attempted out of order.
    #[error("invalid claim state: expected {expected:?}, found {actual:?}")]
    InvalidState {
        expected: ClaimState,
        actual: ClaimState,
    },
}

/// Coarse classification of an [`EnrollError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollErrorKind {
    Network,
    ProtocolViolation,
    CryptoFailure,
    StorageFailure,
}

impl EnrollError {
    pub fn kind(&self) -> EnrollErrorKind {
        match self {
            Self::Network(_) | Self::HttpStatus { .. } => EnrollErrorKind::Network,
            Self::ProtocolViolation(_)
            | Self::BufferExhausted { .. }
            | Self::InvalidState { .. } => EnrollErrorKind::ProtocolViolation,
            Self::Crypto(_) | Self::HmacKey(_) => EnrollErrorKind::CryptoFailure,
            Self::Storage(_) => EnrollErrorKind::StorageFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            EnrollError::HttpStatus {
                path: "claim/verify".into(),
                status: 500
            }
            .kind(),
            EnrollErrorKind::Network
        );
        assert_eq!(
            EnrollError::BufferExhausted { capacity: 16 }.kind(),
            EnrollErrorKind::ProtocolViolation
        );
        assert_eq!(EnrollError::HmacKey("efuse".into()).kind(), EnrollErrorKind::CryptoFailure);
        assert_eq!(
            EnrollError::Storage(StoreError::WriteFailure("disk".into())).kind(),
            EnrollErrorKind::StorageFailure
        );
    }
}
