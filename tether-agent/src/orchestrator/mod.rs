//! Connection orchestrator.
//!
//! A supervisor drives four layers toward `Up`. Each layer is acquired by an
//! action task; actions report back only through the [`EventSet`], and the
//! escalation table in [`tether_core::ConnectionState::apply`] decides which
//! layers a loss takes down with it.
//!
//! Collaborators are injected as trait objects through [`AgentContext`]:
//!
//! | Trait | Production | Tests |
//! |-------|------------|-------|
//! | [`LinkDriver`] | [`crate::link::HostLink`] | scripted fakes |
//! | [`SecureTransport`] | [`crate::broker::BrokerConnection`] | scripted fakes |
//! | [`MessagingSession`] | [`crate::broker::BrokerConnection`] | scripted fakes |

pub mod actions;
mod events;
mod supervisor;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use zeroize::Zeroizing;

use tether_claim::{ClaimConfig, ClaimTransport, HmacKeySource};
use tether_core::{CredentialStore, DeviceId, DeviceIdentity};

pub use events::EventSet;
pub use supervisor::{Orchestrator, OrchestratorError};

/// Network association failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum LinkError {
    /// The interface is missing or unreadable.
    #[error("interface: {0}")]
    Interface(String),

    /// Association did not complete.
    #[error("association failed: {0}")]
    Association(String),
}

/// Failures establishing or holding a secure transport or messaging session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ConnError {
    /// Send or receive failed on the underlying stream.
    #[error("transport down: {0}")]
    TransportDown(String),

    /// The peer refused the session.
    #[error("rejected by broker (code {0})")]
    AuthRejected(u8),

    /// A packet did not fit the configured buffer.
    #[error("packet needs {needed} bytes, buffer holds {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    /// The peer answered with something the protocol does not allow.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// TLS configuration or handshake failure.
    #[error("tls: {0}")]
    Tls(String),

    /// The session was replaced or torn down by this side.
    #[error("session superseded")]
    Superseded,
}

/// Publish failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PubError {
    /// Send failed on the underlying stream.
    #[error("transport down: {0}")]
    TransportDown(String),

    /// No messaging session is established.
    #[error("not connected")]
    NotConnected,

    /// The packet did not fit the configured buffer.
    #[error("packet needs {needed} bytes, buffer holds {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },
}

/// Device certificate and private key, both PEM.
///
/// # Security
///
/// The key is zeroized on drop and never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceCredentials {
    pub certificate_pem: String,
    pub private_key_pem: Zeroizing<String>,
}

impl fmt::Debug for DeviceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCredentials")
            .field("certificate_len", &self.certificate_pem.len())
            .finish_non_exhaustive()
    }
}

/// Network association.
#[async_trait]
pub trait LinkDriver: Send + Sync {
    /// Request association and wait for confirmation.
    async fn associate(&self, ssid: &str, pass: &str) -> Result<(), LinkError>;

    /// Resolve once the association is lost.
    async fn wait_lost(&self);
}

/// Mutually authenticated transport to the broker.
#[async_trait]
pub trait SecureTransport: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        credentials: &DeviceCredentials,
    ) -> Result<(), ConnError>;

    /// Close any open transport handle. A no-op when nothing is open.
    async fn disconnect(&self);
}

/// Messaging session over the secure transport.
#[async_trait]
pub trait MessagingSession: Send + Sync {
    async fn connect(&self, client_id: &DeviceId) -> Result<(), ConnError>;

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PubError>;

    /// Keep the session alive until it fails, returning why.
    ///
    /// [`ConnError::TransportDown`] means the stream under the session broke.
    /// [`ConnError::Superseded`] means this side replaced the session.
    async fn maintain(&self) -> ConnError;
}

/// Everything the actions share. Built once at startup.
pub struct AgentContext {
    pub identity: DeviceIdentity,
    pub store: Arc<dyn CredentialStore>,
    pub claim: Arc<dyn ClaimTransport>,
    pub hmac: Arc<dyn HmacKeySource>,
    pub link: Arc<dyn LinkDriver>,
    pub transport: Arc<dyn SecureTransport>,
    pub messaging: Arc<dyn MessagingSession>,
    pub claim_config: ClaimConfig,
    /// Delay before an action reports a failed attempt.
    pub retry_delay: Duration,
    /// Print registration blocks after a fresh enrollment.
    pub announce_registration: bool,
    /// Current credentials, published by the credentials action.
    pub credentials: ArcSwapOption<DeviceCredentials>,
}

#[cfg(test)]
pub(crate) mod testing;
