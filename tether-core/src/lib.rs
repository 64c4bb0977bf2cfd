//! # Tether Core
//!
//! Domain types shared by the enrollment engine and the connection agent.
//!
//! ## Design Principles
//!
//! This crate is intentionally **IO-free**:
//! - No filesystem operations
//! - No network calls
//! - No async runtime
//!
//! Durable storage is reached through the [`store::CredentialStore`] trait;
//! the agent supplies the real backend and tests use [`store::MemoryStore`].
//!
//! ## Modules
//!
//! - [`identity`] - Hardware address and the stable device identifier
//! - [`store`] - Credential store contract and the well-known keys
//! - [`layer`] - Connection layers, layer events and the escalation table

pub mod identity;
pub mod layer;
pub mod store;

pub use identity::{DeviceId, DeviceIdentity, IdentityError, MacAddress};
pub use layer::{ConnectionState, Layer, LayerEvent, LayerStatus};
pub use store::{CredentialStore, MemoryStore, StoreError};
