//! Self-claim enrollment engine.
//!
//! Produces a signed device certificate in two phases:
//!
//! 1. [`generate_identity`] creates (or reloads) an RSA key, persists it, and
//!    builds a CSR with subject `CN=<device id>`.
//! 2. [`perform_claim`] posts `{mac_addr, platform}` to the initiate endpoint,
//!    answers the returned challenge with an HMAC-SHA512 keyed by the
//!    device-unique secret, posts the CSR to the verify endpoint, and returns
//!    the certificate together with the private key PEM.
//!
//! The engine performs no IO of its own. The HTTPS client and the secret key
//! source are injected via [`ClaimTransport`] and [`HmacKeySource`]; the
//! private key is persisted through [`tether_core::CredentialStore`]. Storing
//! the certificate is left to the caller.

pub mod buffer;
pub mod cert;
pub mod challenge;
pub mod engine;
mod error;
pub mod keys;
pub mod messages;
pub mod pem;
pub mod session;

pub use buffer::ScratchBuffer;
pub use challenge::{challenge_response, HmacKey, HmacKeySource, StaticHmacKey};
pub use engine::{
    generate_identity, perform_claim, ClaimConfig, ClaimOutput, ClaimTransport, INIT_PATH,
    VERIFY_PATH,
};
pub use error::{EnrollError, EnrollErrorKind};
pub use keys::{DevicePrivateKey, PersonalizedRng};
pub use session::{ClaimSession, ClaimState};
