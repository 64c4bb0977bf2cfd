//! Per-attempt claim session.

use std::fmt;

use tether_core::DeviceIdentity;

use crate::buffer::ScratchBuffer;
use crate::error::EnrollError;
use crate::keys::DevicePrivateKey;

/// Progress of a single enrollment attempt. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClaimState {
    Fresh,
    KeyGenerated,
    CsrGenerated,
    InitSent,
    InitAcknowledged,
    VerifySent,
    Verified,
    Failed,
}

impl ClaimState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Verified | Self::Failed)
    }
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// State owned by one enrollment attempt.
///
/// Created by [`crate::generate_identity`] and consumed by
/// [`crate::perform_claim`]. Once the state is terminal no field changes.
pub struct ClaimSession {
    state: ClaimState,
    identity: DeviceIdentity,
    platform: String,
    key: Option<DevicePrivateKey>,
    csr: Option<String>,
    scratch: ScratchBuffer,
    auth_id: Option<String>,
    challenge: Option<String>,
    certificate: Option<String>,
}

impl ClaimSession {
    pub fn new(
        identity: DeviceIdentity,
        platform: impl Into<String>,
        buffer_capacity: usize,
    ) -> Self {
        Self {
            state: ClaimState::Fresh,
            identity,
            platform: platform.into(),
            key: None,
            csr: None,
            scratch: ScratchBuffer::new(buffer_capacity),
            auth_id: None,
            challenge: None,
            certificate: None,
        }
    }

    pub fn state(&self) -> ClaimState {
        self.state
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn csr(&self) -> Option<&str> {
        self.csr.as_deref()
    }

    pub fn auth_id(&self) -> Option<&str> {
        self.auth_id.as_deref()
    }

    pub fn challenge(&self) -> Option<&str> {
        self.challenge.as_deref()
    }

    pub fn certificate(&self) -> Option<&str> {
        self.certificate.as_deref()
    }

    pub(crate) fn key(&self) -> Option<&DevicePrivateKey> {
        self.key.as_ref()
    }

    pub(crate) fn scratch(&self) -> &ScratchBuffer {
        &self.scratch
    }

    pub(crate) fn scratch_mut(&mut self) -> &mut ScratchBuffer {
        &mut self.scratch
    }

    /// Fail unless the session is exactly at `expected`.
    pub(crate) fn expect(&self, expected: ClaimState) -> Result<(), EnrollError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(EnrollError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    pub(crate) fn record_key(&mut self, key: DevicePrivateKey) -> Result<(), EnrollError> {
        self.advance(ClaimState::Fresh, ClaimState::KeyGenerated)?;
        self.key = Some(key);
        Ok(())
    }

    pub(crate) fn record_csr(&mut self, csr: String) -> Result<(), EnrollError> {
        self.advance(ClaimState::KeyGenerated, ClaimState::CsrGenerated)?;
        self.csr = Some(csr);
        Ok(())
    }

    pub(crate) fn mark_init_sent(&mut self) -> Result<(), EnrollError> {
        self.advance(ClaimState::CsrGenerated, ClaimState::InitSent)
    }

    pub(crate) fn record_init(
        &mut self,
        auth_id: String,
        challenge: String,
    ) -> Result<(), EnrollError> {
        self.advance(ClaimState::InitSent, ClaimState::InitAcknowledged)?;
        self.auth_id = Some(auth_id);
        self.challenge = Some(challenge);
        Ok(())
    }

    pub(crate) fn mark_verify_sent(&mut self) -> Result<(), EnrollError> {
        self.advance(ClaimState::InitAcknowledged, ClaimState::VerifySent)
    }

    pub(crate) fn record_certificate(&mut self, certificate: String) -> Result<(), EnrollError> {
        self.advance(ClaimState::VerifySent, ClaimState::Verified)?;
        self.certificate = Some(certificate);
        Ok(())
    }

    /// Move to `Failed` unless already terminal.
    pub(crate) fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = ClaimState::Failed;
        }
    }

    fn advance(&mut self, from: ClaimState, to: ClaimState) -> Result<(), EnrollError> {
        self.expect(from)?;
        self.state = to;
        Ok(())
    }
}

impl fmt::Debug for ClaimSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimSession")
            .field("state", &self.state)
            .field("device_id", &self.identity.id)
            .field("platform", &self.platform)
            .field("has_key", &self.key.is_some())
            .field("auth_id", &self.auth_id)
            .finish()
    }
}
