//! The two-phase claim exchange.

use async_trait::async_trait;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use tether_core::store::{KEY_PRIVATE_KEY, NS_CLAIM};
use tether_core::{CredentialStore, DeviceIdentity};

use crate::buffer::{ScratchBuffer, DEFAULT_CAPACITY};
use crate::cert::validate_certificate_pem;
use crate::challenge::{challenge_response, HmacKeySource};
use crate::error::EnrollError;
use crate::keys::{DevicePrivateKey, PersonalizedRng, KEYGEN_PERSONALIZATION};
use crate::messages::{parse_verify_response, EscapedPem, InitRequest, InitResponse, VerifyRequest};
use crate::session::{ClaimSession, ClaimState};

/// Path of the initiate endpoint, relative to the service base URL.
pub const INIT_PATH: &str = "claim/initiate";

/// Path of the verify endpoint, relative to the service base URL.
pub const VERIFY_PATH: &str = "claim/verify";

/// HTTPS access to the claim service.
///
/// Implementations authenticate the server only, open one connection per call
/// and close it before returning, including on error.
#[async_trait]
pub trait ClaimTransport: Send + Sync {
    /// POST the JSON body held in `buffer` to `path`.
    ///
    /// On return `buffer` holds the response body and the HTTP status is
    /// returned. A body that does not fit yields
    /// [`EnrollError::BufferExhausted`].
    async fn post(&self, path: &str, buffer: &mut ScratchBuffer) -> Result<u16, EnrollError>;
}

/// Per-device enrollment parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimConfig {
    /// Platform string reported in the initiate request.
    pub platform: String,
    /// Capacity of the request/response scratch buffer.
    pub buffer_capacity: usize,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            platform: std::env::consts::ARCH.to_string(),
            buffer_capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Terminal outputs of a successful claim.
pub struct ClaimOutput {
    pub certificate_pem: String,
    pub private_key_pem: Zeroizing<String>,
}

impl std::fmt::Debug for ClaimOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimOutput")
            .field("certificate_len", &self.certificate_pem.len())
            .finish_non_exhaustive()
    }
}

/// Load or create the device key and build the CSR.
///
/// A newly generated key is persisted under `claim/key` before this returns,
/// so no later failure forces regeneration.
pub async fn generate_identity(
    identity: &DeviceIdentity,
    store: &dyn CredentialStore,
    config: &ClaimConfig,
) -> Result<ClaimSession, EnrollError> {
    let mut session = ClaimSession::new(
        identity.clone(),
        config.platform.clone(),
        config.buffer_capacity,
    );

    let key = match store.get_string(NS_CLAIM, KEY_PRIVATE_KEY).await? {
        Some(pem) => match DevicePrivateKey::from_pkcs8_pem(&pem) {
            Ok(key) => {
                info!(device_id = %identity.id, "Reusing persisted device key");
                key
            }
            Err(e) => {
                warn!(error = %e, "Persisted device key is unusable, generating a new one");
                generate_and_persist(store).await?
            }
        },
        None => generate_and_persist(store).await?,
    };
    session.record_key(key)?;

    let csr = match session.key() {
        Some(key) => key.certificate_request(&identity.id)?,
        None => {
            return Err(EnrollError::InvalidState {
                expected: ClaimState::KeyGenerated,
                actual: session.state(),
            })
        }
    };
    debug!(csr_len = csr.len(), "Built certificate signing request");
    session.record_csr(csr)?;

    Ok(session)
}

async fn generate_and_persist(
    store: &dyn CredentialStore,
) -> Result<DevicePrivateKey, EnrollError> {
    info!("Generating device key");
    let key = tokio::task::spawn_blocking(|| {
        let mut rng = PersonalizedRng::new(KEYGEN_PERSONALIZATION);
        DevicePrivateKey::generate(&mut rng)
    })
    .await
    .map_err(|e| EnrollError::Crypto(format!("key generation task: {e}")))??;

    store
        .set_string(NS_CLAIM, KEY_PRIVATE_KEY, key.to_pkcs8_pem())
        .await?;
    info!("Device key persisted");
    Ok(key)
}

/// Run the initiate and verify phases.
///
/// Consumes the session; any failure discards it and the caller restarts
/// from [`generate_identity`]. The certificate is returned, not stored.
pub async fn perform_claim(
    mut session: ClaimSession,
    transport: &dyn ClaimTransport,
    hmac: &dyn HmacKeySource,
) -> Result<ClaimOutput, EnrollError> {
    match run_claim(&mut session, transport, hmac).await {
        Ok(output) => {
            info!(device_id = %session.identity().id, "Claim verified");
            Ok(output)
        }
        Err(e) => {
            warn!(state = %session.state(), error = %e, "Claim failed");
            session.fail();
            Err(e)
        }
    }
}

async fn run_claim(
    session: &mut ClaimSession,
    transport: &dyn ClaimTransport,
    hmac: &dyn HmacKeySource,
) -> Result<ClaimOutput, EnrollError> {
    // Initiate.
    session.expect(ClaimState::CsrGenerated)?;
    let request = InitRequest {
        mac_addr: session.identity().mac.to_hex_upper(),
        platform: session.platform().to_string(),
    };
    load_json(session.scratch_mut(), &request)?;
    session.mark_init_sent()?;
    info!(mac_addr = %request.mac_addr, platform = %request.platform, "Claim initiate");

    let status = transport.post(INIT_PATH, session.scratch_mut()).await?;
    check_status(INIT_PATH, status, session.scratch())?;
    let init = InitResponse::parse(session.scratch().as_bytes())?;
    debug!(auth_id = %init.auth_id, "Claim initiate acknowledged");
    session.record_init(init.auth_id, init.challenge)?;

    // Verify.
    let (auth_id, challenge, csr) = match (session.auth_id(), session.challenge(), session.csr()) {
        (Some(a), Some(c), Some(csr)) => (a.to_string(), c.to_string(), csr.to_string()),
        _ => {
            return Err(EnrollError::ProtocolViolation(
                "session lacks auth_id, challenge or CSR".into(),
            ))
        }
    };
    let key = hmac.read_key().await?;
    let request = VerifyRequest {
        auth_id,
        challenge_response: challenge_response(&key, &challenge)?,
        csr: EscapedPem::from_pem(&csr)?,
    };
    drop(key);
    load_json(session.scratch_mut(), &request)?;
    session.mark_verify_sent()?;
    info!("Claim verify");

    let status = transport.post(VERIFY_PATH, session.scratch_mut()).await?;
    check_status(VERIFY_PATH, status, session.scratch())?;
    let certificate = parse_verify_response(session.scratch().as_bytes())?;
    let subject = validate_certificate_pem(&certificate)?;
    debug!(subject = %subject, cert_len = certificate.len(), "Received device certificate");
    session.scratch_mut().clear();
    session.record_certificate(certificate.clone())?;

    let private_key_pem = session
        .key()
        .map(|key| Zeroizing::new(key.to_pkcs8_pem().to_string()))
        .ok_or(EnrollError::InvalidState {
            expected: ClaimState::Verified,
            actual: session.state(),
        })?;
    Ok(ClaimOutput {
        certificate_pem: certificate,
        private_key_pem,
    })
}

fn load_json<T: serde::Serialize>(buffer: &mut ScratchBuffer, body: &T) -> Result<(), EnrollError> {
    let bytes = serde_json::to_vec(body)
        .map_err(|e| EnrollError::ProtocolViolation(format!("encode request: {e}")))?;
    buffer.load(&bytes)
}

fn check_status(path: &str, status: u16, buffer: &ScratchBuffer) -> Result<(), EnrollError> {
    if status == 200 {
        return Ok(());
    }
    warn!(
        path,
        status,
        body = %String::from_utf8_lossy(buffer.as_bytes()),
        "Claim service rejected request"
    );
    Err(EnrollError::HttpStatus {
        path: path.to_string(),
        status,
    })
}
