//! Sanity checks on certificates returned by the claim service.

use x509_parser::pem::parse_x509_pem;

use crate::error::EnrollError;

/// Upper bound on a returned certificate PEM.
pub const MAX_CERT_PEM_LEN: usize = 16 * 1024;

/// Confirm `pem` holds a parseable X.509 certificate and return its subject.
pub fn validate_certificate_pem(pem: &str) -> Result<String, EnrollError> {
    if pem.len() > MAX_CERT_PEM_LEN {
        return Err(EnrollError::ProtocolViolation(format!(
            "certificate is {} bytes (max {MAX_CERT_PEM_LEN})",
            pem.len()
        )));
    }
    let (_, block) = parse_x509_pem(pem.as_bytes())
        .map_err(|e| EnrollError::ProtocolViolation(format!("certificate is not PEM: {e}")))?;
    if block.label != "CERTIFICATE" {
        return Err(EnrollError::ProtocolViolation(format!(
            "expected CERTIFICATE block, got {}",
            block.label
        )));
    }
    let cert = block
        .parse_x509()
        .map_err(|e| EnrollError::ProtocolViolation(format!("certificate is not X.509: {e}")))?;
    Ok(cert.subject().to_string())
}
