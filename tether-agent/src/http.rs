//! HTTPS access to the claim service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Certificate, Client, Url};

use tether_claim::{ClaimTransport, EnrollError, ScratchBuffer};

/// reqwest-based [`ClaimTransport`].
///
/// Server authentication only. When a root CA is supplied it replaces the
/// built-in roots, pinning the service to that anchor. No connection is kept
/// idle between requests.
#[derive(Debug, Clone)]
pub struct HttpsClaimTransport {
    client: Client,
    base_url: Url,
}

impl HttpsClaimTransport {
    pub fn new(
        base_url: &str,
        root_ca_pem: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Self, EnrollError> {
        let base_url = parse_base_url(base_url)?;

        let mut builder = Client::builder()
            .https_only(true)
            .pool_max_idle_per_host(0)
            .timeout(timeout);
        if let Some(pem) = root_ca_pem {
            let ca = Certificate::from_pem(pem)
                .map_err(|e| EnrollError::Network(format!("invalid claim root CA: {e}")))?;
            builder = builder.tls_built_in_root_certs(false).add_root_certificate(ca);
        }
        let client = builder
            .build()
            .map_err(|e| EnrollError::Network(format!("http client: {e}")))?;

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, EnrollError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| EnrollError::Network(format!("bad endpoint {path}: {e}")))
    }
}

fn parse_base_url(base: &str) -> Result<Url, EnrollError> {
    let mut url =
        Url::parse(base).map_err(|e| EnrollError::Network(format!("bad claim URL {base}: {e}")))?;
    if url.scheme() != "https" {
        return Err(EnrollError::Network(format!("claim URL must be https: {base}")));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[async_trait]
impl ClaimTransport for HttpsClaimTransport {
    async fn post(&self, path: &str, buffer: &mut ScratchBuffer) -> Result<u16, EnrollError> {
        let url = self.endpoint(path)?;
        tracing::debug!(url = %url, bytes = buffer.len(), "POST");

        let mut response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(buffer.as_bytes().to_vec())
            .send()
            .await
            .map_err(|e| EnrollError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        buffer.clear();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| EnrollError::Network(e.to_string()))?
        {
            buffer.extend(&chunk)?;
        }
        Ok(status)
    }
}
