//! Per-layer acquisition actions.
//!
//! Each action runs as its own task, started by the supervisor when its layer
//! is `Down`. It posts exactly one of `Established` or `AttemptFailed`, and
//! layers that hold a live resource (link, messaging) then keep watching it
//! and post `Lost` when it goes away.

use std::fmt::Display;
use std::sync::Arc;

use zeroize::Zeroizing;

use tether_claim::cert::validate_certificate_pem;
use tether_claim::{generate_identity, perform_claim, EnrollError};
use tether_core::store::{
    KEY_CERTIFICATE, KEY_ENDPOINT, KEY_PRIVATE_KEY, KEY_WIFI_PASS, KEY_WIFI_SSID, NS_CLAIM,
    NS_PROVISION,
};
use tether_core::{CredentialStore, DeviceId, Layer, LayerEvent};

use super::{AgentContext, ConnError, DeviceCredentials, EventSet};

/// Run the acquisition action for `layer` to completion.
pub async fn run(layer: Layer, ctx: Arc<AgentContext>, events: EventSet) {
    match layer {
        Layer::Link => acquire_link(&ctx, &events).await,
        Layer::Credentials => acquire_credentials(&ctx, &events).await,
        Layer::Transport => acquire_transport(&ctx, &events).await,
        Layer::Messaging => acquire_messaging(&ctx, &events).await,
    }
}

async fn fail(ctx: &AgentContext, events: &EventSet, layer: Layer, error: &(dyn Display + Sync)) {
    tracing::warn!(layer = %layer, error = %error, "Acquisition attempt failed");
    tokio::time::sleep(ctx.retry_delay).await;
    events.post(LayerEvent::AttemptFailed(layer));
}

async fn acquire_link(ctx: &AgentContext, events: &EventSet) {
    let provisioned = async {
        let ssid = ctx.store.require_string(NS_PROVISION, KEY_WIFI_SSID).await?;
        let pass = Zeroizing::new(ctx.store.require_string(NS_PROVISION, KEY_WIFI_PASS).await?);
        Ok::<_, tether_core::StoreError>((ssid, pass))
    };
    let (ssid, pass) = match provisioned.await {
        Ok(values) => values,
        Err(e) => return fail(ctx, events, Layer::Link, &e).await,
    };

    if let Err(e) = ctx.link.associate(&ssid, &pass).await {
        return fail(ctx, events, Layer::Link, &e).await;
    }

    tracing::info!(ssid = %ssid, "Link established");
    if events.establish(Layer::Link) {
        ctx.link.wait_lost().await;
        events.post(LayerEvent::Lost(Layer::Link));
    }
}

async fn acquire_credentials(ctx: &AgentContext, events: &EventSet) {
    match obtain_credentials(ctx, events).await {
        Ok(credentials) => {
            ctx.credentials.store(Some(Arc::new(credentials)));
            events.establish(Layer::Credentials);
        }
        Err(e) => fail(ctx, events, Layer::Credentials, &e).await,
    }
}

/// Persisted certificate and key, if both are present and the certificate
/// still parses.
pub async fn load_credentials(
    store: &dyn CredentialStore,
) -> Result<Option<DeviceCredentials>, EnrollError> {
    let Some(certificate_pem) = store.get_string(NS_CLAIM, KEY_CERTIFICATE).await? else {
        return Ok(None);
    };
    let Some(private_key_pem) = store.get_string(NS_CLAIM, KEY_PRIVATE_KEY).await? else {
        tracing::warn!("Persisted certificate has no key, enrolling again");
        return Ok(None);
    };
    if let Err(e) = validate_certificate_pem(&certificate_pem) {
        tracing::warn!(error = %e, "Persisted certificate is unusable, enrolling again");
        return Ok(None);
    }
    Ok(Some(DeviceCredentials {
        certificate_pem,
        private_key_pem: Zeroizing::new(private_key_pem),
    }))
}

async fn obtain_credentials(
    ctx: &AgentContext,
    events: &EventSet,
) -> Result<DeviceCredentials, EnrollError> {
    if let Some(credentials) = load_credentials(ctx.store.as_ref()).await? {
        tracing::info!(device_id = %ctx.identity.id, "Using persisted credentials");
        return Ok(credentials);
    }

    // The claim service is only reachable over the link.
    events.wait_for(|state| state.link_up()).await;

    tracing::info!(device_id = %ctx.identity.id, "Enrolling device");
    let session = generate_identity(&ctx.identity, ctx.store.as_ref(), &ctx.claim_config).await?;
    let output = perform_claim(session, ctx.claim.as_ref(), ctx.hmac.as_ref()).await?;

    ctx.store
        .set_string(NS_CLAIM, KEY_PRIVATE_KEY, &output.private_key_pem)
        .await?;
    ctx.store
        .set_string(NS_CLAIM, KEY_CERTIFICATE, &output.certificate_pem)
        .await?;
    tracing::info!(device_id = %ctx.identity.id, "Enrollment complete");

    if ctx.announce_registration {
        print!("{}", registration_blocks(&ctx.identity.id, &output.certificate_pem));
    }

    Ok(DeviceCredentials {
        certificate_pem: output.certificate_pem,
        private_key_pem: output.private_key_pem,
    })
}

/// Delimited blocks scraped by registration tooling.
pub fn registration_blocks(device_id: &DeviceId, certificate_pem: &str) -> String {
    format!(
        "DEVICE_CERT_START\n{certificate_pem}\nDEVICE_CERT_END\n\
         DEVICE_THING_NAME_START\n{device_id}\nDEVICE_THING_NAME_END\n"
    )
}

async fn acquire_transport(ctx: &AgentContext, events: &EventSet) {
    let Some(credentials) = ctx.credentials.load_full() else {
        return fail(ctx, events, Layer::Transport, &"credentials not loaded").await;
    };
    let endpoint = match ctx.store.require_string(NS_PROVISION, KEY_ENDPOINT).await {
        Ok(endpoint) => endpoint,
        Err(e) => return fail(ctx, events, Layer::Transport, &e).await,
    };

    ctx.transport.disconnect().await;
    if let Err(e) = ctx.transport.connect(&endpoint, &credentials).await {
        return fail(ctx, events, Layer::Transport, &e).await;
    }

    if !events.establish(Layer::Transport) {
        tracing::debug!("Prerequisite lost during handshake, closing transport");
        ctx.transport.disconnect().await;
    }
}

async fn acquire_messaging(ctx: &AgentContext, events: &EventSet) {
    match ctx.messaging.connect(&ctx.identity.id).await {
        Ok(()) => {}
        Err(e @ ConnError::TransportDown(_)) => {
            events.post(LayerEvent::Lost(Layer::Transport));
            return fail(ctx, events, Layer::Messaging, &e).await;
        }
        Err(e) => return fail(ctx, events, Layer::Messaging, &e).await,
    }

    if !events.establish(Layer::Messaging) {
        tracing::debug!("Transport lost during session handshake");
        return;
    }
    tracing::info!(client_id = %ctx.identity.id, "Messaging session established");

    match ctx.messaging.maintain().await {
        ConnError::Superseded => {
            tracing::debug!("Messaging session replaced");
        }
        e @ ConnError::TransportDown(_) => {
            tracing::warn!(error = %e, "Transport lost under messaging session");
            events.post(LayerEvent::Lost(Layer::Transport));
        }
        e => {
            tracing::warn!(error = %e, "Messaging session lost");
            events.post(LayerEvent::Lost(Layer::Messaging));
        }
    }
}
