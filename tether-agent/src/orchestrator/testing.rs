//! In-memory collaborators for orchestrator tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tokio::sync::watch;
use x509_parser::prelude::*;

use tether_claim::{
    ClaimConfig, ClaimTransport, EnrollError, ScratchBuffer, StaticHmacKey, INIT_PATH, VERIFY_PATH,
};
use tether_core::store::{
    KEY_CERTIFICATE, KEY_ENDPOINT, KEY_PRIVATE_KEY, KEY_WIFI_PASS, KEY_WIFI_SSID, NS_CLAIM,
    NS_PROVISION,
};
use tether_core::{
    CredentialStore, DeviceId, DeviceIdentity, Layer, LayerEvent, MacAddress, MemoryStore,
};

use super::{
    AgentContext, ConnError, DeviceCredentials, EventSet, LinkDriver, LinkError, MessagingSession,
    Orchestrator, PubError, SecureTransport,
};

pub fn certificate_pem_for(cn: &str) -> String {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, cn);
    params.self_signed(&key).unwrap().pem()
}

pub fn certificate_pem() -> String {
    certificate_pem_for("7CDFA1B3926C-A1B2")
}

/// Counts calls and the peak number running at once.
#[derive(Debug, Default)]
pub struct Gauge {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

pub struct GaugeGuard<'a>(&'a Gauge);

impl Gauge {
    pub fn enter(&self) -> GaugeGuard<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard(self)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Take one unit from a failure budget.
fn consume(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub struct FakeLink {
    pub gauge: Gauge,
    available: watch::Sender<bool>,
    up: watch::Sender<bool>,
}

impl FakeLink {
    fn new() -> Self {
        Self {
            gauge: Gauge::default(),
            available: watch::channel(true).0,
            up: watch::channel(false).0,
        }
    }

    /// Take the network away until [`FakeLink::restore`].
    pub fn drop_link(&self) {
        self.available.send_replace(false);
        self.up.send_replace(false);
    }

    pub fn restore(&self) {
        self.available.send_replace(true);
    }
}

#[async_trait]
impl LinkDriver for FakeLink {
    async fn associate(&self, _ssid: &str, _pass: &str) -> Result<(), LinkError> {
        let _guard = self.gauge.enter();
        let mut available = self.available.subscribe();
        let _ = available.wait_for(|a| *a).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.up.send_replace(true);
        Ok(())
    }

    async fn wait_lost(&self) {
        let mut up = self.up.subscribe();
        let _ = up.wait_for(|u| !*u).await;
    }
}

pub struct FakeTransport {
    pub gauge: Gauge,
    pub fail_remaining: AtomicUsize,
    pub disconnects: AtomicUsize,
    open: watch::Sender<bool>,
    pub double_open: AtomicBool,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self {
            gauge: Gauge::default(),
            fail_remaining: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            open: watch::channel(false).0,
            double_open: AtomicBool::new(false),
        }
    }
}

impl FakeTransport {
    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }
}

#[async_trait]
impl SecureTransport for FakeTransport {
    async fn connect(
        &self,
        endpoint: &str,
        credentials: &DeviceCredentials,
    ) -> Result<(), ConnError> {
        let _guard = self.gauge.enter();
        assert_eq!(endpoint, "broker.test:8883");
        assert!(credentials.certificate_pem.contains("BEGIN CERTIFICATE"));
        tokio::time::sleep(Duration::from_millis(2)).await;

        if consume(&self.fail_remaining) {
            return Err(ConnError::Tls("handshake failed".into()));
        }
        if self.open.send_replace(true) {
            self.double_open.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.open.send_replace(false);
    }
}

pub struct FakeMessaging {
    pub gauge: Gauge,
    transport: Arc<FakeTransport>,
    pub reject_remaining: AtomicUsize,
    fault: watch::Sender<Option<ConnError>>,
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
    pub publish_fault: Mutex<Option<PubError>>,
    pub maintains: AtomicUsize,
}

impl FakeMessaging {
    fn new(transport: Arc<FakeTransport>) -> Self {
        Self {
            gauge: Gauge::default(),
            transport,
            reject_remaining: AtomicUsize::new(0),
            fault: watch::channel(None).0,
            published: Mutex::new(Vec::new()),
            publish_fault: Mutex::new(None),
            maintains: AtomicUsize::new(0),
        }
    }

    /// End the current session with `err`.
    pub fn kill(&self, err: ConnError) {
        self.fault.send_replace(Some(err));
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessagingSession for FakeMessaging {
    async fn connect(&self, client_id: &DeviceId) -> Result<(), ConnError> {
        let _guard = self.gauge.enter();
        assert_eq!(client_id.as_str(), "7CDFA1B3926C-A1B2");
        tokio::time::sleep(Duration::from_millis(2)).await;

        if !self.transport.is_open() {
            return Err(ConnError::TransportDown("no secure transport".into()));
        }
        if consume(&self.reject_remaining) {
            return Err(ConnError::AuthRejected(5));
        }
        self.fault.send_replace(None);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PubError> {
        if let Some(err) = self.publish_fault.lock().unwrap().take() {
            return Err(err);
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    /// Ends on [`FakeMessaging::kill`], or with `Superseded` once the
    /// transport under the session is closed.
    async fn maintain(&self) -> ConnError {
        self.maintains.fetch_add(1, Ordering::SeqCst);
        let mut fault = self.fault.subscribe();
        let mut open = self.transport.open.subscribe();
        tokio::select! {
            f = fault.wait_for(|f| f.is_some()) => {
                f.ok().and_then(|f| (*f).clone()).unwrap_or(ConnError::Superseded)
            }
            _ = open.wait_for(|o| !*o) => ConnError::Superseded,
        }
    }
}

/// Claim service that issues a certificate for whatever CN the CSR names.
#[derive(Default)]
pub struct FakeClaim {
    pub inits: AtomicUsize,
    pub gauge: Gauge,
    pub fail: AtomicBool,
}

#[async_trait]
impl ClaimTransport for FakeClaim {
    async fn post(&self, path: &str, buffer: &mut ScratchBuffer) -> Result<u16, EnrollError> {
        let _guard = self.gauge.enter();
        if self.fail.load(Ordering::SeqCst) {
            return Err(EnrollError::Network("claim service unreachable".into()));
        }
        let body: serde_json::Value = serde_json::from_slice(buffer.as_bytes()).unwrap();
        let reply = match path {
            INIT_PATH => {
                self.inits.fetch_add(1, Ordering::SeqCst);
                serde_json::json!({ "auth_id": "auth-1", "challenge": "deadbeef" })
            }
            VERIFY_PATH => {
                let csr = body["csr"].as_str().unwrap();
                let (_, pem) = x509_parser::pem::parse_x509_pem(csr.as_bytes()).unwrap();
                let (_, req) = X509CertificationRequest::from_der(&pem.contents).unwrap();
                let cn = req
                    .certification_request_info
                    .subject
                    .iter_common_name()
                    .next()
                    .and_then(|cn| cn.as_str().ok())
                    .unwrap()
                    .to_string();
                serde_json::json!({ "certificate": certificate_pem_for(&cn) })
            }
            other => panic!("unexpected path {other}"),
        };
        buffer.clear();
        buffer.extend(reply.to_string().as_bytes())?;
        Ok(200)
    }
}

pub struct Harness {
    pub ctx: Arc<AgentContext>,
    pub events: EventSet,
    pub store: Arc<MemoryStore>,
    pub link: Arc<FakeLink>,
    pub transport: Arc<FakeTransport>,
    pub messaging: Arc<FakeMessaging>,
    pub claim: Arc<FakeClaim>,
}

impl Harness {
    /// Provisioned device. With `enrolled`, a certificate and key are
    /// already persisted.
    pub async fn new(enrolled: bool, max_credential_attempts: u32) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.set_string(NS_PROVISION, KEY_WIFI_SSID, "home").await.unwrap();
        store.set_string(NS_PROVISION, KEY_WIFI_PASS, "secret").await.unwrap();
        store
            .set_string(NS_PROVISION, KEY_ENDPOINT, "broker.test:8883")
            .await
            .unwrap();
        if enrolled {
            store
                .set_string(NS_CLAIM, KEY_CERTIFICATE, &certificate_pem())
                .await
                .unwrap();
            store.set_string(NS_CLAIM, KEY_PRIVATE_KEY, "key").await.unwrap();
        }

        let link = Arc::new(FakeLink::new());
        let transport = Arc::new(FakeTransport::default());
        let messaging = Arc::new(FakeMessaging::new(Arc::clone(&transport)));
        let claim = Arc::new(FakeClaim::default());

        let ctx = Arc::new(AgentContext {
            identity: DeviceIdentity::derive(
                MacAddress::new([0x7c, 0xdf, 0xa1, 0xb3, 0x92, 0x6c]),
                [0xa1, 0xb2],
            ),
            store: store.clone(),
            claim: claim.clone(),
            hmac: Arc::new(StaticHmacKey::new(*b"0123456789abcdef")),
            link: link.clone(),
            transport: transport.clone(),
            messaging: messaging.clone(),
            claim_config: ClaimConfig {
                platform: "esp32s2".into(),
                ..ClaimConfig::default()
            },
            retry_delay: Duration::from_millis(1),
            announce_registration: false,
            credentials: ArcSwapOption::empty(),
        });

        Self {
            ctx,
            events: EventSet::new(max_credential_attempts),
            store,
            link,
            transport,
            messaging,
            claim,
        }
    }

    /// Bring up every layer below `layer` without running the supervisor,
    /// then mark `layer` as in flight.
    pub async fn acquiring(&self, layer: Layer) {
        let credentials = DeviceCredentials {
            certificate_pem: certificate_pem(),
            private_key_pem: "key".to_string().into(),
        };
        for below in Layer::ALL.into_iter().take_while(|l| *l != layer) {
            if below == Layer::Transport {
                self.transport.connect("broker.test:8883", &credentials).await.unwrap();
            }
            self.events.post(LayerEvent::Acquiring(below));
            assert!(self.events.establish(below));
        }
        self.ctx.credentials.store(Some(Arc::new(credentials)));
        self.events.post(LayerEvent::Acquiring(layer));
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(Arc::clone(&self.ctx), self.events.clone())
    }
}
