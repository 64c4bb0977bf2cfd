//! Broker connection: one TLS stream slot carrying one MQTT session.
//!
//! The secure transport installs a freshly handshaken stream; the messaging
//! session consumes it with CONNECT. A slot never holds two live streams:
//! installing a new one tears down whatever was there first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::client::TlsStream;

use tether_core::DeviceId;

use crate::mqtt::{self, MqttOptions, Session};
use crate::orchestrator::{
    ConnError, DeviceCredentials, MessagingSession, PubError, SecureTransport,
};
use crate::tls;

struct Slot<S> {
    stream: Option<S>,
    session: Option<(u64, Arc<Session<S>>)>,
}

/// Holds at most one stream or one session built on it.
pub struct SessionSlot<S> {
    inner: Mutex<Slot<S>>,
    next_id: AtomicU64,
    opts: MqttOptions,
}

impl<S> SessionSlot<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(opts: MqttOptions) -> Self {
        Self {
            inner: Mutex::new(Slot {
                stream: None,
                session: None,
            }),
            next_id: AtomicU64::new(1),
            opts,
        }
    }

    /// Replace the slot contents with a new stream.
    pub async fn install(&self, stream: S) {
        let mut slot = self.inner.lock().await;
        if let Some((_, session)) = slot.session.take() {
            session.disconnect().await;
        }
        if slot.stream.replace(stream).is_some() {
            tracing::debug!("Dropped unused transport stream");
        }
    }

    /// Drop the session and the stream.
    pub async fn teardown(&self) {
        let mut slot = self.inner.lock().await;
        if let Some((_, session)) = slot.session.take() {
            session.disconnect().await;
        }
        slot.stream = None;
    }

    /// Run CONNECT over the installed stream.
    ///
    /// The stream is consumed either way. With no stream installed this is
    /// [`ConnError::TransportDown`].
    pub async fn open(&self, client_id: &DeviceId) -> Result<(), ConnError> {
        let mut slot = self.inner.lock().await;
        if let Some((_, old)) = slot.session.take() {
            old.disconnect().await;
        }
        let stream = slot
            .stream
            .take()
            .ok_or_else(|| ConnError::TransportDown("no secure transport".into()))?;

        let session = mqtt::connect(stream, client_id.as_str(), &self.opts).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        slot.session = Some((id, Arc::new(session)));
        Ok(())
    }

    async fn current(&self) -> Option<(u64, Arc<Session<S>>)> {
        let slot = self.inner.lock().await;
        slot.session.as_ref().map(|(id, s)| (*id, Arc::clone(s)))
    }

    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PubError> {
        let (_, session) = self.current().await.ok_or(PubError::NotConnected)?;
        session.publish(topic, payload).await
    }

    /// Keep the current session alive until it ends.
    pub async fn maintain(&self) -> ConnError {
        let Some((id, session)) = self.current().await else {
            return ConnError::Superseded;
        };
        let err = session.keep_alive().await;

        let mut slot = self.inner.lock().await;
        if !matches!(&slot.session, Some((current, _)) if *current == id) {
            return ConnError::Superseded;
        }
        slot.session = None;
        drop(slot);
        session.disconnect().await;
        err
    }
}

/// mTLS + MQTT connection to the broker.
pub struct BrokerConnection {
    roots: RootCertStore,
    port: u16,
    tls_timeout: Duration,
    slot: SessionSlot<TlsStream<TcpStream>>,
}

impl BrokerConnection {
    pub fn new(roots: RootCertStore, port: u16, tls_timeout: Duration, mqtt: MqttOptions) -> Self {
        Self {
            roots,
            port,
            tls_timeout,
            slot: SessionSlot::new(mqtt),
        }
    }
}

#[async_trait]
impl SecureTransport for BrokerConnection {
    async fn connect(
        &self,
        endpoint: &str,
        credentials: &DeviceCredentials,
    ) -> Result<(), ConnError> {
        let config = Arc::new(tls::client_config(self.roots.clone(), credentials)?);
        let (host, port) = tls::split_endpoint(endpoint, self.port);

        let stream = tls::connect(config, host, port, self.tls_timeout).await?;
        tracing::info!(host = %host, port = port, "Secure transport established");
        self.slot.install(stream).await;
        Ok(())
    }

    async fn disconnect(&self) {
        self.slot.teardown().await;
    }
}

#[async_trait]
impl MessagingSession for BrokerConnection {
    async fn connect(&self, client_id: &DeviceId) -> Result<(), ConnError> {
        self.slot.open(client_id).await
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PubError> {
        self.slot.publish(topic, payload).await
    }

    async fn maintain(&self) -> ConnError {
        self.slot.maintain().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn device() -> DeviceId {
        DeviceId::new("7CDFA1B3926C-A1B2").unwrap()
    }

    fn slot() -> SessionSlot<DuplexStream> {
        SessionSlot::new(MqttOptions {
            connack_timeout: Duration::from_millis(200),
            ..MqttOptions::default()
        })
    }

    /// Accept CONNECT, then hand the broker end back.
    fn broker(mut end: DuplexStream) -> tokio::task::JoinHandle<DuplexStream> {
        tokio::spawn(async move {
            mqtt::read_packet(&mut end, 1024).await.unwrap();
            end.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
            end
        })
    }

    #[tokio::test]
    async fn test_open_without_stream_is_transport_down() {
        let slot = slot();
        assert!(matches!(slot.open(&device()).await, Err(ConnError::TransportDown(_))));
        assert_eq!(slot.publish("t", b"x").await, Err(PubError::NotConnected));
    }

    #[tokio::test]
    async fn test_open_then_publish() {
        let slot = slot();
        let (client, server) = tokio::io::duplex(1024);
        let broker = broker(server);

        slot.install(client).await;
        slot.open(&device()).await.unwrap();
        let mut server = broker.await.unwrap();

        slot.publish("topic", b"payload").await.unwrap();
        let (header, _) = mqtt::read_packet(&mut server, 1024).await.unwrap();
        assert_eq!(header, 0x30);
    }

    #[tokio::test]
    async fn test_stream_is_consumed_by_session() {
        let slot = slot();
        let (client, server) = tokio::io::duplex(1024);
        let broker = broker(server);

        slot.install(client).await;
        slot.open(&device()).await.unwrap();
        let _server = broker.await.unwrap();

        // Reconnecting messaging alone needs a new transport.
        assert!(matches!(slot.open(&device()).await, Err(ConnError::TransportDown(_))));
    }

    #[tokio::test]
    async fn test_install_replaces_previous_stream() {
        let slot = slot();
        let (first, mut first_peer) = tokio::io::duplex(64);
        let (second, _second_peer) = tokio::io::duplex(64);

        slot.install(first).await;
        slot.install(second).await;

        let mut buf = [0u8; 1];
        assert_eq!(first_peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_teardown_supersedes_maintain() {
        let slot = Arc::new(slot());
        let (client, server) = tokio::io::duplex(1024);
        let broker = broker(server);
        slot.install(client).await;
        slot.open(&device()).await.unwrap();
        let _server = broker.await.unwrap();

        let maintaining = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move { slot.maintain().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        slot.teardown().await;

        let err = tokio::time::timeout(Duration::from_secs(2), maintaining)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(err, ConnError::Superseded);
    }

    #[tokio::test]
    async fn test_broker_close_reports_transport_down() {
        let slot = slot();
        let (client, server) = tokio::io::duplex(1024);
        let broker = broker(server);
        slot.install(client).await;
        slot.open(&device()).await.unwrap();
        drop(broker.await.unwrap());

        let err = tokio::time::timeout(Duration::from_secs(2), slot.maintain())
            .await
            .unwrap();
        assert!(matches!(err, ConnError::TransportDown(_)));
        assert_eq!(slot.publish("t", b"x").await, Err(PubError::NotConnected));
    }
}
