//! Periodic temperature telemetry.
//!
//! The publisher never repairs a connection. A failed publish is posted as a
//! layer loss and the orchestrator takes it from there.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use tether_core::{Layer, LayerEvent};

use crate::config::SensorSettings;
use crate::orchestrator::{EventSet, MessagingSession, PubError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum SensorError {
    #[error("sensor read failed: {0}")]
    Read(String),

    #[error("unexpected sensor value {0:?}")]
    Parse(String),
}

#[async_trait]
pub trait Sensor: Send + Sync {
    async fn read_celsius(&self) -> Result<f64, SensorError>;
}

/// A sysfs thermal zone, calibrated as `celsius = factor * raw - offset`.
#[derive(Debug, Clone)]
pub struct ThermalZone {
    path: PathBuf,
    factor: f64,
    offset: f64,
}

impl ThermalZone {
    pub fn new(settings: &SensorSettings) -> Self {
        Self {
            path: settings.path.clone(),
            factor: settings.factor,
            offset: settings.offset,
        }
    }
}

#[async_trait]
impl Sensor for ThermalZone {
    async fn read_celsius(&self) -> Result<f64, SensorError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SensorError::Read(format!("{}: {e}", self.path.display())))?;
        let raw: f64 = text
            .trim()
            .parse()
            .map_err(|_| SensorError::Parse(text.trim().to_string()))?;
        Ok(self.factor * raw - self.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Graph {
    unit: String,
    value: f64,
}

/// `{"<name>": {"unit": "<unit>", "value": <number>}, ...}` in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphJson {
    graphs: Vec<(String, Graph)>,
}

impl GraphJson {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn graph(mut self, name: impl Into<String>, unit: impl Into<String>, value: f64) -> Self {
        self.graphs.push((
            name.into(),
            Graph {
                unit: unit.into(),
                value,
            },
        ));
        self
    }

    pub fn to_json(&self) -> String {
        // Map keys are strings and values are plain structs.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Serialize for GraphJson {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.graphs.len()))?;
        for (name, graph) in &self.graphs {
            map.serialize_entry(name, graph)?;
        }
        map.end()
    }
}

pub fn temperature_payload(celsius: f64) -> String {
    GraphJson::new().graph("Temperature", "C", celsius).to_json()
}

pub struct Publisher {
    events: EventSet,
    messaging: Arc<dyn MessagingSession>,
    sensor: Arc<dyn Sensor>,
    topic: String,
    interval: Duration,
}

impl Publisher {
    pub fn new(
        events: EventSet,
        messaging: Arc<dyn MessagingSession>,
        sensor: Arc<dyn Sensor>,
        topic: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            events,
            messaging,
            sensor,
            topic: topic.into(),
            interval,
        }
    }

    /// Sample and publish forever.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.events.wait_for(|state| state.messaging_up()).await;
            self.publish_once().await;
        }
    }

    /// Read the sensor and publish one sample. Returns whether it was sent.
    pub async fn publish_once(&self) -> bool {
        let celsius = match self.sensor.read_celsius().await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping sample");
                return false;
            }
        };

        let payload = temperature_payload(celsius);
        match self.messaging.publish(&self.topic, payload.as_bytes()).await {
            Ok(()) => {
                tracing::info!(topic = %self.topic, celsius = celsius, "Published telemetry");
                true
            }
            Err(e @ PubError::TransportDown(_)) => {
                tracing::warn!(error = %e, "Publish failed");
                self.events.post(LayerEvent::Lost(Layer::Transport));
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Publish failed");
                self.events.post(LayerEvent::Lost(Layer::Messaging));
                false
            }
        }
    }
}
