//! Host network link.
//!
//! Association is owned by the host's network manager. The driver only
//! observes the interface through sysfs: it reports the link `Up` once the
//! interface is operationally up and watches for it to drop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use tether_core::MacAddress;

use crate::orchestrator::{LinkDriver, LinkError};

pub const SYSFS_ROOT: &str = "/sys/class/net";

/// Hardware address of `interface`.
pub fn read_mac(sysfs_root: &Path, interface: &str) -> Result<MacAddress, LinkError> {
    let path = sysfs_root.join(interface).join("address");
    let text = std::fs::read_to_string(&path)
        .map_err(|e| LinkError::Interface(format!("{}: {e}", path.display())))?;
    MacAddress::parse(&text).map_err(|e| LinkError::Interface(format!("{}: {e}", path.display())))
}

/// Polls `operstate` of one interface.
#[derive(Debug, Clone)]
pub struct HostLink {
    operstate: PathBuf,
    interface: String,
    poll: Duration,
    associate_timeout: Duration,
}

impl HostLink {
    pub fn new(sysfs_root: impl AsRef<Path>, interface: impl Into<String>) -> Self {
        let interface = interface.into();
        Self {
            operstate: sysfs_root.as_ref().join(&interface).join("operstate"),
            interface,
            poll: Duration::from_millis(500),
            associate_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_poll(mut self, poll: Duration, associate_timeout: Duration) -> Self {
        self.poll = poll;
        self.associate_timeout = associate_timeout;
        self
    }

    async fn is_up(&self) -> bool {
        match tokio::fs::read_to_string(&self.operstate).await {
            Ok(state) => state.trim() == "up",
            Err(_) => false,
        }
    }
}

#[async_trait]
impl LinkDriver for HostLink {
    async fn associate(&self, ssid: &str, _pass: &str) -> Result<(), LinkError> {
        tracing::info!(interface = %self.interface, ssid = %ssid, "Waiting for association");

        let wait = async {
            while !self.is_up().await {
                tokio::time::sleep(self.poll).await;
            }
        };
        tokio::time::timeout(self.associate_timeout, wait)
            .await
            .map_err(|_| LinkError::Association(format!("{} did not come up", self.interface)))
    }

    async fn wait_lost(&self) {
        while self.is_up().await {
            tokio::time::sleep(self.poll).await;
        }
        tracing::warn!(interface = %self.interface, "Link lost");
    }
}
