//! Tether Agent - device-side enrollment and broker connection
//!
//! Enrolls the device with the claim service on first boot, then keeps a
//! mutually authenticated MQTT session to the broker and publishes
//! temperature telemetry over it.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwapOption;
use clap::{Parser, Subcommand};
use rustls::RootCertStore;
use tracing_subscriber::EnvFilter;

use tether_claim::ClaimConfig;
use tether_core::store::{KEY_ENDPOINT, KEY_WIFI_PASS, KEY_WIFI_SSID, NS_PROVISION};
use tether_core::{CredentialStore, DeviceIdentity};

mod broker;
mod config;
mod db;
mod fuse;
mod http;
mod link;
mod mqtt;
mod orchestrator;
mod telemetry;
mod tls;

use broker::BrokerConnection;
use config::{CommonArgs, Settings};
use db::SqliteCredentialStore;
use fuse::FileHmacKey;
use http::HttpsClaimTransport;
use mqtt::{MqttOptions, DEFAULT_PACKET_CAPACITY};
use orchestrator::{AgentContext, EventSet, Orchestrator, SecureTransport};
use telemetry::{Publisher, ThermalZone};

// ============================================================================
// CLI Definition
// ============================================================================

/// Tether Agent - device enrollment and telemetry
#[derive(Parser)]
#[command(name = "tether-agent", version, about)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll if needed, connect to the broker and publish (default)
    Run,

    /// Print the device identifier
    Identity,

    /// Acquire credentials, print the registration blocks and exit
    Enroll,

    /// Store provisioning values in the credential store
    Provision {
        /// Network name
        #[arg(long)]
        ssid: Option<String>,

        /// Network passphrase
        #[arg(long, env = "TETHER_WIFI_PASS", hide_env_values = true)]
        pass: Option<String>,

        /// Broker host, optionally with :port
        #[arg(long)]
        endpoint: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let settings = Settings::resolve(&cli.common)?;

    // stdout is reserved for registration output.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.log_level)),
        )
        .init();

    match cli.command {
        Some(Commands::Identity) => cmd_identity(&settings).await,
        Some(Commands::Enroll) => cmd_enroll(&settings).await,
        Some(Commands::Provision {
            ssid,
            pass,
            endpoint,
        }) => cmd_provision(&settings, ssid, pass, endpoint).await,
        Some(Commands::Run) | None => cmd_run(&settings).await,
    }
}

// ============================================================================
// Startup
// ============================================================================

async fn open_store(settings: &Settings) -> Result<Arc<SqliteCredentialStore>> {
    let path = settings.db_path();
    let store = SqliteCredentialStore::open(&path)
        .await
        .with_context(|| format!("Failed to open credential store at {}", path.display()))?;
    Ok(Arc::new(store))
}

async fn load_identity(settings: &Settings, store: &dyn CredentialStore) -> Result<DeviceIdentity> {
    let mac = link::read_mac(Path::new(link::SYSFS_ROOT), &settings.interface)
        .with_context(|| format!("Failed to read hardware address of {}", settings.interface))?;
    DeviceIdentity::load_or_derive(store, mac)
        .await
        .context("Failed to load device identifier")
}

fn load_broker_roots(settings: &Settings) -> Result<RootCertStore> {
    let pem = std::fs::read(&settings.broker_ca)
        .with_context(|| format!("Failed to read broker CA at {}", settings.broker_ca.display()))?;
    Ok(tls::load_roots(&pem)?)
}

struct Agent {
    ctx: Arc<AgentContext>,
    broker: Arc<BrokerConnection>,
    events: EventSet,
}

async fn build_agent(settings: &Settings, roots: RootCertStore) -> Result<Agent> {
    let store = open_store(settings).await?;
    let identity = load_identity(settings, store.as_ref()).await?;
    tracing::info!(device_id = %identity.id, mac = %identity.mac.to_hex_upper(), "Device identity");

    let claim_ca = settings
        .claim_ca
        .as_ref()
        .map(|path| {
            std::fs::read(path)
                .with_context(|| format!("Failed to read claim CA at {}", path.display()))
        })
        .transpose()?;
    let claim =
        HttpsClaimTransport::new(&settings.claim_url, claim_ca.as_deref(), settings.tls_timeout)
            .context("Failed to build claim client")?;

    let broker = Arc::new(BrokerConnection::new(
        roots,
        settings.broker_port,
        settings.tls_timeout,
        MqttOptions {
            keep_alive: settings.keep_alive,
            connack_timeout: settings.connack_timeout,
            packet_capacity: DEFAULT_PACKET_CAPACITY,
        },
    ));

    let ctx = Arc::new(AgentContext {
        identity,
        store,
        claim: Arc::new(claim),
        hmac: Arc::new(FileHmacKey::new(&settings.hmac_key_file)),
        link: Arc::new(link::HostLink::new(link::SYSFS_ROOT, settings.interface.clone())),
        transport: broker.clone(),
        messaging: broker.clone(),
        claim_config: ClaimConfig {
            platform: settings.platform.clone(),
            buffer_capacity: settings.buffer_capacity,
        },
        retry_delay: settings.retry_delay,
        announce_registration: true,
        credentials: ArcSwapOption::empty(),
    });

    Ok(Agent {
        ctx,
        broker,
        events: EventSet::new(settings.max_credential_attempts),
    })
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_run(settings: &Settings) -> Result<()> {
    let roots = load_broker_roots(settings)?;
    let agent = build_agent(settings, roots).await?;

    let publisher = Publisher::new(
        agent.events.clone(),
        agent.broker.clone(),
        Arc::new(ThermalZone::new(&settings.sensor)),
        agent.ctx.identity.id.as_str(),
        settings.telemetry_interval,
    );
    let publishing = tokio::spawn(publisher.run());

    let orchestrator = Orchestrator::new(agent.ctx.clone(), agent.events.clone());
    let result = tokio::select! {
        result = orchestrator.run() => result.context("Connection orchestrator stopped"),
        _ = shutdown_signal() => Ok(()),
    };

    publishing.abort();
    agent.broker.disconnect().await;
    tracing::info!("Agent stopped");
    result
}

async fn cmd_enroll(settings: &Settings) -> Result<()> {
    // Transport is never needed here; a missing broker CA only fails those attempts.
    let roots = load_broker_roots(settings).unwrap_or_else(|e| {
        tracing::debug!(error = %e, "Broker CA unavailable");
        RootCertStore::empty()
    });
    let agent = build_agent(settings, roots).await?;

    let orchestrator = Orchestrator::new(agent.ctx.clone(), agent.events.clone());
    tokio::select! {
        result = orchestrator.run() => {
            result.context("Enrollment failed")?;
        }
        _ = agent.events.wait_for(|state| state.credentials_ready()) => {
            tracing::info!(device_id = %agent.ctx.identity.id, "Credentials ready");
        }
        _ = shutdown_signal() => {}
    }

    agent.broker.disconnect().await;
    Ok(())
}

async fn cmd_identity(settings: &Settings) -> Result<()> {
    let store = open_store(settings).await?;
    let identity = load_identity(settings, store.as_ref()).await?;
    println!("{}", identity.id);
    Ok(())
}

async fn cmd_provision(
    settings: &Settings,
    ssid: Option<String>,
    pass: Option<String>,
    endpoint: Option<String>,
) -> Result<()> {
    let values = [
        (KEY_WIFI_SSID, ssid),
        (KEY_WIFI_PASS, pass),
        (KEY_ENDPOINT, endpoint),
    ];
    if values.iter().all(|(_, value)| value.is_none()) {
        bail!("Nothing to provision; pass --ssid, --pass or --endpoint");
    }

    let store = open_store(settings).await?;
    for (key, value) in values {
        if let Some(value) = value {
            store
                .set_string(NS_PROVISION, key, &value)
                .await
                .with_context(|| format!("Failed to store {NS_PROVISION}/{key}"))?;
            tracing::info!(key = %key, "Provisioned");
        }
    }
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
