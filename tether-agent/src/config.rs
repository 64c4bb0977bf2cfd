//! Agent configuration.
//!
//! Settings are resolved in order: command line / `TETHER_*` environment,
//! then the TOML config file, then built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use serde::Deserialize;

use tether_claim::buffer::DEFAULT_CAPACITY;
use tether_core::layer::DEFAULT_MAX_CREDENTIAL_ATTEMPTS;

/// Claim service used when none is configured.
pub const DEFAULT_CLAIM_URL: &str = "https://esp-claiming.rainmaker.espressif.com";

/// MQTT over TLS.
pub const DEFAULT_BROKER_PORT: u16 = 8883;

pub const DEFAULT_INTERFACE: &str = "wlan0";

pub const DEFAULT_THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

/// Options shared by every subcommand.
#[derive(Debug, Clone, Default, Args)]
pub struct CommonArgs {
    /// Directory holding the credential database and default key files
    #[arg(long, env = "TETHER_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// TOML config file (default: <data-dir>/agent.toml)
    #[arg(long, env = "TETHER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Network interface whose hardware address identifies the device
    #[arg(long, env = "TETHER_INTERFACE", global = true)]
    pub interface: Option<String>,

    /// Claim service base URL
    #[arg(long, env = "TETHER_CLAIM_URL", global = true)]
    pub claim_url: Option<String>,

    /// Root CA (PEM) pinned for the claim service
    #[arg(long, env = "TETHER_CLAIM_CA", global = true)]
    pub claim_ca: Option<PathBuf>,

    /// Root CA (PEM) for the broker
    #[arg(long, env = "TETHER_BROKER_CA", global = true)]
    pub broker_ca: Option<PathBuf>,

    /// Broker TLS port
    #[arg(long, env = "TETHER_BROKER_PORT", global = true)]
    pub broker_port: Option<u16>,

    /// Platform string reported to the claim service
    #[arg(long, env = "TETHER_PLATFORM", global = true)]
    pub platform: Option<String>,

    /// File holding the 16-byte device secret (raw or hex)
    #[arg(long, env = "TETHER_HMAC_KEY_FILE", global = true)]
    pub hmac_key_file: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "TETHER_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,
}

/// Contents of `agent.toml`. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub interface: Option<String>,
    pub claim_url: Option<String>,
    pub claim_ca: Option<PathBuf>,
    pub broker_ca: Option<PathBuf>,
    pub broker_port: Option<u16>,
    pub platform: Option<String>,
    pub hmac_key_file: Option<PathBuf>,
    pub log_level: Option<String>,
    pub telemetry_interval_secs: Option<u64>,
    pub keep_alive_secs: Option<u16>,
    pub connack_timeout_ms: Option<u64>,
    pub tls_timeout_secs: Option<u64>,
    pub retry_delay_ms: Option<u64>,
    pub max_credential_attempts: Option<u32>,
    pub buffer_capacity: Option<usize>,
    pub sensor: SensorFileConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SensorFileConfig {
    pub path: Option<PathBuf>,
    pub factor: Option<f64>,
    pub offset: Option<f64>,
}

/// Thermal-zone reading and its linear calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSettings {
    pub path: PathBuf,
    /// `celsius = factor * raw - offset`
    pub factor: f64,
    pub offset: f64,
}

/// Fully resolved agent settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub interface: String,
    pub claim_url: String,
    pub claim_ca: Option<PathBuf>,
    pub broker_ca: PathBuf,
    pub broker_port: u16,
    pub platform: String,
    pub hmac_key_file: PathBuf,
    pub log_level: String,
    pub telemetry_interval: Duration,
    pub keep_alive: Duration,
    pub connack_timeout: Duration,
    pub tls_timeout: Duration,
    pub retry_delay: Duration,
    pub max_credential_attempts: u32,
    pub buffer_capacity: usize,
    pub sensor: SensorSettings,
}

impl Settings {
    /// Resolve settings from arguments and the config file.
    pub fn resolve(args: &CommonArgs) -> Result<Self> {
        let data_dir = match &args.data_dir {
            Some(dir) => dir.clone(),
            None => default_data_dir(),
        };

        let file = match &args.config {
            Some(path) => load_file(path)?,
            None => {
                let path = data_dir.join("agent.toml");
                if path.exists() {
                    load_file(&path)?
                } else {
                    FileConfig::default()
                }
            }
        };

        Ok(Self::merge(data_dir, args, file))
    }

    fn merge(data_dir: PathBuf, args: &CommonArgs, file: FileConfig) -> Self {
        let pick = |cli: &Option<String>, file: Option<String>, default: &str| {
            cli.clone().or(file).unwrap_or_else(|| default.to_string())
        };

        Self {
            interface: pick(&args.interface, file.interface, DEFAULT_INTERFACE),
            claim_url: pick(&args.claim_url, file.claim_url, DEFAULT_CLAIM_URL),
            claim_ca: args.claim_ca.clone().or(file.claim_ca),
            broker_ca: args
                .broker_ca
                .clone()
                .or(file.broker_ca)
                .unwrap_or_else(|| data_dir.join("broker-ca.pem")),
            broker_port: args.broker_port.or(file.broker_port).unwrap_or(DEFAULT_BROKER_PORT),
            platform: pick(&args.platform, file.platform, std::env::consts::ARCH),
            hmac_key_file: args
                .hmac_key_file
                .clone()
                .or(file.hmac_key_file)
                .unwrap_or_else(|| data_dir.join("hmac_key")),
            log_level: pick(&args.log_level, file.log_level, "info"),
            telemetry_interval: Duration::from_secs(
                file.telemetry_interval_secs.unwrap_or(1).max(1),
            ),
            keep_alive: Duration::from_secs(u64::from(file.keep_alive_secs.unwrap_or(5).max(1))),
            connack_timeout: Duration::from_millis(file.connack_timeout_ms.unwrap_or(1000)),
            tls_timeout: Duration::from_secs(file.tls_timeout_secs.unwrap_or(10)),
            retry_delay: Duration::from_millis(file.retry_delay_ms.unwrap_or(1000)),
            max_credential_attempts: file
                .max_credential_attempts
                .unwrap_or(DEFAULT_MAX_CREDENTIAL_ATTEMPTS),
            buffer_capacity: file.buffer_capacity.unwrap_or(DEFAULT_CAPACITY),
            sensor: SensorSettings {
                path: file
                    .sensor
                    .path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_THERMAL_ZONE)),
                factor: file.sensor.factor.unwrap_or(0.001),
                offset: file.sensor.offset.unwrap_or(0.0),
            },
            data_dir,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("credentials.db")
    }
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("io", "tether", "tether-agent")
        .map(|d| d.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn load_file(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config at {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config at {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_in(dir: &Path) -> CommonArgs {
        CommonArgs {
            data_dir: Some(dir.to_path_buf()),
            ..CommonArgs::default()
        }
    }

    #[test]
    fn test_defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::resolve(&args_in(dir.path())).unwrap();

        assert_eq!(settings.claim_url, DEFAULT_CLAIM_URL);
        assert_eq!(settings.broker_port, 8883);
        assert_eq!(settings.broker_ca, dir.path().join("broker-ca.pem"));
        assert_eq!(settings.keep_alive, Duration::from_secs(5));
        assert_eq!(settings.connack_timeout, Duration::from_secs(1));
        assert_eq!(settings.max_credential_attempts, 5);
        assert_eq!(settings.buffer_capacity, 4096);
        assert_eq!(settings.platform, std::env::consts::ARCH);
        assert_eq!(settings.db_path(), dir.path().join("credentials.db"));
    }

    #[test]
    fn test_file_in_data_dir_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("agent.toml"),
            r#"
            broker_port = 1883
            platform = "esp32s2"
            keep_alive_secs = 30

            [sensor]
            factor = 0.5
            offset = 10.0
            "#,
        )
        .unwrap();

        let settings = Settings::resolve(&args_in(dir.path())).unwrap();
        assert_eq!(settings.broker_port, 1883);
        assert_eq!(settings.platform, "esp32s2");
        assert_eq!(settings.keep_alive, Duration::from_secs(30));
        assert_eq!(settings.sensor.factor, 0.5);
        assert_eq!(settings.sensor.offset, 10.0);
    }

    #[test]
    fn test_arguments_override_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("agent.toml"), "platform = \"esp32s2\"\n").unwrap();

        let args = CommonArgs {
            platform: Some("esp32c3".into()),
            ..args_in(dir.path())
        };
        assert_eq!(Settings::resolve(&args).unwrap().platform, "esp32c3");
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("agent.toml"), "brokr_port = 1\n").unwrap();
        assert!(Settings::resolve(&args_in(dir.path())).is_err());
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let args = CommonArgs {
            config: Some(dir.path().join("absent.toml")),
            ..args_in(dir.path())
        };
        assert!(Settings::resolve(&args).is_err());
    }
}
