//! Persistent configuration stored at `~/.sigbridge/config.toml`.
//!
//! Environment variables override individual file values:
//!
//! | Variable | Field |
//! |---|---|
//! | `SIGBRIDGE_BROKER_HOST` | `broker_host` |
//! | `SIGBRIDGE_BROKER_PORT` | `broker_port` |
//! | `SIGBRIDGE_CLIENT_ID` | `client_id` |
//! | `SIGBRIDGE_DEVICE_NAME` | `device_name` |
//! | `SIGBRIDGE_POLL_INTERVAL_MS` | `poll_interval_ms` |
//! | `SIGBRIDGE_RPC_TIMEOUT_MS` | `rpc_timeout_ms` |
//! | `SIGBRIDGE_PRESENCE_TIMEOUT_MS` | `presence_timeout_ms` |
//! | `SIGBRIDGE_KEEP_ALIVE_SECS` | `keep_alive_secs` |
//!
//! Numeric overrides that fail to parse are ignored.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sigbridge_middleware::MqttSettings;
use sigbridge_runtime::{MonitorConfig, ProxyOptions};
use sigbridge_types::BridgeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_broker_host")]
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// 0 waits forever.
    #[serde(default)]
    pub rpc_timeout_ms: u64,
    /// 0 waits forever.
    #[serde(default)]
    pub presence_timeout_ms: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "sigbridge".to_string()
}

fn default_device_name() -> String {
    "dropbot".to_string()
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_keep_alive_secs() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_host: default_broker_host(),
            broker_port: default_broker_port(),
            client_id: default_client_id(),
            device_name: default_device_name(),
            poll_interval_ms: default_poll_interval_ms(),
            rpc_timeout_ms: 0,
            presence_timeout_ms: 0,
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

fn optional_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl Config {
    /// MQTT settings with `role` appended to the client id, so a monitor
    /// and a one-shot client can share a broker.
    pub fn mqtt_settings(&self, role: &str) -> MqttSettings {
        MqttSettings {
            host: self.broker_host.clone(),
            port: self.broker_port,
            client_id: format!("{}-{role}", self.client_id),
            keep_alive_secs: self.keep_alive_secs,
            ..MqttSettings::default()
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            device_name: self.device_name.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            rpc_timeout: optional_millis(self.rpc_timeout_ms),
        }
    }

    pub fn proxy_options(&self) -> ProxyOptions {
        ProxyOptions {
            presence_timeout: optional_millis(self.presence_timeout_ms),
            rpc_timeout: optional_millis(self.rpc_timeout_ms),
        }
    }
}

/// Path to the configuration file: `~/.sigbridge/config.toml`.
pub fn config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    config_path_for_home(Path::new(&home))
}

pub fn config_path_for_home(home: &Path) -> PathBuf {
    home.join(".sigbridge").join("config.toml")
}

/// Load the configuration from the default path.  A missing file yields the
/// defaults; overrides apply either way.
pub fn load() -> Result<Config, BridgeError> {
    load_from(&config_path())
}

pub fn load_from(path: &Path) -> Result<Config, BridgeError> {
    let mut config = if path.exists() {
        let raw = fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|e| BridgeError::Config(format!("failed to parse {}: {e}", path.display())))?
    } else {
        Config::default()
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(v) = std::env::var("SIGBRIDGE_BROKER_HOST") {
        config.broker_host = v;
    }
    if let Ok(v) = std::env::var("SIGBRIDGE_BROKER_PORT")
        && let Ok(n) = v.parse()
    {
        config.broker_port = n;
    }
    if let Ok(v) = std::env::var("SIGBRIDGE_CLIENT_ID") {
        config.client_id = v;
    }
    if let Ok(v) = std::env::var("SIGBRIDGE_DEVICE_NAME") {
        config.device_name = v;
    }
    override_u64("SIGBRIDGE_POLL_INTERVAL_MS", &mut config.poll_interval_ms);
    override_u64("SIGBRIDGE_RPC_TIMEOUT_MS", &mut config.rpc_timeout_ms);
    override_u64("SIGBRIDGE_PRESENCE_TIMEOUT_MS", &mut config.presence_timeout_ms);
    override_u64("SIGBRIDGE_KEEP_ALIVE_SECS", &mut config.keep_alive_secs);
}

fn override_u64(var: &str, field: &mut u64) {
    if let Ok(v) = std::env::var(var)
        && let Ok(n) = v.parse()
    {
        *field = n;
    }
}

/// Write `config` to `path`, creating the parent directory if needed.
pub fn save_to(config: &Config, path: &Path) -> Result<(), BridgeError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| BridgeError::Config(format!("failed to create {}: {e}", dir.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
        }
    }
    let raw = toml::to_string_pretty(config)
        .map_err(|e| BridgeError::Config(format!("failed to serialise config: {e}")))?;
    fs::write(path, raw)
        .map_err(|e| BridgeError::Config(format!("failed to write {}: {e}", path.display())))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
    Ok(())
}
