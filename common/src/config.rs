use std::{collections::BTreeMap, net::Ipv4Addr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{discovery, types::WifiMode};

pub const KEY_MODE: &str = "mode";
pub const KEY_SSID: &str = "ssid";
pub const KEY_PASS: &str = "pass";

pub const DEFAULT_DEVICE_NAME: &str = "webnode";
pub const DEFAULT_AP_SSID: &str = "WebNode-Setup";
pub const DEFAULT_AP_PASSWORD: &str = "webnode1234";

/// Flat mapping as handed to and from the config store.
pub type ConfigMap = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing key `{0}`")]
    MissingKey(&'static str),
    #[error("invalid mode `{0}`")]
    InvalidMode(String),
    #[error("line {line} is not key=value")]
    MalformedLine { line: usize },
}

/// Persisted WiFi designation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiConfig {
    AccessPoint,
    Station { ssid: String, password: String },
}

impl WifiConfig {
    pub fn mode(&self) -> WifiMode {
        match self {
            Self::AccessPoint => WifiMode::AccessPoint,
            Self::Station { .. } => WifiMode::Station,
        }
    }

    pub fn to_map(&self) -> ConfigMap {
        let mut map = ConfigMap::new();
        map.insert(KEY_MODE.to_string(), self.mode().as_str().to_string());
        if let Self::Station { ssid, password } = self {
            map.insert(KEY_SSID.to_string(), ssid.clone());
            map.insert(KEY_PASS.to_string(), password.clone());
        }
        map
    }

    pub fn from_map(map: &ConfigMap) -> Result<Self, ConfigError> {
        let mode = map.get(KEY_MODE).ok_or(ConfigError::MissingKey(KEY_MODE))?;
        match parse_mode(mode)? {
            WifiMode::AccessPoint => Ok(Self::AccessPoint),
            WifiMode::Station => {
                let ssid = map.get(KEY_SSID).ok_or(ConfigError::MissingKey(KEY_SSID))?;
                let password = map.get(KEY_PASS).ok_or(ConfigError::MissingKey(KEY_PASS))?;
                Ok(Self::Station {
                    ssid: ssid.clone(),
                    password: password.clone(),
                })
            }
        }
    }
}

/// Accepts the current `STA`/`AP` spelling and the older numeric one.
fn parse_mode(raw: &str) -> Result<WifiMode, ConfigError> {
    match raw.trim() {
        "STA" | "sta" | "0" => Ok(WifiMode::Station),
        "AP" | "ap" | "1" => Ok(WifiMode::AccessPoint),
        other => Err(ConfigError::InvalidMode(other.to_string())),
    }
}

pub fn parse_kv(text: &str) -> Result<ConfigMap, ConfigError> {
    let mut map = ConfigMap::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or(ConfigError::MalformedLine { line: index + 1 })?;
        if key.is_empty() {
            return Err(ConfigError::MalformedLine { line: index + 1 });
        }
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

pub fn render_kv(map: &ConfigMap) -> String {
    map.iter()
        .map(|(key, value)| format!("{key}={value}\n"))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: Ipv4Addr,
    pub port: u16,
    pub backlog: u32,
    pub static_root: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: Ipv4Addr::UNSPECIFIED,
            port: 80,
            backlog: 5,
            static_root: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    /// Interface used for the group membership.
    pub interface: Ipv4Addr,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: discovery::DEFAULT_GROUP,
            port: discovery::DEFAULT_PORT,
            interface: Ipv4Addr::UNSPECIFIED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub ap_ssid: String,
    pub ap_password: String,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            ap_ssid: DEFAULT_AP_SSID.to_string(),
            ap_password: DEFAULT_AP_PASSWORD.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiTiming {
    pub poll_interval_ms: u64,
    pub max_tries: u32,
    pub settle_interval_ms: u64,
    pub link_error_backoff_ms: u64,
}

impl Default for WifiTiming {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_tries: 20,
            settle_interval_ms: 100,
            link_error_backoff_ms: 3_000,
        }
    }
}

impl WifiTiming {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }

    pub fn link_error_backoff(&self) -> Duration {
        Duration::from_millis(self.link_error_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub device_name: String,
    pub http: HttpConfig,
    pub discovery: DiscoveryConfig,
    pub provisioning: ProvisioningConfig,
    pub timing: WifiTiming,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            http: HttpConfig::default(),
            discovery: DiscoveryConfig::default(),
            provisioning: ProvisioningConfig::default(),
            timing: WifiTiming::default(),
        }
    }
}

impl NodeConfig {
    pub fn sanitize(&mut self) {
        self.device_name = self.device_name.trim().to_ascii_lowercase();
        if self.device_name.is_empty() || self.device_name.contains(' ') {
            self.device_name = DEFAULT_DEVICE_NAME.to_string();
        }

        self.http.backlog = self.http.backlog.clamp(1, 64);

        if self.provisioning.ap_ssid.trim().is_empty() || self.provisioning.ap_ssid.len() > 32 {
            self.provisioning.ap_ssid = DEFAULT_AP_SSID.to_string();
        }
        // WPA2 passphrases are 8..=63 characters.
        if !(8..=63).contains(&self.provisioning.ap_password.len()) {
            self.provisioning.ap_password = DEFAULT_AP_PASSWORD.to_string();
        }

        self.timing.poll_interval_ms = self.timing.poll_interval_ms.clamp(1, 10_000);
        self.timing.settle_interval_ms = self.timing.settle_interval_ms.clamp(1, 10_000);
        self.timing.link_error_backoff_ms = self.timing.link_error_backoff_ms.clamp(1, 60_000);
        self.timing.max_tries = self.timing.max_tries.max(1);
    }
}
