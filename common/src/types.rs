use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WifiMode {
    #[serde(rename = "STA")]
    Station,
    #[serde(rename = "AP")]
    AccessPoint,
}

impl WifiMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Station => "STA",
            Self::AccessPoint => "AP",
        }
    }
}

/// Snapshot of the radio identity owned by the WiFi manager.
///
/// `mode == None` only before the first transition has completed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectivityState {
    pub mode: Option<WifiMode>,
    pub ssid: Option<String>,
    pub password: Option<String>,
    pub address: Option<Ipv4Addr>,
}

impl ConnectivityState {
    pub fn mode_str(&self) -> &'static str {
        self.mode.map_or("<unspecified>", WifiMode::as_str)
    }

    pub fn is_mode(&self, mode: WifiMode) -> bool {
        self.mode == Some(mode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMode {
    Open,
    Wep,
    WpaPsk,
    Wpa2Psk,
    WpaWpa2Psk,
}

impl AuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Wep => "WEP",
            Self::WpaPsk => "WPA-PSK",
            Self::Wpa2Psk => "WPA2-PSK",
            Self::WpaWpa2Psk => "WPA/WPA2-PSK",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub ssid: String,
    pub bssid: [u8; 6],
    pub channel: u8,
    pub rssi: i8,
    pub auth: AuthMode,
    pub hidden: bool,
}

impl ScanResult {
    pub fn bssid_str(&self) -> String {
        self.bssid
            .iter()
            .map(|octet| format!("{octet:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}
