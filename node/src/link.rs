//! Link-layer radio interface and the host-side simulation of it.

use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use thiserror::Error;
use tokio::time::Instant;
use webnode_common::{AuthMode, ScanResult, WifiMode};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("{} interface is not active", .0.as_str())]
    Inactive(WifiMode),
    #[error("invalid credential: {0}")]
    InvalidCredential(&'static str),
    #[error("radio driver error: {0}")]
    Driver(String),
}

/// Radio control as exposed by the platform driver.
///
/// Connect and disconnect only issue the request; association is observed by
/// polling `is_connected`.
pub trait Link {
    fn set_active(&mut self, interface: WifiMode, active: bool) -> Result<(), LinkError>;
    fn configure_access_point(&mut self, ssid: &str, password: &str) -> Result<(), LinkError>;
    fn connect(&mut self, ssid: &str, password: &str) -> Result<(), LinkError>;
    fn disconnect(&mut self) -> Result<(), LinkError>;
    fn is_connected(&self) -> bool;
    fn address(&self, interface: WifiMode) -> Option<Ipv4Addr>;
    fn scan(&mut self) -> Result<Vec<ScanResult>, LinkError>;
}

pub const SIM_AP_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimNetwork {
    pub ssid: String,
    pub password: String,
    pub channel: u8,
    pub rssi: i8,
    pub address: Ipv4Addr,
}

impl SimNetwork {
    pub fn new(ssid: &str, password: &str) -> Self {
        Self {
            ssid: ssid.to_string(),
            password: password.to_string(),
            channel: 6,
            rssi: -55,
            address: Ipv4Addr::new(192, 168, 1, 50),
        }
    }
}

#[derive(Debug)]
struct Association {
    network: Option<usize>,
    ready_at: Instant,
}

#[derive(Debug, Default)]
struct SimRadio {
    networks: Vec<SimNetwork>,
    association_delay: Duration,
    station_active: bool,
    ap_active: bool,
    ap_ssid: Option<String>,
    association: Option<Association>,
    connect_requests: u32,
}

impl SimRadio {
    fn associated_network(&self) -> Option<&SimNetwork> {
        let association = self.association.as_ref()?;
        let index = association.network?;
        (Instant::now() >= association.ready_at).then(|| &self.networks[index])
    }
}

/// In-memory radio used by host builds and tests.
///
/// Clones share the same radio so a test can keep a handle after moving the
/// link into the WiFi manager.
#[derive(Debug, Clone, Default)]
pub struct SimLink {
    radio: Arc<Mutex<SimRadio>>,
}

impl SimLink {
    pub fn new(networks: Vec<SimNetwork>) -> Self {
        Self::with_association_delay(networks, Duration::from_millis(1_500))
    }

    pub fn with_association_delay(networks: Vec<SimNetwork>, delay: Duration) -> Self {
        Self {
            radio: Arc::new(Mutex::new(SimRadio {
                networks,
                association_delay: delay,
                ..SimRadio::default()
            })),
        }
    }

    fn radio(&self) -> MutexGuard<'_, SimRadio> {
        self.radio.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self, interface: WifiMode) -> bool {
        let radio = self.radio();
        match interface {
            WifiMode::Station => radio.station_active,
            WifiMode::AccessPoint => radio.ap_active,
        }
    }

    pub fn ap_ssid(&self) -> Option<String> {
        self.radio().ap_ssid.clone()
    }

    pub fn connect_requests(&self) -> u32 {
        self.radio().connect_requests
    }

    pub fn associated_ssid(&self) -> Option<String> {
        self.radio().associated_network().map(|network| network.ssid.clone())
    }
}

impl Link for SimLink {
    fn set_active(&mut self, interface: WifiMode, active: bool) -> Result<(), LinkError> {
        let mut radio = self.radio();
        match interface {
            WifiMode::Station => {
                radio.station_active = active;
                if !active {
                    radio.association = None;
                }
            }
            WifiMode::AccessPoint => {
                radio.ap_active = active;
                if !active {
                    radio.ap_ssid = None;
                }
            }
        }
        Ok(())
    }

    fn configure_access_point(&mut self, ssid: &str, password: &str) -> Result<(), LinkError> {
        let mut radio = self.radio();
        if !radio.ap_active {
            return Err(LinkError::Inactive(WifiMode::AccessPoint));
        }
        if ssid.is_empty() || ssid.len() > 32 {
            return Err(LinkError::InvalidCredential("ssid must be 1..=32 bytes"));
        }
        if !password.is_empty() && password.len() < 8 {
            return Err(LinkError::InvalidCredential("password shorter than 8 bytes"));
        }
        radio.ap_ssid = Some(ssid.to_string());
        Ok(())
    }

    fn connect(&mut self, ssid: &str, password: &str) -> Result<(), LinkError> {
        let mut radio = self.radio();
        if !radio.station_active {
            return Err(LinkError::Inactive(WifiMode::Station));
        }
        radio.connect_requests += 1;
        let network = radio
            .networks
            .iter()
            .position(|network| network.ssid == ssid && network.password == password);
        let ready_at = Instant::now() + radio.association_delay;
        radio.association = Some(Association { network, ready_at });
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), LinkError> {
        self.radio().association = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let radio = self.radio();
        radio.station_active && radio.associated_network().is_some()
    }

    fn address(&self, interface: WifiMode) -> Option<Ipv4Addr> {
        let radio = self.radio();
        match interface {
            WifiMode::Station => radio.associated_network().map(|network| network.address),
            WifiMode::AccessPoint => radio.ap_active.then_some(SIM_AP_ADDRESS),
        }
    }

    fn scan(&mut self) -> Result<Vec<ScanResult>, LinkError> {
        let radio = self.radio();
        Ok(radio
            .networks
            .iter()
            .enumerate()
            .map(|(index, network)| ScanResult {
                ssid: network.ssid.clone(),
                bssid: [0x02, 0x00, 0x00, 0x00, 0x00, index as u8],
                channel: network.channel,
                rssi: network.rssi,
                auth: if network.password.is_empty() {
                    AuthMode::Open
                } else {
                    AuthMode::Wpa2Psk
                },
                hidden: false,
            })
            .collect())
    }
}
