use core::convert::TryInto;
use std::net::Ipv4Addr;

use anyhow::{anyhow, Context};
use embedded_svc::wifi::{
    AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    io::vfs::MountedEventfs,
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::EspError,
    wifi::EspWifi,
};
use log::{info, warn};
use webnode::{
    link::{Link, LinkError},
    store::ConfigStore,
    Supervisor,
};
use webnode_common::{
    config::{parse_kv, render_kv},
    AuthMode, ConfigMap, NodeConfig, ScanResult, WifiMode,
};

const NVS_NAMESPACE: &str = "webnode";
const NVS_WIFI_KEY: &str = "wifi_cfg";
const NVS_NODE_KEY: &str = "node_json";
const EVENTFD_SLOTS: usize = 5;
const AP_CHANNEL: u8 = 1;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    // tokio's reactor needs eventfd support from the VFS layer.
    let _eventfs = MountedEventfs::mount(EVENTFD_SLOTS)?;

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut config = store.load_node_config().unwrap_or_else(|err| {
        warn!("failed to load node config from NVS: {err:#}");
        NodeConfig::default()
    });
    config.sanitize();
    info!(
        "node `{}`, http port {}, discovery {}:{}",
        config.device_name, config.http.port, config.discovery.group, config.discovery.port
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;
    let link = EspLink::new(wifi);

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(Supervisor::new(config, link, store).run(std::future::pending()))
}

struct EspLink {
    wifi: EspWifi<'static>,
    station: bool,
    access_point: bool,
    client: ClientConfiguration,
    ap: AccessPointConfiguration,
}

impl EspLink {
    fn new(wifi: EspWifi<'static>) -> Self {
        Self {
            wifi,
            station: false,
            access_point: false,
            client: ClientConfiguration::default(),
            ap: AccessPointConfiguration::default(),
        }
    }

    fn apply(&mut self) -> Result<(), LinkError> {
        let configuration = match (self.station, self.access_point) {
            (true, true) => Configuration::Mixed(self.client.clone(), self.ap.clone()),
            (true, false) => Configuration::Client(self.client.clone()),
            (false, true) => Configuration::AccessPoint(self.ap.clone()),
            (false, false) => {
                if self.wifi.is_started().map_err(driver)? {
                    self.wifi.stop().map_err(driver)?;
                }
                return Ok(());
            }
        };
        self.wifi
            .set_configuration(&configuration)
            .map_err(driver)?;
        if !self.wifi.is_started().map_err(driver)? {
            self.wifi.start().map_err(driver)?;
        }
        Ok(())
    }
}

fn driver(err: EspError) -> LinkError {
    LinkError::Driver(err.to_string())
}

impl Link for EspLink {
    fn set_active(&mut self, interface: WifiMode, active: bool) -> Result<(), LinkError> {
        match interface {
            WifiMode::Station => self.station = active,
            WifiMode::AccessPoint => self.access_point = active,
        }
        self.apply()
    }

    fn configure_access_point(&mut self, ssid: &str, password: &str) -> Result<(), LinkError> {
        if !self.access_point {
            return Err(LinkError::Inactive(WifiMode::AccessPoint));
        }
        self.ap = AccessPointConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| LinkError::InvalidCredential("access point ssid too long"))?,
            password: password
                .try_into()
                .map_err(|_| LinkError::InvalidCredential("access point password too long"))?,
            auth_method: if password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            channel: AP_CHANNEL,
            ..Default::default()
        };
        self.apply()
    }

    fn connect(&mut self, ssid: &str, password: &str) -> Result<(), LinkError> {
        if !self.station {
            return Err(LinkError::Inactive(WifiMode::Station));
        }
        self.client = ClientConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| LinkError::InvalidCredential("wifi ssid too long"))?,
            password: password
                .try_into()
                .map_err(|_| LinkError::InvalidCredential("wifi password too long"))?,
            auth_method: if password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPAWPA2Personal
            },
            ..Default::default()
        };
        self.apply()?;
        self.wifi.connect().map_err(driver)
    }

    fn disconnect(&mut self) -> Result<(), LinkError> {
        self.wifi.disconnect().map_err(driver)
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }

    fn address(&self, interface: WifiMode) -> Option<Ipv4Addr> {
        let netif = match interface {
            WifiMode::Station => self.wifi.sta_netif(),
            WifiMode::AccessPoint => self.wifi.ap_netif(),
        };
        netif
            .get_ip_info()
            .ok()
            .map(|info| info.ip)
            .filter(|ip| !ip.is_unspecified())
    }

    fn scan(&mut self) -> Result<Vec<ScanResult>, LinkError> {
        let found = self.wifi.scan().map_err(driver)?;
        Ok(found
            .into_iter()
            .map(|ap| ScanResult {
                hidden: ap.ssid.is_empty(),
                ssid: ap.ssid.to_string(),
                bssid: ap.bssid,
                channel: ap.channel,
                rssi: ap.signal_strength,
                auth: auth_mode(ap.auth_method),
            })
            .collect())
    }
}

fn auth_mode(method: Option<AuthMethod>) -> AuthMode {
    match method {
        None | Some(AuthMethod::None) => AuthMode::Open,
        Some(AuthMethod::WEP) => AuthMode::Wep,
        Some(AuthMethod::WPA) => AuthMode::WpaPsk,
        Some(AuthMethod::WPAWPA2Personal) => AuthMode::WpaWpa2Psk,
        Some(_) => AuthMode::Wpa2Psk,
    }
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

impl NvsStore {
    fn load_node_config(&self) -> anyhow::Result<NodeConfig> {
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 1024];
        match nvs.get_str(NVS_NODE_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<NodeConfig>(value)?),
            None => Ok(NodeConfig::default()),
        }
    }
}

impl ConfigStore for NvsStore {
    async fn load(&self) -> anyhow::Result<ConfigMap> {
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 256];
        match nvs.get_str(NVS_WIFI_KEY, &mut buffer)? {
            Some(value) => Ok(parse_kv(value)?),
            None => Err(anyhow!("no wifi config in NVS")),
        }
    }

    async fn save(&self, map: &ConfigMap) -> anyhow::Result<()> {
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        nvs.set_str(NVS_WIFI_KEY, &render_kv(map))?;
        Ok(())
    }
}
