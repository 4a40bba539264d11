//! Owner of the radio: station/AP transitions, persistence and the published
//! connectivity snapshot.

use std::net::Ipv4Addr;

use tokio::sync::watch;
use tracing::{debug, info, trace, warn};
use webnode_common::{
    config::ProvisioningConfig, ConnectivityState, ScanResult, WifiConfig, WifiMode, WifiTiming,
};

use crate::{
    link::{Link, LinkError},
    store::ConfigStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    /// The requested station could not be joined; the radio went back to the
    /// mode that was active before.
    Reverted(WifiMode),
}

/// Read-only view of the connectivity state for other tasks.
#[derive(Debug, Clone)]
pub struct ConnectivityHandle {
    rx: watch::Receiver<ConnectivityState>,
}

impl ConnectivityHandle {
    pub fn snapshot(&self) -> ConnectivityState {
        self.rx.borrow().clone()
    }

    pub fn mode(&self) -> Option<WifiMode> {
        self.rx.borrow().mode
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.rx.borrow().address
    }

}

impl From<watch::Receiver<ConnectivityState>> for ConnectivityHandle {
    fn from(rx: watch::Receiver<ConnectivityState>) -> Self {
        Self { rx }
    }
}

pub struct WifiManager<L, S> {
    link: L,
    store: S,
    provisioning: ProvisioningConfig,
    timing: WifiTiming,
    state: watch::Sender<ConnectivityState>,
}

impl<L, S> WifiManager<L, S>
where
    L: Link,
    S: ConfigStore,
{
    pub fn new(link: L, store: S, provisioning: ProvisioningConfig, timing: WifiTiming) -> Self {
        let (state, _) = watch::channel(ConnectivityState::default());
        Self {
            link,
            store,
            provisioning,
            timing,
            state,
        }
    }

    pub fn handle(&self) -> ConnectivityHandle {
        ConnectivityHandle {
            rx: self.state.subscribe(),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state.borrow().clone()
    }

    /// Brings the radio up from the stored designation, or starts the
    /// provisioning access point when nothing usable is stored.
    pub async fn start(&mut self) -> Result<(), LinkError> {
        let stored = match self.store.load().await {
            Ok(map) => WifiConfig::from_map(&map).map_err(anyhow::Error::from),
            Err(err) => Err(err),
        };
        match stored {
            Ok(WifiConfig::Station { ssid, password }) => {
                info!("starting in STA mode for `{ssid}`");
                self.connect(&ssid, &password, false).await.map(|_| ())
            }
            Ok(WifiConfig::AccessPoint) => {
                info!("starting in AP mode");
                self.start_access_point().await
            }
            Err(err) => {
                info!("no usable wifi config ({err:#}); starting AP mode");
                self.start_access_point().await
            }
        }
    }

    pub async fn apply(&mut self, config: WifiConfig) -> Result<ConnectOutcome, LinkError> {
        match config {
            WifiConfig::AccessPoint => {
                self.start_access_point().await?;
                Ok(ConnectOutcome::Connected)
            }
            WifiConfig::Station { ssid, password } => self.connect(&ssid, &password, true).await,
        }
    }

    /// Joins `ssid`.
    ///
    /// With `persist_on_success` the attempt is bounded by the configured
    /// number of polls; success is saved and failure reverts to the previous
    /// mode. Without it the attempt retries until associated and nothing is
    /// saved, which is how a stored designation is restored at boot.
    pub async fn connect(
        &mut self,
        ssid: &str,
        password: &str,
        persist_on_success: bool,
    ) -> Result<ConnectOutcome, LinkError> {
        info!("connecting to `{ssid}`");
        if persist_on_success {
            let associated = match self
                .associate(ssid, password, Some(self.timing.max_tries))
                .await
            {
                Ok(associated) => associated,
                Err(err) => {
                    warn!("station bring-up for `{ssid}` failed: {err}");
                    false
                }
            };
            if !associated {
                warn!(
                    "could not join `{ssid}`; reverting to {}",
                    self.state.borrow().mode_str()
                );
                let mode = self.revert().await?;
                return Ok(ConnectOutcome::Reverted(mode));
            }
            self.record(WifiMode::Station, ssid, password);
            self.persist(&WifiConfig::Station {
                ssid: ssid.to_string(),
                password: password.to_string(),
            })
            .await;
        } else {
            self.associate_until_connected(ssid, password).await;
            self.record(WifiMode::Station, ssid, password);
        }

        info!(
            "connected to `{ssid}`, ip={}",
            self.state.borrow().address.unwrap_or(Ipv4Addr::UNSPECIFIED)
        );
        Ok(ConnectOutcome::Connected)
    }

    pub async fn start_access_point(&mut self) -> Result<(), LinkError> {
        self.link.set_active(WifiMode::Station, false)?;
        self.link.set_active(WifiMode::AccessPoint, true)?;
        let ProvisioningConfig {
            ap_ssid,
            ap_password,
        } = self.provisioning.clone();
        self.link.configure_access_point(&ap_ssid, &ap_password)?;
        self.record(WifiMode::AccessPoint, &ap_ssid, &ap_password);
        info!(
            "access point `{ap_ssid}` up, ip={}",
            self.state.borrow().address.unwrap_or(Ipv4Addr::UNSPECIFIED)
        );
        self.persist(&WifiConfig::AccessPoint).await;
        Ok(())
    }

    pub fn scan(&mut self) -> Result<Vec<ScanResult>, LinkError> {
        let results = self.link.scan()?;
        debug!("scan found {} networks", results.len());
        Ok(results)
    }

    async fn revert(&mut self) -> Result<WifiMode, LinkError> {
        let previous = self.state();
        match (previous.mode, previous.ssid, previous.password) {
            (Some(WifiMode::Station), Some(ssid), Some(password)) => {
                self.associate_until_connected(&ssid, &password).await;
                self.record(WifiMode::Station, &ssid, &password);
                Ok(WifiMode::Station)
            }
            _ => {
                self.start_access_point().await?;
                Ok(WifiMode::AccessPoint)
            }
        }
    }

    async fn associate_until_connected(&mut self, ssid: &str, password: &str) {
        loop {
            match self.associate(ssid, password, None).await {
                Ok(true) => return,
                Ok(false) => {}
                Err(err) => {
                    warn!("station bring-up for `{ssid}` failed: {err}; retrying");
                    tokio::time::sleep(self.timing.link_error_backoff()).await;
                }
            }
        }
    }

    /// Switches to station mode and waits for association. `max_tries` bounds
    /// the number of polls; `None` keeps going and re-issues the connect
    /// request every `timing.max_tries` polls.
    async fn associate(
        &mut self,
        ssid: &str,
        password: &str,
        max_tries: Option<u32>,
    ) -> Result<bool, LinkError> {
        self.link.set_active(WifiMode::AccessPoint, false)?;
        self.link.set_active(WifiMode::Station, true)?;

        if self.link.is_connected() {
            debug!("dropping current association");
            self.link.disconnect()?;
            while self.link.is_connected() {
                tokio::time::sleep(self.timing.settle_interval()).await;
            }
        }

        let exhausted = |tries: u32| max_tries.is_some_and(|max| tries >= max);
        let mut tries = 0u32;
        let mut requested = false;
        loop {
            if !requested {
                match self.link.connect(ssid, password) {
                    Ok(()) => requested = true,
                    Err(err) => {
                        warn!("connect request for `{ssid}` failed: {err}");
                        tries += 1;
                        if exhausted(tries) {
                            return Ok(false);
                        }
                        tokio::time::sleep(self.timing.link_error_backoff()).await;
                        continue;
                    }
                }
            }

            if self.link.is_connected() {
                return Ok(true);
            }
            if exhausted(tries) {
                return Ok(false);
            }
            tries += 1;
            trace!("waiting for `{ssid}`, try {tries}");
            tokio::time::sleep(self.timing.poll_interval()).await;

            if max_tries.is_none() && tries % self.timing.max_tries.max(1) == 0 {
                debug!("still not associated with `{ssid}` after {tries} polls; re-issuing connect");
                requested = false;
            }
        }
    }

    fn record(&mut self, mode: WifiMode, ssid: &str, password: &str) {
        let address = self.link.address(mode);
        self.state.send_replace(ConnectivityState {
            mode: Some(mode),
            ssid: Some(ssid.to_string()),
            password: Some(password.to_string()),
            address,
        });
    }

    async fn persist(&self, config: &WifiConfig) {
        match self.store.save(&config.to_map()).await {
            Ok(()) => debug!("saved {} config", config.mode().as_str()),
            Err(err) => warn!("failed to persist wifi config: {err:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        link::{SimLink, SimNetwork},
        store::MemoryStore,
    };

    fn timing() -> WifiTiming {
        WifiTiming {
            poll_interval_ms: 100,
            max_tries: 5,
            settle_interval_ms: 10,
            link_error_backoff_ms: 1_000,
        }
    }

    fn manager(
        delay: Duration,
        store: MemoryStore,
    ) -> (WifiManager<SimLink, MemoryStore>, SimLink) {
        let link = SimLink::with_association_delay(vec![SimNetwork::new("home", "secret")], delay);
        let observer = link.clone();
        (
            WifiManager::new(link, store, ProvisioningConfig::default(), timing()),
            observer,
        )
    }

    fn station(ssid: &str, password: &str) -> WifiConfig {
        WifiConfig::Station {
            ssid: ssid.to_string(),
            password: password.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_store_starts_access_point() {
        let store = MemoryStore::default();
        let (mut wifi, radio) = manager(Duration::ZERO, store.clone());
        let handle = wifi.handle();

        wifi.start().await.unwrap();
        assert_eq!(handle.mode(), Some(WifiMode::AccessPoint));
        assert_eq!(handle.address(), Some(crate::link::SIM_AP_ADDRESS));
        assert!(radio.is_active(WifiMode::AccessPoint));
        assert!(!radio.is_active(WifiMode::Station));
        assert_eq!(store.snapshot(), Some(WifiConfig::AccessPoint.to_map()));
    }

    #[tokio::test(start_paused = true)]
    async fn stored_station_is_restored_without_saving() {
        let store = MemoryStore::with_map(station("home", "secret").to_map());
        let (mut wifi, radio) = manager(Duration::from_millis(350), store.clone());

        wifi.start().await.unwrap();
        let state = wifi.state();
        assert_eq!(state.mode, Some(WifiMode::Station));
        assert_eq!(state.ssid.as_deref(), Some("home"));
        assert_eq!(radio.associated_ssid().as_deref(), Some("home"));
        assert!(!radio.is_active(WifiMode::AccessPoint));
        assert_eq!(store.saves(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_connect_is_persisted() {
        let store = MemoryStore::default();
        let (mut wifi, _radio) = manager(Duration::from_millis(200), store.clone());
        wifi.start().await.unwrap();

        let outcome = wifi.apply(station("home", "secret")).await.unwrap();
        assert_eq!(outcome, ConnectOutcome::Connected);
        assert_eq!(store.snapshot(), Some(station("home", "secret").to_map()));
        assert_eq!(wifi.state().address, Some(Ipv4Addr::new(192, 168, 1, 50)));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_reverts_to_access_point() {
        let store = MemoryStore::default();
        let (mut wifi, radio) = manager(Duration::ZERO, store.clone());
        wifi.start().await.unwrap();

        let outcome = wifi.apply(station("home", "wrong")).await.unwrap();
        assert_eq!(outcome, ConnectOutcome::Reverted(WifiMode::AccessPoint));
        assert_eq!(wifi.state().mode, Some(WifiMode::AccessPoint));
        assert!(radio.is_active(WifiMode::AccessPoint));
        assert_eq!(store.snapshot(), Some(WifiConfig::AccessPoint.to_map()));
        assert_eq!(radio.connect_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_reverts_to_previous_station() {
        let store = MemoryStore::with_map(station("home", "secret").to_map());
        let (mut wifi, radio) = manager(Duration::ZERO, store.clone());
        wifi.start().await.unwrap();

        let outcome = wifi.apply(station("cafe", "latte")).await.unwrap();
        assert_eq!(outcome, ConnectOutcome::Reverted(WifiMode::Station));
        assert_eq!(wifi.state().ssid.as_deref(), Some("home"));
        assert_eq!(radio.associated_ssid().as_deref(), Some("home"));
        assert_eq!(store.saves(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_attempt_gives_up_after_max_tries() {
        let (mut wifi, _radio) = manager(Duration::ZERO, MemoryStore::default());
        wifi.start().await.unwrap();

        let started = tokio::time::Instant::now();
        wifi.apply(station("home", "wrong")).await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(500), "{waited:?}");
        assert!(waited < Duration::from_millis(700), "{waited:?}");
    }
}
