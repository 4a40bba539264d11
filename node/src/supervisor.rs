//! Single owner of the WiFi manager and the network services.
//!
//! Handlers never touch the radio or the listeners directly; they send a
//! command here. A mode change stops both services, transitions the radio
//! and starts both services again against the new interface.

use std::{future::Future, path::PathBuf};

use anyhow::{anyhow, Context};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use webnode_common::{NodeConfig, ScanResult, WifiConfig};

use crate::{
    discovery::DiscoveryResponder,
    http::HttpServer,
    link::{Link, LinkError},
    routes::{self, AppState},
    store::ConfigStore,
    wifi::{ConnectOutcome, WifiManager},
};

const COMMAND_QUEUE: usize = 4;

pub enum Command {
    Apply {
        config: WifiConfig,
        done: oneshot::Sender<Result<ConnectOutcome, LinkError>>,
    },
    Scan {
        reply: oneshot::Sender<Result<Vec<ScanResult>, LinkError>>,
    },
}

#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Command>,
}

impl SupervisorHandle {
    /// Requests a mode change and waits for it, including the service
    /// restart, to finish.
    pub async fn apply(&self, config: WifiConfig) -> anyhow::Result<ConnectOutcome> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Apply { config, done })
            .await
            .map_err(|_| anyhow!("supervisor is not running"))?;
        Ok(rx.await.context("supervisor dropped the request")??)
    }

    pub async fn scan(&self) -> anyhow::Result<Vec<ScanResult>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Scan { reply })
            .await
            .map_err(|_| anyhow!("supervisor is not running"))?;
        Ok(rx.await.context("supervisor dropped the request")??)
    }
}

pub struct Supervisor<L, S> {
    config: NodeConfig,
    wifi: WifiManager<L, S>,
    http: HttpServer<AppState>,
    discovery: DiscoveryResponder,
    commands: mpsc::Receiver<Command>,
}

impl<L, S> Supervisor<L, S>
where
    L: Link + Send,
    S: ConfigStore + Send + Sync,
{
    pub fn new(config: NodeConfig, link: L, store: S) -> Self {
        let wifi = WifiManager::new(
            link,
            store,
            config.provisioning.clone(),
            config.timing.clone(),
        );
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let connectivity = wifi.handle();

        let state = AppState {
            connectivity: connectivity.clone(),
            supervisor: SupervisorHandle { tx },
        };
        let http = HttpServer::new(
            routes::router(),
            state,
            config.http.static_root.as_ref().map(PathBuf::from),
        );
        let discovery = DiscoveryResponder::new(config.device_name.clone(), connectivity);

        Self {
            config,
            wifi,
            http,
            discovery,
            commands,
        }
    }

    /// Brings the radio and both services up, then serves commands until
    /// `shutdown` resolves.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        if let Err(err) = self.wifi.start().await {
            warn!("radio bring-up failed: {err}; falling back to AP mode");
            self.wifi
                .start_access_point()
                .await
                .context("failed to start the provisioning access point")?;
        }
        self.start_services().await?;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }

        info!("shutting down");
        self.stop_services().await;
        Ok(())
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Apply { config, done } => {
                let outcome = self.change_mode(config).await;
                let _ = done.send(outcome);
            }
            Command::Scan { reply } => {
                let _ = reply.send(self.wifi.scan());
            }
        }
    }

    async fn change_mode(&mut self, config: WifiConfig) -> Result<ConnectOutcome, LinkError> {
        info!("changing to {} mode", config.mode().as_str());
        self.stop_services().await;

        let outcome = self.wifi.apply(config).await;
        if let Err(err) = &outcome {
            error!("mode change failed: {err}; starting the provisioning access point");
            if let Err(err) = self.wifi.start_access_point().await {
                error!("provisioning access point failed too: {err}");
            }
        }

        if let Err(err) = self.start_services().await {
            error!("failed to restart services: {err:#}");
        }
        outcome
    }

    async fn start_services(&mut self) -> anyhow::Result<()> {
        let http = &self.config.http;
        let discovery = &self.config.discovery;
        let (web, responder) = tokio::join!(
            self.http.start(http.bind, http.port, http.backlog),
            self.discovery
                .start(discovery.group, discovery.port, discovery.interface),
        );
        if let Err(err) = responder {
            error!("discovery responder failed to start: {err}");
        }
        web.with_context(|| format!("failed to bind web server on {}:{}", http.bind, http.port))?;
        Ok(())
    }

    async fn stop_services(&mut self) {
        tokio::join!(self.http.stop(), self.discovery.stop());
        debug!("services stopped");
    }
}
