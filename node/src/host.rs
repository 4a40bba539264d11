use std::{io::ErrorKind, path::Path, path::PathBuf};

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use webnode::{
    link::{SimLink, SimNetwork},
    store::FileStore,
    Supervisor,
};
use webnode_common::NodeConfig;

const DEFAULT_HOST_HTTP_PORT: u16 = 8080;
const DEFAULT_SIM_NETWORKS: &str = "home:secret";

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let data_dir = std::env::var("WEBNODE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.webnode"));

    let mut config = load_node_config(&data_dir).await.unwrap_or_else(|err| {
        warn!("failed to load node config: {err:#}");
        host_defaults()
    });
    apply_env_overrides(&mut config);
    config.sanitize();

    let networks = std::env::var("WEBNODE_SIM_NETWORKS")
        .unwrap_or_else(|_| DEFAULT_SIM_NETWORKS.to_string());
    let networks = parse_sim_networks(&networks);
    info!(
        "node `{}` with {} simulated networks, data in {}",
        config.device_name,
        networks.len(),
        data_dir.display()
    );

    let store = FileStore::new(data_dir.join("wifi.cfg"));
    let supervisor = Supervisor::new(config, SimLink::new(networks), store);
    supervisor
        .run(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for ctrl-c: {err}");
                std::future::pending::<()>().await;
            }
            info!("ctrl-c received");
        })
        .await
}

fn host_defaults() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.http.port = DEFAULT_HOST_HTTP_PORT;
    config
}

async fn load_node_config(data_dir: &Path) -> anyhow::Result<NodeConfig> {
    let path = data_dir.join("node.json");
    match tokio::fs::read(&path).await {
        Ok(raw) => serde_json::from_slice(&raw)
            .with_context(|| format!("invalid node config at {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(host_defaults()),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn apply_env_overrides(config: &mut NodeConfig) {
    if let Some(port) = env_parse::<u16>("WEBNODE_HTTP_PORT") {
        config.http.port = port;
    }
    if let Some(port) = env_parse::<u16>("WEBNODE_DISCOVERY_PORT") {
        config.discovery.port = port;
    }
    if let Ok(name) = std::env::var("WEBNODE_NAME") {
        config.device_name = name;
    }
    if let Ok(root) = std::env::var("WEBNODE_STATIC_ROOT") {
        config.http.static_root = Some(root);
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

/// `ssid:password` entries separated by commas. An entry without a colon is
/// an open network.
fn parse_sim_networks(raw: &str) -> Vec<SimNetwork> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .enumerate()
        .map(|(index, entry)| {
            let (ssid, password) = entry.split_once(':').unwrap_or((entry, ""));
            let mut network = SimNetwork::new(ssid, password);
            network.channel = [1, 6, 11][index % 3];
            network.rssi = -45 - 6 * (index % 8) as i8;
            network
        })
        .collect()
}
