use std::{
    future::Future,
    net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener, UdpSocket as StdUdpSocket},
    time::Duration,
};

use pretty_assertions::assert_eq;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    task::JoinHandle,
};
use webnode::{
    link::{SimLink, SimNetwork, SIM_AP_ADDRESS},
    store::MemoryStore,
    Supervisor,
};
use webnode_common::{NodeConfig, WifiConfig, WifiMode, WifiTiming};

const WAIT: Duration = Duration::from_secs(10);

struct Node {
    http: SocketAddr,
    discovery: SocketAddr,
    radio: SimLink,
    store: MemoryStore,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Drop for Node {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn free_ports() -> (u16, u16) {
    let tcp = StdTcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let udp = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
    (
        tcp.local_addr().unwrap().port(),
        udp.local_addr().unwrap().port(),
    )
}

fn fast_timing() -> WifiTiming {
    WifiTiming {
        poll_interval_ms: 20,
        max_tries: 10,
        settle_interval_ms: 5,
        link_error_backoff_ms: 50,
    }
}

fn start_node(store: MemoryStore) -> Node {
    start_node_with(store, Duration::from_millis(50))
}

fn start_node_with(store: MemoryStore, association_delay: Duration) -> Node {
    let (http_port, discovery_port) = free_ports();
    let mut config = NodeConfig::default();
    config.http.bind = Ipv4Addr::LOCALHOST;
    config.http.port = http_port;
    config.discovery.port = discovery_port;
    config.timing = fast_timing();
    config.sanitize();

    let radio = SimLink::with_association_delay(
        vec![SimNetwork::new("home", "secret")],
        association_delay,
    );
    let supervisor = Supervisor::new(config, radio.clone(), store.clone());
    let task = tokio::spawn(supervisor.run(std::future::pending()));

    Node {
        http: SocketAddr::from((Ipv4Addr::LOCALHOST, http_port)),
        discovery: SocketAddr::from((Ipv4Addr::LOCALHOST, discovery_port)),
        radio,
        store,
        task,
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Sends one raw request, retrying the connect while the server is down.
async fn exchange(addr: SocketAddr, raw: &str) -> String {
    let deadline = tokio::time::Instant::now() + WAIT;
    let mut stream = loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => break stream,
            Err(err) => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "server at {addr} never came up: {err}"
                );
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    };
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).await.unwrap();
    reply
}

fn split(reply: &str) -> (&str, &str) {
    reply.split_once("\r\n\r\n").unwrap_or((reply, ""))
}

async fn get_json(addr: SocketAddr, path: &str) -> serde_json::Value {
    let reply = exchange(
        addr,
        &format!("GET {path} HTTP/1.1\r\nAccept: application/json\r\n\r\n"),
    )
    .await;
    let (head, body) = split(&reply);
    assert!(head.starts_with("HTTP/1.1 200 OK"), "{reply}");
    serde_json::from_str(body).unwrap()
}

fn form_post(path: &str, form: &str) -> String {
    format!(
        "POST {path} HTTP/1.1\r\nAccept: application/json\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{form}",
        form.len()
    )
}

async fn discovery_query(addr: SocketAddr, payload: &[u8]) -> String {
    let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let mut buf = [0u8; 128];
    for _ in 0..50 {
        client.send_to(payload, addr).await.unwrap();
        if let Ok(Ok((len, _))) =
            tokio::time::timeout(Duration::from_millis(200), client.recv_from(&mut buf)).await
        {
            return String::from_utf8_lossy(&buf[..len]).into_owned();
        }
    }
    panic!("no discovery reply from {addr}");
}

#[tokio::test]
async fn fresh_node_reports_access_point_mode() {
    let node = start_node(MemoryStore::default());

    let mode = get_json(node.http, "/wifi_mode").await;
    assert_eq!(mode, serde_json::json!({"mode": "AP"}));
    assert_eq!(node.store.snapshot(), Some(WifiConfig::AccessPoint.to_map()));
}

#[tokio::test]
async fn station_config_is_applied_and_persisted() {
    let node = start_node(MemoryStore::default());
    get_json(node.http, "/wifi_mode").await;

    let reply = exchange(
        node.http,
        &form_post("/set_config", "mode=sta&ssid=home&pass=secret"),
    )
    .await;
    let (head, body) = split(&reply);
    assert!(head.starts_with("HTTP/1.1 200 OK"), "{reply}");
    let report: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(
        report,
        serde_json::json!({"status": "ok", "message": "Starting STA mode, ssid=home."})
    );

    let expected = WifiConfig::Station {
        ssid: "home".to_string(),
        password: "secret".to_string(),
    }
    .to_map();
    eventually("station config to be saved", || {
        let saved = node.store.snapshot();
        let expected = expected.clone();
        async move { saved == Some(expected) }
    })
    .await;

    let http = node.http;
    eventually("station mode to be served", || async move {
        get_json(http, "/wifi_mode").await == serde_json::json!({"mode": "STA"})
    })
    .await;
    assert_eq!(node.radio.associated_ssid().as_deref(), Some("home"));
    assert!(!node.radio.is_active(WifiMode::AccessPoint));
    assert_eq!(node.radio.connect_requests(), 1);
}

#[tokio::test]
async fn reply_arrives_before_the_new_config_is_saved() {
    // Nothing is saved until the radio has associated.
    let node = start_node_with(MemoryStore::default(), Duration::from_millis(150));
    get_json(node.http, "/wifi_mode").await;
    let ap_map = Some(WifiConfig::AccessPoint.to_map());

    let reply = exchange(
        node.http,
        &form_post("/set_config", "mode=sta&ssid=home&pass=secret"),
    )
    .await;
    assert!(reply.starts_with("HTTP/1.1 200 OK"), "{reply}");
    assert_eq!(node.store.snapshot(), ap_map);
    assert!(node.radio.associated_ssid().is_none());

    eventually("the station config to be saved", || {
        let saved = node.store.snapshot();
        async move { saved.is_some_and(|map| map.get("ssid").map(String::as_str) == Some("home")) }
    })
    .await;
    assert_eq!(node.radio.connect_requests(), 1);
}

#[tokio::test]
async fn wrong_password_reverts_without_persisting() {
    let node = start_node(MemoryStore::default());
    get_json(node.http, "/wifi_mode").await;

    let reply = exchange(
        node.http,
        &form_post("/set_config", "mode=sta&ssid=home&pass=wrong"),
    )
    .await;
    assert!(reply.starts_with("HTTP/1.1 200 OK"), "{reply}");

    eventually("the failed attempt to revert", || {
        let reverted =
            node.radio.connect_requests() == 1 && node.radio.is_active(WifiMode::AccessPoint);
        async move { reverted }
    })
    .await;

    let mode = get_json(node.http, "/wifi_mode").await;
    assert_eq!(mode, serde_json::json!({"mode": "AP"}));
    assert_eq!(node.store.snapshot(), Some(WifiConfig::AccessPoint.to_map()));
    assert_eq!(
        discovery_query(node.discovery, b"ID any").await,
        format!("ID webnode {SIM_AP_ADDRESS}")
    );
}

#[tokio::test]
async fn unchanged_mode_is_not_modified() {
    let node = start_node(MemoryStore::default());
    get_json(node.http, "/wifi_mode").await;

    let reply = exchange(node.http, &form_post("/set_config", "mode=ap")).await;
    let report: serde_json::Value = serde_json::from_str(split(&reply).1).unwrap();
    assert_eq!(report["message"], "Not modified.");
    assert_eq!(node.radio.connect_requests(), 0);

    let reply = exchange(node.http, &form_post("/set_config", "mode=mesh")).await;
    assert!(reply.starts_with("HTTP/1.1 400 Bad Request"), "{reply}");
    let error: serde_json::Value = serde_json::from_str(split(&reply).1).unwrap();
    assert_eq!(
        error,
        serde_json::json!({"code": 400, "error": "Wrong mode given."})
    );
}

#[tokio::test]
async fn discovery_answers_identify_and_rejects_unknown_actions() {
    let node = start_node(MemoryStore::default());
    get_json(node.http, "/wifi_mode").await;

    assert_eq!(
        discovery_query(node.discovery, b"ID any").await,
        format!("ID webnode {SIM_AP_ADDRESS}")
    );
    assert_eq!(
        discovery_query(node.discovery, b"ID WebNode").await,
        format!("ID webnode {SIM_AP_ADDRESS}")
    );
    assert_eq!(
        discovery_query(node.discovery, b"PING now").await,
        "ERR 400 action not supported: PING"
    );
}

#[tokio::test]
async fn unknown_method_and_unknown_path_are_distinguished() {
    let node = start_node(MemoryStore::default());

    let reply = exchange(
        node.http,
        "POST /wifi_mode HTTP/1.1\r\nAccept: application/json\r\n\r\n",
    )
    .await;
    assert!(reply.starts_with("HTTP/1.1 405 Method Not Allowed"), "{reply}");

    let reply = exchange(node.http, "GET /nope HTTP/1.1\r\n\r\n").await;
    assert!(reply.starts_with("HTTP/1.1 404 Not Found"), "{reply}");
    assert!(split(&reply).0.contains("content-type: text/html"));
}

#[tokio::test]
async fn setup_form_shows_current_mode_and_ssid() {
    let node = start_node(MemoryStore::default());
    get_json(node.http, "/wifi_mode").await;

    let reply = exchange(node.http, "GET /set_config HTTP/1.1\r\n\r\n").await;
    let (head, body) = split(&reply);
    assert!(head.starts_with("HTTP/1.1 200 OK"), "{reply}");
    assert!(head.contains("content-type: text/html"));
    assert!(body.contains("<p>Current mode: AP WebNode-Setup</p>"), "{body}");
    assert!(body.contains(r#"<input name="ssid" value="">"#), "{body}");
}

#[tokio::test]
async fn scan_lists_simulated_networks() {
    let node = start_node(MemoryStore::default());

    let scan = get_json(node.http, "/wifi_scan").await;
    let entries = scan.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["ssid"], "home");
    assert_eq!(entries[0]["authmode"], "WPA2-PSK");
    assert_eq!(entries[0]["connected"], false);
}

#[tokio::test]
async fn stored_station_is_restored_on_boot() {
    let stored = WifiConfig::Station {
        ssid: "home".to_string(),
        password: "secret".to_string(),
    }
    .to_map();
    let node = start_node(MemoryStore::with_map(stored));

    let mode = get_json(node.http, "/wifi_mode").await;
    assert_eq!(mode, serde_json::json!({"mode": "STA"}));
    assert_eq!(node.store.saves(), 0);

    let form = exchange(node.http, "GET /set_config HTTP/1.1\r\n\r\n").await;
    assert!(form.contains("<p>Current mode: STA home</p>"), "{form}");
    assert!(form.contains(r#"<input name="ssid" value="home">"#), "{form}");
    assert_eq!(
        discovery_query(node.discovery, b"ID any").await,
        "ID webnode 192.168.1.50"
    );
}
