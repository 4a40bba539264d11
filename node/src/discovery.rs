//! UDP multicast responder answering identify queries.

use std::{
    io::{self, ErrorKind},
    net::{Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{net::UdpSocket, sync::oneshot};
use tracing::{debug, info, warn};
use webnode_common::discovery::{identify_reply, parse_datagram, Command};

use crate::wifi::ConnectivityHandle;

const DATAGRAM_BYTES: usize = 64;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct Running {
    stop: Arc<AtomicBool>,
    done: oneshot::Receiver<()>,
    local_addr: SocketAddr,
}

pub struct DiscoveryResponder {
    device_name: String,
    connectivity: ConnectivityHandle,
    running: Option<Running>,
}

impl DiscoveryResponder {
    pub fn new(device_name: impl Into<String>, connectivity: ConnectivityHandle) -> Self {
        Self {
            device_name: device_name.into(),
            connectivity,
            running: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Binds `port` on all interfaces and joins `group` on `interface`.
    ///
    /// A failed group join is logged and the responder still answers unicast
    /// queries on the port.
    pub async fn start(
        &mut self,
        group: Ipv4Addr,
        port: u16,
        interface: Ipv4Addr,
    ) -> io::Result<SocketAddr> {
        if self.running.is_some() {
            return Err(io::Error::new(
                ErrorKind::AlreadyExists,
                "discovery responder already running",
            ));
        }

        let std_socket = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket)?;
        let local_addr = socket.local_addr()?;

        let membership = match socket.join_multicast_v4(group, interface) {
            Ok(()) => Some((group, interface)),
            Err(err) => {
                warn!("could not join multicast group {group} on {interface}: {err}");
                None
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done) = oneshot::channel();
        tokio::spawn(listen(
            socket,
            membership,
            self.device_name.clone(),
            self.connectivity.clone(),
            Arc::clone(&stop),
            done_tx,
        ));

        self.running = Some(Running {
            stop,
            done,
            local_addr,
        });
        info!("discovery responder on {local_addr} (group {group})");
        Ok(local_addr)
    }

    /// Raises the stop flag and waits until the socket has been closed.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.stop.store(true, Ordering::Release);
        if running.done.await.is_err() {
            warn!("discovery task ended without confirming shutdown");
        }
        debug!("discovery responder on {} stopped", running.local_addr);
    }
}

async fn listen(
    socket: UdpSocket,
    membership: Option<(Ipv4Addr, Ipv4Addr)>,
    device_name: String,
    connectivity: ConnectivityHandle,
    stop: Arc<AtomicBool>,
    done: oneshot::Sender<()>,
) {
    let mut buf = [0u8; DATAGRAM_BYTES];
    while !stop.load(Ordering::Acquire) {
        match socket.try_recv_from(&mut buf) {
            Ok((len, peer)) => {
                if let Some(reply) = answer(&buf[..len], &device_name, &connectivity) {
                    if let Err(err) = socket.send_to(reply.as_bytes(), peer).await {
                        warn!("failed to reply to {peer}: {err}");
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => warn!("discovery receive failed: {err}"),
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    if let Some((group, interface)) = membership {
        if let Err(err) = socket.leave_multicast_v4(group, interface) {
            debug!("leaving multicast group {group} failed: {err}");
        }
    }
    drop(socket);
    let _ = done.send(());
}

fn answer(datagram: &[u8], device_name: &str, connectivity: &ConnectivityHandle) -> Option<String> {
    match parse_datagram(datagram) {
        Ok(Command::Identify { name }) => {
            identify_reply(&name, device_name, connectivity.address())
        }
        Err(err) => {
            warn!("bad discovery datagram: {err}");
            Some(err.reply())
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::sync::watch;
    use webnode_common::{ConnectivityState, WifiMode};

    use super::*;

    fn handle(address: Option<Ipv4Addr>) -> ConnectivityHandle {
        let (_, rx) = watch::channel(ConnectivityState {
            mode: Some(WifiMode::AccessPoint),
            ssid: Some("WebNode-Setup".to_string()),
            password: None,
            address,
        });
        ConnectivityHandle::from(rx)
    }

    #[test]
    fn answers_identify_for_wildcard_and_own_name() {
        let connectivity = handle(Some(Ipv4Addr::new(192, 168, 4, 1)));
        assert_eq!(
            answer(b"ID any", "webnode", &connectivity).as_deref(),
            Some("ID webnode 192.168.4.1")
        );
        assert_eq!(
            answer(b"ID WEBNODE\r\n", "webnode", &connectivity).as_deref(),
            Some("ID webnode 192.168.4.1")
        );
        assert_eq!(answer(b"ID other", "webnode", &connectivity), None);
    }

    #[test]
    fn malformed_and_unknown_datagrams_get_err_replies() {
        let connectivity = handle(None);
        assert_eq!(
            answer(b"HELLO there", "webnode", &connectivity).as_deref(),
            Some("ERR 400 action not supported: HELLO")
        );
        assert!(answer(b"ID", "webnode", &connectivity)
            .is_some_and(|reply| reply.starts_with("ERR 400 ")));
    }

    #[tokio::test]
    async fn responds_over_udp_and_stops() {
        let mut responder = DiscoveryResponder::new("webnode", handle(None));
        let addr = responder
            .start(Ipv4Addr::new(239, 255, 173, 63), 0, Ipv4Addr::UNSPECIFIED)
            .await
            .unwrap();

        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        client
            .send_to(b"ID any", (Ipv4Addr::LOCALHOST, addr.port()))
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("reply within timeout")
            .unwrap();
        assert_eq!(&buf[..len], b"ID webnode 0.0.0.0");

        responder.stop().await;
        assert!(!responder.is_running());
        // The port is free again once stop returns.
        StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, addr.port())).unwrap();
    }

    #[tokio::test]
    async fn pauses_between_datagrams_even_without_reply() {
        let mut responder = DiscoveryResponder::new("webnode", handle(None));
        let addr = responder
            .start(Ipv4Addr::new(239, 255, 173, 63), 0, Ipv4Addr::UNSPECIFIED)
            .await
            .unwrap();
        let target = (Ipv4Addr::LOCALHOST, addr.port());

        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let started = tokio::time::Instant::now();
        for _ in 0..3 {
            client.send_to(b"ID other", target).await.unwrap();
        }
        client.send_to(b"ID any", target).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("reply within timeout")
            .unwrap();
        assert_eq!(&buf[..len], b"ID webnode 0.0.0.0");
        assert!(started.elapsed() >= POLL_INTERVAL * 3);

        responder.stop().await;
    }
}
