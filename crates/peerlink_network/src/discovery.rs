//! LAN peer discovery via UDP broadcast.
//!
//! Every node broadcasts `"{network}.{name}|{ip}:{port}"` on the advertising
//! port once per interval. Listening happens in fixed windows: each window
//! binds the advertising port, collects announcements for this network and
//! yields a snapshot that replaces the previous one, so peers that stop
//! advertising drop out after one window.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::NetworkError;

/// Pause before retrying after the advertising port could not be bound.
const BIND_RETRY: Duration = Duration::from_secs(2);

/// An announcement broadcast by a node on the LAN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub network: String,
    pub name: String,
    /// Where the node's HTTP endpoint listens.
    pub addr: SocketAddr,
}

impl Announcement {
    pub fn new(network: impl Into<String>, name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            network: network.into(),
            name: name.into(),
            addr,
        }
    }

    /// The datagram payload.
    pub fn to_datagram(&self) -> String {
        format!(
            "{}.{}|{}:{}",
            self.network,
            self.name,
            self.addr.ip(),
            self.addr.port()
        )
    }

    /// Parse a datagram, keeping it only if it belongs to `network`.
    ///
    /// Anything that is not exactly `network.name|ip:port` yields `None`.
    pub fn parse(datagram: &str, network: &str) -> Option<Self> {
        let rest = datagram.strip_prefix(network)?.strip_prefix('.')?;
        let mut halves = rest.split('|');
        let (name, address) = (halves.next()?, halves.next()?);
        if halves.next().is_some() || name.is_empty() || name.contains('.') {
            return None;
        }

        let mut parts = address.split(':');
        let (ip, port) = (parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }
        let ip: IpAddr = ip.parse().ok()?;
        let port: u16 = port.parse().ok()?;

        Some(Self::new(network, name, SocketAddr::new(ip, port)))
    }
}

/// Configuration for the discovery service.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP port to broadcast on and listen on.
    pub port: u16,
    /// How often to broadcast our announcement.
    pub interval: Duration,
    /// Length of one listening window.
    pub window: Duration,
    /// Our own announcement.
    pub announcement: Announcement,
}

/// LAN discovery service using UDP broadcast.
pub struct DiscoveryService;

impl DiscoveryService {
    /// Start the advertiser and the discovery loop in the background.
    ///
    /// `on_snapshot` receives the peer table built by each listening window.
    /// Both tasks exit when the shutdown signal is received.
    pub async fn start<F>(
        config: DiscoveryConfig,
        on_snapshot: F,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), NetworkError>
    where
        F: Fn(HashMap<String, SocketAddr>) + Send + Sync + 'static,
    {
        let sender_socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| NetworkError::Transport(format!("Discovery sender bind: {e}")))?;
        sender_socket
            .set_broadcast(true)
            .map_err(|e| NetworkError::Transport(format!("Set broadcast: {e}")))?;

        let payload = config.announcement.to_datagram().into_bytes();
        let broadcast_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), config.port);
        let interval = config.interval;
        let mut shutdown_bcast = shutdown.resubscribe();
        tokio::spawn(async move {
            loop {
                match sender_socket.send_to(&payload, broadcast_addr).await {
                    Ok(_) => trace!("Broadcast announcement sent"),
                    Err(e) => debug!("Broadcast send failed: {e}"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_bcast.recv() => {
                        debug!("Discovery advertiser shutting down");
                        break;
                    }
                }
            }
        });

        info!(
            "Discovery started on UDP port {} as {}",
            config.port,
            config.announcement.to_datagram()
        );

        let mut shutdown_listen = shutdown;
        let DiscoveryConfig {
            port,
            window,
            announcement,
            ..
        } = config;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = discover(&announcement.network, &announcement.name, port, window) => {
                        match result {
                            Ok(snapshot) => on_snapshot(snapshot),
                            Err(e) => {
                                warn!("Discovery window failed: {e}");
                                tokio::time::sleep(BIND_RETRY).await;
                            }
                        }
                    }
                    _ = shutdown_listen.recv() => {
                        debug!("Discovery listener shutting down");
                        break;
                    }
                }
            }
        });

        Ok(())
    }
}

/// Listen on the advertising port for one window and return every peer of
/// `network` heard from, except `own_name`.
pub async fn discover(
    network: &str,
    own_name: &str,
    port: u16,
    window: Duration,
) -> Result<HashMap<String, SocketAddr>, NetworkError> {
    let socket = bind_shared(port)?;
    let deadline = Instant::now() + window;
    let mut discovered = HashMap::new();
    let mut buf = [0u8; 1024];

    loop {
        match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Ok((len, src))) => {
                let Ok(text) = std::str::from_utf8(&buf[..len]) else {
                    trace!("Skipping non-UTF-8 datagram from {src}");
                    continue;
                };
                match Announcement::parse(text, network) {
                    Some(ann) if ann.name != own_name => {
                        discovered.insert(ann.name, ann.addr);
                    }
                    Some(_) => {}
                    None => trace!("Skipping datagram from {src}"),
                }
            }
            Ok(Err(e)) => {
                debug!("Discovery recv error: {e}");
                break;
            }
        }
    }

    Ok(discovered)
}

/// Bind the advertising port so that several nodes on one host can share it.
fn bind_shared(port: u16) -> Result<UdpSocket, NetworkError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&addr.into())?;

    let std_socket: StdUdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// Best guess at this host's LAN address: the source address the OS would
/// pick for outbound traffic. Nothing is sent.
pub fn detect_local_ip() -> IpAddr {
    StdUdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:53")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
