//! Node, the top-level coordinator of the PeerLink layer.
//!
//! [`Node`] is the primary public API of peerlink_network. It owns:
//! - the command registry served on the local HTTP endpoint
//! - LAN discovery (advertiser plus listening windows)
//! - one keepalive task per relay
//! - command submission to one, many or all peers
//!
//! `Node` is a cheap handle; clones share the same node.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::codec::Codec;
use crate::commands::{CommandError, CommandHandler, CommandRegistry, CommandTree, LIST_COMMANDS};
use crate::config::NodeConfig;
use crate::discovery::{self, Announcement, DiscoveryConfig, DiscoveryService};
use crate::dispatch::{self, CommandOptions, CommandOutcome, Target};
use crate::error::NetworkError;
use crate::identity::NodeIdentity;
use crate::peer::{LocalPeerTable, RemotePeerTable};
use crate::remote::{self, PendingResponses, RelaySet, normalize_relay};
use crate::transport;

struct NodeInner {
    identity: NodeIdentity,
    config: NodeConfig,
    codec: Codec,
    commands: RwLock<CommandRegistry>,
    local_peers: LocalPeerTable,
    remote_peers: RemotePeerTable,
    relays: RelaySet,
    pending: PendingResponses,
    http: reqwest::Client,
    running: AtomicBool,
    /// Present while the node runs; taking it is what stops the node.
    shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// A PeerLink node.
///
/// Create one per process and network. Call [`start()`](Node::start) to serve
/// commands, discover LAN peers and register with relays.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Validate `config` and build a stopped node.
    pub fn new(config: NodeConfig) -> Result<Self, NetworkError> {
        let (identity, key) = config.validate()?;

        let relays = RelaySet::new(config.max_remotes);
        for relay in &config.relays {
            relays.adopt(&normalize_relay(relay), true);
        }
        if relays.is_empty() {
            warn!("No relays configured for {identity}, remote connections are unavailable");
        }

        let http = reqwest::Client::builder().build()?;

        Ok(Self {
            inner: Arc::new(NodeInner {
                identity,
                codec: Codec::new(&key),
                commands: RwLock::new(CommandRegistry::with_builtins()),
                local_peers: LocalPeerTable::new(),
                remote_peers: RemotePeerTable::new(),
                relays,
                pending: PendingResponses::new(),
                http,
                running: AtomicBool::new(false),
                shutdown_tx: Mutex::new(None),
                local_addr: Mutex::new(None),
                config,
            }),
        })
    }

    /// Start serving. Returns the address the command endpoint is bound to.
    ///
    /// Starting a running node does nothing and returns the same address.
    pub async fn start(&self) -> Result<SocketAddr, NetworkError> {
        let (listener, shutdown_tx, addr) = {
            let mut slot = self.inner.shutdown_tx.lock();
            if slot.is_some() {
                return self.local_addr().ok_or(NetworkError::NotRunning);
            }

            let bind_addr = SocketAddr::new(self.inner.config.bind_ip, self.inner.config.server_port());
            let std_listener = std::net::TcpListener::bind(bind_addr)?;
            std_listener.set_nonblocking(true)?;
            let listener = TcpListener::from_std(std_listener)?;
            let addr = listener.local_addr()?;

            let (shutdown_tx, _) = broadcast::channel(8);
            *slot = Some(shutdown_tx.clone());
            *self.inner.local_addr.lock() = Some(addr);
            self.inner.running.store(true, Ordering::SeqCst);
            (listener, shutdown_tx, addr)
        };

        let node = self.clone();
        let server_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = transport::serve(listener, node, server_shutdown).await {
                error!("Command endpoint error: {e}");
            }
        });

        if self.inner.config.discovery_enabled {
            let advertised_ip: IpAddr = self
                .inner
                .config
                .advertise_ip
                .unwrap_or_else(discovery::detect_local_ip);
            let discovery_config = DiscoveryConfig {
                port: self.inner.config.advertising_port(),
                interval: self.inner.config.advertise_interval,
                window: self.inner.config.discovery_window,
                announcement: Announcement::new(
                    &self.inner.identity.network,
                    &self.inner.identity.name,
                    SocketAddr::new(advertised_ip, addr.port()),
                ),
            };
            let node = self.clone();
            if let Err(e) = DiscoveryService::start(
                discovery_config,
                move |snapshot| node.local_peers().replace(snapshot),
                shutdown_tx.subscribe(),
            )
            .await
            {
                warn!("Discovery start failed (non-fatal): {e}");
            }
        }

        for relay in self.inner.relays.addresses() {
            remote::spawn_keepalive(self.clone(), relay);
        }

        info!("Node {} started on {addr}", self.inner.identity);
        Ok(addr)
    }

    /// Signal every task to stop. Loops exit at their next tick; requests
    /// already in flight are left to time out.
    pub async fn stop(&self) {
        let Some(shutdown_tx) = self.inner.shutdown_tx.lock().take() else {
            return;
        };
        self.inner.running.store(false, Ordering::SeqCst);
        let _ = shutdown_tx.send(());
        self.inner.pending.clear();
        *self.inner.local_addr.lock() = None;
        tokio::task::yield_now().await;
        info!("Node {} stopped", self.inner.identity);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Where the command endpoint listens, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Run `command_path` on `target`.
    ///
    /// See [`CommandOutcome`] for the shape of the result. Only a
    /// single-target call with `raise_errors` set ever returns an error for
    /// a per-target failure.
    pub async fn command(
        &self,
        command_path: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        target: impl Into<Target>,
        options: CommandOptions,
    ) -> Result<CommandOutcome, NetworkError> {
        dispatch::fan_out(self, command_path, args, kwargs, target.into(), options).await
    }

    /// `__list_commands__` on `target`.
    pub async fn get_commands(
        &self,
        target: impl Into<Target>,
        options: CommandOptions,
    ) -> Result<CommandOutcome, NetworkError> {
        self.command(LIST_COMMANDS, Vec::new(), Map::new(), target, options)
            .await
    }

    /// Options carrying this node's configured default timeout.
    pub fn default_options(&self) -> CommandOptions {
        CommandOptions::default().with_timeout(self.inner.config.default_timeout)
    }

    pub fn register_command(&self, path: &str, handler: CommandHandler) -> Result<(), NetworkError> {
        Ok(self.inner.commands.write().register(path, handler)?)
    }

    pub fn register_commands(&self, tree: CommandTree, at: Option<&str>) -> Result<(), NetworkError> {
        Ok(self.inner.commands.write().register_tree(tree, at)?)
    }

    pub fn override_builtin(&self, name: &str, handler: CommandHandler) -> Result<(), NetworkError> {
        Ok(self.inner.commands.write().override_builtin(name, handler)?)
    }

    pub fn resolve_command(&self, path: &str) -> Result<CommandHandler, CommandError> {
        self.inner.commands.read().resolve(path)
    }

    /// Every command path this node serves.
    pub fn command_paths(&self) -> Vec<String> {
        self.inner.commands.read().list_paths()
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.inner.identity
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn codec(&self) -> &Codec {
        &self.inner.codec
    }

    pub fn local_peers(&self) -> &LocalPeerTable {
        &self.inner.local_peers
    }

    pub fn remote_peers(&self) -> &RemotePeerTable {
        &self.inner.remote_peers
    }

    pub fn relays(&self) -> &RelaySet {
        &self.inner.relays
    }

    pub(crate) fn pending(&self) -> &PendingResponses {
        &self.inner.pending
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    /// A fresh shutdown receiver, or `None` when the node is stopped.
    pub(crate) fn shutdown_signal(&self) -> Option<broadcast::Receiver<()>> {
        self.inner
            .shutdown_tx
            .lock()
            .as_ref()
            .map(|tx| tx.subscribe())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
