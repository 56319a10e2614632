//! Peer tables: who we can reach and how.
//!
//! The two tables follow different update disciplines and are locked
//! independently: discovery replaces [`LocalPeerTable`] wholesale every
//! window, while keepalive loops merge relay membership into
//! [`RemotePeerTable`] one relay at a time. Neither lock is held across an
//! `.await`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;

use parking_lot::RwLock;
use rand::seq::IteratorRandom;
use tracing::debug;

/// Peers found by LAN discovery: `name -> (ip, port)`.
#[derive(Debug, Default)]
pub struct LocalPeerTable {
    peers: RwLock<HashMap<String, SocketAddr>>,
}

impl LocalPeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a fresh discovery snapshot.
    pub fn replace(&self, snapshot: HashMap<String, SocketAddr>) {
        let mut peers = self.peers.write();
        for name in snapshot.keys().filter(|n| !peers.contains_key(*n)) {
            debug!("Local peer {name} appeared");
        }
        for name in peers.keys().filter(|n| !snapshot.contains_key(*n)) {
            debug!("Local peer {name} disappeared");
        }
        *peers = snapshot;
    }

    pub fn get(&self, name: &str) -> Option<SocketAddr> {
        self.peers.read().get(name).copied()
    }

    pub fn names(&self) -> Vec<String> {
        self.peers.read().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, SocketAddr> {
        self.peers
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Peers reachable through relays: `name -> set of relay addresses`.
#[derive(Debug, Default)]
pub struct RemotePeerTable {
    peers: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl RemotePeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `peer` is reachable through `relay`.
    pub fn add_route(&self, peer: &str, relay: &str) {
        self.peers
            .write()
            .entry(peer.to_string())
            .or_default()
            .insert(relay.to_string());
    }

    /// Forget one route; the peer is evicted once it has none left.
    pub fn remove_route(&self, peer: &str, relay: &str) {
        let mut peers = self.peers.write();
        if let Some(relays) = peers.get_mut(peer) {
            relays.remove(relay);
            if relays.is_empty() {
                peers.remove(peer);
                debug!("Remote peer {peer} has no relays left, evicted");
            }
        }
    }

    /// Make `relay` a route for exactly the peers in `listed`: added to each
    /// of them, dropped from everyone else.
    pub fn sync_relay(&self, relay: &str, listed: &BTreeSet<String>) {
        let mut peers = self.peers.write();
        for name in listed {
            peers.entry(name.clone()).or_default().insert(relay.to_string());
        }
        peers.retain(|name, relays| {
            if !listed.contains(name) {
                relays.remove(relay);
            }
            !relays.is_empty()
        });
    }

    /// Remove `relay` from every peer's route set.
    pub fn drop_relay(&self, relay: &str) {
        self.peers.write().retain(|_, relays| {
            relays.remove(relay);
            !relays.is_empty()
        });
    }

    /// Pick one of the peer's relays at random.
    pub fn pick_route(&self, peer: &str) -> Option<String> {
        let peers = self.peers.read();
        let relays = peers.get(peer)?;
        relays.iter().choose(&mut rand::rng()).cloned()
    }

    pub fn routes(&self, peer: &str) -> Vec<String> {
        self.peers
            .read()
            .get(peer)
            .map(|relays| relays.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn evict(&self, peer: &str) {
        self.peers.write().remove(peer);
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.peers.read().contains_key(peer)
    }

    pub fn names(&self) -> Vec<String> {
        self.peers.read().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.peers
            .read()
            .iter()
            .map(|(name, relays)| (name.clone(), relays.iter().cloned().collect()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
