//! Remote messaging through relays.
//!
//! Each relay a node knows gets a keepalive task that pings it, merges the
//! membership it reports into the remote peer table, adopts gossiped relays
//! and works through the packets drained from the node's buffer. Requests
//! sent the other way are correlated with their responses by packet id.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::commands::Origin;
use crate::error::NetworkError;
use crate::message::{
    BufferEntry, CommandRequest, PacketKind, PingRequest, PingResponse, RelayResponse, SendRequest,
};
use crate::node::Node;
use crate::transport::dispatch_command;

/// Retry interval for a relay that stopped answering.
pub const INACTIVE_BACKOFF: Duration = Duration::from_secs(5);

/// Limit on a single `/ping` or `/send` round trip.
pub const RELAY_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A fresh packet id: hex SHA-256 of the current time in nanoseconds plus
/// 16 random bytes.
pub fn new_packet_id() -> String {
    let nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default();
    let salt: [u8; 16] = rand::random();

    let mut hasher = Sha256::new();
    hasher.update(nanos.to_be_bytes());
    hasher.update(salt);
    hex::encode(hasher.finalize())
}

/// Canonical form of a relay address: scheme included, no trailing slash.
pub fn normalize_relay(address: &str) -> String {
    let trimmed = address.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

// ---------------------------------------------------------------------------
// Relay set
// ---------------------------------------------------------------------------

/// What the node knows about one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayLink {
    pub address: String,
    /// Whether the last ping succeeded.
    pub active: bool,
    /// Configured relays are retried forever; gossiped ones are dropped on
    /// their first failure.
    pub keep_alive: bool,
}

/// The relays this node pings, capped at `max_remotes`.
#[derive(Debug)]
pub struct RelaySet {
    links: RwLock<BTreeMap<String, RelayLink>>,
    max_remotes: usize,
}

impl RelaySet {
    pub fn new(max_remotes: usize) -> Self {
        Self {
            links: RwLock::new(BTreeMap::new()),
            max_remotes,
        }
    }

    /// Add a relay unless it is already known or the cap is reached.
    /// Returns `true` when the relay was added and needs a keepalive task.
    pub fn adopt(&self, address: &str, keep_alive: bool) -> bool {
        let mut links = self.links.write();
        if links.contains_key(address) || links.len() >= self.max_remotes {
            return false;
        }
        links.insert(
            address.to_string(),
            RelayLink {
                address: address.to_string(),
                active: false,
                keep_alive,
            },
        );
        true
    }

    pub fn set_active(&self, address: &str, active: bool) {
        if let Some(link) = self.links.write().get_mut(address) {
            link.active = active;
        }
    }

    pub fn remove(&self, address: &str) {
        self.links.write().remove(address);
    }

    pub fn keeps_alive(&self, address: &str) -> bool {
        self.links
            .read()
            .get(address)
            .is_some_and(|link| link.keep_alive)
    }

    pub fn is_active(&self, address: &str) -> bool {
        self.links.read().get(address).is_some_and(|link| link.active)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.links.read().contains_key(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.links.read().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<RelayLink> {
        self.links.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.links.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_remotes(&self) -> usize {
        self.max_remotes
    }
}

// ---------------------------------------------------------------------------
// Packet correlation
// ---------------------------------------------------------------------------

/// Submitters waiting for a relay-carried response, keyed by packet id.
///
/// An id leaves the map exactly once: when it is resolved, or when its
/// submitter gives up.
#[derive(Debug, Default)]
pub struct PendingResponses {
    waiters: Mutex<HashMap<String, oneshot::Sender<RelayResponse>>>,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, packet_id: &str) -> oneshot::Receiver<RelayResponse> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(packet_id.to_string(), tx);
        rx
    }

    /// Hand a response to its waiter. Returns `false` for unknown ids (late
    /// or duplicate responses), which are dropped.
    pub fn resolve(&self, packet_id: &str, response: RelayResponse) -> bool {
        match self.waiters.lock().remove(packet_id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, packet_id: &str) {
        self.waiters.lock().remove(packet_id);
    }

    /// Drop every waiter; their submitters see the channel close.
    pub fn clear(&self) {
        self.waiters.lock().clear();
    }

    pub fn contains(&self, packet_id: &str) -> bool {
        self.waiters.lock().contains_key(packet_id)
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Keepalive
// ---------------------------------------------------------------------------

/// Start the keepalive task for `relay`.
pub(crate) fn spawn_keepalive(node: Node, relay: String) {
    tokio::spawn(keepalive_loop(node, relay));
}

async fn keepalive_loop(node: Node, relay: String) {
    let Some(mut shutdown) = node.shutdown_signal() else {
        return;
    };
    info!("Keepalive started for relay {relay}");

    while node.is_running() {
        let wait = match ping_relay(&node, &relay).await {
            Ok(response) => {
                if !node.relays().is_active(&relay) {
                    info!("Relay {relay} is active");
                }
                node.relays().set_active(&relay, true);
                absorb_ping(&node, &relay, response);
                node.config().keepalive_tick
            }
            Err(e) => {
                node.relays().set_active(&relay, false);
                if !node.relays().keeps_alive(&relay) {
                    warn!("Relay {relay} unreachable, forgetting it: {e}");
                    node.relays().remove(&relay);
                    node.remote_peers().drop_relay(&relay);
                    break;
                }
                debug!("Relay {relay} unreachable, retrying in {INACTIVE_BACKOFF:?}: {e}");
                INACTIVE_BACKOFF
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.recv() => break,
        }
    }
    debug!("Keepalive for relay {relay} stopped");
}

async fn ping_relay(node: &Node, relay: &str) -> Result<PingResponse, NetworkError> {
    let identity = node.identity();
    let body = PingRequest {
        node_name: identity.name.clone(),
        node_network: identity.network.clone(),
        known_servers: node.relays().addresses(),
    };
    let response = node
        .http()
        .post(format!("{relay}/ping"))
        .json(&body)
        .timeout(RELAY_REQUEST_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    Ok(response.json().await?)
}

/// Fold one ping reply into the node's state.
fn absorb_ping(node: &Node, relay: &str, response: PingResponse) {
    let own_name = &node.identity().name;
    let listed: BTreeSet<String> = response
        .peers
        .into_iter()
        .filter(|name| name != own_name)
        .collect();
    node.remote_peers().sync_relay(relay, &listed);

    for server in response.servers {
        let server = normalize_relay(&server);
        if node.relays().adopt(&server, false) {
            info!("Learned relay {server} from {relay}");
            spawn_keepalive(node.clone(), server);
        }
    }

    for (packet_id, entry) in response.buffer {
        match entry.kind {
            PacketKind::Response => match node.codec().decode_json::<RelayResponse>(&entry.data) {
                Ok(reply) => {
                    if !node.pending().resolve(&packet_id, reply) {
                        debug!("Dropping late response {packet_id} from {}", entry.originator);
                    }
                }
                Err(e) => warn!("Undecodable response {packet_id} from {}: {e}", entry.originator),
            },
            PacketKind::Request => {
                let node = node.clone();
                let relay = relay.to_string();
                tokio::spawn(async move { answer_request(&node, &relay, packet_id, entry).await });
            }
        }
    }
}

/// Run a drained request and post the `{status, result}` envelope back to
/// its originator.
async fn answer_request(node: &Node, drained_from: &str, packet_id: String, entry: BufferEntry) {
    let request = match node.codec().decode_json::<CommandRequest>(&entry.data) {
        Ok(request) => request,
        Err(e) => {
            warn!("Dropping undecodable request {packet_id} from {}: {e}", entry.originator);
            return;
        }
    };
    debug!(
        "Relay request {packet_id}: {} from {}",
        request.command_path, request.initiator
    );

    let (status, result) =
        dispatch_command(node, Origin::Relay(drained_from.to_string()), request).await;
    let token = match node.codec().encode_json(&RelayResponse { status, result }) {
        Ok(token) => token,
        Err(e) => {
            warn!("Could not encode response {packet_id}: {e}");
            return;
        }
    };

    let reply_via = if entry.remote.is_empty() {
        drained_from.to_string()
    } else {
        normalize_relay(&entry.remote)
    };
    let posted = post_packet(
        node,
        &reply_via,
        &entry.originator,
        &packet_id,
        token.clone(),
        PacketKind::Response,
    )
    .await;

    if let Err(e) = posted {
        if reply_via == drained_from {
            warn!("Could not return response {packet_id} via {reply_via}: {e}");
            return;
        }
        debug!("Response {packet_id} via {reply_via} failed ({e}), using {drained_from}");
        if let Err(e) = post_packet(
            node,
            drained_from,
            &entry.originator,
            &packet_id,
            token,
            PacketKind::Response,
        )
        .await
        {
            warn!("Could not return response {packet_id} via {drained_from}: {e}");
        }
    }
}

async fn post_packet(
    node: &Node,
    relay: &str,
    target: &str,
    packet_id: &str,
    token: String,
    kind: PacketKind,
) -> Result<(), NetworkError> {
    let identity = node.identity();
    let body = SendRequest {
        target: target.to_string(),
        data: token,
        packet_id: packet_id.to_string(),
        originator: identity.name.clone(),
        r_type: kind,
        remote_addr: relay.to_string(),
        originator_network: Some(identity.network.clone()),
    };
    let response = node
        .http()
        .post(format!("{relay}/send"))
        .json(&body)
        .timeout(RELAY_REQUEST_TIMEOUT)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(NetworkError::Transport(format!(
            "relay {relay} refused packet with {status}: {detail}"
        )));
    }
    Ok(())
}

/// Send an encoded request to `target` through one of its relays and wait
/// for the reply.
///
/// A relay that cannot take the packet is removed from the target's routes
/// and another is tried. Once no route is left the target is evicted.
pub(crate) async fn request_via_relays(
    node: &Node,
    target: &str,
    token: &str,
    timeout: Option<Duration>,
) -> Result<RelayResponse, NetworkError> {
    loop {
        let Some(relay) = node.remote_peers().pick_route(target) else {
            node.remote_peers().evict(target);
            return Err(NetworkError::PeerNotFound(target.to_string()));
        };

        let packet_id = new_packet_id();
        let waiter = node.pending().register(&packet_id);
        let posted = post_packet(
            node,
            &relay,
            target,
            &packet_id,
            token.to_string(),
            PacketKind::Request,
        )
        .await;
        if let Err(e) = posted {
            node.pending().cancel(&packet_id);
            warn!("Relay {relay} failed for {target}, trying another route: {e}");
            node.remote_peers().remove_route(target, &relay);
            continue;
        }
        debug!("Request {packet_id} for {target} posted via {relay}");

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, waiter).await {
                Ok(received) => received,
                Err(_) => {
                    node.pending().cancel(&packet_id);
                    return Err(NetworkError::Timeout(limit));
                }
            },
            None => waiter.await,
        };
        return received.map_err(|_| NetworkError::NotRunning);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok(result: serde_json::Value) -> RelayResponse {
        RelayResponse { status: 200, result }
    }

    #[test]
    fn test_packet_ids_are_unique_hex() {
        let ids: BTreeSet<String> = (0..1000).map(|_| new_packet_id()).collect();
        assert_eq!(ids.len(), 1000);
        for id in &ids {
            assert_eq!(id.len(), 64);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_normalize_relay() {
        assert_eq!(normalize_relay("10.0.0.1:8000"), "http://10.0.0.1:8000");
        assert_eq!(normalize_relay("http://10.0.0.1:8000/"), "http://10.0.0.1:8000");
        assert_eq!(normalize_relay(" https://relay.example "), "https://relay.example");
    }

    #[test]
    fn test_relay_set_cap_and_flags() {
        let relays = RelaySet::new(2);
        assert!(relays.adopt("http://r1", true));
        assert!(!relays.adopt("http://r1", false), "already known");
        assert!(relays.adopt("http://r2", false));
        assert!(!relays.adopt("http://r3", false), "cap reached");
        assert_eq!(relays.len(), 2);

        assert!(relays.keeps_alive("http://r1"));
        assert!(!relays.keeps_alive("http://r2"));
        assert!(!relays.is_active("http://r1"));
        relays.set_active("http://r1", true);
        assert!(relays.is_active("http://r1"));

        relays.remove("http://r2");
        assert!(relays.adopt("http://r3", false));
    }

    #[tokio::test]
    async fn test_resolve_consumes_waiter() {
        let pending = PendingResponses::new();
        let rx = pending.register("p1");
        assert!(pending.contains("p1"));

        assert!(pending.resolve("p1", ok(json!(5))));
        assert!(!pending.contains("p1"));
        assert_eq!(rx.await.unwrap().result, json!(5));

        assert!(!pending.resolve("p1", ok(json!(6))), "duplicate dropped");
    }

    #[tokio::test]
    async fn test_cancel_and_late_response() {
        let pending = PendingResponses::new();
        let rx = pending.register("p1");
        pending.cancel("p1");
        assert!(pending.is_empty());
        assert!(rx.await.is_err());
        assert!(!pending.resolve("p1", ok(json!(1))));
    }

    fn quiet_node(name: &str) -> Node {
        let mut config =
            crate::config::NodeConfig::new(name, "lab", crate::codec::NetworkKey::generate());
        config.discovery_enabled = false;
        config.bind_ip = "127.0.0.1".parse().unwrap();
        config.ports = vec![0, 0];
        Node::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_absorb_ping_merges_state() {
        let node = quiet_node("a");
        node.remote_peers().add_route("gone", "http://r1");
        let waiter = node.pending().register("p1");
        let token = node.codec().encode_json(&ok(json!("done"))).unwrap();

        absorb_ping(
            &node,
            "http://r1",
            PingResponse {
                peers: vec!["a".into(), "b".into()],
                servers: vec!["10.0.0.9:8000/".into()],
                buffer: BTreeMap::from([(
                    "p1".to_string(),
                    BufferEntry {
                        originator: "b".into(),
                        data: token,
                        kind: PacketKind::Response,
                        remote: "http://r1".into(),
                    },
                )]),
            },
        );

        assert!(!node.remote_peers().contains("a"), "never routes to itself");
        assert_eq!(node.remote_peers().routes("b"), vec!["http://r1".to_string()]);
        assert!(!node.remote_peers().contains("gone"));
        assert!(node.relays().contains("http://10.0.0.9:8000"));
        assert!(!node.relays().keeps_alive("http://10.0.0.9:8000"));
        assert_eq!(waiter.await.unwrap().result, json!("done"));
        assert!(node.pending().is_empty());
    }

    #[tokio::test]
    async fn test_gossiped_relay_dropped_on_failure() {
        let node = quiet_node("a");
        node.start().await.unwrap();

        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = format!("http://{}", closed.local_addr().unwrap());
        drop(closed);
        assert!(node.relays().adopt(&dead, false));
        node.remote_peers().add_route("b", &dead);

        keepalive_loop(node.clone(), dead.clone()).await;

        assert!(!node.relays().contains(&dead));
        assert!(!node.remote_peers().contains("b"));
        node.stop().await;
    }

    #[tokio::test]
    async fn test_clear_closes_waiters() {
        let pending = PendingResponses::new();
        let a = pending.register("a");
        let b = pending.register("b");
        pending.clear();
        assert!(a.await.is_err());
        assert!(b.await.is_err());
    }
}
