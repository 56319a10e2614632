//! The relay's view of the world: `network -> node -> {last_seen, buffer}`.
//!
//! Plain data with no locking of its own; [`RelayService`](super::RelayService)
//! owns the one lock around it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::{BufferEntry, SendRequest};

/// A node registered on the relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerEntry {
    /// UNIX epoch seconds of the node's last ping.
    #[serde(alias = "timeout")]
    pub last_seen: f64,
    /// Packets waiting for the node, keyed by packet id.
    #[serde(default)]
    pub buffer: BTreeMap<String, BufferEntry>,
}

/// Why a `/send` was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendRejection {
    #[error("originator {0} is not in any known networks.")]
    UnknownOriginator(String),

    #[error("target {0} not found in peers.")]
    UnknownTarget(String),
}

/// Registered nodes and their buffers, grouped by network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayRegistry {
    networks: BTreeMap<String, BTreeMap<String, PeerEntry>>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert `name` in `network`, refresh its `last_seen` and take its
    /// buffer, leaving an empty one behind.
    ///
    /// Returns every node name in the network (caller included) together
    /// with the drained packets.
    pub fn ping(
        &mut self,
        network: &str,
        name: &str,
        now: f64,
    ) -> (Vec<String>, BTreeMap<String, BufferEntry>) {
        let members = self.networks.entry(network.to_string()).or_default();
        let entry = members.entry(name.to_string()).or_default();
        entry.last_seen = now;
        let drained = std::mem::take(&mut entry.buffer);
        (members.keys().cloned().collect(), drained)
    }

    /// The first network (in name order) holding a node called `name`.
    pub fn locate_network(&self, name: &str) -> Option<&str> {
        self.networks
            .iter()
            .find(|(_, members)| members.contains_key(name))
            .map(|(network, _)| network.as_str())
    }

    /// Buffer a packet for its target, replacing any packet with the same id.
    pub fn deliver(&mut self, request: &SendRequest) -> Result<(), SendRejection> {
        let network = match &request.originator_network {
            Some(network) => self
                .networks
                .get(network)
                .filter(|members| members.contains_key(&request.originator))
                .map(|_| network.clone()),
            None => self.locate_network(&request.originator).map(str::to_string),
        }
        .ok_or_else(|| SendRejection::UnknownOriginator(request.originator.clone()))?;

        let target = self
            .networks
            .get_mut(&network)
            .and_then(|members| members.get_mut(&request.target))
            .ok_or_else(|| SendRejection::UnknownTarget(request.target.clone()))?;

        target.buffer.insert(
            request.packet_id.clone(),
            BufferEntry {
                originator: request.originator.clone(),
                data: request.data.clone(),
                kind: request.r_type,
                remote: request.remote_addr.clone(),
            },
        );
        Ok(())
    }

    /// Drop nodes not seen for more than `clear_time` seconds, then any
    /// network left empty. Returns how many nodes were dropped.
    pub fn evict_stale(&mut self, now: f64, clear_time: f64) -> usize {
        let mut evicted = 0;
        self.networks.retain(|_, members| {
            let before = members.len();
            members.retain(|_, peer| now - peer.last_seen <= clear_time);
            evicted += before - members.len();
            !members.is_empty()
        });
        evicted
    }

    pub fn peer_names(&self, network: &str) -> Vec<String> {
        self.networks
            .get(network)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn peer(&self, network: &str, name: &str) -> Option<&PeerEntry> {
        self.networks.get(network)?.get(name)
    }

    pub fn network_count(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PacketKind;

    fn send(originator: &str, target: &str, packet_id: &str) -> SendRequest {
        SendRequest {
            target: target.into(),
            data: "token".into(),
            packet_id: packet_id.into(),
            originator: originator.into(),
            r_type: PacketKind::Request,
            remote_addr: "http://relay:8000".into(),
            originator_network: None,
        }
    }

    #[test]
    fn test_ping_registers_and_drains() {
        let mut registry = RelayRegistry::new();
        let (peers, buffer) = registry.ping("lab", "a", 10.0);
        assert_eq!(peers, vec!["a"]);
        assert!(buffer.is_empty());

        registry.ping("lab", "b", 10.0);
        registry.deliver(&send("a", "b", "p1")).unwrap();

        let (peers, buffer) = registry.ping("lab", "b", 11.0);
        assert_eq!(peers, vec!["a", "b"]);
        assert_eq!(buffer["p1"].originator, "a");
        assert_eq!(buffer["p1"].remote, "http://relay:8000");

        let (_, buffer) = registry.ping("lab", "b", 12.0);
        assert!(buffer.is_empty());
        assert_eq!(registry.peer("lab", "b").unwrap().last_seen, 12.0);
    }

    #[test]
    fn test_deliver_rejections() {
        let mut registry = RelayRegistry::new();
        registry.ping("lab", "a", 0.0);

        let err = registry.deliver(&send("ghost", "a", "p")).unwrap_err();
        assert_eq!(err.to_string(), "originator ghost is not in any known networks.");

        let err = registry.deliver(&send("a", "b", "p")).unwrap_err();
        assert_eq!(err.to_string(), "target b not found in peers.");
    }

    #[test]
    fn test_deliver_scoped_to_originator_network() {
        let mut registry = RelayRegistry::new();
        registry.ping("lab", "a", 0.0);
        registry.ping("prod", "b", 0.0);

        // Same relay, different networks: b is not a peer of a.
        assert_eq!(
            registry.deliver(&send("a", "b", "p")),
            Err(SendRejection::UnknownTarget("b".into()))
        );

        let mut request = send("a", "b", "p");
        request.originator_network = Some("prod".into());
        assert_eq!(
            registry.deliver(&request),
            Err(SendRejection::UnknownOriginator("a".into()))
        );
    }

    #[test]
    fn test_same_packet_id_replaces() {
        let mut registry = RelayRegistry::new();
        registry.ping("lab", "a", 0.0);
        registry.ping("lab", "b", 0.0);
        registry.deliver(&send("a", "b", "p")).unwrap();
        let mut second = send("a", "b", "p");
        second.data = "newer".into();
        registry.deliver(&second).unwrap();

        let (_, buffer) = registry.ping("lab", "b", 1.0);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer["p"].data, "newer");
    }

    #[test]
    fn test_evict_stale_nodes_and_networks() {
        let mut registry = RelayRegistry::new();
        registry.ping("lab", "old", 0.0);
        registry.ping("lab", "fresh", 1.0);
        registry.ping("empty-soon", "x", 0.0);

        assert_eq!(registry.evict_stale(2.0, 1.5), 2);
        assert_eq!(registry.peer_names("lab"), vec!["fresh"]);
        assert_eq!(registry.network_count(), 1);

        assert_eq!(registry.evict_stale(10.0, 1.5), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_persisted_shape_accepts_timeout_key() {
        let registry: RelayRegistry = serde_json::from_str(
            r#"{"lab":{"a":{"timeout":5.0,"buffer":{}}}}"#,
        )
        .unwrap();
        assert_eq!(registry.peer("lab", "a").unwrap().last_seen, 5.0);

        let json = serde_json::to_value(&registry).unwrap();
        assert_eq!(json["lab"]["a"]["last_seen"], 5.0);
    }
}
