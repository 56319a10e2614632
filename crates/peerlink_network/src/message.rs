//! Wire protocol: command envelopes and the relay's JSON bodies.
//!
//! Command envelopes ([`CommandRequest`], [`LocalResponse`],
//! [`RelayResponse`]) only ever travel encrypted through the
//! [`Codec`](crate::codec::Codec). The relay bodies ([`PingRequest`],
//! [`SendRequest`], ...) are plain JSON whose `data` fields carry codec tokens.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A command invocation sent to a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub timestamp: DateTime<Utc>,
    /// Dotted path into the receiver's command registry.
    #[serde(rename = "command")]
    pub command_path: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// `"{network}.{name}"` of the sender.
    pub initiator: String,
}

impl CommandRequest {
    pub fn new(
        command_path: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        initiator: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            command_path: command_path.into(),
            args,
            kwargs,
            initiator: initiator.into(),
        }
    }
}

/// Response body of the local HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalResponse {
    pub timestamp: DateTime<Utc>,
    pub response: Value,
}

impl LocalResponse {
    pub fn new(response: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            response,
        }
    }
}

/// Response envelope carried back through a relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayResponse {
    pub status: u16,
    pub result: Value,
}

/// Whether a buffered relay packet asks for work or answers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketKind {
    Response,
    /// Anything that is not a response is treated as a request.
    #[serde(other)]
    Request,
}

/// A packet waiting in a relay buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferEntry {
    pub originator: String,
    /// Codec token.
    pub data: String,
    #[serde(rename = "type")]
    pub kind: PacketKind,
    /// Relay address the originator posted through.
    #[serde(default)]
    pub remote: String,
}

/// `POST /ping` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest {
    pub node_name: String,
    pub node_network: String,
    #[serde(default)]
    pub known_servers: Vec<String>,
}

/// `POST /ping` reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingResponse {
    /// Every node registered in the caller's network, caller included.
    pub peers: Vec<String>,
    /// Alternate relays known to this relay.
    pub servers: Vec<String>,
    /// Packets drained from the caller's buffer, keyed by packet id.
    pub buffer: BTreeMap<String, BufferEntry>,
}

/// `POST /send` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub target: String,
    pub data: String,
    pub packet_id: String,
    pub originator: String,
    pub r_type: PacketKind,
    #[serde(default)]
    pub remote_addr: String,
    /// Network of the originator. When absent the relay falls back to
    /// looking the originator up by name across all networks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originator_network: Option<String>,
}

/// `POST /send` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    pub pid: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_uses_command_field() {
        let req = CommandRequest::new("math.add", vec![2.into(), 3.into()], Map::new(), "lab.a");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["command"], "math.add");
        assert_eq!(json["initiator"], "lab.a");
        assert!(json.get("command_path").is_none());
    }

    #[test]
    fn test_request_defaults_missing_args() {
        let req: CommandRequest = serde_json::from_str(
            r#"{"timestamp":"2024-01-01T00:00:00Z","command":"__echo__","initiator":"lab.a"}"#,
        )
        .unwrap();
        assert!(req.args.is_empty());
        assert!(req.kwargs.is_empty());
    }

    #[test]
    fn test_buffer_entry_wire_shape() {
        let entry: BufferEntry = serde_json::from_str(
            r#"{"originator":"a","data":"tok","type":"response","remote":"http://r:1"}"#,
        )
        .unwrap();
        assert_eq!(entry.kind, PacketKind::Response);

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "response");
    }

    #[test]
    fn test_unknown_packet_kind_is_request() {
        let kind: PacketKind = serde_json::from_str(r#""command""#).unwrap();
        assert_eq!(kind, PacketKind::Request);
        assert_eq!(serde_json::to_string(&PacketKind::Request).unwrap(), r#""request""#);
    }

    #[test]
    fn test_send_request_without_network() {
        let req: SendRequest = serde_json::from_str(
            r#"{"target":"b","data":"x","packet_id":"p","originator":"a","r_type":"request","remote_addr":""}"#,
        )
        .unwrap();
        assert!(req.originator_network.is_none());
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("originator_network").is_none());
    }
}
