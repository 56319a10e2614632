//! Node identity, the `(network, name)` pair every node carries.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// Characters used as separators in discovery datagrams and initiator
/// strings; forbidden in names.
pub const RESERVED_CHARS: [char; 3] = ['.', '|', ':'];

/// The identity of a node: its network and its name within that network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub network: String,
    pub name: String,
}

impl NodeIdentity {
    /// Build an identity, rejecting empty names and reserved characters.
    pub fn new(network: impl Into<String>, name: impl Into<String>) -> Result<Self, NetworkError> {
        let network = network.into();
        let name = name.into();
        validate_component("Node", &name)?;
        validate_component("Network", &network)?;
        Ok(Self { network, name })
    }

    /// The `initiator` string carried in request envelopes.
    pub fn initiator(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.network, self.name)
    }
}

fn validate_component(kind: &str, value: &str) -> Result<(), NetworkError> {
    if value.is_empty() {
        return Err(NetworkError::Validation(format!("{kind} name must not be empty")));
    }
    if value.contains(RESERVED_CHARS) {
        return Err(NetworkError::Validation(format!(
            "{kind} name {value} contains reserved characters (\".\", \"|\", or \":\")"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identity() {
        let id = NodeIdentity::new("lab", "node-1").unwrap();
        assert_eq!(id.initiator(), "lab.node-1");
        assert_eq!(format!("{id}"), "lab.node-1");
    }

    #[test]
    fn test_reserved_characters_rejected() {
        for bad in ["a.b", "a|b", "a:b"] {
            assert!(matches!(
                NodeIdentity::new("lab", bad),
                Err(NetworkError::Validation(_))
            ));
            assert!(matches!(
                NodeIdentity::new(bad, "node"),
                Err(NetworkError::Validation(_))
            ));
        }
    }

    #[test]
    fn test_empty_rejected() {
        assert!(NodeIdentity::new("", "node").is_err());
        assert!(NodeIdentity::new("lab", "").is_err());
    }
}
