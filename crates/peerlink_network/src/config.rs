//! Configuration for a PeerLink node.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::NetworkKey;
use crate::error::NetworkError;
use crate::identity::NodeIdentity;

/// Configuration for a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Name of this node within its network.
    pub name: String,

    /// Name of the network this node belongs to.
    pub network: String,

    /// URL-safe base64 network key (see [`NetworkKey::generate`]).
    pub network_key: String,

    /// `[local server port, UDP advertising port]`.
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,

    /// Address the local HTTP server binds to.
    #[serde(default = "default_bind_ip")]
    pub bind_ip: IpAddr,

    /// Address advertised in discovery datagrams. Detected when unset.
    #[serde(default)]
    pub advertise_ip: Option<IpAddr>,

    /// Relay servers (`http://host:port`) kept alive for the node's lifetime.
    #[serde(default)]
    pub relays: Vec<String>,

    /// Upper bound on the number of relays, configured plus gossiped.
    #[serde(default = "default_max_remotes")]
    pub max_remotes: usize,

    /// Interval between keepalive pings to an active relay.
    #[serde(default = "default_keepalive_tick", with = "duration_ms_serde")]
    pub keepalive_tick: Duration,

    /// Whether LAN discovery (UDP broadcast) is enabled.
    #[serde(default = "default_true")]
    pub discovery_enabled: bool,

    /// Interval between discovery broadcasts.
    #[serde(default = "default_advertise_interval", with = "duration_ms_serde")]
    pub advertise_interval: Duration,

    /// Length of one discovery listening window.
    #[serde(default = "default_discovery_window", with = "duration_ms_serde")]
    pub discovery_window: Duration,

    /// Size of the fan-out worker pool.
    #[serde(default = "default_fan_out_workers")]
    pub fan_out_workers: usize,

    /// Default per-command timeout. `None` waits forever.
    #[serde(default = "default_timeout", with = "opt_duration_ms_serde")]
    pub default_timeout: Option<Duration>,
}

fn default_ports() -> Vec<u16> {
    vec![9470, 9471]
}

fn default_bind_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_max_remotes() -> usize {
    8
}

fn default_keepalive_tick() -> Duration {
    Duration::from_millis(500)
}

fn default_true() -> bool {
    true
}

fn default_advertise_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_discovery_window() -> Duration {
    Duration::from_millis(1500)
}

fn default_fan_out_workers() -> usize {
    16
}

fn default_timeout() -> Option<Duration> {
    Some(Duration::from_secs(4))
}

impl NodeConfig {
    /// A config with every optional setting at its default.
    pub fn new(
        name: impl Into<String>,
        network: impl Into<String>,
        network_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            network: network.into(),
            network_key: network_key.into(),
            ports: default_ports(),
            bind_ip: default_bind_ip(),
            advertise_ip: None,
            relays: Vec::new(),
            max_remotes: default_max_remotes(),
            keepalive_tick: default_keepalive_tick(),
            discovery_enabled: true,
            advertise_interval: default_advertise_interval(),
            discovery_window: default_discovery_window(),
            fan_out_workers: default_fan_out_workers(),
            default_timeout: default_timeout(),
        }
    }

    /// Check everything that can be checked before the node starts.
    pub fn validate(&self) -> Result<(NodeIdentity, NetworkKey), NetworkError> {
        let identity = NodeIdentity::new(&self.network, &self.name)?;
        if self.ports.len() != 2 {
            return Err(NetworkError::Validation(format!(
                "The list of ports to use must contain 2 values, got {}",
                self.ports.len()
            )));
        }
        if !self.relays.is_empty() && self.max_remotes == 0 {
            return Err(NetworkError::Validation(
                "max_remotes must be at least 1 when relays are configured".to_string(),
            ));
        }
        if self.max_remotes < self.relays.len() {
            return Err(NetworkError::Validation(format!(
                "max_remotes ({}) is lower than the number of configured relays ({})",
                self.max_remotes,
                self.relays.len()
            )));
        }
        for (setting, value) in [
            ("keepalive_tick", self.keepalive_tick),
            ("advertise_interval", self.advertise_interval),
            ("discovery_window", self.discovery_window),
        ] {
            if value.is_zero() {
                return Err(NetworkError::Validation(format!("{setting} must be non-zero")));
            }
        }
        if self.fan_out_workers == 0 {
            return Err(NetworkError::Validation(
                "fan_out_workers must be at least 1".to_string(),
            ));
        }
        let key = NetworkKey::parse(&self.network_key)?;
        Ok((identity, key))
    }

    /// Port of the local HTTP server.
    pub fn server_port(&self) -> u16 {
        self.ports.first().copied().unwrap_or_default()
    }

    /// UDP port used for discovery broadcasts.
    pub fn advertising_port(&self) -> u16 {
        self.ports.get(1).copied().unwrap_or_default()
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load a config from a JSON file. Unlike other settings files there is
    /// no usable default: a node needs a name and a key.
    pub fn load(path: &Path) -> Result<Self, NetworkError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

mod opt_duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match dur {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let ms = Option::<u64>::deserialize(d)?;
        Ok(ms.map(Duration::from_millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NodeConfig {
        NodeConfig::new("alpha", "lab", NetworkKey::generate())
    }

    #[test]
    fn test_default_config() {
        let config = config();
        assert_eq!(config.server_port(), 9470);
        assert_eq!(config.advertising_port(), 9471);
        assert!(config.discovery_enabled);
        assert_eq!(config.keepalive_tick, Duration::from_millis(500));
        assert_eq!(config.default_timeout, Some(Duration::from_secs(4)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_port_count_validated() {
        let mut config = config();
        config.ports = vec![9470];
        assert!(matches!(config.validate(), Err(NetworkError::Validation(_))));
        config.ports = vec![9470, 9471, 9472];
        assert!(matches!(config.validate(), Err(NetworkError::Validation(_))));
    }

    #[test]
    fn test_remote_cap_validated() {
        let mut config = config();
        config.relays = vec!["http://10.0.0.1:8000".into(), "http://10.0.0.2:8000".into()];
        config.max_remotes = 1;
        assert!(matches!(config.validate(), Err(NetworkError::Validation(_))));
        config.max_remotes = 0;
        assert!(matches!(config.validate(), Err(NetworkError::Validation(_))));
        config.max_remotes = 2;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut config = config();
        config.keepalive_tick = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(NetworkError::Validation(m)) if m.contains("keepalive_tick")
        ));

        let mut config = self::config();
        config.advertise_interval = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(NetworkError::Validation(m)) if m.contains("advertise_interval")
        ));

        let mut config = self::config();
        config.discovery_window = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(NetworkError::Validation(m)) if m.contains("discovery_window")
        ));

        let mut config = self::config();
        config.fan_out_workers = 0;
        assert!(matches!(config.validate(), Err(NetworkError::Validation(_))));

        let json = format!(
            r#"{{"name":"beta","network":"lab","network_key":"{}","keepalive_tick":0}}"#,
            NetworkKey::generate()
        );
        let loaded: NodeConfig = serde_json::from_str(&json).unwrap();
        assert!(loaded.validate().is_err());
    }

    #[test]
    fn test_bad_key_and_names_rejected() {
        let mut config = config();
        config.network_key = "short".into();
        assert!(config.validate().is_err());

        let mut config = self::config();
        config.name = "bad.name".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");

        let mut original = config();
        original.relays = vec!["http://relay.example:8000".into()];
        original.default_timeout = None;
        original.save_to_file(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.name, "alpha");
        assert_eq!(loaded.relays, original.relays);
        assert_eq!(loaded.default_timeout, None);
        assert_eq!(loaded.discovery_window, original.discovery_window);
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let json = format!(
            r#"{{"name":"beta","network":"lab","network_key":"{}"}}"#,
            NetworkKey::generate()
        );
        let config: NodeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.ports, vec![9470, 9471]);
        assert_eq!(config.max_remotes, 8);
        assert_eq!(config.default_timeout, Some(Duration::from_secs(4)));
    }
}
