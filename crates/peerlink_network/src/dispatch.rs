//! Command submission: target expansion, per-target routing and the bounded
//! fan-out across many targets.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::NetworkError;
use crate::message::{CommandRequest, LocalResponse};
use crate::node::Node;
use crate::remote::request_via_relays;
use crate::transport::post_command;

/// Who a command is sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Every peer currently known, locally or through a relay.
    All,
    One(String),
    /// An explicit list. Empty means [`Target::All`].
    Many(Vec<String>),
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        if name == "*" {
            Target::All
        } else {
            Target::One(name.to_string())
        }
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Target::from(name.as_str())
    }
}

impl From<Vec<String>> for Target {
    fn from(names: Vec<String>) -> Self {
        Target::Many(names)
    }
}

impl From<&[&str]> for Target {
    fn from(names: &[&str]) -> Self {
        Target::Many(names.iter().map(|n| n.to_string()).collect())
    }
}

/// Per-call knobs for [`Node::command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOptions {
    /// Surface failures of a single-target call as errors instead of `None`.
    pub raise_errors: bool,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            raise_errors: false,
            timeout: Some(Duration::from_secs(4)),
        }
    }
}

impl CommandOptions {
    pub fn raising(mut self) -> Self {
        self.raise_errors = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// What a command call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// The target list expanded to exactly one name.
    Single(Option<Value>),
    /// Per-target results. Unknown names are absent; unreachable targets
    /// and failed commands map to `None`.
    Multi(BTreeMap<String, Option<Value>>),
}

impl CommandOutcome {
    /// The value of a single-target call. `None` for multi-target outcomes.
    pub fn single(self) -> Option<Value> {
        match self {
            CommandOutcome::Single(value) => value,
            CommandOutcome::Multi(_) => None,
        }
    }

    /// The per-target map of a multi-target call. Empty for single-target
    /// outcomes.
    pub fn multi(self) -> BTreeMap<String, Option<Value>> {
        match self {
            CommandOutcome::Single(_) => BTreeMap::new(),
            CommandOutcome::Multi(map) => map,
        }
    }
}

/// Resolve a [`Target`] to the names it covers.
pub(crate) fn expand_targets(node: &Node, target: &Target) -> Vec<String> {
    match target {
        Target::One(name) => vec![name.clone()],
        Target::Many(names) if !names.is_empty() => names.clone(),
        Target::All | Target::Many(_) => {
            let mut known: BTreeSet<String> = node.local_peers().names().into_iter().collect();
            known.extend(node.remote_peers().names());
            known.into_iter().collect()
        }
    }
}

/// Run `command_path` on every target, at most `fan_out_workers` at a time.
pub(crate) async fn fan_out(
    node: &Node,
    command_path: &str,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    target: Target,
    options: CommandOptions,
) -> Result<CommandOutcome, NetworkError> {
    let names = expand_targets(node, &target);
    let request = CommandRequest::new(command_path, args, kwargs, node.identity().initiator());
    let token = node.codec().encode_json(&request)?;

    if let [name] = names.as_slice() {
        return match call_target(node, name, &token, options.timeout).await {
            Ok(value) => Ok(CommandOutcome::Single(Some(value))),
            Err(e) if options.raise_errors => Err(e),
            Err(e) => {
                warn!("Command {command_path} on {name} failed: {e}");
                Ok(CommandOutcome::Single(None))
            }
        };
    }

    let workers = node.config().fan_out_workers.max(1);
    let token = token.as_str();
    let results: Vec<(String, Result<Value, NetworkError>)> = futures::stream::iter(names)
        .map(|name| async move {
            let result = call_target(node, &name, token, options.timeout).await;
            (name, result)
        })
        .buffer_unordered(workers)
        .collect()
        .await;

    let mut outcome = BTreeMap::new();
    for (name, result) in results {
        match result {
            Ok(value) => {
                outcome.insert(name, Some(value));
            }
            Err(NetworkError::PeerNotFound(_)) => {
                debug!("Skipping unknown target {name}");
            }
            Err(e) => {
                warn!("Command {command_path} on {name} failed: {e}");
                outcome.insert(name, None);
            }
        }
    }
    Ok(CommandOutcome::Multi(outcome))
}

/// Route one encoded request: local table first, then relays.
async fn call_target(
    node: &Node,
    target: &str,
    token: &str,
    timeout: Option<Duration>,
) -> Result<Value, NetworkError> {
    if let Some(addr) = node.local_peers().get(target) {
        debug!("Sending to {target} directly at {addr}");
        let (status, body) = post_command(node.http(), addr, token.to_string(), timeout)
            .await
            .map_err(|e| match timeout {
                Some(limit) if e.is_timeout() => NetworkError::Timeout(limit),
                _ => NetworkError::from(e),
            })?;
        let reply: LocalResponse = node.codec().decode_json(&body)?;
        return interpret(target, status, reply.response);
    }

    if node.remote_peers().contains(target) {
        debug!("Sending to {target} through relays");
        let reply = request_via_relays(node, target, token, timeout).await?;
        return interpret(target, reply.status, reply.result);
    }

    Err(NetworkError::PeerNotFound(target.to_string()))
}

fn interpret(target: &str, status: u16, result: Value) -> Result<Value, NetworkError> {
    if status == 200 {
        return Ok(result);
    }
    let detail = match result {
        Value::String(text) => text,
        other => other.to_string(),
    };
    Err(NetworkError::CommandFailed {
        target: target.to_string(),
        status,
        detail,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::NetworkKey;
    use crate::config::NodeConfig;
    use serde_json::json;
    use std::collections::HashMap;

    fn quiet_node(name: &str) -> Node {
        let mut config = NodeConfig::new(name, "lab", NetworkKey::generate());
        config.discovery_enabled = false;
        Node::new(config).unwrap()
    }

    #[test]
    fn test_target_conversions() {
        assert_eq!(Target::from("*"), Target::All);
        assert_eq!(Target::from("b"), Target::One("b".into()));
        assert_eq!(
            Target::from(vec!["a".to_string(), "b".to_string()]),
            Target::Many(vec!["a".into(), "b".into()])
        );
        assert_eq!(
            Target::from(&["x", "y"][..]),
            Target::Many(vec!["x".into(), "y".into()])
        );
    }

    #[test]
    fn test_default_options() {
        let options = CommandOptions::default();
        assert!(!options.raise_errors);
        assert_eq!(options.timeout, Some(Duration::from_secs(4)));
        assert!(options.raising().raise_errors);
        assert_eq!(options.with_timeout(None).timeout, None);
    }

    #[test]
    fn test_expand_all_dedups_local_and_remote() {
        let node = quiet_node("a");
        node.local_peers().replace(HashMap::from([
            ("c".to_string(), "127.0.0.1:1".parse().unwrap()),
            ("b".to_string(), "127.0.0.1:2".parse().unwrap()),
        ]));
        node.remote_peers().add_route("b", "http://r1");
        node.remote_peers().add_route("d", "http://r1");

        let all = expand_targets(&node, &Target::All);
        assert_eq!(all, vec!["b", "c", "d"]);
        assert_eq!(expand_targets(&node, &Target::Many(vec![])), all);
        assert_eq!(
            expand_targets(&node, &Target::Many(vec!["zz".into()])),
            vec!["zz"]
        );
    }

    #[test]
    fn test_interpret_status() {
        assert_eq!(interpret("b", 200, json!(5)).unwrap(), json!(5));
        match interpret("b", 404, json!("CMD \"x\" NOT FOUND")) {
            Err(NetworkError::CommandFailed { status, detail, .. }) => {
                assert_eq!(status, 404);
                assert_eq!(detail, "CMD \"x\" NOT FOUND");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_outcome_accessors() {
        assert_eq!(CommandOutcome::Single(Some(json!(1))).single(), Some(json!(1)));
        assert!(CommandOutcome::Single(None).multi().is_empty());
        let map = BTreeMap::from([("b".to_string(), None)]);
        assert_eq!(CommandOutcome::Multi(map.clone()).multi(), map);
    }

    #[tokio::test]
    async fn test_unknown_targets() {
        let node = quiet_node("a");

        let outcome = fan_out(&node, "x", vec![], Map::new(), "ghost".into(), CommandOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, CommandOutcome::Single(None));

        let err = fan_out(
            &node,
            "x",
            vec![],
            Map::new(),
            "ghost".into(),
            CommandOptions::default().raising(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NetworkError::PeerNotFound(name) if name == "ghost"));

        let outcome = fan_out(
            &node,
            "x",
            vec![],
            Map::new(),
            Target::Many(vec!["g1".into(), "g2".into()]),
            CommandOptions::default().raising(),
        )
        .await
        .unwrap();
        assert_eq!(outcome, CommandOutcome::Multi(BTreeMap::new()));
    }

    #[tokio::test]
    async fn test_unreachable_local_peer_is_none() {
        let node = quiet_node("a");
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = closed.local_addr().unwrap();
        drop(closed);
        node.local_peers()
            .replace(HashMap::from([("b".to_string(), dead), ("c".to_string(), dead)]));

        let outcome = fan_out(&node, "x", vec![], Map::new(), Target::All, CommandOptions::default())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CommandOutcome::Multi(BTreeMap::from([
                ("b".to_string(), None),
                ("c".to_string(), None),
            ]))
        );
    }
}
