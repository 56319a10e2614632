//! Command registry: a tree of named handlers addressed by dotted paths.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::node::Node;

/// What a handler produces: a JSON result, or a failure that the transport
/// reports back to the caller as a 500.
pub type HandlerResult = anyhow::Result<Value>;

/// A registered command handler.
pub type CommandHandler = Arc<
    dyn Fn(CommandContext, Vec<Value>, Map<String, Value>) -> BoxFuture<'static, HandlerResult>
        + Send
        + Sync,
>;

/// Built-in command names, always present at the top level.
pub const ECHO: &str = "__echo__";
pub const LIST_COMMANDS: &str = "__list_commands__";
pub const PEERS: &str = "__peers__";
pub const RESERVED: [&str; 3] = [ECHO, LIST_COMMANDS, PEERS];

/// Registry failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The path does not resolve to a handler.
    #[error("CMD \"{0}\" NOT FOUND")]
    NotFound(String),

    /// The branch a registration targets does not exist.
    #[error("Unable to register at {0}: the path to it does not exist")]
    PathNotFound(String),

    /// A plain registration tried to replace a built-in.
    #[error("{0} is a reserved command; use override_builtin to replace it")]
    Reserved(String),

    /// A tree key that could never be addressed by a dotted path.
    #[error("Invalid command name {0:?}: names must be non-empty and contain no '.'")]
    InvalidSegment(String),
}

/// Where an inbound command came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Direct HTTP call from a LAN peer.
    Local(SocketAddr),
    /// Request drained from a relay buffer.
    Relay(String),
}

/// Passed to every handler invocation.
#[derive(Clone)]
pub struct CommandContext {
    /// `"{network}.{name}"` of the caller.
    pub initiator: String,
    pub origin: Origin,
    node: Node,
}

impl CommandContext {
    pub fn new(initiator: impl Into<String>, origin: Origin, node: Node) -> Self {
        Self {
            initiator: initiator.into(),
            origin,
            node,
        }
    }

    /// The node that is serving this call.
    pub fn node(&self) -> &Node {
        &self.node
    }
}

/// One node of the command tree.
#[derive(Clone)]
pub enum CommandNode {
    Leaf(CommandHandler),
    Branch(CommandTree),
}

/// Children of a branch, keyed by path segment.
pub type CommandTree = BTreeMap<String, CommandNode>;

impl CommandNode {
    pub fn leaf(handler: CommandHandler) -> Self {
        CommandNode::Leaf(handler)
    }

    /// Build a branch from `(segment, node)` pairs.
    pub fn branch<I, S>(children: I) -> Self
    where
        I: IntoIterator<Item = (S, CommandNode)>,
        S: Into<String>,
    {
        CommandNode::Branch(children.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl fmt::Debug for CommandNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandNode::Leaf(_) => f.write_str("Leaf"),
            CommandNode::Branch(children) => f.debug_map().entries(children.iter()).finish(),
        }
    }
}

/// Wrap an async function as a [`CommandHandler`].
pub fn handler<F, Fut>(f: F) -> CommandHandler
where
    F: Fn(CommandContext, Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(
        move |ctx: CommandContext,
              args: Vec<Value>,
              kwargs: Map<String, Value>|
              -> BoxFuture<'static, HandlerResult> { Box::pin(f(ctx, args, kwargs)) },
    )
}

/// Wrap a synchronous function as a [`CommandHandler`].
pub fn sync_handler<F>(f: F) -> CommandHandler
where
    F: Fn(&CommandContext, &[Value], &Map<String, Value>) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(
        move |ctx: CommandContext,
              args: Vec<Value>,
              kwargs: Map<String, Value>|
              -> BoxFuture<'static, HandlerResult> {
            let result = f(&ctx, &args, &kwargs);
            Box::pin(async move { result })
        },
    )
}

/// The registry of commands a node serves.
pub struct CommandRegistry {
    root: CommandTree,
}

impl CommandRegistry {
    /// An empty registry, without the built-ins.
    pub fn new() -> Self {
        Self {
            root: CommandTree::new(),
        }
    }

    /// A registry holding `__echo__`, `__list_commands__` and `__peers__`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.root.insert(ECHO.to_string(), CommandNode::Leaf(echo_handler()));
        registry
            .root
            .insert(LIST_COMMANDS.to_string(), CommandNode::Leaf(list_commands_handler()));
        registry.root.insert(PEERS.to_string(), CommandNode::Leaf(peers_handler()));
        registry
    }

    /// Register `handler` at a dotted `path`, overwriting an existing entry.
    ///
    /// Every segment before the last must already exist as a branch;
    /// intermediate branches are never created implicitly.
    pub fn register(&mut self, path: &str, handler: CommandHandler) -> Result<(), CommandError> {
        let segments = split_path(path).ok_or_else(|| CommandError::PathNotFound(path.into()))?;
        let Some((last, parents)) = segments.split_last() else {
            return Err(CommandError::PathNotFound(path.into()));
        };
        if parents.is_empty() && RESERVED.contains(last) {
            return Err(CommandError::Reserved(path.into()));
        }

        let branch = branch_mut(&mut self.root, parents, path)?;
        branch.insert(last.to_string(), CommandNode::Leaf(handler));
        debug!("Registered command {path}");
        Ok(())
    }

    /// Deliberately replace one of the built-in commands.
    pub fn override_builtin(&mut self, name: &str, handler: CommandHandler) -> Result<(), CommandError> {
        if !RESERVED.contains(&name) {
            return Err(CommandError::NotFound(name.into()));
        }
        self.root.insert(name.to_string(), CommandNode::Leaf(handler));
        Ok(())
    }

    /// Install every entry of `tree`, at the root or under the existing
    /// branch named by `at`.
    pub fn register_tree(&mut self, tree: CommandTree, at: Option<&str>) -> Result<(), CommandError> {
        validate_tree(&tree)?;
        let branch = match at {
            None => {
                if let Some(name) = tree.keys().find(|k| RESERVED.contains(&k.as_str())) {
                    return Err(CommandError::Reserved(name.clone()));
                }
                &mut self.root
            }
            Some(path) => {
                let segments =
                    split_path(path).ok_or_else(|| CommandError::PathNotFound(path.into()))?;
                branch_mut(&mut self.root, &segments, path)?
            }
        };

        for (name, node) in tree {
            branch.insert(name, node);
        }
        Ok(())
    }

    /// Resolve a dotted path to its handler.
    pub fn resolve(&self, path: &str) -> Result<CommandHandler, CommandError> {
        let not_found = || CommandError::NotFound(path.to_string());
        let segments = split_path(path).ok_or_else(not_found)?;

        let mut current = &self.root;
        let mut found = None;
        for (i, segment) in segments.iter().enumerate() {
            match current.get(*segment) {
                Some(CommandNode::Branch(children)) => current = children,
                Some(CommandNode::Leaf(handler)) if i == segments.len() - 1 => {
                    found = Some(Arc::clone(handler));
                }
                _ => return Err(not_found()),
            }
        }
        found.ok_or_else(not_found)
    }

    /// Every leaf's full dotted path, depth first.
    pub fn list_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        collect_paths(&self.root, "", &mut paths);
        paths
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn split_path(path: &str) -> Option<Vec<&str>> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(segments)
}

fn validate_tree(tree: &CommandTree) -> Result<(), CommandError> {
    for (name, node) in tree {
        if name.is_empty() || name.contains('.') {
            return Err(CommandError::InvalidSegment(name.clone()));
        }
        if let CommandNode::Branch(children) = node {
            validate_tree(children)?;
        }
    }
    Ok(())
}

fn branch_mut<'a>(
    root: &'a mut CommandTree,
    segments: &[&str],
    full_path: &str,
) -> Result<&'a mut CommandTree, CommandError> {
    let mut current = root;
    for segment in segments {
        match current.get_mut(*segment) {
            Some(CommandNode::Branch(children)) => current = children,
            _ => return Err(CommandError::PathNotFound(full_path.to_string())),
        }
    }
    Ok(current)
}

fn collect_paths(tree: &CommandTree, prefix: &str, out: &mut Vec<String>) {
    for (name, node) in tree {
        match node {
            CommandNode::Leaf(_) => out.push(format!("{prefix}{name}")),
            CommandNode::Branch(children) => {
                collect_paths(children, &format!("{prefix}{name}."), out)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

fn echo_handler() -> CommandHandler {
    sync_handler(|_ctx, args, kwargs| {
        Ok(Value::String(format!(
            "Echoed args {} and kwargs {} at time [{}]",
            Value::Array(args.to_vec()),
            Value::Object(kwargs.clone()),
            chrono::Local::now().format("%a %b %e %H:%M:%S %Y"),
        )))
    })
}

fn list_commands_handler() -> CommandHandler {
    sync_handler(|ctx, _args, _kwargs| Ok(json!(ctx.node().command_paths())))
}

fn peers_handler() -> CommandHandler {
    sync_handler(|ctx, _args, _kwargs| {
        let node = ctx.node();
        let local: Map<String, Value> = node
            .local_peers()
            .snapshot()
            .into_iter()
            .map(|(name, addr)| (name, Value::String(addr.to_string())))
            .collect();
        let remote: Map<String, Value> = node
            .remote_peers()
            .snapshot()
            .into_iter()
            .map(|(name, relays)| (name, json!(relays)))
            .collect();
        Ok(json!({ "local": local, "remote": remote }))
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
