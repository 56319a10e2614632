//! PeerLink Network: an encrypted peer-to-peer command overlay.
//!
//! Nodes of one network share a symmetric key, find each other on the LAN
//! and call each other's registered commands. Peers that cannot be reached
//! directly are reached through relay servers that buffer packets until the
//! target's next keepalive ping.
//!
//! # Architecture
//!
//! - **Codec**: AES-256-GCM tokens (`base64(nonce || ciphertext)`) carry
//!   every command envelope.
//! - **Commands**: a tree of async handlers addressed by dotted paths.
//! - **Discovery**: UDP broadcast on the LAN, collected in fixed windows.
//! - **Transport**: one HTTP `POST /` endpoint per node.
//! - **Relay**: store-and-forward server (`/ping`, `/send`) plus the
//!   node-side keepalive and packet correlation.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use peerlink_network::{CommandNode, CommandTree, Node, NodeConfig, NetworkKey, sync_handler};
//! use serde_json::{Map, json};
//!
//! # async fn example() -> Result<(), peerlink_network::NetworkError> {
//! let config = NodeConfig::new("alpha", "lab", NetworkKey::generate());
//! let node = Node::new(config)?;
//! node.register_commands(
//!     CommandTree::from([(
//!         "math".to_string(),
//!         CommandNode::branch([(
//!             "add",
//!             CommandNode::leaf(sync_handler(|_, args, _| {
//!                 Ok(json!(args.iter().filter_map(|v| v.as_i64()).sum::<i64>()))
//!             })),
//!         )]),
//!     )]),
//!     None,
//! )?;
//!
//! node.start().await?;
//! let sum = node
//!     .command("math.add", vec![json!(2), json!(3)], Map::new(), "beta", node.default_options())
//!     .await?
//!     .single();
//! node.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod commands;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod logging;
pub mod message;
pub mod node;
pub mod peer;
pub mod relay;
pub mod remote;
pub mod transport;

// ── Re-exports ──────────────────────────────────────────

pub use codec::{Codec, DecodeError, EncodeError, NetworkKey};
pub use commands::{
    CommandContext, CommandError, CommandHandler, CommandNode, CommandRegistry, CommandTree,
    HandlerResult, Origin, handler, sync_handler,
};
pub use config::NodeConfig;
pub use dispatch::{CommandOptions, CommandOutcome, Target};
pub use error::NetworkError;
pub use identity::NodeIdentity;
pub use node::Node;
pub use relay::{RelayConfig, RelayError, RelayService, RelayState};
