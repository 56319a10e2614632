//! Relay server: a store-and-forward rendezvous for nodes that cannot reach
//! each other directly.
//!
//! Nodes register by pinging. Packets posted to `/send` wait in the target's
//! buffer until the target's next ping drains them.

mod registry;
mod service;
mod state;

pub use registry::{PeerEntry, RelayRegistry, SendRejection};
pub use service::{RelayService, epoch_now};
pub use state::{DEFAULT_CLEAR_TIME, RelayConfig, RelayError, RelayState};
