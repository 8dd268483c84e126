//! Core routing fabric for the swarmcast CDN: the local track registry,
//! the shared DHT directory, the relay resolver, and the WebRTC
//! signalling bridge.
//!
//! See `DESIGN.md` at the workspace root for the grounding ledger.

pub mod directory;
pub mod error;
pub mod registry;
pub mod resolver;
pub mod rpc_client;
pub mod signalling;
pub mod sink;
pub mod subscribers;
pub mod track;
pub mod types;

pub use error::{Error, Result};
