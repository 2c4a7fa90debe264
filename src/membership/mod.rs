//! SWIM-style gossip membership and failure detection.

pub mod engine;
pub mod node;

pub use engine::{Engine, EngineConfig, EngineStats, MAX_NODES};
pub use node::Node;
