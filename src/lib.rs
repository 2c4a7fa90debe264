//! LSDAMM mesh: SWIM-style cluster membership, leader election, and
//! instance management for a self-healing peer mesh.
//!
//! Four components, leaves-first:
//!
//! - [`membership`] — gossip-based failure detection (SWIM).
//! - [`coordinator`] — leader election and a task queue, built on a
//!   membership engine.
//! - [`instance_manager`] — owns a shared UDP port pool and any number of
//!   (engine, coordinator) pairs on one process, up to
//!   [`instance_manager::MAX_INSTANCES`].
//! - [`transport`] — a narrow byte-stream boundary to a single remote
//!   endpoint, off the membership/election critical path.
//!
//! Datagrams flow into the Membership Engine, which updates its node table
//! and raises events; the Coordinator consumes the engine's state on each
//! `tick`, elects, and drains queued tasks while Leader.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod instance_manager;
pub mod membership;
pub mod transport;
pub mod types;
pub mod wire;

pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorCallbacks, CoordinatorConfig};
pub use error::{Error, Result};
pub use instance_manager::{InstanceConfig, InstanceManager, InstanceManagerConfig};
pub use membership::{Engine, EngineConfig};
pub use transport::{Transport, TransportCallbacks, WebSocketTransport};

/// Initialize the process-wide `tracing` subscriber once, honoring the
/// config's `logging.log_level` and `logging.log_file`. Writes to stdout
/// when `log_file` is empty, matching the original's file-or-stdout choice.
///
/// Returns an error if a subscriber is already installed; callers that need
/// to set one up more than once (tests) should use
/// `tracing_subscriber`'s own test harness instead of calling this twice.
pub fn init_logging(config: &config::LoggingConfig) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = if config.log_file.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    } else {
        // A plain appender is enough here: rotation and structured sinks are
        // collaborator concerns, not this crate's.
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_file)
            .map_err(|e| Error::io(format!("opening log file {}", config.log_file), e))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .try_init()
    };

    result.map_err(|e| Error::Config {
        message: format!("logging subscriber already initialized: {e}"),
        field: Some("logging.log_level".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn instance_manager_wires_a_working_engine() {
        let manager = InstanceManager::new(InstanceManagerConfig {
            bind_addr: "127.0.0.1".to_string(),
            port_range_start: 0,
            port_range_end: 5,
            ..Default::default()
        });
        manager.create_node("node-a").await.unwrap();
        manager.start_node("node-a").unwrap();
        let engine = manager.get_engine("node-a").unwrap();
        let local = engine.get_local().await;
        assert_eq!(local.id, "node-a");
        manager.stop_node("node-a").unwrap();
    }
}
