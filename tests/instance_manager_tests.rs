//! End-to-end instance manager scenarios: lifecycle and port exhaustion.

use std::time::Duration;

use lsdamm_mesh::instance_manager::{InstanceManager, InstanceManagerConfig, MAX_INSTANCES};
use lsdamm_mesh::membership::EngineConfig;
use lsdamm_mesh::Error;

fn manager_with_ports(start: u16, end: u16) -> InstanceManager {
    InstanceManager::new(InstanceManagerConfig {
        bind_addr: "127.0.0.1".to_string(),
        port_range_start: start,
        port_range_end: end,
        coordinator_tick_interval: Duration::from_millis(20),
        engine_config: EngineConfig {
            gossip_interval: Duration::from_millis(30),
            probe_timeout: Duration::from_millis(60),
            suspect_timeout: Duration::from_millis(150),
            indirect_fanout: 2,
            sync_every: 5,
        },
        ..Default::default()
    })
}

#[tokio::test]
async fn start_and_stop_drives_the_owned_engine_and_coordinator() {
    let manager = manager_with_ports(0, 5);
    manager.create_node("node-a").await.unwrap();
    manager.start_node("node-a").unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let coordinator = manager.get_coordinator("node-a").unwrap();
    // A single instance with no peers self-elects leader within a few ticks.
    assert_eq!(coordinator.role().await, lsdamm_mesh::types::Role::Leader);

    manager.stop_node("node-a").unwrap();
    assert!(manager.stop_node("node-a").is_err());
}

#[tokio::test]
async fn port_pool_exhaustion_surfaces_as_instance_manager_error() {
    // Two ports (membership + app) per instance: a range of 4 fits exactly
    // two instances before the pool is exhausted.
    let manager = manager_with_ports(0, 4);
    manager.create_node("node-a").await.unwrap();
    manager.create_node("node-b").await.unwrap();
    let err = manager.create_node("node-c").await.unwrap_err();
    assert!(matches!(err, Error::InstanceManager { .. }));
}

#[tokio::test]
async fn sixteen_instances_is_the_hard_cap_regardless_of_port_range() {
    let manager = manager_with_ports(0, 1000);
    for i in 0..MAX_INSTANCES {
        manager.create_node(format!("node-{i}")).await.unwrap();
    }
    let err = manager.create_node("one-too-many").await.unwrap_err();
    assert!(matches!(err, Error::InstanceManager { .. }));
}
