//! Multi-instance manager: owns a shared UDP port pool and a set of
//! (Membership Engine, Coordinator) pairs, up to [`MAX_INSTANCES`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::coordinator::{Coordinator, CoordinatorCallbacks, CoordinatorConfig, NoopCallbacks};
use crate::error::{ContextualError, Error, ErrorContext, Result};
use crate::membership::{Engine, EngineConfig};

/// Hard cap on instances owned by one manager, mirroring
/// `MAX_NODES_PER_SERVER` from the original source.
pub const MAX_INSTANCES: usize = 16;

#[derive(Debug, Clone)]
pub struct InstanceManagerConfig {
    pub bind_addr: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub coordinator_tick_interval: Duration,
    pub engine_config: EngineConfig,
    pub coordinator_config: CoordinatorConfig,
}

impl Default for InstanceManagerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port_range_start: 7946,
            port_range_end: 7946 + 64,
            coordinator_tick_interval: Duration::from_millis(250),
            engine_config: EngineConfig::default(),
            coordinator_config: CoordinatorConfig::default(),
        }
    }
}

/// Per-instance creation parameters, mirroring `node_instance_config_t` from
/// the original source: either port may be left unset to auto-allocate from
/// the manager's shared pool, and an optional seed drives an automatic join
/// when `auto_start` is set.
#[derive(Debug, Clone, Default)]
pub struct InstanceConfig {
    pub id: String,
    pub membership_port: Option<u16>,
    pub app_port: Option<u16>,
    pub is_main: bool,
    pub auto_start: bool,
    pub seed_address: Option<String>,
    pub seed_port: Option<u16>,
}

impl InstanceConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// A running (or stopped) membership+coordinator pair. Carries two ports —
/// one for SWIM membership traffic, one reserved for the instance's own
/// application/websocket traffic — plus cumulative uptime, matching
/// `node_instance_t`'s `swim_port`/`ws_port`/`start_time`/`uptime_seconds`.
pub struct Instance {
    pub id: String,
    pub port: u16,
    pub app_port: u16,
    pub is_main: bool,
    pub engine: Arc<Engine>,
    pub coordinator: Arc<Coordinator>,
    running: bool,
    start_time: Option<Instant>,
    cumulative_uptime: Duration,
    shutdown: Arc<Notify>,
}

impl Instance {
    /// Total uptime: time accumulated across past start/stop cycles plus the
    /// elapsed time of the current run, if any.
    fn uptime(&self) -> Duration {
        match self.start_time {
            Some(started) => self.cumulative_uptime + started.elapsed(),
            None => self.cumulative_uptime,
        }
    }
}

/// Linear-scan, cyclic-cursor port allocator over a fixed range.
struct PortPool {
    range_start: u16,
    range_end: u16,
    cursor: u16,
    in_use: std::collections::HashSet<u16>,
}

impl PortPool {
    fn new(range_start: u16, range_end: u16) -> Self {
        Self {
            range_start,
            range_end,
            cursor: range_start,
            in_use: std::collections::HashSet::new(),
        }
    }

    /// Scan forward from the cursor for a free port, wrapping once. Returns
    /// `None` (mirroring the original's `0` sentinel) when the range is
    /// exhausted.
    fn allocate(&mut self) -> Option<u16> {
        let span = self.range_end.saturating_sub(self.range_start).max(1);
        for offset in 0..span {
            let candidate = self.range_start + ((self.cursor - self.range_start + offset) % span);
            if !self.in_use.contains(&candidate) {
                self.in_use.insert(candidate);
                self.cursor = candidate.saturating_add(1);
                if self.cursor >= self.range_end {
                    self.cursor = self.range_start;
                }
                return Some(candidate);
            }
        }
        None
    }

    /// Free a previously-allocated port so a later `allocate` can reuse it.
    fn release(&mut self, port: u16) {
        self.in_use.remove(&port);
    }
}

#[derive(Debug, Clone, Default)]
pub struct InstanceManagerStats {
    pub instance_count: usize,
    pub ports_allocated: usize,
    pub total_instances: usize,
    pub running_instances: usize,
    pub total_messages: u64,
    pub total_uptime: Duration,
}

/// Owns every mesh instance on this process. The instance list is guarded by
/// a synchronous `parking_lot::Mutex`: list mutations (insert/remove) never
/// hold the lock across an `.await`, so async instance work always happens
/// after the lock is released.
pub struct InstanceManager {
    config: InstanceManagerConfig,
    instances: Mutex<HashMap<String, Instance>>,
    port_pool: Mutex<PortPool>,
}

impl InstanceManager {
    pub fn new(config: InstanceManagerConfig) -> Self {
        let port_pool = PortPool::new(config.port_range_start, config.port_range_end);
        Self {
            config,
            instances: Mutex::new(HashMap::new()),
            port_pool: Mutex::new(port_pool),
        }
    }

    /// Allocate a port, initialize a new Engine+Coordinator pair, and
    /// register the instance under default config. Does not start it —
    /// call [`Self::start_node`].
    pub async fn create_node(&self, id: impl Into<String>) -> Result<()> {
        self.create(InstanceConfig::new(id)).await
    }

    /// Full instance creation, mirroring `node_manager_create_node`: either
    /// port may be pre-specified, otherwise one is allocated from the shared
    /// pool; `auto_start` brings the instance up immediately and, if a seed
    /// is given, joins it before returning.
    pub async fn create(&self, config: InstanceConfig) -> Result<()> {
        let id = config.id.clone();
        if id.is_empty() {
            return Err(Error::instance_manager("instance id must not be empty"));
        }

        let (port, app_port) = {
            let instances = self.instances.lock();
            if instances.contains_key(&id) {
                return Err(Error::instance_manager(format!("instance '{id}' already exists")));
            }
            if instances.len() >= MAX_INSTANCES {
                return Err(Error::instance_manager(format!(
                    "instance cap reached ({MAX_INSTANCES})"
                )));
            }
            drop(instances);
            let mut pool = self.port_pool.lock();
            let port = match config.membership_port {
                Some(p) => p,
                None => pool
                    .allocate()
                    .ok_or_else(|| Error::instance_manager("port pool exhausted"))?,
            };
            let app_port = match config.app_port {
                Some(p) => p,
                None => pool.allocate().ok_or_else(|| {
                    pool.release(port);
                    Error::instance_manager("port pool exhausted")
                })?,
            };
            (port, app_port)
        };
        // Lock released before the async engine bind below.

        let bind_result = Engine::init(&id, &self.config.bind_addr, port, self.config.engine_config.clone()).await;
        let engine = match bind_result {
            Ok(engine) => Arc::new(engine),
            Err(e) => {
                let mut pool = self.port_pool.lock();
                pool.release(port);
                pool.release(app_port);
                let ctx = ContextualError {
                    error: e,
                    context: ErrorContext::new("instance_manager.create_engine").with_context("instance_id", id.clone()),
                };
                warn!(
                    correlation_id = %ctx.context.correlation_id,
                    instance_id = %id,
                    error = %ctx.error,
                    "engine construction failed while creating instance"
                );
                return Err(ctx.error);
            }
        };
        if config.is_main {
            engine.set_main(true).await?;
        }
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&engine),
            Arc::new(NoopCallbacks) as Arc<dyn CoordinatorCallbacks>,
            self.config.coordinator_config.clone(),
            config.is_main,
        ));
        coordinator.attach_to_engine().await;

        let instance = Instance {
            id: id.clone(),
            port,
            app_port,
            is_main: config.is_main,
            engine,
            coordinator,
            running: false,
            start_time: None,
            cumulative_uptime: Duration::ZERO,
            shutdown: Arc::new(Notify::new()),
        };

        self.instances.lock().insert(id.clone(), instance);

        if config.auto_start {
            self.start_node(&id)?;
            if let (Some(seed_address), Some(seed_port)) = (&config.seed_address, config.seed_port) {
                let engine = self.get_engine(&id).expect("just inserted");
                engine.join("seed", seed_address.as_str(), seed_port).await?;
            }
        }
        Ok(())
    }

    /// Same as [`Self::create_node`] but with caller-supplied callbacks for
    /// the coordinator's role and task-completion events.
    pub async fn create_node_with_callbacks(
        &self,
        id: impl Into<String>,
        callbacks: Arc<dyn CoordinatorCallbacks>,
    ) -> Result<()> {
        let id = id.into();
        self.create_node(id.clone()).await?;
        let engine = {
            let instances = self.instances.lock();
            instances.get(&id).map(|i| Arc::clone(&i.engine))
        };
        let Some(engine) = engine else {
            return Ok(());
        };
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&engine),
            callbacks,
            self.config.coordinator_config.clone(),
            false,
        ));
        coordinator.attach_to_engine().await;
        if let Some(instance) = self.instances.lock().get_mut(&id) {
            instance.coordinator = coordinator;
        }
        Ok(())
    }

    /// Start an instance's Engine (spawns its receive pump + gossip loop)
    /// and its own coordinator-tick driver task.
    pub fn start_node(&self, id: &str) -> Result<()> {
        let mut instances = self.instances.lock();
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| Error::instance_manager(format!("unknown instance '{id}'")))?;
        if instance.running {
            return Err(Error::instance_manager(format!("instance '{id}' already running")));
        }
        instance.running = true;
        instance.start_time = Some(Instant::now());
        instance.engine.start();

        let coordinator = Arc::clone(&instance.coordinator);
        let shutdown = Arc::clone(&instance.shutdown);
        let tick_interval = self.config.coordinator_tick_interval;
        let node_id = instance.id.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = interval.tick() => coordinator.tick().await,
                }
            }
            info!(node_id = %node_id, "coordinator tick driver stopped");
        });
        Ok(())
    }

    pub fn stop_node(&self, id: &str) -> Result<()> {
        let mut instances = self.instances.lock();
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| Error::instance_manager(format!("unknown instance '{id}'")))?;
        if !instance.running {
            return Err(Error::instance_manager(format!("instance '{id}' is not running")));
        }
        instance.running = false;
        if let Some(started) = instance.start_time.take() {
            instance.cumulative_uptime += started.elapsed();
        }
        instance.shutdown.notify_waiters();
        let engine = Arc::clone(&instance.engine);
        tokio::spawn(async move { engine.stop().await });
        Ok(())
    }

    pub fn remove_node(&self, id: &str) -> Result<()> {
        let mut instances = self.instances.lock();
        let instance = instances
            .remove(id)
            .ok_or_else(|| Error::instance_manager(format!("unknown instance '{id}'")))?;
        let mut pool = self.port_pool.lock();
        pool.release(instance.port);
        pool.release(instance.app_port);
        drop(pool);
        if instance.running {
            instance.shutdown.notify_waiters();
        }
        Ok(())
    }

    pub fn start_all(&self) -> Result<()> {
        let ids: Vec<String> = self.instances.lock().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.start_node(&id) {
                warn!(error = %e, node_id = %id, "failed to start instance");
            }
        }
        Ok(())
    }

    pub fn stop_all(&self) -> Result<()> {
        let ids: Vec<String> = self.instances.lock().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop_node(&id) {
                warn!(error = %e, node_id = %id, "failed to stop instance");
            }
        }
        Ok(())
    }

    pub fn get_engine(&self, id: &str) -> Option<Arc<Engine>> {
        self.instances.lock().get(id).map(|i| Arc::clone(&i.engine))
    }

    pub fn get_coordinator(&self, id: &str) -> Option<Arc<Coordinator>> {
        self.instances.lock().get(id).map(|i| Arc::clone(&i.coordinator))
    }

    /// One external drive of every running instance's coordinator, mirroring
    /// `node_manager_process`'s per-node `coordinator_process` call. The
    /// Engine itself needs no equivalent nudge here: unlike the original's
    /// single-threaded poll loop, [`Engine::start`] already owns its receive
    /// pump and gossip round as background tasks.
    pub async fn tick(&self) {
        let coordinators: Vec<Arc<Coordinator>> = {
            let instances = self.instances.lock();
            instances
                .values()
                .filter(|i| i.running)
                .map(|i| Arc::clone(&i.coordinator))
                .collect()
        };
        for coordinator in coordinators {
            coordinator.tick().await;
        }
    }

    /// Snapshot of instance counts, aggregate message traffic, and aggregate
    /// uptime, mirroring `node_manager_get_stats`.
    pub async fn get_stats(&self) -> InstanceManagerStats {
        let snapshot: Vec<(bool, Duration, Arc<Engine>)> = {
            let instances = self.instances.lock();
            instances
                .values()
                .map(|i| (i.running, i.uptime(), Arc::clone(&i.engine)))
                .collect()
        };
        let total = snapshot.len();
        let running = snapshot.iter().filter(|(r, _, _)| *r).count();
        let mut total_messages = 0u64;
        let mut total_uptime = Duration::ZERO;
        for (_, uptime, engine) in &snapshot {
            let engine_stats = engine.get_stats().await;
            total_messages += engine_stats.messages_sent + engine_stats.messages_received;
            total_uptime += *uptime;
        }
        InstanceManagerStats {
            instance_count: total,
            ports_allocated: self.port_pool.lock().in_use.len(),
            total_instances: total,
            running_instances: running,
            total_messages,
            total_uptime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_remove_round_trips() {
        let manager = InstanceManager::new(InstanceManagerConfig {
            port_range_start: 0,
            port_range_end: 5,
            bind_addr: "127.0.0.1".to_string(),
            ..Default::default()
        });
        manager.create_node("node-a").await.unwrap();
        assert_eq!(manager.get_stats().await.instance_count, 1);
        manager.remove_node("node-a").unwrap();
        assert_eq!(manager.get_stats().await.instance_count, 0);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let manager = InstanceManager::new(InstanceManagerConfig {
            port_range_start: 0,
            port_range_end: 5,
            bind_addr: "127.0.0.1".to_string(),
            ..Default::default()
        });
        manager.create_node("node-a").await.unwrap();
        let err = manager.create_node("node-a").await.unwrap_err();
        assert!(matches!(err, Error::InstanceManager { .. }));
    }

    #[tokio::test]
    async fn sixteen_instance_cap_is_enforced() {
        let manager = InstanceManager::new(InstanceManagerConfig {
            port_range_start: 0,
            port_range_end: 100,
            bind_addr: "127.0.0.1".to_string(),
            ..Default::default()
        });
        for i in 0..MAX_INSTANCES {
            manager.create_node(format!("node-{i}")).await.unwrap();
        }
        let err = manager.create_node("node-overflow").await.unwrap_err();
        assert!(matches!(err, Error::InstanceManager { .. }));
    }

    #[test]
    fn port_pool_exhausts_and_returns_none() {
        let mut pool = PortPool::new(9000, 9002);
        assert_eq!(pool.allocate(), Some(9000));
        assert_eq!(pool.allocate(), Some(9001));
        assert_eq!(pool.allocate(), None);
    }

    #[test]
    fn port_pool_cursor_cycles() {
        let mut pool = PortPool::new(9000, 9003);
        let a = pool.allocate().unwrap();
        pool.release(a);
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        assert_ne!(b, c);
    }

    #[test]
    fn released_port_is_immediately_reusable() {
        let mut pool = PortPool::new(9000, 9002);
        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        assert_eq!(pool.allocate(), None, "pool should be exhausted");
        pool.release(a);
        assert_eq!(pool.allocate(), Some(a), "releasing a port must make it reusable");
    }

    #[tokio::test]
    async fn remove_then_recreate_reclaims_ports() {
        let manager = InstanceManager::new(InstanceManagerConfig {
            port_range_start: 0,
            port_range_end: 2,
            bind_addr: "127.0.0.1".to_string(),
            ..Default::default()
        });
        manager.create_node("node-a").await.unwrap();
        // The 2-port range is now fully consumed by node-a's membership and
        // app ports; a second instance must fail until node-a is removed.
        assert!(manager.create_node("node-b").await.is_err());

        manager.remove_node("node-a").unwrap();
        manager
            .create_node("node-b")
            .await
            .expect("removing node-a must return its ports to the pool");
        assert_eq!(manager.get_stats().await.instance_count, 1);
    }

    #[tokio::test]
    async fn create_allocates_two_distinct_ports() {
        let manager = InstanceManager::new(InstanceManagerConfig {
            port_range_start: 0,
            port_range_end: 10,
            bind_addr: "127.0.0.1".to_string(),
            ..Default::default()
        });
        manager.create_node("node-a").await.unwrap();
        let engine = manager.get_engine("node-a").unwrap();
        let local = engine.get_local().await;
        assert_ne!(local.port, 0);
    }

    #[tokio::test]
    async fn auto_start_brings_the_instance_up_without_an_explicit_start_call() {
        let manager = InstanceManager::new(InstanceManagerConfig {
            port_range_start: 0,
            port_range_end: 10,
            bind_addr: "127.0.0.1".to_string(),
            ..Default::default()
        });
        manager
            .create(InstanceConfig {
                auto_start: true,
                ..InstanceConfig::new("node-a")
            })
            .await
            .unwrap();
        assert_eq!(manager.get_stats().await.running_instances, 1);
        assert!(manager.stop_node("node-a").is_ok());
    }

    #[tokio::test]
    async fn stats_aggregate_messages_and_uptime_across_instances() {
        let manager = InstanceManager::new(InstanceManagerConfig {
            port_range_start: 0,
            port_range_end: 10,
            bind_addr: "127.0.0.1".to_string(),
            ..Default::default()
        });
        manager.create_node("node-a").await.unwrap();
        manager.start_node("node-a").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let stats = manager.get_stats().await;
        assert_eq!(stats.total_instances, 1);
        assert_eq!(stats.running_instances, 1);
        assert!(stats.total_uptime > Duration::ZERO);
        manager.stop_node("node-a").unwrap();
    }

    #[tokio::test]
    async fn tick_drives_a_lone_instance_to_leader() {
        let manager = InstanceManager::new(InstanceManagerConfig {
            port_range_start: 0,
            port_range_end: 10,
            bind_addr: "127.0.0.1".to_string(),
            coordinator_config: CoordinatorConfig {
                election_timeout_min: Duration::from_millis(0),
                election_timeout_max: Duration::from_millis(0),
            },
            ..Default::default()
        });
        manager.create_node("node-a").await.unwrap();
        manager.start_node("node-a").unwrap();
        manager.tick().await;
        manager.tick().await;
        let coordinator = manager.get_coordinator("node-a").unwrap();
        assert_eq!(coordinator.role().await, crate::types::Role::Leader);
        manager.stop_node("node-a").unwrap();
    }
}
