//! Leader election and task queue, built on top of a Membership Engine.
//!
//! Election here has no `RequestVote` RPC of its own: a Candidate counts the
//! number of Alive peers the Membership Engine currently reports and awards
//! itself the majority the moment that count supports it (self-vote plus the
//! absence of any contesting claim). This is a deliberate simplification,
//! not an oversight — see the coordinator entry in the root grounding ledger.
//!
//! A self-vote alone can never form an outright majority among exactly two
//! mutually-aware Alive survivors, so an exact `votes * 2 == alive` tie is
//! broken deterministically by lowest node id (see `is_lowest_alive_id`)
//! rather than left to stall forever.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::coordinator::task::{Task, TaskOutcome};
use crate::error::{Error, Result};
use crate::membership::Engine;
use crate::types::{NodeState, Role};

/// Callbacks invoked on role transitions and task completion. Implementors
/// get `Send + Sync` defaults so a caller only needs to override what it cares
/// about.
#[async_trait]
pub trait CoordinatorCallbacks: Send + Sync {
    async fn on_become_leader(&self) {}
    async fn on_lose_leadership(&self) {}
    async fn on_task_complete(&self, _task_id: &str, _outcome: TaskOutcome) {}
}

/// No-op callback set, used when a caller has no interest in notifications.
pub struct NoopCallbacks;

#[async_trait]
impl CoordinatorCallbacks for NoopCallbacks {}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Lower bound of the randomized Follower election timeout. Sampled
    /// fresh every time the deadline resets (initial Follower init and every
    /// `begin_election`), so peers don't all time out in lockstep.
    pub election_timeout_min: Duration,
    /// Upper bound of the same.
    pub election_timeout_max: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
        }
    }
}

impl CoordinatorConfig {
    fn random_election_timeout(&self) -> Duration {
        if self.election_timeout_max <= self.election_timeout_min {
            return self.election_timeout_min;
        }
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
    }
}

#[derive(Debug, Clone, Default)]
pub struct CoordinatorStats {
    pub term: u32,
    pub votes_received: u32,
    pub tasks_processed: u64,
    pub tasks_failed: u64,
    pub avg_task_latency_ms: f64,
}

/// Coordinator role state machine plus task queue. Holds a non-owning
/// reference to the Engine it elects over; the Engine outlives it.
pub struct Coordinator {
    engine: Arc<Engine>,
    callbacks: Arc<dyn CoordinatorCallbacks>,
    config: CoordinatorConfig,
    role: RwLock<Role>,
    term: AtomicU32,
    votes_received: AtomicU32,
    leader_id: RwLock<Option<String>>,
    election_deadline: RwLock<Instant>,
    pending: RwLock<VecDeque<Task>>,
    completed: RwLock<Vec<(String, TaskOutcome)>>,
    tasks_processed: AtomicU64,
    tasks_failed: AtomicU64,
    avg_latency_ms: RwLock<f64>,
}

impl Coordinator {
    /// Construct a coordinator over `engine`. `start_as_main` mirrors the
    /// two documented init paths: `true` is born a Leader (`leader_id` is
    /// the local id, no election ever ran, `term` stays at its initial
    /// value); `false` is born a Follower with a freshly randomized election
    /// deadline. Callers that also want `Engine::set_main(true)` reflected
    /// (the usual pairing for `start_as_main=true`) must await that
    /// separately — this constructor only touches Coordinator-owned state.
    pub fn new(
        engine: Arc<Engine>,
        callbacks: Arc<dyn CoordinatorCallbacks>,
        config: CoordinatorConfig,
        start_as_main: bool,
    ) -> Self {
        let now = Instant::now();
        let (role, leader_id, election_deadline) = if start_as_main {
            (Role::Leader, Some(engine.local_id().to_string()), now)
        } else {
            (Role::Follower, None, now + config.random_election_timeout())
        };
        Self {
            engine,
            callbacks,
            config,
            role: RwLock::new(role),
            term: AtomicU32::new(1),
            votes_received: AtomicU32::new(if start_as_main { 1 } else { 0 }),
            leader_id: RwLock::new(leader_id),
            election_deadline: RwLock::new(election_deadline),
            pending: RwLock::new(VecDeque::new()),
            completed: RwLock::new(Vec::new()),
            tasks_processed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            avg_latency_ms: RwLock::new(0.0),
        }
    }

    pub async fn role(&self) -> Role {
        *self.role.read().await
    }

    pub async fn is_leader(&self) -> bool {
        *self.role.read().await == Role::Leader
    }

    pub async fn leader_id(&self) -> Option<String> {
        self.leader_id.read().await.clone()
    }

    /// Register this coordinator's election against its Engine's node
    /// events: per §4.2, an observed non-Alive transition of the current
    /// `leader_id` begins an election immediately rather than waiting for
    /// the next scheduled tick. The callback must return promptly, so the
    /// actual state mutation is handed off to a spawned task.
    pub async fn attach_to_engine(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        self.engine
            .set_node_callback(move |node, _old, new_state| {
                let coordinator = Arc::clone(&coordinator);
                let node_id = node.id.clone();
                tokio::spawn(async move {
                    let is_leader = coordinator.leader_id.read().await.as_deref() == Some(node_id.as_str());
                    if is_leader && new_state != NodeState::Alive {
                        coordinator.begin_election().await;
                    }
                });
            })
            .await;
    }

    /// Submit a task for processing. Accepted regardless of current role;
    /// only a Leader drains the queue, so a Follower simply accumulates
    /// tasks until (if ever) it becomes Leader.
    pub async fn submit_task(&self, task: Task) -> Result<()> {
        if task.id.is_empty() {
            return Err(Error::coordinator("task id must not be empty"));
        }
        self.pending.write().await.push_back(task);
        Ok(())
    }

    pub async fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            term: self.term.load(Ordering::SeqCst),
            votes_received: self.votes_received.load(Ordering::SeqCst),
            tasks_processed: self.tasks_processed.load(Ordering::SeqCst),
            tasks_failed: self.tasks_failed.load(Ordering::SeqCst),
            avg_task_latency_ms: *self.avg_latency_ms.read().await,
        }
    }

    /// One step of the coordinator state machine. Driven externally (by the
    /// Instance Manager's own loop), not by a task this struct spawns itself.
    pub async fn tick(&self) {
        let role = *self.role.read().await;
        match role {
            Role::Follower => self.tick_follower().await,
            Role::Candidate => self.tick_candidate().await,
            Role::Leader => self.tick_leader().await,
        }
    }

    async fn alive_count(&self) -> usize {
        self.engine.count_by_state(NodeState::Alive).await
    }

    /// The id of some other Alive node that currently claims `is_main`, if
    /// any.
    async fn observed_leader(&self) -> Option<String> {
        let local_id = self.engine.local_id().to_string();
        self.engine
            .get_nodes()
            .await
            .into_iter()
            .find(|n| n.id != local_id && n.state == NodeState::Alive && n.is_main)
            .map(|n| n.id)
    }

    async fn tick_follower(&self) {
        if let Some(observed) = self.observed_leader().await {
            *self.leader_id.write().await = Some(observed);
            return;
        }
        if Instant::now() > *self.election_deadline.read().await {
            self.begin_election().await;
        }
    }

    /// role ← Candidate; term += 1; votes_received = 1; reset
    /// election_deadline. No `RequestVote`/`VoteGranted` messages are ever
    /// transmitted — see the module doc.
    async fn begin_election(&self) {
        let term = self.term.fetch_add(1, Ordering::SeqCst) + 1;
        *self.role.write().await = Role::Candidate;
        self.votes_received.store(1, Ordering::SeqCst);
        *self.leader_id.write().await = None;
        *self.election_deadline.write().await = Instant::now() + self.config.random_election_timeout();
        info!(term, "election timeout elapsed, becoming candidate");
    }

    /// Whether the local node has the lexicographically lowest id among
    /// currently-Alive peers (self included). Used only to break an exact
    /// vote tie — see [`Self::tick_candidate`].
    async fn is_lowest_alive_id(&self) -> bool {
        let local_id = self.engine.local_id();
        self.engine
            .get_nodes()
            .await
            .into_iter()
            .filter(|n| n.state == NodeState::Alive)
            .map(|n| n.id)
            .min()
            .map(|lowest| lowest == local_id)
            .unwrap_or(true)
    }

    async fn tick_candidate(&self) {
        let alive = self.alive_count().await.max(1);
        let votes = self.votes_received.load(Ordering::SeqCst) as usize;
        let has_outright_majority = votes * 2 > alive;
        // A self-vote can never form an outright majority among exactly two
        // mutually-aware Alive survivors (1*2 is never > 2). Break that tie
        // deterministically by lowest id so exactly one of them wins, rather
        // than stalling forever.
        let wins_exact_tie = alive > 1 && votes * 2 == alive && self.is_lowest_alive_id().await;
        if alive <= 1 || has_outright_majority || wins_exact_tie {
            let local_id = self.engine.local_id().to_string();
            *self.role.write().await = Role::Leader;
            *self.leader_id.write().await = Some(local_id);
            if let Err(e) = self.engine.set_main(true).await {
                warn!(error = %e, "failed to mark local node as main after election");
            }
            info!(term = self.term.load(Ordering::SeqCst), "elected leader");
            self.callbacks.on_become_leader().await;
        }
    }

    async fn tick_leader(&self) {
        if let Some(observed) = self.observed_leader().await {
            *self.role.write().await = Role::Follower;
            *self.leader_id.write().await = Some(observed);
            *self.election_deadline.write().await = Instant::now() + self.config.random_election_timeout();
            if let Err(e) = self.engine.set_main(false).await {
                warn!(error = %e, "failed to clear main flag while stepping down");
            }
            info!("observed a fresher leader, stepping down");
            self.callbacks.on_lose_leadership().await;
            return;
        }
        self.drain_tasks().await;
    }

    async fn drain_tasks(&self) {
        let now = Instant::now();
        let drained: Vec<Task> = {
            let mut pending = self.pending.write().await;
            pending.drain(..).collect()
        };
        for task in drained {
            if task.is_past_deadline(now) {
                self.tasks_failed.fetch_add(1, Ordering::SeqCst);
                self.completed
                    .write()
                    .await
                    .push((task.id.clone(), TaskOutcome::FailedDeadlineExceeded));
                self.callbacks
                    .on_task_complete(&task.id, TaskOutcome::FailedDeadlineExceeded)
                    .await;
                continue;
            }
            let latency_ms = now.duration_since(task.created_at).as_secs_f64() * 1000.0;
            self.update_avg_latency(latency_ms).await;
            self.tasks_processed.fetch_add(1, Ordering::SeqCst);
            self.completed.write().await.push((task.id.clone(), TaskOutcome::Completed));
            self.callbacks.on_task_complete(&task.id, TaskOutcome::Completed).await;
        }
    }

    async fn update_avg_latency(&self, sample_ms: f64) {
        let processed = self.tasks_processed.load(Ordering::SeqCst) as f64;
        let mut avg = self.avg_latency_ms.write().await;
        *avg = (*avg * processed + sample_ms) / (processed + 1.0);
    }
}
