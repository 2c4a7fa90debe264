//! Work items accepted by a [`super::coordinator::Coordinator`] while Leader.

use std::time::{Duration, Instant};

use crate::types::TaskType;

/// A single unit of work submitted to the coordinator.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    pub assigned_node: Option<String>,
    pub payload: Vec<u8>,
    pub created_at: Instant,
    pub deadline: Option<Instant>,
    pub retries: u32,
}

impl Task {
    pub fn new(id: impl Into<String>, task_type: TaskType, payload: Vec<u8>) -> Self {
        let created_at = Instant::now();
        Self {
            id: id.into(),
            task_type,
            assigned_node: None,
            payload,
            created_at,
            deadline: Some(created_at + Duration::from_secs(30)),
            retries: 0,
        }
    }

    pub fn with_deadline(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn is_past_deadline(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}

/// Outcome of a drained task, passed to `on_task_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    FailedDeadlineExceeded,
}
