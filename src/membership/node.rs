//! Peer node records and the failure-detector state machine.

use tokio::time::Instant;

use crate::types::NodeState;

/// A single row of the Membership Engine's node table.
///
/// Owned exclusively by the [`super::engine::Engine`] that tracks it; the
/// Coordinator only ever sees snapshots via [`super::engine::Engine::get_nodes`].
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub state: NodeState,
    pub incarnation: u32,
    pub is_main: bool,
    /// Wall-clock instant of the last datagram received that named this node
    /// as sender, regardless of whether it changed state. The timeout
    /// scanner keys off this field, not `last_state_change` — a peer that
    /// keeps acking but never transitions state must not go stale.
    pub last_seen: Instant,
    /// Wall-clock instant this row's `state` last actually changed.
    pub last_state_change: Instant,
}

impl Node {
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            address: address.into(),
            port,
            state: NodeState::Alive,
            incarnation: 1,
            is_main: false,
            last_seen: now,
            last_state_change: now,
        }
    }

    /// Refresh `last_seen` without necessarily changing state.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Transition this row, per the probe/gossip handling rules: Dead is
    /// absorbing except for a resurrection carried by a strictly higher
    /// incarnation. Left is local-only and never overridden by gossip.
    pub fn set_state(&mut self, state: NodeState) {
        self.last_seen = Instant::now();
        if self.state == state {
            return;
        }
        self.state = state;
        self.last_state_change = Instant::now();
    }

    /// Apply a remote [`crate::wire::NodeUpdateRecord`] for this node,
    /// following the conflict-resolution rule: a strictly higher incarnation
    /// supersedes local state; an equal or lower incarnation is ignored
    /// outright, so ties always preserve the earlier state (no regression).
    ///
    /// Returns `Some((old_state, new_state))` when the record was applied and
    /// changed the row's state (the caller fires `on_node_event` with it),
    /// `None` when it was ignored or applied without a state change.
    pub fn apply_remote(
        &mut self,
        incoming_state: NodeState,
        incoming_incarnation: u32,
        is_main: bool,
    ) -> Option<(NodeState, NodeState)> {
        if self.state == NodeState::Left {
            return None;
        }
        if incoming_incarnation <= self.incarnation {
            return None;
        }
        let old_state = self.state;
        self.incarnation = incoming_incarnation;
        self.is_main = is_main;
        self.set_state(incoming_state);
        if old_state != incoming_state {
            Some((old_state, incoming_state))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_incarnation_always_wins() {
        let mut node = Node::new("a", "127.0.0.1", 7946);
        node.incarnation = 5;
        node.state = NodeState::Suspect;
        let applied = node.apply_remote(NodeState::Alive, 6, false);
        assert_eq!(applied, Some((NodeState::Suspect, NodeState::Alive)));
        assert_eq!(node.state, NodeState::Alive);
        assert_eq!(node.incarnation, 6);
    }

    #[test]
    fn stale_incarnation_is_ignored() {
        let mut node = Node::new("a", "127.0.0.1", 7946);
        node.incarnation = 5;
        node.state = NodeState::Alive;
        let applied = node.apply_remote(NodeState::Dead, 4, false);
        assert_eq!(applied, None);
        assert_eq!(node.state, NodeState::Alive);
    }

    #[test]
    fn same_incarnation_preserves_earlier_state() {
        let mut node = Node::new("a", "127.0.0.1", 7946);
        node.incarnation = 5;
        node.state = NodeState::Suspect;
        let applied = node.apply_remote(NodeState::Dead, 5, false);
        assert_eq!(applied, None);
        assert_eq!(node.state, NodeState::Suspect);
    }

    #[test]
    fn left_state_is_never_overridden_by_gossip() {
        let mut node = Node::new("a", "127.0.0.1", 7946);
        node.state = NodeState::Left;
        node.incarnation = 5;
        let applied = node.apply_remote(NodeState::Alive, 99, false);
        assert_eq!(applied, None);
        assert_eq!(node.state, NodeState::Left);
    }
}
