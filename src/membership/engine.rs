//! SWIM-style membership engine: gossip, failure detection, and the
//! UDP transport that carries both.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use rand::seq::SliceRandom;
use tokio::net::UdpSocket;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::membership::node::Node;
use crate::types::NodeState;
use crate::wire::{Frame, NodeUpdateRecord, MAX_ID_LEN};

/// Hard cap on tracked node records, including Dead/Left rows. Mirrors
/// `SWIM_MAX_NODES` from the original wire format.
pub const MAX_NODES: usize = 256;

/// Tunables for one [`Engine`] instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub gossip_interval: Duration,
    pub probe_timeout: Duration,
    pub suspect_timeout: Duration,
    pub indirect_fanout: usize,
    /// Anti-entropy cadence: every `sync_every`-th tick, also send a full
    /// `Sync` to that tick's probe target (in addition to the `Ping`).
    /// `0` disables anti-entropy entirely.
    pub sync_every: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_millis(1000),
            probe_timeout: Duration::from_millis(500),
            suspect_timeout: Duration::from_millis(5000),
            indirect_fanout: 3,
            sync_every: 5,
        }
    }
}

/// Point-in-time counters, returned by [`Engine::get_stats`].
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub probes_sent: u64,
    pub acks_received: u64,
    pub indirect_probes_sent: u64,
    pub malformed_datagrams_dropped: u64,
    pub suspect_transitions: u64,
    pub dead_transitions: u64,
    /// Total frames sent on the wire (probes, acks, syncs, app datagrams).
    /// Rolled up by the Instance Manager's aggregate `total_messages` stat.
    pub messages_sent: u64,
    /// Total frames received on the wire, including malformed ones.
    pub messages_received: u64,
}

/// Node-event callback: `(node, old_state, new_state)`. Must return promptly
/// (§5) — offloading is the callee's job.
pub type NodeEventCallback = dyn Fn(&Node, NodeState, NodeState) + Send + Sync;
/// Application-message callback: `(from_node_id, payload)`.
pub type MessageCallback = dyn Fn(&str, &[u8]) + Send + Sync;

/// An outstanding direct probe awaiting an `Ack`, or a `PingReq` this engine
/// forwarded on behalf of another node (tracked so the eventual `Ack` can be
/// re-emitted to the original requester).
struct Outstanding {
    target_id: String,
    sent_at: Instant,
    /// Set when this probe exists because a peer asked us to forward it.
    on_behalf_of: Option<(String, SocketAddr)>,
}

/// The SWIM membership engine for one local node.
///
/// One `Engine` owns one UDP socket and one node table; the table is guarded
/// by a `tokio::sync::RwLock` rather than a lock-free map, since updates are
/// always read-modify-write under the gossip/probe loop and reads (snapshots
/// for the Coordinator) are comparatively rare.
pub struct Engine {
    local_id: String,
    local_incarnation: AtomicU32,
    socket: Arc<UdpSocket>,
    nodes: Arc<RwLock<HashMap<String, Node>>>,
    seq: AtomicU32,
    tick_round: AtomicU32,
    config: EngineConfig,
    outstanding: Arc<RwLock<HashMap<u32, Outstanding>>>,
    stats: Arc<RwLock<EngineStats>>,
    shutdown: Arc<Notify>,
    running: Arc<std::sync::atomic::AtomicBool>,
    on_node_event: RwLock<Option<Arc<NodeEventCallback>>>,
    on_message: RwLock<Option<Arc<MessageCallback>>>,
}

impl Engine {
    /// Bind the local UDP socket and initialize an empty node table
    /// containing only the local node (Alive, incarnation 1).
    pub async fn init(id: impl Into<String>, bind_addr: &str, port: u16, config: EngineConfig) -> Result<Self> {
        let id = id.into();
        if id.len() > MAX_ID_LEN {
            return Err(Error::membership_for(
                id.clone(),
                format!("node id of {} bytes exceeds the {MAX_ID_LEN}-byte wire limit", id.len()),
            ));
        }
        let socket = UdpSocket::bind((bind_addr, port))
            .await
            .map_err(|e| Error::io(format!("binding membership socket on {bind_addr}:{port}"), e))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| Error::io("reading local socket address", e))?;

        let mut nodes = HashMap::new();
        nodes.insert(
            id.clone(),
            Node::new(id.clone(), local_addr.ip().to_string(), local_addr.port()),
        );

        info!(node_id = %id, addr = %local_addr, "membership engine initialized");

        Ok(Self {
            local_id: id,
            local_incarnation: AtomicU32::new(1),
            socket: Arc::new(socket),
            nodes: Arc::new(RwLock::new(nodes)),
            seq: AtomicU32::new(0),
            tick_round: AtomicU32::new(0),
            config,
            outstanding: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(EngineStats::default())),
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            on_node_event: RwLock::new(None),
            on_message: RwLock::new(None),
        })
    }

    /// Register the node-event callback. Replaces any previously set handler.
    pub async fn set_node_callback(&self, callback: impl Fn(&Node, NodeState, NodeState) + Send + Sync + 'static) {
        *self.on_node_event.write().await = Some(Arc::new(callback));
    }

    /// Register the application-message callback. Replaces any previously
    /// set handler.
    pub async fn set_message_callback(&self, callback: impl Fn(&str, &[u8]) + Send + Sync + 'static) {
        *self.on_message.write().await = Some(Arc::new(callback));
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Spawn the receive pump and the probe/gossip tick loop. Returns once
    /// both background tasks are running; they continue until [`Engine::stop`].
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let recv_engine = Arc::clone(self);
        tokio::spawn(async move { recv_engine.run_receive_loop().await });

        let tick_engine = Arc::clone(self);
        tokio::spawn(async move { tick_engine.run_tick_loop().await });

        let scan_engine = Arc::clone(self);
        tokio::spawn(async move { scan_engine.run_timeout_scanner().await });
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        info!(node_id = %self.local_id, "membership engine stopped");
    }

    /// Add a known peer to the table (e.g. a configured seed) and send it an
    /// immediate `Sync` so convergence does not wait for the next gossip tick.
    pub async fn join(&self, id: impl Into<String>, address: impl Into<String>, port: u16) -> Result<()> {
        let id = id.into();
        let address = address.into();
        if id.len() > MAX_ID_LEN {
            return Err(Error::membership_for(
                id.clone(),
                format!("node id of {} bytes exceeds the {MAX_ID_LEN}-byte wire limit", id.len()),
            ));
        }
        {
            let mut nodes = self.nodes.write().await;
            if !nodes.contains_key(&id) && nodes.len() >= MAX_NODES {
                return Err(Error::membership_for(id, "node table is at capacity (256)"));
            }
            nodes.entry(id.clone()).or_insert_with(|| Node::new(id.clone(), address.clone(), port));
        }
        self.send_sync_to(&address, port).await
    }

    /// Mark the local node Left and announce it once via `Sync`. Left is
    /// local-only and is never reverted by incoming gossip.
    pub async fn leave(&self) -> Result<()> {
        {
            let mut nodes = self.nodes.write().await;
            if let Some(local) = nodes.get_mut(&self.local_id) {
                local.set_state(NodeState::Left);
            }
        }
        self.gossip_round().await
    }

    /// Send an opaque application datagram to every currently-Alive peer.
    /// The engine applies no framing of its own beyond the wire header
    /// needed to route it back out through `on_message`; payload bytes are
    /// delivered to the remote side unchanged.
    pub async fn broadcast(&self, payload: &[u8]) -> Result<()> {
        let peers: Vec<Node> = {
            let nodes = self.nodes.read().await;
            nodes
                .values()
                .filter(|n| n.id != self.local_id && n.state == NodeState::Alive)
                .cloned()
                .collect()
        };
        for peer in peers {
            self.send_app_to(&peer.address, peer.port, payload).await?;
        }
        Ok(())
    }

    /// Send an opaque application datagram to one specific peer by id.
    pub async fn send_to(&self, peer_id: &str, payload: &[u8]) -> Result<()> {
        let (address, port) = {
            let nodes = self.nodes.read().await;
            let peer = nodes
                .get(peer_id)
                .ok_or_else(|| Error::membership_for(peer_id, "unknown peer"))?;
            (peer.address.clone(), peer.port)
        };
        self.send_app_to(&address, port, payload).await
    }

    async fn send_app_to(&self, address: &str, port: u16, payload: &[u8]) -> Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let incarnation = self.current_incarnation().await;
        let frame = Frame::new_app(&self.local_id, incarnation, seq, payload.to_vec());
        self.send_frame(&frame, address, port).await
    }

    pub async fn get_nodes(&self) -> Vec<Node> {
        self.nodes.read().await.values().cloned().collect()
    }

    pub async fn count_by_state(&self, state: NodeState) -> usize {
        self.nodes.read().await.values().filter(|n| n.state == state).count()
    }

    pub async fn find(&self, id: &str) -> Option<Node> {
        self.nodes.read().await.get(id).cloned()
    }

    pub async fn get_local(&self) -> Node {
        self.nodes
            .read()
            .await
            .get(&self.local_id)
            .cloned()
            .expect("local node row is always present")
    }

    /// Toggle the local node's `is_main` flag. Per the original's behavior,
    /// every call bumps the local incarnation by one, win or lose — calling
    /// this twice in a row nets +2, not a no-op.
    pub async fn set_main(&self, is_main: bool) -> Result<()> {
        let incarnation = self.local_incarnation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut nodes = self.nodes.write().await;
        let local = nodes
            .get_mut(&self.local_id)
            .expect("local node row is always present");
        local.is_main = is_main;
        local.incarnation = incarnation;
        Ok(())
    }

    pub async fn get_stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    // -- internals ---------------------------------------------------

    async fn run_receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                        Err(e) => warn!(error = %e, "membership socket recv error"),
                    }
                }
            }
        }
    }

    async fn run_tick_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.gossip_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = interval.tick() => {
                    let target = match Engine::probe_round(&self).await {
                        Ok(target) => target,
                        Err(e) => {
                            warn!(error = %e, "probe round failed");
                            None
                        }
                    };
                    let round = self.tick_round.fetch_add(1, Ordering::SeqCst) + 1;
                    if self.config.sync_every > 0 && round % self.config.sync_every == 0 {
                        if let Some(target) = target {
                            if let Err(e) = self.send_sync_to(&target.address, target.port).await {
                                warn!(error = %e, "anti-entropy sync failed");
                            }
                        }
                    }
                }
            }
        }
    }

    async fn run_timeout_scanner(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.probe_timeout);
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = interval.tick() => self.scan_timeouts().await,
            }
        }
    }

    async fn scan_timeouts(&self) {
        let now = Instant::now();
        let mut transitions = Vec::new();
        {
            let mut nodes = self.nodes.write().await;
            let mut stats = self.stats.write().await;
            for node in nodes.values_mut() {
                if node.id == self.local_id || node.state == NodeState::Left {
                    continue;
                }
                let dt = now.duration_since(node.last_seen);
                match node.state {
                    NodeState::Alive if dt > self.config.probe_timeout => {
                        let old = node.state;
                        node.set_state(NodeState::Suspect);
                        stats.suspect_transitions += 1;
                        warn!(node_id = %node.id, "node suspected");
                        transitions.push((node.clone(), old, NodeState::Suspect));
                    }
                    NodeState::Suspect if dt > self.config.suspect_timeout => {
                        let old = node.state;
                        node.set_state(NodeState::Dead);
                        stats.dead_transitions += 1;
                        warn!(node_id = %node.id, "node declared dead");
                        transitions.push((node.clone(), old, NodeState::Dead));
                    }
                    _ => {}
                }
            }
        }
        for (node, old, new) in transitions {
            self.fire_node_event(&node, old, new).await;
        }

        let mut outstanding = self.outstanding.write().await;
        outstanding.retain(|_, o| now.duration_since(o.sent_at) < self.config.probe_timeout * 4);
    }

    async fn fire_node_event(&self, node: &Node, old: NodeState, new: NodeState) {
        if let Some(cb) = self.on_node_event.read().await.clone() {
            (*cb)(node, old, new);
        }
    }

    /// Probe one randomly chosen non-local, non-Left, non-Dead peer with a
    /// `Ping`, and return that peer so the caller can target the same node
    /// with anti-entropy `Sync` traffic rather than picking independently.
    async fn probe_round(self: &Arc<Self>) -> Result<Option<Node>> {
        let target = {
            let nodes = self.nodes.read().await;
            let mut candidates: Vec<_> = nodes
                .values()
                .filter(|n| n.id != self.local_id && n.state != NodeState::Left && n.state != NodeState::Dead)
                .cloned()
                .collect();
            candidates.shuffle(&mut rand::thread_rng());
            candidates.into_iter().next()
        };
        let Some(target) = target else { return Ok(None) };

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let frame = Frame::new_ping(&self.local_id, self.current_incarnation().await, seq, &target.id);
        self.send_frame(&frame, &target.address, target.port).await?;

        {
            let mut outstanding = self.outstanding.write().await;
            outstanding.insert(
                seq,
                Outstanding {
                    target_id: target.id.clone(),
                    sent_at: Instant::now(),
                    on_behalf_of: None,
                },
            );
        }

        let mut stats = self.stats.write().await;
        stats.probes_sent += 1;
        debug!(target = %target.id, seq, "probe sent");
        drop(stats);

        let indirect_self = Arc::clone(self);
        let probe_timeout = self.config.probe_timeout;
        let target_for_delay = target.clone();
        tokio::spawn(async move {
            tokio::time::sleep(probe_timeout).await;
            if indirect_self.probe_still_outstanding(seq).await {
                if let Err(e) = indirect_self.maybe_indirect_probe(&target_for_delay, seq).await {
                    warn!(error = %e, "indirect probe failed");
                }
            }
        });
        Ok(Some(target))
    }

    async fn probe_still_outstanding(&self, seq: u32) -> bool {
        self.outstanding.read().await.contains_key(&seq)
    }

    /// If the direct probe above is still outstanding once `probe_timeout`
    /// has elapsed, fan the same sequence number out to `indirect_fanout`
    /// other Alive peers as `PingReq`.
    async fn maybe_indirect_probe(&self, target: &Node, seq: u32) -> Result<()> {
        let helpers: Vec<Node> = {
            let nodes = self.nodes.read().await;
            let mut candidates: Vec<_> = nodes
                .values()
                .filter(|n| n.id != self.local_id && n.id != target.id && n.state == NodeState::Alive)
                .cloned()
                .collect();
            candidates.shuffle(&mut rand::thread_rng());
            candidates.into_iter().take(self.config.indirect_fanout).collect()
        };
        if helpers.is_empty() {
            return Ok(());
        }
        let incarnation = self.current_incarnation().await;
        for helper in &helpers {
            let frame = Frame::new_ping_req(&self.local_id, incarnation, seq, &target.id, &self.local_id);
            self.send_frame(&frame, &helper.address, helper.port).await?;
        }
        let mut stats = self.stats.write().await;
        stats.indirect_probes_sent += helpers.len() as u64;
        Ok(())
    }

    async fn gossip_round(&self) -> Result<()> {
        let (records, peers) = {
            let nodes = self.nodes.read().await;
            let records: Vec<_> = nodes
                .values()
                .map(|n| NodeUpdateRecord {
                    id: n.id.clone(),
                    address: n.address.clone(),
                    port: n.port,
                    state: n.state,
                    incarnation: n.incarnation,
                    is_main: n.is_main,
                })
                .collect();
            let peers: Vec<_> = nodes
                .values()
                .filter(|n| n.id != self.local_id && n.state == NodeState::Alive)
                .cloned()
                .collect();
            (records, peers)
        };
        if peers.is_empty() {
            return Ok(());
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let incarnation = self.current_incarnation().await;
        let frame = Frame::new_sync(&self.local_id, incarnation, seq, records);
        for peer in peers {
            self.send_frame(&frame, &peer.address, peer.port).await?;
        }
        Ok(())
    }

    async fn send_sync_to(&self, address: &str, port: u16) -> Result<()> {
        let records: Vec<_> = {
            let nodes = self.nodes.read().await;
            nodes
                .values()
                .map(|n| NodeUpdateRecord {
                    id: n.id.clone(),
                    address: n.address.clone(),
                    port: n.port,
                    state: n.state,
                    incarnation: n.incarnation,
                    is_main: n.is_main,
                })
                .collect()
        };
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let incarnation = self.current_incarnation().await;
        let frame = Frame::new_sync(&self.local_id, incarnation, seq, records);
        self.send_frame(&frame, address, port).await
    }

    async fn current_incarnation(&self) -> u32 {
        self.nodes
            .read()
            .await
            .get(&self.local_id)
            .map(|n| n.incarnation)
            .unwrap_or(0)
    }

    async fn send_frame(&self, frame: &Frame, address: &str, port: u16) -> Result<()> {
        let addr: SocketAddr = format!("{address}:{port}")
            .parse()
            .map_err(|_| Error::membership(format!("invalid peer address {address}:{port}")))?;
        let bytes = frame
            .encode()
            .map_err(|e| Error::membership(format!("encoding frame for {address}:{port}: {e}")))?;
        self.socket
            .send_to(&bytes, addr)
            .await
            .map_err(|e| Error::io(format!("sending to {addr}"), e))?;
        self.stats.write().await.messages_sent += 1;
        Ok(())
    }

    async fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        self.stats.write().await.messages_received += 1;
        let frame = match Frame::decode(bytes) {
            Ok(f) => f,
            Err(e) => {
                self.stats.write().await.malformed_datagrams_dropped += 1;
                debug!(error = %e, from = %from, "dropped malformed datagram");
                return;
            }
        };

        let is_sync = matches!(frame, Frame::Sync { .. });
        let header = frame.header().clone();
        self.refresh_sender(&header.sender_id, header.incarnation, from, is_sync).await;

        match frame {
            Frame::Ping { header, .. } => {
                let incarnation = self.current_incarnation().await;
                let ack = Frame::new_ack(&self.local_id, incarnation, header.seq, &header.sender_id);
                if let Err(e) = self.send_frame(&ack, &from.ip().to_string(), from.port()).await {
                    warn!(error = %e, "failed to ack ping");
                }
            }
            Frame::PingReq {
                header,
                target_id,
                source_id,
            } => {
                let target = self.nodes.read().await.get(&target_id).cloned();
                if let Some(target) = target {
                    {
                        let mut outstanding = self.outstanding.write().await;
                        outstanding.insert(
                            header.seq,
                            Outstanding {
                                target_id: target_id.clone(),
                                sent_at: Instant::now(),
                                on_behalf_of: Some((source_id, from)),
                            },
                        );
                    }
                    let incarnation = self.current_incarnation().await;
                    let forwarded = Frame::new_ping(&self.local_id, incarnation, header.seq, &target_id);
                    if let Err(e) = self.send_frame(&forwarded, &target.address, target.port).await {
                        warn!(error = %e, "failed to forward ping_req");
                    }
                }
            }
            Frame::Ack { header, .. } => {
                self.on_ack(header.seq, &header.sender_id).await;
            }
            Frame::Sync { records, .. } => {
                self.apply_sync(records).await;
            }
            Frame::App { header, payload } => {
                if let Some(cb) = self.on_message.read().await.clone() {
                    (*cb)(&header.sender_id, &payload);
                }
            }
        }
    }

    /// Refresh the sender of any received frame: create the row if unknown
    /// (unless this frame is a `Sync`, whose own records carry the
    /// authoritative state for ids it names), bump `last_seen`, promote a
    /// non-Alive row back to Alive, and adopt a strictly greater incarnation.
    /// Fires `on_node_event` for any resulting state transition.
    async fn refresh_sender(&self, id: &str, incarnation: u32, from: SocketAddr, is_sync: bool) {
        if id.is_empty() || id == self.local_id {
            return;
        }
        let transition = {
            let mut nodes = self.nodes.write().await;
            if !nodes.contains_key(id) {
                if is_sync || nodes.len() >= MAX_NODES {
                    return;
                }
                nodes.insert(id.to_string(), Node::new(id, from.ip().to_string(), from.port()));
            }
            let node = nodes.get_mut(id).expect("just inserted or already present");
            if node.state == NodeState::Left {
                node.touch();
                return;
            }
            let old_state = node.state;
            node.touch();
            if incarnation > node.incarnation {
                node.incarnation = incarnation;
            }
            if node.state != NodeState::Alive {
                node.set_state(NodeState::Alive);
            }
            if old_state != node.state {
                Some((node.clone(), old_state, node.state))
            } else {
                None
            }
        };
        if let Some((node, old, new)) = transition {
            self.fire_node_event(&node, old, new).await;
        }
    }

    async fn on_ack(&self, seq: u32, responder_id: &str) {
        self.stats.write().await.acks_received += 1;

        let forward = {
            let mut outstanding = self.outstanding.write().await;
            outstanding.remove(&seq).and_then(|o| o.on_behalf_of.map(|ob| (o.target_id, ob)))
        };
        if let Some((target_id, (requester_id, requester_addr))) = forward {
            let incarnation = self.current_incarnation().await;
            let ack = Frame::new_ack(&self.local_id, incarnation, seq, &target_id);
            if let Err(e) = self
                .send_frame(&ack, &requester_addr.ip().to_string(), requester_addr.port())
                .await
            {
                warn!(error = %e, requester = %requester_id, "failed to relay correlated ack");
            }
        }
    }

    async fn apply_sync(&self, records: Vec<NodeUpdateRecord>) {
        let mut transitions = Vec::new();
        {
            let mut nodes = self.nodes.write().await;
            for record in records {
                if record.id == self.local_id {
                    continue;
                }
                if !nodes.contains_key(&record.id) {
                    if nodes.len() >= MAX_NODES {
                        warn!(node_id = %record.id, "dropping sync record: node table at capacity");
                        continue;
                    }
                    nodes.insert(
                        record.id.clone(),
                        Node::new(record.id.clone(), record.address.clone(), record.port),
                    );
                }
                if let Some(node) = nodes.get_mut(&record.id) {
                    if let Some((old, new)) = node.apply_remote(record.state, record.incarnation, record.is_main) {
                        transitions.push((node.clone(), old, new));
                    }
                }
            }
        }
        for (node, old, new) in transitions {
            self.fire_node_event(&node, old, new).await;
        }
    }
}
