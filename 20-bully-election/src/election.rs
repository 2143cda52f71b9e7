//! The Bully election state machine.
//!
//! [`ElectionState`] does no I/O. Every handler takes the current time and
//! returns the [`Effect`]s the node must carry out: messages to send, timers
//! to arm or cancel, or a shutdown request. The node task owns the state and
//! is the only caller, so role, coordinator and peer set are never touched
//! concurrently.
//!
//! # Rules
//!
//! - The highest live id wins. ELECTION only goes to peers with a greater id.
//! - An electing node that hears no OK before its election timer fires
//!   declares itself coordinator and starts heartbeating.
//! - A COORDINATOR claim is accepted only from a greater id, only when it is
//!   not older than the last accepted claim, and never while electing.
//! - Any OK ends the round; the node then waits for an announcement.
//! - A node that is not leading and hears nothing from a coordinator for
//!   longer than the coordinator timeout starts a new election, even while a
//!   previous round is still open.

use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::NodeId;
use crate::config::{NodeConfig, derive_addr};
use crate::message::{Message, MessageKind};
use crate::registry::{PeerRef, PeerRegistry};

/// Where a node stands in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Following a known coordinator, or waiting for one to be announced.
    Idle,
    /// ELECTION sent; waiting for an OK or for the election timer.
    Electing { since: Instant },
    /// Leading and heartbeating.
    Coordinator,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Idle => "Idle",
            Role::Electing { .. } => "Electing",
            Role::Coordinator => "Coordinator",
        }
    }

    pub fn is_electing(&self) -> bool {
        matches!(self, Role::Electing { .. })
    }

    pub fn is_coordinator(&self) -> bool {
        matches!(self, Role::Coordinator)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Work requested by the state machine.
///
/// The node executes effects in the order they are returned. Sends are
/// fire-and-forget; the state machine never learns whether they landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Deliver a fresh message of `kind` to one peer.
    Send { to: PeerRef, kind: MessageKind },
    /// Deliver a fresh message of `kind` to each listed peer.
    Broadcast { to: Vec<PeerRef>, kind: MessageKind },
    /// Arm (or re-arm) the one-shot election timer for `round`.
    ArmElectionTimer { round: u64 },
    /// The current round is resolved; its timer must not fire.
    CancelElectionTimer,
    /// Begin periodic COORDINATOR_ALIVE broadcasts.
    StartHeartbeat,
    /// No longer coordinator; stop heartbeating.
    StopHeartbeat,
    /// Leave the cluster (FORCE_STOP).
    Shutdown,
}

/// One node's view of the election: its role, the coordinator it follows
/// and the peers it knows.
pub struct ElectionState {
    /// This node's id.
    id: NodeId,
    /// Host and base port used to address peers learned from messages.
    host: IpAddr,
    base_port: u16,
    /// Silence after which the coordinator is presumed dead.
    coordinator_timeout: Duration,
    role: Role,
    /// `None` until a coordinator is announced or this node leads.
    coordinator_id: Option<NodeId>,
    /// Last sign of life from a coordinator (or the last election start).
    last_coordinator_alive: Instant,
    /// Sender timestamp of the newest accepted COORDINATOR claim.
    last_accepted_coordinator_timestamp: u64,
    /// Bumped on every election start so stale timer firings are ignored.
    round: u64,
    registry: PeerRegistry,
}

impl ElectionState {
    /// Creates an idle node that knows `config.peers`, minus itself.
    pub fn new(config: &NodeConfig, now: Instant) -> Self {
        Self {
            id: config.id,
            host: config.host,
            base_port: config.base_port,
            coordinator_timeout: config.timing.coordinator_timeout,
            role: Role::Idle,
            coordinator_id: None,
            last_coordinator_alive: now,
            last_accepted_coordinator_timestamp: 0,
            round: 0,
            registry: config
                .peers
                .iter()
                .copied()
                .filter(|peer| peer.id != config.id)
                .collect(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Current role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The coordinator this node follows; its own id while it leads.
    pub fn coordinator_id(&self) -> Option<NodeId> {
        self.coordinator_id
    }

    /// Peers currently known to this node.
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Number of the latest election round, 0 before the first one.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Announces this node to its initial peers and opens the first election.
    pub fn start(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.broadcast(self.registry.snapshot(), MessageKind::NewProcess, &mut effects);
        self.start_election(now, &mut effects);
        effects
    }

    /// Applies one inbound message.
    pub fn handle_message(&mut self, message: Message, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        let sender = message.sender_id;

        if message.kind == MessageKind::ForceStop {
            info!(node = self.id, "force stop requested");
            effects.push(Effect::Shutdown);
            return effects;
        }
        if sender == self.id {
            warn!(node = self.id, kind = %message.kind, "ignoring message that claims to come from this node");
            return effects;
        }
        if !matches!(message.kind, MessageKind::Stop | MessageKind::CoordinatorStop) {
            self.learn(sender);
        }

        match message.kind {
            MessageKind::NewProcess => {}
            MessageKind::Election => self.on_election(sender, now, &mut effects),
            MessageKind::Ok => self.on_ok(sender, &mut effects),
            MessageKind::Coordinator => {
                self.on_coordinator(sender, message.timestamp, now, &mut effects)
            }
            MessageKind::CoordinatorAlive => self.on_coordinator_alive(sender, now, &mut effects),
            MessageKind::Stop => self.on_stop(sender, now, &mut effects),
            MessageKind::CoordinatorStop => self.on_coordinator_stop(sender, now, &mut effects),
            MessageKind::ForceStop => {}
        }
        effects
    }

    /// The election timer for `round` expired.
    pub fn on_election_timeout(&mut self, round: u64, _now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        if !self.role.is_electing() || round != self.round {
            debug!(node = self.id, round, current = self.round, "ignoring stale election timer");
            return effects;
        }

        info!(node = self.id, "no OK received, declaring self coordinator");
        self.transition(Role::Coordinator, &mut effects);
        self.coordinator_id = Some(self.id);
        self.broadcast(self.registry.snapshot(), MessageKind::Coordinator, &mut effects);
        effects.push(Effect::StartHeartbeat);
        effects
    }

    /// The heartbeat timer ticked.
    pub fn on_heartbeat_tick(&self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.role.is_coordinator() {
            self.broadcast(self.registry.snapshot(), MessageKind::CoordinatorAlive, &mut effects);
        } else {
            effects.push(Effect::StopHeartbeat);
        }
        effects
    }

    /// No connection arrived within the coordinator timeout. Followers and
    /// stalled elections both start a fresh round once the coordinator has
    /// been silent too long.
    pub fn on_accept_timeout(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.role.is_coordinator() {
            return effects;
        }
        let silence = now.saturating_duration_since(self.last_coordinator_alive);
        if silence > self.coordinator_timeout {
            info!(
                node = self.id,
                silence_ms = silence.as_millis() as u64,
                "coordinator presumed dead"
            );
            self.start_election(now, &mut effects);
        }
        effects
    }

    /// Leaves the cluster: tells every known peer and cancels both timers.
    pub fn shutdown(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        let farewell = if self.role.is_coordinator() {
            MessageKind::CoordinatorStop
        } else {
            MessageKind::Stop
        };
        self.broadcast(self.registry.snapshot(), farewell, &mut effects);
        self.role = Role::Idle;
        self.coordinator_id = None;
        effects.push(Effect::StopHeartbeat);
        effects.push(Effect::CancelElectionTimer);
        effects
    }

    fn on_election(&mut self, sender: NodeId, now: Instant, effects: &mut Vec<Effect>) {
        if !self.role.is_electing() {
            self.start_election(now, effects);
        }
        // OK goes back unconditionally, whatever the sender's id.
        match self.registry.get(sender) {
            Some(peer) => effects.push(Effect::Send {
                to: peer,
                kind: MessageKind::Ok,
            }),
            None => warn!(node = self.id, peer = sender, "no address to answer ELECTION"),
        }
    }

    fn on_ok(&mut self, sender: NodeId, effects: &mut Vec<Effect>) {
        if self.role.is_electing() {
            debug!(node = self.id, peer = sender, "election answered, awaiting an announcement");
            self.transition(Role::Idle, effects);
        }
    }

    fn on_coordinator(
        &mut self,
        sender: NodeId,
        timestamp: u64,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        if self.role.is_electing() {
            debug!(node = self.id, peer = sender, "election in flight, ignoring COORDINATOR");
            return;
        }
        if sender <= self.id || timestamp < self.last_accepted_coordinator_timestamp {
            debug!(node = self.id, peer = sender, timestamp, "rejecting COORDINATOR claim");
            return;
        }

        self.coordinator_id = Some(sender);
        self.last_accepted_coordinator_timestamp = timestamp;
        self.last_coordinator_alive = now;
        self.transition(Role::Idle, effects);
    }

    fn on_coordinator_alive(&mut self, sender: NodeId, now: Instant, effects: &mut Vec<Effect>) {
        self.last_coordinator_alive = now;
        if sender > self.id {
            self.coordinator_id = Some(sender);
            self.transition(Role::Idle, effects);
        }
    }

    fn on_stop(&mut self, sender: NodeId, now: Instant, effects: &mut Vec<Effect>) {
        self.registry.remove(sender);
        if self.coordinator_id == Some(sender) {
            self.coordinator_id = None;
        }
        if self.role.is_electing() && sender > self.id {
            self.start_election(now, effects);
        }
    }

    fn on_coordinator_stop(&mut self, sender: NodeId, now: Instant, effects: &mut Vec<Effect>) {
        if self.role.is_coordinator() {
            self.transition(Role::Idle, effects);
        }
        self.coordinator_id = None;
        self.registry.remove(sender);
        if self.role.is_electing() {
            self.start_election(now, effects);
        }
    }

    fn start_election(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        self.transition(Role::Electing { since: now }, effects);
        self.round += 1;
        self.last_coordinator_alive = now;
        info!(node = self.id, round = self.round, "starting election");

        self.broadcast(self.registry.higher_than(self.id), MessageKind::Election, effects);
        effects.push(Effect::ArmElectionTimer { round: self.round });
    }

    /// Commits a role change together with the timer cancellations it implies.
    fn transition(&mut self, next: Role, effects: &mut Vec<Effect>) {
        match (self.role, next) {
            (Role::Coordinator, Role::Coordinator) => {}
            (Role::Coordinator, _) => effects.push(Effect::StopHeartbeat),
            (Role::Electing { .. }, Role::Electing { .. }) => {}
            (Role::Electing { .. }, _) => effects.push(Effect::CancelElectionTimer),
            (Role::Idle, _) => {}
        }
        self.role = next;
    }

    fn broadcast(&self, to: Vec<PeerRef>, kind: MessageKind, effects: &mut Vec<Effect>) {
        if !to.is_empty() {
            effects.push(Effect::Broadcast { to, kind });
        }
    }

    fn learn(&mut self, id: NodeId) {
        if self.registry.contains(id) {
            return;
        }
        match derive_addr(self.host, self.base_port, id) {
            Ok(addr) => {
                self.registry.add(PeerRef::new(id, addr));
                debug!(node = self.id, peer = id, %addr, "learned new peer");
            }
            Err(err) => warn!(node = self.id, peer = id, error = %err, "cannot address peer"),
        }
    }
}
