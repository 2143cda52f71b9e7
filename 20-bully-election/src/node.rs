//! Node lifecycle and the event loop.
//!
//! A node is one tokio task that owns the [`ElectionState`] and the
//! listening socket. It waits on four sources at once:
//!
//! - **Requests** from a [`NodeHandle`] (status queries, stop)
//! - **Timer events** from the election monitor and the heartbeat
//! - **Inbound connections**, each carrying exactly one message
//! - **The idle deadline**: no connection for a whole coordinator timeout
//!   means it is time to check whether the coordinator is still alive
//!
//! Only this task mutates node state, so no locks are needed. Outbound sends
//! run as short-lived tasks so a slow peer never stalls the loop.

use std::net::SocketAddr;
use std::ops::ControlFlow;

use anyhow::{Context, Result, anyhow};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::NodeId;
use crate::config::{NodeConfig, Timing};
use crate::election::{Effect, ElectionState, Role};
use crate::log_sink::LogSink;
use crate::message::{Message, MessageKind};
use crate::registry::PeerRef;
use crate::timers::{TimerEvent, Timers};
use crate::transport::{Transport, receive_line};

/// Snapshot of a node's view of the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: Role,
    pub coordinator_id: Option<NodeId>,
    pub peers: Vec<NodeId>,
}

enum NodeRequest {
    Status { respond_to: oneshot::Sender<NodeStatus> },
    Stop { respond_to: oneshot::Sender<()> },
}

/// A bound but not yet running node.
pub struct Node {
    config: NodeConfig,
    listener: TcpListener,
}

impl Node {
    /// Binds the listening socket on `host:(base_port + id)`.
    ///
    /// Fails if the port is taken; the control plane has to pick another id.
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        let addr = config.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("node {} failed to listen on {addr}", config.id))?;
        Ok(Self { config, listener })
    }

    pub fn id(&self) -> NodeId {
        self.config.id
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Starts the node task: announce, elect, then serve until stopped.
    pub fn spawn(self) -> NodeHandle {
        let Node { config, listener } = self;
        let id = config.id;
        let (request_tx, request_rx) = mpsc::channel(16);
        let stopped = CancellationToken::new();

        let task = NodeTask::new(config, request_rx);
        let done = stopped.clone();
        let join = tokio::spawn(async move {
            let result = task.run(listener).await;
            done.cancel();
            result
        });

        NodeHandle {
            id,
            request_tx,
            stopped,
            join,
        }
    }
}

/// Controls a running node.
pub struct NodeHandle {
    id: NodeId,
    request_tx: mpsc::Sender<NodeRequest>,
    stopped: CancellationToken,
    join: JoinHandle<Result<()>>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Current role, coordinator and peers, as seen by the node.
    pub async fn status(&self) -> Result<NodeStatus> {
        let (respond_to, response) = oneshot::channel();
        self.request_tx
            .send(NodeRequest::Status { respond_to })
            .await
            .map_err(|_| anyhow!("node {} is not running", self.id))?;
        response
            .await
            .map_err(|_| anyhow!("node {} stopped before answering", self.id))
    }

    /// Stops the node and waits until its goodbye messages are out. Stopping
    /// a node that already stopped is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        if self
            .request_tx
            .send(NodeRequest::Stop { respond_to })
            .await
            .is_err()
        {
            return Ok(());
        }
        let _ = response.await;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.is_cancelled()
    }

    /// Resolves once the node has shut down, for whatever reason.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await
    }

    /// Waits for the node task and returns its result.
    pub async fn join(self) -> Result<()> {
        self.join.await.context("node task panicked")?
    }
}

/// The state owned by the running node task.
struct NodeTask {
    id: NodeId,
    timing: Timing,
    state: ElectionState,
    transport: Transport,
    timers: Timers,
    timer_rx: UnboundedReceiver<TimerEvent>,
    requests: mpsc::Receiver<NodeRequest>,
    outbound: JoinSet<()>,
    sink: LogSink,
    last_role: Role,
}

impl NodeTask {
    fn new(config: NodeConfig, requests: mpsc::Receiver<NodeRequest>) -> Self {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let sink = match config.log_sink {
            Some(addr) => LogSink::connect(addr, config.timing.send_timeout),
            None => LogSink::disabled(),
        };
        let state = ElectionState::new(&config, Instant::now().into_std());
        let last_role = state.role();

        Self {
            id: config.id,
            timing: config.timing,
            transport: Transport::new(config.id, config.timing.send_timeout),
            timers: Timers::new(config.timing, timer_tx),
            state,
            timer_rx,
            requests,
            outbound: JoinSet::new(),
            sink,
            last_role,
        }
    }

    async fn run(mut self, listener: TcpListener) -> Result<()> {
        info!(node = self.id, addr = ?listener.local_addr().ok(), "node started");
        self.sink.emit(format!("Process {} started.", self.id));

        let effects = self.state.start(Instant::now().into_std());
        let mut flow = self.apply(effects);

        let idle = sleep(self.timing.coordinator_timeout);
        tokio::pin!(idle);
        let mut stop_waiter = None;

        while flow.is_continue() {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(NodeRequest::Status { respond_to }) => {
                        let _ = respond_to.send(self.status());
                    }
                    Some(NodeRequest::Stop { respond_to }) => {
                        stop_waiter = Some(respond_to);
                        flow = ControlFlow::Break(());
                    }
                    // Every handle is gone; nobody can stop us later.
                    None => flow = ControlFlow::Break(()),
                },
                Some(event) = self.timer_rx.recv() => {
                    flow = self.on_timer(event);
                }
                accepted = listener.accept() => {
                    idle.as_mut().reset(Instant::now() + self.timing.coordinator_timeout);
                    match accepted {
                        Ok((stream, peer)) => flow = self.dispatch(stream, peer).await,
                        Err(err) => warn!(node = self.id, error = ?err, "failed to accept connection"),
                    }
                }
                () = &mut idle => {
                    idle.as_mut().reset(Instant::now() + self.timing.coordinator_timeout);
                    let effects = self.state.on_accept_timeout(Instant::now().into_std());
                    flow = self.apply(effects);
                }
            }
        }

        self.shutdown().await;
        drop(listener);
        info!(node = self.id, "node stopped");
        self.sink.emit(format!("exit: {}", self.id));
        self.sink.close().await;

        if let Some(respond_to) = stop_waiter {
            let _ = respond_to.send(());
        }
        Ok(())
    }

    /// Reads, decodes and handles the one message a connection carries.
    async fn dispatch(&mut self, stream: TcpStream, peer: SocketAddr) -> ControlFlow<()> {
        let line = match receive_line(stream, self.timing.send_timeout).await {
            Ok(Some(line)) => line,
            Ok(None) => return ControlFlow::Continue(()),
            Err(err) => {
                debug!(node = self.id, %peer, error = ?err, "dropping connection");
                return ControlFlow::Continue(());
            }
        };

        let message = match Message::decode(&line) {
            Ok(message) => message,
            Err(err) => {
                debug!(node = self.id, %peer, error = %err, "discarding undecodable line");
                return ControlFlow::Continue(());
            }
        };

        debug!(node = self.id, from = message.sender_id, kind = %message.kind, "received");
        self.sink.emit(format!(
            "Process {} received: {}",
            self.id,
            message.to_log_string()
        ));
        let effects = self.state.handle_message(message, Instant::now().into_std());
        self.apply(effects)
    }

    fn on_timer(&mut self, event: TimerEvent) -> ControlFlow<()> {
        let effects = match event {
            TimerEvent::ElectionDeadline { round } => self
                .state
                .on_election_timeout(round, Instant::now().into_std()),
            TimerEvent::Heartbeat => {
                if self.state.role().is_coordinator() {
                    self.sink.emit(format!(
                        "Process {} sending alive message to other processes.",
                        self.id
                    ));
                }
                self.state.on_heartbeat_tick()
            }
        };
        self.apply(effects)
    }

    fn apply(&mut self, effects: Vec<Effect>) -> ControlFlow<()> {
        let mut flow = ControlFlow::Continue(());
        for effect in effects {
            match effect {
                Effect::Send { to, kind } => self.send(vec![to], kind),
                Effect::Broadcast { to, kind } => self.send(to, kind),
                Effect::ArmElectionTimer { round } => self.timers.arm_election(round),
                Effect::CancelElectionTimer => self.timers.cancel_election(),
                Effect::StartHeartbeat => self.timers.start_heartbeat(),
                Effect::StopHeartbeat => self.timers.stop_heartbeat(),
                Effect::Shutdown => flow = ControlFlow::Break(()),
            }
        }
        self.log_role_change();
        flow
    }

    fn send(&mut self, peers: Vec<PeerRef>, kind: MessageKind) {
        while self.outbound.try_join_next().is_some() {}
        let transport = self.transport.clone();
        self.outbound.spawn(async move {
            transport.broadcast(&peers, kind).await;
        });
    }

    /// Says goodbye to every known peer, then cancels both timers.
    async fn shutdown(&mut self) {
        // Let in-flight sends land first so nothing trails the goodbye.
        while self.outbound.join_next().await.is_some() {}

        for effect in self.state.shutdown() {
            if let Effect::Broadcast { to, kind } = effect {
                let delivered = self.transport.broadcast(&to, kind).await;
                debug!(node = self.id, %kind, delivered, total = to.len(), "farewell sent");
            }
        }
        self.timers.cancel_all();
        self.log_role_change();
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            role: self.state.role(),
            coordinator_id: self.state.coordinator_id(),
            peers: self.state.registry().ids(),
        }
    }

    fn log_role_change(&mut self) {
        let current = self.state.role();
        if current.name() == self.last_role.name() {
            return;
        }
        info!(
            node = self.id,
            from = %self.last_role,
            to = %current,
            coordinator = ?self.state.coordinator_id(),
            "role changed"
        );
        let line = match current {
            Role::Coordinator => format!("Process {} is the new coordinator.", self.id),
            Role::Electing { .. } => format!("Process {} initiated an election.", self.id),
            Role::Idle => match self.state.coordinator_id() {
                Some(coordinator) => format!(
                    "Process {} acknowledges coordinator {coordinator}.",
                    self.id
                ),
                None => format!("Process {} is waiting for a coordinator.", self.id),
            },
        };
        self.sink.emit(line);
        self.last_role = current;
    }
}
