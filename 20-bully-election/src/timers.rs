//! The election monitor and the coordinator heartbeat.
//!
//! Both timers are small tokio tasks that never touch node state. When they
//! fire they post a [`TimerEvent`] to the node task, which decides what to do
//! with it. Each task watches its own `CancellationToken`, so cancelling wakes
//! a sleeping timer immediately.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Timing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// The election timer armed for `round` expired.
    ElectionDeadline { round: u64 },
    /// Time for the coordinator to broadcast COORDINATOR_ALIVE.
    Heartbeat,
}

/// Holds the cancellation token of at most one running timer task.
#[derive(Debug, Default)]
struct TimerSlot {
    token: Option<CancellationToken>,
}

impl TimerSlot {
    fn replace(&mut self, token: CancellationToken) {
        self.cancel();
        self.token = Some(token);
    }

    /// Cancelling an empty slot is a no-op.
    fn cancel(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }

    fn is_armed(&self) -> bool {
        self.token
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// The node's two timers. Dropping `Timers` cancels both.
pub struct Timers {
    timing: Timing,
    events: UnboundedSender<TimerEvent>,
    election: TimerSlot,
    heartbeat: TimerSlot,
}

impl Timers {
    pub fn new(timing: Timing, events: UnboundedSender<TimerEvent>) -> Self {
        Self {
            timing,
            events,
            election: TimerSlot::default(),
            heartbeat: TimerSlot::default(),
        }
    }

    /// Arms the one-shot election timer, replacing any earlier one.
    pub fn arm_election(&mut self, round: u64) {
        let token = CancellationToken::new();
        spawn_election_monitor(
            self.timing.election_timeout,
            round,
            self.events.clone(),
            token.clone(),
        );
        self.election.replace(token);
    }

    pub fn cancel_election(&mut self) {
        self.election.cancel();
    }

    /// Starts heartbeating unless a heartbeat is already running.
    pub fn start_heartbeat(&mut self) {
        if self.heartbeat.is_armed() {
            return;
        }
        let token = CancellationToken::new();
        spawn_heartbeat(
            self.timing.heartbeat_interval(),
            self.events.clone(),
            token.clone(),
        );
        self.heartbeat.replace(token);
    }

    pub fn stop_heartbeat(&mut self) {
        self.heartbeat.cancel();
    }

    pub fn cancel_all(&mut self) {
        self.election.cancel();
        self.heartbeat.cancel();
    }

    #[cfg(test)]
    fn election_armed(&self) -> bool {
        self.election.is_armed()
    }

    #[cfg(test)]
    fn heartbeat_running(&self) -> bool {
        self.heartbeat.is_armed()
    }
}

fn spawn_election_monitor(
    delay: Duration,
    round: u64,
    events: UnboundedSender<TimerEvent>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            () = token.cancelled() => {
                debug!(round, "election timer cancelled");
            }
            () = sleep(delay) => {
                let _ = events.send(TimerEvent::ElectionDeadline { round });
            }
        }
    });
}

fn spawn_heartbeat(period: Duration, events: UnboundedSender<TimerEvent>, token: CancellationToken) {
    tokio::spawn(async move {
        // First beat one period after becoming coordinator.
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    if events.send(TimerEvent::Heartbeat).is_err() {
                        break;
                    }
                }
            }
        }
        debug!("heartbeat stopped");
    });
}
