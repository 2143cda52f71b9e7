//! Bully leader election over one-shot TCP messages.
//!
//! Every node knows a set of peers identified by integer ids. The highest live
//! id becomes the coordinator and proves it is alive with periodic
//! heartbeats; when heartbeats stop, the survivors elect a new one.
//!
//! # Architecture
//!
//! Each node is a single tokio task that owns all of its mutable state:
//!
//! - **Node task**: accepts connections, decodes one message per connection,
//!   feeds the election state machine and carries out its effects
//! - **Timer tasks**: the one-shot election monitor and the coordinator
//!   heartbeat, which only post events back to the node task
//! - **Send tasks**: short-lived, one connection per outbound message
//! - **Log sink task**: forwards event lines to the central collector
//!
//! The state machine itself ([`election::ElectionState`]) does no I/O, so the
//! protocol rules are unit-tested without sockets or clocks.
//!
//! # Modules
//!
//! - [`message`]: the `"<millis> | From: <id> | <TYPE>"` line codec
//! - [`registry`]: a node's known peers
//! - [`transport`]: one-shot sends and single-line reads
//! - [`election`]: roles, transitions and the effects they produce
//! - [`timers`]: cancellable election and heartbeat timers
//! - [`node`]: lifecycle, event loop and [`node::NodeHandle`]
//! - [`config`] / [`cli`]: launch parameters and protocol constants
//! - [`log_sink`]: best-effort forwarding to the central log

pub mod cli;
pub mod config;
pub mod election;
pub mod log_sink;
pub mod message;
pub mod node;
pub mod registry;
pub mod timers;
pub mod transport;

/// Node identity; also the tie-breaking order and the port offset.
pub type NodeId = u32;
