//! Node configuration and the protocol's timing constants.
//!
//! The defaults here are the compatibility constants every node in a cluster
//! must agree on: the base port used to derive addresses from ids and the
//! coordinator/election timeouts. Tests shrink the timings so scenarios finish
//! quickly, but the ratios stay the same.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;

use crate::NodeId;
use crate::registry::PeerRef;

/// Port that node 0 listens on; node `n` listens on `PEER_BASE_PORT + n`.
pub const PEER_BASE_PORT: u16 = 7000;

/// A coordinator that stays silent for longer than this is presumed dead.
pub const COORDINATOR_TIMEOUT: Duration = Duration::from_millis(3000);

/// How long an electing node waits for an OK before declaring itself.
pub const ELECTION_TIMEOUT: Duration = Duration::from_millis(2000);

/// Upper bound on a single outbound connect + write, and on reading one
/// inbound line.
pub const SEND_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("peer entry '{0}' must have the form <id>:<port>")]
    MalformedPeer(String),
    #[error("invalid node id in peer entry '{0}'")]
    InvalidPeerId(String),
    #[error("invalid port in peer entry '{0}'")]
    InvalidPeerPort(String),
    #[error("node id {id} does not fit a port above base port {base_port}")]
    PortOverflow { id: NodeId, base_port: u16 },
}

/// Timeouts driving failure detection and elections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub coordinator_timeout: Duration,
    pub election_timeout: Duration,
    pub send_timeout: Duration,
}

impl Timing {
    /// Coordinators broadcast COORDINATOR_ALIVE twice per timeout window.
    pub fn heartbeat_interval(&self) -> Duration {
        self.coordinator_timeout / 2
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            coordinator_timeout: COORDINATOR_TIMEOUT,
            election_timeout: ELECTION_TIMEOUT,
            send_timeout: SEND_TIMEOUT,
        }
    }
}

/// Everything a node needs to launch.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: NodeId,
    /// Host every node (and the log sink) is reached on.
    pub host: IpAddr,
    pub base_port: u16,
    /// Central log collector; `None` keeps log lines local.
    pub log_sink: Option<SocketAddr>,
    /// Peers known at launch, excluding this node.
    pub peers: Vec<PeerRef>,
    pub timing: Timing,
}

impl NodeConfig {
    /// Creates a configuration with the default host, base port and timings.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            base_port: PEER_BASE_PORT,
            log_sink: None,
            peers: Vec::new(),
            timing: Timing::default(),
        }
    }

    /// The address this node binds its listener to.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        derive_addr(self.host, self.base_port, self.id)
    }
}

/// Derives `host:(base_port + id)`, the address a peer without an explicit
/// port is assumed to listen on.
pub fn derive_addr(host: IpAddr, base_port: u16, id: NodeId) -> Result<SocketAddr, ConfigError> {
    u16::try_from(id)
        .ok()
        .and_then(|offset| base_port.checked_add(offset))
        .map(|port| SocketAddr::new(host, port))
        .ok_or(ConfigError::PortOverflow { id, base_port })
}

/// Parses a comma-separated `id:port` list. Blank input yields no peers and
/// blank entries (e.g. a trailing comma) are skipped.
pub fn parse_peer_list(list: &str, host: IpAddr) -> Result<Vec<PeerRef>, ConfigError> {
    let mut peers = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (id, port) = entry
            .split_once(':')
            .ok_or_else(|| ConfigError::MalformedPeer(entry.to_string()))?;
        let id: NodeId = id
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidPeerId(entry.to_string()))?;
        let port: u16 = port
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidPeerPort(entry.to_string()))?;
        peers.push(PeerRef::new(id, SocketAddr::new(host, port)));
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn heartbeat_is_half_the_coordinator_timeout() {
        let timing = Timing::default();
        assert_eq!(timing.heartbeat_interval(), Duration::from_millis(1500));
        assert_eq!(timing.election_timeout, Duration::from_millis(2000));
    }

    #[test]
    fn listen_addr_is_base_port_plus_id() {
        let config = NodeConfig::new(3);
        assert_eq!(config.listen_addr().unwrap(), "127.0.0.1:7003".parse().unwrap());
    }

    #[test]
    fn derive_addr_rejects_overflowing_ids() {
        assert_eq!(
            derive_addr(localhost(), 65000, 1000),
            Err(ConfigError::PortOverflow {
                id: 1000,
                base_port: 65000
            })
        );
        assert!(derive_addr(localhost(), 7000, 70_000).is_err());
    }

    #[test]
    fn parses_peer_lists() {
        let peers = parse_peer_list("0:7000, 2:7002,", localhost()).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].id, 0);
        assert_eq!(peers[1].addr, "127.0.0.1:7002".parse().unwrap());
    }

    #[test]
    fn empty_peer_list_is_allowed() {
        assert!(parse_peer_list("", localhost()).unwrap().is_empty());
        assert!(parse_peer_list("  ", localhost()).unwrap().is_empty());
    }

    #[test]
    fn rejects_malformed_peer_entries() {
        assert!(matches!(
            parse_peer_list("7000", localhost()),
            Err(ConfigError::MalformedPeer(_))
        ));
        assert!(matches!(
            parse_peer_list("x:7000", localhost()),
            Err(ConfigError::InvalidPeerId(_))
        ));
        assert!(matches!(
            parse_peer_list("1:port", localhost()),
            Err(ConfigError::InvalidPeerPort(_))
        ));
    }
}
