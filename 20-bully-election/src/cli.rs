use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;

use crate::NodeId;
use crate::config::{
    COORDINATOR_TIMEOUT, ConfigError, ELECTION_TIMEOUT, NodeConfig, PEER_BASE_PORT, SEND_TIMEOUT,
    Timing, parse_peer_list,
};

/// Command line of the `node` binary, as launched by the control console:
/// `node <nodeId> <logSinkPort> <peerList>`.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Bully leader-election node", long_about = None)]
pub struct NodeArgs {
    /// Id of this node. It listens on `base-port + node-id`.
    pub node_id: NodeId,

    /// Port of the central log collector. Use 0 to disable it.
    pub log_sink_port: u16,

    /// Comma-separated `id:port` list of peers known at launch. May be empty.
    #[arg(default_value = "")]
    pub peers: String,

    /// Host every node and the log collector are reached on.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub host: IpAddr,

    /// Port of node 0; node `n` listens on `base-port + n`.
    #[arg(long, default_value_t = PEER_BASE_PORT)]
    pub base_port: u16,

    /// Silence after which a coordinator is presumed dead.
    #[arg(long, default_value_t = COORDINATOR_TIMEOUT.as_millis() as u64)]
    pub coordinator_timeout_ms: u64,

    /// How long an election waits for an OK before self-declaring.
    #[arg(long, default_value_t = ELECTION_TIMEOUT.as_millis() as u64)]
    pub election_timeout_ms: u64,

    /// Bound on each outbound connect + write.
    #[arg(long, default_value_t = SEND_TIMEOUT.as_millis() as u64)]
    pub send_timeout_ms: u64,
}

impl NodeArgs {
    pub fn into_config(self) -> Result<NodeConfig, ConfigError> {
        let peers = parse_peer_list(&self.peers, self.host)?
            .into_iter()
            .filter(|peer| peer.id != self.node_id)
            .collect();
        let log_sink =
            (self.log_sink_port != 0).then(|| SocketAddr::new(self.host, self.log_sink_port));

        Ok(NodeConfig {
            id: self.node_id,
            host: self.host,
            base_port: self.base_port,
            log_sink,
            peers,
            timing: Timing {
                coordinator_timeout: Duration::from_millis(self.coordinator_timeout_ms),
                election_timeout: Duration::from_millis(self.election_timeout_ms),
                send_timeout: Duration::from_millis(self.send_timeout_ms),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_positional_launch_arguments() {
        let args = NodeArgs::try_parse_from(["node", "2", "9000", "0:7000,1:7001,2:7002"]).unwrap();
        let config = args.into_config().unwrap();

        assert_eq!(config.id, 2);
        assert_eq!(config.log_sink, Some("127.0.0.1:9000".parse().unwrap()));
        let peer_ids: Vec<_> = config.peers.iter().map(|peer| peer.id).collect();
        assert_eq!(peer_ids, vec![0, 1]);
        assert_eq!(config.timing, Timing::default());
        assert_eq!(config.listen_addr().unwrap(), "127.0.0.1:7002".parse().unwrap());
    }

    #[test]
    fn peer_list_may_be_empty_or_omitted() {
        let args = NodeArgs::try_parse_from(["node", "0", "9000", ""]).unwrap();
        assert!(args.into_config().unwrap().peers.is_empty());

        let args = NodeArgs::try_parse_from(["node", "0", "9000"]).unwrap();
        assert!(args.into_config().unwrap().peers.is_empty());
    }

    #[test]
    fn zero_sink_port_disables_the_sink() {
        let args = NodeArgs::try_parse_from(["node", "1", "0"]).unwrap();
        assert_eq!(args.into_config().unwrap().log_sink, None);
    }

    #[test]
    fn overrides_timing_and_addressing() {
        let args = NodeArgs::try_parse_from([
            "node",
            "1",
            "0",
            "",
            "--base-port",
            "18000",
            "--coordinator-timeout-ms",
            "600",
            "--election-timeout-ms",
            "400",
        ])
        .unwrap();
        let config = args.into_config().unwrap();

        assert_eq!(config.listen_addr().unwrap(), "127.0.0.1:18001".parse().unwrap());
        assert_eq!(config.timing.heartbeat_interval(), Duration::from_millis(300));
        assert_eq!(config.timing.election_timeout, Duration::from_millis(400));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(NodeArgs::try_parse_from(["node"]).is_err());
        assert!(NodeArgs::try_parse_from(["node", "-1", "9000"]).is_err());

        let args = NodeArgs::try_parse_from(["node", "1", "9000", "2-7002"]).unwrap();
        assert!(matches!(args.into_config(), Err(ConfigError::MalformedPeer(_))));
    }
}
