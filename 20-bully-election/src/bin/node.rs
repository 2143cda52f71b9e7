//! Process entry point launched by the control console.
//!
//! ```bash
//! # Three nodes reporting to a log collector on port 9000
//! cargo run --bin node -- 0 9000 1:7001,2:7002
//! cargo run --bin node -- 1 9000 0:7000,2:7002
//! cargo run --bin node -- 2 9000 0:7000,1:7001
//! ```
//!
//! The node runs until it receives a FORCE_STOP line on its own port or the
//! process gets Ctrl-C; either way it says goodbye to its peers first.

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use bully_election::cli::NodeArgs;
use bully_election::node::Node;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = NodeArgs::parse().into_config()?;
    let node = Node::bind(config).await?;
    info!("node {} listening on {}", node.id(), node.local_addr()?);

    let handle = node.spawn();
    tokio::select! {
        () = handle.stopped() => {}
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => handle.stop().await?,
            Err(err) => {
                warn!(error = ?err, "failed to install ctrl-c handler");
                handle.stopped().await;
            }
        },
    }

    handle.join().await
}
