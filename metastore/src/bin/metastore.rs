use std::path::PathBuf;
use std::sync::Arc;

use async_std::task::block_on;
use common::errors::*;
use metastore::{Metastore, NodeConfig};
use raft::LoopbackTransport;

/// Loads a `NodeConfig` from the TOML file named by the first CLI argument,
/// falling back to defaults (a single-node, no-peers cluster rooted at
/// `./data`) when none is given.
fn load_config() -> Result<NodeConfig> {
    match std::env::args().nth(1) {
        Some(path) => NodeConfig::load_toml(&PathBuf::from(path)),
        None => Ok(NodeConfig::default()),
    }
}

async fn run() -> Result<()> {
    let config = load_config()?;
    eprintln!("[metastore] starting node {} at {:?}", config.node_id, config.dir);

    // Single process per node; peers of other processes would be dialed
    // through a real `Transport` impl instead of this loopback.
    let transport = Arc::new(LoopbackTransport::new());
    let metastore = Metastore::open(config, transport).await?;
    let bundle = metastore.run();
    bundle.join().await;
    Ok(())
}

fn main() -> Result<()> {
    block_on(run())
}
