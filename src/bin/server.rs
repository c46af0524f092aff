use anyhow::{anyhow, Result};
use clap::Parser;
use log::info;
use raft_kv::net;
use raft_kv::raft::{NodeConfig, RaftNode};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Run a single raft-kv node.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Unique node identifier
    #[arg(long)]
    node_id: String,

    /// Host address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long)]
    port: u16,

    /// Comma-separated peers (format: id=host:port,id2=host:port)
    #[arg(long, default_value = "")]
    peers: String,

    /// Minimum election timeout in milliseconds
    #[arg(long, default_value_t = 150)]
    election_timeout_min: u64,

    /// Maximum election timeout in milliseconds
    #[arg(long, default_value_t = 300)]
    election_timeout_max: u64,

    /// Leader heartbeat interval in milliseconds
    #[arg(long, default_value_t = 50)]
    heartbeat_interval: u64,

    /// Directory for persistent state
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
}

fn parse_peers(raw: &str) -> Result<HashMap<String, String>> {
    let mut peers = HashMap::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (id, addr) = part
            .split_once('=')
            .ok_or_else(|| anyhow!("peer '{}' is not id=host:port", part))?;
        peers.insert(id.to_string(), addr.to_string());
    }
    Ok(peers)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = NodeConfig {
        node_id: args.node_id,
        bind_addr: format!("{}:{}", args.host, args.port),
        peers: parse_peers(&args.peers)?,
        election_timeout_min: args.election_timeout_min,
        election_timeout_max: args.election_timeout_max,
        heartbeat_interval: args.heartbeat_interval,
        data_dir: args.data_dir,
    };

    let listener = net::bind(&config.bind_addr)?;
    info!(
        "[{}] listening on {} with {} peers",
        config.node_id,
        config.bind_addr,
        config.peers.len()
    );

    let node = Arc::new(RaftNode::new(config)?);
    Arc::clone(&node).start();
    let server = net::serve(listener, Arc::clone(&node));

    tokio::signal::ctrl_c().await?;
    info!("[{}] shutting down", node.config.node_id);
    server.abort();
    node.shutdown().await;
    Ok(())
}
