use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use raft_kv::net;
use raft_kv::RpcMessage;
use std::time::Duration;

/// Longer than the server-side commit wait, so a slow commit still answers.
const RPC_DEADLINE: Duration = Duration::from_secs(6);
const MAX_ATTEMPTS: usize = 10;

/// Client for a raft-kv cluster: submits commands to whichever node
/// currently leads, following redirects from followers.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Cluster members (format: id=host:port,id2=host:port)
    #[arg(
        long,
        default_value = "node1=127.0.0.1:5001,node2=127.0.0.1:5002,node3=127.0.0.1:5003,node4=127.0.0.1:5004,node5=127.0.0.1:5005"
    )]
    cluster: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a value under a key
    Set { key: String, value: String },
    /// Read a key
    Get { key: String },
    /// Remove a key
    Delete { key: String },
    /// Replace one node's isolation set (no peer ids heals the node)
    Isolate {
        /// The node to reconfigure, as host:port
        addr: String,
        /// Peer ids to cut off
        peers: Vec<String>,
    },
}

fn parse_cluster(raw: &str) -> Result<Vec<(String, String)>> {
    let mut members = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (id, addr) = part
            .split_once('=')
            .ok_or_else(|| anyhow!("member '{}' is not id=host:port", part))?;
        members.push((id.to_string(), addr.to_string()));
    }
    if members.is_empty() {
        bail!("no cluster members given");
    }
    Ok(members)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let members = parse_cluster(&cli.cluster)?;

    match cli.command {
        Commands::Set { key, value } => submit(&members, format!("SET {} {}", key, value)).await,
        Commands::Get { key } => submit(&members, format!("GET {}", key)).await,
        Commands::Delete { key } => submit(&members, format!("DELETE {}", key)).await,
        Commands::Isolate { addr, peers } => isolate(&addr, peers).await,
    }
}

/// Walk the cluster until some node accepts the command. A "not leader"
/// answer that names the leader moves that node to the front of the next
/// pass; unreachable nodes are simply skipped.
async fn submit(members: &[(String, String)], command: String) -> Result<()> {
    let mut order: Vec<(String, String)> = members.to_vec();
    for attempt in 1..=MAX_ATTEMPTS {
        let mut redirect: Option<String> = None;
        for (id, addr) in &order {
            let request = RpcMessage::SubmitCommand {
                command: command.clone(),
            };
            match net::call(addr, &request, RPC_DEADLINE).await {
                Ok(RpcMessage::SubmitCommandResponse {
                    success: true,
                    message,
                    ..
                }) => {
                    println!("{}", message);
                    return Ok(());
                }
                Ok(RpcMessage::SubmitCommandResponse {
                    success: false,
                    message,
                    leader_id,
                }) => {
                    eprintln!("{} refused: {} (leader: {})", id, message, leader_id);
                    if leader_id != "unknown" {
                        redirect = Some(leader_id);
                        break;
                    }
                }
                Ok(other) => eprintln!("{} sent an unexpected reply: {:?}", id, other),
                Err(e) => eprintln!("{} unreachable: {}", id, e),
            }
        }
        if let Some(leader_id) = redirect {
            order.sort_by_key(|(id, _)| id != &leader_id);
        }
        if attempt < MAX_ATTEMPTS {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
    }
    bail!(
        "no node accepted '{}' after {} attempts",
        command,
        MAX_ATTEMPTS
    )
}

async fn isolate(addr: &str, peers: Vec<String>) -> Result<()> {
    let request = RpcMessage::Isolate {
        isolated_nodes: peers,
    };
    match net::call(addr, &request, RPC_DEADLINE).await? {
        RpcMessage::IsolateResponse { success, message } => {
            println!("{}", message);
            if !success {
                bail!("isolate request refused");
            }
            Ok(())
        }
        other => bail!("unexpected reply: {:?}", other),
    }
}
