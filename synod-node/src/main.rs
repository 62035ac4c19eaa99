//! Synod node REPL
//!
//! Runs one cluster member and an interactive prompt for the replicated
//! calendar.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use synod_core::{ClusterTable, NodeId};
use synod_node::{FjallStore, Node, NodeConfig, ReplContext};
use tokio::net::UdpSocket;
use tracing::info;

/// Synod node
#[derive(Parser, Debug)]
#[command(name = "synod-node")]
#[command(about = "Run a synod cluster member with an interactive REPL")]
struct Args {
    /// Cluster membership file (`nodeID,ip,controlPort,dataPort` per line)
    #[arg(short, long)]
    cluster: PathBuf,

    /// This node's id in the cluster file
    #[arg(short, long)]
    id: u32,

    /// Directory for persistent state
    #[arg(short, long, default_value = "./synod-data")]
    data: PathBuf,

    /// Reuse persisted state from a previous run
    #[arg(long)]
    resume: bool,

    /// How long an election round waits for higher nodes
    #[arg(long, default_value_t = 3000)]
    election_timeout_ms: u64,

    /// How often a new election round starts
    #[arg(long, default_value_t = 6000)]
    election_poll_ms: u64,

    /// How long a proposer phase waits for a majority before retrying
    #[arg(long, default_value_t = 1000)]
    phase_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let id = NodeId(args.id);

    let cluster = ClusterTable::load(&args.cluster).map_err(|e| format!("{e:?}"))?;
    let member = *cluster
        .get(id)
        .ok_or_else(|| format!("{id} is not listed in {}", args.cluster.display()))?;
    let cluster = Arc::new(cluster);

    info!(path = ?args.data, "Opening data directory");
    let store = FjallStore::open(&args.data)
        .await
        .map_err(|e| format!("{e:?}"))?;

    let data = Arc::new(UdpSocket::bind(member.data_addr()).await?);
    let control = Arc::new(UdpSocket::bind(member.control_addr()).await?);
    info!(data = %member.data_addr(), control = %member.control_addr(), "sockets bound");

    let mut config = NodeConfig::new(id, cluster).resume(args.resume);
    config.election.reply_timeout = Duration::from_millis(args.election_timeout_ms);
    config.election.poll_interval = Duration::from_millis(args.election_poll_ms);
    config.proposer.phase_timeout = Duration::from_millis(args.phase_timeout_ms);

    let node = Node::start(config, store, data, control)
        .await
        .map_err(|e| format!("{e:?}"))?;
    let mut context = ReplContext::new(node);

    println!("Synod node {id}");
    println!("Type 'help' for available commands.\n");

    let mut rl = DefaultEditor::new()?;
    let history_path = args.data.join(".history");
    let _ = rl.load_history(&history_path);

    let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(1);
    let (resp_tx, mut resp_rx) = tokio::sync::mpsc::channel::<Result<String, String>>(1);

    let prompt = format!("{id}> ");
    tokio::task::spawn_blocking(move || {
        loop {
            match rl.readline(&prompt) {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    if line == "exit" || line == "quit" {
                        break;
                    }

                    let _ = rl.add_history_entry(line);
                    if tx.blocking_send(line.to_string()).is_err() {
                        break;
                    }

                    match resp_rx.blocking_recv() {
                        Some(Ok(output)) if !output.is_empty() => println!("{output}"),
                        Some(Err(e)) => eprintln!("Error: {e}"),
                        _ => {}
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("Interrupted. Use 'exit' to quit.");
                }
                Err(ReadlineError::Eof) => {
                    println!("Goodbye!");
                    break;
                }
                Err(e) => {
                    eprintln!("Readline error: {e}");
                    break;
                }
            }
        }

        let _ = rl.save_history(&history_path);
    });

    while let Some(line) = rx.recv().await {
        let res = context.execute(&line).await;
        let _ = resp_tx.send(res).await;
    }

    context.node.shutdown().await.map_err(|e| format!("{e:?}"))?;
    Ok(())
}
