use aether_backend::config::AetherConfig;
use aether_backend::node::AetherNode;
use aether_backend::telemetry;
use aether_backend::utils::format_creation_date;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};

#[derive(Parser)]
#[command(author, version, about = "Aether peer-to-peer forum node")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node: accept peers, dial peers and commit on a schedule
    Serve,
    /// Sync with a single peer, commit the result and exit
    Connect {
        ip: IpAddr,
        port: u16,
    },
    /// Print local forum and network counters
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();

    let args = Args::parse();

    let config = AetherConfig::from_env()?;
    let node = AetherNode::start(config).await?;
    tracing::info!(
        node_id = %node.identity().identity.node_id,
        listening_port = node.identity().identity.listening_port,
        "bootstrap complete"
    );

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => node.run().await,
        Command::Connect { ip, port } => {
            let addr = SocketAddr::new(ip, port);
            let summary = node
                .connect_once(addr)
                .await
                .with_context(|| format!("sync with {addr} failed"))?;
            println!(
                "peer={} end={:?} posts_requested={} invalidated={}",
                summary.peer.as_deref().unwrap_or("-"),
                summary.end,
                summary.posts_requested,
                summary.sync_invalidated
            );
            Ok(())
        }
        Command::Stats => {
            let stats = node.stats()?;
            println!("topics:          {}", stats.topics);
            println!("subjects:        {}", stats.subjects);
            println!("replies:         {}", stats.replies);
            println!("connected nodes: {}", stats.connected_nodes);
            match stats.last_connection {
                Some(ts) => println!("last connection: {}", format_creation_date(ts)),
                None => println!("last connection: never"),
            }
            Ok(())
        }
    }
}
