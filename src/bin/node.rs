//! quorumkv node binary

use clap::{Parser, Subcommand};
use quorumkv::node::NodeService;
use quorumkv::{Config, Node};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "quorumkv-node")]
#[command(about = "replicated coordination service node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a replica
    Serve {
        /// Node ID, host:port; doubles as the gRPC bind address
        #[arg(long)]
        id: String,

        /// Cluster members (comma-separated host:port list)
        #[arg(long, value_delimiter = ',')]
        members: Vec<String>,

        /// Data directory (meta, KV stores, users)
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,

        /// Binlog directory
        #[arg(long, default_value = "./binlog")]
        binlog_dir: PathBuf,

        /// Snapshot directory
        #[arg(long, default_value = "./snapshot")]
        snapshot_dir: PathBuf,

        /// Start quiet: wait for a committed AddNode before electing
        #[arg(long)]
        quiet: bool,

        /// Optional JSON config file; CLI flags take priority
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            id,
            members,
            data_dir,
            binlog_dir,
            snapshot_dir,
            quiet,
            config,
        } => {
            let mut cfg = match config {
                Some(path) => Config::from_file(path)?,
                None => Config::new(id.clone(), members.clone()),
            };
            cfg.server_id = id;
            if !members.is_empty() {
                cfg.members = members;
            }
            cfg.data_dir = data_dir;
            cfg.binlog_dir = binlog_dir;
            cfg.snapshot_dir = snapshot_dir;
            cfg.quiet = cfg.quiet || quiet;
            cfg.validate()?;

            let bind_addr: SocketAddr = cfg.server_id.parse()?;
            let node = Node::new(cfg)?;
            node.start();

            tracing::info!("quorumkv {} serving on {}", quorumkv::VERSION, bind_addr);
            let service = NodeService::new(node.clone());
            tonic::transport::Server::builder()
                .add_service(service.into_server())
                .serve_with_shutdown(bind_addr, async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
            node.shutdown();
        }
    }

    Ok(())
}
