//! Node binary

use clap::{Parser, Subcommand};
use nodemesh::{ClusterNode, Collaborators, ErrorCode, NodeConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "nodemesh-node")]
#[command(about = "nodemesh cluster node", version = nodemesh::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node
    Serve {
        /// Config file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Cluster listener address
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Address other nodes should dial
        #[arg(long)]
        advertise: Option<String>,

        /// Directory for persisted node state
        #[arg(long)]
        data: Option<PathBuf>,

        /// Create a cluster with this node as its first member
        #[arg(long)]
        create_cluster: bool,

        /// Onboard the node at this address once started (repeatable)
        #[arg(long = "add-node")]
        add_node: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            listen,
            advertise,
            data,
            create_cluster,
            add_node,
        } => {
            // File and environment first, CLI flags win
            let mut node_config = NodeConfig::load(config.as_deref())?;
            if let Some(listen) = listen {
                node_config.cluster_addr = listen;
            }
            if advertise.is_some() {
                node_config.advertise_addr = advertise;
            }
            if data.is_some() {
                node_config.data_dir = data;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| node_config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            let node = ClusterNode::start(node_config, Collaborators::default()).await?;

            if create_cluster {
                match node.manager().create_cluster() {
                    Ok(id) => tracing::info!("Cluster {} created", id),
                    Err(e) if e.code() == Some(ErrorCode::AlreadyACluster) => {
                        tracing::info!("{}", e)
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            for addr in &add_node {
                match node.manager().add_node(addr).await {
                    Ok(id) => tracing::info!("Node {} at {} onboarded", id, addr),
                    Err(e) => tracing::error!("Failed to onboard {}: {}", addr, e),
                }
            }

            tokio::signal::ctrl_c().await?;
            node.shutdown().await;
        }
    }

    Ok(())
}
