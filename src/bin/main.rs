//! rbd-manager CLI - block image management API

use clap::{Parser, Subcommand};
use rbd_manager::api::Server;
use rbd_manager::engine::MemoryCluster;
use rbd_manager::features::{ALLOW_DISABLE, ALLOW_ENABLE};
use rbd_manager::{DuplicatePolicy, Feature, ImageService, Result, ServiceConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tabled::{Table, Tabled};

#[derive(Parser)]
#[command(name = "rbd-manager")]
#[command(about = "Management API for block images, snapshots, trash and namespaces")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start HTTP API server
    Serve {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Address to bind to, overrides the configuration
        #[arg(long)]
        bind: Option<SocketAddr>,
        /// What to do with a mutation on a busy resource: reject or queue
        #[arg(long)]
        duplicate_policy: Option<DuplicatePolicy>,
        /// Wait applied to every mutation before answering 202
        #[arg(long)]
        wait_for_ms: Option<u64>,
        /// Block pools to create in the in-memory cluster
        #[arg(long = "pool", default_value = "rbd")]
        pools: Vec<String>,
    },
    /// Show image features and whether they can be toggled
    Features,
    /// Print the effective configuration
    Config {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Tabled)]
struct FeatureRow {
    #[tabled(rename = "Feature")]
    name: &'static str,
    #[tabled(rename = "Bit")]
    bit: u64,
    #[tabled(rename = "Requires")]
    requires: String,
    #[tabled(rename = "Enable")]
    enable: &'static str,
    #[tabled(rename = "Disable")]
    disable: &'static str,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rbd_manager=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            bind,
            duplicate_policy,
            wait_for_ms,
            pools,
        } => {
            let mut config = load_config(config)?;
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(policy) = duplicate_policy {
                config.duplicate_policy = policy;
            }
            if wait_for_ms.is_some() {
                config.wait_for_ms = wait_for_ms;
            }
            config.validate()?;

            let cluster = MemoryCluster::new();
            for pool in &pools {
                cluster.add_pool(pool, true);
            }
            tracing::info!(pools = ?pools, "using in-memory cluster");

            let addr = config.bind;
            println!("Starting API server on http://{}", addr);
            println!();
            println!("Endpoints:");
            println!("  GET  /health                              Health check");
            println!("  GET  /api/block/image                     List images");
            println!("  POST /api/block/image                     Create image");
            println!("  GET  /api/block/image/trash               List trash");
            println!("  GET  /api/block/pool/:pool/namespace      List namespaces");
            println!("  GET  /api/task                            List tasks");
            println!();

            let service = ImageService::new(Arc::new(cluster), config);
            Server::new(service, addr).run().await?;
        }
        Commands::Features => cmd_features(),
        Commands::Config { config } => {
            let config = load_config(config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<ServiceConfig> {
    match path {
        Some(path) => ServiceConfig::from_file(path),
        None => Ok(ServiceConfig::default()),
    }
}

fn cmd_features() {
    let yes_no = |allowed: bool| if allowed { "yes" } else { "no" };
    let rows: Vec<FeatureRow> = Feature::ALL
        .iter()
        .map(|f| FeatureRow {
            name: f.name(),
            bit: f.bit(),
            requires: f
                .requires()
                .iter()
                .map(|r| r.name())
                .collect::<Vec<_>>()
                .join(", "),
            enable: yes_no(ALLOW_ENABLE.contains(f)),
            disable: yes_no(ALLOW_DISABLE.contains(f)),
        })
        .collect();
    println!("{}", Table::new(rows));
}
