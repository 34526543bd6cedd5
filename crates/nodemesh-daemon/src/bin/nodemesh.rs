//! NodeMesh CLI
//!
//! Usage:
//!   nodemesh run [--config PATH]        Run a mesh node
//!   nodemesh route <from> <to>          Resolve a route over the configured tree
//!   nodemesh config                     Print a sample configuration

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nodemesh_core::Config;
use nodemesh_daemon::forward::PortForwarder;
use nodemesh_daemon::net::{create_endpoint, serve, QuicLinkConnector};
use nodemesh_daemon::{MeshNode, NodeTable};

#[derive(Parser)]
#[command(name = "nodemesh")]
#[command(about = "Tree-structured node mesh with tunneled sessions", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: platform config directory)
    #[arg(short, long, global = true, env = "NODEMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a mesh node
    Run,

    /// Print the route between two configured nodes
    Route {
        /// Source node id
        from: String,
        /// Destination node id
        to: String,
    },

    /// Print a sample configuration file
    Config,
}

fn init_logging(verbose: bool, json: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false))
            .with(filter)
            .init();
    }
}

fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(Config::load_from(path)?),
        None => Ok(Config::load()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config => {
            print!("{}", Config::sample());
            Ok(())
        }
        Commands::Route { from, to } => {
            let config = load_config(cli.config.as_deref())?;
            let local = config.node.to_node_info();
            let table = NodeTable::from_nodes(
                &local.id,
                std::iter::once(local.clone()).chain(config.nodes.iter().cloned()),
            );
            let route = nodemesh_daemon::route::resolve_path(&table, &from, &to);
            if route.is_empty() {
                eprintln!("{} is unreachable from {}", to, from);
                std::process::exit(1);
            }
            println!("{}", route.join(" -> "));
            Ok(())
        }
        Commands::Run => {
            init_logging(cli.verbose, cli.json_logs);
            let mut config = load_config(cli.config.as_deref())?;
            if config.node.name.is_empty() {
                config.node.name = hostname::get()
                    .map(|h| h.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| config.node.id.clone());
            }
            run(config).await
        }
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let bind = SocketAddr::new(config.node.bind, config.node.port);
    let capacity = config.mesh.link_queue;
    let endpoint = create_endpoint(bind)?;

    let connector = Arc::new(QuicLinkConnector::new(endpoint.clone(), capacity));
    let mesh = MeshNode::new(config.clone(), connector)?;
    let server = tokio::spawn(serve(endpoint.clone(), Arc::clone(&mesh), capacity));

    let mut errors = mesh.start().await?;
    tokio::spawn(async move {
        while let Some(e) = errors.recv().await {
            warn!("Background error: {}", e);
        }
    });

    let forwarder = PortForwarder::new(Arc::clone(&mesh));
    for rule in config.forwards.iter().filter(|r| r.in_node == mesh.local().id) {
        if let Err(e) = forwarder.start(rule.clone()).await {
            error!(
                "Cannot forward port {} to {}:{}: {}",
                rule.in_port, rule.out_node, rule.out_port, e
            );
        }
    }

    info!(
        "Node {} running on {} ({} children)",
        mesh.local().id,
        bind,
        mesh.registry().children().len()
    );

    signal::ctrl_c().await?;
    info!("Shutting down...");

    forwarder.stop_all();
    mesh.shutdown().await;
    endpoint.close(0u32.into(), b"shutdown");
    server.abort();
    Ok(())
}
