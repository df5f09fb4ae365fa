//! busfile node entry point.

mod app;
mod config;

use std::net::SocketAddr;
use std::path::PathBuf;

use busfile_protocol::NodeId;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "busfile-node", version)]
#[command(about = "Serve files to bus nodes, or move files to and from one", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ~/.config/busfile/node.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Node id of this node, overriding the configuration
    #[arg(long, global = true, value_name = "ID")]
    node_id: Option<NodeId>,

    /// Local UDP address, overriding the configuration
    #[arg(long, global = true, value_name = "ADDR")]
    bind: Option<SocketAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve files under the configured root until Ctrl-C
    Serve {
        /// Directory to serve, overriding the configuration
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Upload a local file to a remote node
    Put {
        /// Node id of the file server
        node: NodeId,
        /// File to send
        local: PathBuf,
        /// Destination path on the server
        remote: String,
    },
    /// Download a file from a remote node
    Get {
        /// Node id of the file server
        node: NodeId,
        /// Path on the server
        remote: String,
        /// Where to store the file
        local: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = config::Config::load(cli.config.as_deref())?;
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        node = %config.node_id,
        bind = %config.bind,
        "starting busfile node"
    );

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command {
        Command::Serve { root } => {
            if let Some(root) = root {
                config.root = root;
            }
            rt.block_on(app::serve(config))?;
        }
        Command::Put {
            node,
            local,
            remote,
        } => rt.block_on(app::put(&config, node, &local, &remote))?,
        Command::Get {
            node,
            remote,
            local,
        } => rt.block_on(app::get(&config, node, &remote, &local))?,
    }
    Ok(())
}
