mod config;
mod handlers;
mod server;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "VM I/O multiplexing proxy daemon")]
struct Args {
    /// Path of the Unix socket runtimes and shims connect to.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// TOML config file (default: $XDG_CONFIG_HOME/vmproxy/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level filter, e.g. `info` or `libvmproxy=debug`.
    /// VMPROXY_LOG takes precedence.
    #[arg(long)]
    log_level: Option<String>,

    /// Stream VM consoles into the debug log.
    #[arg(long)]
    vm_console: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    if args.vm_console {
        config.enable_vm_console = true;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("VMPROXY_LOG")
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    server::run(config).await
}
