//! shroud: Host-Wide Anonymizing-Proxy Session Helper
//!
//! Entry point for both faces of the binary. With `--connect` or
//! `--disconnect` it runs in privileged helper mode and drives the
//! session controller; with no arguments it runs the line-driven
//! frontend, which dispatches those same two commands through pkexec.

mod frontend;

use anyhow::Result;
use clap::Parser;
use nix::unistd::Uid;
use shroud_core::{HelperConfig, IpRoute};
use std::path::PathBuf;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Route all host traffic through an anonymizing proxy.
#[derive(Debug, Parser)]
#[command(name = "shroud", version)]
struct Cli {
    /// Establish the session and hold it until signalled (requires root).
    #[arg(long, conflicts_with = "disconnect")]
    connect: bool,

    /// Tear down the active session (requires root).
    #[arg(long)]
    disconnect: bool,

    /// Configuration override file.
    #[arg(long, value_name = "PATH", default_value = "/etc/shroud/config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    if !cli.connect && !cli.disconnect {
        return frontend::run();
    }

    // helper mode mutates routes and the resolver; refuse early without root
    if !Uid::effective().is_root() {
        anyhow::bail!("helper mode requires root privileges (use the frontend, or pkexec)");
    }

    let config = HelperConfig::load_or_default(&cli.config)?;
    config.validate()?;
    let ops = IpRoute;

    if cli.connect {
        if let Err(e) = shroud_core::connect(config, &ops).await {
            error!(error = %e, "session startup failed");
            std::process::exit(1);
        }
    } else if let Err(e) = shroud_core::disconnect(config, &ops).await {
        error!(error = %e, "disconnect failed");
        std::process::exit(1);
    }

    Ok(())
}
