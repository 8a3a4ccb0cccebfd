//! Moonraker daemon entry point.

use anyhow::Context;
use clap::Parser;
use moonraker_gateway::{MoonrakerServer, ServerArgs};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Moonraker - Klipper API Server
#[derive(Debug, Parser)]
#[command(name = "moonrakerd", version, about)]
struct Args {
    /// Host name or ip to bind to the web server
    #[arg(short = 'a', long, default_value = "0.0.0.0", value_name = "<address>")]
    address: String,

    /// Port the web server will listen on
    #[arg(short = 'p', long, default_value_t = 7125, value_name = "<port>")]
    port: u16,

    /// File name and location for the Unix domain socket
    #[arg(
        short = 's',
        long,
        default_value = "/tmp/moonraker",
        value_name = "<socketfile>"
    )]
    socketfile: PathBuf,

    /// Log file name and location
    #[arg(
        short = 'l',
        long,
        default_value = "/tmp/moonraker.log",
        value_name = "<logfile>"
    )]
    logfile: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.logfile)
        .with_context(|| format!("cannot open log file {}", args.logfile.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(Arc::new(log_file))
        .with_ansi(false)
        .init();

    info!("========================= Starting Moonraker =========================");

    let server = MoonrakerServer::bind(ServerArgs {
        address: args.address,
        port: args.port,
        socketfile: args.socketfile,
        logfile: args.logfile,
    })
    .await
    .context("server startup failed")?;

    server.run().await.context("server error")?;
    info!("server shutdown");
    Ok(())
}
