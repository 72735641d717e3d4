//! Hubwatch CLI - subscribe to a notification hub and print the stream.
//!
//! This is the binary entry point. See the `hubwatch` library for the
//! core functionality.

use anyhow::Result;
use clap::Parser;
use hubwatch::{NotifierServer, OutputDriver};
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::sync::Arc;

/// Global allocator - mimalloc performs better than the system allocator
/// under the tokio runtime.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Subscribe to a notification hub and print each notification.
#[derive(Parser, Debug)]
#[command(name = "hubwatch", version, about)]
struct Args {
    /// Hub to connect to: `hostname` or `hostname:port` (bracket IPv6
    /// literals, e.g. `[::1]:4859`).
    #[arg(default_value = "localhost")]
    hub: String,

    /// Certificate configuration path, optionally suffixed with
    /// `[profile]` to select a non-default profile.
    #[arg(long, value_name = "PATH")]
    cert_conf: Option<String>,

    /// Connect without TLS.
    #[arg(long)]
    insecure: bool,

    /// Application name to present to the hub (defaults to the program
    /// name).
    #[arg(long, value_name = "NAME")]
    app_name: Option<String>,

    /// Append notifications to this file instead of printing to stdout.
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Enable debug logging (overrides RUST_LOG).
    #[arg(long)]
    debug: bool,
}

/// Map interrupt/terminate to a forced stop and the user-defined shutdown
/// signal to a graceful shutdown. Registered once at startup; the server
/// itself knows nothing about signals.
#[cfg(unix)]
fn register_signals(server: &Arc<NotifierServer>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    for kind in [SignalKind::interrupt(), SignalKind::terminate()] {
        let server = Arc::clone(server);
        let mut stream = signal(kind)?;
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                log::info!("termination signal received; forcing stop");
                server.stop(true).await;
            }
        });
    }

    let server = Arc::clone(server);
    let mut stream = signal(SignalKind::user_defined1())?;
    tokio::spawn(async move {
        while stream.recv().await.is_some() {
            log::info!("shutdown signal received");
            server.shutdown().await;
        }
    });

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if args.debug {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    let server = NotifierServer::new(
        args.hub.clone(),
        args.cert_conf,
        !args.insecure,
        args.app_name,
        None,
    );

    #[cfg(unix)]
    register_signals(&server)?;

    let driver = match args.output {
        Some(path) => OutputDriver::File(path),
        None => OutputDriver::Stdout,
    };

    log::info!("subscribing to hub {}", args.hub);
    driver.run(&server).await?;
    log::info!("notification stream ended");
    Ok(())
}
