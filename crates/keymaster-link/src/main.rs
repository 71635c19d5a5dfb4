//! KeyMaster link - device-side serial to BLE bridge
//!
//! Advertises a GATT peripheral and bridges it to the host line stream.
//! Logs go to stderr; stdout is the host link unless `--port` is given.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use keymaster_link::{
    BluerPeripheral, BridgeObserver, LinkBridge, LinkConfig, LinkHandle, LoggingObserver,
};

#[derive(Parser)]
#[command(name = "keymaster-link")]
#[command(about = "Bridge a host serial line to a BLE peripheral")]
struct Args {
    /// JSON configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Advertised device name (overrides the config file)
    #[arg(long, short)]
    name: Option<String>,

    /// Host serial port to bridge instead of stdio (requires `serial` feature)
    #[arg(long, short)]
    port: Option<String>,

    /// Host serial baud rate
    #[arg(long, default_value_t = 115200)]
    baud: u32,

    /// Partial reassembly timeout, e.g. "5s"
    #[arg(long, value_parser = humantime::parse_duration)]
    chunk_timeout: Option<Duration>,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &args.config {
        Some(path) => LinkConfig::from_file(path)?,
        None => LinkConfig::default(),
    };
    if let Some(name) = args.name {
        config.peripheral.device_name = name;
    }
    if let Some(timeout) = args.chunk_timeout {
        config.framing.chunk_timeout = timeout;
    }
    config.validate()?;

    info!(
        name = %config.peripheral.device_name,
        version = keymaster_link::VERSION,
        "Starting KeyMaster link"
    );

    let link = Arc::new(BluerPeripheral::new(config.peripheral.clone()).await?);
    let observer: Arc<dyn BridgeObserver> = Arc::new(LoggingObserver);

    match args.port {
        #[cfg(feature = "serial")]
        Some(port) => {
            let (host_rx, host_tx) = keymaster_link::link::serial::open_host_port(&port, args.baud)?;
            serve(link, host_rx, host_tx, observer, &config).await
        }
        #[cfg(not(feature = "serial"))]
        Some(port) => {
            anyhow::bail!(
                "--port {} at {} baud requires the `serial` feature",
                port,
                args.baud
            )
        }
        None => serve(link, tokio::io::stdin(), tokio::io::stdout(), observer, &config).await,
    }
}

async fn serve<R, W>(
    link: Arc<BluerPeripheral>,
    host_rx: R,
    host_tx: W,
    observer: Arc<dyn BridgeObserver>,
    config: &LinkConfig,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let (bridge, handle) = LinkBridge::new(link, host_rx, host_tx, Some(observer), config)?;
    tokio::spawn(shutdown_on_ctrl_c(handle));
    bridge.run().await?;
    Ok(())
}

async fn shutdown_on_ctrl_c(handle: LinkHandle) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Interrupted, shutting down");
        let _ = handle.shutdown().await;
    }
}
