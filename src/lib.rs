use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use clap::Parser;
use futures::StreamExt;
use log::{error, info};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::broadcast::broadcaster::Broadcaster;
use crate::broadcast::server::ClientServer;
use crate::config::io::ConfigIO;
use crate::device::connection::ConnectionManager;
use crate::device::link::DeviceLink;
use crate::device::radio::BluezRadio;
use crate::device::selection::{DeviceStore, PromptSelector};
use crate::device::transport::RfcommTransport;
use crate::device::types::SelectedDevice;
use crate::error::AppRunError;
use crate::model::SensorModel;

pub mod broadcast;
pub mod config;
pub mod device;
pub mod error;
pub mod model;

const SHUTDOWN_GRACE_SECONDS: u64 = 2;

/// Bridges a variometer on a bluetooth serial link to local clients.
#[derive(Parser, Debug, Default)]
#[command(version, about)]
pub struct Args {
    /// Path of the config file, instead of the default location
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to accept clients on, overrides the config file
    #[arg(long)]
    pub listen: Option<String>,

    /// Select the instrument with this bluetooth address and remember it
    #[arg(long)]
    pub device: Option<String>,

    /// Log debug messages
    #[arg(short, long)]
    pub verbose: bool,
}

pub fn init_logging(level: log::LevelFilter) {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(
            fern::log_file(log_file).expect("Failed to open LOG_FILE")
        );
    }

    dispatch.apply().expect("Failed to initialize logger");
}

pub fn run(args: Args) -> Result<(), AppRunError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|source| AppRunError::Runtime { source })?;

    let result = runtime.block_on(run_bridge(args));
    runtime.shutdown_timeout(Duration::from_secs(SHUTDOWN_GRACE_SECONDS));
    result
}

async fn run_bridge(args: Args) -> Result<(), AppRunError> {
    let mut config_io = ConfigIO::new_sync(args.config)?;
    let mut config_locker = config_io.locker()?;
    let _config_lock = config_locker.lock()?;

    if let Some(address) = args.device {
        DeviceStore::save(&config_io, SelectedDevice::new(address, None)).await?;
    }
    let config = config_io.read().await?;
    let listen = args.listen.unwrap_or_else(|| config.listen.clone());

    let model = Arc::new(SensorModel::new());
    let (broadcaster, mut idle) = Broadcaster::new(model.clone());
    let broadcaster = Arc::new(broadcaster);
    model.add_listener(broadcaster.clone());

    let radio = Arc::new(BluezRadio::new().await);
    let link = DeviceLink::new(
        Arc::new(RfcommTransport::new(radio.session(), radio.adapter())),
        model.clone(),
        Duration::from_millis(config.connect_timeout_ms),
    );
    let selector = Arc::new(PromptSelector::new(radio.adapter(), config.known_devices.clone()));
    let store = Arc::new(config_io.clone());

    let (mut manager, connection) = ConnectionManager::new(
        link,
        radio,
        selector,
        store,
        Duration::from_millis(config.retry_interval_ms),
    );
    manager.add_listener(broadcaster.clone());

    let server = ClientServer::bind(&listen).await?;

    let cancel = CancellationToken::new();
    let manager_task = tokio::spawn(manager.run(cancel.child_token()));
    let server_task = tokio::spawn(server.run(cancel.child_token(), broadcaster.clone(), connection));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!("Failed to listen for ctrl-c: {}", err);
            }
            info!("Interrupted");
        },
        Some(_) = idle.next(), if config.exit_when_idle => {
            info!("Last client has gone away");
        },
    }

    info!("Shutting down");
    cancel.cancel();
    if let Err(err) = manager_task.await {
        error!("Connection manager task failed: {}", err);
    }
    if let Err(err) = server_task.await {
        error!("Client server task failed: {}", err);
    }
    model.remove_listeners();
    broadcaster.clear();

    Ok(())
}
