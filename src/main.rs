pub mod bridge;
pub mod bus;
pub mod config;
pub mod mqtt;

use crate::bridge::dispatcher::Dispatcher;
use crate::bridge::DispatcherSettings;
use crate::bus::serial::{SerialBus, SerialBusSettings};
use crate::config::Config;
use color_eyre::{eyre::eyre, Result};
use mqtt::config::MqttConfig;
use mqtt::mqtt_handler;
use tokio::sync::mpsc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

const BUS_EVENT_CAPACITY: usize = 100;
const SIGNAL_CAPACITY: usize = 100;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_file = crate::config::config_path();
    let config =
        Config::load(config_file.as_deref()).map_err(|e| eyre!("Invalid configuration: {}", e))?;
    setup_logging_env(config.debug);

    match &config_file {
        Some(path) => info!("Loaded config file {}", path.display()),
        None => info!("No config file found, using environment only"),
    }

    info!(
        "Starting bridge for device {} ({}) on {}",
        config.device_id, config.device_name, config.serial_device
    );

    let settings = DispatcherSettings::from_config(&config);
    let mqtt_config = MqttConfig::from_config(
        &config,
        settings.topics.speed_command(),
        settings.topics.platform_status(),
    )?;

    let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CAPACITY);
    let publisher = mqtt_handler::spawn(mqtt_config, signal_tx);

    let (bus, bus_events) = SerialBus::open(
        SerialBusSettings {
            device: config.serial_device.clone(),
            enable_write: config.enable_write,
            panel_address: config.panel_address,
        },
        BUS_EVENT_CAPACITY,
    )
    .map_err(|e| eyre!("Failed to open serial bus: {}", e))?;

    let dispatcher = Dispatcher::create(settings, Box::new(bus), Box::new(publisher)).start();

    tokio::select! {
        result = dispatcher.run(bus_events, signal_rx) => {
            if let Err(e) = &result {
                error!("Dispatcher stopped: {}", e);
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    Ok(())
}

fn setup_logging_env(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
