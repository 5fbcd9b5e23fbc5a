use color_eyre::{eyre::eyre, Result};
use thermobridge::mqtt::BridgeHandle;
use thermobridge::state::DeviceState;
use thermobridge::BridgeConfig;
use tokio::sync::watch;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = BridgeConfig::load()
        .await
        .map_err(|e| eyre!("Failed to load config: {}", e))?;
    info!(
        "Bridging '{}' on prefix {} via {}:{}",
        config.device_name, config.topic_prefix, config.mqtt.host, config.mqtt.port
    );

    let first_data_timeout = config.startup.first_data_timeout();
    let bridge = BridgeHandle::spawn(config)
        .await
        .map_err(|e| eyre!("Failed to start bridge: {}", e))?;

    if bridge.wait_for_first_data(first_data_timeout).await {
        let device = bridge.device_info().await;
        info!(
            "Device ready: {} {} (firmware {})",
            device.manufacturer,
            device.model,
            device.sw_version.as_deref().unwrap_or("unknown")
        );
    } else {
        warn!(
            "No data from device within {}s, continuing to wait in the background",
            first_data_timeout.as_secs()
        );
    }

    let reporter = tokio::spawn(report_changes(bridge.snapshots()));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for ctrl-c: {}", e))?;
    info!("Stopping bridge");

    reporter.abort();
    if let Some(status) = bridge.shutdown().await {
        info!(
            "Bridge stopped: {} received, {} rejected, {} sent",
            status.messages_received, status.messages_rejected, status.messages_sent
        );
    }

    Ok(())
}

async fn report_changes(mut snapshots: watch::Receiver<DeviceState>) {
    let mut online = None;
    while snapshots.changed().await.is_ok() {
        let state = snapshots.borrow_and_update().clone();

        if state.is_online() != online {
            online = state.is_online();
            info!("Device online: {:?}", online);
        }

        for (idx, channel) in state.channels().iter().enumerate() {
            match channel.temperature() {
                Some(temp) => debug!(
                    "Channel {} ({}): {:.1}",
                    idx + 1,
                    channel.name.as_deref().unwrap_or("-"),
                    temp
                ),
                None => debug!("Channel {}: no probe", idx + 1),
            }
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    let level = match std::env::var("RUST_LOG").as_deref() {
        Ok("trace") => Level::TRACE,
        Ok("debug") => Level::DEBUG,
        Ok("warn") => Level::WARN,
        Ok("error") => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
