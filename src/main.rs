use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use log::{LevelFilter, error, info, warn};
use tokio_util::sync::CancellationToken;

use pixl_bridge_lib::config::{AppConfig, CONFIG_FILE_NAME};
use pixl_bridge_lib::core::bluetooth::{SessionEvent, SessionState, display_temperature};
use pixl_bridge_lib::{AppState, logging};

/// Usage: `pixl-bridge [config.json] [value]`
///
/// Connects to the first Pixl found, syncs its clock, writes `value`, reads the
/// temperature and then prints every session event as a JSON line until ctrl-c.
#[tokio::main]
async fn main() -> Result<()> {
    logging::init(LevelFilter::Info);

    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
    let value: i32 = match args.next() {
        Some(arg) => arg
            .parse()
            .with_context(|| format!("invalid integer value {:?}", arg))?,
        None => 0,
    };

    let config = AppConfig::load(&config_path).await?;
    let (state, mut events) = AppState::new(config).await?;
    let session = state.session();

    let cancel = CancellationToken::new();
    let scan_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            scan_cancel.cancel();
        }
    });

    let devices = state.scan(cancel.clone()).await?;
    let Some(device) = devices.into_iter().next() else {
        bail!("No Pixl device found");
    };
    info!("Connecting to {} ({:?})", device.id, device.name);
    if !session.connect(device.id.clone()).await {
        bail!("Session is busy, could not connect to {}", device.id);
    }

    let mut disconnect_requested = false;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);

                match event {
                    SessionEvent::StateChanged(SessionState::Ready) => {
                        session.update_datetime().await;
                        session.send_int(value).await;
                        session.read_temperature().await;
                    }
                    SessionEvent::StateChanged(SessionState::Idle) => break,
                    SessionEvent::TemperatureUpdated(tenths) => {
                        info!("Temperature: {}", display_temperature(tenths));
                    }
                    SessionEvent::ConnectFailed(e) => error!("Connect failed: {}", e),
                    SessionEvent::UnsupportedDevice => warn!("{} is not a Pixl", device.id),
                    _ => {}
                }
            }
            _ = cancel.cancelled(), if !disconnect_requested => {
                disconnect_requested = true;
                info!("Interrupted, disconnecting...");
                if !session.disconnect().await {
                    break;
                }
            }
        }
    }

    info!("Session closed");
    Ok(())
}
