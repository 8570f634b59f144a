//! e3cand - e3can adapter daemon
//!
//! Usage:
//!   e3cand [config.yaml]
//!
//! Without a config file the daemon runs against an in-memory mock channel
//! with a small demo catalog, which is enough to watch the scheduler and
//! the state views work.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use e3can_conv::DidCatalog;
use e3can_core::MemoryStore;
use e3can_uds::channel::mock::MockChannel;
use e3can_uds::{
    sync_catalog, AdapterConfig, CanChannel, ChannelConfig, DecodeSink, DeviceConfig,
    ScheduleConfig, Supervisor,
};

/// Demo catalog used when no config file is given.
const DEMO_CATALOG: &str = r#"
meta:
  name: e3 demo
  version: "0.6.2"
dids:
  "0x018C":
    id: FlowTempSensor
    name: Flow temperature sensor
    codec: int
    len: 2
    args: { signed: true, scale: 0.1 }
  "0x01A8":
    id: DomesticHotWaterSetpoint
    name: Domestic hot water setpoint
    codec: int
    len: 2
    args: { scale: 0.1 }
  "0x0100":
    id: MixerOneCircuit
    name: Mixer circuit 1
    codec: struct
    len: 3
    args:
      fields:
        - name: Mode
          codec: mapping
          len: 1
          args:
            map: { 0: "Off", 1: "On", 2: "Heating" }
        - name: FlowTemp
          codec: int
          len: 2
          args: { signed: true, scale: 0.1 }
writable:
  - "0x01A8"
"#;

fn print_help() {
    eprintln!(
        r#"e3cand - e3can adapter daemon

Usage: e3cand [OPTIONS] [config.yaml]

Options:
  -h, --help    Print this help message

Without a config file, runs a mock-channel demo with one device.
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "e3cand=info,e3can_uds=debug,e3can_conv=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config_path = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other if !other.starts_with('-') => config_path = Some(other.to_string()),
            other => tracing::warn!("unknown argument: {}", other),
        }
    }

    let config = match &config_path {
        Some(path) => {
            tracing::info!(path, "loading config");
            let content = std::fs::read_to_string(path)?;
            AdapterConfig::from_yaml(&content)?
        }
        None => {
            tracing::info!("no config file provided, running mock demo");
            demo_config()
        }
    };

    let channel = build_channel(&config)?;
    let store = Arc::new(MemoryStore::new());
    let supervisor = Supervisor::new(channel, store.clone(), config.state_prefix.clone());

    for device in &config.devices {
        // each session owns its merged catalog, so the common part is
        // loaded fresh per device
        let common = match &config.common_catalog {
            Some(path) => DidCatalog::from_file(path)?,
            None => DidCatalog::from_yaml(DEMO_CATALOG)?,
        };
        let device_catalog = match &device.catalog {
            Some(path) => DidCatalog::from_file(path)?,
            None => DidCatalog::new(),
        };
        let catalog = Arc::new(DidCatalog::merged(common, device_catalog));

        supervisor.add_device(device.clone(), catalog.clone())?;
        tracing::info!(
            device = %device.name,
            dids = catalog.len(),
            "device registered"
        );

        // reconcile previously published values with the shipped catalog
        let prefix = format!(
            "{}.{}",
            config.state_prefix,
            e3can_core::sanitize_id(&device.name)
        );
        let sink = DecodeSink::new(catalog, store.clone(), prefix);
        sync_catalog(&sink);
    }

    supervisor.start();
    tracing::info!("e3cand running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    supervisor.stop();

    Ok(())
}

fn build_channel(config: &AdapterConfig) -> anyhow::Result<Arc<dyn CanChannel>> {
    match &config.channel {
        ChannelConfig::Mock => Ok(Arc::new(MockChannel::new())),
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        ChannelConfig::SocketCan(cfg) => {
            let channel = e3can_uds::channel::socketcan::SocketCanChannel::open(&cfg.interface)?;
            Ok(Arc::new(channel))
        }
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        ChannelConfig::SocketCan(_) => Err(anyhow::anyhow!(
            "SocketCAN requires Linux and the 'socketcan' feature"
        )),
    }
}

fn demo_config() -> AdapterConfig {
    let mut device = DeviceConfig::new("vitocal", 0x680);
    device.schedules = vec![
        ScheduleConfig {
            period_s: 0,
            dids: vec![0x018C, 0x0100],
        },
        ScheduleConfig {
            period_s: 60,
            dids: vec![0x018C],
        },
    ];
    AdapterConfig {
        state_prefix: "e3can".to_string(),
        channel: ChannelConfig::Mock,
        common_catalog: None,
        devices: vec![device],
    }
}
