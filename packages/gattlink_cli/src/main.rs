// gattlink: drive a managed connection against the simulated transport

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use gattlink::ble::gatt::{uuid_from_short, GattCharacteristic, GattService};
use gattlink::ble::simulated::{SimCentral, SimPeripheral};
use gattlink::events::BroadcastSink;
use gattlink::{
    BleAddress, CharacteristicId, ConnectionConfig, ConnectionEvent, ConnectionManager,
    ConnectionState, Request,
};

#[derive(Parser)]
#[command(name = "gattlink")]
#[command(about = "Managed BLE GATT connections", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective connection config as JSON
    Config {
        /// JSON config file; defaults are used when omitted
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Connect to a simulated peripheral and run a request session
    Demo {
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Bytes to write to the data characteristic
        #[arg(short, long, default_value = "64")]
        payload_len: usize,
        /// Simulated completion latency in milliseconds
        #[arg(short, long, default_value = "20")]
        latency_ms: u64,
    },
}

const PERIPHERAL: &str = "C0:FF:EE:00:00:01";

fn data_characteristic() -> CharacteristicId {
    CharacteristicId::new(uuid_from_short(0xFFE0), uuid_from_short(0xFFE1))
}

fn load_config(file: Option<PathBuf>) -> Result<ConnectionConfig> {
    match file {
        Some(path) => ConnectionConfig::from_json_file(&path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(ConnectionConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Config { file } => {
            let config = load_config(file)?.normalized();
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Demo {
            file,
            payload_len,
            latency_ms,
        } => run_demo(load_config(file)?, payload_len, latency_ms).await,
    }
}

async fn run_demo(config: ConnectionConfig, payload_len: usize, latency_ms: u64) -> Result<()> {
    let address: BleAddress = PERIPHERAL.parse()?;
    let target = data_characteristic();

    let central = SimCentral::new();
    central.add_peripheral(
        SimPeripheral::new(address)
            .with_name("gattlink-demo")
            .with_service(GattService::new(
                target.service,
                vec![GattCharacteristic::notifying(target.characteristic)],
            ))
            .with_latency(Duration::from_millis(latency_ms)),
    );

    let sink = Arc::new(BroadcastSink::default());
    let mut events = sink.subscribe();
    let manager = ConnectionManager::new(Arc::new(central.clone()), sink);
    manager.attach_scanner();

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ConnectionEvent::StateChanged { state, .. } => log::info!("state: {:?}", state),
                ConnectionEvent::CharacteristicChanged { value, .. } => {
                    log::info!("notified: {}", hex::encode(value))
                }
                other => log::info!("event: {:?}", other),
            }
        }
    });

    let connection = manager.connect(PERIPHERAL, config).await?;
    let mut device = connection.subscribe_device();
    let ready = tokio::time::timeout(Duration::from_secs(30), async {
        while device.borrow_and_update().state != ConnectionState::ServiceDiscovered {
            if device.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    if ready.is_err() || connection.state() != ConnectionState::ServiceDiscovered {
        bail!("peripheral never became ready");
    }

    let toggled = connection
        .execute(Request::toggle_notification("notify", target, true))
        .await?;
    println!("notifications: {:?}", toggled);

    let payload: Vec<u8> = (0..payload_len).map(|i| i as u8).collect();
    let written = connection
        .execute(Request::write_characteristic("write", target, payload))
        .await?;
    println!(
        "write: {:?} in {} packets",
        written,
        central.writes_to(&target).len()
    );

    let read = connection
        .execute(Request::read_characteristic("read", target))
        .await?;
    println!("read: {:?}", read);

    let phy = connection.execute(Request::read_phy("phy")).await?;
    println!("phy: {:?}", phy);

    central.notify(&address, target, &[0xDE, 0xAD]);
    tokio::time::sleep(Duration::from_millis(latency_ms + 50)).await;

    manager.shutdown().await;
    Ok(())
}
