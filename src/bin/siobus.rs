use clap::{App, Arg};
use siobus::config::BusConfig;
use siobus::device::handle;
use siobus::devices::{Clock, RamDisk};
use siobus::engine::{BusEngine, CycleOutcome};
use siobus::transport::{NetSioTransport, TransportKind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn, Level};

const DEFAULT_CONFIG: &str = "siobus.toml";
const SERVICE_PERIOD_US: u64 = 500;

// The engine holds Rc device handles, so it stays on this one thread
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("siobus")
        .version("0.1.0")
        .about("Virtual peripherals on a serial expansion bus, tunneled over NetSIO")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file")
                .takes_value(true)
                .default_value(DEFAULT_CONFIG),
        )
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("NetSIO hub host (overrides config)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("NetSIO hub port (overrides config)")
                .takes_value(true)
                .validator(|v| match v.parse::<u16>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Port must be a number between 0 and 65535".into()),
                }),
        )
        .arg(
            Arg::with_name("hsio-index")
                .long("hsio-index")
                .value_name("INDEX")
                .help("High speed index, -1 to disable (overrides config)")
                .takes_value(true)
                .allow_hyphen_values(true)
                .validator(|v| match v.parse::<i32>() {
                    Ok(i) if (-1..=255).contains(&i) => Ok(()),
                    _ => Err("Index must be between -1 and 255".into()),
                }),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log every command frame"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config_path = PathBuf::from(matches.value_of("config").unwrap_or(DEFAULT_CONFIG));
    let mut config = BusConfig::load(&config_path)?;

    if let Some(host) = matches.value_of("host") {
        config.transport.host = host.to_string();
    }
    if let Some(port) = matches.value_of("port") {
        config.transport.port = port.parse()?;
    }
    if let Some(index) = matches.value_of("hsio-index") {
        config.link.high_speed_index = index.parse()?;
    }
    config.validate()?;

    if config.transport.kind != TransportKind::NetSio {
        error!("Only the netsio transport is available on this host");
        return Err("unsupported transport kind".into());
    }

    let transport = NetSioTransport::new(config.transport.host.clone(), config.transport.port);
    let mut engine = BusEngine::new(transport, config.engine());

    let disk = config.devices.disk;
    if disk.enabled {
        engine.add_device(handle(RamDisk::new(disk.id, disk.sectors)), disk.id)?;
        info!("Disk 0x{:02X}: {} sectors", disk.id, disk.sectors);
    }
    let clock = config.devices.clock;
    if clock.enabled {
        engine.add_device(handle(Clock::new(clock.id)), clock.id)?;
        info!("Clock 0x{:02X}", clock.id);
    }

    engine.setup()?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_signal = Arc::clone(&stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop_signal.store(true, Ordering::SeqCst);
        }
    });

    let mut interval = time::interval(Duration::from_micros(SERVICE_PERIOD_US));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        if stop.load(Ordering::SeqCst) {
            break;
        }

        match engine.service() {
            CycleOutcome::Stopped => break,
            CycleOutcome::Idle | CycleOutcome::Streamed { .. } => {}
            outcome => debug!("{:?}", outcome),
        }

        if let Some(index) = engine.take_persist_request() {
            config.link.high_speed_index = index;
            match config.save(&config_path) {
                Ok(()) => info!("Saved high speed index {} to {}", index, config_path.display()),
                Err(e) => warn!("Could not save config: {}", e),
            }
        }
    }

    let report = engine.shutdown();
    info!("{} devices shut down", report.devices_shut_down);
    info!("Bus statistics: {}", serde_json::to_string(engine.get_stats())?);

    Ok(())
}
