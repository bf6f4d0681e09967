use clap::{App, Arg};
use nspwheel::channel::{channel, RING_CAPACITY};
use nspwheel::io::{MemoryStream, MonotonicClock, StdClock};
use nspwheel::{ControlCommand, DeviceConfig, PhysicsContext, WheelDevice, WheelSnapshot};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: &str = "4500";
const READ_CHUNK: usize = 512;

fn parse_address(text: &str) -> Result<u8, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => text.parse::<u8>(),
    };
    parsed.map_err(|e| format!("invalid device address `{text}`: {e}"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = App::new("nspwheel-sim")
        .version(env!("CARGO_PKG_VERSION"))
        .about("NSP reaction wheel emulator serving one host over TCP")
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("TCP port standing in for the RS-485 line")
                .takes_value(true)
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("address")
                .short("a")
                .long("address")
                .value_name("ADDR")
                .help("NSP device address (decimal or 0x-prefixed hex)")
                .takes_value(true)
                .validator(|v| parse_address(&v).map(|_| ())),
        )
        .arg(
            Arg::with_name("scenario")
                .short("s")
                .long("scenario")
                .value_name("FILE")
                .help("Fault-injection scenario started once the device is up")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("status-interval")
                .long("status-interval")
                .value_name("MS")
                .help("Period of the JSON status line, 0 to disable")
                .takes_value(true)
                .validator(|v| {
                    v.parse::<u64>()
                        .map(|_| ())
                        .map_err(|_| "interval must be a number of milliseconds".into())
                }),
        )
        .get_matches();

    let mut config = DeviceConfig::default();
    if let Some(address) = matches.value_of("address") {
        config.address = parse_address(address)?;
    }
    if let Some(interval) = matches.value_of("status-interval") {
        config.status_interval_ms = interval.parse()?;
    }
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;

    let clock = StdClock::new();
    let (comms, physics) =
        channel::<ControlCommand, WheelSnapshot, RING_CAPACITY>(ControlCommand::default());
    let mut device = WheelDevice::new(config.clone(), comms);
    let mut wheel = PhysicsContext::new(config.params, physics);

    if let Some(path) = matches.value_of("scenario") {
        let text = std::fs::read_to_string(path)?;
        device.load_scenario(&text)?;
        device.start_scenario(clock.now_ms())?;
        info!(path, "scenario started");
    }

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!(port, address = config.address, "NSP line listening");

    let tick_period = Duration::from_millis(config.tick_period_ms);
    let physics_task = tokio::spawn(async move {
        let mut interval = time::interval(tick_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            wheel.tick(&clock);
        }
    });

    let comms_task = tokio::spawn(async move {
        if let Err(e) = run_comms(device, listener, clock).await {
            error!("communications loop failed: {}", e);
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
        res = physics_task => warn!("physics task ended: {:?}", res),
        res = comms_task => warn!("communications task ended: {:?}", res),
    }
    Ok(())
}

async fn run_comms(
    mut device: WheelDevice,
    listener: TcpListener,
    clock: StdClock,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = device.config().clone();
    let mut interval = time::interval(Duration::from_micros(config.comms_poll_us));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut client: Option<TcpStream> = None;
    let mut line = MemoryStream::new();
    let mut buf = [0u8; READ_CHUNK];
    let mut last_status_ms = clock.now_ms();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                if client.is_some() {
                    warn!(%peer, "new host replaces the connected one");
                }
                info!(%peer, "host connected");
                client = Some(stream);
            }
            _ = interval.tick() => {
                if let Some(stream) = client.as_mut() {
                    match stream.try_read(&mut buf) {
                        Ok(0) => {
                            info!("host disconnected");
                            client = None;
                        }
                        Ok(n) => line.feed(&buf[..n]),
                        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                        Err(e) => {
                            warn!("read failed, dropping host: {}", e);
                            client = None;
                        }
                    }
                }

                let now_ms = clock.now_ms();
                if let Err(e) = device.poll(&mut line, now_ms) {
                    warn!("device poll failed: {:?}", e);
                }

                let output = line.take_output();
                if let (false, Some(stream)) = (output.is_empty(), client.as_mut()) {
                    if let Err(e) = stream.write_all(&output).await {
                        warn!("write failed, dropping host: {}", e);
                        client = None;
                    }
                }

                if config.status_interval_ms > 0
                    && now_ms.saturating_sub(last_status_ms) >= config.status_interval_ms
                {
                    last_status_ms = now_ms;
                    info!(status = %serde_json::to_string(&device.status())?, "device status");
                }
            }
        }
    }
}
