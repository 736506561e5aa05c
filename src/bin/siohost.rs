use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use serde::Serialize;
use siobus::checksum::ChecksumPolicy;
use siobus::frame::{CommandFrame, Handshake, FRAME_LEN};
use siobus::link::{high_speed_baud_for, PAL_OSCILLATOR_HZ, STANDARD_BAUD};
use siobus::netsio::{Direction, NetSioMessage, SyncKind, MAX_DATAGRAM_LEN};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const DEFAULT_PORT: &str = "9997";
const DEFAULT_BIND: &str = "0.0.0.0";
const DEFAULT_TIMEOUT_MS: &str = "3000";
const HUB_CREDIT: u8 = 16;
// Quiet period that ends a response of unknown length
const IDLE_END: Duration = Duration::from_millis(300);

type BoxError = Box<dyn std::error::Error>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let matches = App::new("siohost")
        .version("0.1.0")
        .about("NetSIO hub: plays the host computer and sends one command frame to the bus")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("UDP port to listen on for the device")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("bind")
                .short("b")
                .long("bind")
                .value_name("ADDR")
                .help("Address to bind")
                .takes_value(true)
                .default_value(DEFAULT_BIND)
                .global(true),
        )
        .arg(
            Arg::with_name("timeout")
                .short("t")
                .long("timeout")
                .value_name("MS")
                .help("How long to wait for the device and for its answer")
                .takes_value(true)
                .default_value(DEFAULT_TIMEOUT_MS)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Print every datagram")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("status")
                .about("Ask a drive for its 4 status bytes")
                .arg(device_arg("0x31")),
        )
        .subcommand(
            SubCommand::with_name("read")
                .about("Read one 128 byte sector")
                .arg(device_arg("0x31"))
                .arg(
                    Arg::with_name("sector")
                        .help("Sector number, starting at 1")
                        .required(true)
                        .validator(|v| match v.parse::<u16>() {
                            Ok(_) => Ok(()),
                            Err(_) => Err("Sector must be a number between 0 and 65535".into()),
                        }),
                ),
        )
        .subcommand(
            SubCommand::with_name("hsio")
                .about("Query the high speed index")
                .arg(device_arg("0x31")),
        )
        .subcommand(
            SubCommand::with_name("time")
                .about("Read the APETime clock")
                .arg(device_arg("0x45")),
        )
        .subcommand(
            SubCommand::with_name("poll")
                .about("Send a Type-3 broadcast poll")
                .arg(
                    Arg::with_name("kind")
                        .help("Poll variant")
                        .possible_values(&["general", "null", "reset"])
                        .default_value("general"),
                ),
        )
        .subcommand(
            SubCommand::with_name("raw")
                .about("Send an arbitrary command frame")
                .arg(Arg::with_name("device").help("Device id").required(true).validator(validate_byte))
                .arg(Arg::with_name("command").help("Command byte or character").required(true).validator(validate_byte))
                .arg(Arg::with_name("aux1").help("First aux byte").default_value("0").validator(validate_byte))
                .arg(Arg::with_name("aux2").help("Second aux byte").default_value("0").validator(validate_byte))
                .arg(
                    Arg::with_name("corrupt")
                        .long("corrupt")
                        .help("Send a wrong checksum to exercise bad-frame handling"),
                ),
        )
        .get_matches();

    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let bind = matches.value_of("bind").unwrap_or(DEFAULT_BIND);
    let wait = Duration::from_millis(matches.value_of("timeout").unwrap_or(DEFAULT_TIMEOUT_MS).parse()?);
    let format = matches.value_of("format").unwrap_or("table");
    let verbose = matches.is_present("verbose");

    let (name, sub_matches) = matches.subcommand();
    let sub_matches = match sub_matches {
        Some(m) => m,
        None => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            return Ok(());
        }
    };

    let request = build_request(name, sub_matches)?;

    if verbose {
        println!("{}", format!("Waiting for a device on {}:{}...", bind, port).dimmed());
    }
    let mut hub = Hub::accept(bind, port, wait, verbose).await?;
    if verbose {
        println!("{}", format!("Device connected from {}", hub.peer).dimmed());
    }

    let exchange = hub.exchange(&request, wait).await?;
    print_exchange(&request, &exchange, format)?;

    Ok(())
}

fn device_arg(default: &'static str) -> Arg<'static, 'static> {
    Arg::with_name("device")
        .short("d")
        .long("device")
        .value_name("ID")
        .help("Device id")
        .takes_value(true)
        .default_value(default)
        .validator(validate_byte)
}

fn validate_byte(v: String) -> Result<(), String> {
    parse_byte(&v).map(|_| ()).ok_or_else(|| format!("'{}' is not a byte (use 42, 0x2A or a single character)", v))
}

/// Accepts decimal, `0x` hex or a single printable character.
fn parse_byte(text: &str) -> Option<u8> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u8::from_str_radix(hex, 16).ok();
    }
    if let Ok(n) = text.parse::<u8>() {
        return Some(n);
    }
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii() => Some(c as u8),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Status,
    Read,
    HighSpeed,
    Time,
    Poll,
    Raw,
}

#[derive(Debug, Clone)]
struct Request {
    kind: RequestKind,
    frame: [u8; FRAME_LEN],
    /// Data bytes expected between the terminal byte and the checksum.
    expect: Option<usize>,
}

fn build_request(name: &str, matches: &ArgMatches<'_>) -> Result<Request, BoxError> {
    let policy = ChecksumPolicy::Additive;
    let device = |default: u8| matches.value_of("device").and_then(parse_byte).unwrap_or(default);

    let (kind, frame, expect) = match name {
        "status" => (RequestKind::Status, CommandFrame::new(device(0x31), b'S', 0, 0, policy), Some(4)),
        "read" => {
            let sector: u16 = matches.value_of("sector").unwrap_or("1").parse()?;
            let [lo, hi] = sector.to_le_bytes();
            (RequestKind::Read, CommandFrame::new(device(0x31), b'R', lo, hi, policy), Some(128))
        }
        "hsio" => (RequestKind::HighSpeed, CommandFrame::new(device(0x31), b'?', 0, 0, policy), Some(1)),
        "time" => (RequestKind::Time, CommandFrame::new(device(0x45), 0x93, 0xEE, 0xA0, policy), Some(6)),
        "poll" => {
            let aux = match matches.value_of("kind").unwrap_or("general") {
                "null" => 0x4E,
                "reset" => 0x4F,
                _ => 0x00,
            };
            (RequestKind::Poll, CommandFrame::new(0x4F, b'@', aux, aux, policy), None)
        }
        "raw" => {
            let byte = |key: &str| matches.value_of(key).and_then(parse_byte).unwrap_or(0);
            let mut frame = CommandFrame::new(byte("device"), byte("command"), byte("aux1"), byte("aux2"), policy);
            if matches.is_present("corrupt") {
                frame.checksum = frame.checksum.wrapping_add(1);
            }
            (RequestKind::Raw, frame, None)
        }
        other => return Err(format!("unknown command '{}'", other).into()),
    };

    Ok(Request {
        kind,
        frame: frame.to_bytes(),
        expect,
    })
}

#[derive(Debug, Default, Serialize)]
struct Exchange {
    frame: String,
    handshake: Option<char>,
    terminal: Option<char>,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
    checksum_ok: Option<bool>,
    device_baud: u32,
    elapsed_ms: u64,
}

struct Hub {
    socket: UdpSocket,
    peer: SocketAddr,
    seq: u8,
    device_baud: u32,
    verbose: bool,
}

impl Hub {
    /// Bind and wait for the first datagram from a device.
    async fn accept(bind: &str, port: u16, wait: Duration, verbose: bool) -> Result<Self, BoxError> {
        let socket = UdpSocket::bind((bind, port)).await?;
        let mut buf = [0u8; MAX_DATAGRAM_LEN];

        let (n, peer) = timeout(wait, socket.recv_from(&mut buf))
            .await
            .map_err(|_| "no device connected before timeout")??;

        let mut hub = Self {
            socket,
            peer,
            seq: 0,
            device_baud: STANDARD_BAUD,
            verbose,
        };
        if let Ok(message) = NetSioMessage::decode(&buf[..n], Direction::DeviceToHub) {
            hub.housekeeping(&message).await?;
        }
        Ok(hub)
    }

    async fn send(&self, message: &NetSioMessage) -> Result<(), BoxError> {
        if self.verbose {
            println!("{} {:?}", "->".bright_cyan(), message);
        }
        self.socket.send_to(&message.encode(), self.peer).await?;
        Ok(())
    }

    /// Answer connection upkeep messages. Returns true if `message` was one.
    async fn housekeeping(&mut self, message: &NetSioMessage) -> Result<bool, BoxError> {
        match message {
            NetSioMessage::PingRequest => self.send(&NetSioMessage::PingResponse).await?,
            NetSioMessage::AliveRequest => self.send(&NetSioMessage::AliveResponse).await?,
            NetSioMessage::CreditStatus(_) => self.send(&NetSioMessage::CreditUpdate(HUB_CREDIT)).await?,
            NetSioMessage::SpeedChange(baud) => self.device_baud = *baud,
            NetSioMessage::DeviceConnect | NetSioMessage::DeviceDisconnect => {}
            _ => return Ok(false),
        }
        Ok(true)
    }

    async fn exchange(&mut self, request: &Request, wait: Duration) -> Result<Exchange, BoxError> {
        let started = Instant::now();
        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;

        self.send(&NetSioMessage::CreditUpdate(HUB_CREDIT)).await?;
        self.send(&NetSioMessage::SpeedChange(self.device_baud)).await?;
        self.send(&NetSioMessage::CommandOn).await?;
        self.send(&NetSioMessage::data_block(&request.frame, Some(seq))?).await?;
        self.send(&NetSioMessage::CommandOffSync { seq }).await?;

        let mut result = Exchange {
            frame: hex(&request.frame),
            ..Exchange::default()
        };
        let mut payload: Vec<u8> = Vec::new();
        let mut synced = false;
        let mut finished = false;
        let deadline = started + wait;
        let mut buf = [0u8; MAX_DATAGRAM_LEN];

        while !finished {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            // Unknown-length answers end after a quiet spell
            let budget = if synced && request.expect.is_none() {
                IDLE_END.min(deadline - now)
            } else {
                deadline - now
            };

            let (n, from) = match timeout(budget, self.socket.recv_from(&mut buf)).await {
                Ok(received) => received?,
                Err(_) => break,
            };
            if from != self.peer {
                continue;
            }

            let message = match NetSioMessage::decode(&buf[..n], Direction::DeviceToHub) {
                Ok(message) => message,
                Err(e) => {
                    if self.verbose {
                        println!("{} {}", "bad datagram:".yellow(), e);
                    }
                    continue;
                }
            };
            if self.verbose {
                println!("{} {:?}", "<-".bright_green(), message);
            }
            if self.housekeeping(&message).await? {
                continue;
            }

            match message {
                NetSioMessage::SyncResponse { seq: s, kind, ack, .. } if s == seq => {
                    synced = true;
                    match kind {
                        SyncKind::Ack => {
                            result.handshake = Some(ack as char);
                            // Nak ends the cycle; nothing follows
                            finished = ack == Handshake::Nak.as_byte();
                        }
                        SyncKind::Empty => finished = true,
                    }
                }
                NetSioMessage::DataBlock { data, .. } => payload.extend_from_slice(&data),
                NetSioMessage::DataByte(b) => payload.push(b),
                _ => {}
            }

            if let Some(expect) = request.expect {
                if synced && payload.len() >= expect + 2 {
                    finished = true;
                }
            }
        }

        // The engine answers the high speed query with a data frame of its own
        if result.handshake.is_none() && payload.first() == Some(&Handshake::Ack.as_byte()) {
            result.handshake = Some('A');
            payload.remove(0);
        }

        if let Some((&first, rest)) = payload.split_first() {
            if Handshake::from_byte(first).map_or(false, Handshake::is_terminal) {
                result.terminal = Some(first as char);
                if let Some((&checksum, data)) = rest.split_last() {
                    result.checksum_ok = Some(ChecksumPolicy::Additive.checksum(data) == checksum);
                    result.data = data.to_vec();
                }
            } else {
                result.data = payload.clone();
            }
        }

        result.device_baud = self.device_baud;
        result.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join(" ")
}

fn print_exchange(request: &Request, exchange: &Exchange, format: &str) -> Result<(), BoxError> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(exchange)?),
        "compact" => println!(
            "{} {} {}",
            exchange.handshake.map(String::from).unwrap_or_else(|| "-".into()),
            exchange.terminal.map(String::from).unwrap_or_else(|| "-".into()),
            hex(&exchange.data)
        ),
        _ => print_table(request, exchange),
    }
    Ok(())
}

fn print_table(request: &Request, exchange: &Exchange) {
    println!("{} {}", "Frame:".bright_white(), exchange.frame);

    match exchange.handshake {
        Some('A') => println!("{} {}", "Handshake:".bright_white(), "Ack".bright_green()),
        Some('N') => println!("{} {}", "Handshake:".bright_white(), "Nak (no such device)".bright_red()),
        Some(other) => println!("{} {}", "Handshake:".bright_white(), other.to_string().yellow()),
        None => println!("{} {}", "Handshake:".bright_white(), "none (bad frame or broadcast)".yellow()),
    }

    match exchange.terminal {
        Some('C') => println!("{} {}", "Result:".bright_white(), "Complete".bright_green()),
        Some('E') => println!("{} {}", "Result:".bright_white(), "Error".bright_red()),
        _ => {}
    }
    if exchange.checksum_ok == Some(false) {
        println!("{}", "Data frame checksum mismatch".bright_red());
    }

    let data = &exchange.data;
    match request.kind {
        RequestKind::Status if data.len() == 4 => {
            println!("{} 0x{:02X}", "Drive status:".bright_white(), data[0]);
            println!("{} 0x{:02X}", "Controller:".bright_white(), data[1]);
            println!("{} {}", "Format timeout:".bright_white(), data[2]);
        }
        RequestKind::HighSpeed if data.len() == 1 => {
            let index = if data[0] == 0xFF { -1 } else { i32::from(data[0]) };
            println!("{} {}", "High speed index:".bright_white(), index.to_string().bright_cyan());
            println!(
                "{} {} baud (PAL)",
                "High speed rate:".bright_white(),
                high_speed_baud_for(index, PAL_OSCILLATOR_HZ)
            );
        }
        RequestKind::Time if data.len() == 6 => {
            println!(
                "{} 20{:02}-{:02}-{:02} {:02}:{:02}:{:02} UTC",
                "Time:".bright_white(),
                data[2],
                data[1],
                data[0],
                data[3],
                data[4],
                data[5]
            );
        }
        _ if !data.is_empty() => {
            for (i, row) in data.chunks(16).enumerate() {
                println!("  {:04X}  {}", i * 16, hex(row));
            }
        }
        _ => {}
    }

    println!("{} {} ms", "Elapsed:".dimmed(), exchange.elapsed_ms);
}
