use chrono::Local;
use clap::{Args, Parser, Subcommand};
use serial_link::config::{get_default_config_path, ConfigLoader};
use serial_link::{
    init_logging, Config, DescriptorError, DeviceEnumerator, ErrorReport, EventDispatcher,
    PacketDescriptor, PinState, Port, PortObserver, Request, RequestError, SystemEnumerator,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{debug, info};

// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    name = "serial-link",
    version,
    about = "Inspect and talk to serial devices.",
    long_about = "Lists serial devices, monitors a port for framed packets, and sends one-shot requests that wait for a framed response."
)]
struct Cli {
    /// Configuration file (defaults to the usual search path)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Baud rate, overriding the configured default
    #[arg(short, long, global = true)]
    baud: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the serial devices present on this system
    List,
    /// Print incoming data or packets until interrupted
    Monitor {
        /// Device path, e.g. /dev/ttyUSB0 or COM3
        port: String,
        #[command(flatten)]
        framing: FramingArgs,
    },
    /// Send one request and print the response
    Request {
        /// Device path
        port: String,
        /// Bytes to send; accepts \r \n \t \0 \\ and \xNN escapes
        data: String,
        #[command(flatten)]
        framing: FramingArgs,
        /// Give up waiting for the response after this long (0 waits forever)
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,
    },
    /// Show the resolved configuration, or write a default config file
    Config {
        #[arg(long)]
        init: bool,
    },
}

/// How packets are recognised. Without any of these, raw data is shown.
#[derive(Args, Debug, Default)]
struct FramingArgs {
    /// Bytes every packet starts with
    #[arg(long)]
    prefix: Option<String>,
    /// Bytes every packet ends with. Needs --prefix, since a bare suffix
    /// would match on its own.
    #[arg(long, requires = "prefix")]
    suffix: Option<String>,
    /// Regular expression a packet must match from its first character
    #[arg(long, conflicts_with_all = ["prefix", "suffix"])]
    regex: Option<String>,
    /// Longest packet to look for
    #[arg(long, default_value_t = 256)]
    max_len: usize,
}

impl FramingArgs {
    fn descriptor(&self) -> Result<Option<PacketDescriptor>, DescriptorError> {
        if let Some(pattern) = &self.regex {
            return PacketDescriptor::pattern_str(pattern, self.max_len).map(Some);
        }
        if self.prefix.is_none() && self.suffix.is_none() {
            return Ok(None);
        }
        let prefix = unescape(self.prefix.as_deref().unwrap_or_default());
        let suffix = unescape(self.suffix.as_deref().unwrap_or_default());
        PacketDescriptor::delimited(prefix, suffix, self.max_len).map(Some)
    }
}

/// Expand backslash escapes typed on the command line.
fn unescape(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            let escaped = match bytes[i + 1] {
                b'n' => Some(b'\n'),
                b'r' => Some(b'\r'),
                b't' => Some(b'\t'),
                b'0' => Some(0),
                b'\\' => Some(b'\\'),
                _ => None,
            };
            if let Some(byte) = escaped {
                out.push(byte);
                i += 2;
                continue;
            }
            if bytes[i + 1] == b'x' {
                if let Some(byte) = text
                    .get(i + 2..i + 4)
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// Render bytes with non-printable characters escaped.
fn printable(bytes: &[u8]) -> String {
    bytes
        .iter()
        .flat_map(|&b| std::ascii::escape_default(b))
        .map(char::from)
        .collect()
}

fn timestamp() -> String {
    Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Prints port activity for `monitor`.
struct Printer {
    raw: bool,
    gone: UnboundedSender<()>,
}

impl PortObserver for Printer {
    fn port_opened(&mut self, path: &str) {
        println!("{} opened {}", timestamp(), path);
    }

    fn port_closed(&mut self, path: &str) {
        println!("{} closed {}", timestamp(), path);
    }

    fn port_removed(&mut self, path: &str) {
        println!("{} {} was removed", timestamp(), path);
        let _ = self.gone.send(());
    }

    fn data_received(&mut self, _path: &str, data: &[u8]) {
        if self.raw {
            println!("{} <- {}", timestamp(), printable(data));
        }
    }

    fn packet_received(&mut self, _path: &str, data: &[u8], _descriptor: &PacketDescriptor) {
        println!("{} packet {}", timestamp(), printable(data));
    }

    fn error(&mut self, report: &ErrorReport) {
        eprintln!("{} error: {}", timestamp(), report);
    }

    fn pins_changed(&mut self, _path: &str, pins: PinState) {
        println!(
            "{} CTS={} DSR={} DCD={}",
            timestamp(),
            u8::from(pins.cts),
            u8::from(pins.dsr),
            u8::from(pins.dcd)
        );
    }
}

fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let loader = match &cli.config {
        Some(path) => ConfigLoader::load_from(path)?,
        None => ConfigLoader::load()?,
    };
    Ok(loader.into_config())
}

fn build_port(
    config: &Config,
    path: &str,
    baud: Option<u32>,
    events: EventDispatcher,
) -> Result<Port, Box<dyn std::error::Error>> {
    let mut settings = config.serial.to_port_settings()?;
    if let Some(baud) = baud {
        settings.baud_rate = baud;
    }
    let name = config.registry.alias(path).map(str::to_string);
    let mut builder = Port::builder(path)
        .settings(settings)
        .engine(config.engine.clone())
        .events(events);
    if let Some(name) = name {
        builder = builder.name(name);
    }
    Ok(builder.build()?)
}

fn list_ports(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let devices = SystemEnumerator.devices()?;
    let devices: Vec<_> = devices
        .into_iter()
        .filter(|d| !config.registry.is_excluded(&d.path))
        .collect();
    if devices.is_empty() {
        println!("No serial devices found.");
    }
    for device in devices {
        let name = config.registry.alias(&device.path).unwrap_or(&device.name);
        println!("{:<32} {}", device.path, name);
    }
    Ok(())
}

async fn monitor(
    config: &Config,
    path: &str,
    baud: Option<u32>,
    framing: &FramingArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let descriptor = framing.descriptor()?;
    let (gone_tx, mut gone_rx) = unbounded_channel();
    let printer = Printer {
        raw: descriptor.is_none(),
        gone: gone_tx,
    };
    let (events, delivery) = EventDispatcher::spawn(printer)?;

    let port = build_port(config, path, baud, events)?;
    if let Some(descriptor) = descriptor {
        port.start_listening(descriptor)?;
    }
    port.open()?;
    info!(path = %path, "Monitoring; press Ctrl-C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => debug!("Interrupted"),
        _ = gone_rx.recv() => {}
    }

    port.close()?;
    drop(port);
    if tokio::task::spawn_blocking(move || delivery.join())
        .await?
        .is_err()
    {
        eprintln!("event delivery thread panicked");
    }
    Ok(())
}

async fn request(
    config: &Config,
    path: &str,
    baud: Option<u32>,
    data: &str,
    framing: &FramingArgs,
    timeout_ms: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut request =
        Request::new(unescape(data)).with_timeout(Duration::from_millis(timeout_ms));
    if let Some(descriptor) = framing.descriptor()? {
        request = request.with_response(descriptor);
    }

    let port = build_port(config, path, baud, EventDispatcher::disabled())?;
    port.open()?;
    let result = tokio::task::spawn_blocking(move || port.send_request_sync(request)).await?;

    match result {
        Ok(Some(response)) => println!("{}", printable(&response)),
        Ok(None) => println!("sent"),
        Err(RequestError::TimedOut) => {
            return Err(format!("no response within {} ms", timeout_ms).into())
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn show_config(cli: &Cli, config: &Config, init: bool) -> Result<(), Box<dyn std::error::Error>> {
    if init {
        let path = cli
            .config
            .clone()
            .or_else(get_default_config_path)
            .ok_or("no configuration directory available; pass --config")?;
        ConfigLoader::with_defaults().save_to(&path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

// --- Main Application Entry Point ---
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(&config.logging)?;

    match &cli.command {
        Command::List => list_ports(&config),
        Command::Monitor { port, framing } => monitor(&config, port, cli.baud, framing).await,
        Command::Request {
            port,
            data,
            framing,
            timeout_ms,
        } => request(&config, port, cli.baud, data, framing, *timeout_ms).await,
        Command::Config { init } => show_config(&cli, &config, *init),
    }
}
