//! cyflash CLI - Command-line bootloader tool for Cypress PSoC devices.
//!
//! ## Features
//!
//! - Flash `.cyacd` firmware images over serial or CAN
//! - Optional erase pass before programming
//! - Downgrade and application-id policies with interactive prompts
//! - Repetitive bootloader entry so the device can be reset by hand

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser, ValueEnum};
use console::style;
use cyflash::{
    ChunkSize, Confirmation, Event, FlashSession, Image, InitRetry, SerialTransport,
    SessionOptions, Transport,
};
use dialoguer::Confirm;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};

/// cyflash - Bootloader tool for Cypress PSoC devices.
///
/// Flashes a .cyacd firmware image to a device running the Cypress
/// bootloader, over a serial port or a CAN bus.
#[derive(Parser)]
#[command(name = "cyflash")]
#[command(author, version, about)]
#[command(group(ArgGroup::new("interface").required(true)))]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Firmware image to read flash data from (.cyacd).
    image: PathBuf,

    /// Use a serial interface (e.g. /dev/ttyUSB0 or COM3).
    #[arg(long, value_name = "PORT", group = "interface")]
    serial: Option<String>,

    /// Use a CAN bus backend (only "socketcan" is supported).
    #[arg(long, value_name = "BUSTYPE", group = "interface")]
    canbus: Option<String>,

    /// Baud rate to use when flashing over serial.
    #[arg(long = "serial_baudrate", value_name = "BAUD", default_value_t = 115200)]
    serial_baudrate: u32,

    /// Parity to use when flashing over serial.
    #[arg(long, value_name = "PARITY", default_value = "N")]
    parity: ParityArg,

    /// Stop bits to use when flashing over serial.
    #[arg(long, value_name = "BITS", default_value = "1")]
    stopbits: StopBitsArg,

    /// Time to wait for a bootloader response, in seconds.
    #[arg(long, value_name = "SECS", default_value_t = 5.0)]
    timeout: f64,

    /// Erase every image row before programming.
    #[arg(long)]
    erase: bool,

    /// Don't prompt before flashing old firmware over newer.
    #[arg(long, group = "downgrade_policy")]
    downgrade: bool,

    /// Fail instead of prompting when device firmware is newer.
    #[arg(long, group = "downgrade_policy")]
    nodowngrade: bool,

    /// Don't prompt before flashing an image with a different application id.
    #[arg(long, group = "newapp_policy")]
    newapp: bool,

    /// Fail instead of flashing an image with a different application id.
    #[arg(long, group = "newapp_policy")]
    nonewapp: bool,

    /// Data bytes per protocol packet (16, 32, 64 or 128).
    #[arg(
        short = 'c',
        long = "chunk_size",
        value_name = "BYTES",
        default_value = "32",
        value_parser = parse_chunk_size
    )]
    chunk_size: ChunkSize,

    /// How long to keep retrying bootloader entry, in seconds
    /// (0 = single try, negative = forever).
    #[arg(
        short = 'r',
        long = "repetitive_init",
        value_name = "SECS",
        default_value_t = 2.0,
        allow_negative_numbers = true
    )]
    repetitive_init: f64,

    /// CAN channel to be used (e.g. can0).
    #[arg(long = "canbus_channel", value_name = "CHANNEL", default_value = "can0")]
    canbus_channel: String,

    /// CAN bitrate; the interface must already be configured to it
    /// (ip link set canX type can bitrate N).
    #[arg(long = "canbus_baudrate", value_name = "BAUD", default_value_t = 125_000)]
    canbus_baudrate: u32,

    /// CAN frame id of the target device.
    #[arg(long = "canbus_id", value_name = "ID", default_value = "0", value_parser = parse_can_id)]
    canbus_id: u32,

    /// CAN broadcast id the device also listens on.
    #[arg(
        long = "canbus_broadcast_id",
        value_name = "ID",
        default_value = "0x7FF",
        value_parser = parse_can_id
    )]
    canbus_broadcast_id: u32,

    /// Extra CAN id to accept responses from.
    #[arg(long = "canbus_wildcard_id", value_name = "ID", value_parser = parse_can_id)]
    canbus_wildcard_id: Option<u32>,

    /// Expect the CAN bus to echo transmitted frames.
    #[arg(long = "canbus_echo")]
    canbus_echo: bool,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long)]
    quiet: bool,
}

/// Serial parity settings.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum ParityArg {
    /// No parity.
    #[value(name = "N")]
    None,
    /// Even parity.
    #[value(name = "E")]
    Even,
    /// Odd parity.
    #[value(name = "O")]
    Odd,
}

impl From<ParityArg> for serialport::Parity {
    fn from(parity: ParityArg) -> Self {
        match parity {
            ParityArg::None => serialport::Parity::None,
            ParityArg::Even => serialport::Parity::Even,
            ParityArg::Odd => serialport::Parity::Odd,
        }
    }
}

/// Serial stop bit settings.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum StopBitsArg {
    /// One stop bit.
    #[value(name = "1")]
    One,
    /// Two stop bits.
    #[value(name = "2")]
    Two,
}

impl From<StopBitsArg> for serialport::StopBits {
    fn from(stopbits: StopBitsArg) -> Self {
        match stopbits {
            StopBitsArg::One => serialport::StopBits::One,
            StopBitsArg::Two => serialport::StopBits::Two,
        }
    }
}

/// Parse a chunk size, accepting only the sizes the bootloader buffers.
fn parse_chunk_size(s: &str) -> Result<ChunkSize, String> {
    let bytes: usize = s.parse().map_err(|e| format!("invalid chunk size: {e}"))?;
    ChunkSize::from_bytes(bytes).ok_or_else(|| "chunk size must be 16, 32, 64 or 128".to_string())
}

/// Parse a CAN id, decimal or hexadecimal with an 0x prefix.
fn parse_can_id(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|e| format!("invalid CAN id: {e}"))
}

fn main() {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!("cyflash v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&cli) {
        debug!("{e:?}");
        eprintln!("{} {e:#}", style("Error:").red().bold());
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading firmware image {}",
            style("→").cyan(),
            style(cli.image.display()).bold()
        );
    }
    let image = Image::from_file(&cli.image)
        .with_context(|| format!("cannot load image {}", cli.image.display()))?;
    if !cli.quiet {
        eprintln!(
            "{} Silicon {:#010x} rev {}, {} rows in {} array(s)",
            style("ℹ").blue(),
            image.silicon_id,
            image.silicon_rev,
            image.rows().len(),
            image.arrays().len()
        );
    }

    let timeout = Duration::from_secs_f64(cli.timeout);
    if let Some(port) = &cli.serial {
        if !cli.quiet {
            eprintln!(
                "{} Using serial port {} at {} baud",
                style("→").cyan(),
                style(port).bold(),
                cli.serial_baudrate
            );
        }
        let transport = SerialTransport::open(
            port,
            cli.serial_baudrate,
            cli.parity.into(),
            cli.stopbits.into(),
            timeout,
        )
        .with_context(|| format!("cannot open serial port {port}"))?;
        flash(cli, &image, transport)
    } else {
        flash_canbus(cli, &image, timeout)
    }
}

#[cfg(target_os = "linux")]
fn flash_canbus(cli: &Cli, image: &Image, timeout: Duration) -> Result<()> {
    use cyflash::{CanOptions, CanTransport, SocketCanBus};

    let backend = cli.canbus.as_deref().unwrap_or_default();
    if backend != "socketcan" {
        bail!("unsupported CAN backend {backend:?}, only \"socketcan\" is available");
    }
    if !cli.quiet {
        eprintln!(
            "{} Using CAN interface {} (bitrate {} expected on the link)",
            style("→").cyan(),
            style(&cli.canbus_channel).bold(),
            cli.canbus_baudrate
        );
    }
    let bus = SocketCanBus::open(&cli.canbus_channel)
        .with_context(|| format!("cannot open CAN interface {}", cli.canbus_channel))?;
    let options = CanOptions {
        device_id: cli.canbus_id,
        broadcast_id: cli.canbus_broadcast_id,
        wildcard_id: cli.canbus_wildcard_id,
        echo: cli.canbus_echo,
    };
    let transport = CanTransport::new(bus, options, timeout)?;
    flash(cli, image, transport)
}

#[cfg(not(target_os = "linux"))]
fn flash_canbus(_cli: &Cli, _image: &Image, _timeout: Duration) -> Result<()> {
    bail!("CAN support requires Linux (SocketCAN)");
}

fn flash<T: Transport>(cli: &Cli, image: &Image, transport: T) -> Result<()> {
    let options = SessionOptions {
        erase: cli.erase,
        chunk_size: cli.chunk_size,
        allow_downgrade: policy(cli.downgrade, cli.nodowngrade),
        allow_different_app: policy(cli.newapp, cli.nonewapp),
        init_retry: InitRetry::from_secs(cli.repetitive_init),
        ..SessionOptions::default()
    };

    let mut session = FlashSession::new(transport, image.checksum_kind, options);
    let mut confirm = PromptConfirmation;

    if !cli.quiet {
        eprintln!(
            "{} Waiting for the bootloader; reset the device if it does not answer",
            style("⏳").yellow()
        );
    }

    let bar = if cli.quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(image.rows().len() as u64);
        #[allow(clippy::unwrap_used)] // Static template string
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} rows {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        bar
    };

    let result = session.run(image, &mut confirm, |event| match event {
        Event::EnteredBootloader { identity } => {
            bar.println(format!("{} Connected: {identity}", style("✓").green()));
        },
        Event::ArrayRange { array_id, first_row, last_row } => {
            bar.println(format!(
                "{} Array {array_id}: rows {first_row}..={last_row}",
                style("ℹ").blue()
            ));
        },
        Event::Erasing { row, total, errors } => {
            bar.set_position(row as u64);
            bar.set_message(message_with_errors("erasing", errors));
            if row == total {
                bar.set_position(0);
            }
        },
        Event::Programming { row, errors, .. } => {
            bar.set_position(row as u64);
            bar.set_message(message_with_errors("programming", errors));
        },
        Event::Verified { ok } => {
            bar.println(if ok {
                format!("{} Device checksum verifies OK", style("✓").green())
            } else {
                format!("{} Device checksum does NOT verify", style("✗").red())
            });
        },
        Event::Rebooting => {
            bar.println(format!("{} Rebooting device", style("↻").cyan()));
        },
    });

    bar.finish_and_clear();
    let _ = session.close();
    result?;

    if !cli.quiet {
        eprintln!("{} Flashing complete", style("✓").green().bold());
    }
    Ok(())
}

fn message_with_errors(phase: &str, errors: u32) -> String {
    if errors == 0 {
        phase.to_string()
    } else {
        format!("{phase} ({errors} packet errors)")
    }
}

/// Map a flag pair to a policy: set, unset, or ask.
fn policy(allow: bool, deny: bool) -> Option<bool> {
    match (allow, deny) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

/// Interactive confirmation via terminal prompts; declines when no answer
/// can be collected (e.g. stdin is not a terminal).
struct PromptConfirmation;

impl Confirmation for PromptConfirmation {
    fn allow_downgrade(&mut self, device_version: u16, image_version: u16) -> bool {
        ask(&format!(
            "Device application v{}.{} is newer than image v{}.{}. Flash anyway?",
            device_version >> 8,
            device_version & 0xFF,
            image_version >> 8,
            image_version & 0xFF
        ))
    }

    fn allow_different_app(&mut self, device_app: u16, image_app: u16) -> bool {
        ask(&format!(
            "Device application id {device_app} differs from image application id {image_app}. \
             Flash anyway?"
        ))
    }
}

fn ask(prompt: &str) -> bool {
    match Confirm::new().with_prompt(prompt).default(false).interact() {
        Ok(answer) => answer,
        Err(e) => {
            warn!("cannot prompt for confirmation ({e}), declining");
            false
        },
    }
}
