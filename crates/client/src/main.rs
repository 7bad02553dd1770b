//! usb-ctrl
//!
//! Command-line front end for the client library: waits for a device,
//! claims an interface and issues one control request or lifecycle
//! operation, printing the outcome as JSON.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use client::config::{self, ClientConfig};
use client::{LibusbPlatform, Session};
use common::setup_logging;
use protocol::{ControlSetup, DeviceSelector, Direction, TransferResult};
use serde_json::json;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "usb-ctrl")]
#[command(author, version, about = "Control transfers to a USB device")]
#[command(long_about = "
Waits for a USB device by vendor/product ID, claims one of its interfaces
exclusively and issues control requests on its default pipe.

EXAMPLES:
    # Wait until 1234:5678 can be claimed
    usb-ctrl --device 1234:5678 wait

    # Read the device descriptor
    usb-ctrl --device 1234:5678 control 0x80 0x06 0x0100 0 --length 18

    # Vendor OUT request, aborted if not done within 50ms
    usb-ctrl --device 1234:5678 control-async 0x40 0x01 0 0 --data 0a0b --timeout-ms 50

CONFIGURATION:
    The tool looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-ctrl/client.toml
    3. /etc/usb-ctrl/client.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Device to use as vid:pid in hex
    #[arg(short, long, value_name = "VID:PID")]
    device: Option<DeviceSelector>,

    /// Interface position to claim
    #[arg(short, long, value_name = "INDEX")]
    interface: Option<u8>,

    /// Alternate setting (only 1 is negotiated)
    #[arg(long, value_name = "ALT")]
    alt_setting: Option<u8>,

    /// Give up waiting for the device after this many milliseconds
    #[arg(long, value_name = "MS")]
    deadline_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wait for the device, claim it and release it again
    Wait,
    /// Blocking control transfer
    Control {
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Control transfer aborted after a bounded wait
    ControlAsync {
        #[command(flatten)]
        request: RequestArgs,
        /// Wait window before the transfer is aborted
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },
    /// Reset the device
    Reset,
    /// Reset the device and claim interface 0 again
    Reconnect,
}

#[derive(clap::Args, Debug)]
struct RequestArgs {
    /// bmRequestType
    #[arg(value_parser = parse_u8)]
    request_type: u8,
    /// bRequest
    #[arg(value_parser = parse_u8)]
    request: u8,
    /// wValue
    #[arg(value_parser = parse_u16)]
    value: u16,
    /// wIndex
    #[arg(value_parser = parse_u16)]
    index: u16,
    /// wLength; defaults to the length of --data
    #[arg(long, value_parser = parse_u16)]
    length: Option<u16>,
    /// Data stage as hex bytes, e.g. 0a0b0c
    #[arg(long, value_name = "HEX")]
    data: Option<String>,
}

impl RequestArgs {
    /// Setup packet plus the data stage buffer, if one is needed
    fn prepare(&self) -> Result<(ControlSetup, Option<Vec<u8>>)> {
        let data = self.data.as_deref().map(parse_hex_bytes).transpose()?;
        let length = match (self.length, &data) {
            (Some(length), _) => length,
            (None, Some(data)) => u16::try_from(data.len()).context("Data stage too long")?,
            (None, None) => 0,
        };

        let setup = ControlSetup::new(self.request_type, self.request, self.value, self.index, length);
        let buffer = match (setup.direction(), data) {
            (Direction::In, Some(_)) => bail!("--data is only valid for OUT requests"),
            (Direction::In, None) => Some(vec![0u8; length as usize]),
            (Direction::Out, Some(mut buffer)) => {
                buffer.resize(length as usize, 0);
                Some(buffer)
            }
            // The session sends zero bytes
            (Direction::Out, None) => None,
        };
        Ok((setup, buffer))
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = ClientConfig::default();
        let path = ClientConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        ClientConfig::load(Some(config::expand_path(path))).context("Failed to load configuration")?
    } else {
        ClientConfig::load_or_default()
    };

    // Use CLI log level if specified, otherwise use config value
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.client.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-ctrl v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let selector = match args.device {
        Some(selector) => selector,
        None => config.selector()?,
    };
    let interface = args.interface.unwrap_or(config.device.interface);
    let alt_setting = args.alt_setting.unwrap_or(config.device.alt_setting);

    let mut options = config.session_options();
    if let Some(ms) = args.deadline_ms {
        options.connect = options.connect.with_timeout(Duration::from_millis(ms));
    }

    let platform = LibusbPlatform::new().context("Failed to initialize libusb")?;
    let mut session = Session::for_selector(platform, selector, options);

    session
        .connect(interface, alt_setting)
        .with_context(|| format!("Failed to connect to {}", selector))?;

    let output = match args.command {
        Command::Wait => {
            session.disconnect()?;
            json!({ "device": selector.to_string(), "interface": interface, "claimed": true })
        }
        Command::Control { request } => {
            let (setup, mut buffer) = request.prepare()?;
            let result = session.transfer(setup, buffer.as_deref_mut());
            transfer_report(setup, &result, buffer.as_deref())
        }
        Command::ControlAsync {
            request,
            timeout_ms,
        } => {
            let (setup, mut buffer) = request.prepare()?;
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.async_timeout());
            let result = session.transfer_async(setup, buffer.as_deref_mut(), timeout);
            transfer_report(setup, &result, buffer.as_deref())
        }
        Command::Reset => {
            session.reset().context("Device reset failed")?;
            json!({ "device": selector.to_string(), "reset": true })
        }
        Command::Reconnect => {
            session.reconnect().context("Reconnect failed")?;
            json!({ "device": selector.to_string(), "connected": session.is_open() })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn transfer_report(
    setup: ControlSetup,
    result: &TransferResult,
    buffer: Option<&[u8]>,
) -> serde_json::Value {
    let mut report = json!({
        "state": result.state,
        "length": result.length,
    });

    if setup.direction() == Direction::In
        && !result.is_dispatch_failure()
        && let Some(buffer) = buffer
    {
        let received = (result.length as usize).min(buffer.len());
        report["data"] = json!(to_hex(&buffer[..received]));
    }
    report
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn parse_u8(s: &str) -> Result<u8> {
    let value = parse_u16(s)?;
    u8::try_from(value).map_err(|_| anyhow!("{} does not fit in a byte", s))
}

fn parse_u16(s: &str) -> Result<u16> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.with_context(|| format!("Invalid number '{}'", s))
}

fn parse_hex_bytes(s: &str) -> Result<Vec<u8>> {
    let s = s.trim_start_matches("0x");
    if s.len() % 2 != 0 {
        bail!("Hex data must have an even number of digits");
    }

    (0..s.len())
        .step_by(2)
        .map(|i| {
            s.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| anyhow!("Invalid hex byte at offset {}", i))
        })
        .collect()
}
