//! usb-transport CLI
//!
//! Small front end over the transport library: list devices, wait for a
//! device to appear, and run single bulk transfers against it.

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use common::usb_types::parse_hex_u16;
use common::{DeviceIds, EndpointAddress, InterfaceNumber, setup_logging};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use usb_transport::{
    Acceptor, DeviceSettings, LibusbBackend, TokioExecutor, TransportConfig, UsbBackend,
    UsbDevice, config,
};

#[derive(Parser, Debug)]
#[command(name = "usb-transport")]
#[command(
    author,
    version,
    about = "Asynchronous bulk transfers over libusb"
)]
#[command(long_about = "
Drives USB devices through an executor-based asynchronous transport.

EXAMPLES:
    # List attached devices
    usb-transport list

    # Wait until a device is plugged in, then open it
    usb-transport accept dead:beef

    # Write two bytes to endpoint 0x01
    usb-transport send dead:beef --endpoint 0x01 cafe

    # Read up to 64 bytes from endpoint 0x81
    usb-transport receive 0xdead:0xbeef --endpoint 0x01 --length 64

CONFIGURATION:
    The configuration is read from the path given with --config, then
    ~/.config/usb-transport/config.toml, then built-in defaults.
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List vendor:product ids of attached devices
    List,
    /// Wait for a device to appear and open it
    Accept {
        #[command(flatten)]
        target: Target,
        /// Interface to claim
        #[arg(long)]
        interface: Option<u8>,
    },
    /// Write hex-encoded bytes to an endpoint
    Send {
        #[command(flatten)]
        target: Target,
        /// Endpoint address (hex)
        #[arg(long, value_parser = parse_hex_u8)]
        endpoint: u8,
        /// Payload as hex, e.g. "cafe01"
        data: String,
    },
    /// Read from an endpoint and print the bytes as hex
    Receive {
        #[command(flatten)]
        target: Target,
        /// Endpoint address (hex); the direction bit is added
        #[arg(long, value_parser = parse_hex_u8)]
        endpoint: u8,
        /// Buffer size in bytes
        #[arg(long, default_value_t = 64)]
        length: usize,
    },
}

#[derive(clap::Args, Debug)]
struct Target {
    /// Vendor and product id in hex, e.g. "dead:beef"
    #[arg(value_name = "VID:PID")]
    ids: DeviceIds,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = TransportConfig::default();
        let path = match &args.config {
            Some(path) => config::expand_path(path),
            None => TransportConfig::default_path(),
        };
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        TransportConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        TransportConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-transport v{}", env!("CARGO_PKG_VERSION"));

    let Some(command) = args.command else {
        return Err(anyhow!("No command given, see --help"));
    };

    let backend = Arc::new(LibusbBackend::new().context("Failed to initialise libusb")?);
    let executor = TokioExecutor::current();

    match command {
        Command::List => list_devices(&backend),
        Command::Accept { target, interface } => {
            let device = new_device(&backend, &executor, &config);
            if let Some(interface) = interface {
                device.set_option(InterfaceNumber(interface))?;
            }
            let acceptor = Acceptor::with_config(executor.clone(), &config);
            accept(&device, &acceptor, &target).await?;
            println!("Opened {}", target.ids);
            close(&device);
            Ok(())
        }
        Command::Send {
            target,
            endpoint,
            data,
        } => {
            let data = decode_hex(&data).map_err(|e| anyhow!(e))?;
            let device = open_device(&backend, &executor, &config, &target)?;
            device.set_option(EndpointAddress(endpoint))?;

            let (result, _) = device.send_owned(data).await;
            let result = result.with_context(|| format!("Send to {:#04x} failed", endpoint));
            close(&device);
            println!("Sent {} bytes", result?);
            Ok(())
        }
        Command::Receive {
            target,
            endpoint,
            length,
        } => {
            let device = open_device(&backend, &executor, &config, &target)?;
            device.set_option(EndpointAddress(endpoint))?;

            let (result, buffer) = device.receive_owned(vec![0u8; length]).await;
            let result = result.with_context(|| format!("Receive from {:#04x} failed", endpoint));
            close(&device);
            println!("{}", encode_hex(&buffer[..result?]));
            Ok(())
        }
    }
}

fn new_device(
    backend: &Arc<LibusbBackend>,
    executor: &TokioExecutor,
    config: &TransportConfig,
) -> UsbDevice<LibusbBackend, TokioExecutor> {
    UsbDevice::with_settings(
        Arc::clone(backend),
        executor.clone(),
        DeviceSettings::from(config),
    )
}

fn open_device(
    backend: &Arc<LibusbBackend>,
    executor: &TokioExecutor,
    config: &TransportConfig,
    target: &Target,
) -> Result<UsbDevice<LibusbBackend, TokioExecutor>> {
    let device = new_device(backend, executor, config);
    device
        .open(target.ids)
        .with_context(|| format!("Failed to open {}", target.ids))?;
    Ok(device)
}

fn list_devices(backend: &LibusbBackend) -> Result<()> {
    let devices = backend.devices().context("Failed to enumerate devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in &devices {
        match backend.device_ids(device) {
            Ok(ids) => println!("  {}", ids),
            Err(e) => println!("  <descriptor unavailable: {}>", e),
        }
    }
    Ok(())
}

/// Wait for the device, giving up on Ctrl+C
async fn accept(
    device: &UsbDevice<LibusbBackend, TokioExecutor>,
    acceptor: &Acceptor<TokioExecutor>,
    target: &Target,
) -> Result<()> {
    info!("Waiting for {} (Ctrl+C to abort)", target.ids);

    let accepted = acceptor.accept(device, target.ids.vendor_id, target.ids.product_id);
    tokio::pin!(accepted);

    let result = tokio::select! {
        result = &mut accepted => result,
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, cancelling accept");
            acceptor.cancel();
            accepted.await
        }
    };

    result.with_context(|| format!("Failed to accept {}", target.ids))
}

fn close(device: &UsbDevice<LibusbBackend, TokioExecutor>) {
    if let Err(e) = device.close() {
        error!("Error closing device: {}", e);
    }
    device.event_pump().shutdown();
}

fn parse_hex_u8(s: &str) -> Result<u8, String> {
    let value = parse_hex_u16(s)?;
    u8::try_from(value).map_err(|_| format!("Value '{}' does not fit in a byte", s))
}

fn decode_hex(s: &str) -> Result<Vec<u8>, String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.len() % 2 != 0 {
        return Err(format!("Odd number of hex digits in '{}'", s));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            s.get(i..i + 2)
                .and_then(|byte| u8::from_str_radix(byte, 16).ok())
                .ok_or_else(|| format!("Invalid hex byte at offset {} in '{}'", i, s))
        })
        .collect()
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
