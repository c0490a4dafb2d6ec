//! devsession
//!
//! Command-line front end for the device session engine: list HID and USB
//! devices, monitor one of them with automatic reconnect, write to it, and
//! exchange HID feature reports.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use cli::config::{CliConfig, DeviceKind};
use cli::hex;
use common::device_types::parse_id;
use common::{
    DeviceDescriptor, DeviceFilter, EventStream, SessionEvent, TargetIdentity, TransferKind,
    setup_logging,
};
use session::{EventSession, RusbTransport, SessionConfig, SyncUsbDevice, UsbHandle};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "devsession")]
#[command(
    author,
    version,
    about = "devsession - Long-lived HID/USB device sessions with automatic reconnect"
)]
#[command(long_about = "
Opens HID or raw USB devices, streams inbound data and reconnects
transparently when the device is unplugged and plugged back in.

EXAMPLES:
    # List HID devices from one vendor
    devsession list --hid --vendor 046d

    # Monitor a device until Ctrl+C
    devsession monitor --target 046d:c52b

    # Monitor a specific HID usage for 30 seconds
    devsession monitor --target 046d:c52b/ff00:0001 --duration 30

    # Raw USB with hot-plug notifications
    devsession monitor --kind usb --target 1234:5678 --hotplug

    # Send a report
    devsession write --target 046d:c52b \"00 01 02\"

CONFIGURATION:
    Configuration files are looked up in the following order:
    1. Path specified with --config
    2. ~/.config/devsession/config.toml
    3. /etc/devsession/config.toml
    4. Built-in defaults
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
    /// List attached devices
    List {
        /// Only HID devices
        #[arg(long, conflicts_with = "usb")]
        hid: bool,
        /// Only raw USB devices
        #[arg(long)]
        usb: bool,
        /// Vendor ID (hex)
        #[arg(long, value_parser = parse_id)]
        vendor: Option<u16>,
        /// Product ID (hex)
        #[arg(long, value_parser = parse_id)]
        product: Option<u16>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Open a device and print everything it sends
    Monitor {
        /// Device as vvvv:pppp or vvvv:pppp/gggg:uuuu
        #[arg(short, long)]
        target: Option<TargetIdentity>,
        /// Session engine (hid or usb)
        #[arg(short, long)]
        kind: Option<DeviceKind>,
        /// Enable hot-plug notifications (usb only)
        #[arg(long)]
        hotplug: bool,
        /// Stop after this many seconds
        #[arg(short, long, value_name = "SECS")]
        duration: Option<u64>,
    },
    /// Write one payload to a device
    Write {
        #[arg(short, long)]
        target: Option<TargetIdentity>,
        #[arg(short, long)]
        kind: Option<DeviceKind>,
        /// Payload in hex, e.g. "01 02 ff"
        data: String,
    },
    /// Send or fetch a HID feature report
    Feature {
        #[arg(short, long)]
        target: Option<TargetIdentity>,
        /// Report to send in hex, report ID first
        #[arg(long, conflicts_with = "get")]
        send: Option<String>,
        /// Report ID to fetch
        #[arg(long, value_name = "ID")]
        get: Option<u8>,
        /// Buffer length for --get, including the report ID byte
        #[arg(long, value_name = "N", default_value_t = 64)]
        len: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = CliConfig::default();
        let path = args.config.clone().unwrap_or_else(CliConfig::default_path);
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match args.config {
        Some(ref path) => {
            CliConfig::load(Some(path.clone())).context("Failed to load configuration")?
        }
        None => CliConfig::load_or_default(),
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("devsession v{}", env!("CARGO_PKG_VERSION"));

    let Some(command) = args.command else {
        bail!("No command given, see --help");
    };

    match command {
        Command::List {
            hid,
            usb,
            vendor,
            product,
            json,
        } => list_devices(&config, hid, usb, DeviceFilter::new(vendor, product), json),
        Command::Monitor {
            target,
            kind,
            hotplug,
            duration,
        } => {
            let target = resolve_target(target, &config)?;
            let kind = kind.unwrap_or(config.device.kind);
            let hotplug = hotplug || config.device.hotplug;
            monitor(&config, kind, target, hotplug, duration.map(Duration::from_secs)).await
        }
        Command::Write { target, kind, data } => {
            let target = resolve_target(target, &config)?;
            let payload = hex::parse_bytes(&data).context("Invalid payload")?;
            write_once(&config, kind.unwrap_or(config.device.kind), target, &payload)
        }
        Command::Feature {
            target,
            send,
            get,
            len,
        } => {
            let target = resolve_target(target, &config)?;
            feature_report(&config, target, send.as_deref(), get, len)
        }
    }
}

fn resolve_target(target: Option<TargetIdentity>, config: &CliConfig) -> Result<TargetIdentity> {
    target
        .or(config.device.target)
        .ok_or_else(|| anyhow!("No target device, pass --target or set [device] target"))
}

/// Enumerate devices and print them
fn list_devices(
    config: &CliConfig,
    hid_only: bool,
    usb_only: bool,
    filter: DeviceFilter,
    json: bool,
) -> Result<()> {
    let mut listing: Vec<(DeviceKind, DeviceDescriptor)> = Vec::new();

    if !usb_only {
        for descriptor in enumerate_hid(&config.session, &filter)? {
            listing.push((DeviceKind::Hid, descriptor));
        }
    }
    if !hid_only {
        let usb = EventSession::usb(config.session.clone()).context("Failed to initialize USB")?;
        for descriptor in usb.enumerate(&filter)? {
            listing.push((DeviceKind::Usb, descriptor));
        }
    }

    if json {
        let entries: Vec<serde_json::Value> = listing
            .iter()
            .map(|(kind, descriptor)| -> Result<serde_json::Value, serde_json::Error> {
                let mut value = serde_json::to_value(descriptor)?;
                if let Some(map) = value.as_object_mut() {
                    map.insert("kind".to_string(), serde_json::json!(kind.to_string()));
                }
                Ok(value)
            })
            .collect::<Result<_, _>>()?;
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if listing.is_empty() {
        println!("No devices found.");
        return Ok(());
    }

    println!("Found {} device(s):\n", listing.len());
    for (kind, device) in &listing {
        println!(
            "  [{}] {:04x}:{:04x} - {} {}",
            kind,
            device.vendor_id,
            device.product_id,
            device
                .manufacturer
                .as_deref()
                .unwrap_or("Unknown Manufacturer"),
            device.product.as_deref().unwrap_or("Unknown Product")
        );
        if let (Some(page), Some(usage)) = (device.usage_page, device.usage) {
            println!("      Usage {:04x}:{:04x}", page, usage);
        }
        if let Some(path) = &device.path {
            println!("      Path: {}", path);
        }
        if device.in_endpoint.is_some() || device.out_endpoint.is_some() {
            println!(
                "      Interface {} IN {} OUT {}",
                device.interface.unwrap_or(0),
                format_endpoint(device.in_endpoint),
                format_endpoint(device.out_endpoint)
            );
        }
        if let Some(serial) = &device.serial_number {
            println!("      Serial: {}", serial);
        }
        println!();
    }

    Ok(())
}

fn format_endpoint(endpoint: Option<u8>) -> String {
    endpoint
        .map(|ep| format!("0x{:02x}", ep))
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(feature = "hid")]
fn enumerate_hid(config: &SessionConfig, filter: &DeviceFilter) -> Result<Vec<DeviceDescriptor>> {
    let session = session::PollingSession::hid(config.clone()).context("Failed to initialize HID")?;
    Ok(session.enumerate(filter)?)
}

#[cfg(not(feature = "hid"))]
fn enumerate_hid(_config: &SessionConfig, _filter: &DeviceFilter) -> Result<Vec<DeviceDescriptor>> {
    warn!("Built without HID support, skipping HID devices");
    Ok(Vec::new())
}

/// Run a session until Ctrl+C or the optional duration elapses
async fn monitor(
    config: &CliConfig,
    kind: DeviceKind,
    target: TargetIdentity,
    hotplug: bool,
    duration: Option<Duration>,
) -> Result<()> {
    info!("Monitoring {} device {}", kind, target);

    match kind {
        DeviceKind::Hid => {
            if hotplug {
                warn!("--hotplug only applies to usb sessions, ignoring");
            }
            monitor_hid(config, target, duration).await
        }
        DeviceKind::Usb => {
            let session =
                EventSession::usb(config.session.clone()).context("Failed to initialize USB")?;
            let events = session.subscribe();
            session
                .start(target)
                .with_context(|| format!("Failed to open {}", target))?;
            if hotplug {
                if let Err(e) = session.enable_hotplug() {
                    warn!("Hot-plug notifications unavailable: {}", e);
                }
            }
            let result = print_events(events, duration).await;
            session.stop();
            result
        }
    }
}

#[cfg(feature = "hid")]
async fn monitor_hid(
    config: &CliConfig,
    target: TargetIdentity,
    duration: Option<Duration>,
) -> Result<()> {
    let session =
        session::PollingSession::hid(config.session.clone()).context("Failed to initialize HID")?;
    let events = session.subscribe();
    session
        .start(target)
        .with_context(|| format!("Failed to open {}", target))?;
    let result = print_events(events, duration).await;
    session.stop();
    result
}

#[cfg(not(feature = "hid"))]
async fn monitor_hid(
    _config: &CliConfig,
    _target: TargetIdentity,
    _duration: Option<Duration>,
) -> Result<()> {
    bail!("Built without HID support")
}

async fn print_events(events: EventStream, duration: Option<Duration>) -> Result<()> {
    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    info!("Press Ctrl+C to stop");

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Error waiting for Ctrl+C: {}", e);
                }
                info!("Received Ctrl+C, stopping");
                break;
            }
            _ = &mut deadline => {
                info!("Monitor duration elapsed");
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Data(bytes)) => {
                    println!("<- [{:>4}] {}", bytes.len(), hex::format_bytes(&bytes));
                }
                Ok(SessionEvent::Connectivity(true)) => println!("-- connected"),
                Ok(SessionEvent::Connectivity(false)) => println!("-- disconnected"),
                Err(e) => {
                    warn!("Event stream closed: {}", e);
                    break;
                }
            },
        }
    }

    Ok(())
}

/// Open the target, send one payload and close it again
fn write_once(
    config: &CliConfig,
    kind: DeviceKind,
    target: TargetIdentity,
    payload: &[u8],
) -> Result<()> {
    match kind {
        DeviceKind::Hid => write_hid(config, target, payload),
        DeviceKind::Usb => {
            let transport = RusbTransport::new().context("Failed to initialize USB")?;
            let device: SyncUsbDevice<UsbHandle> =
                SyncUsbDevice::open(&transport, &target, &config.session)
                    .with_context(|| format!("Failed to open {}", target))?;
            let endpoint = device
                .handle()
                .out_endpoint()
                .ok_or_else(|| anyhow!("{} has no OUT endpoint", target))?;
            let written = match config.session.transfer_kind {
                TransferKind::Bulk => device.send_bulk(endpoint, payload)?,
                TransferKind::Interrupt => device.send_interrupt(endpoint, payload)?,
            };
            println!("Wrote {} byte(s) to {} endpoint 0x{:02x}", written, target, endpoint);
            Ok(())
        }
    }
}

#[cfg(feature = "hid")]
fn write_hid(config: &CliConfig, target: TargetIdentity, payload: &[u8]) -> Result<()> {
    let session =
        session::PollingSession::hid(config.session.clone()).context("Failed to initialize HID")?;
    session
        .start(target)
        .with_context(|| format!("Failed to open {}", target))?;
    let written = session.write(payload);
    session.stop();
    println!("Wrote {} byte(s) to {}", written?, target);
    Ok(())
}

#[cfg(not(feature = "hid"))]
fn write_hid(_config: &CliConfig, _target: TargetIdentity, _payload: &[u8]) -> Result<()> {
    bail!("Built without HID support")
}

#[cfg(feature = "hid")]
fn feature_report(
    config: &CliConfig,
    target: TargetIdentity,
    send: Option<&str>,
    get: Option<u8>,
    len: usize,
) -> Result<()> {
    if send.is_none() && get.is_none() {
        bail!("Pass --send HEX or --get ID");
    }

    let session =
        session::PollingSession::hid(config.session.clone()).context("Failed to initialize HID")?;
    session
        .start(target)
        .with_context(|| format!("Failed to open {}", target))?;

    let result = (|| -> Result<()> {
        if let Some(report) = send {
            let report = hex::parse_bytes(report).context("Invalid report")?;
            session.send_feature_report(&report)?;
            println!("Sent feature report {:#04x} ({} bytes)", report[0], report.len());
        }
        if let Some(report_id) = get {
            let report = session.receive_feature_report(report_id, len)?;
            println!("<- [{:>4}] {}", report.len(), hex::format_bytes(&report));
        }
        Ok(())
    })();

    session.stop();
    result
}

#[cfg(not(feature = "hid"))]
fn feature_report(
    _config: &CliConfig,
    _target: TargetIdentity,
    _send: Option<&str>,
    _get: Option<u8>,
    _len: usize,
) -> Result<()> {
    bail!("Built without HID support")
}
