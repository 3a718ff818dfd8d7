use std::fs;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;

use wulpus_rs::logging::{init_cli_logging, parse_level};
use wulpus_rs::{AcquisitionFrame, Connection, ConnectionConfig, TransportKind};

#[derive(Parser, Debug)]
#[command(name = "wulpus-demo", about = "Discover WULPUS probes and read acquisition frames")]
struct Args {
    /// Link to use: "dongle" (USB serial) or "direct" (BLE)
    #[arg(short, long, default_value = "dongle", value_parser = parse_kind)]
    transport: TransportKind,
    /// Log level (trace, debug, info, warn, error); overrides WULPUS_LOG
    #[arg(long, value_parser = parse_log_level)]
    log_level: Option<LevelFilter>,
    /// BLE scan duration in seconds
    #[arg(long, default_value_t = 5)]
    scan_secs: u64,
    /// Give up on a single frame after this many milliseconds
    #[arg(long)]
    receive_timeout_ms: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available dongles or probes
    List,
    /// Open a device, optionally send a configuration package, and print frames
    Acquire {
        /// Device name as shown by `list` (defaults to the first one found)
        #[arg(short, long)]
        device: Option<String>,
        /// Binary configuration package to send before reading
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Number of frames to read
        #[arg(short = 'n', long, default_value_t = 10)]
        frames: usize,
    },
}

fn parse_kind(s: &str) -> std::result::Result<TransportKind, String> {
    s.parse().map_err(|e: wulpus_rs::DriverError| e.to_string())
}

fn parse_log_level(s: &str) -> std::result::Result<LevelFilter, String> {
    parse_level(s).ok_or_else(|| format!("unknown log level {s:?}"))
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_cli_logging(args.log_level);

    let mut config =
        ConnectionConfig::default().with_scan_duration(Duration::from_secs(args.scan_secs));
    if let Some(ms) = args.receive_timeout_ms {
        config = config.with_receive_timeout(Duration::from_millis(ms));
    }
    let link = Connection::with_config(args.transport, config)
        .with_context(|| format!("creating {} connection", args.transport))?;

    match args.command {
        Command::List => list(&link),
        Command::Acquire {
            device,
            config,
            frames,
        } => acquire(&link, device.as_deref(), config.as_deref(), frames),
    }
}

fn list(link: &Connection) -> Result<()> {
    let devices = link.list_available();
    if devices.is_empty() {
        println!("No devices found.");
        return Ok(());
    }
    for (i, device) in devices.iter().enumerate() {
        println!("[{i}] {device}");
    }
    Ok(())
}

fn acquire(
    link: &Connection,
    name: Option<&str>,
    config: Option<&std::path::Path>,
    frames: usize,
) -> Result<()> {
    let package = config
        .map(|path| fs::read(path).with_context(|| format!("reading {}", path.display())))
        .transpose()?;

    println!("Scanning...");
    let devices = link.list_available();
    let device = match name {
        Some(name) => devices
            .into_iter()
            .find(|d| d.name() == name)
            .ok_or_else(|| anyhow!("device {name:?} not found"))?,
        None => devices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no devices found"))?,
    };

    println!("Opening {device}...");
    if !link.open(&device) {
        bail!("could not open {}", device.name());
    }

    if let Some(package) = package {
        println!("Sending {} byte configuration...", package.len());
        if !link.send_config(&package) {
            link.close();
            bail!("configuration was not sent");
        }
    }

    println!("Reading {frames} frames of {} samples...", link.acq_length());
    let mut received = 0;
    for i in 0..frames {
        match link.receive_frame() {
            Some(frame) => {
                received += 1;
                println!("[Frame {i}] {}", summarize(&frame));
            }
            None => println!("[Frame {i}] no data"),
        }
    }

    println!("Closing...");
    link.close();
    println!("Done: {received}/{frames} frames.");
    Ok(())
}

fn summarize(frame: &AcquisitionFrame) -> String {
    let (min, max) = frame
        .samples
        .iter()
        .fold((i16::MAX, i16::MIN), |(lo, hi), &s| (lo.min(s), hi.max(s)));
    format!(
        "acq: {:5} | ch: {:2} | min: {:6} | max: {:6} | head: {:?}",
        frame.acquisition_number,
        frame.channel_id,
        min,
        max,
        &frame.samples[..frame.samples.len().min(4)]
    )
}
