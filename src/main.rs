//! CyMapper - camera-based LED position mapping
//!
//! Lights every LED of a strip installation one at a time, finds it in a
//! camera frame and records its pixel position. The recorded coordinates can
//! then be fitted to an output frame or composed into a larger scene.

mod capture;
mod config;
mod coords;
mod detect;
mod fixture;
mod link;
mod resize;
mod scan;
mod scene;
mod transform;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::capture::{FrameSource, V4lCamera};
use crate::config::{Config, LinkKind};
use crate::coords::CoordinateWriter;
use crate::detect::BrightSpotDetector;
use crate::scan::{ScanConfig, ScanController};

/// CyMapper - LED position mapping with a camera
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Light each LED in turn and record its position
    Scan {
        /// LEDs per strip
        #[arg(long)]
        leds: Option<usize>,

        /// Number of pins with LEDs connected
        #[arg(long)]
        pins: Option<usize>,

        /// LED brightness (1-255)
        #[arg(long)]
        brightness: Option<u8>,

        /// Blur radius used to suppress noise
        #[arg(long, allow_negative_numbers = true)]
        radius: Option<i64>,

        /// Milliseconds per LED
        #[arg(long)]
        delay_ms: Option<u64>,

        /// First pin to scan (1-based)
        #[arg(long)]
        start_pin: Option<usize>,

        /// Camera device
        #[arg(long)]
        device: Option<String>,

        /// Output coordinate file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Fit recorded coordinates into an output frame
    Resize {
        /// Coordinate file to read (stdin when omitted)
        input: Option<PathBuf>,

        /// Border in pixels added around the detected area
        #[arg(long, allow_negative_numbers = true)]
        border: Option<i64>,

        /// Output width
        #[arg(long)]
        width: Option<u32>,

        /// Output height
        #[arg(long)]
        height: Option<u32>,

        /// Mirror horizontally
        #[arg(long)]
        flip_x: Option<bool>,

        /// Mirror vertically
        #[arg(long)]
        flip_y: Option<bool>,

        /// Output coordinate file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Compose fixtures from a scene description into one coordinate file
    Scene {
        /// Scene description (TOML)
        description: PathBuf,

        /// Output coordinate file
        #[arg(short, long, default_value = "scene.tsv")]
        output: PathBuf,
    },

    /// Send the controller handshake and log its reply
    Handshake {
        /// Reply lines to wait for on a serial link
        #[arg(long, default_value_t = 1)]
        lines: usize,

        /// Serial baud rate (the controller's setup port often runs at 500000)
        #[arg(long)]
        baud: Option<u32>,
    },

    /// Capture one frame and print the brightest spot
    Locate {
        /// Camera device
        #[arg(long)]
        device: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("CyMapper v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load_or_create(&args.config)?;

    match args.command {
        Command::Scan {
            leds,
            pins,
            brightness,
            radius,
            delay_ms,
            start_pin,
            device,
            file,
        } => {
            // Config file values, with CLI args as overrides
            let scan = &mut config.scan;
            scan.leds = leds.unwrap_or(scan.leds);
            scan.pins = pins.unwrap_or(scan.pins);
            scan.brightness = brightness.unwrap_or(scan.brightness);
            scan.radius = radius.unwrap_or(scan.radius);
            scan.delay_ms = delay_ms.unwrap_or(scan.delay_ms);
            scan.start_pin = start_pin.unwrap_or(scan.start_pin);
            if let Some(file) = file {
                scan.output = file;
            }
            if let Some(device) = device {
                config.camera.device = device;
            }
            run_scan(&config).await
        }
        Command::Resize {
            input,
            border,
            width,
            height,
            flip_x,
            flip_y,
            file,
        } => {
            let settings = &mut config.resize;
            let opts = &mut settings.options;
            opts.border = border.unwrap_or(opts.border);
            opts.width = width.unwrap_or(opts.width);
            opts.height = height.unwrap_or(opts.height);
            opts.flip_x = flip_x.unwrap_or(opts.flip_x);
            opts.flip_y = flip_y.unwrap_or(opts.flip_y);
            if let Some(file) = file {
                settings.output = file;
            }
            run_resize(&config, input)
        }
        Command::Scene {
            description,
            output,
        } => {
            let spec = scene::SceneSpec::load(&description)?;
            let base_dir = description
                .parent()
                .map(PathBuf::from)
                .unwrap_or_default();
            let scene = spec.build(&base_dir)?;
            scene.save_as(&output)
        }
        Command::Handshake { lines, baud } => {
            if let Some(baud) = baud {
                config.link.baud = baud;
            }
            run_handshake(&config, lines)
        }
        Command::Locate { device } => {
            if let Some(device) = device {
                config.camera.device = device;
            }
            run_locate(&config)
        }
    }
}

async fn run_scan(config: &Config) -> Result<()> {
    let scan_config = ScanConfig::from_settings(&config.scan)?;

    let link = link::open(&config.link)?;

    // The camera must deliver a frame before anything is written or lit
    let camera_config = config.camera.clone();
    let camera = tokio::task::spawn_blocking(move || -> Result<V4lCamera> {
        let device = &camera_config.device;
        let mut camera = V4lCamera::open(&camera_config)
            .with_context(|| format!("Cannot open camera {}", device))?;
        let (width, height) = capture::first_frame(&mut camera)
            .with_context(|| format!("Cannot read a frame from camera {}", device))?;
        info!("Camera {} delivers {}x{} frames", device, width, height);
        Ok(camera)
    })
    .await??;

    let output = &config.scan.output;
    let mut writer = CoordinateWriter::create(output)
        .with_context(|| format!("Cannot create output file {:?}", output))?;

    let controller = ScanController::new(scan_config, link, camera)?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let outcome = controller.run(&mut writer, shutdown).await;
    writer
        .flush()
        .with_context(|| format!("Cannot flush output file {:?}", output))?;
    let outcome = outcome.with_context(|| format!("Scan aborted, partial result in {:?}", output))?;

    if outcome.link_failures > 0 {
        warn!("{} link writes failed during the scan", outcome.link_failures);
    }
    if outcome.interrupted {
        info!(
            "Scan from LED {} stopped at LED {} of {}, {} samples written to {:?}",
            outcome.session.start_index(),
            outcome.session.led_index(),
            outcome.session.led_count(),
            outcome.samples.len(),
            output
        );
    } else {
        info!("Wrote {} samples to {:?}", outcome.samples.len(), output);
    }
    Ok(())
}

fn run_resize(config: &Config, input: Option<PathBuf>) -> Result<()> {
    let points = match &input {
        Some(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("Cannot open coordinate file {:?}", path))?;
            coords::read_points(file).with_context(|| format!("Cannot read {:?}", path))?
        }
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("Cannot read coordinates from stdin")?;
            coords::read_points(buf.as_slice()).context("Cannot read coordinates from stdin")?
        }
    };

    let settings = &config.resize;
    let remapped = resize::resize(&points, &settings.options)?;
    coords::write_points_file(&settings.output, &remapped)
        .with_context(|| format!("Cannot write {:?}", settings.output))?;
    info!("Wrote {} points to {:?}", remapped.len(), settings.output);
    Ok(())
}

fn run_handshake(config: &Config, lines: usize) -> Result<()> {
    let frame = link::handshake_frame(config.link.handshake);

    match config.link.kind {
        LinkKind::Serial => {
            let mut serial = link::SerialLink::open(&config.link.port, config.link.baud)
                .with_context(|| format!("When connecting to port: {}", config.link.port))?;
            link::LightLink::send(&mut serial, &frame).context("Cannot send handshake")?;

            let mut remaining = lines;
            serial
                .read_lines(|line| {
                    info!("Controller: {}", line);
                    remaining = remaining.saturating_sub(1);
                    remaining > 0
                })
                .context("Cannot read handshake reply")?;
        }
        LinkKind::Udp => {
            let mut udp = link::UdpLink::connect(&config.link.address)
                .with_context(|| format!("When connecting to {}", config.link.address))?;
            link::LightLink::send(&mut udp, &frame).context("Cannot send handshake")?;
            let reply = udp
                .receive(Duration::from_secs(2))
                .context("No handshake reply")?;
            info!("Controller: {}", reply);
        }
    }
    Ok(())
}

fn run_locate(config: &Config) -> Result<()> {
    let mut camera = V4lCamera::open(&config.camera)
        .with_context(|| format!("Cannot open camera {}", config.camera.device))?;
    let frame = camera.read_frame().context("Cannot read frame")?;

    let detector = BrightSpotDetector::new(config.scan.radius);
    match detector.detect(&frame) {
        Some(spot) => println!("{}\t{}\t{}", spot.x, spot.y, spot.value),
        None => warn!("Frame was empty"),
    }
    Ok(())
}
