use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use facealarm_core::{CascadeDetector, FaceDetector, Presence};
use facealarm_hw::{Camera, SerialChannel};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod display;
mod engine;

use config::Config;
use display::HeadlessDisplay;
use engine::{LoopSettings, PresenceLoop};

#[derive(Parser)]
#[command(name = "facealarm", about = "Face-presence alarm: camera in, serial presence byte out")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the camera and signal face presence to the alarm board
    Run(RunArgs),
    /// List capture devices and serial ports
    Devices,
    /// Run the face detector on a still image
    Detect {
        /// Image file (PNG, JPEG, ...)
        image: PathBuf,
        /// TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Haar cascade XML
        #[arg(long)]
        cascade: Option<PathBuf>,
        /// Print boxes as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Camera device path or index
    #[arg(long)]
    camera: Option<String>,
    /// Serial port of the alarm board
    #[arg(long)]
    port: Option<String>,
    /// Serial baud rate
    #[arg(long)]
    baud: Option<u32>,
    /// Haar cascade XML
    #[arg(long)]
    cascade: Option<PathBuf>,
    /// No preview window; Ctrl-C quits
    #[arg(long)]
    headless: bool,
    /// Stop after this many frames
    #[arg(long)]
    max_frames: Option<u64>,
}

impl RunArgs {
    fn apply_to(&self, config: &mut Config) {
        if let Some(camera) = &self.camera {
            config.camera_device = camera.clone();
        }
        if let Some(port) = &self.port {
            config.serial_port = port.clone();
        }
        if let Some(baud) = self.baud {
            config.baud_rate = baud;
        }
        if let Some(cascade) = &self.cascade {
            config.cascade_path = cascade.clone();
        }
        if self.headless {
            config.headless = true;
        }
        if self.max_frames.is_some() {
            config.max_frames = self.max_frames;
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Devices => {
            list_devices();
            Ok(())
        }
        Commands::Detect {
            image,
            config,
            cascade,
            json,
        } => detect_still(image, config, cascade, json),
    }
}

fn run(args: RunArgs) -> Result<()> {
    let mut config = Config::load(args.config.as_deref()).context("loading configuration")?;
    args.apply_to(&mut config);
    tracing::debug!(?config, "effective configuration");

    // Fail fast on every resource before the loop starts.
    let detector = CascadeDetector::load(&config.cascade_path, config.detection_params())
        .with_context(|| format!("loading cascade {}", config.cascade_path.display()))?;

    let (channel, mut camera) = open_devices(
        || {
            SerialChannel::open(&config.serial_port, config.baud_rate, config.settle_delay())
                .with_context(|| format!("opening serial port {}", config.serial_port))
        },
        || {
            Camera::open(&config.camera_device, config.frame_width, config.frame_height)
                .with_context(|| format!("opening camera {}", config.camera_device))
        },
    )?;
    tracing::info!(
        device = %camera.device_path,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );
    camera
        .discard_frames(config.warmup_frames)
        .context("reading warmup frames")?;

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let flag = interrupted.clone();
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
            .context("installing Ctrl-C handler")?;
    }

    let settings = LoopSettings {
        quit_key: config.quit_key,
        poll_interval: config.poll_interval(),
        max_frames: config.max_frames,
    };

    let summary = if config.headless {
        let display = HeadlessDisplay::new(interrupted, config.quit_key);
        PresenceLoop::new(camera, detector, channel, display, settings).run()?
    } else {
        run_windowed(&config, camera, detector, channel, settings, interrupted)?
    };

    tracing::info!(
        frames = summary.frames,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "facealarm exiting"
    );
    Ok(())
}

/// The board resets when its port opens, so the channel (and its settle
/// delay) comes first. Streaming starts only afterwards and the first frames
/// handled are live.
fn open_devices<C, S>(
    open_channel: impl FnOnce() -> Result<C>,
    open_camera: impl FnOnce() -> Result<S>,
) -> Result<(C, S)> {
    let channel = open_channel()?;
    let camera = open_camera()?;
    Ok((channel, camera))
}

#[cfg(feature = "highgui")]
fn run_windowed(
    config: &Config,
    camera: Camera,
    detector: CascadeDetector,
    channel: SerialChannel,
    settings: LoopSettings,
    interrupted: Arc<AtomicBool>,
) -> Result<engine::RunSummary> {
    let display = display::HighguiDisplay::open(&config.window_title, interrupted, config.quit_key)
        .context("opening preview window")?;
    Ok(PresenceLoop::new(camera, detector, channel, display, settings).run()?)
}

#[cfg(not(feature = "highgui"))]
fn run_windowed(
    config: &Config,
    camera: Camera,
    detector: CascadeDetector,
    channel: SerialChannel,
    settings: LoopSettings,
    interrupted: Arc<AtomicBool>,
) -> Result<engine::RunSummary> {
    tracing::warn!("built without the `highgui` feature; running headless (Ctrl-C quits)");
    let display = HeadlessDisplay::new(interrupted, config.quit_key);
    Ok(PresenceLoop::new(camera, detector, channel, display, settings).run()?)
}

fn list_devices() {
    let cameras = Camera::list_devices();
    println!("Cameras:");
    if cameras.is_empty() {
        println!("  (none)");
    }
    for d in &cameras {
        println!("  {}  {} [{}] {}", d.path, d.name, d.driver, d.bus);
    }

    let ports = SerialChannel::list_ports();
    println!("Serial ports:");
    if ports.is_empty() {
        println!("  (none)");
    }
    for p in &ports {
        match &p.usb {
            Some((vid, pid, product)) => println!(
                "  {}  usb {vid:04x}:{pid:04x} {}",
                p.name,
                product.as_deref().unwrap_or("")
            ),
            None => println!("  {}", p.name),
        }
    }
}

fn detect_still(
    image_path: PathBuf,
    config_path: Option<PathBuf>,
    cascade: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let mut config = Config::load(config_path.as_deref()).context("loading configuration")?;
    if let Some(cascade) = cascade {
        config.cascade_path = cascade;
    }

    let detector = CascadeDetector::load(&config.cascade_path, config.detection_params())
        .with_context(|| format!("loading cascade {}", config.cascade_path.display()))?;

    let rgb = image::open(&image_path)
        .with_context(|| format!("reading image {}", image_path.display()))?
        .to_rgb8();
    let gray = facealarm_hw::frame::rgb_to_gray(&rgb);
    let faces = detector.detect(&gray);
    let presence = Presence::from_detections(&faces);

    if json {
        let out = serde_json::json!({
            "image": image_path.display().to_string(),
            "faces": faces,
            "presence": presence,
            "byte": (presence.as_byte() as char).to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        for f in &faces {
            println!("face x={} y={} w={} h={}", f.x, f.y, f.width, f.height);
        }
        println!(
            "{} face(s), presence {presence}, would send '{}'",
            faces.len(),
            presence.as_byte() as char
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flags_override_config() {
        let cli = Cli::try_parse_from([
            "facealarm",
            "run",
            "--camera",
            "1",
            "--port",
            "/dev/ttyUSB0",
            "--baud",
            "115200",
            "--headless",
            "--max-frames",
            "30",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };

        let mut config = Config::from_toml_str("camera_device = \"/dev/video3\"\nbaud_rate = 19200").unwrap();
        args.apply_to(&mut config);
        assert_eq!(config.camera_device, "1");
        assert_eq!(config.serial_port, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 115200);
        assert!(config.headless);
        assert_eq!(config.max_frames, Some(30));
    }

    #[test]
    fn test_absent_flags_keep_config() {
        let mut config = Config::from_toml_str("serial_port = \"/dev/ttyS1\"").unwrap();
        RunArgs::default().apply_to(&mut config);
        assert_eq!(config.serial_port, "/dev/ttyS1");
        assert!(!config.headless);
    }

    #[test]
    fn test_channel_opens_before_camera() {
        let order = std::cell::RefCell::new(Vec::new());
        let (channel, camera) = open_devices(
            || {
                order.borrow_mut().push("channel");
                Ok(1)
            },
            || {
                order.borrow_mut().push("camera");
                Ok(2)
            },
        )
        .unwrap();
        assert_eq!((channel, camera), (1, 2));
        assert_eq!(*order.borrow(), vec!["channel", "camera"]);
    }

    #[test]
    fn test_channel_failure_leaves_camera_closed() {
        let camera_opened = std::cell::Cell::new(false);
        let result: Result<((), ())> = open_devices(
            || Err(anyhow::anyhow!("no such port")),
            || {
                camera_opened.set(true);
                Ok(())
            },
        );
        assert!(result.is_err());
        assert!(!camera_opened.get());
    }

    #[test]
    fn test_detect_subcommand_parses() {
        let cli = Cli::try_parse_from(["facealarm", "detect", "face.png", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Detect { json: true, .. }));
    }
}
