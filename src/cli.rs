//! Command line interface
//!
//! Offline tooling around the receiver: replaying and inspecting captured
//! notification streams, generating synthetic ones, and printing build and
//! configuration details.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::capture::{self, write_capture_file, CaptureMetadata};
use crate::config::ReceiverConfig;
use crate::frame_assembler::{FrameEvent, FrameReassembler};
use crate::image_validation::validate_image;
use crate::protocol::{notify_payload_len, ImageFormat, PREFERRED_MTU};
use crate::replay::{FragmentReplay, ReplayConfig};
use crate::test_utils::FragmentGenerator;

/// Interval between synthetic notifications
const SIMULATED_INTERVAL_US: u64 = 1_500;

/// Top-level arguments
#[derive(Parser, Debug)]
#[command(
    name = "ble-snap",
    version,
    about = "Still-image receiver for BLE camera boards",
    disable_help_subcommand = true
)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay a capture through the reassembler and save the images
    Replay(ReplayArgs),
    /// Print what the reassembler does with every fragment of a capture
    Inspect(InspectArgs),
    /// Write a synthetic capture of one image
    Simulate(SimulateArgs),
    /// Print build information and the effective configuration
    Info,
}

/// Arguments of `replay`
#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Capture file (`capture_<ts>.bin`)
    pub capture: PathBuf,

    /// Playback speed multiplier; 0 replays as fast as possible
    #[arg(long, default_value_t = 1.0)]
    pub speed: f64,

    /// Start over when the capture ends
    #[arg(long = "loop")]
    pub loop_playback: bool,

    /// Stop after this many images
    #[arg(long)]
    pub limit: Option<usize>,

    /// Directory for the images (defaults to `BLESNAP_OUTPUT_DIR`)
    #[arg(long)]
    pub out: Option<PathBuf>,
}

/// Arguments of `inspect`
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Capture file (`capture_<ts>.bin`)
    pub capture: PathBuf,
}

/// Arguments of `simulate`
#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Image width in pixels
    #[arg(long, default_value_t = 320)]
    pub width: u16,

    /// Image height in pixels
    #[arg(long, default_value_t = 240)]
    pub height: u16,

    /// Payload size in bytes
    #[arg(long, default_value_t = 8192)]
    pub size: usize,

    /// ATT MTU that bounds the payload fragments
    #[arg(long, default_value_t = PREFERRED_MTU)]
    pub mtu: u16,

    /// Stray fragments sent before the header
    #[arg(long, default_value_t = 0)]
    pub stray: usize,

    /// Output capture file
    #[arg(long)]
    pub out: PathBuf,
}

/// Run a parsed command line
///
/// # Errors
///
/// Returns any failure of the selected command, with context.
pub fn execute(cli: Cli) -> Result<()> {
    let config = ReceiverConfig::from_env();
    match cli.command {
        Commands::Replay(args) => run_replay(&args, &config),
        Commands::Inspect(args) => run_inspect(&args),
        Commands::Simulate(args) => run_simulate(&args).map(|_| ()),
        Commands::Info => run_info(&config),
    }
}

fn run_replay(args: &ReplayArgs, config: &ReceiverConfig) -> Result<()> {
    if args.speed < 0.0 {
        bail!("--speed must not be negative");
    }
    if args.loop_playback && args.limit.is_none() {
        log::warn!("Looping without --limit, replay runs until interrupted");
    }

    let out_dir = args.out.clone().or_else(|| config.output_dir.clone());
    let replay_config = ReplayConfig {
        speed: args.speed,
        loop_playback: args.loop_playback,
    };

    let mut replay = FragmentReplay::load_with_config(&args.capture, replay_config)
        .with_context(|| format!("failed to load capture {}", args.capture.display()))?;

    let max_fragment_len = replay
        .metadata()
        .map(|m| m.mtu)
        .filter(|&mtu| mtu > 0)
        .map_or_else(|| config.max_fragment_len(), notify_payload_len);

    let receiver = replay.start()?;
    let mut received = 0usize;
    let mut rejected = 0usize;

    for image in receiver.iter() {
        received += 1;
        let result = validate_image(&image, config.validation, Some(max_fragment_len));
        if !result.valid {
            rejected += 1;
            log::warn!(
                "Image {} rejected: {}",
                received,
                result.failure_reason.as_deref().unwrap_or("unknown")
            );
        } else if let Some(dir) = &out_dir {
            let path = crate::dump_image(dir, &image, received as u64)
                .with_context(|| format!("failed to save image to {}", dir.display()))?;
            println!("{}", path.display());
        } else {
            println!(
                "image {}: {} {}x{}, {} bytes",
                received,
                image.format,
                image.width,
                image.height,
                image.len()
            );
        }

        if args.limit.is_some_and(|limit| received >= limit) {
            break;
        }
    }

    if replay.is_running() {
        replay.stop()?;
    }

    log::info!("Replay finished: {} images, {} rejected", received, rejected);
    Ok(())
}

fn run_inspect(args: &InspectArgs) -> Result<()> {
    let fragments = capture::read_fragments(&args.capture)
        .with_context(|| format!("failed to read capture {}", args.capture.display()))?;

    let mut reassembler = FrameReassembler::new();
    for (index, fragment) in fragments.iter().enumerate() {
        let summary = describe_event(&reassembler.submit(&fragment.data));
        println!(
            "{:>6} {:>10}us {:>5}B  {}",
            index, fragment.timestamp_us, fragment.data.len(), summary
        );
    }

    println!("state: {:?}", reassembler.state());
    println!("{}", serde_json::to_string_pretty(&reassembler.stats())?);
    Ok(())
}

/// One-line description of a reassembler outcome
pub fn describe_event(event: &FrameEvent) -> String {
    match event {
        FrameEvent::HeaderReceived(header) => format!(
            "header {} {}x{}, {} bytes",
            header.format, header.width, header.height, header.total_size
        ),
        FrameEvent::FragmentAccumulated { received, expected } => {
            format!("payload {}/{}", received, expected)
        }
        FrameEvent::ImageComplete(image) => format!(
            "complete {} bytes ({} advertised, {} overshoot)",
            image.len(),
            image.advertised_size,
            image.overshoot()
        ),
        FrameEvent::UnexpectedFragment { len } => format!("discarded {} bytes", len),
    }
}

fn run_simulate(args: &SimulateArgs) -> Result<PathBuf> {
    if u32::try_from(args.size).is_err() {
        bail!("--size must fit in 32 bits");
    }

    let generator = FragmentGenerator::for_mtu(args.mtu);
    let jpeg = FragmentGenerator::minimal_jpeg(args.width, args.height, args.size);

    let mut fragments = FragmentGenerator::stray_fragments(args.stray);
    fragments.extend(generator.image_fragments(args.width, args.height, &jpeg));
    let fragments = FragmentGenerator::timestamped(fragments, SIMULATED_INTERVAL_US);

    let metadata = CaptureMetadata {
        device_name: "simulated".to_string(),
        mtu: args.mtu,
        format_type: ImageFormat::Jpeg.to_string(),
        width: u32::from(args.width),
        height: u32::from(args.height),
        total_images: 1,
        duration_ms: fragments.last().map_or(0, |f| f.timestamp_us / 1000),
        description: format!("{} stray fragments before the header", args.stray),
        ..Default::default()
    };

    ensure_parent_dir(&args.out)?;
    let result = write_capture_file(&args.out, &fragments, metadata)
        .with_context(|| format!("failed to write {}", args.out.display()))?;

    println!("{}", result.fragments_path);
    Ok(args.out.clone())
}

fn run_info(config: &ReceiverConfig) -> Result<()> {
    let info = serde_json::json!({
        "build": crate::build_info(),
        "config": config,
    });
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}
