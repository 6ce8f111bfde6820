// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand, ValueEnum};
use media_capture::media::BackgroundMode;
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "media-capture")]
#[command(about = "Camera capture with background blur and replacement")]
#[command(version = env!("GIT_VERSION"))]
struct Cli {
    /// Config file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Device id (from 'media-capture devices')
    #[arg(short, long, global = true)]
    device: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Requested capture settings shared by the commands
///
/// Unset values come from the request remembered for the device.
#[derive(clap::Args, Clone, Copy)]
struct RequestArgs {
    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    #[arg(long)]
    fps: Option<u32>,

    /// Background treatment
    #[arg(short, long, value_enum)]
    background: Option<BackgroundArg>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BackgroundArg {
    None,
    Blur,
    Virtual,
}

impl From<BackgroundArg> for BackgroundMode {
    fn from(arg: BackgroundArg) -> Self {
        match arg {
            BackgroundArg::None => BackgroundMode::None,
            BackgroundArg::Blur => BackgroundMode::Blur,
            BackgroundArg::Virtual => BackgroundMode::VirtualBackground,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List capture devices and how their modes rank for a request
    Devices {
        #[command(flatten)]
        request: RequestArgs,
    },

    /// Capture frames and print statistics
    Run {
        #[command(flatten)]
        request: RequestArgs,

        /// Virtual background image
        #[arg(long)]
        image: Option<PathBuf>,

        /// Capture duration in seconds
        #[arg(long, default_value = "5")]
        duration: u64,
    },

    /// Save one (processed) frame as PNG
    Snapshot {
        #[command(flatten)]
        request: RequestArgs,

        /// Virtual background image
        #[arg(long)]
        image: Option<PathBuf>,

        /// Output file path (default: ~/Pictures/media-capture/snapshot_TIMESTAMP.png)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set RUST_LOG to control log level, e.g. RUST_LOG=media_capture=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    let ctx = cli::Context::load(cli.config, cli.device)?;

    match cli.command {
        Commands::Devices { request } => cli::list_devices(&ctx, request.overrides()),
        Commands::Run {
            request,
            image,
            duration,
        } => cli::run_capture(ctx.with_background_image(image), request.overrides(), duration),
        Commands::Snapshot {
            request,
            image,
            output,
        } => cli::take_snapshot(ctx.with_background_image(image), request.overrides(), output),
    }
}

impl RequestArgs {
    fn overrides(self) -> cli::RequestOverrides {
        cli::RequestOverrides {
            width: self.width,
            height: self.height,
            frame_rate: self.fps,
            background_mode: self.background.map(BackgroundMode::from),
        }
    }
}
