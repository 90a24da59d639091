use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{CaptureMode, MirrorConfig, PresentModePreference};
use crate::geometry::Layout;
use crate::linux::StopKey;

#[derive(Parser)]
#[command(name = "winmirror")]
#[command(about = "Mirror live X11 windows onto a Vulkan swapchain")]
#[command(version)]
pub struct Cli {
    /// X11 display to connect to, defaults to $DISPLAY
    #[arg(long, global = true)]
    pub display: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List top-level windows
    List,

    /// Mirror windows onto the composite overlay
    Run(RunArgs),

    /// Save a single window snapshot as PNG
    Snapshot {
        /// Window ID (decimal or 0x-prefixed hex)
        #[arg(long, value_parser = parse_window_id)]
        window: u32,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(clap::Args)]
pub struct RunArgs {
    /// Window ID to mirror (decimal or 0x-prefixed hex), repeatable
    #[arg(long = "window", value_parser = parse_window_id, required_unless_present = "classes")]
    pub windows: Vec<u32>,

    /// Mirror every window with this WM_CLASS, repeatable
    #[arg(long = "class")]
    pub classes: Vec<String>,

    /// JSON config file, flags below override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Write the effective settings to this JSON file before starting
    #[arg(long)]
    pub save_config: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub capture: Option<CaptureMode>,

    #[arg(long, value_enum)]
    pub layout: Option<Layout>,

    #[arg(long, value_enum)]
    pub present_mode: Option<PresentModePreference>,

    /// Desired number of swapchain images
    #[arg(long)]
    pub images: Option<u32>,

    /// Surface extent polling interval in milliseconds
    #[arg(long, conflicts_with = "no_refresh")]
    pub refresh_ms: Option<u64>,

    /// Do not poll the surface extent
    #[arg(long)]
    pub no_refresh: bool,

    #[arg(long, value_enum)]
    pub stop_key: Option<StopKey>,
}

impl RunArgs {
    /// Apply command line overrides on top of a loaded config
    pub fn apply(&self, config: &mut MirrorConfig) {
        if let Some(capture) = self.capture {
            config.capture = capture;
        }
        if let Some(layout) = self.layout {
            config.layout = layout;
        }
        if let Some(present_mode) = self.present_mode {
            config.present_mode = present_mode;
        }
        if let Some(images) = self.images {
            config.image_count = images;
        }
        if self.no_refresh {
            config.refresh_interval_ms = None;
        } else if let Some(ms) = self.refresh_ms {
            config.refresh_interval_ms = Some(ms);
        }
        if let Some(stop_key) = self.stop_key {
            config.stop_key = stop_key;
        }
    }
}

pub fn parse_window_id(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid window id '{s}': {e}"))
}
