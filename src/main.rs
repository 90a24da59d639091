mod cli;
mod config;
mod error;
mod geometry;
mod linux;
mod render;
mod snapshot;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Commands, RunArgs};
use config::{CaptureMode, MirrorConfig};
use geometry::Extent;
use indicatif::{ProgressBar, ProgressStyle};
use linux::{StopSignal, X11Session};
use render::{build_renderer, FrameStatus, GpuContext, PipelineSettings};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut x11 = X11Session::connect(cli.display.as_deref())
        .context("Failed to connect to the X server")?;

    match cli.command {
        Commands::List => list_windows(&x11)?,
        Commands::Snapshot { window, output } => snapshot::save_window(&x11, window, &output)?,
        Commands::Run(args) => run(&mut x11, &args)?,
    }

    Ok(())
}

fn list_windows(x11: &X11Session) -> Result<()> {
    let windows = x11.list_windows().context("Failed to list windows")?;
    if windows.is_empty() {
        println!("No windows found.");
        return Ok(());
    }

    println!("Available windows:");
    for w in windows {
        println!(
            "  [0x{id:x}] {class} - {name} ({width}x{height}){hidden}",
            id = w.id,
            class = if w.class.is_empty() { "(no class)" } else { &w.class },
            name = if w.name.is_empty() { "(untitled)" } else { &w.name },
            width = w.geometry.width,
            height = w.geometry.height,
            hidden = if w.viewable { "" } else { " (hidden)" },
        );
    }
    Ok(())
}

/// Window ids from `--window` followed by every match of `--class`, in
/// order and without duplicates
fn resolve_sources(x11: &X11Session, args: &RunArgs) -> Result<Vec<u32>> {
    let mut windows = args.windows.clone();
    for class in &args.classes {
        let found = x11
            .find_windows_by_class(class)
            .with_context(|| format!("Failed to search for class '{class}'"))?;
        if found.is_empty() {
            bail!("No window with class '{class}'");
        }
        windows.extend(found);
    }

    let mut seen = std::collections::HashSet::new();
    windows.retain(|id| seen.insert(*id));
    if windows.is_empty() {
        bail!("Must specify at least one --window or --class");
    }
    Ok(windows)
}

fn run(x11: &mut X11Session, args: &RunArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => MirrorConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => MirrorConfig::default(),
    };
    args.apply(&mut config);
    config.validate().context("Invalid settings")?;
    if let Some(path) = &args.save_config {
        config
            .save(path)
            .with_context(|| format!("Failed to save config {}", path.display()))?;
        log::info!("saved settings to {}", path.display());
    }

    let windows = resolve_sources(x11, args)?;
    let overlay = x11
        .overlay_window()
        .context("Failed to get the composite overlay window")?;
    let x11: &X11Session = x11;

    let gpu = GpuContext::new(x11, overlay, config.capture == CaptureMode::ZeroCopy)
        .context("Failed to initialise Vulkan")?;
    let screen = x11.screen();
    let fallback = Extent::new(
        u32::from(screen.width_in_pixels),
        u32::from(screen.height_in_pixels),
    );
    let settings = PipelineSettings::from_config(&config, fallback);
    let mut renderer = build_renderer(config.capture, x11, &gpu, &windows, &settings)
        .context("Failed to set up the mirror pipeline")?;

    // Set up Ctrl+C handler
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;
    let stop = StopSignal::new(x11.connection(), config.stop_key, interrupted)
        .context("Failed to read the keyboard mapping")?;

    println!(
        "Mirroring {} window(s) with {:?} capture",
        windows.len(),
        config.capture
    );
    println!("Press Ctrl+C or {:?} to stop...\n", config.stop_key);

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} Mirroring... {elapsed_precise} {msg}")?,
    );
    pb.enable_steady_tick(Duration::from_millis(100));

    // Only checked between full present cycles
    while !stop.should_stop(x11.connection()) {
        renderer.update()?;
        let status = renderer.draw().context("Frame failed")?;
        if status == FrameStatus::Deferred {
            // Destination is minimized, nothing to present
            std::thread::sleep(Duration::from_millis(50));
        }
        pb.set_message(format!("{} frames", renderer.frames_presented()));
    }

    pb.finish_with_message(format!("{} frames presented", renderer.frames_presented()));
    Ok(())
}
