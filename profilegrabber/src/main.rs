/*!
# Profile Grabber Application

Line-scan profile capture: acquires raw frames from one or more profile
sensors, decodes them into calibrated distance, lateral and intensity
profiles, and appends them in chunks to growing per-channel datasets.

## Features

- Threshold-gated recording that starts and stops on the mean profile height
- Column windowing and invalid-sample marking
- Multi-sensor capture with optional tuple synchronization
- Raw payload dumps that can be replayed later
- Periodic JSON status reports and a final statistics summary

## Usage

### Synthetic capture into memory
```bash
profilegrabber capture --synthetic --dry-run --frames 1000
```

### Threshold-gated capture into an HDF5 file
```bash
profilegrabber capture --threshold -30 --roi 100:1900 --output scan.hdf5
```

### Replay a raw dump and show its first frame
```bash
profilegrabber capture --replay raw.bin --dry-run
profilegrabber inspect raw.bin
```
*/

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use profile_core::ColumnWindow;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing::info;

mod capture;
mod config;

use capture::{CaptureOptions, ProfileCapture};
use config::{AppConfig, SourceKind};

#[derive(Parser)]
#[command(name = "profilegrabber")]
#[command(about = "Line-scan profile capture into chunked per-channel datasets")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "profilegrabber.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Start profile capture
    Capture(CaptureArgs),

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "profilegrabber.toml")]
        output: PathBuf,
    },

    /// Decode the first frame of a raw dump and print it as JSON
    Inspect {
        /// Raw dump written by `capture --raw-dump`
        file: PathBuf,
    },
}

#[derive(clap::Args, Default)]
struct CaptureArgs {
    /// Generate synthetic frames
    #[arg(long, conflicts_with = "replay")]
    synthetic: bool,

    /// Replay a raw dump instead of a live source
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// Mean distance that starts and stops recording
    #[arg(long, allow_hyphen_values = true)]
    threshold: Option<f32>,

    /// Frames per storage append
    #[arg(long)]
    chunk_rows: Option<usize>,

    /// Frames buffered between acquisition and decoding
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Column window START:END kept from every profile
    #[arg(long, value_name = "START:END")]
    roi: Option<String>,

    /// Number of sensors recorded together
    #[arg(long)]
    sensors: Option<usize>,

    /// Output file for the datasets
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Keep datasets in memory instead of writing a file
    #[arg(long)]
    dry_run: bool,

    /// Stop each synthetic sensor after this many frames
    #[arg(long)]
    frames: Option<u64>,

    /// Record every raw payload to this file
    #[arg(long, value_name = "FILE")]
    raw_dump: Option<PathBuf>,
}

impl CaptureArgs {
    /// Apply command-line overrides on top of the file configuration
    fn apply(&self, config: &mut AppConfig) -> Result<()> {
        if self.synthetic {
            config.source.kind = SourceKind::Synthetic;
        }
        if let Some(path) = &self.replay {
            config.source.kind = SourceKind::Replay;
            config.source.replay_path = Some(path.clone());
        }
        if let Some(threshold) = self.threshold {
            config.session.threshold = Some(threshold);
        }
        if let Some(rows) = self.chunk_rows {
            config.session.chunk_rows = rows;
        }
        if let Some(capacity) = self.queue_capacity {
            config.session.queue_capacity = capacity;
        }
        if let Some(roi) = &self.roi {
            config.session.column_window = Some(ColumnWindow::parse(roi).with_context(|| format!("Invalid --roi {}", roi))?);
        }
        if let Some(sensors) = self.sensors {
            config.source.sensors = sensors;
        }
        if let Some(output) = &self.output {
            config.session.storage_path = output.clone();
        }
        if let Some(frames) = self.frames {
            config.source.synthetic.max_frames = Some(frames);
        }
        config.session.validate()?;
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays clean for `inspect` output
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    match cli.command {
        Some(Commands::Capture(args)) => run_capture(cli.config, args),
        Some(Commands::Config { output }) => generate_config_file(output),
        Some(Commands::Inspect { file }) => inspect(cli.config, file),
        None => run_capture(cli.config, CaptureArgs::default()),
    }
}

/// Run a capture session from the config file plus command-line overrides
fn run_capture(config_path: PathBuf, args: CaptureArgs) -> Result<()> {
    let mut config = AppConfig::load_or_default(&config_path)?;
    args.apply(&mut config)?;

    info!("🚀 Starting profile capture (config: {})", config_path.display());
    if let Some(threshold) = config.session.threshold {
        info!("🎯 Recording gated on mean distance {}", threshold);
    }

    let options = CaptureOptions {
        dry_run: args.dry_run,
        raw_dump: args.raw_dump,
    };
    let capture = ProfileCapture::new(config, options);

    // Set up Ctrl+C handler
    let running = capture.get_running_flag();
    ctrlc::set_handler(move || {
        eprintln!("\n🛑 Received Ctrl+C, shutting down gracefully...");
        running.store(false, Ordering::SeqCst);
    })?;

    let summary = capture.start()?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    info!("✅ Profile capture completed: {} rows under '{}'", summary.rows_written, summary.root);
    Ok(())
}

/// Print the first decoded frame of a raw dump
fn inspect(config_path: PathBuf, file: PathBuf) -> Result<()> {
    let config = AppConfig::load_or_default(&config_path)?;
    let frame = capture::decode_first_frame(&config, &file)?;
    println!("{}", serde_json::to_string_pretty(&frame)?);
    Ok(())
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<()> {
    let config = AppConfig::new();
    config.save_to_file(&output_path)?;

    println!("✅ Generated configuration file: {}", output_path.display());
    println!("📝 Edit the file to customize settings, then run:");
    println!("   profilegrabber --config {} capture", output_path.display());

    Ok(())
}
