/*!
Profile capture driver.

Builds the frame sources and dataset store described by the configuration,
runs one [`Session`] and reports its counters until it ends, either on its
own (final threshold crossing, exhausted sources) or through Ctrl+C.
*/

use crate::config::{AppConfig, SourceConfig, SourceKind};
use anyhow::{bail, Context, Result};
use crossbeam_channel::{select, tick};
use profile_core::protocol::CHANNEL_WIDTH;
use profile_core::{
    CalibrationParams, DatasetStore, DecodePolicy, DecodedFrame, FrameDecoder, FrameLayout, FrameSource, MemoryStore,
    RawDumpWriter, ReplaySource, Session, SessionSummary, SyntheticSource,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Per-run switches that are not part of the configuration file
#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
    /// Keep datasets in memory instead of writing a file
    pub dry_run: bool,
    /// Also record every raw payload to this file
    pub raw_dump: Option<PathBuf>,
}

/// One capture run from configuration to summary
pub struct ProfileCapture {
    config: AppConfig,
    options: CaptureOptions,
    running: Arc<AtomicBool>,
}

impl ProfileCapture {
    pub fn new(config: AppConfig, options: CaptureOptions) -> Self {
        Self {
            config,
            options,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Get the running flag for external control
    pub fn get_running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Run the session to completion
    pub fn start(&self) -> Result<SessionSummary> {
        let sources = build_sources(&self.config.source)?;
        let store = build_store(&self.config, self.options.dry_run)?;

        let mut session = Session::new(self.config.session.clone(), sources, store)?;
        if let Some(path) = &self.options.raw_dump {
            session = session.with_raw_dump(path.clone());
        }

        let handle = session.start().context("Failed to start capture session")?;
        info!("🚀 Capture session '{}' started", handle.root());

        let interval = Duration::from_secs(self.config.reporting.stats_interval_seconds.max(1));
        let report = tick(interval);
        let poll = tick(SHUTDOWN_POLL);
        loop {
            select! {
                recv(report) -> _ => {
                    let snapshot = handle.stats();
                    info!("📊 {}", serde_json::to_string(&snapshot)?);
                }
                recv(poll) -> _ => {
                    if !self.running.load(Ordering::SeqCst) {
                        handle.stop();
                    }
                    if handle.is_finished() {
                        break;
                    }
                }
            }
        }

        Ok(handle.join()?)
    }
}

/// Instantiate one source per configured sensor
pub fn build_sources(config: &SourceConfig) -> Result<Vec<Box<dyn FrameSource>>> {
    if config.sensors == 0 {
        bail!("At least one sensor is required");
    }

    let mut sources: Vec<Box<dyn FrameSource>> = Vec::with_capacity(config.sensors);
    match config.kind {
        SourceKind::Synthetic => {
            for sensor in 0..config.sensors {
                let mut synthetic = config.synthetic.clone();
                synthetic.bus_id = synthetic.bus_id.wrapping_add(sensor as u16);
                let source = SyntheticSource::with_registers(synthetic, config.registers.clone())
                    .with_context(|| format!("Failed to create synthetic sensor {}", sensor))?;
                sources.push(Box::new(source));
            }
            info!("🧪 Generating synthetic profiles for {} sensor(s)", config.sensors);
        }
        SourceKind::Replay => {
            let Some(path) = &config.replay_path else {
                bail!("Replay source needs a replay_path");
            };
            for sensor in 0..config.sensors {
                let file = RawDumpWriter::path_for_source(path, sensor, config.sensors);
                let source = ReplaySource::open(&file, config.payload_size, config.registers.clone())
                    .with_context(|| format!("Failed to open replay file {}", file.display()))?;
                info!("📼 Replaying {}", file.display());
                sources.push(Box::new(source));
            }
        }
    }
    Ok(sources)
}

/// Pick the dataset store for this run
pub fn build_store(config: &AppConfig, dry_run: bool) -> Result<Box<dyn DatasetStore>> {
    if dry_run {
        info!("📺 Dry run: datasets are kept in memory");
        return Ok(Box::new(MemoryStore::new()));
    }
    open_file_store(config)
}

#[cfg(feature = "storage_hdf5")]
fn open_file_store(config: &AppConfig) -> Result<Box<dyn DatasetStore>> {
    let store = profile_core::Hdf5Store::open(&config.session.storage_path, config.session.chunk_rows)
        .with_context(|| format!("Failed to open {}", config.session.storage_path.display()))?;
    info!("💾 Output file: {}", config.session.storage_path.display());
    Ok(Box::new(store))
}

#[cfg(not(feature = "storage_hdf5"))]
fn open_file_store(config: &AppConfig) -> Result<Box<dyn DatasetStore>> {
    bail!(
        "Cannot write {}: built without the storage_hdf5 feature (use --dry-run or rebuild with --features storage_hdf5)",
        config.session.storage_path.display()
    )
}

/// Decode the first frame of a raw dump with the configured calibration
pub fn decode_first_frame(config: &AppConfig, path: &Path) -> Result<DecodedFrame> {
    let registers = &config.source.registers;
    let mut source = ReplaySource::open(path, config.source.payload_size, registers.clone())
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let Some(frame) = source.acquire_if_available()? else {
        bail!("{} holds no frames", path.display());
    };

    let layout = FrameLayout::from_payload_size(config.source.payload_size, CHANNEL_WIDTH)?;
    let calibration = CalibrationParams::from_registers(registers, layout.footer_len())?;
    if calibration.was_corrected() {
        warn!(
            "⚠️ Calibration registers reinterpreted narrower: {}",
            calibration.corrected_registers.join(", ")
        );
    }
    let decoder = FrameDecoder::new(layout, calibration, DecodePolicy::from(&config.session))?;
    let decoded = decoder
        .decode(&frame.data)
        .with_context(|| format!("First frame of {} does not decode", path.display()))?;
    source.release(frame);
    Ok(decoded)
}
