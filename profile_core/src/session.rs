/*!
Session lifecycle.

A [`Session`] owns the frame sources, their calibration and the storage for
one run. [`Session::start`] reads the calibration, builds the decoders and
spawns one acquisition thread per source plus the consumer thread. The
returned [`SessionHandle`] stops the run, reports counters while it is live
and joins the threads into a [`SessionSummary`].

Stopping follows a fixed order: acquisition stops pulling frames, queued
frames are decoded (or released when `drain_on_stop` is off), the partial
chunk is flushed and storage is closed. A recording that reaches its final
threshold ends the session the same way on its own.
*/

use crate::calibration::CalibrationParams;
use crate::chunk::ChunkAccumulator;
use crate::config::SessionConfig;
use crate::decoder::{DecodePolicy, FrameDecoder};
use crate::error::{PipelineError, Result};
use crate::frame::FrameLayout;
use crate::pipeline::{AcquisitionLoop, ConsumerLoop, ConsumerReport, Lane, SourceActivity};
use crate::protocol::CHANNEL_WIDTH;
use crate::queue::BufferQueue;
use crate::recording::{RecordingState, RecordingStateMachine};
use crate::source::{FrameSource, RawDumpWriter};
use crate::stats::{SessionStats, StatsSnapshot};
use crate::storage::{DatasetStore, StorageWriter};
use crate::sync::MultiSourceSynchronizer;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// Everything needed to run one acquisition
pub struct Session {
    config: SessionConfig,
    sources: Vec<Box<dyn FrameSource>>,
    store: Box<dyn DatasetStore>,
    root: Option<String>,
    raw_dump: Option<PathBuf>,
}

impl Session {
    pub fn new(config: SessionConfig, sources: Vec<Box<dyn FrameSource>>, store: Box<dyn DatasetStore>) -> Result<Self> {
        config.validate()?;
        if sources.is_empty() {
            return Err(PipelineError::config("a session needs at least one frame source"));
        }
        Ok(Self {
            config,
            sources,
            store,
            root: None,
            raw_dump: None,
        })
    }

    /// Write under this root group instead of a timestamped one
    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Record every acquired raw payload next to the datasets
    pub fn with_raw_dump(mut self, path: impl Into<PathBuf>) -> Self {
        self.raw_dump = Some(path.into());
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Read calibration, build the pipeline and spawn its threads
    pub fn start(self) -> Result<SessionHandle> {
        let Session {
            config,
            sources,
            store,
            root,
            raw_dump,
        } = self;
        let source_count = sources.len();

        let policy = DecodePolicy::from(&config);
        let mut lanes = Vec::with_capacity(source_count);
        let mut corrected_registers = Vec::new();
        for (index, source) in sources.iter().enumerate() {
            let layout = FrameLayout::from_payload_size(source.payload_size(), CHANNEL_WIDTH)?;
            let registers = source.calibration_registers()?;
            let calibration = CalibrationParams::from_registers(&registers, layout.footer_len())?;
            corrected_registers.extend(
                calibration
                    .corrected_registers
                    .iter()
                    .map(|name| format!("sensor{}/{}", index, name)),
            );
            let decoder = FrameDecoder::new(layout, calibration, policy)?;
            lanes.push(Lane::new(
                decoder,
                ChunkAccumulator::new(config.chunk_rows)?,
                RecordingStateMachine::new(config.threshold),
            ));
        }

        if !corrected_registers.is_empty() {
            warn!(
                "⚠️ Calibration registers out of range for their wire width, reinterpreted narrower: {}",
                corrected_registers.join(", ")
            );
        }

        let writer = match root {
            Some(root) => StorageWriter::with_root(store, root, source_count),
            None => StorageWriter::open(store, source_count)?,
        };
        let root = writer.root().to_string();

        let sync = if config.multi_device_sync && source_count > 1 {
            Some(MultiSourceSynchronizer::new(source_count)?)
        } else {
            None
        };

        let initial_state = RecordingStateMachine::new(config.threshold).state();
        let stats = Arc::new(SessionStats::new(initial_state));
        let running = Arc::new(AtomicBool::new(true));
        let activity = Arc::new(SourceActivity::new(source_count));

        let mut queues = Vec::with_capacity(source_count);
        let mut recycle_senders = Vec::with_capacity(source_count);
        let mut acquisition_loops = Vec::with_capacity(source_count);
        for (index, source) in sources.into_iter().enumerate() {
            let queue = Arc::new(BufferQueue::new(config.queue_capacity)?);
            let (recycle_tx, recycle_rx) = crossbeam_channel::unbounded();
            let mut acquisition = AcquisitionLoop::new(
                index,
                source,
                Arc::clone(&queue),
                recycle_rx,
                Arc::clone(&running),
                Arc::clone(&activity),
                Arc::clone(&stats),
                config.poll_interval(),
            );
            if let Some(path) = &raw_dump {
                let path = RawDumpWriter::path_for_source(path, index, source_count);
                acquisition = acquisition.with_raw_dump(RawDumpWriter::create(path)?);
            }
            queues.push(queue);
            recycle_senders.push(recycle_tx);
            acquisition_loops.push(acquisition);
        }

        let consumer = ConsumerLoop::new(
            lanes,
            queues,
            recycle_senders,
            writer,
            sync,
            Arc::clone(&running),
            Arc::clone(&activity),
            Arc::clone(&stats),
            config.poll_interval(),
            config.drain_on_stop,
        );

        info!(
            "🚀 Starting session '{}' with {} source(s), chunk {} rows, queue {} frames, threshold {:?}",
            root, source_count, config.chunk_rows, config.queue_capacity, config.threshold
        );

        let consumer = thread::Builder::new()
            .name("consumer".to_string())
            .spawn(move || consumer.run())?;

        let mut acquisition = Vec::with_capacity(source_count);
        for (index, acquisition_loop) in acquisition_loops.into_iter().enumerate() {
            let spawned = thread::Builder::new()
                .name(format!("acquisition-{}", index))
                .spawn(move || acquisition_loop.run());
            match spawned {
                Ok(handle) => acquisition.push(handle),
                Err(err) => {
                    // threads already running still have to wind down
                    running.store(false, Ordering::SeqCst);
                    (index..source_count).for_each(|unstarted| activity.finish(unstarted));
                    return Err(err.into());
                }
            }
        }

        Ok(SessionHandle {
            root,
            running,
            stats,
            acquisition,
            consumer,
            corrected_registers,
        })
    }
}

/// Control over a running session
pub struct SessionHandle {
    root: String,
    running: Arc<AtomicBool>,
    stats: Arc<SessionStats>,
    acquisition: Vec<JoinHandle<Result<u64>>>,
    consumer: JoinHandle<Result<ConsumerReport>>,
    corrected_registers: Vec<String>,
}

impl SessionHandle {
    /// Ask the session to stop; returns immediately
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("🛑 Stop requested for session '{}'", self.root);
        }
    }

    /// Flag that keeps the session alive, for wiring into signal handlers
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether every worker thread has exited
    pub fn is_finished(&self) -> bool {
        self.consumer.is_finished() && self.acquisition.iter().all(JoinHandle::is_finished)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Wait for all threads. Returns the summary, or the first fatal error.
    pub fn join(self) -> Result<SessionSummary> {
        let consumer = self
            .consumer
            .join()
            .map_err(|_| PipelineError::WorkerPanic("consumer"))
            .and_then(|result| result);

        let mut frames_per_source = Vec::with_capacity(self.acquisition.len());
        let mut acquisition_error = None;
        for handle in self.acquisition {
            match handle.join() {
                Ok(Ok(frames)) => frames_per_source.push(frames),
                Ok(Err(err)) => {
                    frames_per_source.push(0);
                    acquisition_error.get_or_insert(err);
                }
                Err(_) => {
                    frames_per_source.push(0);
                    acquisition_error.get_or_insert(PipelineError::WorkerPanic("acquisition"));
                }
            }
        }

        let report = match (consumer, acquisition_error) {
            (Err(err), _) | (Ok(_), Some(err)) => {
                error!("❌ Session '{}' failed: {}", self.root, err);
                return Err(err);
            }
            (Ok(report), None) => report,
        };

        let stats = self.stats.snapshot();
        stats.log_summary();
        Ok(SessionSummary {
            root: report.root,
            frames_per_source,
            chunks_flushed: report.chunks_flushed,
            rows_written: report.rows_written,
            final_state: report.final_state,
            sync_overruns: report.sync_overruns,
            corrected_registers: self.corrected_registers,
            stats,
        })
    }
}

/// Outcome of a finished session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    /// Root group the datasets were written under
    pub root: String,
    pub frames_per_source: Vec<u64>,
    pub chunks_flushed: u64,
    pub rows_written: u64,
    pub final_state: RecordingState,
    pub sync_overruns: Vec<u64>,
    /// Calibration registers that needed narrowing, as `sensorN/register`
    pub corrected_registers: Vec<String>,
    pub stats: StatsSnapshot,
}
