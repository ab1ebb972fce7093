/*!
Lock-free run counters, readable from any thread while a session runs.
*/

use crate::recording::RecordingState;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Instant;
use tracing::info;

/// Counters shared by the acquisition and consumer threads
#[derive(Debug)]
pub struct SessionStats {
    started: Instant,
    frames_acquired: AtomicU64,
    frames_decoded: AtomicU64,
    decode_errors: AtomicU64,
    frames_admitted: AtomicU64,
    frames_skipped: AtomicU64,
    chunks_flushed: AtomicU64,
    rows_written: AtomicU64,
    queue_overruns: AtomicU64,
    sync_overruns: AtomicU64,
    event_mismatches: AtomicU64,
    empty_polls: AtomicU64,
    state: AtomicU8,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new(RecordingState::Inactive)
    }
}

impl SessionStats {
    pub fn new(state: RecordingState) -> Self {
        Self {
            started: Instant::now(),
            frames_acquired: AtomicU64::new(0),
            frames_decoded: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            frames_admitted: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            chunks_flushed: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            queue_overruns: AtomicU64::new(0),
            sync_overruns: AtomicU64::new(0),
            event_mismatches: AtomicU64::new(0),
            empty_polls: AtomicU64::new(0),
            state: AtomicU8::new(state as u8),
        }
    }

    pub fn record_acquired(&self) {
        self.frames_acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admitted(&self) {
        self.frames_admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.frames_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, rows: usize) {
        self.chunks_flushed.fetch_add(1, Ordering::Relaxed);
        self.rows_written.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn record_queue_overrun(&self) {
        self.queue_overruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_overrun(&self) {
        self.sync_overruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_mismatch(&self) {
        self.event_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty_poll(&self) {
        self.empty_polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_state(&self, state: RecordingState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn state(&self) -> RecordingState {
        RecordingState::from_u8(self.state.load(Ordering::Relaxed)).unwrap_or(RecordingState::Inactive)
    }

    pub fn frames_acquired(&self) -> u64 {
        self.frames_acquired.load(Ordering::Relaxed)
    }

    pub fn frames_admitted(&self) -> u64 {
        self.frames_admitted.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        let elapsed = self.started.elapsed().as_secs_f64();
        let frames_acquired = self.frames_acquired.load(Ordering::Relaxed);
        StatsSnapshot {
            elapsed_seconds: elapsed,
            frames_acquired,
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            frames_admitted: self.frames_admitted.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            chunks_flushed: self.chunks_flushed.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            queue_overruns: self.queue_overruns.load(Ordering::Relaxed),
            sync_overruns: self.sync_overruns.load(Ordering::Relaxed),
            event_mismatches: self.event_mismatches.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
            acquisition_fps: if elapsed > 0.0 {
                frames_acquired as f64 / elapsed
            } else {
                0.0
            },
            state: self.state(),
        }
    }
}

/// Serializable copy of [`SessionStats`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub elapsed_seconds: f64,
    pub frames_acquired: u64,
    pub frames_decoded: u64,
    pub decode_errors: u64,
    pub frames_admitted: u64,
    pub frames_skipped: u64,
    pub chunks_flushed: u64,
    pub rows_written: u64,
    pub queue_overruns: u64,
    pub sync_overruns: u64,
    pub event_mismatches: u64,
    pub empty_polls: u64,
    pub acquisition_fps: f64,
    pub state: RecordingState,
}

impl StatsSnapshot {
    /// Log the final statistics of a run
    pub fn log_summary(&self) {
        info!("📊 Session final stats:");
        info!("   Frames acquired: {}", self.frames_acquired);
        info!("   Frames decoded: {}", self.frames_decoded);
        info!("   Decode errors: {}", self.decode_errors);
        info!("   Frames recorded: {}", self.frames_admitted);
        info!("   Chunks flushed: {} ({} rows)", self.chunks_flushed, self.rows_written);
        info!("   Queue overruns: {}", self.queue_overruns);
        info!("   Sync overruns: {}", self.sync_overruns);
        info!("   Event mismatches: {}", self.event_mismatches);
        info!("   Final state: {:?}", self.state);
        info!("   Duration: {:.1}s ({:.1} fps)", self.elapsed_seconds, self.acquisition_fps);
    }
}
