/*!
# Profile Core

Real-time data path for line-scan profile sensors: raw frames are pulled from a
frame source, handed through a bounded queue to a consumer thread, decoded into
physical coordinates, gated by an optional recording threshold and appended to
growing per-channel datasets.

## Core Types

- [`CalibrationParams`] - Per-session fixed-point transform constants
- [`FrameDecoder`] - Raw frame to [`DecodedFrame`] conversion
- [`BufferQueue`] - Bounded hand-off that evicts the oldest entry when full
- [`RecordingStateMachine`] - Threshold-driven admission of frames
- [`ChunkAccumulator`] - Row batching ahead of storage
- [`StorageWriter`] - Appends chunks to a [`DatasetStore`]
- [`MultiSourceSynchronizer`] - Slot-based alignment of N sources
- [`Session`] - Owns sources, worker threads and counters for one run

## Modules

- [`calibration`] - Calibration registers and their validation
- [`frame`] - Raw and decoded frame data structures
- [`decoder`] - Fixed-point transform and footer extraction
- [`queue`] - Bounded producer/consumer queue
- [`recording`] - Recording state machine
- [`chunk`] - Chunk accumulation
- [`storage`] - Dataset store trait, in-memory store and writer
- [`sync`] - Multi-source synchronization
- [`source`] - Frame source trait and the bundled sources
- [`pipeline`] - Acquisition and consumer loops
- [`session`] - Session lifecycle
- [`stats`] - Run counters
- [`config`] - Session configuration
- [`error`] - Common error types
*/

pub mod calibration;
pub mod chunk;
pub mod config;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod queue;
pub mod recording;
pub mod session;
pub mod source;
pub mod stats;
pub mod storage;
pub mod sync;

#[cfg(feature = "storage_hdf5")]
pub mod hdf5_store;

// Re-export commonly used types
pub use calibration::{CalibrationParams, CalibrationRegisters, FooterOffsets, Rational};
pub use chunk::{Chunk, ChunkAccumulator};
pub use config::{ColumnWindow, InvalidIntensity, SessionConfig};
pub use decoder::{DecodePolicy, FrameDecoder};
pub use error::{DecodeError, PipelineError, Result};
pub use frame::{DecodedFrame, FooterData, FrameLayout, RawFrame};
pub use queue::BufferQueue;
pub use recording::{Admission, RecordingState, RecordingStateMachine};
pub use session::{Session, SessionHandle, SessionSummary};
pub use source::{FrameSource, RawDumpWriter, ReplaySource, SyntheticConfig, SyntheticProfile, SyntheticSource};
pub use stats::{SessionStats, StatsSnapshot};
pub use storage::{Channel, DatasetStore, MemoryStore, StorageWriter};
pub use sync::MultiSourceSynchronizer;

#[cfg(feature = "storage_hdf5")]
pub use hdf5_store::Hdf5Store;

/// Version information for the core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire layout constants
pub mod protocol {
    /// Samples per channel in one profile
    pub const CHANNEL_WIDTH: usize = 2048;

    /// Size of one on-wire sample in bytes (int16)
    pub const SAMPLE_SIZE_BYTES: usize = 2;

    /// Number of per-column channels preceding the footer (C, A, intensity)
    pub const CHANNELS_PER_FRAME: usize = 3;

    /// Payload size reported by the sensor with all channels and the footer enabled
    pub const DEFAULT_PAYLOAD_SIZE: usize = 12352;

    /// Frames between two acquisition rate reports
    pub const RATE_REPORT_INTERVAL: u64 = 100;
}
