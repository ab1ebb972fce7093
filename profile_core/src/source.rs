/*!
Frame sources.

A frame source owns the physical buffers: it hands out one filled buffer at a
time and gets it back once the pipeline is done with it. Two sources ship
with the crate so the pipeline runs without a camera: a synthetic generator
of an object passing through the laser line, and a replay of raw dumps.
*/

use crate::calibration::{CalibrationParams, CalibrationRegisters};
use crate::error::{PipelineError, Result};
use crate::frame::{FooterData, FrameLayout, RawFrame};
use crate::protocol::{CHANNEL_WIDTH, DEFAULT_PAYLOAD_SIZE};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Contract between the pipeline and the hardware (or its stand-in)
pub trait FrameSource: Send {
    /// Size in bytes of every payload this source delivers
    fn payload_size(&self) -> usize;

    /// Calibration registers as the driver reports them
    fn calibration_registers(&self) -> Result<CalibrationRegisters>;

    /// Begin acquisition
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// End acquisition
    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    /// Next filled buffer, or `None` if no frame is ready yet
    fn acquire_if_available(&mut self) -> Result<Option<RawFrame>>;

    /// Return a buffer for reuse
    fn release(&mut self, frame: RawFrame);

    /// Whether the source will never deliver another frame
    fn is_exhausted(&self) -> bool {
        false
    }
}

/// Fixed set of buffer slots; acquisition stalls while all are handed out
#[derive(Debug)]
struct BufferPool {
    free: Vec<usize>,
    size: usize,
}

impl BufferPool {
    fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(PipelineError::config("buffer pool needs at least one slot"));
        }
        Ok(Self {
            free: (0..size).rev().collect(),
            size,
        })
    }

    fn take(&mut self) -> Option<usize> {
        self.free.pop()
    }

    fn give_back(&mut self, slot: usize) {
        if slot >= self.size || self.free.contains(&slot) {
            warn!("Released buffer slot {} that is not handed out", slot);
            return;
        }
        self.free.push(slot);
    }

    fn outstanding(&self) -> usize {
        self.size - self.free.len()
    }
}

/// Shape of the generated distance channel over time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyntheticProfile {
    /// Background interrupted periodically by a closer object
    PassingObject {
        /// Raw distance of the background
        background: i16,
        /// Raw distance on top of the object
        object: i16,
        /// Background frames before the object enters
        lead_frames: u64,
        /// Frames the object stays in view
        object_frames: u64,
    },
    /// One constant raw distance per frame, then the source is exhausted
    Scripted(Vec<i16>),
}

impl Default for SyntheticProfile {
    fn default() -> Self {
        // -40 / -20 after the default calibration
        Self::PassingObject {
            background: 1000,
            object: 3000,
            lead_frames: 50,
            object_frames: 200,
        }
    }
}

impl SyntheticProfile {
    fn level(&self, index: u64) -> Option<i16> {
        match self {
            Self::PassingObject {
                background,
                object,
                lead_frames,
                object_frames,
            } => {
                let period = (lead_frames + object_frames).max(1);
                let phase = index % period;
                Some(if phase >= *lead_frames { *object } else { *background })
            }
            Self::Scripted(levels) => levels.get(index as usize).copied(),
        }
    }
}

/// Settings of the synthetic generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Frames per second; 0 delivers as fast as buffers are free
    pub frame_rate_hz: f64,
    pub pool_size: usize,
    /// Stop after this many frames
    pub max_frames: Option<u64>,
    pub bus_id: u16,
    /// Every n-th column carries the invalid sentinel; 0 disables
    pub invalid_every: usize,
    /// Report rational registers the way a 64-bit getter returns 32-bit ones
    pub wide_registers: bool,
    pub profile: SyntheticProfile,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            frame_rate_hz: 200.0,
            pool_size: 16,
            max_frames: None,
            bus_id: 0,
            invalid_every: 97,
            wide_registers: false,
            profile: SyntheticProfile::default(),
        }
    }
}

/// Deterministic generator of raw frames
#[derive(Debug)]
pub struct SyntheticSource {
    config: SyntheticConfig,
    registers: CalibrationRegisters,
    layout: FrameLayout,
    calibration: CalibrationParams,
    pool: BufferPool,
    produced: u64,
    next_due: Option<Instant>,
    running: bool,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Result<Self> {
        Self::with_registers(config, CalibrationRegisters::default())
    }

    pub fn with_registers(config: SyntheticConfig, registers: CalibrationRegisters) -> Result<Self> {
        let layout = FrameLayout::from_payload_size(DEFAULT_PAYLOAD_SIZE, CHANNEL_WIDTH)?;
        let calibration = CalibrationParams::from_registers(&registers, layout.footer_len())?;
        Ok(Self {
            pool: BufferPool::new(config.pool_size)?,
            config,
            registers,
            layout,
            calibration,
            produced: 0,
            next_due: None,
            running: false,
        })
    }

    /// Source that emits one frame per scripted raw distance, unpaced
    pub fn scripted(levels: Vec<i16>) -> Result<Self> {
        Self::new(SyntheticConfig {
            frame_rate_hz: 0.0,
            invalid_every: 0,
            profile: SyntheticProfile::Scripted(levels),
            ..SyntheticConfig::default()
        })
    }

    /// Frames generated so far
    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// Buffers currently handed out
    pub fn outstanding(&self) -> usize {
        self.pool.outstanding()
    }

    fn frame_interval(&self) -> Option<Duration> {
        (self.config.frame_rate_hz > 0.0).then(|| Duration::from_secs_f64(1.0 / self.config.frame_rate_hz))
    }

    fn generate(&self, index: u64, level: i16) -> Result<Vec<u8>> {
        let width = self.layout.width;
        let invalid = self.calibration.invalid;
        let c: Vec<i16> = (0..width)
            .map(|col| {
                if self.config.invalid_every > 0 && col % self.config.invalid_every == 0 {
                    invalid
                } else {
                    level
                }
            })
            .collect();
        // lateral position sweeps across the line, intensity rises towards the centre
        let a: Vec<i16> = (0..width).map(|col| col as i16).collect();
        let intensity: Vec<i16> = (0..width)
            .map(|col| {
                let distance = (col as i64 - width as i64 / 2).unsigned_abs() as i64;
                (1000 - distance * 1000 / width as i64) as i16
            })
            .collect();

        let ticks_per_frame = match self.config.frame_rate_hz {
            rate if rate > 0.0 => (self.calibration.tick_frequency_hz as f64 / rate) as u64,
            _ => 1000,
        };
        let footer = FooterData {
            tick: index * ticks_per_frame,
            trigger_id: 0,
            bus_id: self.config.bus_id,
            event_number: index as u32,
            frame_counter: index as u16,
            encoder_position: index as u32 * 4,
            exposure_duration: ticks_per_frame / 2,
            gate_number: 0,
        }
        .encode(&self.calibration.footer, self.layout.footer_len())?;

        self.layout.encode(&c, &a, &intensity, &footer)
    }
}

impl FrameSource for SyntheticSource {
    fn payload_size(&self) -> usize {
        self.layout.payload_size
    }

    fn calibration_registers(&self) -> Result<CalibrationRegisters> {
        let mut registers = self.registers.clone();
        if self.config.wide_registers {
            for value in [
                &mut registers.c_offset_numerator,
                &mut registers.a_offset_numerator,
            ] {
                *value = *value as i32 as u32 as i64;
            }
        }
        Ok(registers)
    }

    fn start(&mut self) -> Result<()> {
        info!(
            "🧪 Starting synthetic source (bus {}, {} fps, {} buffers)",
            self.config.bus_id, self.config.frame_rate_hz, self.config.pool_size
        );
        self.running = true;
        self.next_due = Some(Instant::now());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.running {
            info!("🧪 Synthetic source stopped after {} frames", self.produced);
        }
        self.running = false;
        Ok(())
    }

    fn acquire_if_available(&mut self) -> Result<Option<RawFrame>> {
        if !self.running || self.is_exhausted() {
            return Ok(None);
        }
        let Some(level) = self.config.profile.level(self.produced) else {
            return Ok(None);
        };

        if let (Some(interval), Some(due)) = (self.frame_interval(), self.next_due) {
            let now = Instant::now();
            if now < due {
                return Ok(None);
            }
            // keep the nominal rate, but never queue up a burst after a stall
            self.next_due = Some((due + interval).max(now));
        }

        let Some(slot) = self.pool.take() else {
            return Ok(None);
        };
        let data = match self.generate(self.produced, level) {
            Ok(data) => data,
            Err(err) => {
                self.pool.give_back(slot);
                return Err(err);
            }
        };
        self.produced += 1;
        Ok(Some(RawFrame::new(slot, data)))
    }

    fn release(&mut self, frame: RawFrame) {
        self.pool.give_back(frame.slot);
    }

    fn is_exhausted(&self) -> bool {
        if self.config.max_frames.is_some_and(|max| self.produced >= max) {
            return true;
        }
        match &self.config.profile {
            SyntheticProfile::Scripted(levels) => self.produced as usize >= levels.len(),
            SyntheticProfile::PassingObject { .. } => false,
        }
    }
}

/// Replays a file of concatenated raw payloads once
#[derive(Debug)]
pub struct ReplaySource {
    path: PathBuf,
    reader: BufReader<File>,
    payload_size: usize,
    registers: CalibrationRegisters,
    pool: BufferPool,
    replayed: u64,
    exhausted: bool,
}

impl ReplaySource {
    pub fn open(path: impl AsRef<Path>, payload_size: usize, registers: CalibrationRegisters) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .map_err(|e| PipelineError::source(format!("cannot open replay file {}: {}", path.display(), e)))?;
        if payload_size == 0 {
            return Err(PipelineError::config("replay payload size must be positive"));
        }
        Ok(Self {
            path,
            reader: BufReader::new(file),
            payload_size,
            registers,
            pool: BufferPool::new(16)?,
            replayed: 0,
            exhausted: false,
        })
    }

    pub fn replayed(&self) -> u64 {
        self.replayed
    }

    /// Fill `buf` as far as the file allows; returns the number of bytes read
    fn read_payload(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }
}

impl FrameSource for ReplaySource {
    fn payload_size(&self) -> usize {
        self.payload_size
    }

    fn calibration_registers(&self) -> Result<CalibrationRegisters> {
        Ok(self.registers.clone())
    }

    fn start(&mut self) -> Result<()> {
        info!("📂 Replaying raw frames from {}", self.path.display());
        Ok(())
    }

    fn acquire_if_available(&mut self) -> Result<Option<RawFrame>> {
        if self.exhausted {
            return Ok(None);
        }
        let Some(slot) = self.pool.take() else {
            return Ok(None);
        };

        let mut data = vec![0u8; self.payload_size];
        let read = match self.read_payload(&mut data) {
            Ok(read) => read,
            Err(err) => {
                self.pool.give_back(slot);
                return Err(err);
            }
        };
        if read == 0 {
            self.exhausted = true;
            self.pool.give_back(slot);
            info!("📂 Replay finished after {} frames", self.replayed);
            return Ok(None);
        }
        if read < self.payload_size {
            warn!(
                "⚠️ Trailing partial frame in {}: {} of {} bytes",
                self.path.display(),
                read,
                self.payload_size
            );
            data.truncate(read);
            self.exhausted = true;
        }
        self.replayed += 1;
        debug!("Replayed frame {} ({} bytes)", self.replayed, data.len());
        Ok(Some(RawFrame::new(slot, data)))
    }

    fn release(&mut self, frame: RawFrame) {
        self.pool.give_back(frame.slot);
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

/// Records raw payloads back to back, in the format [`ReplaySource`] reads
#[derive(Debug)]
pub struct RawDumpWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    frames: u64,
    bytes: u64,
}

impl RawDumpWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        info!("📝 Recording raw frames to {}", path.display());
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            frames: 0,
            bytes: 0,
        })
    }

    /// Dump file of `source` when `sources` sensors record at once
    pub fn path_for_source(path: &Path, source: usize, sources: usize) -> PathBuf {
        if sources <= 1 {
            return path.to_path_buf();
        }
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("raw");
        let name = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}-sensor{}.{}", stem, source, ext),
            None => format!("{}-sensor{}", stem, source),
        };
        path.with_file_name(name)
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.frames += 1;
        self.bytes += data.len() as u64;
        Ok(())
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Flush and close the dump; returns the number of frames written
    pub fn finish(mut self) -> Result<u64> {
        self.writer.flush()?;
        info!(
            "📝 Raw dump {} complete: {} frames, {:.1} MB",
            self.path.display(),
            self.frames,
            self.bytes as f64 / 1_000_000.0
        );
        Ok(self.frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{DecodePolicy, FrameDecoder};
    use tempfile::NamedTempFile;

    fn decoder_for(source: &dyn FrameSource) -> FrameDecoder {
        let layout = FrameLayout::from_payload_size(source.payload_size(), CHANNEL_WIDTH).unwrap();
        let registers = source.calibration_registers().unwrap();
        let calibration = CalibrationParams::from_registers(&registers, layout.footer_len()).unwrap();
        FrameDecoder::new(layout, calibration, DecodePolicy::default()).unwrap()
    }

    #[test]
    fn test_scripted_frames_decode() {
        let mut source = SyntheticSource::scripted(vec![2000, 1000]).unwrap();
        let decoder = decoder_for(&source);
        source.start().unwrap();

        let first = source.acquire_if_available().unwrap().unwrap();
        let frame = decoder.decode(&first.data).unwrap();
        assert!((frame.mean_c() + 30.0).abs() < 1e-4);
        assert_eq!(frame.footer.event_number, 0);
        source.release(first);

        let second = source.acquire_if_available().unwrap().unwrap();
        let frame = decoder.decode(&second.data).unwrap();
        assert!((frame.mean_c() + 40.0).abs() < 1e-4);
        assert_eq!(frame.footer.frame_counter, 1);

        assert!(source.is_exhausted());
        assert!(source.acquire_if_available().unwrap().is_none());
    }

    #[test]
    fn test_pool_exhaustion_stalls_acquisition() {
        let mut source = SyntheticSource::new(SyntheticConfig {
            frame_rate_hz: 0.0,
            pool_size: 2,
            ..SyntheticConfig::default()
        })
        .unwrap();
        source.start().unwrap();

        let a = source.acquire_if_available().unwrap().unwrap();
        let b = source.acquire_if_available().unwrap().unwrap();
        assert_ne!(a.slot, b.slot);
        assert!(source.acquire_if_available().unwrap().is_none());
        assert_eq!(source.outstanding(), 2);

        source.release(a);
        assert!(source.acquire_if_available().unwrap().is_some());
    }

    #[test]
    fn test_no_frames_before_start() {
        let mut source = SyntheticSource::scripted(vec![1]).unwrap();
        assert!(source.acquire_if_available().unwrap().is_none());
    }

    #[test]
    fn test_invalid_columns_and_max_frames() {
        let mut source = SyntheticSource::new(SyntheticConfig {
            frame_rate_hz: 0.0,
            invalid_every: 100,
            max_frames: Some(1),
            ..SyntheticConfig::default()
        })
        .unwrap();
        let decoder = decoder_for(&source);
        source.start().unwrap();

        let raw = source.acquire_if_available().unwrap().unwrap();
        let frame = decoder.decode(&raw.data).unwrap();
        assert!(frame.c[0].is_nan());
        assert!(frame.a[100].is_nan());
        assert!(!frame.c[1].is_nan());
        assert!(source.is_exhausted());
    }

    #[test]
    fn test_wide_registers_are_corrected() {
        let source = SyntheticSource::new(SyntheticConfig {
            wide_registers: true,
            ..SyntheticConfig::default()
        })
        .unwrap();
        let registers = source.calibration_registers().unwrap();
        assert!(registers.c_offset_numerator > i32::MAX as i64);

        let decoder = decoder_for(&source);
        assert_eq!(decoder.calibration().c_offset.numerator, -50);
        assert!(decoder.calibration().was_corrected());
    }

    #[test]
    fn test_dump_and_replay() {
        let file = NamedTempFile::new().unwrap();
        let mut source = SyntheticSource::scripted(vec![1500, 2500, 3500]).unwrap();
        source.start().unwrap();

        let mut dump = RawDumpWriter::create(file.path()).unwrap();
        while let Some(frame) = source.acquire_if_available().unwrap() {
            dump.write(&frame.data).unwrap();
            source.release(frame);
        }
        assert_eq!(dump.finish().unwrap(), 3);

        let mut replay =
            ReplaySource::open(file.path(), DEFAULT_PAYLOAD_SIZE, CalibrationRegisters::default()).unwrap();
        let decoder = decoder_for(&replay);
        replay.start().unwrap();
        let mut means = Vec::new();
        while let Some(frame) = replay.acquire_if_available().unwrap() {
            means.push(decoder.decode(&frame.data).unwrap().mean_c());
            replay.release(frame);
        }
        assert!(replay.is_exhausted());
        assert_eq!(means.len(), 3);
        assert!((means[2] + 15.0).abs() < 1e-4);
    }

    #[test]
    fn test_partial_trailing_frame_is_delivered_short() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; DEFAULT_PAYLOAD_SIZE + 10]).unwrap();
        file.flush().unwrap();

        let mut replay =
            ReplaySource::open(file.path(), DEFAULT_PAYLOAD_SIZE, CalibrationRegisters::default()).unwrap();
        assert_eq!(replay.acquire_if_available().unwrap().unwrap().len(), DEFAULT_PAYLOAD_SIZE);
        assert_eq!(replay.acquire_if_available().unwrap().unwrap().len(), 10);
        assert!(replay.is_exhausted());
        assert_eq!(replay.replayed(), 2);
    }

    #[test]
    fn test_dump_path_per_source() {
        let path = Path::new("/tmp/raw.bin");
        assert_eq!(RawDumpWriter::path_for_source(path, 0, 1), PathBuf::from("/tmp/raw.bin"));
        assert_eq!(
            RawDumpWriter::path_for_source(path, 1, 2),
            PathBuf::from("/tmp/raw-sensor1.bin")
        );
    }
}
