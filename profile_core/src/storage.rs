/*!
Growing per-channel datasets.

Every session writes under its own root group named after the start time,
`dump-YYYY-MM-DDTHH:MM:SS`, so repeated runs into the same file never collide.
Each channel is a 2-D dataset that only grows along rows: `z` (distance),
`x` (lateral), `intensity` and the single-column `timestamp`. With more than
one sensor the channels are grouped per source as `sensor0/z`, `sensor1/z`...
*/

use crate::chunk::Chunk;
use crate::error::{PipelineError, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Element type of a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Dtype {
    F32,
    U16,
    F64,
}

/// Borrowed row-major rows for one append
#[derive(Debug, Clone, Copy)]
pub enum ColumnData<'a> {
    F32(&'a [f32]),
    U16(&'a [u16]),
    F64(&'a [f64]),
}

impl ColumnData<'_> {
    pub fn dtype(&self) -> Dtype {
        match self {
            Self::F32(_) => Dtype::F32,
            Self::U16(_) => Dtype::U16,
            Self::F64(_) => Dtype::F64,
        }
    }

    /// Number of scalar values
    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::U16(v) => v.len(),
            Self::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opaque reference to a dataset opened in a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DatasetHandle(pub usize);

/// Logical channels of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Z,
    X,
    Intensity,
    Timestamp,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Z, Channel::X, Channel::Intensity, Channel::Timestamp];

    /// Dataset name
    pub fn name(self) -> &'static str {
        match self {
            Self::Z => "z",
            Self::X => "x",
            Self::Intensity => "intensity",
            Self::Timestamp => "timestamp",
        }
    }

    pub fn dtype(self) -> Dtype {
        match self {
            Self::Z | Self::X => Dtype::F32,
            Self::Intensity => Dtype::U16,
            Self::Timestamp => Dtype::F64,
        }
    }

    fn columns(self, width: usize) -> usize {
        match self {
            Self::Timestamp => 1,
            _ => width,
        }
    }

    fn rows(self, chunk: &Chunk) -> ColumnData<'_> {
        match self {
            Self::Z => ColumnData::F32(chunk.c_rows()),
            Self::X => ColumnData::F32(chunk.a_rows()),
            Self::Intensity => ColumnData::U16(chunk.intensity_rows()),
            Self::Timestamp => ColumnData::F64(chunk.timestamp_rows()),
        }
    }
}

/// Backend holding append-only 2-D datasets
pub trait DatasetStore: Send {
    /// Open `root/channel`, creating it with `columns` columns if missing
    fn create_or_open(&mut self, root: &str, channel: &str, columns: usize, dtype: Dtype) -> Result<DatasetHandle>;

    /// Append whole rows (row-major, a multiple of the column count)
    fn append_rows(&mut self, handle: DatasetHandle, rows: ColumnData<'_>) -> Result<()>;

    fn row_count(&self, handle: DatasetHandle) -> Result<usize>;

    /// Shrink a dataset back to `rows` rows
    fn truncate(&mut self, handle: DatasetHandle, rows: usize) -> Result<()>;

    /// Whether a root group of this name already exists
    fn contains_root(&self, root: &str) -> Result<bool>;

    /// Release all handles
    fn close(&mut self) -> Result<()>;
}

/// Root group name for a session started at `now`, unique within `store`
pub fn root_name(store: &dyn DatasetStore, now: DateTime<Local>) -> Result<String> {
    let base = format!("dump-{}", now.format("%Y-%m-%dT%H:%M:%S"));
    if !store.contains_root(&base)? {
        return Ok(base);
    }
    let mut suffix = 1;
    loop {
        let candidate = format!("{}-{}", base, suffix);
        if !store.contains_root(&candidate)? {
            return Ok(candidate);
        }
        suffix += 1;
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Values {
    F32(Vec<f32>),
    U16(Vec<u16>),
    F64(Vec<f64>),
}

impl Values {
    fn new(dtype: Dtype) -> Self {
        match dtype {
            Dtype::F32 => Self::F32(Vec::new()),
            Dtype::U16 => Self::U16(Vec::new()),
            Dtype::F64 => Self::F64(Vec::new()),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::U16(v) => v.len(),
            Self::F64(v) => v.len(),
        }
    }

    fn truncate(&mut self, len: usize) {
        match self {
            Self::F32(v) => v.truncate(len),
            Self::U16(v) => v.truncate(len),
            Self::F64(v) => v.truncate(len),
        }
    }
}

#[derive(Debug)]
struct MemoryDataset {
    path: String,
    columns: usize,
    values: Values,
}

#[derive(Debug, Default)]
struct MemoryInner {
    datasets: Vec<MemoryDataset>,
    failing_channel: Option<String>,
    closed: bool,
}

/// In-process store. Clones share the same datasets, so a test (or a dry run)
/// can keep a handle and read back what the session wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every append to a dataset whose path ends in `channel` fail
    pub fn fail_appends_to(&self, channel: impl Into<String>) {
        self.lock().failing_channel = Some(channel.into());
    }

    pub fn dataset_paths(&self) -> Vec<String> {
        self.lock().datasets.iter().map(|d| d.path.clone()).collect()
    }

    /// Rows stored under `path`
    pub fn rows(&self, path: &str) -> Option<usize> {
        self.lock()
            .datasets
            .iter()
            .find(|d| d.path == path)
            .map(|d| d.values.len() / d.columns)
    }

    pub fn columns(&self, path: &str) -> Option<usize> {
        self.lock().datasets.iter().find(|d| d.path == path).map(|d| d.columns)
    }

    pub fn read_f32(&self, path: &str) -> Option<Vec<f32>> {
        match self.lock().datasets.iter().find(|d| d.path == path).map(|d| &d.values) {
            Some(Values::F32(v)) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn read_u16(&self, path: &str) -> Option<Vec<u16>> {
        match self.lock().datasets.iter().find(|d| d.path == path).map(|d| &d.values) {
            Some(Values::U16(v)) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn read_f64(&self, path: &str) -> Option<Vec<f64>> {
        match self.lock().datasets.iter().find(|d| d.path == path).map(|d| &d.values) {
            Some(Values::F64(v)) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl DatasetStore for MemoryStore {
    fn create_or_open(&mut self, root: &str, channel: &str, columns: usize, dtype: Dtype) -> Result<DatasetHandle> {
        let path = format!("{}/{}", root, channel);
        let mut inner = self.lock();
        inner.closed = false;
        if let Some(index) = inner.datasets.iter().position(|d| d.path == path) {
            let existing = &inner.datasets[index];
            if existing.columns != columns || existing.dtype() != dtype {
                return Err(PipelineError::storage(format!(
                    "dataset {} exists with {} columns of {:?}",
                    path,
                    existing.columns,
                    existing.dtype()
                )));
            }
            return Ok(DatasetHandle(index));
        }
        inner.datasets.push(MemoryDataset {
            path,
            columns,
            values: Values::new(dtype),
        });
        Ok(DatasetHandle(inner.datasets.len() - 1))
    }

    fn append_rows(&mut self, handle: DatasetHandle, rows: ColumnData<'_>) -> Result<()> {
        let mut inner = self.lock();
        let failing = inner.failing_channel.clone();
        let dataset = inner
            .datasets
            .get_mut(handle.0)
            .ok_or_else(|| PipelineError::storage(format!("unknown dataset handle {}", handle.0)))?;
        if failing.is_some_and(|channel| dataset.path.ends_with(&channel)) {
            return Err(PipelineError::storage(format!("append to {} failed", dataset.path)));
        }
        if rows.len() % dataset.columns != 0 {
            return Err(PipelineError::storage(format!(
                "{} values are not whole rows of {} columns",
                rows.len(),
                dataset.columns
            )));
        }
        match (&mut dataset.values, rows) {
            (Values::F32(v), ColumnData::F32(new)) => v.extend_from_slice(new),
            (Values::U16(v), ColumnData::U16(new)) => v.extend_from_slice(new),
            (Values::F64(v), ColumnData::F64(new)) => v.extend_from_slice(new),
            (_, rows) => {
                return Err(PipelineError::storage(format!(
                    "cannot append {:?} rows to {}",
                    rows.dtype(),
                    dataset.path
                )))
            }
        }
        Ok(())
    }

    fn row_count(&self, handle: DatasetHandle) -> Result<usize> {
        self.lock()
            .datasets
            .get(handle.0)
            .map(|d| d.values.len() / d.columns)
            .ok_or_else(|| PipelineError::storage(format!("unknown dataset handle {}", handle.0)))
    }

    fn truncate(&mut self, handle: DatasetHandle, rows: usize) -> Result<()> {
        let mut inner = self.lock();
        let dataset = inner
            .datasets
            .get_mut(handle.0)
            .ok_or_else(|| PipelineError::storage(format!("unknown dataset handle {}", handle.0)))?;
        let columns = dataset.columns;
        dataset.values.truncate(rows * columns);
        Ok(())
    }

    fn contains_root(&self, root: &str) -> Result<bool> {
        let prefix = format!("{}/", root);
        Ok(self.lock().datasets.iter().any(|d| d.path.starts_with(&prefix)))
    }

    fn close(&mut self) -> Result<()> {
        self.lock().closed = true;
        Ok(())
    }
}

impl MemoryDataset {
    fn dtype(&self) -> Dtype {
        match self.values {
            Values::F32(_) => Dtype::F32,
            Values::U16(_) => Dtype::U16,
            Values::F64(_) => Dtype::F64,
        }
    }
}

/// Appends chunks of one session to the per-channel datasets
pub struct StorageWriter {
    store: Box<dyn DatasetStore>,
    root: String,
    sources: usize,
    handles: HashMap<(usize, Channel), DatasetHandle>,
    chunks_flushed: u64,
    rows_written: u64,
    closed: bool,
}

impl StorageWriter {
    /// Open a writer under a fresh root group named after the current time
    pub fn open(store: Box<dyn DatasetStore>, sources: usize) -> Result<Self> {
        let root = root_name(store.as_ref(), Local::now())?;
        Ok(Self::with_root(store, root, sources))
    }

    /// Open a writer under an explicit root group
    pub fn with_root(store: Box<dyn DatasetStore>, root: impl Into<String>, sources: usize) -> Self {
        let root = root.into();
        info!("💾 Writing session to root group '{}'", root);
        Self {
            store,
            root,
            sources: sources.max(1),
            handles: HashMap::new(),
            chunks_flushed: 0,
            rows_written: 0,
            closed: false,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Dataset name of `channel` for `source`
    pub fn dataset_name(&self, source: usize, channel: Channel) -> String {
        if self.sources > 1 {
            format!("sensor{}/{}", source, channel.name())
        } else {
            channel.name().to_string()
        }
    }

    pub fn chunks_flushed(&self) -> u64 {
        self.chunks_flushed
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Append a chunk of a single-source session
    pub fn flush(&mut self, chunk: &Chunk) -> Result<()> {
        self.flush_source(0, chunk)
    }

    /// Append a chunk of `source`. On failure every channel is rolled back to
    /// its previous row count so the datasets stay aligned.
    pub fn flush_source(&mut self, source: usize, chunk: &Chunk) -> Result<()> {
        if self.closed {
            return Err(PipelineError::storage("storage writer is closed"));
        }
        if chunk.is_empty() {
            return Ok(());
        }

        let mut handles = Vec::with_capacity(Channel::ALL.len());
        for channel in Channel::ALL {
            handles.push(self.handle(source, channel, chunk.width())?);
        }
        let mut before = Vec::with_capacity(handles.len());
        for &handle in &handles {
            before.push(self.store.row_count(handle)?);
        }

        for (i, channel) in Channel::ALL.into_iter().enumerate() {
            if let Err(err) = self.store.append_rows(handles[i], channel.rows(chunk)) {
                error!(
                    "❌ Appending {} rows to '{}' failed: {}",
                    chunk.filled(),
                    self.dataset_name(source, channel),
                    err
                );
                // the failing channel may hold a partial append too
                for (&handle, &rows) in handles.iter().zip(&before).take(i + 1) {
                    if let Err(rollback) = self.store.truncate(handle, rows) {
                        warn!("Rollback of dataset {:?} failed: {}", handle, rollback);
                    }
                }
                return Err(PipelineError::storage(format!(
                    "flush of {} rows to '{}' failed: {}",
                    chunk.filled(),
                    self.dataset_name(source, channel),
                    err
                )));
            }
        }

        self.chunks_flushed += 1;
        self.rows_written += chunk.filled() as u64;
        debug!(
            "Flushed chunk of {} rows for source {} ({} chunks so far)",
            chunk.filled(),
            source,
            self.chunks_flushed
        );
        Ok(())
    }

    fn handle(&mut self, source: usize, channel: Channel, width: usize) -> Result<DatasetHandle> {
        if let Some(handle) = self.handles.get(&(source, channel)) {
            return Ok(*handle);
        }
        let name = self.dataset_name(source, channel);
        let handle = self
            .store
            .create_or_open(&self.root, &name, channel.columns(width), channel.dtype())?;
        self.handles.insert((source, channel), handle);
        Ok(handle)
    }

    /// Release the store. Further flushes fail.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.handles.clear();
        self.store.close()?;
        info!(
            "💾 Closed '{}': {} chunks, {} rows",
            self.root, self.chunks_flushed, self.rows_written
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkAccumulator;
    use crate::frame::{DecodedFrame, FooterData};
    use chrono::TimeZone;

    fn chunks(capacity: usize, frames: usize, width: usize) -> Vec<Chunk> {
        let mut acc = ChunkAccumulator::new(capacity).unwrap();
        let mut out = Vec::new();
        for i in 0..frames {
            let frame = DecodedFrame {
                c: vec![i as f32; width],
                a: vec![0.5; width],
                intensity: vec![i as u16; width],
                timestamp: i as f64 * 0.001,
                footer: FooterData::default(),
            };
            if let Some(chunk) = acc.admit(&frame).unwrap() {
                out.push(chunk);
            }
        }
        out.extend(acc.take_remaining());
        out
    }

    #[test]
    fn test_full_and_partial_flushes_align() {
        let store = MemoryStore::new();
        let mut writer = StorageWriter::with_root(Box::new(store.clone()), "dump-test", 1);
        for chunk in chunks(4, 11, 8) {
            writer.flush(&chunk).unwrap();
        }
        assert_eq!(writer.chunks_flushed(), 3);
        assert_eq!(writer.rows_written(), 11);

        for name in ["z", "x", "intensity", "timestamp"] {
            assert_eq!(store.rows(&format!("dump-test/{}", name)), Some(11));
        }
        assert_eq!(store.columns("dump-test/z"), Some(8));
        assert_eq!(store.columns("dump-test/timestamp"), Some(1));
        let z = store.read_f32("dump-test/z").unwrap();
        assert_eq!(z[10 * 8], 10.0);
        assert_eq!(store.read_u16("dump-test/intensity").unwrap()[8], 1);
        assert_eq!(store.read_f64("dump-test/timestamp").unwrap()[2], 0.002);

        writer.close().unwrap();
        assert!(store.is_closed());
        assert!(writer.flush(&chunks(1, 1, 8)[0]).is_err());
    }

    #[test]
    fn test_failed_flush_rolls_back() {
        let store = MemoryStore::new();
        let mut writer = StorageWriter::with_root(Box::new(store.clone()), "dump-test", 1);
        let all = chunks(4, 8, 2);
        writer.flush(&all[0]).unwrap();

        store.fail_appends_to("/intensity");
        let err = writer.flush(&all[1]).unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));
        assert_eq!(writer.chunks_flushed(), 1);

        // z and x were appended before intensity failed and must be rolled back
        for name in ["z", "x", "intensity", "timestamp"] {
            assert_eq!(store.rows(&format!("dump-test/{}", name)), Some(4));
        }
    }

    #[test]
    fn test_multi_source_dataset_names() {
        let store = MemoryStore::new();
        let mut writer = StorageWriter::with_root(Box::new(store.clone()), "dump-test", 2);
        let chunk = &chunks(2, 2, 4)[0];
        writer.flush_source(0, chunk).unwrap();
        writer.flush_source(1, chunk).unwrap();

        assert_eq!(writer.dataset_name(1, Channel::Z), "sensor1/z");
        assert_eq!(store.rows("dump-test/sensor0/z"), Some(2));
        assert_eq!(store.rows("dump-test/sensor1/timestamp"), Some(2));
        assert_eq!(writer.rows_written(), 4);
    }

    #[test]
    fn test_root_name_gets_suffix_when_taken() {
        let mut store = MemoryStore::new();
        let now = Local.with_ymd_and_hms(2024, 5, 17, 9, 30, 0).unwrap();
        assert_eq!(root_name(&store, now).unwrap(), "dump-2024-05-17T09:30:00");

        store
            .create_or_open("dump-2024-05-17T09:30:00", "z", 4, Dtype::F32)
            .unwrap();
        assert_eq!(root_name(&store, now).unwrap(), "dump-2024-05-17T09:30:00-1");

        store
            .create_or_open("dump-2024-05-17T09:30:00-1", "z", 4, Dtype::F32)
            .unwrap();
        assert_eq!(root_name(&store, now).unwrap(), "dump-2024-05-17T09:30:00-2");
    }

    #[test]
    fn test_reopen_with_other_shape_fails() {
        let mut store = MemoryStore::new();
        let first = store.create_or_open("r", "z", 4, Dtype::F32).unwrap();
        assert_eq!(store.create_or_open("r", "z", 4, Dtype::F32).unwrap(), first);
        assert!(store.create_or_open("r", "z", 8, Dtype::F32).is_err());
        assert!(store.create_or_open("r", "z", 4, Dtype::U16).is_err());
        assert!(store.append_rows(first, ColumnData::F32(&[1.0; 3])).is_err());
    }
}
