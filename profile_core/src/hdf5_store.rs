/*!
HDF5 backend of the dataset store.

Datasets are 2-D with an unlimited row extent, chunked along rows and
gzip-compressed at level 9. Appends resize the dataset and write the new rows
as a hyperslab, so earlier rows are never rewritten.
*/

use crate::error::{PipelineError, Result};
use crate::storage::{ColumnData, DatasetHandle, DatasetStore, Dtype};
use hdf5::{Dataset, File, Group, H5Type};
use ndarray::ArrayView2;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const COMPRESSION_LEVEL: u8 = 9;

struct OpenDataset {
    name: String,
    dataset: Dataset,
    columns: usize,
}

/// Dataset store backed by one HDF5 file
pub struct Hdf5Store {
    path: PathBuf,
    file: Option<File>,
    chunk_rows: usize,
    datasets: Vec<OpenDataset>,
}

impl Hdf5Store {
    /// Open `path` for appending, creating the file if needed.
    /// `chunk_rows` sets the HDF5 chunk height of new datasets.
    pub fn open(path: impl AsRef<Path>, chunk_rows: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::append(&path)
            .map_err(|e| PipelineError::storage(format!("cannot open {}: {}", path.display(), e)))?;
        info!("💾 Opened HDF5 file {}", path.display());
        Ok(Self {
            path,
            file: Some(file),
            chunk_rows: chunk_rows.max(1),
            datasets: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| PipelineError::storage(format!("{} is closed", self.path.display())))
    }

    fn entry(&self, handle: DatasetHandle) -> Result<&OpenDataset> {
        self.datasets
            .get(handle.0)
            .ok_or_else(|| PipelineError::storage(format!("unknown dataset handle {}", handle.0)))
    }
}

fn ensure_group(parent: &Group, name: &str) -> hdf5::Result<Group> {
    if parent.group(name).is_ok() {
        parent.group(name)
    } else {
        parent.create_group(name)
    }
}

fn create<T: H5Type>(group: &Group, name: &str, columns: usize, chunk_rows: usize) -> hdf5::Result<Dataset> {
    group
        .new_dataset::<T>()
        .shape((0.., columns))
        .chunk((chunk_rows, columns))
        .deflate(COMPRESSION_LEVEL)
        .create(name)
}

fn write_rows<T: H5Type>(dataset: &Dataset, values: &[T], rows: Range<usize>, columns: usize) -> Result<()> {
    let view = ArrayView2::from_shape((rows.len(), columns), values)
        .map_err(|e| PipelineError::storage(format!("rows do not match dataset shape: {}", e)))?;
    dataset
        .write_slice(view, (rows, ..))
        .map_err(|e| PipelineError::storage(e.to_string()))
}

impl DatasetStore for Hdf5Store {
    fn create_or_open(&mut self, root: &str, channel: &str, columns: usize, dtype: Dtype) -> Result<DatasetHandle> {
        let name = format!("{}/{}", root, channel);
        if let Some(index) = self.datasets.iter().position(|d| d.name == name) {
            return Ok(DatasetHandle(index));
        }

        let file = self.file()?;
        let storage_err = |e: hdf5::Error| PipelineError::storage(format!("dataset {}: {}", name, e));

        let mut parts: Vec<&str> = channel.split('/').collect();
        let leaf = parts.pop().unwrap_or(channel);
        let mut group = ensure_group(file, root).map_err(storage_err)?;
        for part in parts {
            group = ensure_group(&group, part).map_err(storage_err)?;
        }

        let dataset = match group.dataset(leaf) {
            Ok(existing) => {
                let shape = existing.shape();
                if shape.len() != 2 || shape[1] != columns {
                    return Err(PipelineError::storage(format!(
                        "dataset {} exists with shape {:?}, expected {} columns",
                        name, shape, columns
                    )));
                }
                existing
            }
            Err(_) => {
                let created = match dtype {
                    Dtype::F32 => create::<f32>(&group, leaf, columns, self.chunk_rows),
                    Dtype::U16 => create::<u16>(&group, leaf, columns, self.chunk_rows),
                    Dtype::F64 => create::<f64>(&group, leaf, columns, self.chunk_rows),
                };
                debug!("Created dataset {} ({} columns of {:?})", name, columns, dtype);
                created.map_err(storage_err)?
            }
        };

        self.datasets.push(OpenDataset {
            name,
            dataset,
            columns,
        });
        Ok(DatasetHandle(self.datasets.len() - 1))
    }

    fn append_rows(&mut self, handle: DatasetHandle, rows: ColumnData<'_>) -> Result<()> {
        let entry = self.entry(handle)?;
        if rows.len() % entry.columns != 0 {
            return Err(PipelineError::storage(format!(
                "{} values are not whole rows of {} columns",
                rows.len(),
                entry.columns
            )));
        }
        let old = entry.dataset.shape()[0];
        let new = old + rows.len() / entry.columns;
        entry
            .dataset
            .resize((new, entry.columns))
            .map_err(|e| PipelineError::storage(format!("resize of {} failed: {}", entry.name, e)))?;

        match rows {
            ColumnData::F32(values) => write_rows(&entry.dataset, values, old..new, entry.columns),
            ColumnData::U16(values) => write_rows(&entry.dataset, values, old..new, entry.columns),
            ColumnData::F64(values) => write_rows(&entry.dataset, values, old..new, entry.columns),
        }
    }

    fn row_count(&self, handle: DatasetHandle) -> Result<usize> {
        Ok(self.entry(handle)?.dataset.shape()[0])
    }

    fn truncate(&mut self, handle: DatasetHandle, rows: usize) -> Result<()> {
        let entry = self.entry(handle)?;
        entry
            .dataset
            .resize((rows, entry.columns))
            .map_err(|e| PipelineError::storage(format!("truncate of {} failed: {}", entry.name, e)))
    }

    fn contains_root(&self, root: &str) -> Result<bool> {
        Ok(self.file()?.group(root).is_ok())
    }

    fn close(&mut self) -> Result<()> {
        self.datasets.clear();
        if let Some(file) = self.file.take() {
            file.flush()
                .map_err(|e| PipelineError::storage(format!("flush of {} failed: {}", self.path.display(), e)))?;
            info!("💾 Closed HDF5 file {}", self.path.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkAccumulator;
    use crate::frame::{DecodedFrame, FooterData};
    use crate::storage::StorageWriter;
    use tempfile::tempdir;

    fn frame(value: f32) -> DecodedFrame {
        DecodedFrame {
            c: vec![value; 8],
            a: vec![f32::NAN; 8],
            intensity: vec![7; 8],
            timestamp: value as f64,
            footer: FooterData::default(),
        }
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.hdf5");

        let store = Hdf5Store::open(&path, 4).unwrap();
        let mut writer = StorageWriter::with_root(Box::new(store), "dump-test", 1);
        let mut acc = ChunkAccumulator::new(4).unwrap();
        for i in 0..6 {
            if let Some(chunk) = acc.admit(&frame(i as f32)).unwrap() {
                writer.flush(&chunk).unwrap();
            }
        }
        writer.flush(&acc.take_remaining().unwrap()).unwrap();
        writer.close().unwrap();

        let file = File::open(&path).unwrap();
        let z = file.dataset("dump-test/z").unwrap();
        assert_eq!(z.shape(), vec![6, 8]);
        let values = z.read_2d::<f32>().unwrap();
        assert_eq!(values[[5, 0]], 5.0);
        assert_eq!(file.dataset("dump-test/timestamp").unwrap().shape(), vec![6, 1]);
        assert!(file.dataset("dump-test/x").unwrap().read_2d::<f32>().unwrap()[[0, 0]].is_nan());
    }

    #[test]
    fn test_truncate_and_roots() {
        let dir = tempdir().unwrap();
        let mut store = Hdf5Store::open(dir.path().join("dump.hdf5"), 2).unwrap();
        assert!(!store.contains_root("dump-a").unwrap());

        let handle = store.create_or_open("dump-a", "sensor1/intensity", 3, Dtype::U16).unwrap();
        store.append_rows(handle, ColumnData::U16(&[1, 2, 3, 4, 5, 6])).unwrap();
        assert_eq!(store.row_count(handle).unwrap(), 2);
        assert!(store.contains_root("dump-a").unwrap());

        store.truncate(handle, 1).unwrap();
        assert_eq!(store.row_count(handle).unwrap(), 1);
        assert!(store.append_rows(handle, ColumnData::U16(&[1, 2])).is_err());
        store.close().unwrap();
    }
}
