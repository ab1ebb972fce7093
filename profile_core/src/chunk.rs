/*!
Row batching of decoded frames ahead of storage.
*/

use crate::error::{PipelineError, Result};
use crate::frame::DecodedFrame;

/// Fixed-capacity block of rows, one row per admitted frame
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    capacity: usize,
    width: usize,
    filled: usize,
    /// Distance channel, `capacity * width` values in row-major order
    pub c: Vec<f32>,
    /// Lateral channel, `capacity * width` values in row-major order
    pub a: Vec<f32>,
    pub intensity: Vec<u16>,
    /// One timestamp per row
    pub timestamp: Vec<f64>,
}

impl Chunk {
    fn new(capacity: usize, width: usize) -> Self {
        Self {
            capacity,
            width,
            filled: 0,
            c: vec![0.0; capacity * width],
            a: vec![0.0; capacity * width],
            intensity: vec![0; capacity * width],
            timestamp: vec![0.0; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Rows written so far
    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn is_full(&self) -> bool {
        self.filled == self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Filled part of the distance channel
    pub fn c_rows(&self) -> &[f32] {
        &self.c[..self.filled * self.width]
    }

    /// Filled part of the lateral channel
    pub fn a_rows(&self) -> &[f32] {
        &self.a[..self.filled * self.width]
    }

    pub fn intensity_rows(&self) -> &[u16] {
        &self.intensity[..self.filled * self.width]
    }

    pub fn timestamp_rows(&self) -> &[f64] {
        &self.timestamp[..self.filled]
    }

    fn write_row(&mut self, frame: &DecodedFrame) {
        let row = self.filled * self.width..(self.filled + 1) * self.width;
        self.c[row.clone()].copy_from_slice(&frame.c);
        self.a[row.clone()].copy_from_slice(&frame.a);
        self.intensity[row].copy_from_slice(&frame.intensity);
        self.timestamp[self.filled] = frame.timestamp;
        self.filled += 1;
    }
}

/// Collects admitted frames into chunks of `capacity` rows
#[derive(Debug)]
pub struct ChunkAccumulator {
    capacity: usize,
    current: Option<Chunk>,
    width: Option<usize>,
}

impl ChunkAccumulator {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(PipelineError::config("chunk row capacity must be at least 1"));
        }
        Ok(Self {
            capacity,
            current: None,
            width: None,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Column count fixed by the first admitted frame
    pub fn width(&self) -> Option<usize> {
        self.width
    }

    /// Rows waiting in the current chunk
    pub fn pending(&self) -> usize {
        self.current.as_ref().map(Chunk::filled).unwrap_or(0)
    }

    /// Append one frame. Returns the chunk once it is full; a fresh one is started.
    pub fn admit(&mut self, frame: &DecodedFrame) -> Result<Option<Chunk>> {
        let width = *self.width.get_or_insert(frame.width());
        if frame.width() != width || frame.a.len() != width || frame.intensity.len() != width {
            return Err(PipelineError::config(format!(
                "frame width {} does not match chunk width {}",
                frame.width(),
                width
            )));
        }

        let capacity = self.capacity;
        let chunk = self.current.get_or_insert_with(|| Chunk::new(capacity, width));
        chunk.write_row(frame);

        if chunk.is_full() {
            Ok(self.current.take())
        } else {
            Ok(None)
        }
    }

    /// Hand out the partially filled chunk, if any row is pending
    pub fn take_remaining(&mut self) -> Option<Chunk> {
        self.current.take().filter(|chunk| !chunk.is_empty())
    }
}
