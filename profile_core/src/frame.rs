/*!
Raw and decoded frame data structures.

A raw frame is the payload of one sensor cycle: three blocks of little-endian
`int16` samples (distance channel C, lateral channel A, intensity) followed by
a footer holding the timestamp and counters.
*/

use crate::calibration::FooterOffsets;
use crate::error::{DecodeError, PipelineError, Result};
use crate::protocol::{CHANNELS_PER_FRAME, SAMPLE_SIZE_BYTES};
use num_traits::ToBytes;
use serde::{Deserialize, Serialize};

/// One raw payload, owned by whichever stage currently holds it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Buffer slot inside the source's pool
    pub slot: usize,
    pub data: Vec<u8>,
}

impl RawFrame {
    pub fn new(slot: usize, data: Vec<u8>) -> Self {
        Self { slot, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Byte offsets of the channel blocks and footer inside a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLayout {
    pub payload_size: usize,
    pub width: usize,
    pub c_offset: usize,
    pub a_offset: usize,
    pub intensity_offset: usize,
    pub footer_offset: usize,
}

impl FrameLayout {
    /// Derive the layout from the payload size the source reports
    pub fn from_payload_size(payload_size: usize, width: usize) -> Result<Self> {
        let block = width * SAMPLE_SIZE_BYTES;
        let channels = block * CHANNELS_PER_FRAME;
        if width == 0 || payload_size < channels {
            return Err(PipelineError::config(format!(
                "payload of {} bytes cannot hold {} channels of {} samples",
                payload_size, CHANNELS_PER_FRAME, width
            )));
        }
        Ok(Self {
            payload_size,
            width,
            c_offset: 0,
            a_offset: block,
            intensity_offset: 2 * block,
            footer_offset: channels,
        })
    }

    pub fn footer_len(&self) -> usize {
        self.payload_size - self.footer_offset
    }

    fn block(&self, data: &[u8], offset: usize) -> std::result::Result<Vec<i16>, DecodeError> {
        let bytes = data
            .get(offset..offset + self.width * SAMPLE_SIZE_BYTES)
            .ok_or(DecodeError::SizeMismatch {
                expected: self.payload_size,
                actual: data.len(),
            })?;
        Ok(bytes
            .chunks_exact(SAMPLE_SIZE_BYTES)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Split a payload into its three sample blocks and the footer
    pub fn split<'a>(&self, data: &'a [u8]) -> std::result::Result<RawChannels<'a>, DecodeError> {
        if data.len() != self.payload_size {
            return Err(DecodeError::SizeMismatch {
                expected: self.payload_size,
                actual: data.len(),
            });
        }
        Ok(RawChannels {
            c: self.block(data, self.c_offset)?,
            a: self.block(data, self.a_offset)?,
            intensity: self.block(data, self.intensity_offset)?,
            footer: &data[self.footer_offset..],
        })
    }

    /// Assemble a payload from raw samples and footer bytes
    pub fn encode(&self, c: &[i16], a: &[i16], intensity: &[i16], footer: &[u8]) -> Result<Vec<u8>> {
        if c.len() != self.width || a.len() != self.width || intensity.len() != self.width {
            return Err(PipelineError::config(format!(
                "channel lengths {}/{}/{} do not match profile width {}",
                c.len(),
                a.len(),
                intensity.len(),
                self.width
            )));
        }
        if footer.len() != self.footer_len() {
            return Err(PipelineError::config(format!(
                "footer of {} bytes does not match layout footer of {} bytes",
                footer.len(),
                self.footer_len()
            )));
        }
        let mut data = Vec::with_capacity(self.payload_size);
        for block in [c, a, intensity] {
            for sample in block {
                data.extend_from_slice(&sample.to_le_bytes());
            }
        }
        data.extend_from_slice(footer);
        Ok(data)
    }
}

/// Sample blocks of one payload, copied out of the raw bytes
#[derive(Debug, Clone)]
pub struct RawChannels<'a> {
    pub c: Vec<i16>,
    pub a: Vec<i16>,
    pub intensity: Vec<i16>,
    pub footer: &'a [u8],
}

/// Metadata carried in the footer of each frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FooterData {
    /// Start-of-exposure timestamp in sensor ticks
    pub tick: u64,
    pub trigger_id: u16,
    /// Multi-device bus id of the sensor that produced the frame
    pub bus_id: u16,
    pub event_number: u32,
    pub frame_counter: u16,
    /// Encoder count latched at the trigger
    pub encoder_position: u32,
    /// Exposure time in sensor ticks
    pub exposure_duration: u64,
    pub gate_number: u16,
}

impl FooterData {
    /// Serialize into a footer of `footer_len` bytes at the given offsets
    pub fn encode(&self, offsets: &FooterOffsets, footer_len: usize) -> Result<Vec<u8>> {
        offsets.validate(footer_len)?;
        let mut footer = vec![0u8; footer_len];
        put(&mut footer, offsets.timestamp, self.tick);
        put(&mut footer, offsets.trigger_id, self.trigger_id);
        put(&mut footer, offsets.bus_id, self.bus_id);
        put(&mut footer, offsets.event_number, self.event_number);
        put(&mut footer, offsets.frame_counter, self.frame_counter);
        put(&mut footer, offsets.encoder_position, self.encoder_position);
        put(&mut footer, offsets.exposure_duration, self.exposure_duration);
        put(&mut footer, offsets.gate_number, self.gate_number);
        Ok(footer)
    }
}

fn put<T: ToBytes>(footer: &mut [u8], offset: usize, value: T) {
    let bytes = value.to_le_bytes();
    let bytes = bytes.as_ref();
    footer[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// Physical profile produced from exactly one raw frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedFrame {
    /// Distance channel, NaN where the sample was invalid
    pub c: Vec<f32>,
    /// Lateral channel, NaN where the distance sample was invalid
    pub a: Vec<f32>,
    pub intensity: Vec<u16>,
    /// Start of exposure in seconds
    pub timestamp: f64,
    pub footer: FooterData,
}

impl DecodedFrame {
    /// Number of columns per channel
    pub fn width(&self) -> usize {
        self.c.len()
    }

    /// Mean of the distance channel ignoring NaNs; NaN if no column is valid
    pub fn mean_c(&self) -> f64 {
        let (sum, count) = self
            .c
            .iter()
            .filter(|v| !v.is_nan())
            .fold((0.0f64, 0usize), |(sum, count), v| (sum + *v as f64, count + 1));
        if count == 0 {
            f64::NAN
        } else {
            sum / count as f64
        }
    }

    /// Number of valid distance samples
    pub fn valid_count(&self) -> usize {
        self.c.iter().filter(|v| !v.is_nan()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CHANNEL_WIDTH, DEFAULT_PAYLOAD_SIZE};

    #[test]
    fn test_layout_from_payload_size() {
        let layout = FrameLayout::from_payload_size(DEFAULT_PAYLOAD_SIZE, CHANNEL_WIDTH).unwrap();
        assert_eq!(layout.a_offset, 4096);
        assert_eq!(layout.intensity_offset, 8192);
        assert_eq!(layout.footer_offset, 12288);
        assert_eq!(layout.footer_len(), 64);

        assert!(FrameLayout::from_payload_size(12000, CHANNEL_WIDTH).is_err());
    }

    #[test]
    fn test_split_rejects_wrong_size() {
        let layout = FrameLayout::from_payload_size(DEFAULT_PAYLOAD_SIZE, CHANNEL_WIDTH).unwrap();
        let err = layout.split(&vec![0u8; DEFAULT_PAYLOAD_SIZE - 2]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::SizeMismatch {
                expected: DEFAULT_PAYLOAD_SIZE,
                actual: DEFAULT_PAYLOAD_SIZE - 2
            }
        );
    }

    #[test]
    fn test_split_reads_little_endian_blocks() {
        let layout = FrameLayout::from_payload_size(6 * 4 + 8, 4).unwrap();
        let data = layout
            .encode(&[1, -1, 2, -2], &[10, 20, 30, 40], &[7, 7, 7, 7], &[0xAB; 8])
            .unwrap();
        assert_eq!(&data[0..2], &[0x01, 0x00]);
        assert_eq!(&data[2..4], &[0xFF, 0xFF]);

        let channels = layout.split(&data).unwrap();
        assert_eq!(channels.c, vec![1, -1, 2, -2]);
        assert_eq!(channels.a, vec![10, 20, 30, 40]);
        assert_eq!(channels.intensity, vec![7, 7, 7, 7]);
        assert_eq!(channels.footer, &[0xAB; 8]);
    }

    #[test]
    fn test_mean_ignores_nan() {
        let frame = DecodedFrame {
            c: vec![1.0, f32::NAN, 3.0],
            a: vec![0.0; 3],
            intensity: vec![0; 3],
            timestamp: 0.0,
            footer: FooterData::default(),
        };
        assert_eq!(frame.mean_c(), 2.0);
        assert_eq!(frame.valid_count(), 2);

        let empty = DecodedFrame {
            c: vec![f32::NAN; 2],
            ..frame
        };
        assert!(empty.mean_c().is_nan());
    }
}
