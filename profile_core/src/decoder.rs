/*!
Frame decoding: fixed-point to physical transform plus footer extraction.

Every physical channel is computed as `scale * raw + offset`. A column whose
raw distance sample equals the invalid sentinel becomes NaN in both physical
channels. Invalid-marking runs before the optional column crop; both happen
per column, so the order does not change the result.
*/

use crate::calibration::{footer_width, CalibrationParams};
use crate::config::{ColumnWindow, InvalidIntensity, SessionConfig};
use crate::error::{DecodeError, Result};
use crate::frame::{DecodedFrame, FooterData, FrameLayout};
use num_traits::FromBytes;
use tracing::trace;

/// Decoder settings that are not part of the sensor calibration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecodePolicy {
    pub invalid_intensity: InvalidIntensity,
    pub column_window: Option<ColumnWindow>,
}

impl From<&SessionConfig> for DecodePolicy {
    fn from(config: &SessionConfig) -> Self {
        Self {
            invalid_intensity: config.invalid_intensity,
            column_window: config.column_window,
        }
    }
}

/// Pure raw-frame decoder; shareable between threads
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    layout: FrameLayout,
    calibration: CalibrationParams,
    policy: DecodePolicy,
    c_scale: f64,
    c_offset: f64,
    a_scale: f64,
    a_offset: f64,
}

impl FrameDecoder {
    /// Create a decoder, checking the calibration against the layout
    pub fn new(layout: FrameLayout, calibration: CalibrationParams, policy: DecodePolicy) -> Result<Self> {
        calibration.footer.validate(layout.footer_len())?;
        if let Some(window) = &policy.column_window {
            window.validate(layout.width)?;
        }
        Ok(Self {
            c_scale: calibration.c_scale.value(),
            c_offset: calibration.c_offset.value(),
            a_scale: calibration.a_scale.value(),
            a_offset: calibration.a_offset.value(),
            layout,
            calibration,
            policy,
        })
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub fn calibration(&self) -> &CalibrationParams {
        &self.calibration
    }

    /// Columns per channel after cropping
    pub fn output_width(&self) -> usize {
        self.policy
            .column_window
            .map(|w| w.width())
            .unwrap_or(self.layout.width)
    }

    /// Decode one raw payload
    pub fn decode(&self, data: &[u8]) -> std::result::Result<DecodedFrame, DecodeError> {
        let raw = self.layout.split(data)?;
        let invalid = self.calibration.invalid;

        let mut c = Vec::with_capacity(raw.c.len());
        let mut a = Vec::with_capacity(raw.a.len());
        let mut intensity = Vec::with_capacity(raw.intensity.len());

        for ((&c_raw, &a_raw), &i_raw) in raw.c.iter().zip(&raw.a).zip(&raw.intensity) {
            if c_raw == invalid {
                c.push(f32::NAN);
                a.push(f32::NAN);
                intensity.push(match self.policy.invalid_intensity {
                    InvalidIntensity::Keep => i_raw as u16,
                    InvalidIntensity::Zero => 0,
                });
            } else {
                c.push((self.c_scale * c_raw as f64 + self.c_offset) as f32);
                a.push((self.a_scale * a_raw as f64 + self.a_offset) as f32);
                intensity.push(i_raw as u16);
            }
        }

        if let Some(window) = self.policy.column_window {
            c = c[window.start..window.end].to_vec();
            a = a[window.start..window.end].to_vec();
            intensity = intensity[window.start..window.end].to_vec();
        }

        let footer = self.decode_footer(raw.footer)?;
        let timestamp = footer.tick as f64 / self.calibration.tick_frequency_hz as f64;

        trace!(
            "Decoded frame {} (event {}), t = {:.6}s",
            footer.frame_counter,
            footer.event_number,
            timestamp
        );

        Ok(DecodedFrame {
            c,
            a,
            intensity,
            timestamp,
            footer,
        })
    }

    /// Extract the metadata fields from a footer
    pub fn decode_footer(&self, footer: &[u8]) -> std::result::Result<FooterData, DecodeError> {
        let offsets = &self.calibration.footer;
        Ok(FooterData {
            tick: read_le::<u64, { footer_width::TIMESTAMP }>(footer, offsets.timestamp)?,
            trigger_id: read_le::<u16, { footer_width::TRIGGER_ID }>(footer, offsets.trigger_id)?,
            bus_id: read_le::<u16, { footer_width::BUS_ID }>(footer, offsets.bus_id)?,
            event_number: read_le::<u32, { footer_width::EVENT_NUMBER }>(footer, offsets.event_number)?,
            frame_counter: read_le::<u16, { footer_width::FRAME_COUNTER }>(footer, offsets.frame_counter)?,
            encoder_position: read_le::<u32, { footer_width::ENCODER_POSITION }>(footer, offsets.encoder_position)?,
            exposure_duration: read_le::<u64, { footer_width::EXPOSURE_DURATION }>(footer, offsets.exposure_duration)?,
            gate_number: read_le::<u16, { footer_width::GATE_NUMBER }>(footer, offsets.gate_number)?,
        })
    }
}

/// Little-endian integer of `N` bytes at `offset`
fn read_le<T, const N: usize>(footer: &[u8], offset: usize) -> std::result::Result<T, DecodeError>
where
    T: FromBytes<Bytes = [u8; N]>,
{
    let bytes: [u8; N] = footer
        .get(offset..offset + N)
        .and_then(|s| s.try_into().ok())
        .ok_or(DecodeError::FooterOutOfRange {
            offset,
            width: N,
            footer_len: footer.len(),
        })?;
    Ok(T::from_le_bytes(&bytes))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::calibration::CalibrationRegisters;
    use crate::protocol::{CHANNEL_WIDTH, DEFAULT_PAYLOAD_SIZE};

    pub(crate) fn registers() -> CalibrationRegisters {
        CalibrationRegisters::default()
    }

    pub(crate) fn decoder(policy: DecodePolicy) -> FrameDecoder {
        let layout = FrameLayout::from_payload_size(DEFAULT_PAYLOAD_SIZE, CHANNEL_WIDTH).unwrap();
        let calibration = CalibrationParams::from_registers(&registers(), layout.footer_len()).unwrap();
        FrameDecoder::new(layout, calibration, policy).unwrap()
    }

    /// Payload with a constant raw C value, `invalid_cols` marked invalid
    pub(crate) fn payload(decoder: &FrameDecoder, c_raw: i16, invalid_cols: &[usize], footer: FooterData) -> Vec<u8> {
        let layout = decoder.layout();
        let mut c = vec![c_raw; layout.width];
        for &col in invalid_cols {
            c[col] = decoder.calibration().invalid;
        }
        let a: Vec<i16> = (0..layout.width).map(|i| i as i16).collect();
        let intensity = vec![500i16; layout.width];
        let footer = footer
            .encode(&decoder.calibration().footer, layout.footer_len())
            .unwrap();
        layout.encode(&c, &a, &intensity, &footer).unwrap()
    }

    #[test]
    fn test_transform_and_footer() {
        let decoder = decoder(DecodePolicy::default());
        let footer = FooterData {
            tick: 2_500_000,
            trigger_id: 3,
            bus_id: 1,
            event_number: 77,
            frame_counter: 12,
            encoder_position: 0x0102_0304,
            exposure_duration: 450,
            gate_number: 2,
        };
        let frame = decoder.decode(&payload(&decoder, 2000, &[], footer)).unwrap();

        assert_eq!(frame.width(), CHANNEL_WIDTH);
        // 0.01 * 2000 - 50
        assert!((frame.c[0] + 30.0).abs() < 1e-5);
        // 0.02 * 100 - 20
        assert!((frame.a[100] + 18.0).abs() < 1e-5);
        assert_eq!(frame.intensity[0], 500);
        assert_eq!(frame.timestamp, 2.5);
        assert_eq!(frame.footer, footer);
    }

    #[test]
    fn test_invalid_marks_both_channels() {
        for (num, den) in [(1, 100), (-3, 7), (250, 1)] {
            let mut regs = registers();
            regs.c_scale_numerator = num;
            regs.c_scale_denominator = den;
            regs.a_offset_numerator = num;
            let layout = FrameLayout::from_payload_size(DEFAULT_PAYLOAD_SIZE, CHANNEL_WIDTH).unwrap();
            let calibration = CalibrationParams::from_registers(&regs, layout.footer_len()).unwrap();
            let decoder = FrameDecoder::new(layout, calibration, DecodePolicy::default()).unwrap();

            let frame = decoder
                .decode(&payload(&decoder, 1000, &[0, 5, 2047], FooterData::default()))
                .unwrap();
            for col in [0, 5, 2047] {
                assert!(frame.c[col].is_nan());
                assert!(frame.a[col].is_nan());
            }
            assert!(!frame.c[1].is_nan());
            assert_eq!(frame.valid_count(), CHANNEL_WIDTH - 3);
        }
    }

    #[test]
    fn test_invalid_intensity_policy() {
        let keep = decoder(DecodePolicy::default());
        let frame = keep.decode(&payload(&keep, 1000, &[4], FooterData::default())).unwrap();
        assert_eq!(frame.intensity[4], 500);

        let zero = decoder(DecodePolicy {
            invalid_intensity: InvalidIntensity::Zero,
            column_window: None,
        });
        let frame = zero.decode(&payload(&zero, 1000, &[4], FooterData::default())).unwrap();
        assert_eq!(frame.intensity[4], 0);
        assert_eq!(frame.intensity[5], 500);
    }

    #[test]
    fn test_column_window_crops_columns_only() {
        let decoder = decoder(DecodePolicy {
            invalid_intensity: InvalidIntensity::Keep,
            column_window: Some(ColumnWindow::new(100, 110).unwrap()),
        });
        let footer = FooterData {
            event_number: 9,
            ..FooterData::default()
        };
        let frame = decoder.decode(&payload(&decoder, 1000, &[105], footer)).unwrap();

        assert_eq!(decoder.output_width(), 10);
        assert_eq!(frame.width(), 10);
        assert_eq!(frame.a.len(), 10);
        assert_eq!(frame.intensity.len(), 10);
        assert!(frame.c[5].is_nan());
        assert!((frame.a[0] - (0.02 * 100.0 - 20.0)).abs() < 1e-5);
        assert_eq!(frame.footer.event_number, 9);
    }

    #[test]
    fn test_decode_is_deterministic() {
        let decoder = decoder(DecodePolicy::default());
        let data = payload(&decoder, -1234, &[1, 2, 3], FooterData::default());
        let first = decoder.decode(&data).unwrap();
        let second = decoder.decode(&data).unwrap();
        // NaN != NaN, so compare bit patterns
        let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&first.c), bits(&second.c));
        assert_eq!(bits(&first.a), bits(&second.a));
        assert_eq!(first.intensity, second.intensity);
        assert_eq!(first.footer, second.footer);
    }

    #[test]
    fn test_wrong_size_is_decode_error() {
        let decoder = decoder(DecodePolicy::default());
        let mut data = payload(&decoder, 0, &[], FooterData::default());
        data.truncate(DEFAULT_PAYLOAD_SIZE - 1);
        assert!(matches!(
            decoder.decode(&data),
            Err(DecodeError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_window_wider_than_profile_rejected() {
        let layout = FrameLayout::from_payload_size(DEFAULT_PAYLOAD_SIZE, CHANNEL_WIDTH).unwrap();
        let calibration = CalibrationParams::from_registers(&registers(), layout.footer_len()).unwrap();
        let policy = DecodePolicy {
            invalid_intensity: InvalidIntensity::Keep,
            column_window: Some(ColumnWindow { start: 2000, end: 2100 }),
        };
        assert!(FrameDecoder::new(layout, calibration, policy).is_err());
    }
}
