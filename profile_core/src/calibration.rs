/*!
Calibration constants for the fixed-point to physical transform.

The sensor exposes its scale and offset as integer numerator/denominator
registers plus the invalid-sample sentinel, the timestamp tick frequency and
the byte offsets of the footer fields. They are read once when a session
starts and never change afterwards.
*/

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Width in bytes of each footer field
pub mod footer_width {
    pub const TIMESTAMP: usize = 8;
    pub const TRIGGER_ID: usize = 2;
    pub const BUS_ID: usize = 2;
    pub const EVENT_NUMBER: usize = 4;
    pub const FRAME_COUNTER: usize = 2;
    pub const ENCODER_POSITION: usize = 4;
    pub const EXPOSURE_DURATION: usize = 8;
    pub const GATE_NUMBER: usize = 2;
}

/// Register values exactly as the frame source reports them.
///
/// The driver reads 32-bit registers through a 64-bit getter and may hand back
/// values that only make sense once narrowed again, see
/// [`CalibrationParams::from_registers`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationRegisters {
    pub c_scale_numerator: i64,
    pub c_scale_denominator: i64,
    pub c_offset_numerator: i64,
    pub c_offset_denominator: i64,
    pub a_scale_numerator: i64,
    pub a_scale_denominator: i64,
    pub a_offset_numerator: i64,
    pub a_offset_denominator: i64,
    pub invalid_value: i64,
    pub tick_frequency_hz: i64,
    pub timestamp_offset: i64,
    pub trigger_id_offset: i64,
    pub bus_id_offset: i64,
    pub event_number_offset: i64,
    pub frame_counter_offset: i64,
    pub encoder_position_offset: i64,
    pub exposure_duration_offset: i64,
    pub gate_number_offset: i64,
}

impl Default for CalibrationRegisters {
    /// Register set of a sensor in its factory mode: distance `raw/100 - 50`,
    /// lateral `raw/50 - 20`, microsecond ticks, 64-byte footer
    fn default() -> Self {
        Self {
            c_scale_numerator: 1,
            c_scale_denominator: 100,
            c_offset_numerator: -50,
            c_offset_denominator: 1,
            a_scale_numerator: 1,
            a_scale_denominator: 50,
            a_offset_numerator: -20,
            a_offset_denominator: 1,
            invalid_value: i16::MIN as i64,
            tick_frequency_hz: 1_000_000,
            timestamp_offset: 0,
            trigger_id_offset: 16,
            bus_id_offset: 14,
            event_number_offset: 8,
            frame_counter_offset: 12,
            encoder_position_offset: 20,
            exposure_duration_offset: 24,
            gate_number_offset: 32,
        }
    }
}

impl CalibrationRegisters {
    fn rationals(&self) -> [(&'static str, i64); 8] {
        [
            ("c_scale_numerator", self.c_scale_numerator),
            ("c_scale_denominator", self.c_scale_denominator),
            ("c_offset_numerator", self.c_offset_numerator),
            ("c_offset_denominator", self.c_offset_denominator),
            ("a_scale_numerator", self.a_scale_numerator),
            ("a_scale_denominator", self.a_scale_denominator),
            ("a_offset_numerator", self.a_offset_numerator),
            ("a_offset_denominator", self.a_offset_denominator),
        ]
    }
}

/// Integer fraction as stored in the sensor registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub numerator: i32,
    pub denominator: i32,
}

impl Rational {
    pub fn new(numerator: i32, denominator: i32) -> Result<Self> {
        if denominator == 0 {
            return Err(PipelineError::config(format!(
                "zero denominator in rational {}/{}",
                numerator, denominator
            )));
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    pub fn value(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }
}

/// Byte offsets of the metadata fields, relative to the start of the footer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FooterOffsets {
    pub timestamp: usize,
    pub trigger_id: usize,
    pub bus_id: usize,
    pub event_number: usize,
    pub frame_counter: usize,
    pub encoder_position: usize,
    pub exposure_duration: usize,
    pub gate_number: usize,
}

impl FooterOffsets {
    /// Check every field against the footer length
    pub fn validate(&self, footer_len: usize) -> Result<()> {
        let fields = [
            ("timestamp", self.timestamp, footer_width::TIMESTAMP),
            ("trigger_id", self.trigger_id, footer_width::TRIGGER_ID),
            ("bus_id", self.bus_id, footer_width::BUS_ID),
            ("event_number", self.event_number, footer_width::EVENT_NUMBER),
            ("frame_counter", self.frame_counter, footer_width::FRAME_COUNTER),
            ("encoder_position", self.encoder_position, footer_width::ENCODER_POSITION),
            ("exposure_duration", self.exposure_duration, footer_width::EXPOSURE_DURATION),
            ("gate_number", self.gate_number, footer_width::GATE_NUMBER),
        ];
        for (name, offset, width) in fields {
            if offset + width > footer_len {
                return Err(PipelineError::config(format!(
                    "footer field '{}' at byte {} (+{}) exceeds footer length {}",
                    name, offset, width, footer_len
                )));
            }
        }
        Ok(())
    }
}

/// Immutable per-session transform constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParams {
    pub c_scale: Rational,
    pub c_offset: Rational,
    pub a_scale: Rational,
    pub a_offset: Rational,
    /// Raw sample value marking a position without a measurement
    pub invalid: i16,
    pub tick_frequency_hz: u64,
    pub footer: FooterOffsets,
    /// Registers that had to be narrowed when the params were built
    #[serde(default)]
    pub corrected_registers: Vec<String>,
}

impl CalibrationParams {
    /// Build validated params from raw registers.
    ///
    /// Rational registers outside the `i32` range are reinterpreted as the
    /// signed value of their low 32 bits, and an invalid sentinel outside the
    /// `i16` range as the signed value of its low 16 bits. The corrected
    /// register names are kept in `corrected_registers` for the caller to report.
    pub fn from_registers(registers: &CalibrationRegisters, footer_len: usize) -> Result<Self> {
        let mut corrected = Vec::new();
        let mut narrowed = [0i32; 8];
        for (slot, (name, raw)) in narrowed.iter_mut().zip(registers.rationals()) {
            *slot = match i32::try_from(raw) {
                Ok(value) => value,
                Err(_) => {
                    corrected.push(name.to_string());
                    narrow_to_i32(raw)
                }
            };
        }

        let invalid = match i16::try_from(registers.invalid_value) {
            Ok(value) => value,
            Err(_) => {
                corrected.push("invalid_value".to_string());
                registers.invalid_value as u16 as i16
            }
        };

        let tick_frequency_hz = u64::try_from(registers.tick_frequency_hz)
            .ok()
            .filter(|hz| *hz > 0)
            .ok_or_else(|| {
                PipelineError::config(format!(
                    "timestamp tick frequency must be positive, got {}",
                    registers.tick_frequency_hz
                ))
            })?;

        let footer = FooterOffsets {
            timestamp: offset("timestamp_offset", registers.timestamp_offset)?,
            trigger_id: offset("trigger_id_offset", registers.trigger_id_offset)?,
            bus_id: offset("bus_id_offset", registers.bus_id_offset)?,
            event_number: offset("event_number_offset", registers.event_number_offset)?,
            frame_counter: offset("frame_counter_offset", registers.frame_counter_offset)?,
            encoder_position: offset("encoder_position_offset", registers.encoder_position_offset)?,
            exposure_duration: offset("exposure_duration_offset", registers.exposure_duration_offset)?,
            gate_number: offset("gate_number_offset", registers.gate_number_offset)?,
        };
        footer.validate(footer_len)?;

        let params = Self {
            c_scale: Rational::new(narrowed[0], narrowed[1])?,
            c_offset: Rational::new(narrowed[2], narrowed[3])?,
            a_scale: Rational::new(narrowed[4], narrowed[5])?,
            a_offset: Rational::new(narrowed[6], narrowed[7])?,
            invalid,
            tick_frequency_hz,
            footer,
            corrected_registers: corrected,
        };

        debug!(
            "Calibration: C = {}*raw + {}, A = {}*raw + {}, invalid = {}, tick = {} Hz",
            params.c_scale.value(),
            params.c_offset.value(),
            params.a_scale.value(),
            params.a_offset.value(),
            params.invalid,
            params.tick_frequency_hz
        );

        Ok(params)
    }

    /// Whether any register needed the narrowing correction
    pub fn was_corrected(&self) -> bool {
        !self.corrected_registers.is_empty()
    }
}

/// Signed value of the low 32 bits
fn narrow_to_i32(raw: i64) -> i32 {
    raw as u64 as u32 as i32
}

fn offset(name: &str, raw: i64) -> Result<usize> {
    usize::try_from(raw)
        .map_err(|_| PipelineError::config(format!("footer offset '{}' is negative: {}", name, raw)))
}
