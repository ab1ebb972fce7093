/*!
Threshold-driven recording state machine.

The mean distance dips below the threshold before the subject enters the
field of view and again after it leaves. Recording starts on the first frame
back above the threshold and ends with the next dip, which makes a manually
timed capture self-bounding. Without a threshold every frame is recorded.
*/

use serde::{Deserialize, Serialize};
use tracing::info;

/// Recording state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordingState {
    /// Threshold disabled, every frame is recorded
    Inactive = 0,
    /// Waiting for the mean to drop below the threshold
    WaitingForThreshold = 1,
    /// Below the threshold, waiting for the subject to appear
    InitialThreshold = 2,
    /// Subject in view, frames are recorded
    Recording = 3,
    /// Subject left the view, the session finishes
    FinalThreshold = 4,
}

impl RecordingState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Inactive),
            1 => Some(Self::WaitingForThreshold),
            2 => Some(Self::InitialThreshold),
            3 => Some(Self::Recording),
            4 => Some(Self::FinalThreshold),
            _ => None,
        }
    }

    /// Whether frames observed in this state are stored
    pub fn admits(self) -> bool {
        matches!(self, Self::Inactive | Self::Recording | Self::FinalThreshold)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::FinalThreshold)
    }
}

/// Decision for one observed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Drop the frame
    Skip,
    /// Store the frame
    Admit,
    /// Store the frame, flush what is pending and end the session
    AdmitAndFinish,
}

/// Per-session recording state machine
#[derive(Debug, Clone)]
pub struct RecordingStateMachine {
    threshold: Option<f64>,
    state: RecordingState,
}

impl RecordingStateMachine {
    pub fn new(threshold: Option<f32>) -> Self {
        Self {
            threshold: threshold.map(f64::from),
            state: if threshold.is_some() {
                RecordingState::WaitingForThreshold
            } else {
                RecordingState::Inactive
            },
        }
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn threshold(&self) -> Option<f64> {
        self.threshold
    }

    /// Feed the mean distance of one frame. A NaN mean causes no transition.
    pub fn observe(&mut self, mean: f64) -> Admission {
        if let Some(threshold) = self.threshold {
            let below = mean < threshold;
            let at_or_above = mean >= threshold;
            match self.state {
                RecordingState::WaitingForThreshold if below => {
                    info!("Entered initial threshold with mean {:.3} < {}", mean, threshold);
                    self.state = RecordingState::InitialThreshold;
                }
                RecordingState::InitialThreshold if at_or_above => {
                    info!("Entered recording stage with mean {:.3} >= {}", mean, threshold);
                    self.state = RecordingState::Recording;
                }
                RecordingState::Recording if below => {
                    info!("Entered final threshold with mean {:.3} < {}", mean, threshold);
                    self.state = RecordingState::FinalThreshold;
                }
                _ => {}
            }
        }

        match self.state {
            RecordingState::FinalThreshold => Admission::AdmitAndFinish,
            state if state.admits() => Admission::Admit,
            _ => Admission::Skip,
        }
    }
}
