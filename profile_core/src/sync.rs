/*!
Alignment of frames from several independently triggered sensors.

Every source has one pending slot. A tuple is released only once all slots
are filled; a frame arriving for a slot that still holds an unconsumed frame
replaces it, and the stale frame is reported as an overrun of that source.
*/

use crate::error::{PipelineError, Result};
use crate::frame::DecodedFrame;
use tracing::{debug, warn};

/// Slot-based synchronizer over `N` sources
#[derive(Debug)]
pub struct MultiSourceSynchronizer<T> {
    slots: Vec<Option<T>>,
    overruns: Vec<u64>,
    tuples: u64,
}

impl<T> MultiSourceSynchronizer<T> {
    pub fn new(sources: usize) -> Result<Self> {
        if sources == 0 {
            return Err(PipelineError::config("synchronizer needs at least one source"));
        }
        Ok(Self {
            slots: (0..sources).map(|_| None).collect(),
            overruns: vec![0; sources],
            tuples: 0,
        })
    }

    pub fn sources(&self) -> usize {
        self.slots.len()
    }

    /// Store the newest frame of `source`. Returns the stale frame it
    /// replaced, which counts as an overrun.
    pub fn offer(&mut self, source: usize, frame: T) -> Result<Option<T>> {
        let slot = self.slots.get_mut(source).ok_or_else(|| {
            PipelineError::config(format!("source index {} out of range", source))
        })?;
        let stale = slot.replace(frame);
        if stale.is_some() {
            self.overruns[source] += 1;
            warn!(
                "⚠️ Source {} overrun: pending frame replaced before the tuple completed ({} total)",
                source, self.overruns[source]
            );
        }
        Ok(stale)
    }

    /// Whether `source` has a frame waiting for its tuple
    pub fn has_pending(&self, source: usize) -> bool {
        self.slots.get(source).is_some_and(Option::is_some)
    }

    /// Whether every source has a pending frame
    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Take one frame per source, in source order, once all slots are filled
    pub fn take_tuple(&mut self) -> Option<Vec<T>> {
        if !self.is_complete() {
            return None;
        }
        self.tuples += 1;
        debug!("Gathered tuple {} from {} sources", self.tuples, self.slots.len());
        self.slots.iter_mut().map(Option::take).collect()
    }

    /// Empty every slot, returning the pending frames with their source index
    pub fn clear(&mut self) -> Vec<(usize, T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(source, slot)| slot.take().map(|frame| (source, frame)))
            .collect()
    }

    /// Overruns per source
    pub fn overruns(&self) -> &[u64] {
        &self.overruns
    }

    pub fn total_overruns(&self) -> u64 {
        self.overruns.iter().sum()
    }

    pub fn tuples(&self) -> u64 {
        self.tuples
    }
}

/// Whether all members of a tuple carry the same footer event number
pub fn events_agree(frames: &[DecodedFrame]) -> bool {
    frames
        .windows(2)
        .all(|pair| pair[0].footer.event_number == pair[1].footer.event_number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FooterData;

    #[test]
    fn test_tuple_only_when_all_slots_filled() {
        let mut sync = MultiSourceSynchronizer::new(3).unwrap();
        assert!(sync.offer(0, "a0").unwrap().is_none());
        assert!(sync.offer(2, "c0").unwrap().is_none());
        assert!(sync.take_tuple().is_none());

        assert!(sync.offer(1, "b0").unwrap().is_none());
        assert_eq!(sync.take_tuple(), Some(vec!["a0", "b0", "c0"]));
        assert!(sync.take_tuple().is_none());
        assert_eq!(sync.tuples(), 1);
    }

    #[test]
    fn test_second_frame_for_pending_slot_is_overrun() {
        let mut sync = MultiSourceSynchronizer::new(2).unwrap();
        sync.offer(0, 1).unwrap();
        assert_eq!(sync.offer(0, 2).unwrap(), Some(1));
        assert_eq!(sync.overruns(), &[1, 0]);

        sync.offer(1, 10).unwrap();
        assert_eq!(sync.take_tuple(), Some(vec![2, 10]));
        assert_eq!(sync.total_overruns(), 1);
    }

    #[test]
    fn test_out_of_range_source_rejected() {
        let mut sync = MultiSourceSynchronizer::new(2).unwrap();
        assert!(sync.offer(2, ()).is_err());
        assert!(MultiSourceSynchronizer::<()>::new(0).is_err());
    }

    #[test]
    fn test_clear_returns_pending() {
        let mut sync = MultiSourceSynchronizer::new(3).unwrap();
        sync.offer(1, 'b').unwrap();
        assert!(sync.has_pending(1));
        assert!(!sync.has_pending(0));
        assert_eq!(sync.clear(), vec![(1, 'b')]);
        assert!(!sync.has_pending(1));
        assert!(!sync.is_complete());
    }

    #[test]
    fn test_event_agreement() {
        let frame = |event_number| DecodedFrame {
            c: vec![],
            a: vec![],
            intensity: vec![],
            timestamp: 0.0,
            footer: FooterData {
                event_number,
                ..FooterData::default()
            },
        };
        assert!(events_agree(&[frame(5), frame(5)]));
        assert!(!events_agree(&[frame(5), frame(6)]));
        assert!(events_agree(&[frame(1)]));
    }
}
