/*!
Acquisition and consumer loops.

Each frame source is driven by its own acquisition thread, which is the only
thread that ever touches the source. Frames travel to the consumer through a
[`BufferQueue`] and come back over a recycle channel once their values were
copied out, so the acquisition thread can release them to the source.

The consumer decodes, gates frames through the recording state machine,
batches admitted rows and appends full chunks to storage. It never blocks the
producers: when it falls behind, the queue evicts the oldest frames.
*/

use crate::chunk::ChunkAccumulator;
use crate::decoder::FrameDecoder;
use crate::error::Result;
use crate::frame::{DecodedFrame, RawFrame};
use crate::protocol::RATE_REPORT_INTERVAL;
use crate::queue::BufferQueue;
use crate::recording::{Admission, RecordingState, RecordingStateMachine};
use crate::source::{FrameSource, RawDumpWriter};
use crate::stats::SessionStats;
use crate::storage::StorageWriter;
use crate::sync::{events_agree, MultiSourceSynchronizer};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Which acquisition threads are still pulling frames
#[derive(Debug)]
pub struct SourceActivity {
    acquiring: Vec<AtomicBool>,
}

impl SourceActivity {
    pub fn new(sources: usize) -> Self {
        Self {
            acquiring: (0..sources).map(|_| AtomicBool::new(true)).collect(),
        }
    }

    /// Mark a source as no longer delivering frames
    pub fn finish(&self, index: usize) {
        if let Some(flag) = self.acquiring.get(index) {
            flag.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_acquiring(&self, index: usize) -> bool {
        self.acquiring
            .get(index)
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    pub fn any_acquiring(&self) -> bool {
        self.acquiring.iter().any(|flag| flag.load(Ordering::SeqCst))
    }
}

/// Drives one frame source
pub struct AcquisitionLoop {
    index: usize,
    source: Box<dyn FrameSource>,
    queue: Arc<BufferQueue<RawFrame>>,
    recycle: Receiver<RawFrame>,
    running: Arc<AtomicBool>,
    activity: Arc<SourceActivity>,
    stats: Arc<SessionStats>,
    poll_interval: Duration,
    raw_dump: Option<RawDumpWriter>,
}

impl AcquisitionLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        source: Box<dyn FrameSource>,
        queue: Arc<BufferQueue<RawFrame>>,
        recycle: Receiver<RawFrame>,
        running: Arc<AtomicBool>,
        activity: Arc<SourceActivity>,
        stats: Arc<SessionStats>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            index,
            source,
            queue,
            recycle,
            running,
            activity,
            stats,
            poll_interval,
            raw_dump: None,
        }
    }

    /// Record every acquired payload to a raw dump
    pub fn with_raw_dump(mut self, dump: RawDumpWriter) -> Self {
        self.raw_dump = Some(dump);
        self
    }

    /// Run until the session stops or the source is exhausted.
    /// Returns the number of frames acquired.
    pub fn run(mut self) -> Result<u64> {
        let result = self.acquire();
        self.activity.finish(self.index);
        if let Err(err) = &result {
            error!("❌ Acquisition of source {} failed: {}", self.index, err);
            self.running.store(false, Ordering::SeqCst);
        }

        // The consumer hangs up once it is done; until then it keeps
        // returning frames that have to go back to the source.
        for frame in self.recycle.iter() {
            self.source.release(frame);
        }
        for frame in self.queue.drain() {
            self.source.release(frame);
        }

        let stopped = self.source.stop();
        let dumped = self.raw_dump.take().map(RawDumpWriter::finish).transpose();
        let frames = result?;
        stopped?;
        dumped?;
        Ok(frames)
    }

    fn acquire(&mut self) -> Result<u64> {
        self.source.start()?;
        info!("📡 Acquisition thread for source {} started", self.index);

        let mut frames = 0u64;
        let mut window_start = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            while let Ok(frame) = self.recycle.try_recv() {
                self.source.release(frame);
            }

            let Some(frame) = self.source.acquire_if_available()? else {
                if self.source.is_exhausted() {
                    info!("Source {} has no more frames", self.index);
                    break;
                }
                thread::sleep(self.poll_interval);
                continue;
            };

            if let Some(dump) = self.raw_dump.as_mut() {
                dump.write(&frame.data)?;
            }
            frames += 1;
            self.stats.record_acquired();

            if let Some(evicted) = self.queue.push(frame) {
                self.stats.record_queue_overrun();
                warn!(
                    "⚠️ Source {} overrun: consumer behind, dropped oldest queued frame (slot {})",
                    self.index, evicted.slot
                );
                self.source.release(evicted);
            }

            if frames % RATE_REPORT_INTERVAL == 0 {
                let elapsed = window_start.elapsed().as_secs_f64();
                info!(
                    "📊 Source {}: {} frames, {:.1} fps, {} queued",
                    self.index,
                    frames,
                    RATE_REPORT_INTERVAL as f64 / elapsed.max(f64::EPSILON),
                    self.queue.len()
                );
                window_start = Instant::now();
            }
        }

        info!("📡 Acquisition thread for source {} stopped after {} frames", self.index, frames);
        Ok(frames)
    }
}

/// Per-source processing state of the consumer
pub struct Lane {
    decoder: FrameDecoder,
    accumulator: ChunkAccumulator,
    machine: RecordingStateMachine,
    finished: bool,
}

impl Lane {
    pub fn new(decoder: FrameDecoder, accumulator: ChunkAccumulator, machine: RecordingStateMachine) -> Self {
        Self {
            decoder,
            accumulator,
            machine,
            finished: false,
        }
    }
}

/// What the consumer did during a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerReport {
    pub root: String,
    pub chunks_flushed: u64,
    pub rows_written: u64,
    pub final_state: RecordingState,
    /// Synchronizer overruns per source; empty without synchronization
    pub sync_overruns: Vec<u64>,
}

/// Decodes, gates, batches and stores frames of all sources
pub struct ConsumerLoop {
    lanes: Vec<Lane>,
    queues: Vec<Arc<BufferQueue<RawFrame>>>,
    recycle: Vec<Sender<RawFrame>>,
    writer: StorageWriter,
    sync: Option<MultiSourceSynchronizer<RawFrame>>,
    running: Arc<AtomicBool>,
    activity: Arc<SourceActivity>,
    stats: Arc<SessionStats>,
    poll_interval: Duration,
    drain_on_stop: bool,
}

impl ConsumerLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lanes: Vec<Lane>,
        queues: Vec<Arc<BufferQueue<RawFrame>>>,
        recycle: Vec<Sender<RawFrame>>,
        writer: StorageWriter,
        sync: Option<MultiSourceSynchronizer<RawFrame>>,
        running: Arc<AtomicBool>,
        activity: Arc<SourceActivity>,
        stats: Arc<SessionStats>,
        poll_interval: Duration,
        drain_on_stop: bool,
    ) -> Self {
        Self {
            lanes,
            queues,
            recycle,
            writer,
            sync,
            running,
            activity,
            stats,
            poll_interval,
            drain_on_stop,
        }
    }

    /// Run until the recording finishes, the session stops or every source is
    /// exhausted. Storage is closed on the way out in every case, and dropping
    /// the loop hangs up the recycle channels.
    pub fn run(mut self) -> Result<ConsumerReport> {
        info!("⚙️ Consumer thread started for {} source(s)", self.lanes.len());
        let result = self.consume();
        self.running.store(false, Ordering::SeqCst);

        let pending = self.sync.as_mut().map(|sync| sync.clear()).unwrap_or_default();
        for (index, frame) in pending {
            debug!("Returning unmatched frame of source {}", index);
            self.release(index, frame);
        }

        let closed = self.writer.close();
        if let Err(err) = &result {
            error!("❌ Consumer stopped on error: {}", err);
        }
        result?;
        closed?;

        Ok(ConsumerReport {
            root: self.writer.root().to_string(),
            chunks_flushed: self.writer.chunks_flushed(),
            rows_written: self.writer.rows_written(),
            final_state: self.lanes[0].machine.state(),
            sync_overruns: self
                .sync
                .as_ref()
                .map(|sync| sync.overruns().to_vec())
                .unwrap_or_default(),
        })
    }

    fn consume(&mut self) -> Result<()> {
        loop {
            if self.all_finished() {
                info!("🏁 Recording complete, stopping session");
                return Ok(());
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if !self.poll_once()? {
                if self.sources_done() {
                    info!("All sources exhausted");
                    return self.flush_remaining();
                }
                if !self.tuples_possible() {
                    info!("A synchronized source is exhausted, no further tuple can form");
                    return self.flush_remaining();
                }
                thread::sleep(self.poll_interval);
            }
        }

        if self.drain_on_stop {
            let mut drained = 0u64;
            loop {
                if self.all_finished() {
                    return Ok(());
                }
                if self.poll_once()? {
                    drained += 1;
                } else if self.sources_done() || !self.tuples_possible() {
                    break;
                } else {
                    thread::yield_now();
                }
            }
            info!("Drained queued frames in {} polls after stop", drained);
        }
        self.flush_remaining()
    }

    fn all_finished(&self) -> bool {
        self.lanes.iter().all(|lane| lane.finished)
    }

    fn sources_done(&self) -> bool {
        !self.activity.any_acquiring() && self.queues.iter().all(|q| q.is_empty())
    }

    /// Whether a synchronized tuple can still form: every source must either
    /// hold a pending frame or be able to deliver another one.
    fn tuples_possible(&self) -> bool {
        let Some(sync) = &self.sync else {
            return true;
        };
        (0..self.queues.len()).all(|index| {
            sync.has_pending(index) || self.activity.is_acquiring(index) || !self.queues[index].is_empty()
        })
    }

    /// Pop at most one frame per source. Returns whether any frame was found.
    fn poll_once(&mut self) -> Result<bool> {
        let mut found = false;
        for index in 0..self.queues.len() {
            let Some(frame) = self.queues[index].pop() else {
                self.stats.record_empty_poll();
                continue;
            };
            found = true;
            if self.sync.is_some() {
                self.offer(index, frame)?;
            } else {
                self.process_single(index, frame)?;
            }
        }
        Ok(found)
    }

    fn release(&self, index: usize, frame: RawFrame) {
        if self.recycle[index].send(frame).is_err() {
            debug!("Recycle channel of source {} closed", index);
        }
    }

    /// Decode a frame and hand the buffer straight back to its source
    fn decode(&self, index: usize, frame: RawFrame) -> Option<DecodedFrame> {
        let decoded = self.lanes[index].decoder.decode(&frame.data);
        self.release(index, frame);
        match decoded {
            Ok(decoded) => {
                self.stats.record_decoded();
                Some(decoded)
            }
            Err(err) => {
                self.stats.record_decode_error();
                warn!("⚠️ Dropping frame of source {}: {}", index, err);
                None
            }
        }
    }

    fn process_single(&mut self, index: usize, frame: RawFrame) -> Result<()> {
        if self.lanes[index].finished {
            self.release(index, frame);
            return Ok(());
        }
        let Some(decoded) = self.decode(index, frame) else {
            return Ok(());
        };
        let admission = self.lanes[index].machine.observe(decoded.mean_c());
        if index == 0 {
            self.stats.set_state(self.lanes[0].machine.state());
        }
        self.apply(index, admission, &decoded)
    }

    fn offer(&mut self, index: usize, frame: RawFrame) -> Result<()> {
        let stale = match self.sync.as_mut() {
            Some(sync) => sync.offer(index, frame)?,
            None => return Ok(()),
        };
        if let Some(stale) = stale {
            self.stats.record_sync_overrun();
            self.release(index, stale);
        }
        match self.sync.as_mut().and_then(MultiSourceSynchronizer::take_tuple) {
            Some(tuple) => self.process_tuple(tuple),
            None => Ok(()),
        }
    }

    fn process_tuple(&mut self, tuple: Vec<RawFrame>) -> Result<()> {
        if self.all_finished() {
            for (index, frame) in tuple.into_iter().enumerate() {
                self.release(index, frame);
            }
            return Ok(());
        }

        let mut decoded = Vec::with_capacity(tuple.len());
        for (index, frame) in tuple.into_iter().enumerate() {
            decoded.push(self.decode(index, frame));
        }
        // a tuple with a missing member is dropped as a whole
        let Some(frames) = decoded.into_iter().collect::<Option<Vec<_>>>() else {
            return Ok(());
        };

        if !events_agree(&frames) {
            self.stats.record_event_mismatch();
            let events: Vec<u32> = frames.iter().map(|f| f.footer.event_number).collect();
            warn!("⚠️ Tuple event numbers disagree: {:?}", events);
        }

        // the first sensor gates the whole tuple
        let admission = self.lanes[0].machine.observe(frames[0].mean_c());
        self.stats.set_state(self.lanes[0].machine.state());
        for (index, frame) in frames.iter().enumerate() {
            self.apply(index, admission, frame)?;
        }
        Ok(())
    }

    fn apply(&mut self, index: usize, admission: Admission, frame: &DecodedFrame) -> Result<()> {
        if admission == Admission::Skip {
            self.stats.record_skipped();
            return Ok(());
        }

        self.stats.record_admitted();
        if let Some(chunk) = self.lanes[index].accumulator.admit(frame)? {
            self.writer.flush_source(index, &chunk)?;
            self.stats.record_flush(chunk.filled());
        }

        if admission == Admission::AdmitAndFinish {
            if let Some(chunk) = self.lanes[index].accumulator.take_remaining() {
                self.writer.flush_source(index, &chunk)?;
                self.stats.record_flush(chunk.filled());
            }
            self.lanes[index].finished = true;
            info!("Source {} finished recording", index);
        }
        Ok(())
    }

    fn flush_remaining(&mut self) -> Result<()> {
        for index in 0..self.lanes.len() {
            if let Some(chunk) = self.lanes[index].accumulator.take_remaining() {
                self.writer.flush_source(index, &chunk)?;
                self.stats.record_flush(chunk.filled());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::tests::{decoder, payload};
    use crate::decoder::DecodePolicy;
    use crate::frame::FooterData;
    use crate::source::SyntheticSource;
    use crate::storage::MemoryStore;

    struct Rig {
        consumer: ConsumerLoop,
        queues: Vec<Arc<BufferQueue<RawFrame>>>,
        recycled: Vec<Receiver<RawFrame>>,
        activity: Arc<SourceActivity>,
        stats: Arc<SessionStats>,
        store: MemoryStore,
    }

    /// Consumer over `sources` queues with no acquisition threads behind them
    fn rig(sources: usize, synchronized: bool, running: bool, drain_on_stop: bool) -> Rig {
        let store = MemoryStore::new();
        let stats = Arc::new(SessionStats::default());
        let activity = Arc::new(SourceActivity::new(sources));
        let mut queues = Vec::new();
        let mut senders = Vec::new();
        let mut recycled = Vec::new();
        let mut lanes = Vec::new();
        for _ in 0..sources {
            queues.push(Arc::new(BufferQueue::new(8).unwrap()));
            let (tx, rx) = crossbeam_channel::unbounded();
            senders.push(tx);
            recycled.push(rx);
            lanes.push(Lane::new(
                decoder(DecodePolicy::default()),
                ChunkAccumulator::new(2).unwrap(),
                RecordingStateMachine::new(None),
            ));
        }
        let consumer = ConsumerLoop::new(
            lanes,
            queues.clone(),
            senders,
            StorageWriter::with_root(Box::new(store.clone()), "dump-test", sources),
            synchronized.then(|| MultiSourceSynchronizer::new(sources).unwrap()),
            Arc::new(AtomicBool::new(running)),
            Arc::clone(&activity),
            Arc::clone(&stats),
            Duration::from_millis(1),
            drain_on_stop,
        );
        Rig {
            consumer,
            queues,
            recycled,
            activity,
            stats,
            store,
        }
    }

    fn frame(slot: usize, event_number: u32) -> RawFrame {
        let footer = FooterData {
            event_number,
            ..FooterData::default()
        };
        RawFrame::new(slot, payload(&decoder(DecodePolicy::default()), 2000, &[], footer))
    }

    #[test]
    fn test_overrun_evicts_and_releases_oldest() {
        let queue = Arc::new(BufferQueue::new(2).unwrap());
        let stats = Arc::new(SessionStats::default());
        let (recycle_tx, recycle_rx) = crossbeam_channel::unbounded();
        // no consumer: the recycle channel is already hung up
        drop(recycle_tx);

        let source = SyntheticSource::scripted(vec![1000; 5]).unwrap();
        let acquisition = AcquisitionLoop::new(
            0,
            Box::new(source),
            Arc::clone(&queue),
            recycle_rx,
            Arc::new(AtomicBool::new(true)),
            Arc::new(SourceActivity::new(1)),
            Arc::clone(&stats),
            Duration::from_millis(1),
        );

        assert_eq!(acquisition.run().unwrap(), 5);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_acquired, 5);
        assert_eq!(snapshot.queue_overruns, 3);
        assert_eq!(queue.evictions(), 3);
        // leftovers were handed back to the source on the way out
        assert!(queue.is_empty());
    }

    #[test]
    fn test_stopped_session_acquires_nothing() {
        let queue = Arc::new(BufferQueue::new(4).unwrap());
        let activity = Arc::new(SourceActivity::new(1));
        let (recycle_tx, recycle_rx) = crossbeam_channel::unbounded();
        drop(recycle_tx);

        let acquisition = AcquisitionLoop::new(
            0,
            Box::new(SyntheticSource::scripted(vec![1000; 3]).unwrap()),
            Arc::clone(&queue),
            recycle_rx,
            Arc::new(AtomicBool::new(false)),
            Arc::clone(&activity),
            Arc::new(SessionStats::default()),
            Duration::from_millis(1),
        );

        assert_eq!(acquisition.run().unwrap(), 0);
        assert!(!activity.is_acquiring(0));
        assert_eq!(queue.pushed(), 0);
    }

    #[test]
    fn test_stop_without_drain_leaves_queue_undecoded() {
        let rig = rig(1, false, false, false);
        for slot in 0..3 {
            rig.queues[0].push(frame(slot, slot as u32));
        }
        rig.activity.finish(0);

        let report = rig.consumer.run().unwrap();
        assert_eq!(report.rows_written, 0);
        assert_eq!(rig.stats.snapshot().frames_decoded, 0);
        // the acquisition thread releases what is still queued
        assert_eq!(rig.queues[0].len(), 3);
        assert!(rig.recycled[0].try_recv().is_err());
        assert!(rig.store.is_closed());
    }

    #[test]
    fn test_stop_with_drain_stores_queued_frames() {
        let rig = rig(1, false, false, true);
        for slot in 0..3 {
            rig.queues[0].push(frame(slot, slot as u32));
        }
        rig.activity.finish(0);

        let report = rig.consumer.run().unwrap();
        assert_eq!(report.rows_written, 3);
        assert_eq!(report.chunks_flushed, 2);
        assert_eq!(rig.recycled[0].try_iter().count(), 3);
        assert_eq!(rig.store.rows("dump-test/z"), Some(3));
        assert!(rig.store.is_closed());
    }

    #[test]
    fn test_tuple_event_mismatch_counted_and_stored() {
        let rig = rig(2, true, true, true);
        rig.queues[0].push(frame(0, 5));
        rig.queues[1].push(frame(0, 6));
        rig.activity.finish(0);
        rig.activity.finish(1);

        let report = rig.consumer.run().unwrap();
        assert_eq!(rig.stats.snapshot().event_mismatches, 1);
        assert_eq!(report.sync_overruns, vec![0, 0]);
        assert_eq!(rig.store.rows("dump-test/sensor0/z"), Some(1));
        assert_eq!(rig.store.rows("dump-test/sensor1/z"), Some(1));
    }

    #[test]
    fn test_exhausted_peer_ends_synchronized_consumer() {
        let rig = rig(2, true, true, true);
        rig.queues[0].push(frame(0, 0));
        // source 0 is still acquiring, but its partner will never deliver
        rig.activity.finish(1);

        let report = rig.consumer.run().unwrap();
        assert_eq!(report.rows_written, 0);
        // the frame parked in the synchronizer went back to its source
        assert_eq!(rig.recycled[0].try_iter().count(), 1);
        assert!(rig.recycled[1].try_recv().is_err());
        assert!(rig.store.is_closed());
    }

    #[test]
    fn test_source_activity_flags() {
        let activity = SourceActivity::new(2);
        assert!(activity.is_acquiring(0) && activity.is_acquiring(1));

        activity.finish(1);
        assert!(!activity.is_acquiring(1));
        assert!(activity.any_acquiring());

        activity.finish(0);
        assert!(!activity.any_acquiring());
        assert!(!activity.is_acquiring(5));
    }
}
