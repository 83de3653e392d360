//! Scan task and debouncing.
//!
//! The scan task is the latency-critical loop on the scan core:
//!
//! ```text
//! poll reader ──► debounce ──► ScanEvent ──► network queue ──► wait outcome ──► feedback
//!                                   │ queue full
//!                                   └──────► event buffer (direct)
//! ```
//!
//! A read error never fabricates an event; the next poll simply tries again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bus::BusLock;
use crate::clock::SyncClock;
use crate::config::TimingConfig;
use crate::display::DisplayMessage;
use crate::error::{Result, TapinError};
use crate::link::ScanFaults;
use crate::storage::{PushOutcome, SharedBuffer};
use crate::types::{EventOutcome, ScanEvent, TagId};
use crate::watchdog::WatchdogToken;

/// A raw read from the card reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRead {
    /// Tag identifier as decoded by the reader.
    pub tag: String,
    /// Signal strength in dBm.
    pub rssi: i16,
}

/// The card reader peripheral.
pub trait CardReader: Send + 'static {
    /// Check for a presented badge.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus transfer fails; the caller retries on
    /// the next poll.
    fn poll(&mut self) -> Result<Option<TagRead>>;
}

/// Audible and visual cues (LED, buzzer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    /// A badge was accepted and is being processed.
    BeginScan,
    /// The backend acknowledged the scan.
    Success,
    /// The scan is held for later delivery.
    Buffered,
    /// The scan could be neither delivered nor held.
    Failure,
    /// The device hit an internal error (e.g. queue full).
    Error,
}

/// Drives the LED and buzzer.
pub trait Feedback: Send + 'static {
    /// Emit `cue`. Must not block.
    fn signal(&mut self, cue: Cue);
}

/// Discards an identical tag seen again within the window.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    last: Option<(TagId, Instant)>,
}

impl Debouncer {
    /// Debounce with `window`.
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Returns `true` if `tag` read at `now` should become an event.
    pub fn accept(&mut self, tag: &TagId, now: Instant) -> bool {
        if let Some((last_tag, at)) = &self.last {
            if last_tag == tag && now.saturating_duration_since(*at) < self.window {
                return false;
            }
        }
        self.last = Some((tag.clone(), now));
        true
    }
}

/// What one [`ScanTask::poll_once`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStep {
    /// No badge present, or the reader errored.
    Idle,
    /// A repeat read inside the debounce window.
    Debounced,
    /// An event was handed off; the cue reflects its terminal state.
    Completed(Cue),
}

/// Polls the reader and hands debounced events to the network task.
pub struct ScanTask<R, F> {
    reader: BusLock<R>,
    feedback: F,
    debouncer: Debouncer,
    clock: SyncClock,
    events: mpsc::Sender<ScanEvent>,
    outcomes: mpsc::Receiver<EventOutcome>,
    display: mpsc::Sender<DisplayMessage>,
    buffer: SharedBuffer,
    faults: Arc<ScanFaults>,
    watchdog: WatchdogToken,
    timing: TimingConfig,
    next_seq: u64,
}

impl<R: CardReader, F: Feedback> ScanTask<R, F> {
    /// Create the task.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reader: R,
        feedback: F,
        clock: SyncClock,
        events: mpsc::Sender<ScanEvent>,
        outcomes: mpsc::Receiver<EventOutcome>,
        display: mpsc::Sender<DisplayMessage>,
        buffer: SharedBuffer,
        faults: Arc<ScanFaults>,
        watchdog: WatchdogToken,
        timing: TimingConfig,
    ) -> Self {
        Self {
            reader: BusLock::new("reader", reader),
            feedback,
            debouncer: Debouncer::new(timing.debounce()),
            clock,
            events,
            outcomes,
            display,
            buffer,
            faults,
            watchdog,
            timing,
            next_seq: 1,
        }
    }

    /// Poll forever at the configured interval.
    pub async fn run(mut self) {
        info!(interval = ?self.timing.poll_interval(), "scan task started");
        loop {
            self.poll_once().await;
            tokio::time::sleep(self.timing.poll_interval()).await;
        }
    }

    /// One poll of the reader and, for an accepted badge, the full round trip.
    pub async fn poll_once(&mut self) -> ScanStep {
        self.watchdog.checkpoint();

        let read = match self.reader.acquire(self.timing.lock_timeout()).await {
            Ok(mut reader) => reader.poll(),
            Err(e) => Err(e),
        };
        let read = match read {
            Ok(Some(read)) => read,
            Ok(None) => return ScanStep::Idle,
            Err(e) => {
                debug!(error = %e, "reader poll failed");
                return ScanStep::Idle;
            }
        };

        if !TagId::fits(&read.tag) {
            warn!(tag = %read.tag, "tag longer than {} bytes, truncating", TagId::CAPACITY);
        }
        let tag = TagId::truncated(&read.tag);
        if !self.debouncer.accept(&tag, Instant::now()) {
            debug!(%tag, "debounced repeat read");
            return ScanStep::Debounced;
        }

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        let event = ScanEvent {
            tag,
            timestamp: self.clock.iso_now(),
            rssi: read.rssi,
            seq,
        };
        info!(tag = %event.tag, rssi = event.rssi, seq, "badge accepted");
        self.feedback.signal(Cue::BeginScan);
        self.announce(DisplayMessage::Scanning);

        let cue = self.hand_off(event).await;
        self.feedback.signal(cue);
        ScanStep::Completed(cue)
    }

    async fn hand_off(&mut self, event: ScanEvent) -> Cue {
        let seq = event.seq;
        match self
            .events
            .send_timeout(event, self.timing.queue_send_timeout())
            .await
        {
            Ok(()) => self.await_outcome(seq).await,
            Err(SendTimeoutError::Timeout(event) | SendTimeoutError::Closed(event)) => {
                warn!(tag = %event.tag, "network queue unavailable, buffering directly");
                self.buffer_directly(&event).await
            }
        }
    }

    /// Wait for the outcome of event `seq`. Late outcomes for earlier
    /// events that already timed out are discarded.
    async fn await_outcome(&mut self, seq: u64) -> Cue {
        let deadline = Instant::now() + self.timing.outcome_timeout();
        loop {
            match tokio::time::timeout_at(deadline, self.outcomes.recv()).await {
                Ok(Some(outcome)) if outcome.seq != seq => {
                    debug!(stale = outcome.seq, seq, "discarding late outcome");
                }
                Ok(Some(outcome)) if outcome.success => return Cue::Success,
                Ok(Some(outcome)) if outcome.buffered => return Cue::Buffered,
                Ok(Some(_)) => return Cue::Failure,
                Ok(None) => {
                    error!("outcome queue closed");
                    return Cue::Failure;
                }
                // The network task still owns the event and keeps it durable.
                Err(_) => {
                    debug!(seq, "no outcome before timeout, treating as buffered");
                    return Cue::Buffered;
                }
            }
        }
    }

    async fn buffer_directly(&mut self, event: &ScanEvent) -> Cue {
        self.feedback.signal(Cue::Error);

        let pushed = match self.buffer.acquire(self.timing.lock_timeout()).await {
            Ok(mut buffer) => buffer.push(event).map_err(TapinError::from),
            Err(e) => Err(e),
        };
        match pushed {
            Ok(outcome @ (PushOutcome::Stored(_) | PushOutcome::StoredEvictingOldest { .. })) => {
                if outcome.overflowed() {
                    warn!(tag = %event.tag, "buffer full, oldest event evicted");
                    self.faults.record_overflow();
                }
                self.announce(DisplayMessage::Buffered);
                Cue::Buffered
            }
            Ok(PushOutcome::Rejected) => {
                error!(tag = %event.tag, "buffer full, scan lost");
                self.faults.record_overflow();
                self.announce(DisplayMessage::error("Buffer full"));
                Cue::Failure
            }
            Err(e) => {
                error!(tag = %event.tag, error = %e, "direct buffering failed, scan lost");
                if e.is_storage_error() {
                    self.faults.record_storage_error();
                }
                self.announce(DisplayMessage::error("Storage error"));
                Cue::Failure
            }
        }
    }

    fn announce(&self, message: DisplayMessage) {
        if self.display.try_send(message).is_err() {
            debug!("display queue full, dropping announcement");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OverflowPolicy, WatchdogConfig};
    use crate::link::link_state;
    use crate::storage::EventBuffer;
    use crate::types::EventKind;
    use crate::watchdog::Watchdog;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    struct QueuedReader(VecDeque<Result<Option<TagRead>>>);

    impl CardReader for QueuedReader {
        fn poll(&mut self) -> Result<Option<TagRead>> {
            self.0.pop_front().unwrap_or(Ok(None))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingFeedback(Arc<Mutex<Vec<Cue>>>);

    impl Feedback for RecordingFeedback {
        fn signal(&mut self, cue: Cue) {
            self.0.lock().unwrap().push(cue);
        }
    }

    fn read(tag: &str) -> Result<Option<TagRead>> {
        Ok(Some(TagRead {
            tag: tag.to_string(),
            rssi: -50,
        }))
    }

    struct Harness {
        task: ScanTask<QueuedReader, RecordingFeedback>,
        feedback: RecordingFeedback,
        events: mpsc::Receiver<ScanEvent>,
        outcomes: mpsc::Sender<EventOutcome>,
        buffer: SharedBuffer,
        faults: Arc<ScanFaults>,
        dir: tempfile::TempDir,
    }

    fn harness(reads: Vec<Result<Option<TagRead>>>, queue_capacity: usize) -> Harness {
        harness_with(reads, queue_capacity, 10)
    }

    fn harness_with(
        reads: Vec<Result<Option<TagRead>>>,
        queue_capacity: usize,
        buffer_capacity: usize,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let buffer = EventBuffer::open(dir.path(), buffer_capacity, OverflowPolicy::DropNewest)
            .unwrap()
            .shared();
        let faults = Arc::new(ScanFaults::default());
        let (event_tx, event_rx) = mpsc::channel(queue_capacity);
        let (outcome_tx, outcome_rx) = mpsc::channel(4);
        let (display_tx, _display_rx) = mpsc::channel(4);
        let feedback = RecordingFeedback::default();
        let mut watchdog = Watchdog::new(&WatchdogConfig::default());
        let task = ScanTask::new(
            QueuedReader(reads.into()),
            feedback.clone(),
            SyncClock::new(),
            event_tx,
            outcome_rx,
            display_tx,
            Arc::clone(&buffer),
            Arc::clone(&faults),
            watchdog.register("scan"),
            TimingConfig {
                outcome_timeout_ms: 1_000,
                ..TimingConfig::default()
            },
        );
        Harness {
            task,
            feedback,
            events: event_rx,
            outcomes: outcome_tx,
            buffer,
            faults,
            dir,
        }
    }

    #[test]
    fn test_debounce_window() {
        let mut debouncer = Debouncer::new(Duration::from_secs(3));
        let t0 = Instant::now();
        let a = TagId::truncated("A");
        let b = TagId::truncated("B");

        assert!(debouncer.accept(&a, t0));
        assert!(!debouncer.accept(&a, t0 + Duration::from_secs(2)));
        assert!(debouncer.accept(&a, t0 + Duration::from_secs(3)));
        assert!(debouncer.accept(&b, t0 + Duration::from_secs(3)));
        assert!(debouncer.accept(&a, t0 + Duration::from_secs(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_reads_within_window_produce_one_event() {
        let mut h = harness(vec![read("04AA"), read("04AA")], 4);

        assert_eq!(h.task.poll_once().await, ScanStep::Completed(Cue::Buffered));
        assert_eq!(h.task.poll_once().await, ScanStep::Debounced);
        assert_eq!(h.events.recv().await.unwrap().tag, "04AA");
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_reads_spanning_window_produce_two_events() {
        let mut h = harness(vec![read("04AA"), read("04AA")], 4);

        h.task.poll_once().await;
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        // 1s outcome wait + 2.1s sleep puts the second read past the window.
        assert!(matches!(h.task.poll_once().await, ScanStep::Completed(_)));
        assert_eq!(h.events.recv().await.unwrap().tag, "04AA");
        assert_eq!(h.events.recv().await.unwrap().tag, "04AA");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivered_outcome_signals_success() {
        let h = harness(vec![read("04CC")], 4);
        let Harness {
            mut task,
            feedback,
            mut events,
            outcomes,
            ..
        } = h;
        tokio::spawn(async move {
            let event = events.recv().await.unwrap();
            assert_eq!(event.tag, "04CC");
            outcomes
                .send(EventOutcome::delivered(event.seq, "Ada", EventKind::Entry))
                .await
                .unwrap();
        });

        assert_eq!(task.poll_once().await, ScanStep::Completed(Cue::Success));
        assert_eq!(*feedback.0.lock().unwrap(), [Cue::BeginScan, Cue::Success]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcome_timeout_counts_as_buffered() {
        let mut h = harness(vec![read("04BB")], 4);
        assert_eq!(h.task.poll_once().await, ScanStep::Completed(Cue::Buffered));
        assert_eq!(
            *h.feedback.0.lock().unwrap(),
            [Cue::BeginScan, Cue::Buffered]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_buffers_directly() {
        let mut h = harness(vec![read("A"), read("B")], 1);
        // First event fills the single-slot queue; nobody drains it.
        assert_eq!(h.task.poll_once().await, ScanStep::Completed(Cue::Buffered));
        assert_eq!(h.task.poll_once().await, ScanStep::Completed(Cue::Buffered));

        let buffer = h.buffer.acquire(Duration::from_millis(10)).await.unwrap();
        let held = buffer.oldest(10);
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].event.tag, "B");
        assert!(h.feedback.0.lock().unwrap().contains(&Cue::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_outcome_is_not_attributed_to_next_scan() {
        let mut h = harness(vec![read("A"), read("B")], 4);
        assert_eq!(h.task.poll_once().await, ScanStep::Completed(Cue::Buffered));
        let first = h.events.recv().await.unwrap();

        // A's answer shows up only after its wait gave up, just ahead of B's.
        h.outcomes
            .send(EventOutcome::delivered(first.seq, "Ada", EventKind::Entry))
            .await
            .unwrap();
        h.outcomes
            .send(EventOutcome::failed(first.seq + 1))
            .await
            .unwrap();

        assert_eq!(h.task.poll_once().await, ScanStep::Completed(Cue::Failure));
        assert_eq!(h.events.recv().await.unwrap().seq, first.seq + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_buffer_overflow_is_recorded() {
        let mut h = harness_with(vec![read("A"), read("B"), read("C")], 1, 1);
        // A fills the queue, B fills the buffer, C has nowhere to go.
        assert_eq!(h.task.poll_once().await, ScanStep::Completed(Cue::Buffered));
        assert_eq!(h.task.poll_once().await, ScanStep::Completed(Cue::Buffered));
        assert_eq!(h.task.poll_once().await, ScanStep::Completed(Cue::Failure));

        let (writer, link) = link_state();
        writer.absorb(&h.faults);
        let counters = link.snapshot().counters;
        assert_eq!(counters.buffer_overflows, 1);
        assert_eq!(counters.storage_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_buffer_write_failure_is_recorded() {
        let mut h = harness(vec![read("A"), read("B")], 1);
        assert_eq!(h.task.poll_once().await, ScanStep::Completed(Cue::Buffered));
        let dir = h.dir.path().to_path_buf();
        std::fs::remove_dir_all(&dir).unwrap();
        std::fs::write(&dir, b"").unwrap();

        assert_eq!(h.task.poll_once().await, ScanStep::Completed(Cue::Failure));
        let (writer, link) = link_state();
        writer.absorb(&h.faults);
        assert_eq!(link.snapshot().counters.storage_errors, 1);
        std::fs::remove_file(&dir).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_tag_is_truncated() {
        let long = "F".repeat(40);
        let mut h = harness(vec![Ok(Some(TagRead { tag: long, rssi: -50 }))], 4);
        h.task.poll_once().await;
        assert_eq!(h.events.recv().await.unwrap().tag.len(), TagId::CAPACITY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_error_fabricates_nothing() {
        let mut h = harness(
            vec![Err(TapinError::ReaderFault("crc".into())), Ok(None)],
            4,
        );
        assert_eq!(h.task.poll_once().await, ScanStep::Idle);
        assert_eq!(h.task.poll_once().await, ScanStep::Idle);
        assert!(h.events.try_recv().is_err());
        assert!(h.feedback.0.lock().unwrap().is_empty());
    }
}
