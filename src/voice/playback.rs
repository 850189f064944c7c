//! Playback queue
//!
//! Serializes reply audio: segments play strictly in arrival order and only
//! one is handed to the render stage at a time. The queue itself never
//! touches audio hardware; it drives a [`SegmentSink`].

use std::collections::VecDeque;

use crate::{Error, Result};

/// Default upper bound on queued segments
pub const DEFAULT_MAX_QUEUED_SEGMENTS: usize = 512;

/// One decoded block of reply audio
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSegment {
    id: u64,
    samples: Vec<f32>,
}

impl PlaybackSegment {
    /// Create a segment
    #[must_use]
    pub const fn new(id: u64, samples: Vec<f32>) -> Self {
        Self { id, samples }
    }

    /// Arrival id
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Mono f32 samples
    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Split into id and samples
    #[must_use]
    pub fn into_parts(self) -> (u64, Vec<f32>) {
        (self.id, self.samples)
    }
}

/// Destination that starts playing a segment
pub trait SegmentSink {
    /// Begin playing `segment`; completion is reported separately
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if the segment cannot be played
    fn play(&mut self, segment: PlaybackSegment) -> Result<()>;
}

/// FIFO of reply segments with drain detection
///
/// Methods that can end a drain return `true` when the "fetch next turn"
/// action should run. That happens at most once per drain, and only after the
/// service signaled that the current reply is complete.
#[derive(Debug)]
pub struct PlaybackQueue {
    queue: VecDeque<PlaybackSegment>,
    current: Option<u64>,
    turn_done: bool,
    capacity: usize,
    next_id: u64,
    skipped: u64,
}

impl PlaybackQueue {
    /// Create a queue holding at most `capacity` waiting segments
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            current: None,
            turn_done: false,
            capacity: capacity.max(1),
            next_id: 0,
            skipped: 0,
        }
    }

    /// Append a segment; starts playback right away when idle
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if the queue is full; the segment is dropped
    pub fn enqueue(&mut self, samples: Vec<f32>, sink: &mut dyn SegmentSink) -> Result<bool> {
        if self.queue.len() >= self.capacity {
            return Err(Error::Playback(format!(
                "playback queue full ({} segments), dropping segment",
                self.capacity
            )));
        }

        let id = self.next_id;
        self.next_id += 1;
        self.queue.push_back(PlaybackSegment::new(id, samples));
        tracing::trace!(segment = id, queued = self.queue.len(), "segment queued");

        if self.current.is_none() {
            return Ok(self.play_next(sink));
        }
        Ok(false)
    }

    /// Handle the render stage finishing `segment`
    ///
    /// Completions for anything other than the current segment are ignored.
    pub fn finish_current(&mut self, segment: u64, sink: &mut dyn SegmentSink) -> bool {
        if self.current != Some(segment) {
            tracing::debug!(segment, current = ?self.current, "ignoring stale completion");
            return false;
        }

        tracing::trace!(segment, "segment finished");
        self.current = None;
        self.play_next(sink)
    }

    /// Record that the service finished producing the current reply
    pub fn mark_turn_done(&mut self) -> bool {
        if self.is_idle() {
            tracing::debug!("reply complete with empty queue");
            self.turn_done = false;
            return true;
        }
        self.turn_done = true;
        false
    }

    /// Drop everything queued and forget the current segment
    pub fn clear(&mut self) {
        if !self.queue.is_empty() || self.current.is_some() {
            tracing::debug!(dropped = self.queue.len(), "playback queue cleared");
        }
        self.queue.clear();
        self.current = None;
        self.turn_done = false;
    }

    /// True when nothing is playing and nothing is waiting
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }

    /// Id of the segment currently playing
    #[must_use]
    pub const fn current(&self) -> Option<u64> {
        self.current
    }

    /// Number of segments waiting behind the current one
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no segments are waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of segments skipped because they failed to play
    #[must_use]
    pub const fn skipped(&self) -> u64 {
        self.skipped
    }

    fn play_next(&mut self, sink: &mut dyn SegmentSink) -> bool {
        while let Some(segment) = self.queue.pop_front() {
            let id = segment.id();
            match sink.play(segment) {
                Ok(()) => {
                    self.current = Some(id);
                    return false;
                }
                Err(e) => {
                    self.skipped += 1;
                    tracing::warn!(segment = id, error = %e, "skipping segment");
                }
            }
        }

        self.current = None;
        if self.turn_done {
            self.turn_done = false;
            tracing::debug!("playback drained after completed reply");
            return true;
        }
        false
    }
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUED_SEGMENTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        played: Vec<u64>,
        fail: Vec<u64>,
    }

    impl SegmentSink for RecordingSink {
        fn play(&mut self, segment: PlaybackSegment) -> Result<()> {
            if self.fail.contains(&segment.id()) {
                return Err(Error::Playback("bad segment".to_string()));
            }
            self.played.push(segment.id());
            Ok(())
        }
    }

    #[test]
    fn test_first_segment_starts_immediately() {
        let mut queue = PlaybackQueue::default();
        let mut sink = RecordingSink::default();

        assert!(!queue.enqueue(vec![0.1], &mut sink).unwrap());
        assert_eq!(sink.played, vec![0]);
        assert_eq!(queue.current(), Some(0));
    }

    #[test]
    fn test_segments_wait_for_current_to_finish() {
        let mut queue = PlaybackQueue::default();
        let mut sink = RecordingSink::default();

        for _ in 0..3 {
            queue.enqueue(vec![0.1], &mut sink).unwrap();
        }
        // Only the head has been handed out
        assert_eq!(sink.played, vec![0]);
        assert_eq!(queue.len(), 2);

        queue.finish_current(0, &mut sink);
        queue.finish_current(1, &mut sink);
        queue.finish_current(2, &mut sink);

        assert_eq!(sink.played, vec![0, 1, 2]);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_failed_segment_is_skipped() {
        let mut queue = PlaybackQueue::default();
        let mut sink = RecordingSink {
            fail: vec![1],
            ..Default::default()
        };

        for _ in 0..3 {
            queue.enqueue(vec![0.1], &mut sink).unwrap();
        }
        queue.finish_current(0, &mut sink);

        assert_eq!(sink.played, vec![0, 2]);
        assert_eq!(queue.current(), Some(2));
        assert_eq!(queue.skipped(), 1);
    }

    #[test]
    fn test_stale_completion_is_ignored() {
        let mut queue = PlaybackQueue::default();
        let mut sink = RecordingSink::default();

        queue.enqueue(vec![0.1], &mut sink).unwrap();
        queue.enqueue(vec![0.1], &mut sink).unwrap();

        assert!(!queue.finish_current(5, &mut sink));
        assert_eq!(queue.current(), Some(0));
        assert_eq!(sink.played, vec![0]);
    }

    #[test]
    fn test_drain_fires_once_after_turn_done() {
        let mut queue = PlaybackQueue::default();
        let mut sink = RecordingSink::default();

        queue.enqueue(vec![0.1], &mut sink).unwrap();
        queue.enqueue(vec![0.1], &mut sink).unwrap();
        assert!(!queue.mark_turn_done());

        assert!(!queue.finish_current(0, &mut sink));
        assert!(queue.finish_current(1, &mut sink));

        // A second drain without a new turn-done does not fire again
        queue.enqueue(vec![0.1], &mut sink).unwrap();
        assert!(!queue.finish_current(2, &mut sink));
    }

    #[test]
    fn test_drain_without_turn_done_does_not_fire() {
        let mut queue = PlaybackQueue::default();
        let mut sink = RecordingSink::default();

        queue.enqueue(vec![0.1], &mut sink).unwrap();
        assert!(!queue.finish_current(0, &mut sink));
        assert!(queue.is_idle());
    }

    #[test]
    fn test_turn_done_while_idle_fires_immediately() {
        let mut queue = PlaybackQueue::default();
        assert!(queue.mark_turn_done());

        // Each completed reply is its own drain event
        assert!(queue.mark_turn_done());
    }

    #[test]
    fn test_queue_capacity() {
        let mut queue = PlaybackQueue::new(2);
        let mut sink = RecordingSink::default();

        // Head is playing, two more wait
        queue.enqueue(vec![0.1], &mut sink).unwrap();
        queue.enqueue(vec![0.1], &mut sink).unwrap();
        queue.enqueue(vec![0.1], &mut sink).unwrap();

        let err = queue.enqueue(vec![0.1], &mut sink).unwrap_err();
        assert!(matches!(err, Error::Playback(_)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_clear_resets_state() {
        let mut queue = PlaybackQueue::default();
        let mut sink = RecordingSink::default();

        queue.enqueue(vec![0.1], &mut sink).unwrap();
        queue.enqueue(vec![0.1], &mut sink).unwrap();
        queue.mark_turn_done();
        queue.clear();

        assert!(queue.is_idle());
        assert!(!queue.finish_current(0, &mut sink));
    }
}
