//! Per-stream sequence tracking and demultiplexer counters.
//!
//! Sequence counters are 32-bit and wrap. A frame is "ahead" of the last one
//! when the wrapping distance is in `1..=u32::MAX / 2`; anything else is a
//! duplicate, a late reordered frame or a restarted counter. Those count as
//! stale and the tracker resyncs to them, so a restarted stream is followed
//! from its new position.

use std::collections::BTreeMap;

/// What one arriving sequence number says about the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceObservation {
    First,
    InOrder,
    /// `missing` frames were skipped before this one.
    Gap { missing: u32 },
    /// At or behind the last sequence; tracking restarts from here.
    Stale,
}

/// Counters for a single stream id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamCounters {
    pub frames: u64,
    pub lost: u64,
    pub stale: u64,
    pub max_loss_gap: u32,
    pub last_sequence: Option<u32>,
}

impl StreamCounters {
    pub fn observe(&mut self, sequence: u32) -> SequenceObservation {
        let observation = match self.last_sequence {
            None => SequenceObservation::First,
            Some(last) => {
                let delta = sequence.wrapping_sub(last);
                if delta == 0 || delta > u32::MAX / 2 {
                    SequenceObservation::Stale
                } else if delta == 1 {
                    SequenceObservation::InOrder
                } else {
                    SequenceObservation::Gap { missing: delta - 1 }
                }
            }
        };

        match observation {
            SequenceObservation::Stale => {
                self.stale = self.stale.saturating_add(1);
            }
            SequenceObservation::Gap { missing } => {
                self.lost = self.lost.saturating_add(u64::from(missing));
                self.max_loss_gap = self.max_loss_gap.max(missing);
            }
            SequenceObservation::First | SequenceObservation::InOrder => {}
        }
        self.frames = self.frames.saturating_add(1);
        self.last_sequence = Some(sequence);
        observation
    }

    /// Fraction of expected in-order frames that never arrived, in `[0, 1]`.
    pub fn loss_ratio(&self) -> f64 {
        let expected = self.frames.saturating_add(self.lost);
        if expected == 0 {
            0.0
        } else {
            self.lost as f64 / expected as f64
        }
    }
}

/// Snapshot of the lane's counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DemuxStats {
    /// Valid frames accepted.
    pub frames: u64,
    pub malformed: u64,
    /// Frames skipped over by sequence gaps, summed across streams.
    pub lost: u64,
    pub stale: u64,
    /// Frames for unregistered streams dropped after or beyond the grace buffer.
    pub discarded: u64,
    pub consumer_failures: u64,
    pub streams: BTreeMap<u16, StreamCounters>,
}

impl DemuxStats {
    pub fn stream(&self, stream_id: u16) -> Option<&StreamCounters> {
        self.streams.get(&stream_id)
    }

    pub(crate) fn record_sequence(&mut self, stream_id: u16, sequence: u32) -> SequenceObservation {
        let observation = self.streams.entry(stream_id).or_default().observe(sequence);
        match observation {
            SequenceObservation::Stale => self.stale = self.stale.saturating_add(1),
            SequenceObservation::Gap { missing } => {
                self.lost = self.lost.saturating_add(u64::from(missing));
            }
            SequenceObservation::First | SequenceObservation::InOrder => {}
        }
        self.frames = self.frames.saturating_add(1);
        observation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gaps_count_missing_frames() {
        let mut counters = StreamCounters::default();
        assert_eq!(counters.observe(1), SequenceObservation::First);
        assert_eq!(counters.observe(2), SequenceObservation::InOrder);
        assert_eq!(counters.observe(5), SequenceObservation::Gap { missing: 2 });
        assert_eq!(counters.frames, 3);
        assert_eq!(counters.lost, 2);
        assert_eq!(counters.max_loss_gap, 2);
        assert!((counters.loss_ratio() - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn duplicates_and_late_frames_are_stale() {
        let mut counters = StreamCounters::default();
        counters.observe(10);
        assert_eq!(counters.observe(10), SequenceObservation::Stale);
        assert_eq!(counters.observe(9), SequenceObservation::Stale);
        assert_eq!(counters.stale, 2);
        assert_eq!(counters.frames, 3);
        assert_eq!(counters.last_sequence, Some(9));
        assert_eq!(counters.observe(10), SequenceObservation::InOrder);
    }

    #[test]
    fn restarted_counter_is_followed() {
        let mut counters = StreamCounters::default();
        counters.observe(100_000);
        assert_eq!(counters.observe(0), SequenceObservation::Stale);
        for seq in 1..1000 {
            assert_eq!(counters.observe(seq), SequenceObservation::InOrder);
        }
        assert_eq!(counters.stale, 1);
        assert_eq!(counters.lost, 0);
        assert_eq!(counters.frames, 1001);
    }

    #[test]
    fn sequence_wraps_without_loss() {
        let mut counters = StreamCounters::default();
        counters.observe(u32::MAX - 1);
        assert_eq!(counters.observe(u32::MAX), SequenceObservation::InOrder);
        assert_eq!(counters.observe(0), SequenceObservation::InOrder);
        assert_eq!(counters.observe(2), SequenceObservation::Gap { missing: 1 });
        assert_eq!(counters.lost, 1);
    }

    #[test]
    fn totals_follow_streams() {
        let mut stats = DemuxStats::default();
        stats.record_sequence(1, 1);
        stats.record_sequence(1, 4);
        stats.record_sequence(2, 7);
        stats.record_sequence(2, 7);
        assert_eq!(stats.frames, 4);
        assert_eq!(stats.lost, 2);
        assert_eq!(stats.stale, 1);
        assert_eq!(stats.stream(2).map(|s| s.frames), Some(2));
    }
}
