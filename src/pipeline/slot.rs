//! Single-slot frame mailbox with overwrite-on-publish semantics

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;

use crate::Frame;

/// Holds at most one frame; a newer frame always replaces the older one
pub struct FrameSlot {
    current: ArcSwapOption<Entry>,

    /// Statistics
    stats: CachePadded<Stats>,
}

/// A published frame and whether any consumer has seen it. The flag lives
/// with the frame so a swap replaces both at once.
struct Entry {
    frame: Frame,
    read: AtomicBool,
}

#[derive(Default)]
struct Stats {
    published: AtomicU64,
    superseded: AtomicU64,
    read: AtomicU64,
    decode_faults: AtomicU64,
}

/// Snapshot of slot counters. Informational only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub published: u64,
    /// Frames replaced before any consumer saw them
    pub superseded: u64,
    pub read: u64,
    pub decode_faults: u64,
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: replace the current frame. Never blocks.
    pub fn publish(&self, frame: Frame) {
        let entry = Entry {
            frame,
            read: AtomicBool::new(false),
        };
        let previous = self.current.swap(Some(Arc::new(entry)));

        self.stats.published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camtap_frames_published_total").increment(1);

        if previous.is_some_and(|old| !old.read.load(Ordering::Acquire)) {
            self.stats.superseded.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("camtap_frames_superseded_total").increment(1);
        }
    }

    /// Consumer: copy of the newest frame, read or not.
    pub fn latest(&self) -> Option<Frame> {
        let entry = self.current.load_full()?;
        entry.read.store(true, Ordering::Release);
        self.stats.read.fetch_add(1, Ordering::Relaxed);
        Some(entry.frame.clone())
    }

    /// Consumer: the newest frame only if it has not been read yet.
    pub fn take_fresh(&self) -> Option<Frame> {
        let entry = self.current.load_full()?;
        if entry.read.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.stats.read.fetch_add(1, Ordering::Relaxed);
        Some(entry.frame.clone())
    }

    pub fn has_frame(&self) -> bool {
        self.current.load().is_some()
    }

    pub fn record_decode_fault(&self) {
        self.stats.decode_faults.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camtap_decode_faults_total").increment(1);
    }

    /// Drop the held frame; counters are kept.
    pub fn clear(&self) {
        self.current.store(None);
    }

    pub fn stats(&self) -> SlotStats {
        SlotStats {
            published: self.stats.published.load(Ordering::Relaxed),
            superseded: self.stats.superseded.load(Ordering::Relaxed),
            read: self.stats.read.load(Ordering::Relaxed),
            decode_faults: self.stats.decode_faults.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::FrameMetadata;
    use crate::PixelFormat;
    use bytes::Bytes;
    use std::thread;
    use std::time::Instant;

    fn frame(sequence: u64) -> Frame {
        let meta = FrameMetadata {
            sequence,
            width: 2,
            height: 2,
            format: PixelFormat::Bgr24,
            captured_at: Instant::now(),
            device_timestamp: None,
        };
        Frame::new(meta, Bytes::from(vec![sequence as u8; 12])).unwrap()
    }

    #[test]
    fn empty_slot_reads_nothing() {
        let slot = FrameSlot::new();
        assert!(slot.latest().is_none());
        assert!(slot.take_fresh().is_none());
        assert_eq!(slot.stats(), SlotStats::default());
    }

    #[test]
    fn newest_frame_wins() {
        let slot = FrameSlot::new();
        slot.publish(frame(1));
        slot.publish(frame(2));
        slot.publish(frame(3));

        let latest = slot.latest().unwrap();
        assert_eq!(latest.sequence(), 3);
        let stats = slot.stats();
        assert_eq!(stats.published, 3);
        assert_eq!(stats.superseded, 2);
    }

    #[test]
    fn repeated_reads_are_idempotent() {
        let slot = FrameSlot::new();
        slot.publish(frame(7));
        let a = slot.latest().unwrap();
        let b = slot.latest().unwrap();
        assert_eq!(a.sequence(), b.sequence());
        assert_eq!(a.data(), b.data());
    }

    #[test]
    fn read_frames_are_not_counted_as_superseded() {
        let slot = FrameSlot::new();
        slot.publish(frame(1));
        slot.latest();
        slot.publish(frame(2));
        assert_eq!(slot.stats().superseded, 0);
    }

    #[test]
    fn take_fresh_returns_each_frame_once() {
        let slot = FrameSlot::new();
        slot.publish(frame(1));
        assert_eq!(slot.take_fresh().map(|f| f.sequence()), Some(1));
        assert!(slot.take_fresh().is_none());
        // Still visible to latest()
        assert_eq!(slot.latest().map(|f| f.sequence()), Some(1));
    }

    #[test]
    fn clear_empties_the_slot() {
        let slot = FrameSlot::new();
        slot.publish(frame(1));
        slot.clear();
        assert!(!slot.has_frame());
        assert!(slot.latest().is_none());
        assert_eq!(slot.stats().published, 1);
    }

    #[test]
    fn concurrent_readers_see_whole_frames() {
        let slot = Arc::new(FrameSlot::new());
        let writer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                for seq in 1..=500 {
                    slot.publish(frame(seq));
                }
            })
        };
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let slot = Arc::clone(&slot);
                thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..500 {
                        if let Some(f) = slot.latest() {
                            assert_eq!(f.data().len(), 12);
                            assert!(f.data().iter().all(|&b| b == f.sequence() as u8));
                            assert!(f.sequence() >= last);
                            last = f.sequence();
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(slot.latest().map(|f| f.sequence()), Some(500));
    }

    #[test]
    fn concurrent_fresh_reads_never_share_a_frame() {
        let slot = Arc::new(FrameSlot::new());
        let writer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                for seq in 1..=2000 {
                    slot.publish(frame(seq));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let slot = Arc::clone(&slot);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    for _ in 0..2000 {
                        if let Some(f) = slot.take_fresh() {
                            // Payload and sequence come from the same publish
                            assert!(f.data().iter().all(|&b| b == f.sequence() as u8));
                            seen.push(f.sequence());
                        }
                    }
                    seen
                })
            })
            .collect();

        writer.join().unwrap();
        let mut all: Vec<u64> = readers
            .into_iter()
            .flat_map(|reader| reader.join().unwrap())
            .collect();
        let taken = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), taken, "a frame was handed out twice");
        assert_eq!(slot.stats().read, taken as u64);
    }
}
