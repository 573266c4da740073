use crate::frame::FrameData;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Single-slot latest-frame cache with overwrite-on-write semantics.
///
/// Exactly one frame of capacity: a write replaces whatever is in the slot,
/// a read returns a clone of the most recent completed write. Neither side
/// ever waits on the other beyond the slot's own short critical section, so
/// a slow consumer can never back-pressure the producing stream worker.
pub struct FrameSlot {
    slot: RwLock<Option<FrameData>>,
    stats: FrameSlotStats,
}

/// Counters for slot activity monitoring
#[derive(Debug, Default)]
pub struct FrameSlotStats {
    /// Total frames written into the slot
    pub frames_written: AtomicU64,
    /// Frames discarded because a newer write replaced them before any read
    pub frames_dropped: AtomicU64,
    /// Total reads that returned a frame
    pub frames_read: AtomicU64,
}

impl FrameSlotStats {
    /// Get current statistics as a snapshot
    pub fn snapshot(&self) -> FrameSlotStatsSnapshot {
        FrameSlotStatsSnapshot {
            frames_written: self.frames_written.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_read: self.frames_read.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of frame slot statistics
#[derive(Debug, Clone, Copy)]
pub struct FrameSlotStatsSnapshot {
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub frames_read: u64,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(None),
            stats: FrameSlotStats::default(),
        }
    }

    /// Write a frame into the slot, discarding any unread predecessor.
    pub fn put(&self, frame: FrameData) {
        trace!("Slot write: frame {} ({} bytes)", frame.id, frame.data.len());

        let replaced = {
            let mut slot = self.slot.write();
            slot.replace(frame).is_some()
        };

        if replaced {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the most recent completed write, or `None` before the first write.
    ///
    /// The frame stays in the slot; repeated reads see the same frame until
    /// the next `put`.
    pub fn get(&self) -> Option<FrameData> {
        let frame = self.slot.read().clone();
        if frame.is_some() {
            self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    /// Whether a frame has been written since creation or the last clear
    pub fn has_frame(&self) -> bool {
        self.slot.read().is_some()
    }

    /// Drop the stored frame, returning the slot to its initial empty state
    pub fn clear(&self) {
        *self.slot.write() = None;
    }

    /// Get current slot statistics
    pub fn stats(&self) -> FrameSlotStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameFormat;
    use std::sync::Arc;
    use std::time::SystemTime;

    fn test_frame(id: u64) -> FrameData {
        FrameData::new(
            id,
            SystemTime::now(),
            vec![0u8; 12],
            2,
            2,
            FrameFormat::Rgb24,
        )
    }

    #[test]
    fn test_empty_slot_returns_none() {
        let slot = FrameSlot::new();
        assert!(slot.get().is_none());
        assert!(!slot.has_frame());
    }

    #[test]
    fn test_put_then_get() {
        let slot = FrameSlot::new();
        slot.put(test_frame(1));

        let frame = slot.get().expect("slot should hold a frame");
        assert_eq!(frame.id, 1);
        // Non-consuming read
        assert_eq!(slot.get().unwrap().id, 1);
    }

    #[test]
    fn test_overwrite_discards_unread_frame() {
        let slot = FrameSlot::new();
        slot.put(test_frame(1));
        slot.put(test_frame(2));
        slot.put(test_frame(3));

        assert_eq!(slot.get().unwrap().id, 3);

        let stats = slot.stats();
        assert_eq!(stats.frames_written, 3);
        assert_eq!(stats.frames_dropped, 2);
    }

    #[test]
    fn test_get_never_returns_older_than_last_put() {
        let slot = FrameSlot::new();
        for id in 1..=50 {
            slot.put(test_frame(id));
            assert_eq!(slot.get().unwrap().id, id);
        }
    }

    #[test]
    fn test_clear() {
        let slot = FrameSlot::new();
        slot.put(test_frame(1));
        slot.clear();
        assert!(slot.get().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_writer_and_readers() {
        let slot = Arc::new(FrameSlot::new());
        let mut handles = Vec::new();

        let writer_slot = Arc::clone(&slot);
        handles.push(tokio::spawn(async move {
            for id in 1..=200u64 {
                writer_slot.put(test_frame(id));
                tokio::task::yield_now().await;
            }
        }));

        for _ in 0..4 {
            let reader_slot = Arc::clone(&slot);
            handles.push(tokio::spawn(async move {
                let mut last_seen = 0u64;
                for _ in 0..100 {
                    if let Some(frame) = reader_slot.get() {
                        // Ids only move forward under a single writer
                        assert!(frame.id >= last_seen);
                        last_seen = frame.id;
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(slot.get().unwrap().id, 200);
        assert_eq!(slot.stats().frames_written, 200);
    }
}
