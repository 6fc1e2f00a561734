//! Bounded drop-oldest handoff between frame notifications and the display tick.
//!
//! The controller loop publishes every [`FrameMessage`] it receives; the consumer takes only
//! the newest one per tick. Everything older is counted as dropped and never decoded.

use crate::messages::FrameMessage;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStats {
    /// Frames ever published
    pub published: u64,
    /// Frames handed to the consumer
    pub delivered: u64,
    /// Frames discarded unseen (overflow, superseded, or flushed)
    pub dropped: u64,
}

#[derive(Debug)]
struct Inner {
    queue: VecDeque<FrameMessage>,
    stats: MailboxStats,
}

/// Drop-oldest frame mailbox.
#[derive(Debug)]
pub struct FrameMailbox {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl FrameMailbox {
    /// Mailbox holding at most `capacity` pending frames (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                stats: MailboxStats::default(),
            }),
        }
    }

    /// Add a frame, evicting the oldest pending one when full.
    pub fn publish(&self, frame: FrameMessage) {
        let mut inner = self.inner.lock();
        if inner.queue.len() == self.capacity {
            inner.queue.pop_front();
            inner.stats.dropped += 1;
        }
        inner.queue.push_back(frame);
        inner.stats.published += 1;
    }

    /// Newest pending frame; all older pending frames are discarded.
    pub fn take_latest(&self) -> Option<FrameMessage> {
        let mut inner = self.inner.lock();
        let latest = inner.queue.pop_back()?;
        let superseded = inner.queue.len() as u64;
        inner.queue.clear();
        inner.stats.dropped += superseded;
        inner.stats.delivered += 1;
        if superseded > 0 {
            tracing::trace!(superseded, "dropped stale frames");
        }
        Some(latest)
    }

    /// Throw away every pending frame; returns how many were discarded.
    pub fn discard_pending(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.queue.len();
        inner.queue.clear();
        inner.stats.dropped += n as u64;
        n
    }

    /// Number of frames waiting.
    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> MailboxStats {
        self.inner.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{BufferSelector, FrameShape};

    fn frame(generation: u64, fps: f64) -> FrameMessage {
        FrameMessage {
            fps,
            byte_size: 4,
            shape: FrameShape::new(2, 2, 1, 8),
            buffer_selector: BufferSelector::Primary,
            generation,
            telemetry: None,
        }
    }

    #[test]
    fn only_the_newest_frame_is_taken() {
        let mailbox = FrameMailbox::new(4);
        mailbox.publish(frame(1, 1.0));
        mailbox.publish(frame(1, 2.0));
        mailbox.publish(frame(1, 3.0));

        let taken = mailbox.take_latest().unwrap();
        assert_eq!(taken.fps, 3.0);
        assert!(mailbox.take_latest().is_none());
        assert_eq!(
            mailbox.stats(),
            MailboxStats {
                published: 3,
                delivered: 1,
                dropped: 2
            }
        );
    }

    #[test]
    fn overflow_evicts_oldest() {
        let mailbox = FrameMailbox::new(2);
        for i in 0..5 {
            mailbox.publish(frame(1, f64::from(i)));
        }
        assert_eq!(mailbox.pending(), 2);
        assert_eq!(mailbox.stats().dropped, 3);
        assert_eq!(mailbox.take_latest().unwrap().fps, 4.0);
    }

    #[test]
    fn discard_pending_flushes_everything() {
        let mailbox = FrameMailbox::new(0);
        mailbox.publish(frame(1, 1.0));
        assert_eq!(mailbox.discard_pending(), 1);
        assert!(mailbox.take_latest().is_none());
    }
}
