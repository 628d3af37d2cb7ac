//! Latest-wins frame queue between the encode path and network writers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

use crate::capture::Frame;

pub const MIN_CAPACITY: usize = 1;
pub const MAX_CAPACITY: usize = 2;

/// Bounded buffer holding only the most recent frame(s).
///
/// `offer` never blocks on consumers: a full queue evicts its oldest entry.
/// Consumers either take frames with [`poll`](Self::poll) or follow the
/// stream without removing anything through [`poll_after`](Self::poll_after),
/// which lets every network client see the freshest frame.
pub struct FrameQueue {
    slots: Mutex<Slots>,
    ready: Condvar,

    /// Statistics
    stats: CachePadded<Stats>,
}

struct Slots {
    ring: HeapRb<Frame>,
    next_sequence: u64,
}

#[derive(Default)]
struct Stats {
    frames_offered: AtomicU64,
    frames_taken: AtomicU64,
    frames_evicted: AtomicU64,
}

/// Counter snapshot, see [`FrameQueue::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub offered: u64,
    pub taken: u64,
    pub evicted: u64,
}

impl FrameQueue {
    /// Capacity is clamped to 1..=2.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(MIN_CAPACITY, MAX_CAPACITY);
        Self {
            slots: Mutex::new(Slots {
                ring: HeapRb::new(capacity),
                next_sequence: 1,
            }),
            ready: Condvar::new(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Producer: insert a frame, evicting the oldest when full.
    ///
    /// Returns the sequence number assigned to the frame.
    pub fn offer(&self, mut frame: Frame) -> u64 {
        let sequence = {
            let mut slots = self.lock();
            frame.sequence = slots.next_sequence;
            slots.next_sequence += 1;

            if slots.ring.push_overwrite(frame).is_some() {
                self.stats.frames_evicted.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("lenscast_frames_evicted_total").increment(1);
            }
            slots.next_sequence - 1
        };

        self.stats.frames_offered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("lenscast_frames_offered_total").increment(1);
        self.ready.notify_all();
        sequence
    }

    /// Consumer: take the oldest retained frame, waiting up to `timeout`.
    pub fn poll(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut slots = self.lock();
        loop {
            if let Some(frame) = slots.ring.try_pop() {
                self.stats.frames_taken.fetch_add(1, Ordering::Relaxed);
                return Some(frame);
            }
            slots = self.wait_until(slots, deadline)?;
        }
    }

    /// Consumer: newest retained frame with a sequence above `cursor`,
    /// waiting up to `timeout`. The frame stays in the queue for others.
    pub fn poll_after(&self, cursor: u64, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut slots = self.lock();
        loop {
            if let Some(frame) = slots.ring.iter().filter(|f| f.sequence > cursor).last() {
                return Some(frame.clone());
            }
            slots = self.wait_until(slots, deadline)?;
        }
    }

    /// Block on the condvar until notified or `deadline` passes.
    fn wait_until<'a>(
        &self,
        slots: MutexGuard<'a, Slots>,
        deadline: Instant,
    ) -> Option<MutexGuard<'a, Slots>> {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        if remaining.is_zero() {
            return None;
        }
        let (slots, _) = self
            .ready
            .wait_timeout(slots, remaining)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Some(slots)
    }

    /// Drop every retained frame.
    pub fn clear(&self) {
        let dropped = self.lock().ring.clear();
        if dropped > 0 {
            tracing::debug!("Cleared {} queued frame(s)", dropped);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().ring.capacity().get()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            offered: self.stats.frames_offered.load(Ordering::Relaxed),
            taken: self.stats.frames_taken.load(Ordering::Relaxed),
            evicted: self.stats.frames_evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use bytes::Bytes;

    use super::*;

    fn frame(n: u8) -> Frame {
        Frame::image(Bytes::from(vec![n]), i64::from(n))
    }

    #[test]
    fn capacity_one_always_yields_most_recent_offer() {
        let queue = FrameQueue::new(1);
        for n in 1..=20u8 {
            for m in 1..=n {
                queue.offer(frame(m));
            }
            let got = queue.poll(Duration::from_millis(10)).unwrap();
            assert_eq!(got.data[0], n, "after {n} offers");
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn capacity_two_evicts_oldest_and_keeps_fifo() {
        let queue = FrameQueue::new(2);
        queue.offer(frame(1));
        queue.offer(frame(2));
        queue.offer(frame(3));

        assert_eq!(queue.poll(Duration::ZERO).unwrap().data[0], 2);
        assert_eq!(queue.poll(Duration::ZERO).unwrap().data[0], 3);
        assert_eq!(queue.stats().evicted, 1);
    }

    #[test]
    fn capacity_is_clamped() {
        assert_eq!(FrameQueue::new(0).capacity(), 1);
        assert_eq!(FrameQueue::new(8).capacity(), 2);
    }

    #[test]
    fn poll_times_out_on_empty_queue() {
        let queue = FrameQueue::new(1);
        let started = Instant::now();
        assert!(queue.poll(Duration::from_millis(50)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn poll_wakes_when_a_frame_arrives() {
        let queue = Arc::new(FrameQueue::new(1));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                queue.offer(frame(7));
            })
        };
        let got = queue.poll(Duration::from_secs(5)).unwrap();
        assert_eq!(got.data[0], 7);
        producer.join().unwrap();
    }

    #[test]
    fn poll_after_is_non_destructive_and_monotonic() {
        let queue = FrameQueue::new(2);
        let first = queue.offer(frame(1));
        let second = queue.offer(frame(2));

        let got = queue.poll_after(0, Duration::ZERO).unwrap();
        assert_eq!(got.sequence, second);
        assert_eq!(queue.len(), 2);

        assert!(queue.poll_after(second, Duration::ZERO).is_none());
        assert!(first < second);
    }

    #[test]
    fn concurrent_followers_each_see_the_newest_frame() {
        let queue = Arc::new(FrameQueue::new(1));
        let followers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut cursor = 0;
                    let mut seen = Vec::new();
                    while seen.len() < 3 {
                        if let Some(frame) = queue.poll_after(cursor, Duration::from_secs(5)) {
                            assert!(frame.sequence > cursor);
                            cursor = frame.sequence;
                            seen.push(frame.data[0]);
                        } else {
                            break;
                        }
                    }
                    seen
                })
            })
            .collect();

        for n in 1..=200u8 {
            queue.offer(frame(n));
            thread::sleep(Duration::from_millis(2));
        }

        for follower in followers {
            let seen = follower.join().unwrap();
            assert_eq!(seen.len(), 3);
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn clear_releases_frames() {
        let queue = FrameQueue::new(2);
        queue.offer(frame(1));
        queue.offer(frame(2));
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.poll(Duration::ZERO).is_none());
    }
}
