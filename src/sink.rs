//! Latest-sample holder and bounded history for live display.
//!
//! The acquisition thread is the only writer. Readers receive an `Arc` to an
//! immutable snapshot; the writer copies on write when a reader still holds
//! the previous one, so a reader never observes a half-updated ring.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::DEFAULT_PLOT_CAPACITY;
use crate::protocol::Vector3;

/// A timestamped acceleration reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Monotonic capture time, relative to the start of the connection.
    pub timestamp: Duration,
    /// Acceleration in g.
    pub acceleration: Vector3,
    pub norm: f64,
}

impl Sample {
    pub fn new(timestamp: Duration, acceleration: Vector3) -> Self {
        Self {
            timestamp,
            acceleration,
            norm: acceleration.norm(),
        }
    }
}

/// A consistent view of the sink at one instant.
#[derive(Debug, Clone, Default)]
pub struct SinkSnapshot {
    pub latest: Option<Sample>,
    /// Oldest first.
    pub recent: VecDeque<Sample>,
}

#[derive(Debug)]
pub struct SampleSink {
    capacity: AtomicUsize,
    current: Mutex<Arc<SinkSnapshot>>,
}

impl Default for SampleSink {
    fn default() -> Self {
        Self::new(DEFAULT_PLOT_CAPACITY)
    }
}

impl SampleSink {
    /// `capacity` is clamped to at least one sample.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity: AtomicUsize::new(capacity),
            current: Mutex::new(Arc::new(SinkSnapshot {
                latest: None,
                recent: VecDeque::with_capacity(capacity),
            })),
        }
    }

    /// Record `sample` as the latest and append it to the ring, evicting the
    /// oldest entries beyond capacity.
    pub fn publish(&self, sample: Sample) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        // Read under the lock: set_capacity stores and truncates while holding it.
        let capacity = self.capacity.load(Ordering::Acquire);
        let snapshot = Arc::make_mut(&mut current);
        while snapshot.recent.len() >= capacity {
            snapshot.recent.pop_front();
        }
        snapshot.recent.push_back(sample);
        snapshot.latest = Some(sample);
    }

    pub fn snapshot(&self) -> Arc<SinkSnapshot> {
        Arc::clone(&self.current.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn latest(&self) -> Option<Sample> {
        self.snapshot().latest
    }

    /// Recent samples, oldest first.
    pub fn recent(&self) -> Vec<Sample> {
        self.snapshot().recent.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Change the ring capacity. Shrinking drops the oldest samples right away.
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        self.capacity.store(capacity, Ordering::Release);
        if current.recent.len() > capacity {
            let snapshot = Arc::make_mut(&mut current);
            let excess = snapshot.recent.len() - capacity;
            snapshot.recent.drain(..excess);
        }
    }

    /// Forget everything, e.g. when a new connection starts.
    pub fn clear(&self) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *current = Arc::new(SinkSnapshot::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(i: u64) -> Sample {
        Sample::new(
            Duration::from_millis(i),
            Vector3::new(i as f64, 0.0, 0.0),
        )
    }

    #[test]
    fn norm_is_derived() {
        let s = Sample::new(Duration::ZERO, Vector3::new(3.0, 4.0, 12.0));
        assert_eq!(s.norm, 13.0);
    }

    #[test]
    fn keeps_last_min_n_c() {
        for capacity in [1usize, 3, 10] {
            for n in [0u64, 1, 2, 5, 25] {
                let sink = SampleSink::new(capacity);
                for i in 0..n {
                    sink.publish(sample(i));
                }
                let expected: Vec<Sample> = (0..n)
                    .skip(n.saturating_sub(capacity as u64) as usize)
                    .map(sample)
                    .collect();
                assert_eq!(sink.recent(), expected, "capacity={capacity} n={n}");
                assert_eq!(sink.latest(), n.checked_sub(1).map(sample));
            }
        }
    }

    #[test]
    fn capacity_three_keeps_b_c_d() {
        let sink = SampleSink::default();
        sink.set_capacity(3);
        let (a, b, c, d) = (sample(1), sample(2), sample(3), sample(4));
        for s in [a, b, c, d] {
            sink.publish(s);
        }
        assert_eq!(sink.recent(), vec![b, c, d]);
    }

    #[test]
    fn shrinking_truncates_oldest_immediately() {
        let sink = SampleSink::new(10);
        for i in 0..8 {
            sink.publish(sample(i));
        }
        sink.set_capacity(2);
        assert_eq!(sink.recent(), vec![sample(6), sample(7)]);
        assert_eq!(sink.latest(), Some(sample(7)));

        sink.set_capacity(5);
        sink.publish(sample(8));
        assert_eq!(sink.len(), 3);
    }

    #[test]
    fn held_snapshot_is_not_mutated() {
        let sink = SampleSink::new(2);
        sink.publish(sample(0));
        sink.publish(sample(1));
        let before = sink.snapshot();
        sink.publish(sample(2));
        sink.set_capacity(1);

        assert_eq!(before.recent.len(), 2);
        assert_eq!(before.latest, Some(sample(1)));
        assert_eq!(sink.recent(), vec![sample(2)]);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let sink = SampleSink::new(0);
        assert_eq!(sink.capacity(), 1);
        sink.publish(sample(0));
        sink.publish(sample(1));
        assert_eq!(sink.recent(), vec![sample(1)]);
    }

    #[test]
    fn concurrent_readers_see_whole_rings() {
        use std::thread;

        let sink = Arc::new(SampleSink::new(16));
        let writer = {
            let sink = Arc::clone(&sink);
            thread::spawn(move || {
                for i in 0..2000 {
                    sink.publish(sample(i));
                }
            })
        };

        for _ in 0..200 {
            let snap = sink.snapshot();
            assert!(snap.recent.len() <= 16);
            // Contiguous, ordered run ending at `latest`.
            let times: Vec<u128> = snap.recent.iter().map(|s| s.timestamp.as_millis()).collect();
            assert!(times.windows(2).all(|w| w[1] == w[0] + 1));
            if let Some(latest) = snap.latest {
                assert_eq!(snap.recent.back(), Some(&latest));
            }
        }
        writer.join().unwrap();
        assert_eq!(sink.len(), 16);
    }

    #[test]
    fn shrink_holds_against_a_concurrent_publisher() {
        use std::thread;

        let sink = Arc::new(SampleSink::new(64));
        for i in 0..64 {
            sink.publish(sample(i));
        }
        let writer = {
            let sink = Arc::clone(&sink);
            thread::spawn(move || {
                for i in 64..20_000 {
                    sink.publish(sample(i));
                }
            })
        };

        sink.set_capacity(3);
        while !writer.is_finished() {
            assert!(sink.snapshot().recent.len() <= 3);
        }
        writer.join().unwrap();
        assert_eq!(sink.len(), 3);
    }
}
