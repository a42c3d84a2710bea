use std::collections::VecDeque;

use aqueduct_core::QueueTimeSample;
use chrono::Utc;

/// Bounded FIFO of server-reported queue times.
///
/// The oldest sample is evicted first; the buffer never holds more than its
/// capacity.
#[derive(Debug, Clone)]
pub struct QueueTimes {
    samples: VecDeque<QueueTimeSample>,
    capacity: usize,
}

impl QueueTimes {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, seconds: f64) {
        self.push_sample(QueueTimeSample {
            at: Utc::now(),
            seconds,
        });
    }

    pub fn push_sample(&mut self, sample: QueueTimeSample) {
        if self.capacity == 0 {
            return;
        }
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Change the capacity, dropping the oldest samples that no longer fit.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.samples.len() > capacity {
            self.samples.pop_front();
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<QueueTimeSample> {
        self.samples.back().copied()
    }

    /// Samples in arrival order.
    pub fn values(&self) -> Vec<QueueTimeSample> {
        self.samples.iter().copied().collect()
    }

    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let total: f64 = self.samples.iter().map(|s| s.seconds).sum();
        Some(total / self.samples.len() as f64)
    }
}
