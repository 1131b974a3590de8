//! Bounded bookkeeping for a single stream: the failure log used by the
//! give-up heuristic and the latency sampler used by adaptive timing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

use crate::error::FailureKind;

/// One failed fetch attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    /// When the failure was recorded
    pub time: DateTime<Utc>,
    /// Value of the stream's fired counter for the failed attempt
    pub fired: u64,
    /// Classification of the failure
    pub kind: FailureKind,
    /// Rendered error message
    pub message: String,
}

/// FIFO log of failed attempts with a fixed capacity
#[derive(Debug, Clone)]
pub struct ErrorHistory {
    records: VecDeque<ErrorRecord>,
    capacity: usize,
}

impl ErrorHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a record, evicting the oldest one when over capacity.
    pub fn push(&mut self, record: ErrorRecord) {
        self.records.push_back(record);
        while self.records.len() > self.capacity {
            self.records.pop_front();
        }
    }

    /// Count the records belonging to the `window` attempts ending at `fired`.
    pub fn failures_in_window(&self, fired: u64, window: u64) -> u64 {
        let lowest = fired.saturating_sub(window.saturating_sub(1));
        self.records
            .iter()
            .filter(|r| r.fired >= lowest && r.fired <= fired)
            .count() as u64
    }

    pub fn last(&self) -> Option<&ErrorRecord> {
        self.records.back()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> Vec<ErrorRecord> {
        self.records.iter().cloned().collect()
    }
}

/// Collects inter-fetch durations and yields a rounded average every
/// `sample_size` samples.
#[derive(Debug, Clone)]
pub struct LatencySampler {
    samples: Vec<Duration>,
    sample_size: usize,
    average: Duration,
}

impl LatencySampler {
    pub fn new(sample_size: usize) -> Self {
        Self {
            samples: Vec::with_capacity(sample_size),
            sample_size,
            average: Duration::ZERO,
        }
    }

    /// Record one sample. Returns the average, rounded to the nearest 100ms,
    /// when this sample completes a batch; the batch is then cleared.
    pub fn push(&mut self, sample: Duration) -> Option<Duration> {
        self.samples.push(sample);
        if self.samples.len() < self.sample_size {
            return None;
        }

        let total: u128 = self.samples.iter().map(Duration::as_millis).sum();
        let mean = total as f64 / self.samples.len() as f64;
        let rounded = ((mean / 100.0).round() * 100.0) as u64;

        self.average = Duration::from_millis(rounded);
        self.samples.clear();
        Some(self.average)
    }

    /// Drop pending samples and forget the last average.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.average = Duration::ZERO;
    }

    pub fn average(&self) -> Duration {
        self.average
    }

    pub fn pending(&self) -> usize {
        self.samples.len()
    }
}
