use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::sample::Sample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("appended sample is already older than the retention window")]
    InvariantViolation,
}

/// Recent samples of one channel, bounded by age rather than by count.
#[derive(Debug)]
pub struct HistoryBuffer {
    retention: Duration,
    samples: VecDeque<Sample>,
}

impl HistoryBuffer {
    pub fn new(retention: Duration) -> HistoryBuffer {
        HistoryBuffer {
            retention,
            samples: VecDeque::new(),
        }
    }

    /// Evicts stale entries, then appends `sample`. Returns the number evicted.
    pub fn append(&mut self, sample: Sample, now: DateTime<Utc>) -> Result<usize, HistoryError> {
        let evicted = self.evict(now);

        if self.is_stale(&sample, now) {
            return Err(HistoryError::InvariantViolation);
        }

        self.samples.push_back(sample);
        Ok(evicted)
    }

    pub fn evict(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.samples.len();
        let retention = self.retention;
        self.samples.retain(|s| !stale(s, now, retention));

        let evicted = before - self.samples.len();
        if evicted > 0 {
            log::debug!("Evicted {evicted} samples older than {retention:?}");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn values(&self, field: Field) -> Vec<f64> {
        self.iter().map(|s| field.of(s)).collect()
    }

    fn is_stale(&self, sample: &Sample, now: DateTime<Utc>) -> bool {
        stale(sample, now, self.retention)
    }
}

// Samples stamped in the future have no age yet.
fn stale(sample: &Sample, now: DateTime<Utc>, retention: Duration) -> bool {
    (now - sample.timestamp)
        .to_std()
        .is_ok_and(|age| age > retention)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Humidity,
    Temperature,
}

impl Field {
    pub fn of(self, sample: &Sample) -> f64 {
        match self {
            Field::Humidity => sample.humidity,
            Field::Temperature => sample.temperature_f,
        }
    }

    fn set(self, sample: &mut Sample, value: f64) {
        match self {
            Field::Humidity => sample.humidity = value,
            Field::Temperature => sample.temperature_f = value,
        }
    }
}

/// Median of `values`, averaging the two middle values for even counts.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Replaces values that stray too far from the recent median.
///
/// A lone spike on the wire is far more often a glitch than a real step
/// change, so an outlier is clipped to the historical median instead of being
/// dropped. The sample itself is always kept.
#[derive(Debug, Clone, Copy)]
pub struct OutlierFilter {
    pub min_history: usize,
    pub threshold: f64,
}

impl OutlierFilter {
    pub fn check(&self, history: &HistoryBuffer, field: Field, candidate: f64) -> f64 {
        if history.len() < self.min_history {
            return candidate;
        }

        let Some(median) = median(&history.values(field)) else {
            return candidate;
        };

        if (candidate - median).abs() > self.threshold {
            log::warn!(
                "{field:?} {candidate:.1} deviates from median {median:.1} by more than {}, replacing",
                self.threshold
            );
            median
        } else {
            candidate
        }
    }

    pub fn apply(&self, history: &HistoryBuffer, mut sample: Sample) -> Sample {
        for field in [Field::Humidity, Field::Temperature] {
            let checked = self.check(history, field, field.of(&sample));
            field.set(&mut sample, checked);
        }
        sample
    }
}
