//! Liveness tracking.
//!
//! A gap longer than 1.5x the interval counts as a missed beat. The worker is
//! alive until its first beat, then while the last beat is younger than 2x
//! the interval.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HeartbeatStats {
    pub total: u64,
    pub missed: u64,
    pub min_interval_ms: Option<u64>,
    pub max_interval_ms: Option<u64>,
    pub avg_interval_ms: Option<f64>,
    pub last_missed_at: Option<DateTime<Utc>>,
}

/// Result of a single beat.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Beat {
    /// Time since the previous beat, absent on the first one.
    pub elapsed: Option<Duration>,
    pub missed: bool,
}

#[derive(Default)]
struct Counters {
    last: Option<Instant>,
    total: u64,
    missed: u64,
    intervals: u64,
    min: Option<Duration>,
    max: Option<Duration>,
    sum: Duration,
    last_missed_at: Option<DateTime<Utc>>,
}

pub struct Heartbeat {
    interval: Duration,
    counters: Mutex<Counters>,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Records a beat and reports whether the gap since the last one was too long.
    pub fn beat(&self) -> Beat {
        let now = Instant::now();
        let mut c = self.counters.lock();
        c.total += 1;
        let elapsed = c.last.map(|last| now.duration_since(last));
        c.last = Some(now);

        let Some(elapsed) = elapsed else {
            return Beat {
                elapsed: None,
                missed: false,
            };
        };

        c.intervals += 1;
        c.sum += elapsed;
        c.min = Some(c.min.map_or(elapsed, |m| m.min(elapsed)));
        c.max = Some(c.max.map_or(elapsed, |m| m.max(elapsed)));

        let missed = elapsed.as_secs_f64() > self.interval.as_secs_f64() * 1.5;
        if missed {
            c.missed += 1;
            c.last_missed_at = Some(Utc::now());
        }
        Beat {
            elapsed: Some(elapsed),
            missed,
        }
    }

    pub fn is_alive(&self) -> bool {
        match self.counters.lock().last {
            None => true,
            Some(last) => last.elapsed() < self.interval * 2,
        }
    }

    pub fn stats(&self) -> HeartbeatStats {
        let c = self.counters.lock();
        HeartbeatStats {
            total: c.total,
            missed: c.missed,
            min_interval_ms: c.min.map(|d| d.as_millis() as u64),
            max_interval_ms: c.max.map(|d| d.as_millis() as u64),
            avg_interval_ms: (c.intervals > 0)
                .then(|| c.sum.as_secs_f64() * 1000.0 / c.intervals as f64),
            last_missed_at: c.last_missed_at,
        }
    }
}
