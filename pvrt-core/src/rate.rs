//! Progress rate over a sliding time window.
//!
//! Feeds the `bps` and `eta` fields of a blob fill's [`FillProgress`].
//!
//! [`FillProgress`]: crate::blob::FillProgress

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Tracks a monotonically growing position (bytes done so far) and
/// reports how fast it moved over the last `window`.
#[derive(Debug)]
pub struct RateEstimator {
    /// `(when, position)` checkpoints, oldest first.
    points: VecDeque<(Instant, u64)>,
    window: Duration,
}

impl RateEstimator {
    pub fn with_window(window: Duration) -> Self {
        Self {
            points: VecDeque::new(),
            window,
        }
    }

    /// Note that `position` bytes are done as of now.
    pub fn observe(&mut self, position: u64) {
        self.observe_at(Instant::now(), position);
    }

    pub fn observe_at(&mut self, when: Instant, position: u64) {
        self.points.push_back((when, position));
        // Keep one checkpoint at or beyond the window edge as the baseline.
        while self.points.len() > 2 && when.duration_since(self.points[1].0) >= self.window {
            self.points.pop_front();
        }
    }

    /// Bytes per second between the oldest and newest checkpoint; 0 until
    /// two checkpoints exist.
    pub fn bytes_per_sec(&self) -> u64 {
        let (Some(&(t0, p0)), Some(&(t1, p1))) = (self.points.front(), self.points.back()) else {
            return 0;
        };
        let span = t1.duration_since(t0).max(Duration::from_millis(1));
        (p1.saturating_sub(p0) as f64 / span.as_secs_f64()) as u64
    }

    /// Time to cover `remaining` bytes at the current rate.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        match self.bytes_per_sec() {
            0 => None,
            bps => Some(Duration::from_secs_f64(remaining as f64 / bps as f64)),
        }
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::with_window(Duration::from_secs(2))
    }
}
