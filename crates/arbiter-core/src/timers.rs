//! Monotonic timing helpers.

use std::time::{Duration, Instant};

/// Records how much of a wait interval remains, so sampling cost does not
/// drift the collection cadence: the recorder is started before the work
/// and the remaining delta is slept afterwards.
#[derive(Debug, Clone)]
pub struct TimeRecorder {
    started_at: Instant,
    waittime: Duration,
}

impl Default for TimeRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeRecorder {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            waittime: Duration::ZERO,
        }
    }

    /// Starts (or restarts) the recorder with the given wait interval.
    pub fn start(&mut self, waittime: Duration) {
        self.started_at = Instant::now();
        self.waittime = waittime;
    }

    /// Returns how much waiting is left; zero once expired.
    pub fn remaining(&self) -> Duration {
        self.waittime.saturating_sub(self.started_at.elapsed())
    }

    /// Returns whether the interval has fully elapsed.
    pub fn expired(&self) -> bool {
        self.remaining() == Duration::ZERO
    }
}
