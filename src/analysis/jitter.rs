//! Sliding-window jitter measurement.
//!
//! Jitter is reported as max − min of the skew samples seen over the
//! most recent window (10 seconds of capture time by default), bounded
//! to 1024 samples. Samples expire when their age exceeds the range;
//! expiring a sample that equalled the window extremum triggers a full
//! rescan of the survivors.

use std::collections::VecDeque;

/// Default window range: 10 seconds on the 90 kHz clock.
pub const DEFAULT_JITTER_RANGE: u64 = 10 * 90_000;

/// Hard bound on retained samples.
pub const MAX_JITTER_SAMPLES: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct Sample {
    skew: i64,
    t: u64,
}

/// Bounded sliding window over skew samples.
#[derive(Debug)]
pub struct JitterWindow {
    samples: VecDeque<Sample>,
    range: u64,
    max: i64,
    min: i64,
}

impl JitterWindow {
    /// Creates a window covering `range` ticks of capture time.
    pub fn new(range: u64) -> Self {
        Self {
            samples: VecDeque::with_capacity(MAX_JITTER_SAMPLES),
            range,
            max: i64::MIN,
            min: i64::MAX,
        }
    }

    /// Adds a skew sample taken at capture time `t` and returns the
    /// jitter (max − min) over the surviving samples.
    ///
    /// Samples whose age exceeds the range are expired first; a sample
    /// aged exactly the range survives.
    pub fn add(&mut self, skew: i64, t: u64) -> u64 {
        let mut rescan = false;

        if self.samples.len() == MAX_JITTER_SAMPLES {
            if let Some(old) = self.samples.pop_front() {
                rescan |= old.skew == self.max || old.skew == self.min;
            }
        }

        while let Some(front) = self.samples.front() {
            if t.saturating_sub(front.t) > self.range {
                let old = *front;
                self.samples.pop_front();
                rescan |= old.skew == self.max || old.skew == self.min;
            } else {
                break;
            }
        }

        self.samples.push_back(Sample { skew, t });

        if rescan {
            self.max = i64::MIN;
            self.min = i64::MAX;
            for s in &self.samples {
                self.max = self.max.max(s.skew);
                self.min = self.min.min(s.skew);
            }
        } else {
            self.max = self.max.max(skew);
            self.min = self.min.min(skew);
        }

        (self.max - self.min) as u64
    }

    /// Number of samples currently in the window.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when no samples are held.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Drops all samples (used at section boundaries).
    pub fn clear(&mut self) {
        self.samples.clear();
        self.max = i64::MIN;
        self.min = i64::MAX;
    }

    /// Oldest retained sample time, if any (test hook).
    #[cfg(test)]
    fn oldest(&self) -> Option<u64> {
        self.samples.front().map(|s| s.t)
    }
}

impl Default for JitterWindow {
    fn default() -> Self {
        Self::new(DEFAULT_JITTER_RANGE)
    }
}
