//! Rational media time: a sample count over a sample rate.
//!
//! Positions and durations are kept as exact frame counts so repeated
//! increments from the render thread never accumulate floating-point drift.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Time expressed as `value / timescale` seconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MediaTime {
    pub value: i64,
    pub timescale: u32,
}

impl MediaTime {
    pub const fn new(value: i64, timescale: u32) -> Self {
        Self { value, timescale }
    }

    pub const fn zero(timescale: u32) -> Self {
        Self::new(0, timescale)
    }

    /// Time covered by `frames` at `sample_rate`
    pub fn from_frames(frames: u64, sample_rate: u32) -> Self {
        Self::new(i64::try_from(frames).unwrap_or(i64::MAX), sample_rate)
    }

    /// Lossy conversion for display and UI boundaries
    pub fn seconds(&self) -> f64 {
        if self.timescale == 0 {
            return 0.0;
        }
        self.value as f64 / self.timescale as f64
    }

    fn cross(&self, other: &Self) -> (i128, i128) {
        (
            self.value as i128 * other.timescale as i128,
            other.value as i128 * self.timescale as i128,
        )
    }
}

impl PartialEq for MediaTime {
    fn eq(&self, other: &Self) -> bool {
        let (lhs, rhs) = self.cross(other);
        lhs == rhs
    }
}

impl Eq for MediaTime {}

impl PartialOrd for MediaTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MediaTime {
    fn cmp(&self, other: &Self) -> Ordering {
        let (lhs, rhs) = self.cross(other);
        lhs.cmp(&rhs)
    }
}

impl fmt::Display for MediaTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({:.3}s)", self.value, self.timescale, self.seconds())
    }
}
