use std::thread;
use std::time::{Duration, Instant};

/// Enforces a minimum gap between consecutive calls to the external agent.
/// The gap is measured from the end of the previous call, so nothing is
/// waited before the first call or after the last one.
#[derive(Debug, Clone)]
pub struct Pacer {
    min_gap: Duration,
    last_call_end: Option<Instant>,
}

impl Pacer {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            last_call_end: None,
        }
    }

    /// Negative and non-finite values mean no pacing. Values beyond what a
    /// `Duration` holds saturate.
    pub fn from_secs_f64(secs: f64) -> Self {
        let gap = if secs.is_finite() && secs > 0.0 {
            Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        };
        Self::new(gap)
    }

    pub fn min_gap(&self) -> Duration {
        self.min_gap
    }

    /// Blocks until the gap since the previous call has elapsed. Returns how
    /// long it slept.
    pub fn wait(&mut self) -> Duration {
        let Some(last) = self.last_call_end else {
            return Duration::ZERO;
        };
        let remaining = self.min_gap.saturating_sub(last.elapsed());
        if !remaining.is_zero() {
            thread::sleep(remaining);
        }
        remaining
    }

    pub fn mark(&mut self) {
        self.last_call_end = Some(Instant::now());
    }
}
