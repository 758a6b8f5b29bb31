use std::time::Duration;

const ALPHA: f64 = 0.2;

/// Exponential moving average of heartbeat round-trip times.
#[derive(Debug, Clone, Default)]
pub struct RttEstimator {
    average: Option<Duration>,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, sample: Duration) -> Duration {
        let next = match self.average {
            Some(avg) => {
                let nanos = avg.as_nanos() as f64 * (1.0 - ALPHA) + sample.as_nanos() as f64 * ALPHA;
                Duration::from_nanos(nanos.round() as u64)
            }
            None => sample,
        };
        self.average = Some(next);
        next
    }

    pub fn current(&self) -> Option<Duration> {
        self.average
    }

    pub fn reset(&mut self) {
        self.average = None;
    }
}
