use std::time::Duration;
use tracing::trace;

/// weight of a new sample in the smoothed RTT
pub const ALPHA: f64 = 0.125;
/// weight of a new sample's deviation in the smoothed RTT deviation
pub const BETA: f64 = 0.25;

/// Smoothed round trip time estimation in the manner of Jacobson / Karels: an exponentially
///  weighted moving average of RTT samples, and of their deviation from that average.
///
/// The retransmission timeout derived from it is `estimated_rtt + 4 * dev_rtt`, but never less
///  than the configured minimum. Before the first sample, the configured initial timeout applies.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    initial_timeout: Duration,
    min_timeout: Duration,
    /// (estimated_rtt, dev_rtt) in seconds, `None` until the first sample
    smoothed: Option<(f64, f64)>,
}

impl RttEstimator {
    pub fn new(initial_timeout: Duration, min_timeout: Duration) -> RttEstimator {
        RttEstimator {
            initial_timeout,
            min_timeout,
            smoothed: None,
        }
    }

    pub fn on_sample(&mut self, sample: Duration) {
        let sample = sample.as_secs_f64();

        let (estimated, dev) = match self.smoothed {
            None => (sample, sample / 2.0),
            Some((estimated, dev)) => {
                let estimated = (1.0 - ALPHA) * estimated + ALPHA * sample;
                let dev = (1.0 - BETA) * dev + BETA * (sample - estimated).abs();
                (estimated, dev)
            }
        };
        self.smoothed = Some((estimated, dev));

        trace!("RTT sample {:.6}s -> estimated {:.6}s, deviation {:.6}s", sample, estimated, dev);
    }

    pub fn estimated_rtt(&self) -> Option<Duration> {
        self.smoothed.map(|(estimated, _)| Duration::from_secs_f64(estimated))
    }

    pub fn dev_rtt(&self) -> Option<Duration> {
        self.smoothed.map(|(_, dev)| Duration::from_secs_f64(dev))
    }

    pub fn timeout(&self) -> Duration {
        match self.smoothed {
            None => self.initial_timeout,
            Some((estimated, dev)) => {
                Duration::from_secs_f64(estimated + 4.0 * dev)
                    .max(self.min_timeout)
            }
        }
    }

    pub fn reset(&mut self) {
        self.smoothed = None;
    }
}
