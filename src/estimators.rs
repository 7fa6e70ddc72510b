use std::time::Duration;
use tokio::time::Instant;

/// Fixed-size window of inter-arrival intervals with a robust mean: samples
/// outside [median/8, median*8] are treated as outliers (idle gaps, probe
/// bursts) and excluded.
struct InterArrivalWindow<const N: usize> {
    samples: Vec<f64>,
    next: usize,
}

impl<const N: usize> InterArrivalWindow<N> {
    fn new() -> InterArrivalWindow<N> {
        InterArrivalWindow {
            samples: Vec::with_capacity(N),
            next: 0,
        }
    }

    fn push(&mut self, interval_us: f64) {
        if self.samples.len() < N {
            self.samples.push(interval_us);
        } else {
            self.samples[self.next] = interval_us;
            self.next = (self.next + 1) % N;
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    /// robust mean of the window in microseconds, or `None` if fewer than
    /// half the samples survive the outlier filter
    fn robust_mean_us(&self) -> Option<f64> {
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let median = sorted[sorted.len() / 2];

        let lower = median / 8.0;
        let upper = median * 8.0;

        let mut sum = 0.0;
        let mut count = 0usize;
        for &sample in &self.samples {
            if sample >= lower && sample <= upper {
                sum += sample;
                count += 1;
            }
        }

        if count > self.samples.len() / 2 {
            Some(sum / count as f64)
        } else {
            None
        }
    }
}

/// Estimates the rate at which data packets arrive, in packets per second.
/// Reports 0 until at least eight inter-arrival samples are collected.
pub struct ArrivalSpeedEstimator {
    window: InterArrivalWindow<16>,
    last_arrival: Option<Instant>,
}

const MIN_ARRIVAL_SAMPLES: usize = 8;

impl ArrivalSpeedEstimator {
    pub fn new() -> ArrivalSpeedEstimator {
        ArrivalSpeedEstimator {
            window: InterArrivalWindow::new(),
            last_arrival: None,
        }
    }

    pub fn on_arrival(&mut self, now: Instant) {
        if let Some(prev) = self.last_arrival {
            self.window.push((now - prev).as_micros() as f64);
        }
        self.last_arrival = Some(now);
    }

    pub fn packets_per_second(&self) -> f64 {
        if self.window.len() < MIN_ARRIVAL_SAMPLES {
            return 0.0;
        }
        match self.window.robust_mean_us() {
            Some(mean_us) if mean_us > 0.0 => 1_000_000.0 / mean_us,
            _ => 0.0,
        }
    }
}

/// Estimates the capacity of the link from probe pairs: every 16th packet is
/// sent back-to-back with its successor, so the receiving interval of such a
/// pair approximates the serialization time of one packet on the bottleneck.
pub struct LinkCapacityEstimator {
    window: InterArrivalWindow<64>,
}

impl LinkCapacityEstimator {
    pub fn new() -> LinkCapacityEstimator {
        LinkCapacityEstimator {
            window: InterArrivalWindow::new(),
        }
    }

    pub fn record_probe_interval(&mut self, interval: Duration) {
        self.window.push(interval.as_micros() as f64);
    }

    pub fn packets_per_second(&self) -> f64 {
        if self.window.len() < 2 {
            return 0.0;
        }
        match self.window.robust_mean_us() {
            Some(mean_us) if mean_us > 0.0 => 1_000_000.0 / mean_us,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_arrivals(estimator: &mut ArrivalSpeedEstimator, count: usize, interval: Duration) {
        let mut now = Instant::now();
        for _ in 0..count {
            estimator.on_arrival(now);
            now += interval;
        }
    }

    #[test]
    fn test_arrival_speed_zero_below_sample_threshold() {
        let mut estimator = ArrivalSpeedEstimator::new();
        feed_arrivals(&mut estimator, 8, Duration::from_millis(1));
        // 8 arrivals produce only 7 intervals
        assert_eq!(estimator.packets_per_second(), 0.0);

        estimator.on_arrival(Instant::now() + Duration::from_secs(60));
        assert_ne!(estimator.window.len(), 0);
    }

    #[test]
    fn test_arrival_speed_steady_rate() {
        let mut estimator = ArrivalSpeedEstimator::new();
        feed_arrivals(&mut estimator, 17, Duration::from_millis(1));

        let pps = estimator.packets_per_second();
        assert!((pps - 1000.0).abs() < 1.0, "expected ~1000 pkts/s, got {}", pps);
    }

    #[test]
    fn test_arrival_speed_ignores_idle_gap() {
        let mut estimator = ArrivalSpeedEstimator::new();
        let mut now = Instant::now();
        for i in 0..16 {
            estimator.on_arrival(now);
            // one huge gap in the middle, e.g. the sender pausing
            let interval = if i == 8 {
                Duration::from_secs(2)
            } else {
                Duration::from_millis(1)
            };
            now += interval;
        }
        estimator.on_arrival(now);

        let pps = estimator.packets_per_second();
        assert!((pps - 1000.0).abs() < 10.0, "expected ~1000 pkts/s, got {}", pps);
    }

    #[test]
    fn test_link_capacity_from_probe_pairs() {
        let mut estimator = LinkCapacityEstimator::new();
        assert_eq!(estimator.packets_per_second(), 0.0);

        for _ in 0..4 {
            estimator.record_probe_interval(Duration::from_micros(100));
        }
        let pps = estimator.packets_per_second();
        assert!((pps - 10_000.0).abs() < 1.0, "expected ~10000 pkts/s, got {}", pps);
    }

    #[test]
    fn test_window_wraps() {
        let mut window: InterArrivalWindow<4> = InterArrivalWindow::new();
        for value in [1.0, 2.0, 3.0, 4.0, 5.0, 6.0] {
            window.push(value);
        }
        assert_eq!(window.len(), 4);
        // 1.0 and 2.0 are evicted
        assert_eq!(window.robust_mean_us(), Some((5.0 + 6.0 + 3.0 + 4.0) / 4.0));
    }
}
