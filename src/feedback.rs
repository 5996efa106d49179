//! Post-adaptation feedback: compares the sample that triggered an adaptation
//! with the first sample taken after it.

use crate::metrics::MetricsSample;

/// Change observed on one metric dimension.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DimensionDelta {
    pub before: f64,
    pub after: f64,
    /// `after - before`; negative means the metric went down.
    pub delta: f64,
    pub improved: bool,
}

impl DimensionDelta {
    fn measure(before: f64, after: f64, tolerance: f64) -> Self {
        Self {
            before,
            after,
            delta: after - before,
            improved: after < before - tolerance,
        }
    }

    /// Relative change as a fraction of the baseline; `None` for a zero
    /// baseline.
    pub fn relative(&self) -> Option<f64> {
        (self.before > 0.0).then(|| self.delta / self.before)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ImprovementReport {
    pub traffic_volume: DimensionDelta,
    pub delay: DimensionDelta,
    /// Both dimensions improved beyond the tolerance.
    pub improved: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct FeedbackMonitor {
    tolerance: f64,
}

impl FeedbackMonitor {
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }

    pub fn observe(&self, before: &MetricsSample, after: &MetricsSample) -> ImprovementReport {
        let traffic_volume = DimensionDelta::measure(
            before.traffic_volume(),
            after.traffic_volume(),
            self.tolerance,
        );
        let delay = DimensionDelta::measure(before.delay(), after.delay(), self.tolerance);
        ImprovementReport {
            traffic_volume,
            delay,
            improved: traffic_volume.improved && delay.improved,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(traffic: f64, delay: f64) -> MetricsSample {
        MetricsSample::new(traffic, delay, false).unwrap()
    }

    #[test]
    fn improvement_on_both_dimensions() {
        let monitor = FeedbackMonitor::new(0.0);
        let report = monitor.observe(&sample(1.5, 0.1), &sample(0.9, 0.05));

        assert!(report.improved);
        assert!(report.traffic_volume.improved);
        assert!(report.delay.improved);
        assert!((report.traffic_volume.delta - (-0.6)).abs() < 1e-9);
        assert!((report.delay.delta - (-0.05)).abs() < 1e-9);
        let relative = report.traffic_volume.relative().unwrap();
        assert!((relative - (-0.4)).abs() < 1e-9);
    }

    #[test]
    fn no_improvement_is_reported_not_raised() {
        let monitor = FeedbackMonitor::new(0.0);
        let report = monitor.observe(&sample(0.9, 0.1), &sample(1.1, 0.1));

        assert!(!report.improved);
        assert!(!report.traffic_volume.improved);
        assert!(!report.delay.improved);
    }

    #[test]
    fn one_dimension_is_not_enough() {
        let monitor = FeedbackMonitor::new(0.0);
        let report = monitor.observe(&sample(1.5, 0.1), &sample(0.9, 0.2));
        assert!(report.traffic_volume.improved);
        assert!(!report.delay.improved);
        assert!(!report.improved);
    }

    #[test]
    fn tolerance_requires_a_margin() {
        let monitor = FeedbackMonitor::new(0.1);
        let report = monitor.observe(&sample(1.0, 0.3), &sample(0.95, 0.1));
        assert!(!report.traffic_volume.improved);
        assert!(report.delay.improved);
        assert!(!report.improved);
    }

    #[test]
    fn zero_baseline_has_no_relative_change() {
        let monitor = FeedbackMonitor::new(0.0);
        let report = monitor.observe(&sample(0.0, 0.0), &sample(0.0, 0.0));
        assert_eq!(report.delay.relative(), None);
        assert!(!report.improved);
    }
}
