use std::time::Instant;

use anyhow::Result;
use tch::{Kind, Tensor};

/// Measures the wall time between consecutive batches.
#[derive(Debug, Clone)]
pub struct BatchTimer {
    start: Instant,
    rate: bool,
    per_sample: bool,
}

impl BatchTimer {
    /// With `rate` the reading is inverted (batches or samples per second);
    /// with `per_sample` it is divided by the batch length first.
    pub fn new(rate: bool, per_sample: bool) -> Self {
        Self { start: Instant::now(), rate, per_sample }
    }

    pub fn update(&mut self, batch_len: usize) -> f64 {
        let now = Instant::now();
        let mut elapsed = now.duration_since(self.start).as_secs_f64();
        self.start = now;

        if self.per_sample {
            elapsed /= batch_len.max(1) as f64;
        }
        if !self.rate {
            return elapsed;
        }
        if elapsed > 0.0 {
            1.0 / elapsed
        } else {
            0.0
        }
    }
}

impl Default for BatchTimer {
    fn default() -> Self {
        Self::new(true, true)
    }
}

/// Fraction of rows whose arg-max logit equals the label.
pub fn accuracy(logits: &Tensor, labels: &Tensor) -> Result<f64> {
    let preds = logits.argmax(-1, false);
    let acc = preds.eq_tensor(labels).to_kind(Kind::Float).mean(Kind::Float);
    Ok(f64::try_from(&acc)?)
}

#[derive(Debug, Clone)]
pub enum Metric {
    Fps(BatchTimer),
    Accuracy,
}

impl Metric {
    pub fn fps() -> Self {
        Metric::Fps(BatchTimer::default())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Metric::Fps(_) => "fps",
            Metric::Accuracy => "acc",
        }
    }

    pub fn update(&mut self, logits: &Tensor, labels: &Tensor) -> Result<f64> {
        match self {
            Metric::Fps(timer) => Ok(timer.update(logits.size()[0] as usize)),
            Metric::Accuracy => accuracy(logits, labels),
        }
    }
}

/// Cumulative mean over the values seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMean {
    sum: f64,
    count: usize,
}

impl RunningMean {
    pub fn update(&mut self, value: f64) -> f64 {
        self.sum += value;
        self.count += 1;
        self.mean()
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// The metrics computed after every batch, in display order. Metric state
/// such as the batch timer lives as long as the set, across epochs.
#[derive(Debug, Clone)]
pub struct MetricSet {
    metrics: Vec<Metric>,
}

impl MetricSet {
    pub fn new(metrics: Vec<Metric>) -> Self {
        Self { metrics }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.metrics.iter().map(Metric::name).collect()
    }

    pub fn update(&mut self, logits: &Tensor, labels: &Tensor) -> Result<Vec<f64>> {
        self.metrics.iter_mut().map(|m| m.update(logits, labels)).collect()
    }
}

impl Default for MetricSet {
    fn default() -> Self {
        Self::new(vec![Metric::fps(), Metric::Accuracy])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn running_mean_equals_arithmetic_mean() {
        let values = [0.5, 1.25, 3.0, 0.0, 7.75];
        let mut running = RunningMean::default();
        for v in values {
            running.update(v);
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        assert_relative_eq!(running.mean(), mean, epsilon = 1e-12);
        assert_eq!(running.count(), 5);
        assert_eq!(RunningMean::default().mean(), 0.0);
    }

    #[test]
    fn accuracy_counts_argmax_hits() {
        let logits = Tensor::from_slice(&[2.0f32, 1.0, 0.0, 3.0, 5.0, 1.0, 0.0, 1.0]).reshape(&[4, 2]);
        let labels = Tensor::from_slice(&[0i64, 1, 1, 0]);
        assert_relative_eq!(accuracy(&logits, &labels).unwrap(), 0.5, epsilon = 1e-6);
    }

    #[test]
    fn timer_reports_samples_per_second() {
        let mut timer = BatchTimer::new(true, true);
        thread::sleep(Duration::from_millis(20));
        let fps = timer.update(4);
        assert!(fps > 0.0 && fps < 4.0 / 0.02 + 1.0, "fps = {fps}");

        let mut raw = BatchTimer::new(false, false);
        thread::sleep(Duration::from_millis(10));
        assert!(raw.update(4) >= 0.01);
    }

    #[test]
    fn default_set_is_fps_then_accuracy() {
        let mut set = MetricSet::default();
        assert_eq!(set.names(), vec!["fps", "acc"]);
        let logits = Tensor::from_slice(&[1.0f32, 0.0]).reshape(&[1, 2]);
        let labels = Tensor::from_slice(&[0i64]);
        let values = set.update(&logits, &labels).unwrap();
        assert_eq!(values.len(), 2);
        assert_relative_eq!(values[1], 1.0);
    }
}
