/// Multiplies the learning rate by `gamma` each time the epoch counter
/// reaches one of the milestones.
#[derive(Debug, Clone)]
pub struct MultiStepLr {
    base_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
    epoch: usize,
}

impl MultiStepLr {
    pub fn new(base_lr: f64, mut milestones: Vec<usize>, gamma: f64) -> Self {
        milestones.sort_unstable();
        Self { base_lr, milestones, gamma, epoch: 0 }
    }

    /// Completed epochs so far.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn lr(&self) -> f64 {
        let passed = self.milestones.iter().filter(|&&m| m <= self.epoch).count();
        self.base_lr * self.gamma.powi(passed as i32)
    }

    /// Marks one more epoch as done and returns the rate for the next one.
    pub fn step(&mut self) -> f64 {
        self.epoch += 1;
        self.lr()
    }
}
