use std::path::PathBuf;

use anyhow::{ensure, Result};
use clap::Parser;
use serde::Serialize;
use tch::Device;

/// Fine-tune a pretrained InceptionResnetV1 on a folder-per-class image dataset.
#[derive(Parser, Debug, Clone, Serialize)]
#[command(name = "facetune", version, about)]
pub struct RunConfig {
    /// Dataset root: one subdirectory per class
    #[arg(long, default_value = "facial_recognition/data")]
    pub data_dir: PathBuf,

    #[arg(long, default_value_t = 32)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 8)]
    pub epochs: usize,

    /// Threads used to decode images
    #[arg(long, default_value_t = 8)]
    pub workers: usize,

    /// Fraction of the shuffled indices used for training, the rest is validation
    #[arg(long, default_value_t = 0.8)]
    pub train_fraction: f64,

    #[arg(long, default_value_t = 1e-3)]
    pub learning_rate: f64,

    /// Epochs after which the learning rate is multiplied by `gamma`
    #[arg(long, value_delimiter = ',', default_value = "5,10")]
    pub milestones: Vec<usize>,

    #[arg(long, default_value_t = 0.1)]
    pub gamma: f64,

    /// Write training scalars every N global steps
    #[arg(long, default_value_t = 10)]
    pub log_interval: usize,

    /// Side length images are resized to
    #[arg(long, default_value_t = 160)]
    pub image_size: u32,

    #[arg(long, default_value_t = 0.6)]
    pub dropout: f64,

    /// VGGFace2 InceptionResnetV1 weights (safetensors, facenet state-dict names)
    #[arg(long)]
    pub pretrained: Option<PathBuf>,

    /// Scalar log directory (default: runs/<date>_<time>)
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Save the fine-tuned weights here when training ends
    #[arg(long)]
    pub save: Option<PathBuf>,

    /// Seed for the split and batch shuffles
    #[arg(long)]
    pub seed: Option<u64>,

    /// Stay on the CPU even when CUDA is available
    #[arg(long)]
    pub cpu: bool,

    /// Show per-batch values instead of running averages
    #[arg(long)]
    pub no_running: bool,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch size must be positive");
        ensure!(self.log_interval > 0, "log interval must be positive");
        ensure!(
            self.train_fraction > 0.0 && self.train_fraction < 1.0,
            "train fraction must lie in (0, 1), got {}",
            self.train_fraction
        );
        ensure!(self.image_size > 0, "image size must be positive");
        Ok(())
    }

    pub fn device(&self) -> Device {
        if self.cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available()
        }
    }

    pub fn show_running(&self) -> bool {
        !self.no_running
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| {
            PathBuf::from("runs").join(chrono::Local::now().format("%b%d_%H-%M-%S").to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_run() {
        let cfg = RunConfig::parse_from(["facetune"]);
        assert_eq!(cfg.batch_size, 32);
        assert_eq!(cfg.epochs, 8);
        assert_eq!(cfg.workers, 8);
        assert_eq!(cfg.milestones, vec![5, 10]);
        assert_eq!(cfg.log_interval, 10);
        assert!(cfg.show_running());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parses_milestone_list() {
        let cfg = RunConfig::parse_from(["facetune", "--milestones", "3,6,9", "--cpu"]);
        assert_eq!(cfg.milestones, vec![3, 6, 9]);
        assert_eq!(cfg.device(), Device::Cpu);
    }

    #[test]
    fn rejects_bad_values() {
        let cfg = RunConfig::parse_from(["facetune", "--train-fraction", "1.0"]);
        assert!(cfg.validate().is_err());
        let cfg = RunConfig::parse_from(["facetune", "--batch-size", "0"]);
        assert!(cfg.validate().is_err());
        let cfg = RunConfig::parse_from(["facetune", "--log-interval", "0"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn explicit_log_dir_wins() {
        let cfg = RunConfig::parse_from(["facetune", "--log-dir", "/tmp/run1"]);
        assert_eq!(cfg.log_dir(), PathBuf::from("/tmp/run1"));
    }
}
