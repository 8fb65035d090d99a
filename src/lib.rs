//! Fine-tuning of a pretrained InceptionResnetV1 face model on a
//! folder-per-class image dataset.
//!
//! The pieces compose in the order a run uses them: [`data`] loads and splits
//! the images, [`model`] builds the network and imports VGGFace2 weights, and
//! [`epoch::EpochRunner`] drives each training or validation pass while
//! [`metrics`], [`scheduler`] and [`writer`] track what happens.

pub mod config;
pub mod data;
pub mod epoch;
pub mod metrics;
pub mod model;
pub mod scheduler;
pub mod writer;

pub use config::RunConfig;
pub use data::{split_indices, ImageFolder, Split, SubsetLoader};
pub use epoch::{cross_entropy, EpochRunner, EpochSummary, Mode, Optimization};
pub use metrics::{Metric, MetricSet, RunningMean};
pub use model::{load_pretrained, InceptionResnetV1};
pub use scheduler::MultiStepLr;
pub use writer::ScalarWriter;

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global tracing subscriber; `RUST_LOG` overrides `level`.
pub fn setup_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init()?;
    Ok(())
}
