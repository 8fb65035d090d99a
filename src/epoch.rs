use std::fmt;

use anyhow::{bail, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tch::{nn, nn::ModuleT, Device, Tensor};
use tracing::debug;

use crate::metrics::{MetricSet, RunningMean};
use crate::scheduler::MultiStepLr;
use crate::writer::ScalarWriter;

pub type LossFn = fn(&Tensor, &Tensor) -> Tensor;

pub fn cross_entropy(logits: &Tensor, targets: &Tensor) -> Tensor {
    logits.cross_entropy_for_logits(targets)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Training,
    Evaluation,
}

impl Mode {
    pub fn is_training(self) -> bool {
        self == Mode::Training
    }

    /// Series name used on the console and in the scalar log.
    pub fn label(self) -> &'static str {
        match self {
            Mode::Training => "Train",
            Mode::Evaluation => "Valid",
        }
    }
}

/// What a training epoch updates the parameters with.
pub struct Optimization<'a> {
    pub optimizer: &'a mut nn::Optimizer,
    pub scheduler: Option<&'a mut MultiStepLr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub mode: Mode,
    pub batches: usize,
    pub loss: f64,
    pub metrics: Vec<(&'static str, f64)>,
}

impl EpochSummary {
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.iter().find(|(n, _)| *n == name).map(|&(_, v)| v)
    }
}

impl fmt::Display for EpochSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | {}", self.mode.label(), format_values(self.loss, &self.metrics))
    }
}

fn format_values(loss: f64, metrics: &[(&'static str, f64)]) -> String {
    let mut line = format!("loss: {loss:9.4}");
    for (name, value) in metrics {
        line.push_str(&format!(" | {name}: {value:9.4}"));
    }
    line
}

/// Runs one pass over a batch iterator, in training or evaluation mode.
///
/// Loss and metrics are averaged with a cumulative mean over the batches of
/// the epoch. Training epochs log their running averages every `interval`
/// global steps of the writer; evaluation epochs log the epoch-end averages
/// once. The scheduler, when given, is stepped once at the end of a training
/// epoch.
#[derive(Clone)]
pub struct EpochRunner {
    device: Device,
    loss_fn: LossFn,
    show_running: bool,
    progress: bool,
    report_interval: usize,
}

impl EpochRunner {
    pub fn new(device: Device, loss_fn: LossFn) -> Self {
        Self {
            device,
            loss_fn,
            show_running: true,
            progress: true,
            report_interval: 10,
        }
    }

    /// Show running averages (default) or the values of the latest batch.
    pub fn show_running(mut self, yes: bool) -> Self {
        self.show_running = yes;
        self
    }

    pub fn progress(mut self, yes: bool) -> Self {
        self.progress = yes;
        self
    }

    /// Refresh the console line every `n` batches.
    pub fn report_interval(mut self, n: usize) -> Self {
        self.report_interval = n.max(1);
        self
    }

    fn progress_bar(&self, len: usize, mode: Mode) -> Result<ProgressBar> {
        if !self.progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "{prefix} | {pos:>5}/{len:<5} │{bar:32.magenta/blue}│ {elapsed_precise} • {msg}",
            )?
            .progress_chars("█▓░"),
        );
        pb.set_prefix(mode.label());
        Ok(pb)
    }

    /// The console line after `seen` of `total` batches, or `None` when the
    /// line is not due. Due every `report_interval` batches and on the last.
    fn report_line(
        &self,
        seen: usize,
        total: usize,
        names: &[&'static str],
        running: (&RunningMean, &[RunningMean]),
        latest: (f64, &[f64]),
    ) -> Option<String> {
        if seen % self.report_interval != 0 && seen != total {
            return None;
        }
        let line = if self.show_running {
            let (loss, means) = running;
            let values: Vec<_> = names.iter().copied().zip(means.iter().map(RunningMean::mean)).collect();
            format_values(loss.mean(), &values)
        } else {
            let (loss, batch) = latest;
            let values: Vec<_> = names.iter().copied().zip(batch.iter().copied()).collect();
            format_values(loss, &values)
        };
        Some(line)
    }

    pub fn run<M, I>(
        &self,
        model: &M,
        batches: I,
        mode: Mode,
        mut optimization: Option<Optimization<'_>>,
        metrics: &mut MetricSet,
        mut writer: Option<&mut ScalarWriter>,
    ) -> Result<EpochSummary>
    where
        M: ModuleT,
        I: IntoIterator<Item = (Tensor, Tensor)>,
        I::IntoIter: ExactSizeIterator,
    {
        if mode.is_training() && optimization.is_none() {
            bail!("a training epoch needs an optimizer");
        }

        let batches = batches.into_iter();
        let total = batches.len();
        let pb = self.progress_bar(total, mode)?;

        let names = metrics.names();
        let mut loss_mean = RunningMean::default();
        let mut metric_means = vec![RunningMean::default(); names.len()];

        for (i, (xs, ys)) in batches.enumerate() {
            let xs = xs.to_device(self.device);
            let ys = ys.to_device(self.device);

            let (logits, loss) = match optimization.as_mut() {
                Some(opt) if mode.is_training() => {
                    let logits = model.forward_t(&xs, true);
                    let loss = (self.loss_fn)(&logits, &ys);
                    opt.optimizer.backward_step(&loss);
                    (logits, loss)
                }
                _ => tch::no_grad(|| {
                    let logits = model.forward_t(&xs, false);
                    let loss = (self.loss_fn)(&logits, &ys);
                    (logits, loss)
                }),
            };

            let batch_loss = f64::try_from(&loss)?;
            let batch_metrics = tch::no_grad(|| metrics.update(&logits, &ys))?;
            loss_mean.update(batch_loss);
            for (mean, &value) in metric_means.iter_mut().zip(&batch_metrics) {
                mean.update(value);
            }

            if mode.is_training() {
                if let Some(w) = writer.as_deref_mut() {
                    if w.due() {
                        w.add_scalar("loss", mode.label(), loss_mean.mean())?;
                        for (name, mean) in names.iter().zip(&metric_means) {
                            w.add_scalar(name, mode.label(), mean.mean())?;
                        }
                    }
                    w.advance();
                }
            }

            pb.inc(1);
            let line = self.report_line(
                i + 1,
                total,
                &names,
                (&loss_mean, metric_means.as_slice()),
                (batch_loss, batch_metrics.as_slice()),
            );
            if let Some(line) = line {
                pb.set_message(line);
            }
        }
        pb.finish();

        if let Some(Optimization { optimizer, scheduler: Some(scheduler) }) = optimization {
            if mode.is_training() {
                let lr = scheduler.step();
                optimizer.set_lr(lr);
                debug!("scheduler epoch {} -> lr {:e}", scheduler.epoch(), lr);
            }
        }

        let summary = EpochSummary {
            mode,
            batches: loss_mean.count(),
            loss: loss_mean.mean(),
            metrics: names.iter().copied().zip(metric_means.iter().map(RunningMean::mean)).collect(),
        };

        if !mode.is_training() {
            if let Some(w) = writer {
                w.add_scalar("loss", mode.label(), summary.loss)?;
                for &(name, value) in &summary.metrics {
                    w.add_scalar(name, mode.label(), value)?;
                }
            }
        }

        Ok(summary)
    }
}
