use std::fs;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tch::nn::{self, OptimizerConfig};
use tracing::{info, warn};

use facetune::{
    cross_entropy, load_pretrained, split_indices, EpochRunner, ImageFolder, InceptionResnetV1,
    MetricSet, Mode, MultiStepLr, Optimization, RunConfig, ScalarWriter, SubsetLoader,
};

fn header(title: &str) {
    println!("{title}");
    println!("{}", "-".repeat(10));
}

fn main() -> Result<()> {
    let cfg = RunConfig::parse();
    facetune::setup_logging(&cfg.log_level)?;
    cfg.validate()?;

    let start_time = Instant::now();
    tch::set_num_threads(num_cpus::get() as i32);
    let mut rng = match cfg.seed {
        Some(seed) => {
            tch::manual_seed(seed as i64);
            StdRng::seed_from_u64(seed)
        }
        None => StdRng::from_entropy(),
    };
    let device = cfg.device();
    info!("Running on device: {:?} | threads: {}", device, num_cpus::get());

    // =============== DATA ===============
    let dataset = ImageFolder::load(&cfg.data_dir, cfg.image_size, cfg.workers)?;
    let split = split_indices(dataset.len(), cfg.train_fraction, &mut rng);
    info!(
        "Train: {} images | Valid: {} images | Classes ({}): {:?}",
        split.train.len(),
        split.valid.len(),
        dataset.num_classes(),
        dataset.classes()
    );
    let train_loader = SubsetLoader::new(&dataset, split.train, cfg.batch_size)?;
    let val_loader = SubsetLoader::new(&dataset, split.valid, cfg.batch_size)?;
    if val_loader.is_empty() {
        warn!("validation subset is empty, validation epochs will report zeroes");
    }

    // =============== MODEL ===============
    let vs = nn::VarStore::new(device);
    let resnet = InceptionResnetV1::new(&vs.root(), dataset.num_classes() as i64, cfg.dropout);
    match &cfg.pretrained {
        Some(path) => {
            let report = load_pretrained(&vs, path)?;
            info!(
                "Loaded pretrained weights from {} (copied {}, skipped {})",
                path.display(),
                report.copied,
                report.skipped.len()
            );
        }
        None => warn!("no pretrained weights given, training from scratch"),
    }

    let mut optimizer = nn::Adam::default().build(&vs, cfg.learning_rate)?;
    let mut scheduler = MultiStepLr::new(cfg.learning_rate, cfg.milestones.clone(), cfg.gamma);

    let mut writer = ScalarWriter::create(cfg.log_dir(), cfg.log_interval)?;
    writer.write_config(&cfg)?;
    info!("Writing scalars to {}", writer.dir().display());

    let runner = EpochRunner::new(device, cross_entropy)
        .show_running(cfg.show_running())
        .report_interval(cfg.log_interval);
    let mut metrics = MetricSet::default();

    // =============== TRAIN/EVAL ===============
    println!();
    header("Initial");
    let baseline = runner.run(
        &resnet,
        val_loader.batches(&mut rng),
        Mode::Evaluation,
        None,
        &mut metrics,
        Some(&mut writer),
    )?;
    info!("{baseline}");

    for epoch in 0..cfg.epochs {
        println!();
        header(&format!("Epoch {}/{}", epoch + 1, cfg.epochs));

        let optimization = Optimization {
            optimizer: &mut optimizer,
            scheduler: Some(&mut scheduler),
        };
        let train = runner.run(
            &resnet,
            train_loader.batches(&mut rng),
            Mode::Training,
            Some(optimization),
            &mut metrics,
            Some(&mut writer),
        )?;
        let valid = runner.run(
            &resnet,
            val_loader.batches(&mut rng),
            Mode::Evaluation,
            None,
            &mut metrics,
            Some(&mut writer),
        )?;
        info!("{train}");
        info!("{valid}");
        info!("learning rate for next epoch: {:e}", scheduler.lr());
    }

    writer.close()?;

    if let Some(path) = &cfg.save {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        vs.save(path).with_context(|| format!("save weights to {}", path.display()))?;
        info!("Saved fine-tuned weights to {}", path.display());
    }

    info!("Total time: {:.2}s", start_time.elapsed().as_secs_f64());
    Ok(())
}
