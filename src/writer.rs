use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const SCALARS_FILE: &str = "scalars.jsonl";
pub const CONFIG_FILE: &str = "config.json";

/// One line of the scalar log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub tag: String,
    pub series: String,
    pub step: u64,
    pub value: f64,
    pub wall_time: f64,
}

/// Append-only JSON-lines scalar log.
///
/// `iteration` is the global step shared by every epoch of a run; training
/// epochs only write when it is a multiple of `interval`.
#[derive(Debug)]
pub struct ScalarWriter {
    dir: PathBuf,
    out: BufWriter<File>,
    iteration: u64,
    interval: u64,
}

impl ScalarWriter {
    pub fn create(dir: impl AsRef<Path>, interval: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("create log dir {}", dir.display()))?;
        let path = dir.join(SCALARS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self {
            dir,
            out: BufWriter::new(file),
            iteration: 0,
            interval: interval.max(1) as u64,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn due(&self) -> bool {
        self.iteration % self.interval == 0
    }

    pub fn advance(&mut self) {
        self.iteration += 1;
    }

    pub fn add_scalar(&mut self, tag: &str, series: &str, value: f64) -> Result<()> {
        let record = ScalarRecord {
            tag: tag.to_string(),
            series: series.to_string(),
            step: self.iteration,
            value,
            wall_time: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        };
        serde_json::to_writer(&mut self.out, &record)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    pub fn write_config<T: Serialize>(&self, config: &T) -> Result<()> {
        let path = self.dir.join(CONFIG_FILE);
        let file = File::create(&path).with_context(|| format!("create {}", path.display()))?;
        serde_json::to_writer_pretty(file, config)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

/// Reads a scalar log back, mostly for inspection and tests.
pub fn read_scalars(dir: impl AsRef<Path>) -> Result<Vec<ScalarRecord>> {
    let path = dir.as_ref().join(SCALARS_FILE);
    let text = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).with_context(|| format!("bad record: {l}")))
        .collect()
}
