//! Recorded responses, one CSV per window, served back as a fetch collaborator.
//!
//! A recording is named after its window (`<start>_<end>.csv`, timestamps in
//! the cadence's query syntax) and holds a `date` column, one column per
//! identifier and optionally the service's `isPartial` flag.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rayon::prelude::*;
use tracing::debug;
use trend_stitch::{Fetch, FetchError, RawSeries, SamplePoint, Window, WindowResponse};

use crate::config::parse_timestamp;

/// File a window's recorded answer is expected under.
pub fn replay_file_name(window: &Window) -> String {
    format!(
        "{}_{}.csv",
        window.cadence.format(window.start),
        window.cadence.format(window.end)
    )
}

#[derive(Clone, Debug, Default)]
pub struct Recording {
    pub dates: Vec<chrono::NaiveDateTime>,
    pub columns: Vec<(String, Vec<f64>)>,
    pub partial: Vec<bool>,
}

impl Recording {
    fn series(&self, key: &str) -> Option<RawSeries> {
        let (_, values) = self.columns.iter().find(|(name, _)| name == key)?;
        let points = self
            .dates
            .iter()
            .zip(values.iter())
            .map(|(ts, value)| SamplePoint::new(*ts, *value))
            .collect();
        let partial = self.partial.last().copied().unwrap_or(false);
        Some(RawSeries::new(points).with_partial(partial))
    }
}

pub fn read_recording(path: &Path) -> Result<Recording> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = csv::Reader::from_reader(file);
    let headers = reader
        .headers()
        .with_context(|| format!("failed to read header of {}", path.display()))?
        .clone();

    let mut date_idx = None;
    let mut partial_idx = None;
    let mut value_cols = Vec::new();
    for (idx, name) in headers.iter().enumerate() {
        match name.trim() {
            "date" => date_idx = Some(idx),
            "isPartial" => partial_idx = Some(idx),
            other => value_cols.push((idx, other.to_string())),
        }
    }
    let date_idx =
        date_idx.ok_or_else(|| anyhow!("{} has no 'date' column", path.display()))?;

    let mut recording = Recording {
        columns: value_cols
            .iter()
            .map(|(_, name)| (name.clone(), Vec::new()))
            .collect(),
        ..Recording::default()
    };

    for (line, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("{}: bad row {}", path.display(), line + 2))?;
        let date = row
            .get(date_idx)
            .ok_or_else(|| anyhow!("{}: row {} has no date", path.display(), line + 2))?;
        recording.dates.push(
            parse_timestamp(date).with_context(|| format!("{}: row {}", path.display(), line + 2))?,
        );
        for (slot, (idx, name)) in value_cols.iter().enumerate() {
            let cell = row.get(*idx).unwrap_or("").trim();
            let value: f64 = cell.parse().with_context(|| {
                format!(
                    "{}: row {} has non-numeric '{}' for '{}'",
                    path.display(),
                    line + 2,
                    cell,
                    name
                )
            })?;
            recording.columns[slot].1.push(value);
        }
        if let Some(idx) = partial_idx {
            let flag = row.get(idx).unwrap_or("").trim();
            recording.partial.push(flag.eq_ignore_ascii_case("true"));
        }
    }
    Ok(recording)
}

/// Serves windows from a directory of recordings.
pub struct ReplayFetcher {
    dir: PathBuf,
    recordings: HashMap<String, Recording>,
}

impl ReplayFetcher {
    /// Parses every `*.csv` in `dir` up front, in parallel.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "csv") {
                paths.push(path);
            }
        }

        let recordings = paths
            .par_iter()
            .map(|path| -> Result<(String, Recording)> {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| anyhow!("unusable file name {}", path.display()))?
                    .to_string();
                Ok((name, read_recording(path)?))
            })
            .collect::<Result<HashMap<_, _>>>()?;
        debug!("Loaded {} recordings from {}", recordings.len(), dir.display());

        Ok(Self {
            dir: dir.to_path_buf(),
            recordings,
        })
    }

    pub fn len(&self) -> usize {
        self.recordings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recordings.is_empty()
    }
}

impl Fetch for ReplayFetcher {
    fn fetch(&mut self, window: &Window, keys: &[String]) -> Result<WindowResponse, FetchError> {
        let name = replay_file_name(window);
        let recording = self.recordings.get(&name).ok_or_else(|| {
            FetchError::Io(format!(
                "no recorded response for {} (expected {})",
                window.timeframe(),
                self.dir.join(&name).display()
            ))
        })?;
        let mut response = WindowResponse::new();
        for key in keys {
            if let Some(series) = recording.series(key) {
                response.insert(key.clone(), series);
            }
        }
        Ok(response)
    }
}
