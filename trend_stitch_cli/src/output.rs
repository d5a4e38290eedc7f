use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use trend_stitch::{Calibration, DegenerateOverlap, Params, Reconstruction, Window};

use crate::replay::replay_file_name;

/// Opens `path` for writing, or stdout when it is `-`.
fn sink(path: &Path) -> Result<Box<dyn Write>> {
    if path.as_os_str() == "-" {
        Ok(Box::new(io::stdout().lock()))
    } else {
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        Ok(Box::new(file))
    }
}

/// One row per tick: `date`, one column per identifier in request order, and
/// `isPartial`, set on the newest row only.
pub fn write_series_csv(result: &Reconstruction, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_writer(sink(path)?);
    write_series_rows(result, &mut writer)?;
    writer.flush()?;
    Ok(())
}

fn write_series_rows<W: Write>(result: &Reconstruction, writer: &mut csv::Writer<W>) -> Result<()> {
    let mut header = vec!["date".to_string()];
    header.extend(result.keys.iter().cloned());
    header.push("isPartial".to_string());
    writer.write_record(&header)?;

    let columns = result
        .keys
        .iter()
        .map(|key| {
            result
                .get(key)
                .ok_or_else(|| anyhow!("no stitched series for '{}'", key))
        })
        .collect::<Result<Vec<_>>>()?;
    let Some(reference) = columns.first() else {
        return Ok(());
    };
    let partial = columns.iter().any(|s| s.is_partial());
    let rows = reference.len();
    let cadence = result.params.cadence;

    for (idx, point) in reference.points().iter().enumerate() {
        let mut record = Vec::with_capacity(columns.len() + 2);
        record.push(cadence.format(point.timestamp));
        for series in &columns {
            let value = series
                .points()
                .get(idx)
                .filter(|p| p.timestamp == point.timestamp)
                .ok_or_else(|| anyhow!("series are not aligned at row {}", idx))?
                .value;
            record.push(value.to_string());
        }
        let last = idx + 1 == rows;
        record.push(if partial && last { "True" } else { "False" }.to_string());
        writer.write_record(&record)?;
    }
    Ok(())
}

#[derive(Serialize)]
struct Report<'a> {
    start: String,
    end: String,
    params: &'a Params,
    params_hash: &'a str,
    keys: &'a [String],
    windows: Vec<WindowRow>,
    calibrations: &'a [Calibration],
    warnings: Vec<WarningRow<'a>>,
}

#[derive(Serialize)]
struct WarningRow<'a> {
    #[serde(flatten)]
    overlap: &'a DegenerateOverlap,
    message: String,
}

/// Run metadata and the per-window calibration log.
pub fn write_report_json(result: &Reconstruction, path: &Path) -> Result<()> {
    let cadence = result.params.cadence;
    let report = Report {
        start: cadence.format(result.start),
        end: cadence.format(result.end),
        params: &result.params,
        params_hash: &result.params_hash,
        keys: &result.keys,
        windows: plan_rows(&result.windows),
        calibrations: &result.calibrations,
        warnings: result
            .warnings
            .iter()
            .map(|overlap| WarningRow {
                overlap,
                message: overlap.to_string(),
            })
            .collect(),
    };
    let mut out = sink(path)?;
    serde_json::to_writer_pretty(&mut out, &report)
        .with_context(|| format!("failed to write {}", path.display()))?;
    writeln!(out)?;
    Ok(())
}

#[derive(Debug, Serialize, PartialEq)]
pub struct WindowRow {
    pub index: usize,
    pub start: String,
    pub end: String,
    pub ticks: usize,
    pub timeframe: String,
    pub replay_file: String,
}

pub fn plan_rows(windows: &[Window]) -> Vec<WindowRow> {
    windows
        .iter()
        .enumerate()
        .map(|(index, w)| WindowRow {
            index,
            start: w.cadence.format(w.start),
            end: w.cadence.format(w.end),
            ticks: w.tick_count(),
            timeframe: w.timeframe(),
            replay_file: replay_file_name(w),
        })
        .collect()
}

/// The query schedule, newest window first.
pub fn write_plan_csv(windows: &[Window], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_writer(sink(path)?);
    for row in plan_rows(windows) {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}
