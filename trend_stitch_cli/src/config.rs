use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use serde::Deserialize;
use tracing::{debug, warn};
use trend_stitch::{Cadence, Params, RetryPolicy};

/// Optional JSON run configuration. Every field may be omitted; flags given on
/// the command line win over the file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub cadence: Option<Cadence>,
    pub max_step: Option<u32>,
    pub overlap: Option<u32>,
    pub retry: Option<RetryPolicy>,
    /// Minimum spacing between queries, in milliseconds.
    pub pace_ms: Option<u64>,
}

pub fn load_file_config(path: &Path) -> Result<FileConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: FileConfig = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid run config", path.display()))?;
    debug!("Loaded config {}: {:?}", path.display(), config);
    Ok(config)
}

/// Values taken from the command line, before merging.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub cadence: Option<Cadence>,
    pub max_step: Option<u32>,
    pub overlap: Option<u32>,
    pub retries: Option<u32>,
    pub backoff_factor: Option<f64>,
    pub pace_ms: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct RunConfig {
    pub params: Params,
    pub retry: RetryPolicy,
    pub pace: Duration,
}

/// Cadence preset, then the config file, then explicit flags.
pub fn resolve(file: Option<FileConfig>, cli: &Overrides) -> Result<RunConfig> {
    let file = file.unwrap_or_default();
    let cadence = cli.cadence.or(file.cadence).unwrap_or_default();

    let mut params = Params::for_cadence(cadence);
    if let Some(max_step) = cli.max_step.or(file.max_step) {
        params.max_step = max_step;
    }
    if let Some(overlap) = cli.overlap.or(file.overlap) {
        params.overlap = overlap;
    }
    params
        .validate()
        .map_err(|e| anyhow!("invalid window parameters: {}", e))?;
    if params.overlap == 1 {
        warn!("An overlap of one tick leaves no fallback when that tick is zero");
    }

    let mut retry = file.retry.unwrap_or_default();
    if let Some(retries) = cli.retries {
        retry.retries = retries;
    }
    if let Some(backoff) = cli.backoff_factor {
        retry.backoff_factor = backoff;
    }
    retry
        .validate()
        .map_err(|e| anyhow!("invalid retry policy: {}", e))?;

    let pace = Duration::from_millis(cli.pace_ms.or(file.pace_ms).unwrap_or(0));
    Ok(RunConfig {
        params,
        retry,
        pace,
    })
}

/// Accepts `YYYY-MM-DD`, `YYYY-MM-DDTHH`, `YYYY-MM-DDTHH:MM[:SS]` and the
/// space-separated `YYYY-MM-DD HH:MM:SS` form pandas writes.
pub fn parse_timestamp(input: &str) -> Result<NaiveDateTime> {
    let trimmed = input.trim();
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(ts);
        }
    }
    // chrono will not build a time from the hour alone.
    if trimmed.len() == 13 && trimmed.as_bytes().get(10) == Some(&b'T') {
        if let Ok(ts) = NaiveDateTime::parse_from_str(&format!("{}:00", trimmed), "%Y-%m-%dT%H:%M")
        {
            return Ok(ts);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(ts) = date.and_hms_opt(0, 0, 0) {
            return Ok(ts);
        }
    }
    Err(anyhow!("invalid timestamp '{}'", input))
}

/// The most recent complete grid point at or before now.
pub fn default_end(cadence: Cadence) -> Result<NaiveDateTime> {
    let now = Local::now().naive_local();
    let truncated = match cadence {
        Cadence::Daily => now.date().and_hms_opt(0, 0, 0),
        Cadence::Hourly => now
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0)),
    };
    truncated.ok_or_else(|| anyhow!("could not derive a default end from {}", now))
}
