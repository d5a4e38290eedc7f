//! Reconstruction of long, fine-grained popularity series from a rate-limited
//! index service that only answers bounded windows on a relative 0-100 scale.
//!
//! The work is split in two: [`plan_windows`] walks backward from the end of
//! the requested range and emits overlapping windows, and [`stitch`] /
//! [`reconstruct`] fold the per-window responses into one series expressed on
//! the scale of the most recent window.

use std::fmt;

use chrono::{Duration, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod fetch;
pub mod plan;
pub mod stitch;

pub use fetch::{Fetch, FetchError, PacedFetcher, RetryPolicy, RetryingFetcher, WindowResponse};
pub use plan::plan_windows;
pub use stitch::{
    reconstruct, stitch, Calibration, DegenerateOverlap, Reconstruction, Stitcher,
};

#[derive(Error, Debug)]
pub enum StitchError {
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("no data returned for '{key}' in window {window}")]
    NoData { key: String, window: Window },
    #[error("malformed series for '{key}' in window {window}: {reason}")]
    MalformedSeries {
        key: String,
        window: Window,
        reason: String,
    },
}

/// Sampling interval of a series. The service picks it from the window
/// length, so it is fixed per run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Daily,
    Hourly,
}

impl Default for Cadence {
    fn default() -> Self {
        Cadence::Daily
    }
}

impl Cadence {
    /// Duration of `n` ticks.
    pub fn ticks(self, n: i64) -> Duration {
        match self {
            Cadence::Daily => Duration::days(n),
            Cadence::Hourly => Duration::hours(n),
        }
    }

    /// Whole ticks from `start` to `end`; negative when `end` precedes `start`.
    pub fn ticks_between(self, start: NaiveDateTime, end: NaiveDateTime) -> i64 {
        let span = end - start;
        match self {
            Cadence::Daily => span.num_days(),
            Cadence::Hourly => span.num_hours(),
        }
    }

    pub fn is_aligned(self, ts: NaiveDateTime) -> bool {
        let sub_hour = ts.minute() == 0 && ts.second() == 0 && ts.nanosecond() == 0;
        match self {
            Cadence::Daily => sub_hour && ts.hour() == 0,
            Cadence::Hourly => sub_hour,
        }
    }

    /// Timestamp syntax the service expects inside a timeframe.
    pub fn timestamp_format(self) -> &'static str {
        match self {
            Cadence::Daily => "%Y-%m-%d",
            Cadence::Hourly => "%Y-%m-%dT%H",
        }
    }

    pub fn format(self, ts: NaiveDateTime) -> String {
        ts.format(self.timestamp_format()).to_string()
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cadence::Daily => f.write_str("daily"),
            Cadence::Hourly => f.write_str("hourly"),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct SamplePoint {
    pub timestamp: NaiveDateTime,
    pub value: f64,
}

impl SamplePoint {
    pub fn new(timestamp: NaiveDateTime, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Closed range `[start, end]` on the cadence grid, submitted as one query.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Window {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub cadence: Cadence,
}

impl Window {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime, cadence: Cadence) -> Self {
        Self {
            start,
            end,
            cadence,
        }
    }

    pub fn tick_count(&self) -> usize {
        (self.cadence.ticks_between(self.start, self.end) + 1).max(0) as usize
    }

    pub fn ticks(&self) -> impl Iterator<Item = NaiveDateTime> + '_ {
        (0..self.tick_count() as i64).map(move |i| self.start + self.cadence.ticks(i))
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        self.start <= ts && ts <= self.end
    }

    /// Query timeframe in the service's syntax, e.g. `2019-01-01 2019-09-27`.
    pub fn timeframe(&self) -> String {
        format!(
            "{} {}",
            self.cadence.format(self.start),
            self.cadence.format(self.end)
        )
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}]",
            self.cadence.format(self.start),
            self.cadence.format(self.end)
        )
    }
}

/// One window's answer for one identifier, on the service's own 0-100 scale.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RawSeries {
    pub points: Vec<SamplePoint>,
    /// The newest sample covers an incomplete period.
    #[serde(default)]
    pub partial: bool,
}

impl RawSeries {
    pub fn new(points: Vec<SamplePoint>) -> Self {
        Self {
            points,
            partial: false,
        }
    }

    pub fn with_partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    /// Builds a series over every tick of `window` from values in tick order.
    pub fn from_values(window: &Window, values: &[f64]) -> Self {
        Self::new(
            window
                .ticks()
                .zip(values.iter().copied())
                .map(|(timestamp, value)| SamplePoint { timestamp, value })
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Checks the series is gap-free over `window` and stays on the 0-100 scale.
    pub fn validate(&self, key: &str, window: &Window) -> Result<(), StitchError> {
        let malformed = |reason: String| StitchError::MalformedSeries {
            key: key.to_string(),
            window: *window,
            reason,
        };
        if self.is_empty() {
            return Err(StitchError::NoData {
                key: key.to_string(),
                window: *window,
            });
        }
        let expected = window.tick_count();
        if self.points.len() != expected {
            return Err(malformed(format!(
                "expected {} samples, got {}",
                expected,
                self.points.len()
            )));
        }
        for (point, tick) in self.points.iter().zip(window.ticks()) {
            if point.timestamp != tick {
                return Err(malformed(format!(
                    "sample at {} where {} was expected",
                    window.cadence.format(point.timestamp),
                    window.cadence.format(tick)
                )));
            }
            if !point.value.is_finite() || !(0.0..=100.0).contains(&point.value) {
                return Err(malformed(format!(
                    "value {} at {} is outside 0..=100",
                    point.value,
                    window.cadence.format(point.timestamp)
                )));
            }
        }
        Ok(())
    }
}

/// Gap-free, duplicate-free series over the full requested range, every value
/// expressed on the scale of the most recent window.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StitchedSeries {
    points: Vec<SamplePoint>,
    partial: bool,
}

impl StitchedSeries {
    pub(crate) fn from_parts(points: Vec<SamplePoint>, partial: bool) -> Self {
        Self { points, partial }
    }

    pub fn points(&self) -> &[SamplePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn start(&self) -> Option<NaiveDateTime> {
        self.points.first().map(|p| p.timestamp)
    }

    pub fn end(&self) -> Option<NaiveDateTime> {
        self.points.last().map(|p| p.timestamp)
    }

    pub fn value_at(&self, ts: NaiveDateTime) -> Option<f64> {
        self.points
            .binary_search_by(|p| p.timestamp.cmp(&ts))
            .ok()
            .map(|idx| self.points[idx].value)
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|p| p.value)
    }

    /// Whether the newest sample covers an incomplete period.
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn into_points(self) -> Vec<SamplePoint> {
        self.points
    }
}

/// Per-run service limits. Defaults to the daily-resolution profile.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Params {
    pub cadence: Cadence,
    /// Longest window, in ticks, the service answers at `cadence`.
    pub max_step: u32,
    /// Ticks shared by consecutive windows.
    pub overlap: u32,
}

impl Default for Params {
    fn default() -> Self {
        Self::for_cadence(Cadence::Daily)
    }
}

impl Params {
    /// Service limits known to keep the requested granularity.
    pub fn for_cadence(cadence: Cadence) -> Self {
        match cadence {
            Cadence::Daily => Self {
                cadence,
                max_step: 269,
                overlap: 40,
            },
            Cadence::Hourly => Self {
                cadence,
                max_step: 168,
                overlap: 18,
            },
        }
    }

    /// New ticks contributed by every window after the first.
    pub fn step(&self) -> u32 {
        self.max_step.saturating_sub(self.overlap) + 1
    }

    pub fn validate(&self) -> Result<(), StitchError> {
        if self.overlap < 1 {
            return Err(StitchError::InvalidRange(
                "overlap must be at least one tick".into(),
            ));
        }
        if self.overlap >= self.max_step {
            return Err(StitchError::InvalidRange(format!(
                "overlap ({}) must be smaller than max_step ({})",
                self.overlap, self.max_step
            )));
        }
        Ok(())
    }

    /// SHA-256 of the canonical run description, for tracing outputs back to
    /// the configuration that produced them.
    pub fn params_hash(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        keys: &[String],
    ) -> Result<String, StitchError> {
        let run = serde_json::json!({
            "params": self,
            "start": start,
            "end": end,
            "keys": keys,
        });
        let bytes =
            serde_json::to_vec(&run).map_err(|e| StitchError::InvalidRange(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
