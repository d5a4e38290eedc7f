use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::fetch::{Fetch, FetchError, WindowResponse};
use crate::plan::plan_windows;
use crate::{Params, RawSeries, SamplePoint, StitchError, StitchedSeries, Window};

/// How one window was brought onto the reference scale.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Calibration {
    pub key: String,
    pub window: Window,
    /// Samples the window shares with the assembled series.
    pub overlap_len: usize,
    pub scaling: f64,
    /// Newest tick that was rescaled and prepended.
    pub rescaled_through: NaiveDateTime,
    pub degenerate: bool,
}

impl Calibration {
    pub fn warning(&self) -> Option<DegenerateOverlap> {
        self.degenerate.then(|| DegenerateOverlap {
            key: self.key.clone(),
            window: self.window,
            low_confidence_through: self.rescaled_through,
        })
    }
}

/// The whole overlap of a window was zero, so its older samples were scaled
/// by zero. Everything up to and including `low_confidence_through` carries
/// no usable signal for `key`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DegenerateOverlap {
    pub key: String,
    pub window: Window,
    pub low_confidence_through: NaiveDateTime,
}

impl fmt::Display for DegenerateOverlap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' in window {}: overlap is all zero, samples through {} forced to zero",
            self.key,
            self.window,
            self.window.cadence.format(self.low_confidence_through)
        )
    }
}

/// Running state of one identifier's fold. Windows are absorbed newest first;
/// every absorbed window prepends its rescaled non-overlap samples.
#[derive(Clone, Debug)]
pub struct Stitcher {
    key: String,
    points: VecDeque<SamplePoint>,
    partial: bool,
    calibrations: Vec<Calibration>,
}

impl Stitcher {
    /// Seeds the fold with the most recent window, whose native scale becomes
    /// the reference for everything older.
    pub fn new(
        key: impl Into<String>,
        window: &Window,
        raw: RawSeries,
    ) -> Result<Self, StitchError> {
        let key = key.into();
        raw.validate(&key, window)?;
        debug!("Seeded '{}' from {} ({} samples)", key, window, raw.len());
        Ok(Self {
            key,
            points: raw.points.into(),
            partial: raw.partial,
            calibrations: Vec::new(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn start(&self) -> Option<NaiveDateTime> {
        self.points.front().map(|p| p.timestamp)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn calibrations(&self) -> &[Calibration] {
        &self.calibrations
    }

    /// Rescales `raw` against the assembled series through the samples they
    /// share and prepends the part older than the assembled start.
    pub fn absorb(&mut self, window: &Window, raw: &RawSeries) -> Result<Calibration, StitchError> {
        raw.validate(&self.key, window)?;
        let malformed = |reason: &str| StitchError::MalformedSeries {
            key: self.key.clone(),
            window: *window,
            reason: reason.to_string(),
        };

        let (head, tail) = match (self.points.front(), self.points.back()) {
            (Some(first), Some(last)) => (first.timestamp, last.timestamp),
            _ => return Err(malformed("nothing assembled to calibrate against")),
        };

        let split = raw.points.partition_point(|p| p.timestamp < head);
        if split == 0 {
            return Err(malformed("window adds no samples older than the assembled series"));
        }
        let overlap_len = raw.points.len() - split;
        if overlap_len == 0 || raw.points[split].timestamp != head {
            return Err(malformed("window does not overlap the assembled series"));
        }
        if overlap_len > self.points.len() || window.end > tail {
            return Err(malformed("window extends past the assembled series"));
        }

        // Newest shared tick first; zeros carry no scale information.
        let found = (0..overlap_len).rev().find_map(|i| {
            let fresh = raw.points[split + i].value;
            (fresh != 0.0).then(|| self.points[i].value / fresh)
        });
        let (scaling, degenerate) = match found {
            Some(scaling) => (scaling, false),
            None => {
                warn!(
                    "Did not find non-zero overlap for '{}' in {}; set scaling to zero (increase overlap)",
                    self.key, window
                );
                (0.0, true)
            }
        };
        debug!(
            "Scaling '{}' in {} by {:.6} ({} shared samples)",
            self.key, window, scaling, overlap_len
        );

        for point in raw.points[..split].iter().rev() {
            self.points
                .push_front(SamplePoint::new(point.timestamp, point.value * scaling));
        }

        let calibration = Calibration {
            key: self.key.clone(),
            window: *window,
            overlap_len,
            scaling,
            rescaled_through: raw.points[split - 1].timestamp,
            degenerate,
        };
        self.calibrations.push(calibration.clone());
        Ok(calibration)
    }

    pub fn finish(self) -> StitchedSeries {
        StitchedSeries::from_parts(self.points.into(), self.partial)
    }
}

/// Folds the windows of one identifier, newest first, into a single series.
/// `windows` must be in the order [`plan_windows`] emits them.
pub fn stitch<F>(key: &str, windows: &[Window], mut fetch: F) -> Result<StitchedSeries, StitchError>
where
    F: FnMut(&Window) -> Result<RawSeries, FetchError>,
{
    let (first, rest) = windows
        .split_first()
        .ok_or_else(|| StitchError::InvalidRange("no windows to stitch".into()))?;

    let mut stitcher = Stitcher::new(key, first, fetch(first)?)?;
    for window in rest {
        let raw = fetch(window)?;
        stitcher.absorb(window, &raw)?;
    }
    Ok(stitcher.finish())
}

/// Outcome of a full reconstruction run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reconstruction {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub params: Params,
    pub params_hash: String,
    /// Identifiers in the order they were requested.
    pub keys: Vec<String>,
    pub windows: Vec<Window>,
    pub series: BTreeMap<String, StitchedSeries>,
    pub calibrations: Vec<Calibration>,
    pub warnings: Vec<DegenerateOverlap>,
}

impl Reconstruction {
    pub fn get(&self, key: &str) -> Option<&StitchedSeries> {
        self.series.get(key)
    }
}

/// Plans the windows for `[start, end]`, fetches each one exactly once for all
/// `keys`, and stitches every identifier independently.
///
/// Any fetch failure, empty answer or malformed answer aborts the run; there
/// is no partial result. All-zero overlaps are reported in
/// [`Reconstruction::warnings`] and do not stop the run.
pub fn reconstruct<F>(
    start: NaiveDateTime,
    end: NaiveDateTime,
    params: &Params,
    keys: &[String],
    fetcher: &mut F,
) -> Result<Reconstruction, StitchError>
where
    F: Fetch + ?Sized,
{
    if keys.is_empty() {
        return Err(StitchError::InvalidRange(
            "at least one series identifier is required".into(),
        ));
    }
    let mut seen = BTreeSet::new();
    for key in keys {
        if !seen.insert(key.as_str()) {
            return Err(StitchError::InvalidRange(format!(
                "series identifier '{}' requested twice",
                key
            )));
        }
    }

    let windows = plan_windows(start, end, params)?;
    let params_hash = params.params_hash(start, end, keys)?;
    info!(
        "Reconstructing {} series over {} {} windows",
        keys.len(),
        windows.len(),
        params.cadence
    );

    let (first, rest) = windows
        .split_first()
        .ok_or_else(|| StitchError::InvalidRange("no windows planned".into()))?;

    let mut response = fetch_window(fetcher, first, keys)?;
    let mut stitchers = Vec::with_capacity(keys.len());
    for key in keys {
        let raw = take_series(&mut response, key, first)?;
        stitchers.push(Stitcher::new(key.as_str(), first, raw)?);
    }

    for window in rest {
        let mut response = fetch_window(fetcher, window, keys)?;
        for stitcher in &mut stitchers {
            let raw = take_series(&mut response, stitcher.key(), window)?;
            stitcher.absorb(window, &raw)?;
        }
    }

    let mut series = BTreeMap::new();
    let mut calibrations = Vec::new();
    for stitcher in stitchers {
        calibrations.extend_from_slice(stitcher.calibrations());
        let key = stitcher.key().to_string();
        let stitched = stitcher.finish();
        debug_assert_eq!(stitched.start(), Some(start));
        debug_assert_eq!(stitched.end(), Some(end));
        series.insert(key, stitched);
    }
    let warnings: Vec<DegenerateOverlap> =
        calibrations.iter().filter_map(Calibration::warning).collect();
    if !warnings.is_empty() {
        warn!(
            "{} window(s) had an all-zero overlap; older samples are low confidence",
            warnings.len()
        );
    }

    Ok(Reconstruction {
        start,
        end,
        params: params.clone(),
        params_hash,
        keys: keys.to_vec(),
        windows,
        series,
        calibrations,
        warnings,
    })
}

fn fetch_window<F>(
    fetcher: &mut F,
    window: &Window,
    keys: &[String],
) -> Result<WindowResponse, StitchError>
where
    F: Fetch + ?Sized,
{
    debug!("Fetching {}", window.timeframe());
    fetcher.fetch(window, keys).map_err(|err| {
        warn!("Fetch of {} failed: {}", window.timeframe(), err);
        StitchError::from(err)
    })
}

fn take_series(
    response: &mut WindowResponse,
    key: &str,
    window: &Window,
) -> Result<RawSeries, StitchError> {
    match response.remove(key) {
        Some(raw) if !raw.is_empty() => Ok(raw),
        _ => Err(StitchError::NoData {
            key: key.to_string(),
            window: *window,
        }),
    }
}
