use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use proptest::prelude::*;
use trend_stitch::{
    plan_windows, reconstruct, Cadence, Fetch, FetchError, Params, RawSeries, RetryPolicy,
    RetryingFetcher, StitchError, Window, WindowResponse,
};

fn day(n: i64) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2019, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        + Duration::days(n)
}

fn keys(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Stands in for the index service: each identifier has a hidden absolute
/// popularity curve and every answer is rescaled so its own peak is 100.
struct SimulatedService {
    origin: NaiveDateTime,
    curves: BTreeMap<String, fn(i64) -> f64>,
    calls: Vec<Window>,
    answers: Vec<(Window, WindowResponse)>,
}

impl SimulatedService {
    fn new(origin: NaiveDateTime) -> Self {
        Self {
            origin,
            curves: BTreeMap::new(),
            calls: Vec::new(),
            answers: Vec::new(),
        }
    }

    fn with_curve(mut self, key: &str, curve: fn(i64) -> f64) -> Self {
        self.curves.insert(key.to_string(), curve);
        self
    }

    fn raw_for(&self, window: &Window, key: &str) -> Option<&RawSeries> {
        self.answers
            .iter()
            .find(|(w, _)| w == window)
            .and_then(|(_, response)| response.get(key))
    }
}

impl Fetch for SimulatedService {
    fn fetch(&mut self, window: &Window, keys: &[String]) -> Result<WindowResponse, FetchError> {
        self.calls.push(*window);
        let mut response = WindowResponse::new();
        for key in keys {
            let curve = match self.curves.get(key) {
                Some(curve) => *curve,
                None => continue,
            };
            let truth: Vec<f64> = window
                .ticks()
                .map(|t| curve(window.cadence.ticks_between(self.origin, t)))
                .collect();
            let peak = truth.iter().copied().fold(0.0, f64::max);
            let values: Vec<f64> = truth
                .iter()
                .map(|v| if peak > 0.0 { v / peak * 100.0 } else { 0.0 })
                .collect();
            response.insert(key.clone(), RawSeries::from_values(window, &values));
        }
        self.answers.push((*window, response.clone()));
        Ok(response)
    }
}

fn rising(t: i64) -> f64 {
    10.0 + t as f64
}

fn seasonal(t: i64) -> f64 {
    50.0 + 40.0 * ((t as f64) / 9.0).sin()
}

fn small_params() -> Params {
    Params {
        cadence: Cadence::Daily,
        max_step: 30,
        overlap: 5,
    }
}

#[test]
fn reconstructs_every_identifier_on_one_reference_scale() {
    let mut service = SimulatedService::new(day(0))
        .with_curve("rising", rising)
        .with_curve("seasonal", seasonal);
    let params = small_params();
    let names = keys(&["rising", "seasonal"]);

    let result = reconstruct(day(0), day(120), &params, &names, &mut service).unwrap();

    assert_eq!(service.calls, result.windows);
    assert!(result.warnings.is_empty());
    assert_eq!(result.keys, names);

    for name in &names {
        let series = result.get(name).unwrap();
        assert_eq!(series.len(), 121);
        for (i, point) in series.points().iter().enumerate() {
            assert_eq!(point.timestamp, day(i as i64));
        }
    }

    // The newest window's scale is preserved verbatim, so ratios between any
    // two ticks match the hidden curve.
    let rising_series = result.get("rising").unwrap();
    let newest = rising_series.value_at(day(120)).unwrap();
    assert!((newest - 100.0).abs() < 1e-9);
    for t in [0_i64, 17, 64, 90, 119] {
        let got = rising_series.value_at(day(t)).unwrap() / newest;
        let want = rising(t) / rising(120);
        assert!((got - want).abs() < 1e-9, "tick {}: {} vs {}", t, got, want);
    }

    let seasonal_series = result.get("seasonal").unwrap();
    let anchor = seasonal_series.value_at(day(120)).unwrap();
    for t in [3_i64, 40, 77] {
        let got = seasonal_series.value_at(day(t)).unwrap() / anchor;
        let want = seasonal(t) / seasonal(120);
        assert!((got - want).abs() < 1e-9);
    }
}

#[test]
fn rescale_step_is_exact_at_each_boundary() {
    let mut service = SimulatedService::new(day(0)).with_curve("rising", rising);
    let result = reconstruct(day(0), day(90), &small_params(), &keys(&["rising"]), &mut service)
        .unwrap();
    let series = result.get("rising").unwrap();

    assert_eq!(result.calibrations.len(), result.windows.len() - 1);
    for cal in &result.calibrations {
        let raw = service.raw_for(&cal.window, "rising").unwrap();
        let raw_value = raw
            .points
            .iter()
            .find(|p| p.timestamp == cal.rescaled_through)
            .map(|p| p.value)
            .unwrap();
        let stitched = series.value_at(cal.rescaled_through).unwrap();
        assert!((stitched / raw_value - cal.scaling).abs() < 1e-12);
        assert_eq!(cal.overlap_len, 5);
    }
}

#[test]
fn matches_worked_example_windows() {
    let params = Params {
        cadence: Cadence::Daily,
        max_step: 10,
        overlap: 4,
    };
    let mut service = SimulatedService::new(day(0)).with_curve("kw", rising);
    let result = reconstruct(day(0), day(20), &params, &keys(&["kw"]), &mut service).unwrap();
    let bounds: Vec<(NaiveDateTime, NaiveDateTime)> =
        result.windows.iter().map(|w| (w.start, w.end)).collect();
    assert_eq!(
        bounds,
        vec![(day(10), day(20)), (day(3), day(13)), (day(0), day(6))]
    );
    assert_eq!(result.get("kw").map(|s| s.len()), Some(21));
}

#[test]
fn empty_answer_aborts_without_output() {
    let mut calls = 0;
    let mut fetcher = |w: &Window, ks: &[String]| -> Result<WindowResponse, FetchError> {
        calls += 1;
        let mut response = WindowResponse::new();
        if calls < 2 {
            for k in ks {
                response.insert(
                    k.clone(),
                    RawSeries::from_values(w, &vec![10.0; w.tick_count()]),
                );
            }
        }
        Ok(response)
    };
    let err = reconstruct(day(0), day(90), &small_params(), &keys(&["kw"]), &mut fetcher)
        .unwrap_err();
    match err {
        StitchError::NoData { key, .. } => assert_eq!(key, "kw"),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(calls, 2);
}

#[test]
fn empty_newest_window_aborts_before_any_older_fetch() {
    let params = small_params();
    let newest = plan_windows(day(0), day(90), &params).unwrap()[0];

    let mut calls = 0;
    let mut missing = |_: &Window, _: &[String]| -> Result<WindowResponse, FetchError> {
        calls += 1;
        Ok(WindowResponse::new())
    };
    let err = reconstruct(day(0), day(90), &params, &keys(&["kw"]), &mut missing).unwrap_err();
    match err {
        StitchError::NoData { key, window } => {
            assert_eq!(key, "kw");
            assert_eq!(window, newest);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(calls, 1);

    let mut empty = |_: &Window, ks: &[String]| -> Result<WindowResponse, FetchError> {
        Ok(ks.iter().map(|k| (k.clone(), RawSeries::default())).collect())
    };
    assert!(matches!(
        reconstruct(day(0), day(90), &params, &keys(&["kw"]), &mut empty),
        Err(StitchError::NoData { ref window, .. }) if *window == newest
    ));
}

#[test]
fn empty_series_for_one_identifier_is_no_data() {
    let mut fetcher = |w: &Window, ks: &[String]| -> Result<WindowResponse, FetchError> {
        let mut response = WindowResponse::new();
        for k in ks {
            let raw = if k == "quiet" && w.end < day(90) {
                RawSeries::default()
            } else {
                RawSeries::from_values(w, &vec![5.0; w.tick_count()])
            };
            response.insert(k.clone(), raw);
        }
        Ok(response)
    };
    let err = reconstruct(
        day(0),
        day(90),
        &small_params(),
        &keys(&["loud", "quiet"]),
        &mut fetcher,
    )
    .unwrap_err();
    assert!(matches!(err, StitchError::NoData { ref key, .. } if key == "quiet"));
}

#[test]
fn zero_overlap_is_reported_and_run_completes() {
    // Silent until tick 82, so older windows see an all-zero overlap.
    fn late_bloomer(t: i64) -> f64 {
        if t < 82 {
            0.0
        } else {
            (t - 81) as f64
        }
    }
    let mut service = SimulatedService::new(day(0))
        .with_curve("late", late_bloomer)
        .with_curve("steady", rising);
    let result = reconstruct(
        day(0),
        day(110),
        &small_params(),
        &keys(&["late", "steady"]),
        &mut service,
    )
    .unwrap();

    assert!(!result.warnings.is_empty());
    assert!(result.warnings.iter().all(|w| w.key == "late"));
    let first_warning = &result.warnings[0];
    let late = result.get("late").unwrap();
    assert_eq!(late.len(), 111);
    assert!(late
        .points()
        .iter()
        .filter(|p| p.timestamp <= first_warning.low_confidence_through)
        .all(|p| p.value == 0.0));

    let degenerate: Vec<_> = result
        .calibrations
        .iter()
        .filter(|c| c.degenerate)
        .collect();
    assert_eq!(degenerate.len(), result.warnings.len());
    assert!(degenerate.iter().all(|c| c.scaling == 0.0));

    let steady = result.get("steady").unwrap();
    assert!(steady.values().all(|v| v > 0.0));
}

#[test]
fn fetch_errors_propagate_unchanged() {
    let mut fetcher = |_: &Window, _: &[String]| -> Result<WindowResponse, FetchError> {
        Err(FetchError::TooManyRequests("quota".into()))
    };
    let err = reconstruct(day(0), day(50), &small_params(), &keys(&["kw"]), &mut fetcher)
        .unwrap_err();
    assert!(matches!(
        err,
        StitchError::Fetch(FetchError::TooManyRequests(ref m)) if m == "quota"
    ));
}

#[test]
fn retrying_fetcher_recovers_from_transient_failures() {
    let mut service = SimulatedService::new(day(0)).with_curve("kw", rising);
    let mut failures = 0;
    let flaky = |w: &Window, ks: &[String]| -> Result<WindowResponse, FetchError> {
        failures += 1;
        if failures % 2 == 1 {
            Err(FetchError::Transport("connection reset".into()))
        } else {
            service.fetch(w, ks)
        }
    };
    let policy = RetryPolicy {
        retries: 1,
        backoff_factor: 0.0,
    };
    let mut fetcher = RetryingFetcher::new(flaky, policy);
    let result =
        reconstruct(day(0), day(60), &small_params(), &keys(&["kw"]), &mut fetcher).unwrap();
    assert_eq!(result.get("kw").map(|s| s.len()), Some(61));
}

#[test]
fn invalid_requests_fail_before_any_fetch() {
    let mut calls = 0;
    let mut fetcher = |_: &Window, _: &[String]| -> Result<WindowResponse, FetchError> {
        calls += 1;
        Ok(WindowResponse::new())
    };
    let params = small_params();
    assert!(matches!(
        reconstruct(day(10), day(10), &params, &keys(&["kw"]), &mut fetcher),
        Err(StitchError::InvalidRange(_))
    ));
    assert!(matches!(
        reconstruct(day(0), day(10), &params, &keys(&["kw", "kw"]), &mut fetcher),
        Err(StitchError::InvalidRange(_))
    ));
    assert!(matches!(
        reconstruct(day(0), day(10), &params, &[], &mut fetcher),
        Err(StitchError::InvalidRange(_))
    ));
    let bad = Params {
        overlap: 30,
        ..params
    };
    assert!(matches!(
        reconstruct(day(0), day(100), &bad, &keys(&["kw"]), &mut fetcher),
        Err(StitchError::InvalidRange(_))
    ));
    assert_eq!(calls, 0);
}

#[test]
fn hourly_reconstruction_covers_every_hour() {
    let start = day(0);
    let end = start + Duration::hours(24 * 20);
    let mut service = SimulatedService::new(start).with_curve("kw", seasonal);
    let params = Params::for_cadence(Cadence::Hourly);
    let result = reconstruct(start, end, &params, &keys(&["kw"]), &mut service).unwrap();
    let series = result.get("kw").unwrap();
    assert_eq!(series.len(), 24 * 20 + 1);
    assert_eq!(series.start(), Some(start));
    assert_eq!(series.end(), Some(end));
    assert!(result.windows.iter().all(|w| w.cadence == Cadence::Hourly));
}

proptest! {
    #[test]
    fn planned_windows_cover_range_with_fixed_overlap(
        span in 1i64..600,
        max_step in 2u32..80,
        overlap_seed in 0u32..1000,
    ) {
        let overlap = 1 + overlap_seed % (max_step - 1);
        let params = Params { cadence: Cadence::Daily, max_step, overlap };
        let windows = plan_windows(day(0), day(span), &params).unwrap();

        prop_assert_eq!(windows[0].end, day(span));
        prop_assert_eq!(windows.last().unwrap().start, day(0));
        for w in &windows {
            prop_assert!(w.start < w.end);
            prop_assert!(Cadence::Daily.ticks_between(w.start, w.end) <= i64::from(max_step));
        }
        for pair in windows.windows(2) {
            let shared = pair[1].ticks().filter(|t| pair[0].contains(*t)).count();
            prop_assert_eq!(shared, overlap as usize);
            prop_assert_eq!(pair[1].end, pair[0].start + Duration::days(i64::from(overlap) - 1));
        }
    }

    #[test]
    fn reconstruction_has_one_sample_per_tick(
        span in 1i64..300,
        max_step in 2u32..40,
        overlap_seed in 0u32..1000,
    ) {
        let overlap = 1 + overlap_seed % (max_step - 1);
        let params = Params { cadence: Cadence::Daily, max_step, overlap };
        let mut service = SimulatedService::new(day(0)).with_curve("kw", rising);
        let result = reconstruct(day(0), day(span), &params, &keys(&["kw"]), &mut service).unwrap();
        let series = result.get("kw").unwrap();

        prop_assert_eq!(series.len() as i64, span + 1);
        for (i, point) in series.points().iter().enumerate() {
            prop_assert_eq!(point.timestamp, day(i as i64));
        }
        prop_assert_eq!(service.calls.len(), result.windows.len());
    }
}
