use chrono::NaiveDateTime;
use tracing::debug;

use crate::{Params, StitchError, Window};

/// Plans the query windows covering `[start, end]`, most recent first.
///
/// The first window ends at `end` and spans `max_step` ticks. Each following
/// window ends `overlap - 1` ticks after the start of its predecessor, so the
/// two share exactly `overlap` ticks, and starts `step` ticks before it. The
/// last window is clamped to `start` and may be shorter than `max_step`.
pub fn plan_windows(
    start: NaiveDateTime,
    end: NaiveDateTime,
    params: &Params,
) -> Result<Vec<Window>, StitchError> {
    params.validate()?;
    let cadence = params.cadence;
    if start >= end {
        return Err(StitchError::InvalidRange(format!(
            "start {} is not before end {}",
            cadence.format(start),
            cadence.format(end)
        )));
    }
    for (label, ts) in [("start", start), ("end", end)] {
        if !cadence.is_aligned(ts) {
            return Err(StitchError::InvalidRange(format!(
                "{} {} is not on the {} grid",
                label, ts, cadence
            )));
        }
    }

    let step = i64::from(params.step());
    let overlap = i64::from(params.overlap);

    // Clamp in tick space so oversized steps never leave the calendar.
    let back_from = |ts: NaiveDateTime, ticks: i64| {
        if ticks >= cadence.ticks_between(start, ts) {
            start
        } else {
            ts - cadence.ticks(ticks)
        }
    };

    let first_start = back_from(end, i64::from(params.max_step));
    let mut windows = vec![Window::new(first_start, end, cadence)];

    let mut prev_start = first_start;
    while prev_start > start {
        let new_end = prev_start + cadence.ticks(overlap - 1);
        let new_start = back_from(prev_start, step);
        windows.push(Window::new(new_start, new_end, cadence));
        prev_start = new_start;
    }

    debug!(
        "Planned {} {} windows over {} .. {}",
        windows.len(),
        cadence,
        cadence.format(start),
        cadence.format(end)
    );
    Ok(windows)
}
