use std::panic;
use std::path::Path;

use anyhow::Result;
use plotters::prelude::*;
use trend_stitch::Reconstruction;

#[derive(Clone, Copy, Debug)]
pub enum ChartKind {
    Png,
    Svg,
}

const PALETTE: [RGBColor; 6] = [
    RGBColor(200, 0, 100),
    RGBColor(30, 144, 255),
    RGBColor(34, 139, 34),
    RGBColor(255, 140, 0),
    RGBColor(90, 90, 90),
    RGBColor(148, 0, 211),
];

/// Plots every stitched series on one chart. Backend panics (missing fonts,
/// mostly) are turned into errors so a failed chart never aborts the run.
pub fn render_chart_guard(result: &Reconstruction, path: &Path, kind: ChartKind) -> Result<(), String> {
    let render = || -> Result<(), String> {
        render_chart(result, path, kind).map_err(|e| format!("plotting error: {}", e))
    };
    panic::catch_unwind(panic::AssertUnwindSafe(render))
        .map_err(|_| "plotting backend panicked".to_string())?
}

struct Line<'a> {
    label: &'a str,
    points: Vec<(f64, f64)>,
}

fn render_chart(result: &Reconstruction, path: &Path, kind: ChartKind) -> Result<()> {
    let cadence = result.params.cadence;
    let lines: Vec<Line> = result
        .keys
        .iter()
        .filter_map(|key| {
            let series = result.get(key)?;
            let points = series
                .points()
                .iter()
                .map(|p| {
                    (
                        cadence.ticks_between(result.start, p.timestamp) as f64,
                        p.value,
                    )
                })
                .collect();
            Some(Line { label: key, points })
        })
        .collect();
    if lines.iter().all(|l| l.points.is_empty()) {
        return Ok(());
    }

    let x_max = lines
        .iter()
        .flat_map(|l| l.points.iter().map(|p| p.0))
        .fold(1.0, f64::max);
    let y_max = lines
        .iter()
        .flat_map(|l| l.points.iter().map(|p| p.1))
        .fold(1.0, f64::max)
        * 1.05;
    let caption = format!(
        "{} to {} ({})",
        cadence.format(result.start),
        cadence.format(result.end),
        cadence
    );

    match kind {
        ChartKind::Png => {
            let root = BitMapBackend::new(path, (1280, 720)).into_drawing_area();
            draw_chart(root, &lines, x_max, y_max, &caption)?;
        }
        ChartKind::Svg => {
            let root = SVGBackend::new(path, (1280, 720)).into_drawing_area();
            draw_chart(root, &lines, x_max, y_max, &caption)?;
        }
    }
    Ok(())
}

fn draw_chart<DB>(
    area: DrawingArea<DB, plotters::coord::Shift>,
    lines: &[Line],
    x_max: f64,
    y_max: f64,
    caption: &str,
) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    area.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&area)
        .caption(caption, ("sans-serif", 22))
        .margin(25)
        .set_label_area_size(LabelAreaPosition::Left, 60)
        .set_label_area_size(LabelAreaPosition::Bottom, 40)
        .build_cartesian_2d(0.0..x_max, 0.0..y_max)?;

    chart
        .configure_mesh()
        .light_line_style(&TRANSPARENT)
        .x_desc("ticks since start")
        .y_desc("relative interest")
        .x_label_formatter(&|v| format!("{:.0}", v))
        .y_label_formatter(&|v| format!("{:.0}", v))
        .draw()?;

    for (idx, line) in lines.iter().enumerate() {
        let color = PALETTE[idx % PALETTE.len()];
        let style = ShapeStyle {
            color: color.to_rgba(),
            filled: false,
            stroke_width: 2,
        };
        chart
            .draw_series(LineSeries::new(line.points.iter().copied(), style))?
            .label(line.label)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 30, y)], color));
    }

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.7))
        .border_style(&BLACK.mix(0.3))
        .position(SeriesLabelPosition::UpperLeft)
        .draw()?;

    area.present()?;
    Ok(())
}
