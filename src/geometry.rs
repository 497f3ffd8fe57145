//! Renderer-agnostic chart geometry: scales, ticks, segments and paths.

use chrono::Timelike;
use serde::{Deserialize, Serialize};

use crate::constants::MONTH_DAY_FORMAT;
use crate::segments::{DayNightInterval, LocationSegment, day_night_intervals, location_segments};
use crate::series::AlignedYearSeries;
use crate::stats::AggregateStat;

pub const DEFAULT_WIDTH: f64 = 1280.0;
pub const DEFAULT_MARGIN: f64 = 40.0;
const ASPECT_RATIO: f64 = 9.0 / 16.0;
const FALLBACK_TEMPERATURE_DOMAIN: (f64, f64) = (0.0, 30.0);
const TARGET_TICKS: f64 = 10.0;
const TICK_STEPS: [f64; 3] = [1.0, 2.0, 5.0];
const CAPTION: &str = "temperatures during visit";
const CAPTION_DAY_PREFIX: &str = "day time";

/// Linear mapping from a domain onto an output range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Scale {
    domain: (f64, f64),
    range: (f64, f64),
}

impl Scale {
    pub const fn linear(domain: (f64, f64), range: (f64, f64)) -> Self {
        Self { domain, range }
    }

    /// Maps `value`; a collapsed domain maps everything to the middle of the range.
    pub fn apply(&self, value: f64) -> f64 {
        let (d0, d1) = self.domain;
        let (r0, r1) = self.range;
        let span = d1 - d0;
        if span.abs() < f64::EPSILON || !span.is_finite() {
            return r0 + (r1 - r0) / 2.0;
        }
        r0 + (value - d0) / span * (r1 - r0)
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn index(&self, index: usize) -> f64 {
        self.apply(index as f64)
    }

    pub const fn domain(&self) -> (f64, f64) {
        self.domain
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Margin {
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub left: f64,
}

impl Default for Margin {
    fn default() -> Self {
        Self {
            top: DEFAULT_MARGIN,
            right: DEFAULT_MARGIN,
            bottom: DEFAULT_MARGIN,
            left: DEFAULT_MARGIN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChartOptions {
    pub width: f64,
    pub show_night: bool,
    pub show_min_max: bool,
    pub margin: Margin,
    /// Fixed temperature axis; derived from the data when absent.
    pub temperature_domain: Option<(f64, f64)>,
}

impl Default for ChartOptions {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            show_night: false,
            show_min_max: false,
            margin: Margin::default(),
            temperature_domain: None,
        }
    }
}

impl ChartOptions {
    pub fn height(&self) -> f64 {
        self.width * ASPECT_RATIO
    }

    pub fn caption(&self) -> String {
        if self.show_night {
            CAPTION.to_string()
        } else {
            format!("{CAPTION_DAY_PREFIX} {CAPTION}")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlotArea {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub width: f64,
    pub height: f64,
}

impl PlotArea {
    fn new(options: &ChartOptions) -> Self {
        let margin = options.margin;
        let left = margin.left;
        let top = margin.top;
        let right = options.width - margin.right;
        let bottom = options.height() - margin.bottom;
        Self {
            left,
            top,
            right,
            bottom,
            width: right - left,
            height: bottom - top,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tick {
    pub position: f64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartGeometry {
    pub caption: String,
    pub width: f64,
    pub height: f64,
    pub plot: PlotArea,
    pub hour_scale: Scale,
    pub temperature_scale: Scale,
    pub source_years: Vec<i32>,
    /// Month-day label of every slot, taken from the first series.
    pub slot_labels: Vec<String>,
    /// Slots that start a calendar day.
    pub day_ticks: Vec<Tick>,
    pub temperature_ticks: Vec<Tick>,
    /// Vertical position of 0 °C, where the hour axis is drawn.
    pub baseline: f64,
    pub locations: Vec<LocationSegment>,
    pub day_night: Vec<DayNightInterval>,
    pub average: Vec<Point>,
    pub band: Option<Vec<Point>>,
}

fn temperature_extent(stats: &[AggregateStat]) -> (f64, f64) {
    let (min, max) = stats.iter().fold(
        (f64::INFINITY, f64::NEG_INFINITY),
        |(min, max), stat| (min.min(stat.min), max.max(stat.max)),
    );
    if !min.is_finite() || !max.is_finite() {
        return FALLBACK_TEMPERATURE_DOMAIN;
    }
    let (min, max) = (min.floor(), max.ceil());
    if (max - min).abs() < f64::EPSILON { (min - 1.0, max + 1.0) } else { (min, max) }
}

fn tick_step(span: f64) -> f64 {
    let raw = span / TARGET_TICKS;
    let magnitude = 10f64.powf(raw.log10().floor());
    TICK_STEPS
        .iter()
        .map(|step| step * magnitude)
        .find(|step| *step >= raw)
        .unwrap_or(10.0 * magnitude)
}

fn temperature_ticks(scale: &Scale) -> Vec<Tick> {
    let (low, high) = scale.domain();
    let (low, high) = (low.min(high), low.max(high));
    if high - low <= 0.0 {
        return Vec::new();
    }
    let step = tick_step(high - low);
    #[allow(clippy::cast_possible_truncation)]
    let first = (low / step).ceil() as i64;
    (first..)
        .map(|k| {
            #[allow(clippy::cast_precision_loss)]
            let value = k as f64 * step;
            value
        })
        .take_while(|value| *value <= high + step * 1e-9)
        .map(|value| Tick {
            position: scale.apply(value),
            label: if step >= 1.0 {
                format!("{value:.0}")
            } else {
                format!("{value:.1}")
            },
        })
        .collect()
}

/// Derives all chart geometry from aligned years and their per-slot stats.
///
/// `stats` must have one entry per slot of the first series.
pub fn build_geometry(
    series: &[AlignedYearSeries],
    stats: &[AggregateStat],
    options: &ChartOptions,
) -> ChartGeometry {
    let plot = PlotArea::new(options);
    let reference = series.first().map(|s| s.hours.as_slice()).unwrap_or_default();
    let count = stats.len().min(reference.len());
    let reference = &reference[..count];

    #[allow(clippy::cast_precision_loss)]
    let last_slot = count.saturating_sub(1) as f64;
    let hour_scale = Scale::linear((0.0, last_slot), (plot.left, plot.right));
    let (low, high) = options
        .temperature_domain
        .unwrap_or_else(|| temperature_extent(stats));
    // Inverted: warmer values sit higher on the chart.
    let temperature_scale = Scale::linear((high, low), (plot.top, plot.bottom));

    let slot_labels = reference
        .iter()
        .map(|hour| hour.time.format(MONTH_DAY_FORMAT).to_string())
        .collect::<Vec<_>>();
    let day_ticks = reference
        .iter()
        .enumerate()
        .filter(|(_, hour)| hour.time.hour() == 0)
        .map(|(i, _)| Tick {
            position: hour_scale.index(i),
            label: slot_labels[i].clone(),
        })
        .collect();

    let average = stats[..count]
        .iter()
        .enumerate()
        .map(|(i, stat)| Point {
            x: hour_scale.index(i),
            y: temperature_scale.apply(stat.avg),
        })
        .collect();
    let band = options.show_min_max.then(|| {
        let upper = stats[..count].iter().enumerate().map(|(i, stat)| Point {
            x: hour_scale.index(i),
            y: temperature_scale.apply(stat.max),
        });
        let lower = stats[..count].iter().enumerate().rev().map(|(i, stat)| Point {
            x: hour_scale.index(i),
            y: temperature_scale.apply(stat.min),
        });
        upper.chain(lower).collect()
    });

    ChartGeometry {
        caption: options.caption(),
        width: options.width,
        height: options.height(),
        plot,
        hour_scale,
        temperature_scale,
        source_years: series.iter().map(|s| s.source_year).collect(),
        slot_labels,
        day_ticks,
        temperature_ticks: temperature_ticks(&temperature_scale),
        baseline: temperature_scale.apply(0.0),
        locations: location_segments(reference, &hour_scale),
        day_night: if options.show_night {
            day_night_intervals(reference, &hour_scale)
        } else {
            Vec::new()
        },
        average,
        band,
    }
}
