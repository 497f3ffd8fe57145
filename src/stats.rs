//! Cross-year statistics per trip hour slot.

use std::fmt;

use serde::Serialize;

use crate::data::WeatherRecord;
use crate::series::AlignedYearSeries;

/// A series whose length differs from the first one of its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapeMismatchError {
    pub series: usize,
    pub expected: usize,
    pub found: usize,
}

impl fmt::Display for ShapeMismatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Series {} has {} hours, expected {}; aggregates need equally long years",
            self.series, self.found, self.expected
        )
    }
}

impl std::error::Error for ShapeMismatchError {}

/// Hourly value the statistics are taken over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Metric {
    #[default]
    Temperature,
    Precipitation,
    CloudCover,
    SunshineDuration,
}

impl Metric {
    pub const fn value(self, record: &WeatherRecord) -> f64 {
        match self {
            Self::Temperature => record.temperature,
            Self::Precipitation => record.precipitation,
            Self::CloudCover => record.cloud_cover,
            Self::SunshineDuration => record.sunshine_duration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AggregateStat {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

/// Accumulates one slot across years.
#[derive(Clone, Copy)]
struct SlotAccumulator {
    min: f64,
    max: f64,
    sum: f64,
    count: u32,
}

impl Default for SlotAccumulator {
    fn default() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            count: 0,
        }
    }
}

impl SlotAccumulator {
    fn add(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.count += 1;
    }

    fn finish(&self) -> Option<AggregateStat> {
        (self.count > 0).then(|| AggregateStat {
            min: self.min,
            max: self.max,
            avg: self.sum / f64::from(self.count),
        })
    }
}

/// Checks that every series is as long as the first one.
pub fn ensure_uniform(series: &[AlignedYearSeries]) -> Result<usize, ShapeMismatchError> {
    let expected = series.first().map_or(0, AlignedYearSeries::len);
    match series.iter().position(|s| s.len() != expected) {
        Some(index) => Err(ShapeMismatchError {
            series: index,
            expected,
            found: series[index].len(),
        }),
        None => Ok(expected),
    }
}

/// Min, max and mean of `metric` for every slot across all series.
pub fn aggregate(
    series: &[AlignedYearSeries],
    metric: Metric,
) -> Result<Vec<AggregateStat>, ShapeMismatchError> {
    let count = ensure_uniform(series)?;
    Ok((0..count)
        .filter_map(|i| {
            series
                .iter()
                .fold(SlotAccumulator::default(), |mut acc, s| {
                    acc.add(metric.value(&s.hours[i]));
                    acc
                })
                .finish()
        })
        .collect())
}

pub fn temperature_stats(
    series: &[AlignedYearSeries],
) -> Result<Vec<AggregateStat>, ShapeMismatchError> {
    aggregate(series, Metric::Temperature)
}
