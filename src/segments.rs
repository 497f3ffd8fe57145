//! Partitioning of the trip hour axis into stop runs and day/night runs.

use itertools::Itertools;
use serde::Serialize;

use crate::data::WeatherRecord;
use crate::geometry::Scale;

pub const DAY_COLOR: &str = "yellow";
pub const NIGHT_COLOR: &str = "gray";

/// Run of consecutive slots spent at one stop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationSegment {
    pub start_index: usize,
    /// Slot where the next stop begins, or the last slot for the final stop.
    pub end_index: usize,
    pub label: String,
    pub left: f64,
    pub middle: f64,
}

/// Run of consecutive slots sharing one day/night flag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayNightInterval {
    pub start_index: usize,
    pub end_index: usize,
    pub is_day: bool,
    pub start: f64,
    pub width: f64,
    pub color: &'static str,
}

/// First slot of every maximal run of equal keys.
fn run_starts<K: Copy + PartialEq>(keys: impl Iterator<Item = K>) -> Vec<usize> {
    let chunks = keys.enumerate().chunk_by(|&(_, key)| key);
    let starts = chunks
        .into_iter()
        .filter_map(|(_, mut run)| run.next().map(|(start, _)| start))
        .collect();
    starts
}

/// Run boundary: the next run's first slot, or the last slot for the final run.
fn run_end(starts: &[usize], position: usize, len: usize) -> usize {
    starts
        .get(position + 1)
        .copied()
        .unwrap_or_else(|| len.saturating_sub(1))
}

/// Stop runs along the axis, compared by location id rather than by name.
pub fn location_segments(hours: &[WeatherRecord], x: &Scale) -> Vec<LocationSegment> {
    let starts = run_starts(hours.iter().map(|hour| hour.location.id()));
    starts
        .iter()
        .enumerate()
        .map(|(position, &start_index)| {
            let end_index = run_end(&starts, position, hours.len());
            let left = x.index(start_index);
            let right = x.index(end_index);
            LocationSegment {
                start_index,
                end_index,
                label: hours[start_index].location.display_name(),
                left,
                middle: left + (right - left) / 2.0,
            }
        })
        .collect()
}

/// Day/night runs along the axis, including the run after the last transition.
pub fn day_night_intervals(hours: &[WeatherRecord], x: &Scale) -> Vec<DayNightInterval> {
    let starts = run_starts(hours.iter().map(|hour| hour.is_day));
    starts
        .iter()
        .enumerate()
        .map(|(position, &start_index)| {
            let end_index = run_end(&starts, position, hours.len());
            let is_day = hours[start_index].is_day;
            let start = x.index(start_index);
            DayNightInterval {
                start_index,
                end_index,
                is_day,
                start,
                width: x.index(end_index) - start,
                color: if is_day { DAY_COLOR } else { NIGHT_COLOR },
            }
        })
        .collect()
}
