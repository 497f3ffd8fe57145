//! Alignment of per-location, per-year archive data onto one trip-relative hour axis.

use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use tracing::debug;

use crate::data::{DecodeError, WeatherRecord, WindowRecords, normalize_window};
use crate::trip::{TripError, TripQuery, datetime_with_year, shift_years, total_range};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlignError {
    Trip(TripError),
    Decode { window: u32, source: DecodeError },
}

impl fmt::Display for AlignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trip(err) => write!(f, "{err}"),
            Self::Decode { window, source } => {
                write!(f, "Window {window} has an unusable response: {source}")
            }
        }
    }
}

impl std::error::Error for AlignError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Trip(err) => Some(err),
            Self::Decode { source, .. } => Some(source),
        }
    }
}

impl From<TripError> for AlignError {
    fn from(err: TripError) -> Self {
        Self::Trip(err)
    }
}

/// One historical year laid onto the trip calendar.
///
/// Position `i` of `hours` is the same trip hour in every series of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedYearSeries {
    /// Calendar year of the trip the hours were restamped onto.
    pub year: i32,
    /// Year the samples were recorded in.
    pub source_year: i32,
    pub window: u32,
    pub hours: Vec<WeatherRecord>,
}

impl AlignedYearSeries {
    pub fn len(&self) -> usize {
        self.hours.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hours.is_empty()
    }
}

/// Aligns every window of a batch; one series per window, in batch order.
pub fn align(
    queries: &[TripQuery],
    batch: &[WindowRecords],
) -> Result<Vec<AlignedYearSeries>, AlignError> {
    let trip_year = total_range(queries)?.start().year();
    batch
        .iter()
        .map(|window| align_window(queries, window, trip_year))
        .collect()
}

fn align_window(
    queries: &[TripQuery],
    window_records: &WindowRecords,
    trip_year: i32,
) -> Result<AlignedYearSeries, AlignError> {
    let window = window_records.window;
    let by_location = normalize_window(&window_records.records, queries).map_err(|source| {
        AlignError::Decode {
            window: window.index,
            source,
        }
    })?;
    let source_year = window.start.year();
    let years_back = trip_year - source_year;

    let mut hours = Vec::new();
    // Shared cursor: a stop picks up where the previous one stopped.
    let mut cursor: Option<NaiveDateTime> = None;

    for (index, query) in queries.iter().enumerate() {
        let Some(records) = by_location.get(&index) else {
            debug!(window = window.index, location = index, "No records for stop");
            continue;
        };
        let Some(first_year) = records.first().map(|record| record.time.year()) else {
            continue;
        };
        let cutoff = shift_years(query.dates.end(), years_back)?;
        let before = hours.len();

        let start = records
            .iter()
            .position(|record| cursor.is_none_or(|seen| record.time > seen))
            .unwrap_or(records.len());

        for record in &records[start..] {
            if !within_stay(record.time, cutoff) {
                break;
            }
            let year = trip_year + (record.time.year() - first_year);
            if lands_on_missing_leap_day(record.time.date(), year) {
                debug!(window = window.index, time = %record.time, year, "Dropping leap-day hour");
                cursor = Some(record.time);
                continue;
            }
            let time =
                datetime_with_year(record.time, year).ok_or(TripError::YearOutOfRange(year))?;
            hours.push(WeatherRecord {
                time,
                ..record.clone()
            });
            cursor = Some(record.time);
        }

        debug!(
            window = window.index,
            location = %query.location.display_name(),
            hours = hours.len() - before,
            "Aligned stop"
        );
    }

    Ok(AlignedYearSeries {
        year: trip_year,
        source_year,
        window: window.index,
        hours,
    })
}

fn within_stay(time: NaiveDateTime, cutoff: NaiveDate) -> bool {
    time.date() <= cutoff
}

/// Feb 29 has no counterpart in a common year; restamping would clamp it onto Feb 28.
fn lands_on_missing_leap_day(date: NaiveDate, year: i32) -> bool {
    date.month() == 2 && date.day() == 29 && NaiveDate::from_ymd_opt(year, 2, 29).is_none()
}

/// Cuts every series down to the shortest one.
pub fn truncate_to_shortest(series: &[AlignedYearSeries]) -> Vec<AlignedYearSeries> {
    let shortest = series.iter().map(AlignedYearSeries::len).min().unwrap_or_default();
    series
        .iter()
        .map(|s| AlignedYearSeries {
            hours: s.hours[..shortest].to_vec(),
            ..s.clone()
        })
        .collect()
}

/// Keeps only the slots where at least one year saw sunshine.
///
/// Slots are dropped across all series at once, so positional alignment holds.
/// Expects series of equal length; surplus slots of longer series are dropped.
pub fn daytime_only(series: &[AlignedYearSeries]) -> Vec<AlignedYearSeries> {
    let count = series.iter().map(AlignedYearSeries::len).min().unwrap_or_default();
    let keep: Vec<bool> = (0..count)
        .map(|i| series.iter().any(|s| s.hours[i].sunshine_duration > 0.0))
        .collect();
    series
        .iter()
        .map(|s| AlignedYearSeries {
            hours: s
                .hours
                .iter()
                .zip(&keep)
                .filter(|(_, keep)| **keep)
                .map(|(hour, _)| hour.clone())
                .collect(),
            ..s.clone()
        })
        .collect()
}
