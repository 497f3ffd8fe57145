//! Historical query windows and the archive requests built from them.

use chrono::{Datelike, NaiveDate};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::constants::{COORDINATE_PRECISION, DATE_FORMAT, HOURLY_FIELDS};
use crate::trip::{DateRange, TripError, TripQuery, shift_years, total_range, with_year};

const RESPONSE_FORMAT: &str = "json";

/// The trip span moved `index` years into the past.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalWindow {
    pub index: u32,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// One archive call covering every stop for a single window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeatherRequest {
    pub window: HistoricalWindow,
    pub latitude: String,
    pub longitude: String,
}

impl WeatherRequest {
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("latitude", self.latitude.clone()),
            ("longitude", self.longitude.clone()),
            ("hourly", HOURLY_FIELDS.join(",")),
            ("format", RESPONSE_FORMAT.to_string()),
            ("start_date", self.window.start.format(DATE_FORMAT).to_string()),
            ("end_date", self.window.end.format(DATE_FORMAT).to_string()),
        ]
    }
}

/// Reprojects the trip onto `current_year` and steps back one year per window.
///
/// Days that do not exist in the target year are clamped, so a Feb 29 stay
/// becomes Feb 28. A trip running over New Year keeps its span: the end is
/// reprojected onto the year after `current_year`.
pub fn historical_windows(
    range: DateRange,
    current_year: i32,
    years: usize,
) -> Result<Vec<HistoricalWindow>, TripError> {
    let span = range.end().year() - range.start().year();
    let start = with_year(range.start(), current_year)
        .ok_or(TripError::YearOutOfRange(current_year))?;
    let end = with_year(range.end(), current_year + span)
        .ok_or(TripError::YearOutOfRange(current_year + span))?;

    (1..=years)
        .map(|offset| {
            let index = u32::try_from(offset).map_err(|_| TripError::YearOutOfRange(current_year))?;
            let years_back = i32::try_from(offset).map_err(|_| TripError::YearOutOfRange(current_year))?;
            Ok(HistoricalWindow {
                index,
                start: shift_years(start, years_back)?,
                end: shift_years(end, years_back)?,
            })
        })
        .collect()
}

fn join_coordinates(values: impl Iterator<Item = f64>) -> String {
    values
        .map(|value| format!("{value:.COORDINATE_PRECISION$}"))
        .join(",")
}

/// Builds one request per historical window, oldest offset last.
pub fn plan_requests(
    queries: &[TripQuery],
    current_year: i32,
    years: usize,
) -> Result<Vec<WeatherRequest>, TripError> {
    let range = total_range(queries)?;
    let latitude = join_coordinates(queries.iter().map(|q| q.location.latitude()));
    let longitude = join_coordinates(queries.iter().map(|q| q.location.longitude()));

    Ok(historical_windows(range, current_year, years)?
        .into_iter()
        .map(|window| WeatherRequest {
            window,
            latitude: latitude.clone(),
            longitude: longitude.clone(),
        })
        .collect())
}
