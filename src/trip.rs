//! Trip stops, their date ranges and the calendar helpers shared by the pipeline.

use std::fmt;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, NaiveDateTime};

use crate::constants::DATE_FORMAT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TripError {
    EmptyInput,
    InvertedRange { start: NaiveDate, end: NaiveDate },
    YearOutOfRange(i32),
}

impl fmt::Display for TripError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyInput => f.write_str("Trip has no stops"),
            Self::InvertedRange { start, end } => write!(
                f,
                "Stay starts on {} but ends on {}",
                start.format(DATE_FORMAT),
                end.format(DATE_FORMAT)
            ),
            Self::YearOutOfRange(year) => write!(f, "Year {year} is outside the calendar range"),
        }
    }
}

impl std::error::Error for TripError {}

/// Identity of a stop. Two stops may share a name, never an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocationId(u32);

/// Hands out location ids; owned by whoever builds the trip.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    pub fn allocate(&mut self) -> LocationId {
        let id = LocationId(self.next);
        self.next += 1;
        id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    id: LocationId,
    name: String,
    latitude: f64,
    longitude: f64,
    geocode: Option<String>,
}

impl Location {
    pub fn new(ids: &mut IdAllocator, name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            id: ids.allocate(),
            name: name.into(),
            latitude,
            longitude,
            geocode: None,
        }
    }

    #[must_use]
    pub fn with_geocode(mut self, label: Option<String>) -> Self {
        self.geocode = label.filter(|label| !label.trim().is_empty());
        self
    }

    pub const fn id(&self) -> LocationId {
        self.id
    }

    pub const fn latitude(&self) -> f64 {
        self.latitude
    }

    pub const fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Label for axis annotation: explicit name, then geocode, then coordinates.
    pub fn display_name(&self) -> String {
        if !self.name.trim().is_empty() {
            return self.name.clone();
        }
        self.geocode
            .clone()
            .unwrap_or_else(|| format!("{}, {}", self.latitude, self.longitude))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, TripError> {
        if start > end {
            return Err(TripError::InvertedRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub const fn start(&self) -> NaiveDate {
        self.start
    }

    pub const fn end(&self) -> NaiveDate {
        self.end
    }
}

#[derive(Debug, Clone)]
pub struct TripQuery {
    pub location: Arc<Location>,
    pub dates: DateRange,
}

impl TripQuery {
    pub fn new(location: Location, dates: DateRange) -> Self {
        Self {
            location: Arc::new(location),
            dates,
        }
    }
}

/// Overall span of the trip: earliest start to latest end.
pub fn total_range(queries: &[TripQuery]) -> Result<DateRange, TripError> {
    let first = queries.first().ok_or(TripError::EmptyInput)?;
    let (start, end) = queries.iter().fold(
        (first.dates.start, first.dates.end),
        |(start, end), query| (start.min(query.dates.start), end.max(query.dates.end)),
    );
    DateRange::new(start, end)
}

/// Moves a date onto `year`, clamping the day to the end of the month
/// instead of rolling into the next one (Feb 29 becomes Feb 28).
pub fn with_year(date: NaiveDate, year: i32) -> Option<NaiveDate> {
    date.with_year(year).or_else(|| {
        (28..date.day())
            .rev()
            .find_map(|day| NaiveDate::from_ymd_opt(year, date.month(), day))
    })
}

pub fn datetime_with_year(time: NaiveDateTime, year: i32) -> Option<NaiveDateTime> {
    with_year(time.date(), year).map(|date| date.and_time(time.time()))
}

pub fn shift_years(date: NaiveDate, years: i32) -> Result<NaiveDate, TripError> {
    let year = date.year() - years;
    with_year(date, year).ok_or(TripError::YearOutOfRange(year))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn query(ids: &mut IdAllocator, name: &str, start: NaiveDate, end: NaiveDate) -> TripQuery {
        TripQuery::new(
            Location::new(ids, name, 35.0, 139.0),
            DateRange::new(start, end).unwrap(),
        )
    }

    #[test]
    fn total_range_spans_all_stops() {
        let mut ids = IdAllocator::default();
        let queries = vec![
            query(&mut ids, "Kyoto", date(2025, 4, 11), date(2025, 4, 13)),
            query(&mut ids, "Tokyo", date(2025, 3, 31), date(2025, 4, 2)),
            query(&mut ids, "Hakone", date(2025, 4, 14), date(2025, 4, 15)),
        ];
        let range = total_range(&queries).unwrap();
        assert_eq!(range.start(), date(2025, 3, 31));
        assert_eq!(range.end(), date(2025, 4, 15));
    }

    #[test]
    fn total_range_rejects_empty_trip() {
        assert_eq!(total_range(&[]), Err(TripError::EmptyInput));
    }

    #[test]
    fn date_range_rejects_inverted_stay() {
        let err = DateRange::new(date(2025, 4, 2), date(2025, 4, 1)).unwrap_err();
        assert!(matches!(err, TripError::InvertedRange { .. }));
    }

    #[test]
    fn leap_day_is_clamped_not_rolled() {
        assert_eq!(with_year(date(2024, 2, 29), 2025), Some(date(2025, 2, 28)));
        assert_eq!(with_year(date(2024, 2, 29), 2028), Some(date(2028, 2, 29)));
        assert_eq!(with_year(date(2024, 3, 31), 2021), Some(date(2021, 3, 31)));
    }

    #[test]
    fn ids_are_unique_even_for_equal_names() {
        let mut ids = IdAllocator::default();
        let a = Location::new(&mut ids, "Tokyo", 35.67, 139.79);
        let b = Location::new(&mut ids, "Tokyo", 35.67, 139.79);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn display_name_falls_back_to_geocode_then_coordinates() {
        let mut ids = IdAllocator::default();
        let named = Location::new(&mut ids, "Nagasaki", 32.75, 129.87);
        assert_eq!(named.display_name(), "Nagasaki");

        let geocoded = Location::new(&mut ids, "", 32.75, 129.87).with_geocode(Some("Nagasaki".into()));
        assert_eq!(geocoded.display_name(), "Nagasaki");

        let bare = Location::new(&mut ids, " ", 32.75, 129.87).with_geocode(Some(String::new()));
        assert_eq!(bare.display_name(), "32.75, 129.87");
    }
}
