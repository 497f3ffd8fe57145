//! Archive payloads and their normalization into hourly weather records.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::plan::HistoricalWindow;
use crate::trip::{Location, TripQuery};

const TIME_FORMAT_MINUTES: &str = "%Y-%m-%dT%H:%M";
const TIME_FORMAT_SECONDS: &str = "%Y-%m-%dT%H:%M:%S";
const TIME_FORMAT_SPACED: &str = "%Y-%m-%d %H:%M";

const ERROR_EMPTY_TIME: &str = "empty time";
const ERROR_UNRECOGNIZED_TIME: &str = "unrecognized time format";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnknownLocation(usize),
    DuplicateLocation(usize),
    LengthMismatch {
        field: &'static str,
        expected: usize,
        found: usize,
    },
    Time {
        raw: String,
        reason: String,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownLocation(id) => write!(f, "Response refers to unknown location {id}"),
            Self::DuplicateLocation(id) => write!(f, "Location {id} appears twice in one window"),
            Self::LengthMismatch {
                field,
                expected,
                found,
            } => write!(
                f,
                "Hourly field {field} has {found} samples, expected {expected}"
            ),
            Self::Time { raw, reason } => write!(f, "Failed to parse time '{raw}': {reason}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Hourly arrays as the archive returns them; samples may be `null`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawHourly {
    pub time: Vec<String>,
    #[serde(default)]
    pub temperature_2m: Vec<Option<f64>>,
    #[serde(default)]
    pub precipitation: Vec<Option<f64>>,
    #[serde(default)]
    pub cloud_cover: Vec<Option<f64>>,
    #[serde(default)]
    pub sunshine_duration: Vec<Option<f64>>,
    #[serde(default)]
    pub is_day: Vec<Option<u8>>,
}

/// One location's response for one window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawLocationRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    pub hourly: RawHourly,
    /// Index of the stop this payload belongs to; absent means the first one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<usize>,
}

impl RawLocationRecord {
    pub fn location_index(&self) -> usize {
        self.location_id.unwrap_or_default()
    }
}

/// A single-location call returns an object, a multi-location call an array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ArchivePayload {
    Many(Vec<RawLocationRecord>),
    One(RawLocationRecord),
}

impl ArchivePayload {
    pub fn into_records(self) -> Vec<RawLocationRecord> {
        match self {
            Self::Many(records) => records,
            Self::One(record) => vec![record],
        }
    }
}

/// Raw responses of one historical window, kept next to the window they answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowRecords {
    pub window: HistoricalWindow,
    pub records: Vec<RawLocationRecord>,
}

/// Normalized hourly sample.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherRecord {
    pub location: Arc<Location>,
    pub time: NaiveDateTime,
    pub temperature: f64,
    pub precipitation: f64,
    pub cloud_cover: f64,
    pub sunshine_duration: f64,
    pub is_day: bool,
}

#[derive(Clone, Copy, Debug)]
enum TimeFormatHint {
    Minutes,
    Seconds,
    Spaced,
}

impl TimeFormatHint {
    const ALL: [Self; 3] = [Self::Minutes, Self::Seconds, Self::Spaced];

    const fn format(self) -> &'static str {
        match self {
            Self::Minutes => TIME_FORMAT_MINUTES,
            Self::Seconds => TIME_FORMAT_SECONDS,
            Self::Spaced => TIME_FORMAT_SPACED,
        }
    }

    fn parse(self, raw: &str) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(raw, self.format()).ok()
    }
}

/// Parses archive timestamps, remembering the format that matched last.
fn parse_time_with_hint(
    raw: &str,
    hint: &mut Option<TimeFormatHint>,
) -> Result<NaiveDateTime, DecodeError> {
    let trimmed = raw.trim();
    let failure = |reason: &str| DecodeError::Time {
        raw: raw.to_string(),
        reason: reason.to_string(),
    };

    if trimmed.is_empty() {
        return Err(failure(ERROR_EMPTY_TIME));
    }

    if let Some(hint) = *hint
        && let Some(parsed) = hint.parse(trimmed)
    {
        return Ok(parsed);
    }

    for candidate in TimeFormatHint::ALL {
        if let Some(parsed) = candidate.parse(trimmed) {
            *hint = Some(candidate);
            return Ok(parsed);
        }
    }

    Err(failure(ERROR_UNRECOGNIZED_TIME))
}

fn check_len<T>(field: &'static str, values: &[T], expected: usize) -> Result<(), DecodeError> {
    if values.len() == expected {
        Ok(())
    } else {
        Err(DecodeError::LengthMismatch {
            field,
            expected,
            found: values.len(),
        })
    }
}

/// Linearly interpolates `null` samples between known neighbours.
fn fill_gaps(source: &[Option<f64>]) -> Vec<f64> {
    let mut values = source.to_vec();

    let mut last_known = None;
    for idx in 0..values.len() {
        if values[idx].is_some() {
            if let Some(start) = last_known {
                if let (Some(start_val), Some(end_val)) = (values[start], values[idx]) {
                    let gap = idx - start;
                    if gap > 1 {
                        for (offset, slot) in ((start + 1)..idx).enumerate() {
                            let ratio = (offset as f64 + 1.0) / gap as f64;
                            values[slot] = Some(start_val + (end_val - start_val) * ratio);
                        }
                    }
                }
            } else {
                // Leading gap takes the first observed value.
                let first_value = values[idx];
                for placeholder in values.iter_mut().take(idx) {
                    *placeholder = first_value;
                }
            }
            last_known = Some(idx);
        }
    }

    if let Some(last) = last_known {
        let tail_value = values[last];
        for value in values.iter_mut().skip(last + 1) {
            *value = tail_value;
        }
    }

    values
        .into_iter()
        .map(Option::unwrap_or_default)
        .collect()
}

/// Turns one raw payload into records tagged with the stop it belongs to.
pub fn normalize_record(
    record: &RawLocationRecord,
    queries: &[TripQuery],
) -> Result<Vec<WeatherRecord>, DecodeError> {
    let index = record.location_index();
    let location = queries
        .get(index)
        .map(|query| Arc::clone(&query.location))
        .ok_or(DecodeError::UnknownLocation(index))?;

    let hourly = &record.hourly;
    let expected = hourly.time.len();
    check_len("temperature_2m", &hourly.temperature_2m, expected)?;
    check_len("precipitation", &hourly.precipitation, expected)?;
    check_len("cloud_cover", &hourly.cloud_cover, expected)?;
    check_len("sunshine_duration", &hourly.sunshine_duration, expected)?;
    check_len("is_day", &hourly.is_day, expected)?;

    if hourly.temperature_2m.iter().any(Option::is_none) {
        warn!(
            location = %location.display_name(),
            missing = hourly.temperature_2m.iter().filter(|v| v.is_none()).count(),
            "Interpolating missing temperature samples"
        );
    }

    let mut hint = None;
    let times = hourly
        .time
        .iter()
        .map(|raw| parse_time_with_hint(raw, &mut hint))
        .collect::<Result<Vec<_>, _>>()?;
    let temperature = fill_gaps(&hourly.temperature_2m);
    let precipitation = fill_gaps(&hourly.precipitation);
    let cloud_cover = fill_gaps(&hourly.cloud_cover);
    let sunshine_duration = fill_gaps(&hourly.sunshine_duration);

    Ok(times
        .into_iter()
        .enumerate()
        .map(|(i, time)| WeatherRecord {
            location: Arc::clone(&location),
            time,
            temperature: temperature[i],
            precipitation: precipitation[i],
            cloud_cover: cloud_cover[i],
            sunshine_duration: sunshine_duration[i],
            is_day: hourly.is_day[i].is_some_and(|flag| flag != 0),
        })
        .collect())
}

/// Normalizes every payload of a window, keyed by the stop index.
pub fn normalize_window(
    records: &[RawLocationRecord],
    queries: &[TripQuery],
) -> Result<BTreeMap<usize, Vec<WeatherRecord>>, DecodeError> {
    let mut by_location = BTreeMap::new();
    for record in records {
        let index = record.location_index();
        if by_location.contains_key(&index) {
            return Err(DecodeError::DuplicateLocation(index));
        }
        by_location.insert(index, normalize_record(record, queries)?);
    }
    Ok(by_location)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trip::{DateRange, IdAllocator};
    use chrono::NaiveDate;

    fn queries() -> Vec<TripQuery> {
        let mut ids = IdAllocator::default();
        let dates = DateRange::new(
            NaiveDate::from_ymd_opt(2025, 4, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 4, 2).unwrap(),
        )
        .unwrap();
        vec![
            TripQuery::new(Location::new(&mut ids, "Tokyo", 35.67, 139.79), dates),
            TripQuery::new(Location::new(&mut ids, "Kyoto", 34.96, 135.74), dates),
        ]
    }

    fn hourly(times: &[&str]) -> RawHourly {
        RawHourly {
            time: times.iter().map(ToString::to_string).collect(),
            temperature_2m: vec![Some(10.0); times.len()],
            precipitation: vec![Some(0.0); times.len()],
            cloud_cover: vec![Some(50.0); times.len()],
            sunshine_duration: vec![Some(3600.0); times.len()],
            is_day: vec![Some(1); times.len()],
        }
    }

    #[test]
    fn parses_single_and_multi_location_payloads() {
        let one = r#"{"latitude":35.7,"longitude":139.8,"hourly":{"time":["2024-04-01T00:00"],
            "temperature_2m":[9.5],"precipitation":[0.0],"cloud_cover":[12],
            "sunshine_duration":[0.0],"is_day":[0]}}"#;
        let payload: ArchivePayload = serde_json::from_str(one).unwrap();
        let records = payload.into_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].location_index(), 0);

        let many = r#"[{"hourly":{"time":[]},"location_id":0},{"hourly":{"time":[]},"location_id":1}]"#;
        let payload: ArchivePayload = serde_json::from_str(many).unwrap();
        let records = payload.into_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].location_index(), 1);
    }

    #[test]
    fn tags_records_with_the_stop_from_location_id() {
        let queries = queries();
        let record = RawLocationRecord {
            hourly: hourly(&["2024-04-01T00:00", "2024-04-01T01:00"]),
            location_id: Some(1),
            ..RawLocationRecord::default()
        };
        let normalized = normalize_record(&record, &queries).unwrap();
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[0].location.id(), queries[1].location.id());
        assert!(normalized[1].is_day);
        assert_eq!(
            normalized[1].time,
            NaiveDate::from_ymd_opt(2024, 4, 1)
                .unwrap()
                .and_hms_opt(1, 0, 0)
                .unwrap()
        );
    }

    #[test]
    fn rejects_unknown_and_duplicate_locations() {
        let queries = queries();
        let stray = RawLocationRecord {
            hourly: hourly(&["2024-04-01T00:00"]),
            location_id: Some(7),
            ..RawLocationRecord::default()
        };
        assert_eq!(
            normalize_record(&stray, &queries),
            Err(DecodeError::UnknownLocation(7))
        );

        let first = RawLocationRecord {
            hourly: hourly(&["2024-04-01T00:00"]),
            ..RawLocationRecord::default()
        };
        let err = normalize_window(&[first.clone(), first], &queries).unwrap_err();
        assert_eq!(err, DecodeError::DuplicateLocation(0));
    }

    #[test]
    fn rejects_ragged_hourly_arrays() {
        let mut raw = hourly(&["2024-04-01T00:00", "2024-04-01T01:00"]);
        raw.cloud_cover.pop();
        let record = RawLocationRecord {
            hourly: raw,
            ..RawLocationRecord::default()
        };
        let err = normalize_record(&record, &queries()).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::LengthMismatch {
                field: "cloud_cover",
                expected: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn interpolates_missing_samples() {
        let filled = fill_gaps(&[None, Some(2.0), None, None, Some(8.0), None]);
        assert_eq!(filled, vec![2.0, 2.0, 4.0, 6.0, 8.0, 8.0]);
        assert_eq!(fill_gaps(&[None, None]), vec![0.0, 0.0]);
    }

    #[test]
    fn accepts_timestamps_with_seconds() {
        let mut hint = None;
        let parsed = parse_time_with_hint("2024-04-01T05:00:00", &mut hint).unwrap();
        assert_eq!(parsed.format("%H").to_string(), "05");
        assert!(parse_time_with_hint("yesterday", &mut hint).is_err());
    }
}
