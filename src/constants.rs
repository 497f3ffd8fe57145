//! Shared formats and field names so strings are not duplicated across modules.

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const MONTH_DAY_FORMAT: &str = "%m-%d";
pub const COORDINATE_PRECISION: usize = 4;
pub const DEFAULT_HISTORY_YEARS: usize = 5;
pub const HOURLY_FIELDS: [&str; 5] = [
    "temperature_2m",
    "precipitation",
    "cloud_cover",
    "sunshine_duration",
    "is_day",
];
