//! Trip file loading: TOML sections resolved onto built-in defaults.

use std::path::{Path, PathBuf};
use std::{fmt, fs, io};

use chrono::NaiveDate;
use serde::Deserialize;

use crate::constants::DEFAULT_HISTORY_YEARS;
use crate::fetch::DEFAULT_ARCHIVE_URL;
use crate::geometry::{ChartOptions, Margin};
use crate::trip::{DateRange, IdAllocator, Location, TripError, TripQuery};

pub const DEFAULT_TRIP_CONFIG: &str = "config/trip.toml";

#[derive(Debug)]
pub enum ConfigError {
    Missing(PathBuf),
    Read { path: PathBuf, source: io::Error },
    Parse { path: PathBuf, source: toml::de::Error },
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(path) => write!(f, "Trip file {} does not exist", path.display()),
            Self::Read { path, source } => {
                write!(f, "Failed to read trip file {}: {source}", path.display())
            }
            Self::Parse { path, source } => {
                write!(f, "Failed to parse trip file {}: {source}", path.display())
            }
            Self::Invalid(reason) => write!(f, "Invalid trip file: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            Self::Missing(_) | Self::Invalid(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TripFile {
    history: Option<HistoryFile>,
    chart: Option<ChartFile>,
    #[serde(default, rename = "stop")]
    stops: Vec<StopConfig>,
}

#[derive(Debug, Deserialize)]
struct HistoryFile {
    years: Option<usize>,
    base_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartFile {
    width: Option<f64>,
    show_night: Option<bool>,
    show_min_max: Option<bool>,
    temperature_min: Option<f64>,
    temperature_max: Option<f64>,
    truncate_short_series: Option<bool>,
    margin: Option<f64>,
}

/// One stay as written in the trip file. An empty name asks for a geocoded label.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StopConfig {
    #[serde(default)]
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryConfig {
    pub years: usize,
    pub base_url: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            years: DEFAULT_HISTORY_YEARS,
            base_url: DEFAULT_ARCHIVE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TripConfig {
    pub history: HistoryConfig,
    pub chart: ChartOptions,
    pub truncate_short_series: bool,
    pub stops: Vec<StopConfig>,
}

/// Command line values that win over the trip file.
#[derive(Debug, Clone, Copy, Default)]
pub struct Overrides {
    pub width: Option<f64>,
    pub years: Option<usize>,
    pub show_night: bool,
    pub show_min_max: bool,
}

fn resolve_history(overrides: Option<HistoryFile>) -> HistoryConfig {
    let mut cfg = HistoryConfig::default();
    if let Some(overrides) = overrides {
        if let Some(years) = overrides.years {
            cfg.years = years;
        }
        if let Some(base_url) = overrides.base_url {
            cfg.base_url = base_url;
        }
    }
    cfg
}

fn resolve_chart(overrides: Option<ChartFile>) -> (ChartOptions, bool) {
    let mut cfg = ChartOptions::default();
    let mut truncate = false;
    if let Some(overrides) = overrides {
        if let Some(width) = overrides.width {
            cfg.width = width;
        }
        if let Some(show_night) = overrides.show_night {
            cfg.show_night = show_night;
        }
        if let Some(show_min_max) = overrides.show_min_max {
            cfg.show_min_max = show_min_max;
        }
        if let Some(margin) = overrides.margin {
            cfg.margin = Margin {
                top: margin,
                right: margin,
                bottom: margin,
                left: margin,
            };
        }
        cfg.temperature_domain = overrides.temperature_min.zip(overrides.temperature_max);
        if overrides.temperature_min.is_some() != overrides.temperature_max.is_some() {
            tracing::warn!("temperature_min and temperature_max only apply together; ignoring");
        }
        if let Some(flag) = overrides.truncate_short_series {
            truncate = flag;
        }
    }
    (cfg, truncate)
}

fn validate_history(cfg: &HistoryConfig) -> Result<(), String> {
    if cfg.years == 0 {
        return Err("history.years must be >= 1".to_string());
    }
    if cfg.base_url.trim().is_empty() {
        return Err("history.base_url must not be empty".to_string());
    }
    Ok(())
}

fn validate_chart(cfg: &ChartOptions) -> Result<(), String> {
    let margin = cfg.margin;
    if !margin.left.is_finite() || margin.left < 0.0 {
        return Err("chart.margin must be >= 0".to_string());
    }
    if !cfg.width.is_finite() || cfg.width <= margin.left + margin.right {
        return Err("chart.width must exceed both margins".to_string());
    }
    if cfg.height() <= margin.top + margin.bottom {
        return Err("chart.width leaves no room for the plot height".to_string());
    }
    if let Some((min, max)) = cfg.temperature_domain
        && !(min.is_finite() && max.is_finite() && min < max)
    {
        return Err("chart.temperature_min must be below chart.temperature_max".to_string());
    }
    Ok(())
}

fn validate_stops(stops: &[StopConfig]) -> Result<(), String> {
    if stops.is_empty() {
        return Err("at least one [[stop]] is required".to_string());
    }
    for (index, stop) in stops.iter().enumerate() {
        if !(-90.0..=90.0).contains(&stop.latitude) {
            return Err(format!("stop {index}: latitude must be within -90..=90"));
        }
        if !(-180.0..=180.0).contains(&stop.longitude) {
            return Err(format!("stop {index}: longitude must be within -180..=180"));
        }
        if stop.start > stop.end {
            return Err(format!("stop {index}: start is after end"));
        }
    }
    Ok(())
}

impl TripConfig {
    pub fn from_toml(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        let file: TripFile = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let (chart, truncate_short_series) = resolve_chart(file.chart);
        let config = Self {
            history: resolve_history(file.history),
            chart,
            truncate_short_series,
            stops: file.stops,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_history(&self.history)
            .and_then(|()| validate_chart(&self.chart))
            .and_then(|()| validate_stops(&self.stops))
            .map_err(ConfigError::Invalid)
    }

    /// Applies command line overrides and validates the result again.
    pub fn apply(&mut self, overrides: &Overrides) -> Result<(), ConfigError> {
        if let Some(width) = overrides.width {
            self.chart.width = width;
        }
        if let Some(years) = overrides.years {
            self.history.years = years;
        }
        self.chart.show_night |= overrides.show_night;
        self.chart.show_min_max |= overrides.show_min_max;
        self.validate()
    }

    /// Stops that have neither a name nor a label yet.
    pub fn unnamed_stops(&self) -> impl Iterator<Item = (usize, &StopConfig)> {
        self.stops
            .iter()
            .enumerate()
            .filter(|(_, stop)| stop.name.trim().is_empty())
    }

    /// Builds the ordered trip queries; `labels[i]` is the geocoded label of stop `i`.
    pub fn queries(&self, labels: &[Option<String>]) -> Result<Vec<TripQuery>, TripError> {
        let mut ids = IdAllocator::default();
        self.stops
            .iter()
            .enumerate()
            .map(|(index, stop)| {
                let location = Location::new(&mut ids, stop.name.clone(), stop.latitude, stop.longitude)
                    .with_geocode(labels.get(index).cloned().flatten());
                Ok(TripQuery::new(location, DateRange::new(stop.start, stop.end)?))
            })
            .collect()
    }
}

pub fn load_trip_config(path: &Path) -> Result<TripConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::Missing(path.to_path_buf()));
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = TripConfig::from_toml(&raw, path)?;
    tracing::info!(
        stops = config.stops.len(),
        years = config.history.years,
        "Loaded trip file {}",
        path.display()
    );
    Ok(config)
}
