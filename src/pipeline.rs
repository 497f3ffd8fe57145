//! Composition of the chart steps and the in-memory session around them.

use std::fmt;
use std::future::Future;

use tracing::{debug, info, warn};

use crate::data::WindowRecords;
use crate::fetch::{FetchError, FetchSession};
use crate::geometry::{ChartGeometry, ChartOptions, build_geometry};
use crate::series::{AlignError, AlignedYearSeries, align, daytime_only, truncate_to_shortest};
use crate::stats::{AggregateStat, ShapeMismatchError, ensure_uniform, temperature_stats};
use crate::trip::{TripError, TripQuery};

const NO_DATA: &str = "No weather data loaded yet";

#[derive(Debug)]
pub enum PipelineError {
    Trip(TripError),
    Align(AlignError),
    Shape(ShapeMismatchError),
    Fetch(FetchError),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trip(err) => write!(f, "{err}"),
            Self::Align(err) => write!(f, "{err}"),
            Self::Shape(err) => write!(f, "{err}"),
            Self::Fetch(err) => write!(f, "Failed to fetch weather history: {err}"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Trip(err) => Some(err),
            Self::Align(err) => Some(err),
            Self::Shape(err) => Some(err),
            Self::Fetch(err) => Some(err),
        }
    }
}

impl From<TripError> for PipelineError {
    fn from(err: TripError) -> Self {
        Self::Trip(err)
    }
}

impl From<AlignError> for PipelineError {
    fn from(err: AlignError) -> Self {
        Self::Align(err)
    }
}

impl From<ShapeMismatchError> for PipelineError {
    fn from(err: ShapeMismatchError) -> Self {
        Self::Shape(err)
    }
}

impl From<FetchError> for PipelineError {
    fn from(err: FetchError) -> Self {
        Self::Fetch(err)
    }
}

/// Everything a renderer needs for one chart.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedChart {
    pub geometry: ChartGeometry,
    /// Temperature stats behind the geometry.
    pub stats: Vec<AggregateStat>,
    /// Aligned years after filtering, one slot per geometry point.
    pub series: Vec<AlignedYearSeries>,
}

/// Runs alignment, statistics and geometry for one batch.
///
/// Unequal years fail unless `truncate` is set. With night hidden only the
/// slots where some year saw sunshine are kept.
pub fn derive_chart(
    queries: &[TripQuery],
    batch: &[WindowRecords],
    options: &ChartOptions,
    truncate: bool,
) -> Result<DerivedChart, PipelineError> {
    let mut series = align(queries, batch)?;
    if series.iter().all(AlignedYearSeries::is_empty) {
        warn!(windows = batch.len(), "No archived hours fall inside the trip");
    }
    if truncate {
        series = truncate_to_shortest(&series);
    } else {
        ensure_uniform(&series)?;
    }
    if !options.show_night {
        series = daytime_only(&series);
    }
    let stats = temperature_stats(&series)?;
    let geometry = build_geometry(&series, &stats, options);
    debug!(
        years = series.len(),
        slots = stats.len(),
        locations = geometry.locations.len(),
        "Derived chart geometry"
    );
    Ok(DerivedChart {
        geometry,
        stats,
        series,
    })
}

/// Single-entry cache: recomputes only when the key changes.
#[derive(Debug)]
pub struct Memo<K, V> {
    entry: Option<(K, V)>,
}

impl<K, V> Default for Memo<K, V> {
    fn default() -> Self {
        Self { entry: None }
    }
}

impl<K: PartialEq, V> Memo<K, V> {
    /// Returns the cached value for `key`, computing it on a miss.
    /// A failed computation keeps the previous entry.
    pub fn get_or_compute<E>(
        &mut self,
        key: K,
        compute: impl FnOnce(&K) -> Result<V, E>,
    ) -> Result<&V, E> {
        let entry = match self.entry.take() {
            Some((cached, value)) if cached == key => (cached, value),
            stale => match compute(&key) {
                Ok(value) => (key, value),
                Err(err) => {
                    self.entry = stale;
                    return Err(err);
                }
            },
        };
        Ok(&self.entry.insert(entry).1)
    }

    /// Most recently computed value, whatever its key.
    pub fn value(&self) -> Option<&V> {
        self.entry.as_ref().map(|(_, value)| value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ChartKey {
    generation: u64,
    options: ChartOptions,
    truncate: bool,
}

#[derive(Debug)]
struct LoadedBatch {
    generation: u64,
    windows: Vec<WindowRecords>,
}

/// What the session can show right now.
#[derive(Debug, PartialEq)]
pub enum ChartState<'a> {
    Ready(&'a DerivedChart),
    /// Last good chart, shown while the latest refresh or derivation failed.
    Stale {
        chart: &'a DerivedChart,
        error: String,
    },
    Unavailable(String),
}

/// In-memory session for one trip: the latest batch and the chart derived from it.
#[derive(Debug)]
pub struct Session {
    queries: Vec<TripQuery>,
    generation: u64,
    batch: Option<LoadedBatch>,
    last_error: Option<String>,
    memo: Memo<ChartKey, DerivedChart>,
    fetches: FetchSession,
}

impl Session {
    pub fn new(queries: Vec<TripQuery>) -> Self {
        Self {
            queries,
            generation: 0,
            batch: None,
            last_error: None,
            memo: Memo::default(),
            fetches: FetchSession::default(),
        }
    }

    pub fn queries(&self) -> &[TripQuery] {
        &self.queries
    }

    /// Starts a new refresh; results tagged with older generations are ignored.
    pub const fn begin_refresh(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Starts a refresh that fetches through `batch`.
    ///
    /// A fetch still running for an earlier refresh resolves with
    /// [`FetchError::Cancelled`]. Hand the result to [`Session::complete`].
    pub fn refresh<F>(
        &mut self,
        batch: F,
    ) -> (u64, impl Future<Output = Result<Vec<WindowRecords>, FetchError>> + use<F>)
    where
        F: Future<Output = Result<Vec<WindowRecords>, FetchError>>,
    {
        let generation = self.begin_refresh();
        (generation, self.fetches.supersede(batch))
    }

    /// Records the outcome of refresh `generation`. Returns whether it was applied.
    pub fn complete(
        &mut self,
        generation: u64,
        result: Result<Vec<WindowRecords>, FetchError>,
    ) -> bool {
        if generation != self.generation {
            debug!(generation, current = self.generation, "Ignoring superseded batch");
            return false;
        }
        match result {
            Ok(windows) => {
                info!(generation, windows = windows.len(), "Weather batch loaded");
                self.batch = Some(LoadedBatch {
                    generation,
                    windows,
                });
                self.last_error = None;
            }
            Err(err) => {
                let err = PipelineError::from(err);
                warn!(generation, error = %err, "Weather batch failed");
                self.last_error = Some(err.to_string());
            }
        }
        true
    }

    /// Chart for `options`, reusing the cached one while inputs are unchanged.
    pub fn chart(&mut self, options: &ChartOptions, truncate: bool) -> ChartState<'_> {
        let Some(batch) = &self.batch else {
            return ChartState::Unavailable(
                self.last_error.clone().unwrap_or_else(|| NO_DATA.to_string()),
            );
        };
        let key = ChartKey {
            generation: batch.generation,
            options: *options,
            truncate,
        };
        let queries = &self.queries;
        let derived = self
            .memo
            .get_or_compute(key, |_| derive_chart(queries, &batch.windows, options, truncate))
            .map(|_| ())
            .map_err(|err| err.to_string());
        let error = derived.err().or_else(|| self.last_error.clone());

        match (self.memo.value(), error) {
            (Some(chart), None) => ChartState::Ready(chart),
            (Some(chart), Some(error)) => ChartState::Stale { chart, error },
            (None, error) => ChartState::Unavailable(error.unwrap_or_else(|| NO_DATA.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::HistoricalWindow;
    use crate::series::tests::{date, raw_days};
    use crate::trip::{DateRange, IdAllocator, Location};
    use reqwest::StatusCode;

    const YEARS: i32 = 5;

    fn trip() -> Vec<TripQuery> {
        let mut ids = IdAllocator::default();
        vec![
            TripQuery::new(
                Location::new(&mut ids, "Tokyo", 35.6764, 139.65),
                DateRange::new(date(2025, 4, 1), date(2025, 4, 5)).unwrap(),
            ),
            TripQuery::new(
                Location::new(&mut ids, "Kyoto", 35.0116, 135.7681),
                DateRange::new(date(2025, 4, 6), date(2025, 4, 10)).unwrap(),
            ),
        ]
    }

    /// Five prior years; both stops answer for the whole span like a multi-location call.
    fn batch() -> Vec<WindowRecords> {
        (1..=YEARS)
            .map(|back| {
                let year = 2025 - back;
                WindowRecords {
                    window: HistoricalWindow {
                        index: back.unsigned_abs(),
                        start: date(year, 4, 1),
                        end: date(year, 4, 10),
                    },
                    records: (0..2)
                        .map(|stop| {
                            raw_days(date(year, 4, 1), 10, stop, move |h| {
                                f64::from(back) + (h % 24) as f64
                            })
                        })
                        .collect(),
                }
            })
            .collect()
    }

    fn with_night() -> ChartOptions {
        ChartOptions {
            show_night: true,
            ..ChartOptions::default()
        }
    }

    #[test]
    fn end_to_end_geometry_covers_every_slot() {
        let chart = derive_chart(&trip(), &batch(), &with_night(), false).unwrap();
        let geometry = &chart.geometry;

        assert_eq!(chart.stats.len(), 240);
        assert_eq!(geometry.average.len(), 240);
        assert_eq!(geometry.source_years, [2024, 2023, 2022, 2021, 2020]);
        assert!(geometry.average.windows(2).all(|w| w[0].x < w[1].x));
        assert!((geometry.average[0].x - geometry.plot.left).abs() < 1e-9);
        assert!((geometry.average[239].x - geometry.plot.right).abs() < 1e-9);

        assert_eq!(geometry.locations.len(), 2);
        assert_eq!(geometry.locations[0].label, "Tokyo");
        assert_eq!(geometry.locations[1].start_index, 120);

        // Mock nights run from 18:00 to 06:00.
        let starts: Vec<_> = geometry.day_night.iter().map(|i| i.start_index).collect();
        let expected: Vec<_> = std::iter::once(0).chain((6..240).step_by(12)).collect();
        assert_eq!(starts, expected);
        assert!(!geometry.day_night[0].is_day);
        assert!(geometry.day_night.windows(2).all(|w| w[0].is_day != w[1].is_day));
        assert_eq!(geometry.day_ticks.len(), 10);
        assert_eq!(
            chart.series[0].hours[0].time,
            date(2025, 4, 1).and_hms_opt(0, 0, 0).unwrap()
        );

        // Years differ by a constant offset, so the mean is the middle year.
        assert!((chart.stats[0].avg - 3.0).abs() < 1e-9);
        assert!((chart.stats[0].min - 1.0).abs() < 1e-9);
        assert!((chart.stats[0].max - 5.0).abs() < 1e-9);
    }

    #[test]
    fn hidden_night_keeps_daytime_slots_only() {
        let chart = derive_chart(&trip(), &batch(), &ChartOptions::default(), false).unwrap();
        assert_eq!(chart.stats.len(), 120);
        assert!(chart.geometry.day_night.is_empty());
        assert_eq!(chart.geometry.caption, "day time temperatures during visit");
    }

    #[test]
    fn short_year_fails_unless_truncated() {
        let mut batch = batch();
        batch[4].records = vec![raw_days(date(2020, 4, 1), 3, 0, |_| 0.0)];
        let err = derive_chart(&trip(), &batch, &with_night(), false).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Shape(ShapeMismatchError {
                series: 4,
                expected: 240,
                found: 72
            })
        ));

        let chart = derive_chart(&trip(), &batch, &with_night(), true).unwrap();
        assert_eq!(chart.stats.len(), 72);
    }

    #[test]
    fn memo_recomputes_only_on_new_keys() {
        let mut memo = Memo::default();
        let mut calls = 0;
        let mut compute = |key: &u32| {
            calls += 1;
            Ok::<_, String>(key * 2)
        };
        assert_eq!(*memo.get_or_compute(1, &mut compute).unwrap(), 2);
        assert_eq!(*memo.get_or_compute(1, &mut compute).unwrap(), 2);
        assert_eq!(*memo.get_or_compute(2, &mut compute).unwrap(), 4);
        assert_eq!(calls, 2);

        let failed = memo.get_or_compute(3, |_| Err::<u32, _>("boom".to_string()));
        assert_eq!(failed.unwrap_err(), "boom");
        assert_eq!(memo.value(), Some(&4));
    }

    #[test]
    fn session_keeps_last_good_chart_on_failure() {
        let mut session = Session::new(trip());
        let options = with_night();
        assert!(matches!(session.chart(&options, false), ChartState::Unavailable(_)));

        let first = session.begin_refresh();
        assert!(session.complete(first, Ok(batch())));
        assert!(matches!(session.chart(&options, false), ChartState::Ready(_)));

        let second = session.begin_refresh();
        let failure = FetchError::Status {
            status: StatusCode::BAD_GATEWAY,
            url: "http://archive".to_string(),
        };
        assert!(session.complete(second, Err(failure)));
        match session.chart(&options, false) {
            ChartState::Stale { chart, error } => {
                assert_eq!(chart.stats.len(), 240);
                assert!(error.contains("502"));
            }
            other => panic!("expected a stale chart, got {other:?}"),
        }
    }

    #[test]
    fn superseded_refresh_is_ignored() {
        let mut session = Session::new(trip());
        let stale = session.begin_refresh();
        let fresh = session.begin_refresh();
        assert!(!session.complete(stale, Ok(Vec::new())));
        assert!(session.complete(fresh, Ok(batch())));
        assert!(matches!(
            session.chart(&ChartOptions::default(), false),
            ChartState::Ready(chart) if chart.stats.len() == 120
        ));
    }

    #[tokio::test]
    async fn new_refresh_aborts_the_running_fetch() {
        let mut session = Session::new(trip());
        let (first, pending) = session.refresh(std::future::pending());
        let (second, loaded) = session.refresh(std::future::ready(Ok(batch())));

        let cancelled = pending.await;
        assert!(matches!(cancelled, Err(FetchError::Cancelled)));
        assert!(!session.complete(first, cancelled));
        assert!(session.complete(second, loaded.await));
        assert!(matches!(
            session.chart(&ChartOptions::default(), false),
            ChartState::Ready(chart) if chart.stats.len() == 120
        ));
    }

    #[test]
    fn failed_first_batch_is_unavailable() {
        let mut session = Session::new(trip());
        let generation = session.begin_refresh();
        session.complete(generation, Err(FetchError::Cancelled));
        match session.chart(&ChartOptions::default(), false) {
            ChartState::Unavailable(error) => assert!(error.contains("superseded")),
            other => panic!("expected no chart, got {other:?}"),
        }
    }
}
