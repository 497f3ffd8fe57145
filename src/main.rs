mod config;
mod constants;
mod data;
mod fetch;
mod geometry;
mod output;
mod pipeline;
mod plan;
mod segments;
mod series;
mod stats;
mod trip;

use chrono::{Datelike, Local};
use clap::{CommandFactory, Parser, Subcommand};
use std::fs::{self, File};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use crate::config::{DEFAULT_TRIP_CONFIG, Overrides, TripConfig, load_trip_config};
use crate::data::WindowRecords;
use crate::fetch::{ArchiveClient, DEFAULT_GEOCODE_URL, Geocoder, build_client};
use crate::pipeline::{ChartState, DerivedChart, Session};
use crate::plan::plan_requests;
use crate::stats::Metric;
use crate::trip::TripQuery;
use clap_complete::{Shell, generate};
use tracing_subscriber::EnvFilter;

const APP_ABOUT: &str = "Weatherly - historical hourly weather along a multi-stop trip";
const DEFAULT_BATCH_JSON: &str = "dist/batch.json";
const DEFAULT_GEOMETRY_JSON: &str = "dist/geometry.json";
const DEFAULT_STATS_CSV: &str = "dist/stats.csv";

#[derive(Parser, Debug)]
#[command(name = "weatherly", about = APP_ABOUT)]
struct Args {
    /// Write JSON artefacts as .json.gz.
    #[arg(long = "compress", global = true)]
    compress: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct TripArgs {
    /// TOML file with the stops and chart settings.
    #[arg(
        short = 't',
        long = "trip",
        value_name = "PATH",
        default_value = DEFAULT_TRIP_CONFIG
    )]
    trip: PathBuf,
    /// Number of prior years to compare (overrides the trip file).
    #[arg(long = "years", value_name = "N")]
    years: Option<usize>,
}

#[derive(clap::Args, Debug)]
struct ChartArgs {
    /// Chart width in pixels (overrides the trip file).
    #[arg(long = "width", value_name = "PX")]
    width: Option<f64>,
    /// Keep night hours and emit day/night intervals.
    #[arg(long = "show-night")]
    show_night: bool,
    /// Emit the min/max band around the average.
    #[arg(long = "min-max")]
    min_max: bool,
    /// Hourly value summarized in the stats CSV.
    #[arg(long = "metric", value_enum, default_value_t = Metric::Temperature)]
    metric: Metric,
    /// Where to save the chart geometry.
    #[arg(
        short = 'o',
        long = "output-geometry",
        value_name = "PATH",
        default_value = DEFAULT_GEOMETRY_JSON
    )]
    output_geometry: PathBuf,
    /// Where to save the per-slot statistics.
    #[arg(
        long = "output-stats-csv",
        value_name = "PATH",
        default_value = DEFAULT_STATS_CSV
    )]
    output_stats_csv: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Full mode: fetch the history and derive the chart geometry.
    Run {
        #[command(flatten)]
        trip: TripArgs,
        #[command(flatten)]
        chart: ChartArgs,
        /// Look up labels for stops that have no name.
        #[arg(long = "geocode")]
        geocode: bool,
    },
    /// Print the archive requests without sending them.
    Plan {
        #[command(flatten)]
        trip: TripArgs,
    },
    /// Fetch the history and save the raw batch.
    Download {
        #[command(flatten)]
        trip: TripArgs,
        /// Where to save the raw batch.
        #[arg(
            short = 'o',
            long = "output",
            value_name = "PATH",
            default_value = DEFAULT_BATCH_JSON
        )]
        output: PathBuf,
    },
    /// Derive the chart geometry from a saved batch.
    Render {
        #[command(flatten)]
        trip: TripArgs,
        #[command(flatten)]
        chart: ChartArgs,
        /// Raw batch saved by `download` (.json or .json.gz).
        #[arg(
            short = 'b',
            long = "batch",
            value_name = "PATH",
            default_value = DEFAULT_BATCH_JSON
        )]
        batch: PathBuf,
    },
    /// Generate shell completion files.
    Completions {
        /// Target shell.
        #[arg(value_enum)]
        shell: Shell,
        /// Where to save the file (stdout when omitted).
        #[arg(short = 'o', long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weatherly=info"));
    let ansi = std::io::stdout().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(ansi)
        .compact()
        .init();
}

fn headline(message: &str) {
    tracing::info!(status = "start", "{message}");
}

fn info(message: &str) {
    tracing::info!(status = "info", "{message}");
}

fn success(message: &str) {
    tracing::info!(status = "ok", "{message}");
}

fn error(message: &str) {
    tracing::error!(status = "err", "{message}");
}

fn generate_completions(shell: Shell, output: Option<PathBuf>) -> Result<(), String> {
    let mut cmd = Args::command();
    let bin_name = cmd.get_name().to_string();
    if let Some(path) = output {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .map_err(|err| format!("Failed to create {}: {err}", parent.display()))?;
        }
        let mut file = File::create(&path)
            .map_err(|err| format!("Failed to create {}: {err}", path.display()))?;
        generate(shell, &mut cmd, bin_name, &mut file);
    } else {
        let mut stdout = std::io::stdout();
        generate(shell, &mut cmd, bin_name, &mut stdout);
    }
    Ok(())
}

fn load_config(trip: &TripArgs, chart: Option<&ChartArgs>) -> Result<TripConfig, String> {
    let mut config = load_trip_config(&trip.trip).map_err(|err| err.to_string())?;
    let overrides = Overrides {
        width: chart.and_then(|chart| chart.width),
        years: trip.years,
        show_night: chart.is_some_and(|chart| chart.show_night),
        show_min_max: chart.is_some_and(|chart| chart.min_max),
    };
    config.apply(&overrides).map_err(|err| err.to_string())?;
    Ok(config)
}

/// Labels for unnamed stops; a failed lookup leaves the coordinates as label.
async fn geocode_labels(config: &TripConfig) -> Result<Vec<Option<String>>, String> {
    let geocoder = Geocoder::new(
        build_client().map_err(|err| err.to_string())?,
        DEFAULT_GEOCODE_URL,
    );
    let mut labels = vec![None; config.stops.len()];
    for (index, stop) in config.unnamed_stops() {
        match geocoder.reverse(stop.latitude, stop.longitude).await {
            Ok(label) => {
                tracing::info!(stop = index, label = ?label, "Geocoded stop");
                labels[index] = label;
            }
            Err(err) => tracing::warn!(stop = index, error = %err, "Reverse geocoding failed"),
        }
    }
    Ok(labels)
}

fn build_queries(config: &TripConfig, labels: &[Option<String>]) -> Result<Vec<TripQuery>, String> {
    config.queries(labels).map_err(|err| err.to_string())
}

fn current_year() -> i32 {
    Local::now().year()
}

fn archive_client(config: &TripConfig) -> Result<ArchiveClient, String> {
    let client = build_client().map_err(|err| err.to_string())?;
    Ok(ArchiveClient::new(client, config.history.base_url.clone()))
}

fn plan(config: &TripConfig, queries: &[TripQuery]) -> Result<(), String> {
    let client = archive_client(config)?;
    let requests = plan_requests(queries, current_year(), config.history.years)
        .map_err(|err| err.to_string())?;
    for request in &requests {
        let url = client.request_url(request).map_err(|err| err.to_string())?;
        tracing::info!(
            window = request.window.index,
            start = %request.window.start,
            end = %request.window.end,
            "{url}"
        );
    }
    success(&format!("Planned {} requests", requests.len()));
    Ok(())
}

async fn refresh(session: &mut Session, config: &TripConfig) -> Result<(), String> {
    let client = archive_client(config)?;
    let requests = plan_requests(session.queries(), current_year(), config.history.years)
        .map_err(|err| err.to_string())?;
    let (generation, batch) = session.refresh(client.fetch_batch(&requests));
    let result = batch.await;
    session.complete(generation, result);
    Ok(())
}

async fn download(config: &TripConfig, queries: &[TripQuery]) -> Result<Vec<WindowRecords>, String> {
    let client = archive_client(config)?;
    let requests = plan_requests(queries, current_year(), config.history.years)
        .map_err(|err| err.to_string())?;
    client
        .fetch_batch(&requests)
        .await
        .map_err(|err| err.to_string())
}

/// A missing plain batch falls back to its compressed sibling.
fn resolve_batch_path(path: &Path) -> PathBuf {
    if !path.exists()
        && let Ok(compressed) = output::gzip_path_for(path)
        && compressed.exists()
    {
        return compressed;
    }
    path.to_path_buf()
}

fn write_chart(chart: &DerivedChart, args: &ChartArgs, compress: bool) -> Result<(), String> {
    let geometry = output::write_json(&chart.geometry, &args.output_geometry, compress)?;
    output::write_stats_csv(chart, args.metric, &args.output_stats_csv)?;
    success(&format!(
        "Saved geometry to {} and stats to {}",
        geometry.display(),
        args.output_stats_csv.display()
    ));
    Ok(())
}

fn emit_chart(
    session: &mut Session,
    config: &TripConfig,
    args: &ChartArgs,
    compress: bool,
) -> Result<(), String> {
    match session.chart(&config.chart, config.truncate_short_series) {
        ChartState::Ready(chart) => write_chart(chart, args, compress),
        ChartState::Stale { error, .. } | ChartState::Unavailable(error) => Err(error),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let compress = args.compress;
    match args.command {
        Command::Completions { shell, output } => {
            if let Err(err) = generate_completions(shell, output) {
                eprintln!("{err}");
            }
        }
        Command::Run {
            trip,
            chart,
            geocode,
        } => {
            init_logging();
            headline(APP_ABOUT);
            let config = match load_config(&trip, Some(&chart)) {
                Ok(config) => config,
                Err(err) => {
                    error(&err);
                    return;
                }
            };
            tracing::info!(
                mode = "run",
                compress,
                geocode,
                years = config.history.years,
                width = config.chart.width,
                show_night = config.chart.show_night,
                trip = %trip.trip.display(),
                output_geometry = %chart.output_geometry.display(),
                "Starting full pipeline"
            );
            let labels = if geocode {
                match geocode_labels(&config).await {
                    Ok(labels) => labels,
                    Err(err) => {
                        error(&err);
                        return;
                    }
                }
            } else {
                Vec::new()
            };
            let queries = match build_queries(&config, &labels) {
                Ok(queries) => queries,
                Err(err) => {
                    error(&err);
                    return;
                }
            };
            let mut session = Session::new(queries);
            if let Err(err) = refresh(&mut session, &config).await {
                error(&err);
                return;
            }
            if let Err(err) = emit_chart(&mut session, &config, &chart, compress) {
                error(&err);
            }
        }
        Command::Plan { trip } => {
            init_logging();
            headline(APP_ABOUT);
            let result = load_config(&trip, None).and_then(|config| {
                let queries = build_queries(&config, &[])?;
                plan(&config, &queries)
            });
            if let Err(err) = result {
                error(&err);
            }
        }
        Command::Download {
            trip,
            output: output_path,
        } => {
            init_logging();
            headline(APP_ABOUT);
            tracing::info!(
                mode = "download",
                compress,
                trip = %trip.trip.display(),
                output = %output_path.display(),
                "Downloading weather history"
            );
            let config = match load_config(&trip, None) {
                Ok(config) => config,
                Err(err) => {
                    error(&err);
                    return;
                }
            };
            let queries = match build_queries(&config, &[]) {
                Ok(queries) => queries,
                Err(err) => {
                    error(&err);
                    return;
                }
            };
            let batch = match download(&config, &queries).await {
                Ok(batch) => batch,
                Err(err) => {
                    error(&err);
                    return;
                }
            };
            match output::write_json(&batch, &output_path, compress) {
                Ok(path) => success(&format!("Saved {} windows to {}", batch.len(), path.display())),
                Err(err) => error(&err),
            }
        }
        Command::Render { trip, chart, batch } => {
            init_logging();
            headline(APP_ABOUT);
            let batch_path = resolve_batch_path(&batch);
            tracing::info!(
                mode = "render",
                compress,
                trip = %trip.trip.display(),
                batch = %batch_path.display(),
                output_geometry = %chart.output_geometry.display(),
                "Rendering chart geometry"
            );
            let config = match load_config(&trip, Some(&chart)) {
                Ok(config) => config,
                Err(err) => {
                    error(&err);
                    return;
                }
            };
            let queries = match build_queries(&config, &[]) {
                Ok(queries) => queries,
                Err(err) => {
                    error(&err);
                    return;
                }
            };
            info(&format!("Reading batch from {}", batch_path.display()));
            let windows: Vec<WindowRecords> = match output::read_json(&batch_path) {
                Ok(windows) => windows,
                Err(err) => {
                    error(&err);
                    return;
                }
            };
            let mut session = Session::new(queries);
            let generation = session.begin_refresh();
            session.complete(generation, Ok(windows));
            if let Err(err) = emit_chart(&mut session, &config, &chart, compress) {
                error(&err);
            }
        }
    }
}
