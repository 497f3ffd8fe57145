//! Files handed to the renderer: geometry and raw batches as JSON, slot stats as CSV.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::pipeline::DerivedChart;
use crate::stats::{Metric, aggregate};

const STATS_CSV_HEADER: &str = "index,label,min,avg,max\n";
const SLOT_LABEL_FORMAT: &str = "%Y-%m-%d %H:%M";
const GZIP_EXTENSION: &str = "gz";

fn ensure_parent(path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .map_err(|err| format!("Failed to create {}: {err}", parent.display()))?;
    }
    Ok(())
}

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == GZIP_EXTENSION)
}

/// `path` with `.gz` appended to its file name.
pub fn gzip_path_for(path: &Path) -> Result<PathBuf, String> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| format!("Path {} has no file name", path.display()))?;
    let mut archive_path = path.to_path_buf();
    archive_path.set_file_name(format!("{file_name}.{GZIP_EXTENSION}"));
    Ok(archive_path)
}

/// Serializes `value` to `path`, or to `path.gz` when `compress` is set.
/// Returns the path actually written.
pub fn write_json<T: Serialize>(value: &T, path: &Path, compress: bool) -> Result<PathBuf, String> {
    let target = if compress {
        gzip_path_for(path)?
    } else {
        path.to_path_buf()
    };
    ensure_parent(&target)?;
    let file = File::create(&target)
        .map_err(|err| format!("Failed to create {}: {err}", target.display()))?;
    let writer = BufWriter::new(file);
    if compress {
        let mut encoder = GzEncoder::new(writer, Compression::default());
        serde_json::to_writer(&mut encoder, value)
            .map_err(|err| format!("Failed to write {}: {err}", target.display()))?;
        encoder
            .finish()
            .and_then(|mut inner| inner.flush())
            .map_err(|err| format!("Failed to finalize archive {}: {err}", target.display()))?;
    } else {
        let mut writer = writer;
        serde_json::to_writer_pretty(&mut writer, value)
            .map_err(|err| format!("Failed to write {}: {err}", target.display()))?;
        writer
            .flush()
            .map_err(|err| format!("Failed to flush {}: {err}", target.display()))?;
    }
    Ok(target)
}

/// Reads JSON written by [`write_json`]; `.gz` files are decompressed.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, String> {
    let file =
        File::open(path).map_err(|err| format!("Failed to open {}: {err}", path.display()))?;
    let reader: Box<dyn Read> = if is_gzip(path) {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    serde_json::from_reader(reader).map_err(|err| format!("Failed to parse {}: {err}", path.display()))
}

/// One row per slot: position, trip time and the cross-year stats of `metric`.
pub fn write_stats_csv(chart: &DerivedChart, metric: Metric, path: &Path) -> Result<(), String> {
    let stats = aggregate(&chart.series, metric).map_err(|err| err.to_string())?;
    let slots = chart.series.first().map(|s| s.hours.as_slice()).unwrap_or_default();
    ensure_parent(path)?;
    let file = File::create(path)
        .map_err(|err| format!("Failed to create CSV {}: {err}", path.display()))?;
    let mut writer = csv::Writer::from_writer(BufWriter::new(file));
    writer
        .write_record(STATS_CSV_HEADER.trim_end().split(','))
        .map_err(|err| format!("Failed to write CSV header to {}: {err}", path.display()))?;
    for (index, (slot, stat)) in slots.iter().zip(&stats).enumerate() {
        writer
            .write_record([
                index.to_string(),
                slot.time.format(SLOT_LABEL_FORMAT).to_string(),
                format!("{:.2}", stat.min),
                format!("{:.2}", stat.avg),
                format!("{:.2}", stat.max),
            ])
            .map_err(|err| format!("Failed to write CSV row to {}: {err}", path.display()))?;
    }
    writer
        .flush()
        .map_err(|err| format!("Failed to flush CSV {}: {err}", path.display()))?;
    tracing::debug!(rows = stats.len(), metric = ?metric, "Wrote stats CSV {}", path.display());
    Ok(())
}
