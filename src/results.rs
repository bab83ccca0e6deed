//! Persisting benchmark results and rendering them as tables.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use tabled::{builder::Builder, Style};

use crate::{
    config::Config,
    naming::timestamp,
    perf::{MAX_MEMORY, RUN_TIME},
    runs::Stats,
    Result,
};

/// A metric as presented to readers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MetricView {
    /// Heading of the table.
    pub title: &'static str,
    /// Key of the metric in a [`crate::perf::PerfStat`].
    pub key: &'static str,
    /// Factor applied to raw values before display.
    pub scale: f64,
}

/// Metrics rendered by [`render`], in order.
pub const METRICS: [MetricView; 6] = [
    MetricView {
        title: "Run time (ms)",
        key: RUN_TIME,
        scale: 1e-6,
    },
    MetricView {
        title: "Memory (MB)",
        key: MAX_MEMORY,
        scale: 1e-6,
    },
    MetricView {
        title: "Instructions",
        key: "instructions",
        scale: 1.0,
    },
    MetricView {
        title: "Branches",
        key: "branches",
        scale: 1.0,
    },
    MetricView {
        title: "Branch misses",
        key: "branchMisses",
        scale: 1.0,
    },
    MetricView {
        title: "Page faults",
        key: "pageFaults",
        scale: 1.0,
    },
];

/// Default location of a result file for a run started at `start_time`.
pub fn default_path(config: &Config, start_time: DateTime<Utc>) -> PathBuf {
    config
        .results_dir()
        .join(format!("{}.json", timestamp(start_time)))
}

/// Writes `stats` as pretty-printed JSON to `path`, creating parent directories.
///
/// # Errors
///
/// If the file cannot be written.
pub fn write(path: &Path, stats: &Stats) -> Result<()> {
    log::debug!("writing results to {}...", path.display());
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(stats)?)?;
    log::info!("wrote out results to {}", path.display());
    Ok(())
}

/// Reads a result file written by [`write`].
///
/// # Errors
///
/// If the file cannot be read or is not a result file.
pub fn read(path: &Path) -> Result<Stats> {
    log::debug!("reading and parsing results from {}...", path.display());
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

/// One markdown table of `metric`, a row per workload and a column per engine.
///
/// Missing and non-finite values are left blank.
pub fn render_metric(stats: &Stats, metric: &MetricView) -> String {
    let engines: IndexSet<&String> = stats.values().flat_map(|row| row.keys()).collect();

    let mut builder = Builder::default();
    for (workload, row) in stats {
        let mut record = vec![workload.clone()];
        record.extend(engines.iter().map(|engine| {
            row.get(*engine)
                .and_then(|stat| stat.finite(metric.key))
                .map(|value| format_value(value * metric.scale, metric.scale))
                .unwrap_or_default()
        }));
        builder.add_record(record);
    }

    let mut columns = vec![String::new()];
    columns.extend(engines.into_iter().cloned());
    builder.set_columns(columns);

    let mut table = builder.build();
    table.with(Style::markdown());
    table.to_string()
}

/// Every table of [`METRICS`], each under its title.
pub fn render(stats: &Stats) -> String {
    METRICS
        .iter()
        .map(|metric| format!("{}\n\n{}\n", metric.title, render_metric(stats, metric)))
        .collect::<Vec<_>>()
        .join("\n")
}

#[allow(clippy::float_cmp)]
fn format_value(value: f64, scale: f64) -> String {
    if scale == 1.0 {
        format!("{value:.0}")
    } else {
        format!("{value:.2}")
    }
}
