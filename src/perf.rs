//! Turning the raw output of measurement tools into normalized metrics.
//!
//! Each [`Measurement`] knows how to wrap an engine binary in its tool (the entrypoint override) and how to parse
//! what the tool printed. [`EventCounters`] drives `perf stat` in CSV mode, [`ResourceUsage`] drives GNU
//! `time -v`. Both produce a [`PerfStat`], and the stats of one workload/engine pair are merged together.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::OnceLock,
};

use indexmap::IndexMap;
use regex::Regex;
use serde::{
    de::{MapAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};

use crate::{naming::to_camel_case, Error, Result};

/// Hardware and software events counted for every run, in the order `perf` reports them.
pub const PERF_EVENTS: [&str; 8] = [
    "task-clock",
    "context-switches",
    "cpu-migrations",
    "page-faults",
    "cycles",
    "instructions",
    "branches",
    "branch-misses",
];

/// Key of the run time, in nanoseconds.
pub const RUN_TIME: &str = "runTime";

/// Key of the memory high-water mark, in bytes.
pub const MAX_MEMORY: &str = "maxMemory";

/// Metrics of one workload run on one engine, keyed by camel-style metric name.
///
/// Values that could not be parsed are kept as `NaN` and written as `null` in result files. Consumers must treat
/// non-finite values as unavailable, not as zero.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PerfStat(IndexMap<String, f64>);

impl PerfStat {
    /// Creates an empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Finite value of `metric`, if present.
    pub fn finite(&self, metric: &str) -> Option<f64> {
        self.0.get(metric).copied().filter(|value| value.is_finite())
    }
}

impl Deref for PerfStat {
    type Target = IndexMap<String, f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PerfStat {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FromIterator<(String, f64)> for PerfStat {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for PerfStat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (metric, value) in &self.0 {
            map.serialize_entry(metric, &Some(*value).filter(|value| value.is_finite()))?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PerfStat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PerfStatVisitor;

        impl<'de> Visitor<'de> for PerfStatVisitor {
            type Value = PerfStat;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a map of metric names to numbers or null")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut stat = IndexMap::with_capacity(access.size_hint().unwrap_or_default());
                while let Some((metric, value)) = access.next_entry::<String, Option<f64>>()? {
                    stat.insert(metric, value.unwrap_or(f64::NAN));
                }
                Ok(PerfStat(stat))
            }
        }

        deserializer.deserialize_map(PerfStatVisitor)
    }
}

/// A measurement tool wrapped around the engine binary.
pub trait Measurement: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Entrypoint that runs `binary` under the tool. The workload path is appended as the command.
    fn entrypoint(&self, binary: &str) -> Vec<String>;

    /// Extracts metrics from the combined output of a run.
    ///
    /// # Errors
    ///
    /// If a mandatory metric cannot be found.
    fn parse(&self, output: &str) -> Result<PerfStat>;
}

/// Hardware/software event counters from `perf stat -x,`.
#[derive(Clone, Copy, Debug, Default)]
pub struct EventCounters;

impl Measurement for EventCounters {
    fn name(&self) -> &'static str {
        "perf"
    }

    fn entrypoint(&self, binary: &str) -> Vec<String> {
        vec![
            "perf".to_string(),
            "stat".to_string(),
            "-x".to_string(),
            ",".to_string(),
            "-e".to_string(),
            PERF_EVENTS.join(","),
            binary.to_string(),
        ]
    }

    fn parse(&self, output: &str) -> Result<PerfStat> {
        parse_event_counters(output)
    }
}

/// Resource usage from GNU `time -v`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResourceUsage;

impl Measurement for ResourceUsage {
    fn name(&self) -> &'static str {
        "time"
    }

    fn entrypoint(&self, binary: &str) -> Vec<String> {
        vec![
            "/usr/bin/time".to_string(),
            "-v".to_string(),
            binary.to_string(),
        ]
    }

    fn parse(&self, output: &str) -> Result<PerfStat> {
        parse_resource_usage(output)
    }
}

/// Splits raw output into records, a line starting with whitespace continues the previous record.
fn split_records(output: &str) -> Vec<&str> {
    let mut records = Vec::new();
    let mut start = 0;
    for (index, _) in output.match_indices('\n') {
        if output[index + 1..]
            .chars()
            .next()
            .is_some_and(|c| !c.is_whitespace())
        {
            records.push(&output[start..index]);
            start = index + 1;
        }
    }
    records.push(&output[start..]);
    records
}

fn parse_counter_value(cell: &str) -> f64 {
    let cell = cell.trim();
    let cell = cell.strip_prefix(&['<', '~'][..]).unwrap_or(cell);
    cell.parse().unwrap_or(f64::NAN)
}

/// Parses `perf stat -x,` output.
///
/// Only the last [`PERF_EVENTS`]`.len()` records are read, anything the workload printed before is ignored. Each
/// record is `value,unit,event[:modifiers],time_running_ns,...`. The value is stored under the camel-cased event
/// name (`NaN` if it is not a number), and [`RUN_TIME`] comes from the running time column of the first record.
///
/// # Errors
///
/// [`Error::Execution`] if the running time of the first record cannot be found.
///
/// # Examples
///
/// ```
/// use mjsuite::perf::parse_event_counters;
///
/// let stat = parse_event_counters("12.5,msec,task-clock:u,12500000,100.00,,\n").unwrap();
///
/// assert_eq!(stat["taskClock"], 12.5);
/// assert_eq!(stat["runTime"], 12500000.0);
/// ```
pub fn parse_event_counters(output: &str) -> Result<PerfStat> {
    let records = split_records(output);
    let records = &records[records.len().saturating_sub(PERF_EVENTS.len())..];

    let run_time = records
        .first()
        .and_then(|record| record.split(',').nth(3))
        .and_then(|cell| cell.trim().parse::<u64>().ok())
        .ok_or_else(|| Error::Execution("failed to measure task duration".to_string()))?;

    let mut stat = PerfStat::new();
    for record in records {
        let cells: Vec<&str> = record.split(',').collect();
        let Some(event) = cells.get(2) else {
            log::debug!("skipping malformed perf record: {record:?}");
            continue;
        };
        let event = event.split(':').next().unwrap_or_default().trim();
        stat.insert(to_camel_case(event), parse_counter_value(cells[0]));
    }
    #[allow(clippy::cast_precision_loss)]
    stat.insert(RUN_TIME.to_string(), run_time as f64);

    Ok(stat)
}

/// Parses GNU `time -v` output into [`MAX_MEMORY`] (bytes).
///
/// # Errors
///
/// [`Error::Parse`] if the maximum resident set size is missing.
pub fn parse_resource_usage(output: &str) -> Result<PerfStat> {
    static MAX_RSS: OnceLock<Regex> = OnceLock::new();
    let pattern = MAX_RSS.get_or_init(|| {
        Regex::new(r"Maximum resident set size \(kbytes\):\s*(\d+)")
            .expect("resident set size pattern is valid")
    });

    let kilobytes = output
        .lines()
        .find_map(|line| pattern.captures(line))
        .and_then(|caps| caps[1].parse::<u64>().ok())
        .ok_or_else(|| Error::Parse("maximum resident set size not found".to_string()))?;

    #[allow(clippy::cast_precision_loss)]
    let bytes = (kilobytes * 1000) as f64;
    Ok(PerfStat::from_iter([(MAX_MEMORY.to_string(), bytes)]))
}
