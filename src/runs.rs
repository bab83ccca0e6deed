//! Orchestration for running workloads on engines.
//!
//! A [`Benchmark`] runs every selected workload on every selected engine, strictly one pair at a time since the
//! counters and memory high-water marks of a run would be skewed by anything running alongside it. The result is a
//! [`Stats`] matrix keyed by camel-cased workload and engine identifiers, in selection order.
//!
//! # Examples
//!
//! ```no_run
//! use bollard::Docker;
//! use mjsuite::{config::Config, runs::Benchmark, runtime::DockerRuntime, source::GitHub, Services};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = Config::new(".");
//! let runtime = DockerRuntime::new(Docker::connect_with_local_defaults()?);
//! let host = GitHub::new(None)?;
//!
//! let mut benchmark = Benchmark::load(&config, None, Some(&["!v8".to_string()]))?;
//! let stats = benchmark.run(Services::new(&config, &runtime, &host)).await?;
//! #     Ok(())
//! # }
//! ```

use indexmap::{IndexMap, IndexSet};
use sysinfo::{CpuExt, System, SystemExt};

use crate::{
    config::Config,
    engines::{self, Engine},
    naming::to_camel_case,
    perf::PerfStat,
    workloads::{self, Workload},
    Result, Services,
};

/// Metrics of a benchmark run, keyed by workload and then by engine.
pub type Stats = IndexMap<String, IndexMap<String, PerfStat>>;

/// Applies an include/exclude filter to `all`.
///
/// Without a filter everything is selected. Plain entries are included as given. If any entry is prefixed with
/// `!`, every id of `all` that is not excluded is added after the included ones, duplicates dropped.
///
/// # Examples
///
/// ```
/// use mjsuite::runs::select;
///
/// let all = ["a", "b", "c"].map(String::from);
///
/// assert_eq!(select(Some(&["!b".to_string()]), &all), ["a", "c"]);
/// assert_eq!(select(Some(&["a".to_string()]), &all), ["a"]);
/// assert_eq!(select(None, &all), all);
/// ```
pub fn select(requested: Option<&[String]>, all: &[String]) -> Vec<String> {
    let Some(requested) = requested else {
        return all.to_vec();
    };

    let (excluded, included): (Vec<&String>, Vec<&String>) =
        requested.iter().partition(|id| id.starts_with('!'));
    let excluded: Vec<&str> = excluded.iter().map(|id| &id[1..]).collect();

    if excluded.is_empty() {
        return included.into_iter().cloned().collect();
    }

    included
        .into_iter()
        .chain(all.iter().filter(|id| !excluded.contains(&id.as_str())))
        .cloned()
        .collect::<IndexSet<String>>()
        .into_iter()
        .collect()
}

/// Fails if two identifiers would land on the same [`Stats`] key.
fn ensure_distinct_keys<'a>(kind: &str, ids: impl Iterator<Item = &'a str>) -> anyhow::Result<()> {
    let mut keys: IndexMap<String, &str> = IndexMap::new();
    for id in ids {
        let key = to_camel_case(id);
        if let Some(other) = keys.get(&key) {
            anyhow::bail!("{kind} '{other}' and '{id}' both map to result key '{key}', rename one of them");
        }
        keys.insert(key, id);
    }
    Ok(())
}

/// A loaded matrix of workloads and engines.
#[derive(Debug)]
pub struct Benchmark {
    workloads: Vec<Workload>,
    engines: Vec<Engine>,
}

impl Benchmark {
    /// Creates a benchmark over already loaded workloads and engines.
    pub fn new(workloads: Vec<Workload>, engines: Vec<Engine>) -> Self {
        Self { workloads, engines }
    }

    /// Discovers workloads and engines under `config` and loads the ones selected by the filters, see [`select`].
    ///
    /// # Errors
    ///
    /// If discovery fails or a selected workload or engine cannot be loaded.
    pub fn load(
        config: &Config,
        workload_filter: Option<&[String]>,
        engine_filter: Option<&[String]>,
    ) -> anyhow::Result<Self> {
        let all_workloads: Vec<String> = workloads::find_all_ids(&config.workloads_dir())?
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        let all_engines: Vec<String> = engines::find_all_ids(&config.engines_dir())?
            .into_iter()
            .map(|id| id.to_string())
            .collect();

        let workloads = select(workload_filter, &all_workloads)
            .iter()
            .map(|id| Workload::load(&config.workloads_dir(), id))
            .collect::<Result<Vec<_>>>()?;
        let engines = select(engine_filter, &all_engines)
            .iter()
            .map(|id| Engine::load(config, id))
            .collect::<Result<Vec<_>>>()?;

        ensure_distinct_keys(
            "workloads",
            workloads.iter().map(|workload| workload.identifier.as_str()),
        )?;
        ensure_distinct_keys("engines", engines.iter().map(|engine| engine.identifier().as_str()))?;

        Ok(Self::new(workloads, engines))
    }

    /// Workloads in run order.
    pub fn workloads(&self) -> &[Workload] {
        &self.workloads
    }

    /// Engines in run order.
    pub fn engines(&self) -> &[Engine] {
        &self.engines
    }

    /// Runs every workload on every engine, setting up engines whose image is missing.
    ///
    /// # Errors
    ///
    /// The first failure of any pair aborts the whole run, no partial results are returned.
    pub async fn run(&mut self, services: Services<'_>) -> Result<Stats> {
        log_host_summary();
        log::info!(
            "running {} workloads on {} engines...",
            self.workloads.len(),
            self.engines.len()
        );
        let separate = self.workloads.len() > 1 || self.engines.len() > 1;

        // Sequential on purpose, pairs must not share the machine.
        let mut stats = Stats::new();
        for workload in &self.workloads {
            let workload_key = to_camel_case(workload.identifier.as_str());
            for engine in &mut self.engines {
                if separate {
                    log::debug!("{}", "-".repeat(40));
                }
                let stat = engine.benchmark(workload, services).await?;
                log::trace!("[{}:{}] stats: {stat:#?}", workload.identifier, engine.identifier());
                stats
                    .entry(workload_key.clone())
                    .or_default()
                    .insert(to_camel_case(engine.identifier().as_str()), stat);
            }
        }

        Ok(stats)
    }
}

fn log_host_summary() {
    let mut system = System::new_all();
    system.refresh_all();
    log::info!(
        "running on {} {} (kernel {}) with {} cpus ({}) and {} MB of memory",
        system.name().unwrap_or_else(|| "unknown".to_string()),
        system.os_version().unwrap_or_else(|| "unknown".to_string()),
        system.kernel_version().unwrap_or_else(|| "unknown".to_string()),
        system.cpus().len(),
        system
            .cpus()
            .first()
            .map_or("unknown", |cpu| cpu.brand()),
        system.total_memory() / 1_000_000,
    );
}
