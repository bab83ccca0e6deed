//! Utilities for setting up and running engines.
//!
//! Every engine lives in its own directory under the engines directory, with a `manifest.json` describing where
//! its source comes from and a `Dockerfile` building it. Engines differ only in this configuration, so there is a
//! single [`Engine`] type driven by its [`EngineManifest`] and the [`EngineFacts`] scraped from its Dockerfile.
//!
//! Setting up an engine resolves its commit, makes sure its source is in the [`SourceCache`], and builds its image.
//!
//! # Examples
//!
//! ```no_run
//! use bollard::Docker;
//! use mjsuite::{config::Config, engines::Engine, runtime::DockerRuntime, source::GitHub, Services};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = Config::new(".");
//! let runtime = DockerRuntime::new(Docker::connect_with_local_defaults()?);
//! let host = GitHub::new(None)?;
//! let services = Services::new(&config, &runtime, &host);
//!
//! let mut engine = Engine::load(&config, "quickjs")?;
//! engine.setup(services).await?;
//! #     Ok(())
//! # }
//! ```

use std::{
    fmt::{self, Display, Formatter},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    executor::{ContainerExecutor, StagedWorkload},
    perf::{EventCounters, Measurement, PerfStat, ResourceUsage, RUN_TIME},
    source::{CommitRef, RepositoryResolver, SourceCache},
    workloads::{Workload, TEMPLATE_FILE},
    Error, Result, Services,
};

mod build;
mod metadata;

pub use build::{is_step_boundary, BuildPlan, ImageBuilder};
pub use metadata::{EngineFacts, EngineManifest, DOCKERFILE, MANIFEST_FILE, SOURCE_BUILD_ARG};

/// Unique identifier for an engine, the name of its directory.
///
/// # Examples
///
/// ```
/// use mjsuite::engines::Identifier;
///
/// let identifier = Identifier::from("quickjs");
///
/// assert_eq!(identifier.to_string(), "quickjs");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identifier(String);

impl Identifier {
    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Identifier {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Identifier {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Where an engine is in its setup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// Nothing done yet.
    Unresolved,
    /// Looking up the commit to build.
    Resolving,
    /// The source for the commit is in the cache.
    SourceCached,
    /// The source for the commit has to be fetched.
    SourceMissing,
    /// The image is being built.
    Building,
    /// The image is built.
    Ready,
    /// A setup step failed.
    Failed,
}

/// An engine as shown in listings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    /// Identifier of the engine.
    pub identifier: Identifier,
    /// Version from its manifest.
    pub version: String,
    /// Whether its image exists.
    pub ready: bool,
}

/// Total representation of an engine.
#[derive(Clone, Debug)]
pub struct Engine {
    identifier: Identifier,
    manifest: EngineManifest,
    facts: EngineFacts,
    directory: PathBuf,
    image_tag: String,
    commit: Option<CommitRef>,
    state: EngineState,
}

/// Deterministic image tag for an engine version.
///
/// # Examples
///
/// ```
/// use mjsuite::engines::image_tag;
///
/// assert_eq!(image_tag("mjsuite", "quickjs", "2024-01-13"), "mjsuite/quickjs:2024-01-13");
/// ```
pub fn image_tag(namespace: &str, id: &str, version: &str) -> String {
    format!("{namespace}/{id}:{version}")
}

impl Engine {
    /// Loads engine `id` from the engines directory of `config`.
    ///
    /// # Errors
    ///
    /// [`Error::Manifest`] if the manifest or the Dockerfile is missing or invalid.
    pub fn load(config: &Config, id: &str) -> Result<Self> {
        let directory = config.engines_dir().join(id);
        let manifest = EngineManifest::load(id, &directory.join(MANIFEST_FILE))?;
        let facts = EngineFacts::load(id, &directory.join(DOCKERFILE))?;
        log::trace!("[{id}] manifest: {manifest:#?}, facts: {facts:#?}");

        Ok(Self {
            identifier: Identifier::from(id),
            image_tag: image_tag(config.image_namespace(), id, &manifest.version),
            manifest,
            facts,
            directory,
            commit: None,
            state: EngineState::Unresolved,
        })
    }

    /// Unique identifier for this engine.
    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    /// Manifest of this engine.
    pub fn manifest(&self) -> &EngineManifest {
        &self.manifest
    }

    /// Facts scraped from the Dockerfile.
    pub fn facts(&self) -> &EngineFacts {
        &self.facts
    }

    /// Tag of the image for this engine version.
    pub fn image_tag(&self) -> &str {
        &self.image_tag
    }

    /// Resolved commit, once setup got that far.
    pub fn commit(&self) -> Option<&CommitRef> {
        self.commit.as_ref()
    }

    /// Current setup state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Directory of this engine.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Location of the optional workload template.
    pub fn template_path(&self) -> PathBuf {
        self.directory.join(TEMPLATE_FILE)
    }

    /// Whether the image of this engine exists.
    ///
    /// # Errors
    ///
    /// If the container runtime cannot be queried.
    pub async fn is_ready(&self, services: Services<'_>) -> Result<bool> {
        services.runtime.image_exists(&self.image_tag).await
    }

    /// Resolves, fetches and builds this engine.
    ///
    /// Callers check [`Engine::is_ready`] if they want to skip work, calling this again redoes the build.
    ///
    /// # Errors
    ///
    /// [`Error::Resolution`], [`Error::Fetch`] or [`Error::Build`] from the failing step. The engine is then
    /// [`EngineState::Failed`].
    pub async fn setup(&mut self, services: Services<'_>) -> Result<()> {
        log::info!(
            "[{}] setting up {} {}...",
            self.identifier,
            self.manifest.name,
            self.manifest.version
        );
        match self.setup_inner(services).await {
            Ok(()) => {
                self.state = EngineState::Ready;
                log::info!("[{}] engine is set up", self.identifier);
                Ok(())
            }
            Err(err) => {
                self.state = EngineState::Failed;
                Err(err)
            }
        }
    }

    async fn setup_inner(&mut self, services: Services<'_>) -> Result<()> {
        let engines_dir = services.config.engines_dir();
        let engine_dir = build::relative_to(&engines_dir, &self.directory)
            .ok_or_else(|| Error::engine(self.identifier.as_str(), "not under the engines directory"))?;

        let source_dir = if self.facts.builds_from_source {
            let cache = SourceCache::new(services.config.cache_dir());
            let resolver = RepositoryResolver::new(services.config, services.host, services.runtime);

            let commit = match &self.commit {
                Some(commit) => commit.clone(),
                None => {
                    self.state = EngineState::Resolving;
                    let commit = resolver.resolve(&self.manifest).await?;
                    self.commit = Some(commit.clone());
                    commit
                }
            };

            let entry = if cache.contains(&commit) {
                self.state = EngineState::SourceCached;
                log::info!("[{}] found source code in cache", self.identifier);
                cache.entry_path(&commit)
            } else {
                self.state = EngineState::SourceMissing;
                resolver.materialize(&self.manifest, &commit, &cache).await?
            };
            Some(build::relative_to(&engines_dir, &entry).ok_or_else(|| {
                Error::Fetch(format!(
                    "cache entry {} is not under the engines directory",
                    entry.display()
                ))
            })?)
        } else {
            log::debug!("[{}] image wraps a prebuilt binary, skipping source", self.identifier);
            None
        };

        self.state = EngineState::Building;
        ImageBuilder::new(services.runtime)
            .build(&BuildPlan {
                tag: self.image_tag.clone(),
                context_root: engines_dir,
                engine_dir,
                source_dir,
            })
            .await
    }

    /// Sets up this engine unless its image already exists.
    ///
    /// # Errors
    ///
    /// See [`Engine::setup`].
    pub async fn ensure_ready(&mut self, services: Services<'_>) -> Result<()> {
        if self.is_ready(services).await? {
            self.state = EngineState::Ready;
            Ok(())
        } else {
            self.setup(services).await
        }
    }

    /// Runs this engine, on `workload` if given, and returns the measured run time of the workload.
    ///
    /// Without a workload the image runs with its own entrypoint and its output is logged. The engine is set up
    /// first if its image is missing.
    ///
    /// # Errors
    ///
    /// [`Error::Execution`] if the container exits unsuccessfully or its timing output is missing.
    pub async fn run(
        &mut self,
        workload: Option<&Workload>,
        services: Services<'_>,
    ) -> Result<Option<Duration>> {
        self.ensure_ready(services).await?;
        let executor = ContainerExecutor::new(services.config, services.runtime);

        let Some(workload) = workload else {
            log::info!("[{}] running engine...", self.identifier);
            executor.execute_bare(&self.image_tag).await?;
            return Ok(None);
        };

        log::info!("[{}] running workload {}...", self.identifier, workload.identifier);
        let staged = self.stage(workload, services.config)?;
        let stat = self.measure(&EventCounters, &staged, executor).await?;
        let run_time = stat
            .finite(RUN_TIME)
            .map(|nanos| {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                Duration::from_nanos(nanos.round() as u64)
            })
            .ok_or_else(|| Error::Execution("failed to measure task duration".to_string()))?;
        log::info!(
            "[{}] workload {} finished in {:.2} ms",
            self.identifier,
            workload.identifier,
            run_time.as_secs_f64() * 1000.0
        );
        Ok(Some(run_time))
    }

    /// Runs `workload` under every measurement tool and merges the metrics.
    ///
    /// The compiled workload is staged once for all runs and removed afterwards, whether they succeed or not.
    ///
    /// # Errors
    ///
    /// [`Error::Execution`] on a non-zero exit or missing timing output, [`Error::Parse`] if a mandatory metric is
    /// missing.
    pub async fn benchmark(
        &mut self,
        workload: &Workload,
        services: Services<'_>,
    ) -> Result<PerfStat> {
        self.ensure_ready(services).await?;
        let executor = ContainerExecutor::new(services.config, services.runtime);

        log::info!("[{}] benchmarking workload {}...", self.identifier, workload.identifier);
        let staged = self.stage(workload, services.config)?;

        let mut stat = PerfStat::new();
        let measurements: [&dyn Measurement; 2] = [&EventCounters, &ResourceUsage];
        for measurement in measurements {
            stat.extend(self.measure(measurement, &staged, executor).await?.drain(..));
        }

        if let Some(run_time) = stat.finite(RUN_TIME) {
            log::info!(
                "[{}] workload {} finished in {:.2} ms",
                self.identifier,
                workload.identifier,
                run_time / 1_000_000.0
            );
        }
        Ok(stat)
    }

    fn stage(&self, workload: &Workload, config: &Config) -> Result<StagedWorkload> {
        StagedWorkload::create(
            &config.staging_dir(),
            workload.identifier.as_str(),
            self.identifier.as_str(),
            &workload.compile(Some(self))?,
        )
    }

    async fn measure(
        &self,
        measurement: &dyn Measurement,
        staged: &StagedWorkload,
        executor: ContainerExecutor<'_>,
    ) -> Result<PerfStat> {
        log::debug!(
            "[{}] measuring with {}...",
            self.image_tag,
            measurement.name()
        );
        let output = executor
            .execute(
                &self.image_tag,
                Some(measurement.entrypoint(&self.facts.entrypoint)),
                staged.path(),
            )
            .await?
            .into_success()?;
        measurement.parse(&output)
    }
}

/// Identifiers of every engine under `engines_dir` (directories with a manifest), sorted.
///
/// # Errors
///
/// If the directory cannot be searched.
pub fn find_all_ids(engines_dir: &Path) -> anyhow::Result<Vec<Identifier>> {
    let mut ids: Vec<Identifier> = glob::glob(
        engines_dir
            .join("*")
            .join(MANIFEST_FILE)
            .to_str()
            .context("could not convert engine manifest pattern to string")?,
    )
    .context("searching for all engine manifests")?
    .filter_map(|r| {
        let path = r
            .map_err(|err| {
                log::warn!("could not get globbed path: {err}, skipping...");
            })
            .ok()?;
        let id = path.parent()?.file_name()?.to_str()?;
        Some(Identifier::from(id))
    })
    .collect();
    ids.sort();
    log::debug!("found {} engines", ids.len());
    Ok(ids)
}

/// Every engine with its version and readiness.
///
/// # Errors
///
/// If an engine cannot be loaded or the container runtime cannot be queried.
pub async fn list_all(services: Services<'_>) -> anyhow::Result<Vec<EngineStatus>> {
    let mut statuses = Vec::new();
    for identifier in find_all_ids(&services.config.engines_dir())? {
        let engine = Engine::load(services.config, identifier.as_str())?;
        statuses.push(EngineStatus {
            ready: engine.is_ready(services).await?,
            version: engine.manifest.version,
            identifier,
        });
    }
    Ok(statuses)
}
