//! Containerized benchmarking of JavaScript engines.
//!
//! mjsuite builds JavaScript engines from source inside containers and measures them on a suite of workload scripts,
//! collecting hardware counters with `perf stat` and peak memory with `time -v` for every (workload, engine) pair.
//!
//! # Suite
//! A suite is a root directory with two subdirectories:
//! - `engines/{id}/` holds a `manifest.json` (name, repository, version, optionally a pinned `sha`, `clone` or a
//!   direct `source` URL), a `Dockerfile` with a single `ENTRYPOINT` naming the engine binary, and optionally a
//!   `template.js` wrapping workloads for engines that need a harness. A Dockerfile declaring `ARG srcPath` is built
//!   from the engine's source, which is fetched once per commit into `engines/cache/`.
//! - `workloads/{id}.js` holds the benchmark scripts.
//!
//! # Usage
//!
//! ## As an executable
//! ```console
//! $ mjsuite --help
//! Benchmark suite for JavaScript engines
//!
//! Usage: mjsuite [OPTIONS] <COMMAND>
//!
//! Commands:
//!   benchmark  Run workloads on engines and record the results
//!   setup      Fetch and build an engine
//!   run        Run an engine, optionally on a single workload
//!   engines    List engines
//!   workloads  List workloads
//!   show       Print a saved result file as tables
//!   help       Print this message or the help of the given subcommand(s)
//!
//! Options:
//!       --root <ROOT>  Root directory of the suite [env: MJSUITE_ROOT=] [default: .]
//!   -v, --verbose      Log at debug level
//!   -h, --help         Print help
//!   -V, --version      Print version
//! ```
//!
//! `LOG_LEVEL` sets the default log level. When the tool itself runs in a container, `MOUNT_SRC` must hold the host
//! path of the suite root so that bind mounts resolve on the host.
//!
//! ## As a library
//! ```no_run
//! use bollard::Docker;
//! use mjsuite::{config::Config, results, runs::Benchmark, runtime::DockerRuntime, source::GitHub, Services};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = Config::new(".");
//! let runtime = DockerRuntime::new(Docker::connect_with_local_defaults()?);
//! let host = GitHub::new(None)?;
//!
//! let stats = Benchmark::load(&config, None, None)?
//!     .run(Services::new(&config, &runtime, &host))
//!     .await?;
//! println!("{}", results::render(&stats));
//! #     Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]

pub mod config;
pub mod engines;
pub mod error;
pub mod executor;
pub mod naming;
pub mod perf;
pub mod results;
pub mod runs;
pub mod runtime;
mod services;
pub mod source;
pub mod workloads;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use services::Services;
