//! Running engine images against a workload file.
//!
//! A compiled workload is written to a [`StagedWorkload`] under the staging directory, bind-mounted read-only at
//! [`WORKLOAD_MOUNT`] inside the engine container, and removed again when the staged file is dropped, whatever
//! happened in between.

use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    config::Config,
    runtime::{BindMount, ContainerRuntime, RunSpec},
    Error, Result,
};

/// Fixed in-container path of the workload file.
pub const WORKLOAD_MOUNT: &str = "/mjsuite/workload.js";

/// A compiled workload written to disk for the duration of one or more container runs.
#[derive(Debug)]
pub struct StagedWorkload {
    path: PathBuf,
}

impl StagedWorkload {
    /// Writes `source` to a fresh file named after the workload and engine under `staging_dir`.
    ///
    /// # Errors
    ///
    /// If the staging directory or the file cannot be written.
    pub fn create(staging_dir: &Path, workload: &str, engine: &str, source: &str) -> Result<Self> {
        fs::create_dir_all(staging_dir)?;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let path = staging_dir.join(format!("{workload}__{engine}__{millis}.tmp.js"));
        fs::write(&path, source)?;
        log::trace!("staged workload at {}", path.display());
        Ok(Self { path })
    }

    /// Location of the staged file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedWorkload {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            log::warn!(
                "could not remove staged workload {}: {err}",
                self.path.display()
            );
        }
    }
}

/// Exit status and combined output of one container run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionOutput {
    /// Exit code of the container's main process.
    pub exit_code: i64,
    /// Combined stdout and stderr, in arrival order.
    pub output: String,
}

impl ExecutionOutput {
    /// Returns the captured output if the run exited cleanly.
    ///
    /// # Errors
    ///
    /// [`Error::Execution`] with the exit code embedded otherwise.
    pub fn into_success(self) -> Result<String> {
        if self.exit_code == 0 {
            Ok(self.output)
        } else {
            Err(Error::Execution(format!(
                "engine exited with code {}",
                self.exit_code
            )))
        }
    }
}

/// Runs built images with a workload mounted and captures what they print.
#[derive(Clone, Copy)]
pub struct ContainerExecutor<'a> {
    config: &'a Config,
    runtime: &'a dyn ContainerRuntime,
}

impl<'a> ContainerExecutor<'a> {
    /// Creates an executor on top of `runtime`.
    pub fn new(config: &'a Config, runtime: &'a dyn ContainerRuntime) -> Self {
        Self { config, runtime }
    }

    /// Runs `image` on the workload file at `workload`, optionally replacing the image entrypoint.
    ///
    /// Output is captured in full and forwarded to the log at `debug` as it arrives. The container runs without
    /// the default seccomp profile since some engines need syscalls it blocks.
    ///
    /// # Errors
    ///
    /// If the runtime fails to run the container. A non-zero exit is not an error here, see
    /// [`ExecutionOutput::into_success`].
    pub async fn execute(
        &self,
        image: &str,
        entrypoint: Option<Vec<String>>,
        workload: &Path,
    ) -> Result<ExecutionOutput> {
        let spec = RunSpec {
            image: image.to_string(),
            entrypoint,
            cmd: vec![WORKLOAD_MOUNT.to_string()],
            mounts: vec![BindMount {
                source: self.config.host_path(workload),
                target: WORKLOAD_MOUNT.to_string(),
                read_only: true,
            }],
            unconfined: true,
        };
        log::trace!("running {spec:#?}");

        let mut output = String::new();
        let exit_code = self
            .runtime
            .run(&spec, &mut |chunk: &str| {
                log::debug!("{}", chunk.trim_end_matches('\n'));
                output.push_str(chunk);
            })
            .await?;

        Ok(ExecutionOutput { exit_code, output })
    }

    /// Runs `image` with its own entrypoint and no workload, forwarding output at `info`.
    ///
    /// # Errors
    ///
    /// [`Error::Execution`] if the container exits with a non-zero code.
    pub async fn execute_bare(&self, image: &str) -> Result<()> {
        let spec = RunSpec {
            image: image.to_string(),
            unconfined: true,
            ..Default::default()
        };
        let exit_code = self
            .runtime
            .run(&spec, &mut |chunk: &str| {
                log::info!("{}", chunk.trim_end_matches('\n'));
            })
            .await?;

        ExecutionOutput {
            exit_code,
            output: String::new(),
        }
        .into_success()
        .map(drop)
    }
}
