//! Narrow capability interface over the container runtime.
//!
//! Everything the engine lifecycle needs from Docker goes through [`ContainerRuntime`]: checking for an image,
//! building one from a tarball context, pulling, running a container to completion and pruning dangling images.
//! [`DockerRuntime`] implements it on top of [`bollard`]; tests use an in-memory fake.

use std::{collections::HashMap, path::PathBuf};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::Result;

mod docker;

pub use docker::DockerRuntime;

/// Request to build an image from an in-memory tarball context.
#[derive(Clone, Debug, Default)]
pub struct BuildRequest {
    /// Tag to apply to the built image.
    pub tag: String,
    /// Path of the Dockerfile relative to the context root.
    pub dockerfile: String,
    /// Build arguments.
    pub build_args: HashMap<String, String>,
    /// Uncompressed tarball of the build context.
    pub context: Vec<u8>,
}

/// One progress message emitted while building an image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildProgress {
    /// A line of build output.
    Stream(String),
    /// Anything else the daemon reported (status updates, aux data).
    Status(String),
    /// The build failed with the given message.
    Error(String),
}

/// A bind mount from the host into a container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindMount {
    /// Host path, as seen by the daemon.
    pub source: PathBuf,
    /// Path inside the container.
    pub target: String,
    /// Whether the mount is read-only.
    pub read_only: bool,
}

/// Everything needed to run a container to completion.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSpec {
    /// Image to run.
    pub image: String,
    /// Entrypoint override, `None` keeps the image entrypoint.
    pub entrypoint: Option<Vec<String>>,
    /// Arguments passed after the entrypoint.
    pub cmd: Vec<String>,
    /// Bind mounts.
    pub mounts: Vec<BindMount>,
    /// Disable the default seccomp profile.
    pub unconfined: bool,
}

/// Receives container output as it is produced.
pub type OutputSink<'a> = dyn FnMut(&str) + Send + 'a;

/// Capabilities the engine lifecycle needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether an image with the given tag exists locally.
    async fn image_exists(&self, tag: &str) -> Result<bool>;

    /// Starts building an image, yielding progress messages until the build ends.
    fn build_image(&self, request: BuildRequest) -> BoxStream<'_, Result<BuildProgress>>;

    /// Pulls an image from its registry.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Runs a container to completion, feeding combined stdout/stderr to `sink`, and returns its exit code. The
    /// container is removed afterwards.
    async fn run(&self, spec: &RunSpec, sink: &mut OutputSink<'_>) -> Result<i64>;

    /// Removes dangling images.
    async fn prune_dangling_images(&self) -> Result<()>;
}
