//! Immutable process configuration.
//!
//! Built once at process entry and passed down to every component that needs a path, the image namespace or the
//! in-container flag. Library code never reads the environment itself.

use std::path::{Path, PathBuf};

/// Namespace used for every engine image tag.
pub const IMAGE_NAMESPACE: &str = "mjsuite";

/// Runtime configuration for one invocation of the tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    root: PathBuf,
    mount_source: Option<PathBuf>,
    github_token: Option<String>,
    image_namespace: String,
    version: String,
}

impl Config {
    /// Creates a configuration rooted at `root` (the directory holding `engines/` and `workloads/`).
    ///
    /// A relative `root` is made absolute against the current directory, since every path derived from it may end up
    /// as a bind-mount source.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            root: std::path::absolute(&root).unwrap_or(root),
            mount_source: None,
            github_token: None,
            image_namespace: IMAGE_NAMESPACE.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Marks the tool as running inside a container whose root is visible at `host_root` on the host.
    #[must_use]
    pub fn with_mount_source(mut self, host_root: Option<PathBuf>) -> Self {
        self.mount_source = host_root;
        self
    }

    /// Sets the token used to authenticate against the source host API.
    #[must_use]
    pub fn with_github_token(mut self, token: Option<String>) -> Self {
        self.github_token = token.filter(|token| !token.is_empty());
        self
    }

    /// Install root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory containing one sub-directory per engine, also the image build context.
    pub fn engines_dir(&self) -> PathBuf {
        self.root.join("engines")
    }

    /// Root of the content-addressed source cache.
    pub fn cache_dir(&self) -> PathBuf {
        self.engines_dir().join("cache")
    }

    /// Directory containing the workload scripts.
    pub fn workloads_dir(&self) -> PathBuf {
        self.root.join("workloads")
    }

    /// Directory where compiled workloads are staged before being mounted into a container.
    pub fn staging_dir(&self) -> PathBuf {
        self.workloads_dir().join("tmp")
    }

    /// Default directory for benchmark result files.
    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    /// Host-visible root when running inside a container.
    pub fn mount_source(&self) -> Option<&Path> {
        self.mount_source.as_deref()
    }

    /// Whether the tool itself runs inside a container.
    pub fn in_container(&self) -> bool {
        self.mount_source.is_some()
    }

    /// Token for the source host API, if any.
    pub fn github_token(&self) -> Option<&str> {
        self.github_token.as_deref()
    }

    /// Namespace of the engine image tags.
    pub fn image_namespace(&self) -> &str {
        &self.image_namespace
    }

    /// Version of this tool.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Translates a path under the install root to the path the container daemon must use as a mount source.
    ///
    /// The daemon resolves bind-mount sources against the host filesystem, so when this tool runs inside a
    /// container its own view of the root has to be swapped for the host one. Paths outside the root are left as is.
    pub fn host_path(&self, path: &Path) -> PathBuf {
        match (&self.mount_source, path.strip_prefix(&self.root)) {
            (Some(host_root), Ok(relative)) => host_root.join(relative),
            _ => path.to_path_buf(),
        }
    }
}
