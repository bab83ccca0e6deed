//! Error taxonomy shared by every stage of the engine lifecycle and benchmark pipeline.
//!
//! None of these are retried anywhere in the library. They bubble up to the command dispatcher in the binary,
//! which logs them and exits non-zero.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while setting up engines and running workloads.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing engine/workload definition.
    #[error("invalid {kind} '{id}' ({reason})")]
    Manifest {
        /// What was being loaded, `engine` or `workload`.
        kind: &'static str,
        /// Identifier of the definition.
        id: String,
        /// Human readable cause.
        reason: String,
    },

    /// The declared version could not be mapped to a commit.
    #[error("could not resolve {repository}@{version}: {reason}")]
    Resolution {
        /// Repository in `owner/repo` form.
        repository: String,
        /// Tag or branch that was looked up.
        version: String,
        /// Human readable cause.
        reason: String,
    },

    /// Downloading, cloning or extracting source code failed.
    #[error("could not fetch source code: {0}")]
    Fetch(String),

    /// The image build reported an error.
    #[error("could not build image {tag}: {message}")]
    Build {
        /// Tag of the image being built.
        tag: String,
        /// Error message reported by the daemon.
        message: String,
    },

    /// A container exited unsuccessfully or its output lacked the expected timing data.
    #[error("execution failed: {0}")]
    Execution(String),

    /// Measurement output was missing a mandatory field.
    #[error("could not parse measurement output: {0}")]
    Parse(String),

    /// An engine template is not usable.
    #[error("invalid template for engine '{engine}': {reason}")]
    Template {
        /// Engine owning the template.
        engine: String,
        /// Human readable cause.
        reason: String,
    },

    /// The container runtime reported an error.
    #[error("container runtime error: {0}")]
    Runtime(#[from] bollard::errors::Error),

    /// HTTP request against the source host failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for an [`Error::Manifest`] about an engine.
    pub fn engine(id: impl Into<String>, reason: impl ToString) -> Self {
        Self::Manifest {
            kind: "engine",
            id: id.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for an [`Error::Manifest`] about a workload.
    pub fn workload(id: impl Into<String>, reason: impl ToString) -> Self {
        Self::Manifest {
            kind: "workload",
            id: id.into(),
            reason: reason.to_string(),
        }
    }
}
