//! Resolving engine versions to commits and materializing their source code in the cache.
//!
//! [`RepositoryResolver`] maps a manifest to a [`CommitRef`] (pinned, digested from a direct source URL, or
//! resolved through a [`SourceHost`]) and fills the [`SourceCache`] either by downloading and extracting an
//! archive or by cloning the repository inside a `git` container.

use std::{
    fmt::{self, Display, Formatter},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    config::Config,
    engines::EngineManifest,
    runtime::{BindMount, ContainerRuntime, RunSpec},
    Error, Result,
};

mod archive;
mod cache;
mod github;

pub use archive::{extract, ArchiveKind};
pub use cache::{SourceCache, Staging};
pub use github::{GitHub, GITHUB_API_ROOT};

/// Image used to clone repositories.
pub const GIT_IMAGE: &str = "alpine/git";

/// Immutable identifier of an engine source tree, typically a commit hash.
///
/// # Examples
///
/// ```
/// use mjsuite::source::CommitRef;
///
/// let commit = CommitRef::new("4f2b8e1");
///
/// assert_eq!(commit.to_string(), "4f2b8e1");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitRef(String);

impl CommitRef {
    /// Wraps a commit identifier.
    pub fn new(sha: impl Into<String>) -> Self {
        Self(sha.into())
    }

    /// Derives a stable identifier for a source that is not addressed by commit, from its download URL.
    pub fn from_url(url: &str) -> Self {
        Self(hex::encode(Sha256::digest(url.as_bytes())))
    }

    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CommitRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Remote host serving engine repositories.
#[async_trait]
pub trait SourceHost: Send + Sync {
    /// Resolves a tag or branch to the commit behind it.
    async fn resolve_commit(&self, repository: &str, version: &str) -> Result<CommitRef>;

    /// URL of a point-in-time archive of `commit`.
    fn archive_url(&self, repository: &str, commit: &CommitRef) -> String;

    /// URL to clone `repository` from.
    fn clone_url(&self, repository: &str) -> String;

    /// Downloads `url` to the file `destination`.
    async fn download(&self, url: &str, destination: &Path) -> Result<()>;
}

/// Maps manifests to commits and materializes their source code.
#[derive(Clone, Copy)]
pub struct RepositoryResolver<'a> {
    config: &'a Config,
    host: &'a dyn SourceHost,
    runtime: &'a dyn ContainerRuntime,
}

impl<'a> RepositoryResolver<'a> {
    /// Creates a resolver over the given collaborators.
    pub fn new(
        config: &'a Config,
        host: &'a dyn SourceHost,
        runtime: &'a dyn ContainerRuntime,
    ) -> Self {
        Self {
            config,
            host,
            runtime,
        }
    }

    /// Resolves the commit to build for `manifest`.
    ///
    /// A pinned `sha` is used as is and a direct `source` URL is digested, neither touches the network. Otherwise
    /// the source host is asked for the commit behind `version`.
    ///
    /// # Errors
    ///
    /// [`Error::Resolution`] if the host does not know the version.
    pub async fn resolve(&self, manifest: &EngineManifest) -> Result<CommitRef> {
        if let Some(sha) = &manifest.sha {
            log::debug!("using pinned commit {sha}");
            return Ok(CommitRef::new(sha.clone()));
        }
        if let Some(source) = &manifest.source {
            log::debug!("using direct source {source}");
            return Ok(CommitRef::from_url(source));
        }
        log::info!("[{}] resolving {}...", manifest.repository, manifest.version);
        self.host
            .resolve_commit(&manifest.repository, &manifest.version)
            .await
    }

    /// Downloads or clones the source of `manifest` into `cache` under `commit`.
    ///
    /// # Errors
    ///
    /// [`Error::Fetch`] if the download, clone or extraction fails. The staging directory is removed either way.
    pub async fn materialize(
        &self,
        manifest: &EngineManifest,
        commit: &CommitRef,
        cache: &SourceCache,
    ) -> Result<PathBuf> {
        let staging = cache.stage(commit)?;

        if manifest.clone_repository.unwrap_or(false) {
            log::info!("[{}] cloning source code...", manifest.repository);
            self.clone_into(manifest, &staging.tree()).await?;
        } else {
            let (url, file_name) = match &manifest.source {
                Some(source) => (source.clone(), archive_file_name(source)),
                None => (
                    self.host.archive_url(&manifest.repository, commit),
                    format!("{commit}.tar.gz"),
                ),
            };
            let file = staging.download().join(file_name);

            log::info!("[{}] downloading {url}...", manifest.repository);
            self.host.download(&url, &file).await?;

            log::info!("[{}] extracting {}...", manifest.repository, file.display());
            let tree = staging.tree();
            tokio::task::spawn_blocking(move || extract(&file, &tree))
                .await
                .map_err(|err| Error::Fetch(format!("extraction task failed: {err}")))??;
        }

        cache.commit(&staging, commit)
    }

    async fn clone_into(&self, manifest: &EngineManifest, destination: &Path) -> Result<()> {
        if !self.runtime.image_exists(GIT_IMAGE).await? {
            self.runtime.pull_image(GIT_IMAGE).await?;
        }

        let spec = RunSpec {
            image: GIT_IMAGE.to_string(),
            entrypoint: None,
            cmd: vec![
                "clone".to_string(),
                "--branch".to_string(),
                manifest.version.clone(),
                "--depth".to_string(),
                "1".to_string(),
                "--single-branch".to_string(),
                self.host.clone_url(&manifest.repository),
            ],
            mounts: vec![BindMount {
                source: self.config.host_path(destination),
                target: "/git".to_string(),
                read_only: false,
            }],
            unconfined: false,
        };

        let exit_code = self
            .runtime
            .run(&spec, &mut |chunk: &str| log::debug!("{}", chunk.trim_end()))
            .await?;
        if exit_code == 0 {
            Ok(())
        } else {
            Err(Error::Fetch(format!(
                "cloning {} failed with exit code {exit_code}",
                manifest.repository
            )))
        }
    }
}

/// File name to store a direct download under, keeping the extension used to pick the decompressor.
fn archive_file_name(url: &str) -> String {
    url.split(&['?', '#'][..])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .unwrap_or("source.tar.gz")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeHost, FakeRuntime};

    fn manifest(json: &str) -> EngineManifest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn url_digest_is_stable_hex() {
        let a = CommitRef::from_url("https://example.com/engine.tar.xz");
        let b = CommitRef::from_url("https://example.com/engine.tar.xz");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn archive_file_name_keeps_extension() {
        assert_eq!(
            archive_file_name("https://example.com/dl/qjs-2024.tar.xz?raw=1"),
            "qjs-2024.tar.xz"
        );
        assert_eq!(archive_file_name("https://example.com/"), "source.tar.gz");
    }

    #[tokio::test]
    async fn pinned_commit_skips_the_host() {
        let config = Config::new(".");
        let host = FakeHost::default();
        let runtime = FakeRuntime::default();
        let resolver = RepositoryResolver::new(&config, &host, &runtime);

        let commit = resolver
            .resolve(&manifest(
                r#"{"name": "QuickJS", "repository": "bellard/quickjs", "version": "v1", "sha": "cafe"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(commit, CommitRef::new("cafe"));
        assert_eq!(host.resolve_calls(), 0);
    }

    #[tokio::test]
    async fn unpinned_commit_asks_the_host() {
        let config = Config::new(".");
        let host = FakeHost::default().with_commit("v1", "beef");
        let runtime = FakeRuntime::default();
        let resolver = RepositoryResolver::new(&config, &host, &runtime);

        let commit = resolver
            .resolve(&manifest(
                r#"{"name": "QuickJS", "repository": "bellard/quickjs", "version": "v1"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(commit, CommitRef::new("beef"));
        assert_eq!(host.resolve_calls(), 1);
    }

    #[tokio::test]
    async fn unknown_version_is_a_resolution_error() {
        let config = Config::new(".");
        let host = FakeHost::default();
        let runtime = FakeRuntime::default();
        let resolver = RepositoryResolver::new(&config, &host, &runtime);

        let err = resolver
            .resolve(&manifest(
                r#"{"name": "QuickJS", "repository": "bellard/quickjs", "version": "nope"}"#,
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Resolution { .. }));
    }

    #[tokio::test]
    async fn materializes_downloaded_archive() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path());
        let cache = SourceCache::new(config.cache_dir());
        let host = FakeHost::default().with_archive("owner-engine-beef/README", "engine");
        let runtime = FakeRuntime::default();
        let resolver = RepositoryResolver::new(&config, &host, &runtime);
        let commit = CommitRef::new("beef");

        let entry = resolver
            .materialize(
                &manifest(r#"{"name": "E", "repository": "owner/engine", "version": "v1"}"#),
                &commit,
                &cache,
            )
            .await
            .unwrap();

        assert_eq!(entry, config.cache_dir().join("beef"));
        assert_eq!(
            std::fs::read_to_string(entry.join("README")).unwrap(),
            "engine"
        );
        assert!(!config.cache_dir().join("tmp").join("beef").exists());
        assert_eq!(
            host.downloads(),
            vec![format!("{GITHUB_API_ROOT}/repos/owner/engine/tarball/beef")]
        );
    }

    #[tokio::test]
    async fn failed_clone_is_a_fetch_error_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path());
        let cache = SourceCache::new(config.cache_dir());
        let host = FakeHost::default();
        let runtime = FakeRuntime::default().with_exit_code(128);
        let resolver = RepositoryResolver::new(&config, &host, &runtime);
        let commit = CommitRef::new("beef");

        let err = resolver
            .materialize(
                &manifest(
                    r#"{"name": "E", "repository": "owner/engine", "version": "main", "clone": true}"#,
                ),
                &commit,
                &cache,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Fetch(_)));
        assert!(!cache.contains(&commit));
        assert!(!config.cache_dir().join("tmp").join("beef").exists());

        let runs = runtime.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].image, GIT_IMAGE);
        assert!(runs[0].cmd.contains(&"--single-branch".to_string()));
        assert_eq!(runtime.pulls(), vec![GIT_IMAGE.to_string()]);
    }
}
