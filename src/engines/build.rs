use std::{
    collections::HashMap,
    io::BufWriter,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use futures::StreamExt;
use regex::Regex;

use super::metadata::{DOCKERFILE, SOURCE_BUILD_ARG};
use crate::{
    runtime::{BuildProgress, BuildRequest, ContainerRuntime},
    Error, Result,
};

/// What goes into one image build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildPlan {
    /// Tag of the image to produce.
    pub tag: String,
    /// Root of the build context, the engines directory.
    pub context_root: PathBuf,
    /// Engine directory relative to the context root.
    pub engine_dir: String,
    /// Cached source tree relative to the context root, only for images built from source.
    pub source_dir: Option<String>,
}

impl BuildPlan {
    /// Dockerfile path relative to the context root.
    pub fn dockerfile(&self) -> String {
        format!("{}/{DOCKERFILE}", self.engine_dir)
    }

    /// Build arguments passed to the daemon.
    pub fn build_args(&self) -> HashMap<String, String> {
        self.source_dir
            .iter()
            .map(|source| (SOURCE_BUILD_ARG.to_string(), source.clone()))
            .collect()
    }

    /// Packs the engine directory and, if any, the cached source into an uncompressed tarball.
    ///
    /// This is blocking and may take a while for large source trees.
    ///
    /// # Errors
    ///
    /// If any file of the context cannot be read.
    pub fn pack_context(&self) -> Result<Vec<u8>> {
        let mut tarball = tar::Builder::new(BufWriter::new(vec![]));
        tarball.follow_symlinks(false);
        tarball.append_dir_all(&self.engine_dir, self.context_root.join(&self.engine_dir))?;
        if let Some(source_dir) = &self.source_dir {
            tarball.append_dir_all(source_dir, self.context_root.join(source_dir))?;
        }
        tarball
            .into_inner()?
            .into_inner()
            .map_err(|err| Error::Io(err.into_error()))
    }
}

/// Builds engine images, streaming build progress to the log.
#[derive(Clone, Copy)]
pub struct ImageBuilder<'a> {
    runtime: &'a dyn ContainerRuntime,
}

impl<'a> ImageBuilder<'a> {
    /// Creates a builder on top of `runtime`.
    pub fn new(runtime: &'a dyn ContainerRuntime) -> Self {
        Self { runtime }
    }

    /// Builds the image described by `plan` and prunes dangling images afterwards.
    ///
    /// Build step boundaries are logged at `info`, everything else the build prints at `debug`. The first error
    /// reported by the daemon aborts the build.
    ///
    /// # Errors
    ///
    /// [`Error::Build`] if the daemon reports an error, or an I/O error if the context cannot be packed.
    pub async fn build(&self, plan: &BuildPlan) -> Result<()> {
        let tag = plan.tag.clone();
        log::info!("[{tag}] building image, this may take a while...");

        let context = {
            let plan = plan.clone();
            tokio::task::spawn_blocking(move || plan.pack_context())
                .await
                .map_err(|err| Error::Build {
                    tag: tag.clone(),
                    message: format!("packing build context failed: {err}"),
                })??
        };
        log::debug!("[{tag}] build context is {} bytes", context.len());

        let mut progress = self.runtime.build_image(BuildRequest {
            tag: tag.clone(),
            dockerfile: plan.dockerfile(),
            build_args: plan.build_args(),
            context,
        });
        while let Some(event) = progress.next().await {
            match event? {
                BuildProgress::Stream(line) => {
                    if is_step_boundary(&line) {
                        log::info!("[{tag}] {}", line.trim());
                    } else if !line.trim().is_empty() {
                        log::debug!("[{tag}] {}", line.trim_end());
                    }
                }
                BuildProgress::Status(status) => log::debug!("[{tag}] {status}"),
                BuildProgress::Error(message) => {
                    log::error!("[{tag}] {message}");
                    return Err(Error::Build { tag, message });
                }
            }
        }
        drop(progress);

        log::info!("[{tag}] built image, pruning dangling images...");
        if let Err(err) = self.runtime.prune_dangling_images().await {
            log::warn!("could not prune dangling images: {err}, continuing...");
        }
        Ok(())
    }
}

/// Whether a build output line marks the start of a build step (`Step N/M`).
pub fn is_step_boundary(line: &str) -> bool {
    static STEP: OnceLock<Regex> = OnceLock::new();
    STEP.get_or_init(|| Regex::new(r"^Step \d+/\d+").expect("step pattern is valid"))
        .is_match(line)
}

/// Relative path of `path` under `root`, with forward slashes as the daemon expects.
pub(crate) fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    Some(
        relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
    )
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::testing::FakeRuntime;

    fn plan(root: &Path, source_dir: Option<&str>) -> BuildPlan {
        fs::create_dir_all(root.join("qjs")).unwrap();
        fs::write(root.join("qjs/Dockerfile"), "FROM alpine\nENTRYPOINT [\"qjs\"]\n").unwrap();
        if let Some(source_dir) = source_dir {
            fs::create_dir_all(root.join(source_dir)).unwrap();
            fs::write(root.join(source_dir).join("quickjs.c"), "int main;").unwrap();
        }
        BuildPlan {
            tag: "mjsuite/qjs:v1".to_string(),
            context_root: root.to_path_buf(),
            engine_dir: "qjs".to_string(),
            source_dir: source_dir.map(str::to_string),
        }
    }

    fn entries(tarball: &[u8]) -> Vec<String> {
        tar::Archive::new(tarball)
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn recognizes_step_boundaries() {
        assert!(is_step_boundary("Step 3/12 : RUN make\n"));
        assert!(!is_step_boundary(" ---> Running in 1234\n"));
        assert!(!is_step_boundary("Stepping 1/2"));
    }

    #[test]
    fn prebuilt_images_skip_source() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), None);

        assert!(plan.build_args().is_empty());
        assert_eq!(plan.dockerfile(), "qjs/Dockerfile");
        let entries = entries(&plan.pack_context().unwrap());
        assert!(entries.iter().any(|e| e == "qjs/Dockerfile"));
        assert!(entries.iter().all(|e| !e.starts_with("cache")));
    }

    #[test]
    fn source_builds_include_cache_entry() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), Some("cache/abc"));

        assert_eq!(
            plan.build_args(),
            HashMap::from([("srcPath".to_string(), "cache/abc".to_string())])
        );
        let entries = entries(&plan.pack_context().unwrap());
        assert!(entries.iter().any(|e| e == "cache/abc/quickjs.c"));
    }

    #[tokio::test]
    async fn build_error_aborts_without_pruning() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), None);
        let runtime = FakeRuntime::default().with_build_progress(vec![
            BuildProgress::Stream("Step 1/2 : FROM alpine\n".to_string()),
            BuildProgress::Error("The command '/bin/sh -c make' returned a non-zero code: 2".to_string()),
            BuildProgress::Stream("Step 2/2 : never reached\n".to_string()),
        ]);

        let err = ImageBuilder::new(&runtime).build(&plan).await.unwrap_err();

        assert!(matches!(err, Error::Build { ref tag, .. } if tag == "mjsuite/qjs:v1"));
        assert_eq!(runtime.prunes(), 0);
    }

    #[tokio::test]
    async fn successful_build_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), None);
        let runtime = FakeRuntime::default();

        ImageBuilder::new(&runtime).build(&plan).await.unwrap();

        let builds = runtime.builds();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].dockerfile, "qjs/Dockerfile");
        assert_eq!(runtime.prunes(), 1);
    }

    #[test]
    fn relative_paths_use_forward_slashes() {
        assert_eq!(
            relative_to(Path::new("/a/engines"), Path::new("/a/engines/cache/abc")),
            Some("cache/abc".to_string())
        );
        assert_eq!(relative_to(Path::new("/a"), Path::new("/b")), None);
    }
}
