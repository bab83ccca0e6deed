use std::{collections::HashMap, time::SystemTime};

use async_trait::async_trait;
use bollard::{
    container::{
        AttachContainerOptions, Config, CreateContainerOptions, LogOutput, RemoveContainerOptions,
        WaitContainerOptions,
    },
    errors::Error as DockerError,
    image::{BuildImageOptions, CreateImageOptions, PruneImagesOptions},
    models::{ContainerWaitResponse, HostConfig, Mount, MountTypeEnum},
    Docker,
};
use futures::{stream::BoxStream, StreamExt, TryStreamExt};

use super::{BuildProgress, BuildRequest, ContainerRuntime, OutputSink, RunSpec};
use crate::{Error, Result};

/// [`ContainerRuntime`] backed by a Docker daemon.
#[derive(Clone, Debug)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Wraps an existing daemon connection.
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Underlying daemon connection.
    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

fn container_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("mjsuite_{nanos}")
}

fn host_config(spec: &RunSpec) -> HostConfig {
    let mounts = spec
        .mounts
        .iter()
        .map(|mount| Mount {
            typ: Some(MountTypeEnum::BIND),
            source: Some(mount.source.to_string_lossy().into_owned()),
            target: Some(mount.target.clone()),
            read_only: Some(mount.read_only),
            ..Default::default()
        })
        .collect();

    HostConfig {
        mounts: Some(mounts),
        security_opt: spec
            .unconfined
            .then(|| vec!["seccomp=unconfined".to_string()]),
        auto_remove: Some(true),
        ..Default::default()
    }
}

fn exit_code(
    name: &str,
    response: Option<std::result::Result<ContainerWaitResponse, DockerError>>,
) -> Result<i64> {
    match response {
        Some(Ok(response)) => Ok(response.status_code),
        // bollard turns non-zero exits into errors
        Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
        Some(Err(DockerError::DockerResponseServerError {
            status_code: 404, ..
        }))
        | None => Err(Error::Execution(format!(
            "container {name} was removed before reporting an exit code"
        ))),
        Some(Err(err)) => Err(err.into()),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_exists(&self, tag: &str) -> Result<bool> {
        match self.docker.inspect_image(tag).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn build_image(&self, request: BuildRequest) -> BoxStream<'_, Result<BuildProgress>> {
        let tag = request.tag.clone();
        self.docker
            .build_image(
                BuildImageOptions {
                    dockerfile: request.dockerfile,
                    t: request.tag,
                    buildargs: request.build_args,
                    rm: true,
                    ..Default::default()
                },
                None,
                Some(request.context.into()),
            )
            .map(move |r| match r {
                Ok(info) => Ok(if let Some(error) = info.error {
                    BuildProgress::Error(error)
                } else if let Some(stream) = info.stream {
                    BuildProgress::Stream(stream)
                } else {
                    BuildProgress::Status(info.status.unwrap_or_default())
                }),
                Err(err) => Err(Error::Build {
                    tag: tag.clone(),
                    message: err.to_string(),
                }),
            })
            .boxed()
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        log::debug!("pulling image {image}...");
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: image.to_string(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_for_each(|info| async move {
                log::trace!("pull: {}", info.status.unwrap_or_default());
                Ok(())
            })
            .await?;
        log::debug!("pulled image {image}");
        Ok(())
    }

    async fn run(&self, spec: &RunSpec, sink: &mut OutputSink<'_>) -> Result<i64> {
        let name = container_name();

        log::trace!("[{name}] creating container: {spec:#?}");
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    ..Default::default()
                }),
                Config {
                    image: Some(spec.image.clone()),
                    entrypoint: spec.entrypoint.clone(),
                    cmd: Some(spec.cmd.clone()),
                    tty: Some(false),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    host_config: Some(host_config(spec)),
                    ..Default::default()
                },
            )
            .await?;

        let result = self.run_created(&name, sink).await;

        // the daemon removes exited containers, this only catches ones that never started or were interrupted
        match self
            .docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => log::trace!("[{name}] removed container"),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => log::trace!("[{name}] container already removed"),
            Err(err) => log::warn!("[{name}] could not remove container: {err}, continuing..."),
        }

        result
    }

    async fn prune_dangling_images(&self) -> Result<()> {
        let filters = HashMap::from([("dangling".to_string(), vec!["true".to_string()])]);
        let response = self
            .docker
            .prune_images(Some(PruneImagesOptions { filters }))
            .await?;
        log::debug!(
            "pruned dangling images, reclaimed {} bytes",
            response.space_reclaimed.unwrap_or_default()
        );
        Ok(())
    }
}

impl DockerRuntime {
    async fn run_created(&self, name: &str, sink: &mut OutputSink<'_>) -> Result<i64> {
        let mut attached = self
            .docker
            .attach_container::<String>(
                name,
                Some(AttachContainerOptions {
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    ..Default::default()
                }),
            )
            .await?;

        let output = async {
            self.docker.start_container::<String>(name, None).await?;
            log::trace!("[{name}] started container");
            while let Some(chunk) = attached.output.next().await {
                match chunk? {
                    LogOutput::StdOut { message }
                    | LogOutput::StdErr { message }
                    | LogOutput::Console { message } => {
                        sink(String::from_utf8_lossy(&message).as_ref());
                    }
                    LogOutput::StdIn { .. } => {}
                }
            }
            Ok::<_, Error>(())
        };

        // the wait is polled before the container starts, auto-removal discards the exit code
        let (exit_code, ()) = futures::future::try_join(self.wait_for_removal(name), output).await?;
        log::trace!("[{name}] exited with code {exit_code}");
        Ok(exit_code)
    }

    async fn wait_for_removal(&self, name: &str) -> Result<i64> {
        let mut responses = self
            .docker
            .wait_container(
                name,
                Some(WaitContainerOptions {
                    condition: "removed",
                }),
            )
            .boxed();
        exit_code(name, responses.next().await)
    }
}
