//! Docker-backed [`ContainerRuntime`] over the bollard client.

use std::time::Duration;

use bollard::container::{
    Config, KillContainerOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::image::{BuildImageOptions, RemoveImageOptions, TagImageOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{ContainerRuntime, ImageHandle, Mount, RuntimeError, TarStream};

/// Tag under which loaded images are registered.
const IMAGE_TAG: &str = "latest";

/// [`ContainerRuntime`] implementation backed by a local Docker daemon.
///
/// A single `DockerRuntime` is shared by all tasks in the worker process;
/// bollard's client is internally thread-safe.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
    /// Wall-clock budget for one container invocation.
    timeout: Duration,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    pub fn connect(timeout: Duration) -> Result<Self, RuntimeError> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| RuntimeError::Unavailable {
                reason: e.to_string(),
            })?;
        Ok(Self { docker, timeout })
    }

    /// Kill and force-remove a container, logging (not propagating)
    /// failures; used on the timeout and cancellation paths.
    async fn terminate(&self, container_id: &str) {
        if let Err(e) = self
            .docker
            .kill_container(container_id, None::<KillContainerOptions<String>>)
            .await
        {
            warn!(container = %container_id, error = %e, "failed to kill container");
        }
        self.force_remove(container_id).await;
    }

    async fn force_remove(&self, container_id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self
            .docker
            .remove_container(container_id, Some(options))
            .await
        {
            warn!(container = %container_id, error = %e, "failed to remove container");
        }
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_build(
        &self,
        name: &str,
        context: TarStream,
    ) -> Result<ImageHandle, RuntimeError> {
        let options = BuildImageOptions::<String> {
            t: name.to_owned(),
            rm: true,
            ..Default::default()
        };
        let mut context = context;
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut context, &mut buf)
            .await
            .map_err(|e| RuntimeError::BuildFailed {
                image: name.to_owned(),
                reason: e.to_string(),
            })?;
        let body = bytes::Bytes::from(buf);

        let mut stream = self.docker.build_image(options, None, Some(body));
        let mut image_id = None;
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| RuntimeError::BuildFailed {
                image: name.to_owned(),
                reason: e.to_string(),
            })?;
            if let Some(error) = info.error {
                return Err(RuntimeError::BuildFailed {
                    image: name.to_owned(),
                    reason: error,
                });
            }
            if let Some(aux) = info.aux {
                image_id = aux.id;
            }
        }

        // Older daemons omit the aux record; the tag set via `t` still
        // identifies the build result.
        let id = image_id.unwrap_or_else(|| format!("{name}:{IMAGE_TAG}"));
        debug!(image = %name, id = %id, "image built");
        Ok(ImageHandle { id })
    }

    async fn image_load(&self, name: &str, handle: ImageHandle) -> Result<(), RuntimeError> {
        let options = TagImageOptions {
            repo: name.to_owned(),
            tag: IMAGE_TAG.to_owned(),
        };
        self.docker
            .tag_image(&handle.id, Some(options))
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    RuntimeError::ImageMissing {
                        image: handle.id.clone(),
                    }
                } else {
                    RuntimeError::Unavailable {
                        reason: e.to_string(),
                    }
                }
            })?;
        debug!(image = %name, "image loaded");
        Ok(())
    }

    async fn image_unload(&self, name: &str) -> Result<(), RuntimeError> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_image(name, Some(options), None).await {
            Ok(_) => Ok(()),
            // Idempotent: a missing image is already unloaded.
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(RuntimeError::Unavailable {
                reason: e.to_string(),
            }),
        }
    }

    async fn run_untrusted(
        &self,
        image: &str,
        argv: &[String],
        mounts: &[Mount],
        remove_on_exit: bool,
        cancel: &CancellationToken,
    ) -> Result<String, RuntimeError> {
        let binds = mounts.iter().map(Mount::bind_spec).collect();
        let config = Config::<String> {
            image: Some(image.to_owned()),
            cmd: Some(argv.to_vec()),
            host_config: Some(HostConfig {
                binds: Some(binds),
                // The bind mounts above are the only thing an untrusted
                // container may touch; no network access.
                network_mode: Some("none".to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container::<String, String>(None, config)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    RuntimeError::ImageMissing {
                        image: image.to_owned(),
                    }
                } else {
                    RuntimeError::Unavailable {
                        reason: e.to_string(),
                    }
                }
            })?;
        let container_id = created.id;

        if let Err(e) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            self.force_remove(&container_id).await;
            return Err(RuntimeError::Unavailable {
                reason: e.to_string(),
            });
        }

        let mut wait = self
            .docker
            .wait_container(&container_id, None::<WaitContainerOptions<String>>);

        let outcome = tokio::select! {
            exit = wait.next() => match exit {
                Some(Ok(status)) if status.status_code == 0 => Ok(()),
                Some(Ok(status)) => Err(RuntimeError::NonZeroExit {
                    container: container_id.clone(),
                    code: status.status_code,
                }),
                // bollard surfaces non-zero exits from the wait endpoint as
                // a dedicated error variant.
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    Err(RuntimeError::NonZeroExit {
                        container: container_id.clone(),
                        code,
                    })
                }
                Some(Err(e)) => Err(RuntimeError::Unavailable { reason: e.to_string() }),
                None => Err(RuntimeError::Unavailable {
                    reason: "wait stream ended without a status".to_owned(),
                }),
            },
            _ = tokio::time::sleep(self.timeout) => {
                self.terminate(&container_id).await;
                return Err(RuntimeError::Timeout { container: container_id });
            }
            _ = cancel.cancelled() => {
                self.terminate(&container_id).await;
                return Err(RuntimeError::Cancelled);
            }
        };

        // Collect-from-mounts runs keep their container around for
        // inspection; everything else is removed eagerly.
        if remove_on_exit || outcome.is_err() {
            self.force_remove(&container_id).await;
        }

        outcome.map(|()| container_id)
    }
}
