//! Container-runtime adapter.
//!
//! The pipelines only ever talk to the [`ContainerRuntime`] trait; the
//! Docker implementation lives in [`docker`] and a recording mock for tests
//! in [`mock`].  Mounted host directories are the single declared attack
//! surface of an untrusted container run.

pub mod docker;
pub mod mock;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use docker::DockerRuntime;
pub use mock::MockRuntime;

/// A tar stream handed to [`ContainerRuntime::image_build`].
pub type TarStream = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Identifier of an image produced by a build, before it is registered
/// under its public name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    pub id: String,
}

/// A host directory bound into an untrusted container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
}

impl Mount {
    pub fn new(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
        }
    }

    /// Docker bind specification, `host:container`.
    pub fn bind_spec(&self) -> String {
        format!("{}:{}", self.host.display(), self.container)
    }
}

/// Errors produced by the container runtime, tagged by failure mode.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime daemon cannot be reached or refused the request.
    #[error("container runtime unavailable: {reason}")]
    Unavailable { reason: String },

    /// The named image is not present in the runtime.
    #[error("image not found: {image}")]
    ImageMissing { image: String },

    /// Building an image from its context failed.
    #[error("building image {image} failed: {reason}")]
    BuildFailed { image: String, reason: String },

    /// A container ran to completion with a non-zero exit code.
    #[error("container {container} exited with status {code}")]
    NonZeroExit { container: String, code: i64 },

    /// A container exceeded the per-invocation wall-clock budget.
    #[error("container {container} timed out")]
    Timeout { container: String },

    /// The owning task was cancelled while the container was running.
    #[error("container run cancelled")]
    Cancelled,
}

/// Build, register, unload and run container images.
///
/// One shared instance serves every concurrent task; implementations must
/// be safe to call from multiple tasks at once.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build an image from a tar build context, producing an intermediate
    /// handle that is not yet visible under `name`.
    async fn image_build(&self, name: &str, context: TarStream)
        -> Result<ImageHandle, RuntimeError>;

    /// Register a built handle under `name`.
    async fn image_load(&self, name: &str, handle: ImageHandle) -> Result<(), RuntimeError>;

    /// Remove the named image.  Unloading an image that is not present is
    /// not an error.
    async fn image_unload(&self, name: &str) -> Result<(), RuntimeError>;

    /// Run `image` to completion with the given argv and bind mounts.
    ///
    /// The run is bounded by the runtime's per-invocation timeout and by
    /// `cancel`; on either, the container is terminated.  Returns the
    /// container identifier.
    async fn run_untrusted(
        &self,
        image: &str,
        argv: &[String],
        mounts: &[Mount],
        remove_on_exit: bool,
        cancel: &CancellationToken,
    ) -> Result<String, RuntimeError>;
}
