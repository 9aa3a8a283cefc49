//! Recording mock of the [`ContainerRuntime`] trait.
//!
//! Tests use it to assert image-cleanup invariants and to fabricate the
//! files a real user container would leave behind in its mounts (the perf
//! report, prediction files), or to force a specific invocation to fail.

use std::sync::{Arc, Mutex};

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::{ContainerRuntime, ImageHandle, Mount, RuntimeError, TarStream};

/// One recorded `run_untrusted` invocation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub image: String,
    pub argv: Vec<String>,
    pub mounts: Vec<Mount>,
    pub remove_on_exit: bool,
}

impl RunRequest {
    /// Host path bound to the given container path, if any.
    pub fn host_path_of(&self, container: &str) -> Option<&std::path::Path> {
        self.mounts
            .iter()
            .find(|m| m.container == container)
            .map(|m| m.host.as_path())
    }
}

/// Hook invoked for every mock container run, in place of a real container.
pub type RunHook = dyn Fn(&RunRequest) -> Result<(), RuntimeError> + Send + Sync;

#[derive(Default)]
struct MockState {
    loaded: Vec<String>,
    builds: Vec<String>,
    unloads: Vec<String>,
    runs: Vec<RunRequest>,
}

/// In-memory [`ContainerRuntime`] that records every call.
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
    run_hook: Mutex<Option<Arc<RunHook>>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a closure that decides the outcome of each container run and
    /// may write files into the mounted host directories.
    pub fn set_run_hook(
        &self,
        hook: impl Fn(&RunRequest) -> Result<(), RuntimeError> + Send + Sync + 'static,
    ) {
        *self.run_hook.lock().unwrap() = Some(Arc::new(hook));
    }

    /// Names of images currently loaded (built and not yet unloaded).
    pub fn loaded_images(&self) -> Vec<String> {
        self.state.lock().unwrap().loaded.clone()
    }

    /// Every image name ever passed to `image_build`.
    pub fn built_images(&self) -> Vec<String> {
        self.state.lock().unwrap().builds.clone()
    }

    /// Every image name ever passed to `image_unload`.
    pub fn unloaded_images(&self) -> Vec<String> {
        self.state.lock().unwrap().unloads.clone()
    }

    /// Every recorded container run, in invocation order.
    pub fn runs(&self) -> Vec<RunRequest> {
        self.state.lock().unwrap().runs.clone()
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for MockRuntime {
    async fn image_build(
        &self,
        name: &str,
        mut context: TarStream,
    ) -> Result<ImageHandle, RuntimeError> {
        // Drain the context like a real daemon would; an unread stream would
        // stall the gzip decoder feeding it.
        let mut sink = Vec::new();
        context
            .read_to_end(&mut sink)
            .await
            .map_err(|e| RuntimeError::BuildFailed {
                image: name.to_owned(),
                reason: e.to_string(),
            })?;

        self.state.lock().unwrap().builds.push(name.to_owned());
        Ok(ImageHandle {
            id: format!("sha256:mock-{name}"),
        })
    }

    async fn image_load(&self, name: &str, _handle: ImageHandle) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if !state.loaded.iter().any(|n| n == name) {
            state.loaded.push(name.to_owned());
        }
        Ok(())
    }

    async fn image_unload(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.loaded.retain(|n| n != name);
        state.unloads.push(name.to_owned());
        Ok(())
    }

    async fn run_untrusted(
        &self,
        image: &str,
        argv: &[String],
        mounts: &[Mount],
        remove_on_exit: bool,
        cancel: &CancellationToken,
    ) -> Result<String, RuntimeError> {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        if !self.state.lock().unwrap().loaded.iter().any(|n| n == image) {
            return Err(RuntimeError::ImageMissing {
                image: image.to_owned(),
            });
        }

        let request = RunRequest {
            image: image.to_owned(),
            argv: argv.to_vec(),
            mounts: mounts.to_vec(),
            remove_on_exit,
        };

        let hook = self.run_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(&request)?;
        }

        let mut state = self.state.lock().unwrap();
        state.runs.push(request);
        Ok(format!("mock-container-{}", state.runs.len()))
    }
}
