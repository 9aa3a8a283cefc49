//! Tracking of images loaded for one pipeline run.

use std::sync::Arc;

use tracing::warn;

use weft_runtime::ContainerRuntime;

/// Records the images a pipeline loaded so they can all be unloaded on
/// every exit path, mirroring the workspace's scoped cleanup.
///
/// Pipelines call [`ImageSet::unload_all`] on their normal exit paths
/// (success, failure, observed cancellation).  If the pipeline future is
/// dropped without ever reaching that call, the dispatcher abandoned it
/// mid-await, and the `Drop` impl spawns a detached unload task per
/// remaining image instead.
///
/// Unload failures are logged rather than propagated: cleanup must not
/// displace the pipeline's primary outcome.
pub struct ImageSet {
    runtime: Arc<dyn ContainerRuntime>,
    names: Vec<String>,
}

impl ImageSet {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            names: Vec::new(),
        }
    }

    /// Register an image for teardown.
    pub fn register(&mut self, name: String) {
        self.names.push(name);
    }

    /// Unload every registered image, most recently loaded first.
    pub async fn unload_all(&mut self) {
        while let Some(name) = self.names.pop() {
            if let Err(e) = self.runtime.image_unload(&name).await {
                warn!(image = %name, error = %e, "failed to unload image");
            }
        }
    }
}

impl Drop for ImageSet {
    fn drop(&mut self) {
        if self.names.is_empty() {
            return;
        }
        // Only reachable when the owning pipeline future was dropped
        // mid-await.  Unloading is async, so hand each remaining image to a
        // detached task; best-effort, like unload_all.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                for name in self.names.drain(..) {
                    let runtime = Arc::clone(&self.runtime);
                    handle.spawn(async move {
                        if let Err(e) = runtime.image_unload(&name).await {
                            warn!(image = %name, error = %e, "failed to unload image");
                        }
                    });
                }
            }
            Err(_) => {
                for name in &self.names {
                    warn!(image = %name, "image leaked: no async runtime to unload it");
                }
            }
        }
    }
}
