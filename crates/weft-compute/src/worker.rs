//! The worker execution pipelines.
//!
//! A [`Worker`] owns the shared service clients and carefully implements
//! every step of the learning and prediction workflows: materialise the
//! task's inputs on local disk, invoke the untrusted problem and algo
//! containers in a fixed sequence of volume-mount compositions, stream the
//! resulting artifacts back to storage, and report the outcome to the
//! ledger, with workspace and image cleanup guaranteed on every exit
//! path.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use weft_clients::{BlobKind, BlobStream, Ledger, Storage};
use weft_runtime::{ContainerRuntime, Mount, TarStream};
use weft_types::{LearnUplet, ModelRecord, Perfuplet, PredUplet, PredictionRecord, TaskStatus};

use crate::error::ComputeError;
use crate::images::ImageSet;
use crate::workspace::TaskWorkspace;

/// Image name prefix for problem-workflow containers.
const PROBLEM_IMAGE_PREFIX: &str = "problem";
/// Image name prefix for submitted algorithm containers.
const ALGO_IMAGE_PREFIX: &str = "algo";
/// File the perf step writes into the perf mount.
const PERFORMANCE_FILE: &str = "performance.json";
/// Canonical name a model file is given before a predict run.
const TRAINED_MODEL_FILE: &str = "model_trained.json";

/// Executes learn- and pred-uplets against the platform services.
///
/// One `Worker` serves every concurrent task in the process; all mutable
/// state is task-local.
pub struct Worker {
    id: Uuid,
    data_root: std::path::PathBuf,
    runtime: Arc<dyn ContainerRuntime>,
    storage: Arc<dyn Storage>,
    ledger: Arc<dyn Ledger>,
}

impl Worker {
    pub fn new(
        data_root: impl Into<std::path::PathBuf>,
        runtime: Arc<dyn ContainerRuntime>,
        storage: Arc<dyn Storage>,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            data_root: data_root.into(),
            runtime,
            storage,
            ledger,
        }
    }

    /// This worker's identity on the ledger.
    pub fn id(&self) -> Uuid {
        self.id
    }

    // ── Learn pipeline ───────────────────────────────────────────────────────

    /// Execute one learn-uplet delivery end to end.
    ///
    /// Decodes and validates before any side effect, claims the task on the
    /// ledger, runs the staged workflow, and reports the outcome.  A failed
    /// workflow is reported as `failed` best-effort: a report failure is
    /// logged but never displaces the workflow's own error.
    pub async fn handle_learn(
        &self,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), ComputeError> {
        let task: LearnUplet = serde_json::from_slice(body)?;
        task.validate()?;
        info!(key = %task.key, algo = %task.algo, "starting learning task");

        self.ledger.assign_worker(&task.key, self.id).await?;

        match self.learn_workflow(&task, cancel).await {
            Ok(perf) => {
                if let Err(e) = self
                    .ledger
                    .report_learn(
                        &task.key,
                        TaskStatus::Done,
                        perf.perf,
                        &perf.train_perf,
                        &perf.test_perf,
                    )
                    .await
                {
                    // The outcome is known but could not be recorded; fall
                    // back to marking the task failed before surfacing.
                    self.report_learn_failed(&task.key).await;
                    return Err(e.into());
                }
                info!(key = %task.key, perf = perf.perf, "learning task done");
                Ok(())
            }
            Err(err) => {
                self.report_learn_failed(&task.key).await;
                Err(err)
            }
        }
    }

    /// Best-effort `failed` report, logged on failure.
    async fn report_learn_failed(&self, key: &str) {
        let empty = HashMap::new();
        if let Err(e) = self
            .ledger
            .report_learn(key, TaskStatus::Failed, 0.0, &empty, &empty)
            .await
        {
            error!(key, error = %e, "failed to report learn failure to ledger");
        }
    }

    /// The staged learning workflow proper.
    ///
    /// The workspace and every loaded image are torn down before this
    /// returns, whatever the outcome.
    async fn learn_workflow(
        &self,
        task: &LearnUplet,
        cancel: &CancellationToken,
    ) -> Result<Perfuplet, ComputeError> {
        let workspace = TaskWorkspace::open(&self.data_root, task.algo)?;
        let mut images = ImageSet::new(Arc::clone(&self.runtime));

        let result = self
            .learn_stages(task, &workspace, &mut images, cancel)
            .await;

        images.unload_all().await;
        if let Err(e) = workspace.close() {
            warn!(key = %task.key, error = %e, "failed to remove task workspace");
        }
        result
    }

    async fn learn_stages(
        &self,
        task: &LearnUplet,
        workspace: &TaskWorkspace,
        images: &mut ImageSet,
        cancel: &CancellationToken,
    ) -> Result<Perfuplet, ComputeError> {
        // Load the problem-workflow and algo images.
        ensure_live(cancel)?;
        let problem_image = self
            .load_image(
                PROBLEM_IMAGE_PREFIX,
                BlobKind::ProblemWorkflow,
                task.problem,
                images,
            )
            .await?;
        debug!(key = %task.key, image = %problem_image, "problem image loaded");

        ensure_live(cancel)?;
        let algo_image = self
            .load_image(ALGO_IMAGE_PREFIX, BlobKind::Algo, task.algo, images)
            .await?;
        debug!(key = %task.key, image = %algo_image, "algo image loaded");

        // Materialise the starting model when resuming a training chain.
        if task.rank > 0 {
            ensure_live(cancel)?;
            let model_start = task.model_start.ok_or(ComputeError::Validation(
                weft_types::ValidationError::MissingModelStart { rank: task.rank },
            ))?;
            let blob = self.storage.get_blob(BlobKind::Model, model_start).await?;
            unpack_blob(blob, workspace.model_dir()).await?;
        }

        // Materialise the datasets; the train and test sets are staged
        // independently of each other.
        ensure_live(cancel)?;
        self.stage_datasets(&task.train_data, &workspace.train_dir(), cancel)
            .await?;
        self.stage_datasets(&task.test_data, &workspace.test_dir(), cancel)
            .await?;

        // Strip targets from the test data using the problem container.
        ensure_live(cancel)?;
        self.detarget(&problem_image, workspace, cancel).await?;

        // Train.
        ensure_live(cancel)?;
        self.train(&algo_image, workspace, cancel).await?;

        // Score the freshly trained model.
        ensure_live(cancel)?;
        self.compute_perf(&problem_image, workspace, cancel).await?;

        // Pack and upload the new model under its ledger-assigned identity.
        ensure_live(cancel)?;
        let archive = workspace.model_archive_path();
        pack_model(workspace.model_dir(), archive.clone()).await?;

        let algo_info = self.storage.get_algo(task.algo).await?;
        let model = ModelRecord::from_algo(task.model_end, &algo_info);
        let (stream, size) = open_sized(&archive).await?;
        self.storage.post_model(&model, stream, size).await?;
        debug!(key = %task.key, model = %model.uuid, size, "model uploaded");

        // Decode the performance report produced by the perf step.
        self.read_perfuplet(&workspace.perf_dir()).await
    }

    /// Fetch a gzipped image build context and register it in the runtime
    /// as `<prefix>-<uuid>`.
    async fn load_image(
        &self,
        prefix: &str,
        kind: BlobKind,
        uuid: Uuid,
        images: &mut ImageSet,
    ) -> Result<String, ComputeError> {
        let blob = self.storage.get_blob(kind, uuid).await?;
        let name = format!("{prefix}-{uuid}");

        // The blob is the gzipped tar of a build context; un-gzip on the fly.
        let tar: TarStream = Box::new(async_compression::tokio::bufread::GzipDecoder::new(
            tokio::io::BufReader::new(blob),
        ));
        let handle = self.runtime.image_build(&name, tar).await?;
        self.runtime.image_load(&name, handle).await?;
        images.register(name.clone());
        Ok(name)
    }

    /// Stream each dataset blob to `<dir>/<uuid>`.
    async fn stage_datasets(
        &self,
        ids: &[Uuid],
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ComputeError> {
        for id in ids {
            ensure_live(cancel)?;
            let mut blob = self.storage.get_blob(BlobKind::Data, *id).await?;
            let path = dir.join(id.to_string());
            let mut file = tokio::fs::File::create(&path).await?;

            tokio::select! {
                res = tokio::io::copy(&mut blob, &mut file) => { res?; }
                _ = cancel.cancelled() => return Err(ComputeError::Cancelled),
            }
            file.flush().await?;
            debug!(data = %id, path = %path.display(), "dataset staged");
        }
        Ok(())
    }

    /// Copy test data into `untargeted_test/` with targets removed, using
    /// the problem container.
    async fn detarget(
        &self,
        problem_image: &str,
        workspace: &TaskWorkspace,
        cancel: &CancellationToken,
    ) -> Result<(), ComputeError> {
        let argv = string_argv(&["-T", "detarget", "-i", "/hidden_data", "-s", "/submission_data"]);
        let mounts = vec![
            Mount::new(workspace.test_dir(), "/hidden_data/test"),
            Mount::new(workspace.untargeted_test_dir(), "/submission_data/test"),
        ];
        self.runtime
            .run_untrusted(problem_image, &argv, &mounts, true, cancel)
            .await?;
        Ok(())
    }

    /// Launch the algo container's train routine.
    ///
    /// The container is not auto-removed: its outputs are collected from
    /// the model mount afterwards.
    async fn train(
        &self,
        algo_image: &str,
        workspace: &TaskWorkspace,
        cancel: &CancellationToken,
    ) -> Result<(), ComputeError> {
        let argv = string_argv(&["-V", "/data", "-T", "train"]);
        let mounts = vec![
            Mount::new(workspace.train_dir(), "/data/train"),
            Mount::new(workspace.untargeted_test_dir(), "/data/test"),
            Mount::new(workspace.model_dir(), "/data/model"),
        ];
        self.runtime
            .run_untrusted(algo_image, &argv, &mounts, false, cancel)
            .await?;
        Ok(())
    }

    /// Score the model: the problem container compares the untargeted
    /// predictions against the hidden targets and writes the perf report.
    async fn compute_perf(
        &self,
        problem_image: &str,
        workspace: &TaskWorkspace,
        cancel: &CancellationToken,
    ) -> Result<(), ComputeError> {
        let argv = string_argv(&["-T", "perf", "-i", "/hidden_data", "-s", "/submission_data"]);
        let mounts = vec![
            Mount::new(workspace.test_dir(), "/hidden_data/test"),
            Mount::new(workspace.perf_dir(), "/hidden_data/perf"),
            Mount::new(workspace.train_dir(), "/submission_data/train"),
            Mount::new(workspace.untargeted_test_dir(), "/submission_data/test"),
        ];
        self.runtime
            .run_untrusted(problem_image, &argv, &mounts, true, cancel)
            .await?;
        Ok(())
    }

    /// Decode `perf/performance.json`; a missing or malformed report fails
    /// the task.
    async fn read_perfuplet(&self, perf_dir: &Path) -> Result<Perfuplet, ComputeError> {
        let path = perf_dir.join(PERFORMANCE_FILE);
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|e| ComputeError::Perf {
                reason: format!("reading {}: {e}", path.display()),
            })?;
        serde_json::from_slice(&raw).map_err(|e| ComputeError::Perf {
            reason: format!("decoding {}: {e}", path.display()),
        })
    }

    // ── Predict pipeline ─────────────────────────────────────────────────────

    /// Execute one pred-uplet delivery end to end.
    pub async fn handle_pred(
        &self,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), ComputeError> {
        let task: PredUplet = serde_json::from_slice(body)?;
        task.validate()?;
        info!(key = %task.key, model = %task.model, "starting prediction task");

        self.ledger.assign_worker(&task.key, self.id).await?;

        match self.pred_workflow(&task, cancel).await {
            Ok(prediction) => {
                if let Err(e) = self
                    .ledger
                    .report_predict(&task.key, TaskStatus::Done, Some(prediction))
                    .await
                {
                    self.report_pred_failed(&task.key).await;
                    return Err(e.into());
                }
                info!(key = %task.key, %prediction, "prediction task done");
                Ok(())
            }
            Err(err) => {
                self.report_pred_failed(&task.key).await;
                Err(err)
            }
        }
    }

    /// Best-effort `failed` report, logged on failure.
    async fn report_pred_failed(&self, key: &str) {
        if let Err(e) = self
            .ledger
            .report_predict(key, TaskStatus::Failed, None)
            .await
        {
            error!(key, error = %e, "failed to report prediction failure to ledger");
        }
    }

    async fn pred_workflow(
        &self,
        task: &PredUplet,
        cancel: &CancellationToken,
    ) -> Result<Uuid, ComputeError> {
        let workspace = TaskWorkspace::open(&self.data_root, task.model)?;
        let mut images = ImageSet::new(Arc::clone(&self.runtime));

        let result = self
            .pred_stages(task, &workspace, &mut images, cancel)
            .await;

        images.unload_all().await;
        if let Err(e) = workspace.close() {
            warn!(key = %task.key, error = %e, "failed to remove task workspace");
        }
        result
    }

    async fn pred_stages(
        &self,
        task: &PredUplet,
        workspace: &TaskWorkspace,
        images: &mut ImageSet,
        cancel: &CancellationToken,
    ) -> Result<Uuid, ComputeError> {
        // Stage the dataset to predict on.
        ensure_live(cancel)?;
        self.stage_datasets(&[task.data], &workspace.test_dir(), cancel)
            .await?;

        // Materialise the trained model.
        ensure_live(cancel)?;
        let blob = self.storage.get_blob(BlobKind::Model, task.model).await?;
        unpack_blob(blob, workspace.model_dir()).await?;
        normalise_model_file(&workspace.model_dir()).await?;

        // The model's metadata names the algo whose image runs the predict
        // routine.
        ensure_live(cancel)?;
        let model_info = self.storage.get_model(task.model).await?;
        let algo_image = self
            .load_image(ALGO_IMAGE_PREFIX, BlobKind::Algo, model_info.algo, images)
            .await?;

        // Predict.
        ensure_live(cancel)?;
        let argv = string_argv(&["-V", "/data", "-T", "predict"]);
        let mounts = vec![
            Mount::new(workspace.test_dir(), "/data/test"),
            Mount::new(workspace.pred_dir(), "/data/test/pred"),
            Mount::new(workspace.model_dir(), "/data/model"),
        ];
        self.runtime
            .run_untrusted(&algo_image, &argv, &mounts, true, cancel)
            .await?;

        // The container writes its prediction under the dataset's uuid.
        let pred_path = workspace.pred_dir().join(task.data.to_string());
        if !pred_path.exists() {
            return Err(ComputeError::MissingPrediction { data: task.data });
        }

        let prediction = PredictionRecord::new();
        let (stream, size) = open_sized(&pred_path).await?;
        self.storage
            .post_prediction(&prediction, stream, size)
            .await?;
        debug!(key = %task.key, prediction = %prediction.uuid, size, "prediction uploaded");

        Ok(prediction.uuid)
    }
}

// ── Stage helpers ─────────────────────────────────────────────────────────────

fn ensure_live(cancel: &CancellationToken) -> Result<(), ComputeError> {
    if cancel.is_cancelled() {
        Err(ComputeError::Cancelled)
    } else {
        Ok(())
    }
}

fn string_argv(argv: &[&str]) -> Vec<String> {
    argv.iter().map(|s| s.to_string()).collect()
}

/// Unpack a gzipped tar blob into `dir`, bridging the async stream into the
/// sync codec on a blocking thread.
async fn unpack_blob(blob: BlobStream, dir: std::path::PathBuf) -> Result<(), ComputeError> {
    tokio::task::spawn_blocking(move || {
        let reader = SyncIoBridge::new(blob);
        weft_archive::unpack(reader, &dir)
    })
    .await
    .map_err(|e| ComputeError::Blocking {
        reason: e.to_string(),
    })??;
    Ok(())
}

/// Pack the model directory into a tar.gz staged next to the workspace
/// subdirectories.
async fn pack_model(
    model_dir: std::path::PathBuf,
    archive: std::path::PathBuf,
) -> Result<(), ComputeError> {
    tokio::task::spawn_blocking(move || {
        let sink = std::fs::File::create(&archive).map_err(|e| {
            weft_archive::ArchiveError::Io {
                path: archive.clone(),
                source: e,
            }
        })?;
        weft_archive::pack_dir(&model_dir, sink)
    })
    .await
    .map_err(|e| ComputeError::Blocking {
        reason: e.to_string(),
    })??;
    Ok(())
}

/// Open a file for streaming upload together with its exact size.
async fn open_sized(path: &Path) -> Result<(BlobStream, u64), ComputeError> {
    let file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    Ok((Box::new(file), size))
}

/// A model archive must contain exactly one file, which predict containers
/// expect under a canonical name.
async fn normalise_model_file(model_dir: &Path) -> Result<(), ComputeError> {
    let mut entries = tokio::fs::read_dir(model_dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        files.push(entry.path());
    }
    if files.len() != 1 {
        return Err(ComputeError::AmbiguousModel { count: files.len() });
    }
    let target = model_dir.join(TRAINED_MODEL_FILE);
    if files[0] != target {
        tokio::fs::rename(&files[0], &target).await?;
    }
    Ok(())
}
