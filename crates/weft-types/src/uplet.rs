use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{TaskStatus, ValidationError};

/// An atomic description of one training task, as published on the ledger.
///
/// `status` stays a plain string on the wire: an unknown status must
/// surface as a *validation* failure (HTTP 400 "Invalid learn-uplet"), not
/// as a JSON decode failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnUplet {
    /// Stable identifier of the task on the ledger.
    pub key: String,
    /// Problem workflow whose container drives detarget/perf.
    pub problem: Uuid,
    /// Submitted algorithm to train.
    pub algo: Uuid,
    /// Model to warm-start from; required (and non-nil) when `rank` > 0.
    #[serde(default)]
    pub model_start: Option<Uuid>,
    /// Identifier under which the trained model is uploaded.
    pub model_end: Uuid,
    /// Position of this task in its training chain.
    #[serde(default)]
    pub rank: u32,
    pub train_data: Vec<Uuid>,
    pub test_data: Vec<Uuid>,
    pub status: String,
    #[serde(default)]
    pub worker: Option<Uuid>,
    /// Aggregate performance, filled on completion.
    #[serde(default)]
    pub perf: Option<f64>,
    #[serde(default)]
    pub train_perf: Option<HashMap<String, f64>>,
    #[serde(default)]
    pub test_perf: Option<HashMap<String, f64>>,
    #[serde(default)]
    pub timestamp_creation: Option<i64>,
    #[serde(default)]
    pub timestamp_done: Option<i64>,
}

impl LearnUplet {
    /// Re-run the data-model invariants.
    ///
    /// Rejects malformed tasks before any side effect; pipelines call this
    /// again defensively even though the ingestion API validated already.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.key.is_empty() {
            return Err(ValidationError::MissingField { field: "key" });
        }
        if self.problem.is_nil() {
            return Err(ValidationError::MissingField { field: "problem" });
        }
        if self.algo.is_nil() {
            return Err(ValidationError::MissingField { field: "algo" });
        }
        if self.model_end.is_nil() {
            return Err(ValidationError::MissingField { field: "model_end" });
        }

        let status = TaskStatus::parse(&self.status)?;
        if !matches!(status, TaskStatus::Todo) && self.worker.is_none() {
            return Err(ValidationError::MissingWorker {
                status: self.status.clone(),
            });
        }

        // rank 0 tasks train from scratch; any model_start they carry is
        // simply ignored.
        if self.rank > 0 && !self.model_start.is_some_and(|m| !m.is_nil()) {
            return Err(ValidationError::MissingModelStart { rank: self.rank });
        }

        if self.train_data.is_empty() {
            return Err(ValidationError::EmptyDataSet { field: "train_data" });
        }
        if self.test_data.is_empty() {
            return Err(ValidationError::EmptyDataSet { field: "test_data" });
        }
        if let Some(shared) = self.train_data.iter().find(|u| self.test_data.contains(u)) {
            return Err(ValidationError::OverlappingData { uuid: *shared });
        }

        Ok(())
    }
}

/// An atomic description of one prediction task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredUplet {
    pub key: String,
    /// Trained model to predict with; its metadata resolves the algo image.
    pub model: Uuid,
    /// Dataset to predict on.
    pub data: Uuid,
    pub problem: Uuid,
    pub status: String,
    #[serde(default)]
    pub worker: Option<Uuid>,
    /// Storage identifier of the uploaded prediction, filled on completion.
    #[serde(default)]
    pub prediction_storage_id: Option<Uuid>,
    #[serde(default)]
    pub timestamp_request: Option<i64>,
    #[serde(default)]
    pub timestamp_done: Option<i64>,
}

impl PredUplet {
    /// Re-run the data-model invariants.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.key.is_empty() {
            return Err(ValidationError::MissingField { field: "key" });
        }
        if self.model.is_nil() {
            return Err(ValidationError::MissingField { field: "model" });
        }
        if self.data.is_nil() {
            return Err(ValidationError::MissingField { field: "data" });
        }
        if self.problem.is_nil() {
            return Err(ValidationError::MissingField { field: "problem" });
        }
        let status = TaskStatus::parse(&self.status)?;
        if !matches!(status, TaskStatus::Todo) && self.worker.is_none() {
            return Err(ValidationError::MissingWorker {
                status: self.status.clone(),
            });
        }
        Ok(())
    }
}
