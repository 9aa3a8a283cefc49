use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Storage metadata for a submitted algorithm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgoRecord {
    pub uuid: Uuid,
    #[serde(default)]
    pub name: String,
}

/// Storage metadata for a trained model artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    pub uuid: Uuid,
    /// Algorithm the model was trained with; resolving it yields the image
    /// to run for prediction.
    pub algo: Uuid,
    #[serde(default)]
    pub name: String,
}

impl ModelRecord {
    /// Synthesise the record for a freshly trained model.
    ///
    /// `uuid` is the learn-uplet's `model_end`, which the platform
    /// guarantees unique at completion time.
    pub fn from_algo(uuid: Uuid, algo: &AlgoRecord) -> Self {
        Self {
            uuid,
            algo: algo.uuid,
            name: algo.name.clone(),
        }
    }
}

/// Storage metadata for an uploaded prediction blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub uuid: Uuid,
}

impl PredictionRecord {
    /// Allocate a fresh storage identifier for a prediction.
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
        }
    }
}

impl Default for PredictionRecord {
    fn default() -> Self {
        Self::new()
    }
}
