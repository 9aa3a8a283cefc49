//! Recording mocks of the [`Storage`] and [`Ledger`] traits.
//!
//! These mirror the hand-written API mocks the platform's test fixtures
//! are built on: preloaded blobs, scripted ledger snapshots, and full call
//! recording so tests can assert exactly what a pipeline did.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use weft_types::{AlgoRecord, LearnUplet, ModelRecord, PredictionRecord, TaskStatus};

use crate::storage::{BlobKind, BlobStream, Storage};
use crate::{ClientError, Ledger, LedgerAck};

/// One recorded upload (model or prediction).
#[derive(Debug, Clone)]
pub struct PostedBlob {
    pub uuid: Uuid,
    pub declared_size: u64,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct StorageState {
    blobs: HashMap<(BlobKind, Uuid), Vec<u8>>,
    algos: HashMap<Uuid, AlgoRecord>,
    models: HashMap<Uuid, ModelRecord>,
    posted_models: Vec<PostedBlob>,
    posted_predictions: Vec<PostedBlob>,
}

/// In-memory [`Storage`] with preloaded fixtures.
#[derive(Default)]
pub struct StorageMock {
    state: Mutex<StorageState>,
}

impl StorageMock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_blob(&self, kind: BlobKind, uuid: Uuid, body: impl Into<Vec<u8>>) {
        self.state
            .lock()
            .unwrap()
            .blobs
            .insert((kind, uuid), body.into());
    }

    pub fn put_algo(&self, algo: AlgoRecord) {
        self.state.lock().unwrap().algos.insert(algo.uuid, algo);
    }

    pub fn put_model(&self, model: ModelRecord) {
        self.state.lock().unwrap().models.insert(model.uuid, model);
    }

    pub fn posted_models(&self) -> Vec<PostedBlob> {
        self.state.lock().unwrap().posted_models.clone()
    }

    pub fn posted_predictions(&self) -> Vec<PostedBlob> {
        self.state.lock().unwrap().posted_predictions.clone()
    }
}

async fn drain(body: BlobStream) -> Result<Vec<u8>, ClientError> {
    let mut body = body;
    let mut bytes = Vec::new();
    body.read_to_end(&mut bytes)
        .await
        .map_err(|e| ClientError::Unavailable {
            service: "storage",
            reason: e.to_string(),
        })?;
    Ok(bytes)
}

#[async_trait]
impl Storage for StorageMock {
    async fn get_blob(&self, kind: BlobKind, uuid: Uuid) -> Result<BlobStream, ClientError> {
        let body = self
            .state
            .lock()
            .unwrap()
            .blobs
            .get(&(kind, uuid))
            .cloned()
            .ok_or(ClientError::Rejected {
                service: "storage",
                status: 404,
                reason: format!("no {kind} blob for {uuid}"),
            })?;
        Ok(Box::new(std::io::Cursor::new(body)))
    }

    async fn get_algo(&self, uuid: Uuid) -> Result<AlgoRecord, ClientError> {
        self.state
            .lock()
            .unwrap()
            .algos
            .get(&uuid)
            .cloned()
            .ok_or(ClientError::Rejected {
                service: "storage",
                status: 404,
                reason: format!("no algo {uuid}"),
            })
    }

    async fn get_model(&self, uuid: Uuid) -> Result<ModelRecord, ClientError> {
        self.state
            .lock()
            .unwrap()
            .models
            .get(&uuid)
            .cloned()
            .ok_or(ClientError::Rejected {
                service: "storage",
                status: 404,
                reason: format!("no model {uuid}"),
            })
    }

    async fn post_model(
        &self,
        model: &ModelRecord,
        body: BlobStream,
        size: u64,
    ) -> Result<(), ClientError> {
        let bytes = drain(body).await?;
        self.state.lock().unwrap().posted_models.push(PostedBlob {
            uuid: model.uuid,
            declared_size: size,
            body: bytes,
        });
        Ok(())
    }

    async fn post_prediction(
        &self,
        prediction: &PredictionRecord,
        body: BlobStream,
        size: u64,
    ) -> Result<(), ClientError> {
        let bytes = drain(body).await?;
        self.state
            .lock()
            .unwrap()
            .posted_predictions
            .push(PostedBlob {
                uuid: prediction.uuid,
                declared_size: size,
                body: bytes,
            });
        Ok(())
    }
}

/// One recorded learn report.
#[derive(Debug, Clone)]
pub struct LearnReport {
    pub key: String,
    pub status: TaskStatus,
    pub perf: f64,
    pub train_perf: HashMap<String, f64>,
    pub test_perf: HashMap<String, f64>,
}

/// One recorded prediction report.
#[derive(Debug, Clone)]
pub struct PredictReport {
    pub key: String,
    pub status: TaskStatus,
    pub prediction: Option<Uuid>,
}

#[derive(Default)]
struct LedgerState {
    /// Successive answers to `query_learnuplets`; the last one repeats.
    snapshots: VecDeque<Vec<LearnUplet>>,
    assignments: Vec<(String, Uuid)>,
    learn_reports: Vec<LearnReport>,
    predict_reports: Vec<PredictReport>,
    tx_counter: u64,
    fail_reports: bool,
}

/// In-memory [`Ledger`] with scripted query snapshots.
#[derive(Default)]
pub struct LedgerMock {
    state: Mutex<LedgerState>,
}

impl LedgerMock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one answer for `query_learnuplets`.  Once the queue holds a
    /// single snapshot it is returned for every subsequent query.
    pub fn push_snapshot(&self, uplets: Vec<LearnUplet>) {
        self.state.lock().unwrap().snapshots.push_back(uplets);
    }

    /// Make every report call fail with a transient error.
    pub fn fail_reports(&self, fail: bool) {
        self.state.lock().unwrap().fail_reports = fail;
    }

    pub fn assignments(&self) -> Vec<(String, Uuid)> {
        self.state.lock().unwrap().assignments.clone()
    }

    pub fn learn_reports(&self) -> Vec<LearnReport> {
        self.state.lock().unwrap().learn_reports.clone()
    }

    pub fn predict_reports(&self) -> Vec<PredictReport> {
        self.state.lock().unwrap().predict_reports.clone()
    }
}

fn next_ack(state: &mut LedgerState) -> LedgerAck {
    state.tx_counter += 1;
    LedgerAck {
        txid: format!("tx-{}", state.tx_counter),
        nonce: state.tx_counter,
    }
}

#[async_trait]
impl Ledger for LedgerMock {
    async fn query_learnuplets(&self, _status: TaskStatus) -> Result<Vec<LearnUplet>, ClientError> {
        let mut state = self.state.lock().unwrap();
        if state.snapshots.len() > 1 {
            Ok(state.snapshots.pop_front().unwrap_or_default())
        } else {
            Ok(state.snapshots.front().cloned().unwrap_or_default())
        }
    }

    async fn assign_worker(&self, key: &str, worker: Uuid) -> Result<LedgerAck, ClientError> {
        let mut state = self.state.lock().unwrap();
        state.assignments.push((key.to_owned(), worker));
        Ok(next_ack(&mut state))
    }

    async fn report_learn(
        &self,
        key: &str,
        status: TaskStatus,
        perf: f64,
        train_perf: &HashMap<String, f64>,
        test_perf: &HashMap<String, f64>,
    ) -> Result<LedgerAck, ClientError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_reports {
            return Err(ClientError::Unavailable {
                service: "ledger",
                reason: "scripted failure".to_owned(),
            });
        }
        state.learn_reports.push(LearnReport {
            key: key.to_owned(),
            status,
            perf,
            train_perf: train_perf.clone(),
            test_perf: test_perf.clone(),
        });
        Ok(next_ack(&mut state))
    }

    async fn report_predict(
        &self,
        key: &str,
        status: TaskStatus,
        prediction: Option<Uuid>,
    ) -> Result<LedgerAck, ClientError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_reports {
            return Err(ClientError::Unavailable {
                service: "ledger",
                reason: "scripted failure".to_owned(),
            });
        }
        state.predict_reports.push(PredictReport {
            key: key.to_owned(),
            status,
            prediction,
        });
        Ok(next_ack(&mut state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_mock_round_trips_blobs() {
        let storage = StorageMock::new();
        let uuid = Uuid::new_v4();
        storage.put_blob(BlobKind::Data, uuid, b"payload".to_vec());

        let stream = storage.get_blob(BlobKind::Data, uuid).await.unwrap();
        assert_eq!(drain(stream).await.unwrap(), b"payload");

        let missing = storage.get_blob(BlobKind::Data, Uuid::new_v4()).await;
        assert!(matches!(missing, Err(ClientError::Rejected { status: 404, .. })));
    }

    #[tokio::test]
    async fn ledger_mock_repeats_last_snapshot() {
        let ledger = LedgerMock::new();
        ledger.push_snapshot(vec![]);
        assert!(ledger
            .query_learnuplets(TaskStatus::Todo)
            .await
            .unwrap()
            .is_empty());
        assert!(ledger
            .query_learnuplets(TaskStatus::Todo)
            .await
            .unwrap()
            .is_empty());
    }
}
