//! Ledger adapter: task queries, worker assignment and outcome reports.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use weft_types::{LearnUplet, TaskStatus};

use crate::ClientError;

/// Receipt for a durable ledger write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerAck {
    pub txid: String,
    pub nonce: u64,
}

/// Query and update task state on the external ledger.
///
/// Reads are best-effort; writes are durable once the call returns `Ok`.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// List learn-uplets currently in `status`.
    async fn query_learnuplets(&self, status: TaskStatus) -> Result<Vec<LearnUplet>, ClientError>;

    /// Claim a task for `worker`; moves it to `pending`.
    async fn assign_worker(&self, key: &str, worker: Uuid) -> Result<LedgerAck, ClientError>;

    /// Report the outcome of a learn task.
    async fn report_learn(
        &self,
        key: &str,
        status: TaskStatus,
        perf: f64,
        train_perf: &HashMap<String, f64>,
        test_perf: &HashMap<String, f64>,
    ) -> Result<LedgerAck, ClientError>;

    /// Report the outcome of a prediction task.
    async fn report_predict(
        &self,
        key: &str,
        status: TaskStatus,
        prediction: Option<Uuid>,
    ) -> Result<LedgerAck, ClientError>;
}

const SERVICE: &str = "ledger";

#[derive(Serialize)]
struct AssignBody {
    worker: Uuid,
}

#[derive(Serialize)]
struct LearnReportBody<'a> {
    status: TaskStatus,
    perf: f64,
    train_perf: &'a HashMap<String, f64>,
    test_perf: &'a HashMap<String, f64>,
}

#[derive(Serialize)]
struct PredictReportBody {
    status: TaskStatus,
    prediction_storage_id: Option<Uuid>,
}

/// reqwest-backed [`Ledger`] client against the orchestrator REST surface.
#[derive(Debug, Clone)]
pub struct LedgerHttp {
    client: reqwest::Client,
    base: String,
    user: String,
    password: String,
}

impl LedgerHttp {
    pub fn new(host: &str, port: u16, user: &str, password: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: format!("http://{host}:{port}"),
            user: user.to_owned(),
            password: password.to_owned(),
        }
    }

    async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<LedgerAck, ClientError> {
        let response = self
            .client
            .post(format!("{}{}", self.base, path))
            .basic_auth(&self.user, Some(&self.password))
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Err(ClientError::from_status(SERVICE, status, reason));
        }
        response.json().await.map_err(|e| ClientError::Decode {
            service: SERVICE,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl Ledger for LedgerHttp {
    async fn query_learnuplets(&self, status: TaskStatus) -> Result<Vec<LearnUplet>, ClientError> {
        let response = self
            .client
            .get(format!("{}/learnuplet", self.base))
            .query(&[("status", status.to_string())])
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(SERVICE, e))?;

        let http_status = response.status();
        if !http_status.is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Err(ClientError::from_status(SERVICE, http_status, reason));
        }
        response.json().await.map_err(|e| ClientError::Decode {
            service: SERVICE,
            reason: e.to_string(),
        })
    }

    async fn assign_worker(&self, key: &str, worker: Uuid) -> Result<LedgerAck, ClientError> {
        debug!(key, %worker, "assigning worker on ledger");
        self.post_json(&format!("/learnuplet/{key}/worker"), &AssignBody { worker })
            .await
    }

    async fn report_learn(
        &self,
        key: &str,
        status: TaskStatus,
        perf: f64,
        train_perf: &HashMap<String, f64>,
        test_perf: &HashMap<String, f64>,
    ) -> Result<LedgerAck, ClientError> {
        debug!(key, %status, perf, "reporting learn outcome to ledger");
        self.post_json(
            &format!("/learnuplet/{key}/perf"),
            &LearnReportBody {
                status,
                perf,
                train_perf,
                test_perf,
            },
        )
        .await
    }

    async fn report_predict(
        &self,
        key: &str,
        status: TaskStatus,
        prediction: Option<Uuid>,
    ) -> Result<LedgerAck, ClientError> {
        debug!(key, %status, "reporting prediction outcome to ledger");
        self.post_json(
            &format!("/preduplet/{key}/done"),
            &PredictReportBody {
                status,
                prediction_storage_id: prediction,
            },
        )
        .await
    }
}
