//! HTTP client of the coordinator's queue API.

use crate::api::ErrorResponse;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use tunegraph_core::queue::{FailOutcome, JobBroker, QueuedJob, RepeatableJob};
use tunegraph_core::storage::RunUpdate;
use tunegraph_core::{JobId, WorkerRecord, WorkerStatus, WorkflowDefinition, WorkflowRunRecord};

/// Talks to the process that owns the database
#[derive(Clone)]
pub struct CoordinatorClient {
    http: reqwest::Client,
    base_url: String,
}

impl CoordinatorClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build coordinator HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Queue one run of `definition`
    pub async fn enqueue(
        &self,
        definition: &WorkflowDefinition,
        user_id: &str,
        workflow_record_id: Option<&str>,
    ) -> Result<QueuedJob> {
        let body = json!({
            "workflow": definition,
            "userId": user_id,
            "workflowRecordId": workflow_record_id,
        });
        let response = self.send(self.http.post(self.url("/api/workflows/queue")).json(&body)).await?;
        parse(response).await
    }

    /// Register a cron schedule for `definition`
    pub async fn schedule(
        &self,
        definition: &WorkflowDefinition,
        user_id: &str,
        workflow_record_id: Option<&str>,
        cron: &str,
    ) -> Result<RepeatableJob> {
        let body = json!({
            "workflow": definition,
            "userId": user_id,
            "workflowRecordId": workflow_record_id,
            "cron": cron,
        });
        let response = self
            .send(self.http.post(self.url("/api/workflows/schedule")).json(&body))
            .await?;
        parse(response).await
    }

    pub async fn get_run(&self, job_id: &JobId) -> Result<Option<WorkflowRunRecord>> {
        let response = self
            .send(self.http.get(self.url(&format!("/api/runs/{}", job_id))))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        parse(response).await.map(Some)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        request
            .send()
            .await
            .with_context(|| format!("Failed to reach coordinator at {}", self.base_url))
    }
}

/// Decode a success body or turn the API's error body into an error
async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
    let response = check(response).await?;
    response
        .json()
        .await
        .context("Failed to decode coordinator response")
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = match response.json::<ErrorResponse>().await {
        Ok(ErrorResponse {
            error,
            details: Some(details),
        }) => format!("{}: {}", error, details),
        Ok(ErrorResponse { error, details: None }) => error,
        Err(_) => "no error body".to_string(),
    };
    anyhow::bail!("Coordinator returned {}: {}", status, message)
}

#[async_trait]
impl JobBroker for CoordinatorClient {
    async fn claim(&self, worker_id: &str) -> Result<Option<QueuedJob>> {
        let response = self
            .send(
                self.http
                    .post(self.url("/api/jobs/claim"))
                    .json(&json!({ "workerId": worker_id })),
            )
            .await?;
        parse(response).await
    }

    async fn complete(&self, job_id: &JobId, return_value: Value) -> Result<()> {
        let response = self
            .send(
                self.http
                    .post(self.url(&format!("/api/jobs/{}/complete", job_id)))
                    .json(&json!({ "returnValue": return_value })),
            )
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn fail(&self, job_id: &JobId, reason: &str, retryable: bool) -> Result<FailOutcome> {
        let response = self
            .send(
                self.http
                    .post(self.url(&format!("/api/jobs/{}/fail", job_id)))
                    .json(&json!({ "reason": reason, "retryable": retryable })),
            )
            .await?;
        parse(response).await
    }

    async fn recover(&self, worker_id: &str) -> Result<usize> {
        let response = self
            .send(self.http.post(self.url(&format!("/api/workers/{}/recover", worker_id))))
            .await?;
        let body: Value = parse(response).await?;
        body["recovered"]
            .as_u64()
            .map(|n| n as usize)
            .context("Recover response carries no count")
    }

    async fn update_run(&self, job_id: &JobId, update: RunUpdate) -> Result<bool> {
        let response = self
            .send(
                self.http
                    .patch(self.url(&format!("/api/runs/{}", job_id)))
                    .json(&update),
            )
            .await?;
        let body: Value = parse(response).await?;
        Ok(body["applied"].as_bool().unwrap_or(false))
    }

    async fn upsert_worker(&self, worker: &WorkerRecord) -> Result<()> {
        let response = self
            .send(
                self.http
                    .put(self.url(&format!("/api/workers/{}", worker.device_hash)))
                    .json(worker),
            )
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn get_worker(&self, device_hash: &str) -> Result<Option<WorkerRecord>> {
        let response = self
            .send(self.http.get(self.url(&format!("/api/workers/{}", device_hash))))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        parse(response).await.map(Some)
    }

    async fn set_worker_status(&self, device_hash: &str, status: WorkerStatus) -> Result<()> {
        let response = self
            .send(
                self.http
                    .put(self.url(&format!("/api/workers/{}/status", device_hash)))
                    .json(&json!({ "status": status })),
            )
            .await?;
        check(response).await?;
        Ok(())
    }
}
