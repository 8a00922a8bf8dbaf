//! Worker process: claims queued jobs and runs them.

pub mod liveness;
pub mod shrink;

use crate::config::WorkerConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tunegraph_core::accounts::CredentialResolver;
use tunegraph_core::catalog::{CatalogClient, HttpCatalogClient};
use tunegraph_core::operations::OperationRegistry;
use tunegraph_core::queue::{FailOutcome, JobBroker, QueuedJob};
use tunegraph_core::storage::RunUpdate;
use tunegraph_core::workflow::{OperationObserver, Runner};
use tunegraph_core::{
    Credentials, OperationId, OperationTiming, ProgressAck, RunStatus, WorkerRecord, WorkerStatus,
    WorkflowError,
};

use shrink::shrink_payload;

/// Builds a catalog client bound to one user's access token
pub type ClientFactory = Arc<dyn Fn(&str) -> Arc<dyn CatalogClient> + Send + Sync>;

/// Client factory for the HTTP catalog service
pub fn http_clients(base_url: String) -> ClientFactory {
    Arc::new(move |token: &str| {
        Arc::new(HttpCatalogClient::new(base_url.clone(), token)) as Arc<dyn CatalogClient>
    })
}

/// Hex SHA-256 of host name and worker name
pub fn device_hash(host: &str, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update(b":");
    hasher.update(name.as_bytes());
    hex::encode(hasher.finalize())
}

/// Best-effort host name without extra dependencies
pub fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Logs progress of each operation of a job
struct ProgressLog {
    job_id: String,
}

#[async_trait]
impl OperationObserver for ProgressLog {
    async fn on_operation(&self, operation_id: &OperationId, timing: &OperationTiming) -> ProgressAck {
        tracing::debug!(
            "Job {}: operation {} ({}) finished in {}ms",
            self.job_id,
            operation_id,
            timing.operation.op_type,
            timing.execution_time_ms
        );
        ProgressAck::Ok
    }
}

/// Consumes the job queue with bounded concurrency
pub struct WorkerRuntime {
    device_hash: String,
    config: WorkerConfig,
    broker: Arc<dyn JobBroker>,
    registry: Arc<OperationRegistry>,
    credentials: Arc<dyn CredentialResolver>,
    clients: ClientFactory,
    in_flight: Mutex<usize>,
}

impl WorkerRuntime {
    pub fn new(
        device_hash: String,
        config: WorkerConfig,
        broker: Arc<dyn JobBroker>,
        registry: Arc<OperationRegistry>,
        credentials: Arc<dyn CredentialResolver>,
        clients: ClientFactory,
    ) -> Self {
        Self {
            device_hash,
            config,
            broker,
            registry,
            credentials,
            clients,
            in_flight: Mutex::new(0),
        }
    }

    pub fn device_hash(&self) -> &str {
        &self.device_hash
    }

    /// Insert or refresh this worker's row with status idle
    pub async fn register(&self) -> Result<()> {
        let now = Utc::now();
        let joined_at = self
            .broker
            .get_worker(&self.device_hash)
            .await?
            .map_or(now, |w| w.joined_at);

        self.broker
            .upsert_worker(&WorkerRecord {
                device_hash: self.device_hash.clone(),
                name: self.config.name.clone(),
                status: WorkerStatus::Idle,
                concurrency: self.config.concurrency,
                thread_count: std::thread::available_parallelism().map_or(1, |n| n.get()),
                endpoint: self.config.endpoint.clone(),
                joined_at,
                updated_at: now,
            })
            .await?;

        tracing::info!(
            "Worker {} registered ({}), concurrency {}",
            self.config.name,
            self.device_hash,
            self.config.concurrency
        );
        Ok(())
    }

    /// Poll for jobs until `shutdown` fires, then drain and report sleeping
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        self.register().await?;

        let recovered = self.broker.recover(&self.device_hash).await?;
        if recovered > 0 {
            tracing::info!("Requeued {} jobs left active by a previous run", recovered);
        }

        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut jobs: JoinSet<()> = JoinSet::new();
        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    tracing::info!("Worker {} received shutdown signal", self.config.name);
                    break;
                }

                _ = poll.tick() => {}
            }

            while let Some(result) = jobs.try_join_next() {
                if let Err(e) = result {
                    tracing::error!("Job task panicked: {}", e);
                }
            }

            while let Ok(permit) = permits.clone().try_acquire_owned() {
                let job = match self.broker.claim(&self.device_hash).await {
                    Ok(Some(job)) => job,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("Failed to dequeue: {:#}", e);
                        break;
                    }
                };

                let worker = self.clone();
                let token = shutdown.clone();
                jobs.spawn(async move {
                    let _permit = permit;
                    worker.process_job(job, token).await;
                });
            }
        }

        if !jobs.is_empty() {
            tracing::info!("Draining {} in-flight jobs", jobs.len());
        }
        while let Some(result) = jobs.join_next().await {
            if let Err(e) = result {
                tracing::error!("Job task panicked: {}", e);
            }
        }

        self.broker
            .set_worker_status(&self.device_hash, WorkerStatus::Sleeping)
            .await?;
        tracing::info!("Worker {} is sleeping", self.config.name);

        Ok(())
    }

    /// Run one claimed job and settle it in the queue and the run record
    pub async fn process_job(&self, job: QueuedJob, shutdown: CancellationToken) {
        self.job_started().await;
        tracing::info!(
            "Processing job {} (workflow {}, attempt {})",
            job.id,
            job.payload.workflow.id,
            job.attempts_made + 1
        );

        match self.execute_job(&job, shutdown).await {
            Ok(return_values) => self.settle_success(&job, return_values).await,
            Err(e) => self.settle_failure(&job, e).await,
        }

        self.job_finished().await;
    }

    async fn execute_job(&self, job: &QueuedJob, shutdown: CancellationToken) -> Result<serde_json::Value> {
        let payload = &job.payload;

        let claimed = self
            .broker
            .update_run(
                &job.id,
                RunUpdate {
                    status: Some(RunStatus::Running),
                    worker_id: Some(self.device_hash.clone()),
                    ..Default::default()
                }
                .expecting(RunStatus::Queued),
            )
            .await?;
        if !claimed {
            tracing::warn!("Run record of job {} was not queued", job.id);
        }

        let token = self
            .credentials
            .get_access_token(&payload.user_id)
            .await
            .with_context(|| format!("Failed to resolve credentials for user {}", payload.user_id))?;

        let runner = Runner::new(self.registry.clone(), (self.clients)(&token))
            .with_credentials(Credentials {
                user_id: payload.user_id.clone(),
                access_token: token,
            })
            .with_shutdown(shutdown);

        let order = runner.sort_operations(&payload.workflow)?;
        self.broker
            .update_run(
                &job.id,
                RunUpdate {
                    execution_order: Some(order.into_iter().map(|op| op.id).collect()),
                    ..Default::default()
                },
            )
            .await?;

        let timeout_ms = payload
            .max_execution_time
            .unwrap_or(self.config.default_execution_time_ms);
        let progress = ProgressLog {
            job_id: job.id.to_string(),
        };

        let results = runner
            .run_workflow(&payload.workflow, timeout_ms, Some(&progress))
            .await?;

        let value = serde_json::to_value(&results).context("Failed to serialize results")?;
        Ok(shrink_payload(value))
    }

    async fn settle_success(&self, job: &QueuedJob, return_values: serde_json::Value) {
        if let Err(e) = self.broker.complete(&job.id, return_values.clone()).await {
            tracing::error!("Failed to complete job {}: {:#}", job.id, e);
        }

        let update = RunUpdate {
            status: Some(RunStatus::Completed),
            return_values: Some(return_values),
            ..Default::default()
        };
        if let Err(e) = self.broker.update_run(&job.id, update).await {
            tracing::error!("Failed to update run {}: {:#}", job.id, e);
        }

        tracing::info!("Job {} completed", job.id);
    }

    async fn settle_failure(&self, job: &QueuedJob, error: anyhow::Error) {
        let workflow_error = error.downcast_ref::<WorkflowError>();
        let retryable = workflow_error.map_or(true, WorkflowError::is_retryable);
        let reason = format!("{:#}", error);

        let outcome = match self.broker.fail(&job.id, &reason, retryable).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Failed to record failure of job {}: {:#}", job.id, e);
                FailOutcome::Failed
            }
        };

        let status = match outcome {
            FailOutcome::Retrying { available_at } => {
                tracing::warn!("Job {} failed, retrying at {}: {}", job.id, available_at, reason);
                RunStatus::Queued
            }
            FailOutcome::Failed => {
                tracing::error!("Job {} failed: {}", job.id, reason);
                if matches!(workflow_error, Some(WorkflowError::Cancelled)) {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Failed
                }
            }
        };

        let update = RunUpdate {
            status: Some(status),
            error: Some(reason),
            ..Default::default()
        };
        if let Err(e) = self.broker.update_run(&job.id, update).await {
            tracing::error!("Failed to update run {}: {:#}", job.id, e);
        }
    }

    async fn job_started(&self) {
        let first = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            *in_flight += 1;
            *in_flight == 1
        };
        if first {
            self.set_status(WorkerStatus::Working).await;
        }
    }

    async fn job_finished(&self) {
        let last = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            *in_flight = in_flight.saturating_sub(1);
            *in_flight == 0
        };
        if last {
            self.set_status(WorkerStatus::Idle).await;
        }
    }

    async fn set_status(&self, status: WorkerStatus) {
        if let Err(e) = self.broker.set_worker_status(&self.device_hash, status).await {
            tracing::warn!("Failed to set worker status {:?}: {:#}", status, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;
    use tunegraph_core::accounts::{StaticCredentials, StaticPlans};
    use tunegraph_core::catalog::{CatalogError, Page};
    use tunegraph_core::queue::{JobOptions, JobQueue, JobState, LocalBroker, WorkflowProducer};
    use tunegraph_core::storage::RedbStore;
    use tunegraph_core::{JobPayload, Operation, Plan, WorkflowDefinition};

    /// Catalog with one collection whose items carry bulky metadata
    struct StubCatalog;

    #[async_trait]
    impl CatalogClient for StubCatalog {
        async fn collection_items(&self, _id: &str, offset: usize, _limit: usize) -> Result<Page, CatalogError> {
            let items = if offset == 0 {
                vec![json!({"uri": "t:1", "images": [{"url": "x"}]})]
            } else {
                vec![]
            };
            Ok(Page { items, total: Some(1) })
        }

        async fn add_items(&self, _id: &str, _uris: &[String]) -> Result<(), CatalogError> {
            Ok(())
        }

        async fn remove_items(&self, _id: &str, _uris: &[String]) -> Result<(), CatalogError> {
            Ok(())
        }
    }

    struct Fixture {
        _file: NamedTempFile,
        store: Arc<RedbStore>,
        queue: JobQueue,
        producer: Arc<WorkflowProducer>,
        worker: Arc<WorkerRuntime>,
    }

    async fn fixture(tokens: &[(&str, &str)]) -> Fixture {
        let file = NamedTempFile::new().unwrap();
        let store = Arc::new(RedbStore::new(file.path().to_path_buf()).unwrap());
        let queue = JobQueue::new(store.database()).unwrap();
        let producer = Arc::new(WorkflowProducer::new(
            queue.clone(),
            store.clone(),
            Arc::new(StaticPlans::new(Plan::default(), HashMap::new())),
        ));
        let credentials = StaticCredentials::new(
            tokens
                .iter()
                .map(|(u, t)| (u.to_string(), t.to_string()))
                .collect(),
        );
        let clients: ClientFactory = Arc::new(|_token: &str| Arc::new(StubCatalog) as Arc<dyn CatalogClient>);

        let worker = Arc::new(WorkerRuntime::new(
            device_hash("host", "test"),
            WorkerConfig {
                name: "test".to_string(),
                ..Default::default()
            },
            Arc::new(LocalBroker::new(queue.clone(), store.clone())),
            Arc::new(OperationRegistry::with_defaults()),
            Arc::new(credentials),
            clients,
        ));
        worker.register().await.unwrap();

        Fixture {
            _file: file,
            store,
            queue,
            producer,
            worker,
        }
    }

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf-1".to_string(),
            name: "Mix".to_string(),
            operations: vec![
                Operation {
                    id: OperationId::new("src"),
                    op_type: "Source.playlist".to_string(),
                    params: json!({"playlistId": "p1"}),
                    sources: vec![],
                    output: None,
                },
                Operation {
                    id: OperationId::new("top"),
                    op_type: "Filter.limit".to_string(),
                    params: json!({"limit": 10}),
                    sources: vec![OperationId::new("src")],
                    output: None,
                },
            ],
            connections: vec![],
            dryrun: false,
            max_execution_time_ms: None,
        }
    }

    #[test]
    fn test_device_hash_is_stable_hex() {
        let hash = device_hash("host-a", "worker-1");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, device_hash("host-a", "worker-1"));
        assert_ne!(hash, device_hash("host-b", "worker-1"));
    }

    #[tokio::test]
    async fn test_job_completes_with_shrunk_results() {
        let fx = fixture(&[("user-1", "token")]).await;
        let job = fx
            .producer
            .create_workflow_queue(definition(), "user-1", "record-1")
            .await
            .unwrap();

        let claimed = fx.queue.dequeue(fx.worker.device_hash(), Utc::now()).unwrap().unwrap();
        fx.worker.process_job(claimed, CancellationToken::new()).await;

        let run = fx.store.get_run(&job.id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.worker_id.as_deref(), Some(fx.worker.device_hash()));
        assert_eq!(
            run.execution_order,
            vec![OperationId::new("src"), OperationId::new("top")]
        );

        let results = run.return_values.unwrap();
        assert_eq!(results[0]["operationId"], "top");
        assert_eq!(results[0]["result"], json!([{"uri": "t:1"}]));

        assert_eq!(fx.queue.get(&job.id).unwrap().unwrap().state, JobState::Completed);
        let worker = fx.store.get_worker(fx.worker.device_hash()).unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn test_missing_credentials_retries_then_fails() {
        let fx = fixture(&[]).await;
        let job = fx
            .producer
            .create_workflow_queue(definition(), "user-1", "record-1")
            .await
            .unwrap();

        let claimed = fx.queue.dequeue(fx.worker.device_hash(), Utc::now()).unwrap().unwrap();
        fx.worker.process_job(claimed, CancellationToken::new()).await;

        let run = fx.store.get_run(&job.id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert!(run.error.unwrap().contains("user-1"));

        let later = Utc::now() + chrono::Duration::seconds(5);
        let claimed = fx.queue.dequeue(fx.worker.device_hash(), later).unwrap().unwrap();
        fx.worker.process_job(claimed, CancellationToken::new()).await;

        let run = fx.store.get_run(&job.id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(fx.queue.get(&job.id).unwrap().unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_success_after_retry_clears_error() {
        let fx = fixture(&[("user-1", "token")]).await;
        let job = fx
            .producer
            .create_workflow_queue(definition(), "user-1", "record-1")
            .await
            .unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let claimed = fx.queue.dequeue(fx.worker.device_hash(), Utc::now()).unwrap().unwrap();
        fx.worker.process_job(claimed, cancelled).await;

        let run = fx.store.get_run(&job.id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert!(run.error.is_some());

        let later = Utc::now() + chrono::Duration::seconds(5);
        let claimed = fx.queue.dequeue(fx.worker.device_hash(), later).unwrap().unwrap();
        fx.worker.process_job(claimed, CancellationToken::new()).await;

        let run = fx.store.get_run(&job.id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.error, None);
    }

    #[tokio::test]
    async fn test_run_requeues_only_own_active_jobs() {
        let fx = fixture(&[("user-1", "token")]).await;
        let own = fx
            .producer
            .create_workflow_queue(definition(), "user-1", "record-1")
            .await
            .unwrap();
        let foreign = fx
            .producer
            .create_workflow_queue(definition(), "user-1", "record-2")
            .await
            .unwrap();
        fx.queue.dequeue(fx.worker.device_hash(), Utc::now()).unwrap().unwrap();
        fx.queue.dequeue("other-worker", Utc::now()).unwrap().unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        fx.worker.clone().run(shutdown).await.unwrap();

        assert_eq!(fx.queue.get(&own.id).unwrap().unwrap().state, JobState::Waiting);
        assert_eq!(fx.queue.get(&foreign.id).unwrap().unwrap().state, JobState::Active);
    }

    #[tokio::test]
    async fn test_invalid_payload_fails_without_retry() {
        let fx = fixture(&[("user-1", "token")]).await;

        let mut broken = definition();
        broken.operations[1].sources = vec![OperationId::new("nowhere")];
        let job = fx
            .queue
            .enqueue(
                JobPayload {
                    workflow: broken,
                    user_id: "user-1".to_string(),
                    max_execution_time: Some(1000),
                    cron: None,
                },
                JobOptions::default(),
            )
            .unwrap();

        let claimed = fx.queue.dequeue(fx.worker.device_hash(), Utc::now()).unwrap().unwrap();
        fx.worker.process_job(claimed, CancellationToken::new()).await;

        let stored = fx.queue.get(&job.id).unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert!(stored.failed_reason.unwrap().contains("nowhere"));
    }

    #[tokio::test]
    async fn test_run_reports_sleeping_after_shutdown() {
        let fx = fixture(&[("user-1", "token")]).await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        fx.worker.clone().run(shutdown).await.unwrap();

        let worker = fx.store.get_worker(fx.worker.device_hash()).unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Sleeping);
    }
}
