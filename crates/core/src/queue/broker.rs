//! Queue access for workers.
//!
//! Only one process may open the redb file, so workers never touch the
//! database themselves. They go through a [`JobBroker`]: the coordinator
//! process uses [`LocalBroker`] directly and exposes it over HTTP, other
//! processes talk to it through a remote implementation.

use super::{FailOutcome, JobQueue, QueuedJob};
use crate::storage::{RedbStore, RunUpdate};
use crate::types::{JobId, WorkerRecord, WorkerStatus};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

/// Job and worker bookkeeping a worker needs
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Claim the oldest available job for `worker_id`
    async fn claim(&self, worker_id: &str) -> Result<Option<QueuedJob>>;

    async fn complete(&self, job_id: &JobId, return_value: Value) -> Result<()>;

    async fn fail(&self, job_id: &JobId, reason: &str, retryable: bool) -> Result<FailOutcome>;

    /// Requeue jobs `worker_id` claimed before it last stopped
    async fn recover(&self, worker_id: &str) -> Result<usize>;

    async fn update_run(&self, job_id: &JobId, update: RunUpdate) -> Result<bool>;

    async fn upsert_worker(&self, worker: &WorkerRecord) -> Result<()>;

    async fn get_worker(&self, device_hash: &str) -> Result<Option<WorkerRecord>>;

    async fn set_worker_status(&self, device_hash: &str, status: WorkerStatus) -> Result<()>;
}

/// Broker backed by the database of this process
#[derive(Clone)]
pub struct LocalBroker {
    queue: JobQueue,
    store: Arc<RedbStore>,
}

impl LocalBroker {
    pub fn new(queue: JobQueue, store: Arc<RedbStore>) -> Self {
        Self { queue, store }
    }
}

#[async_trait]
impl JobBroker for LocalBroker {
    async fn claim(&self, worker_id: &str) -> Result<Option<QueuedJob>> {
        self.queue.dequeue(worker_id, Utc::now())
    }

    async fn complete(&self, job_id: &JobId, return_value: Value) -> Result<()> {
        self.queue.complete(job_id, return_value, Utc::now())
    }

    async fn fail(&self, job_id: &JobId, reason: &str, retryable: bool) -> Result<FailOutcome> {
        self.queue.fail(job_id, reason, retryable, Utc::now())
    }

    async fn recover(&self, worker_id: &str) -> Result<usize> {
        self.queue.recover_active(worker_id)
    }

    async fn update_run(&self, job_id: &JobId, update: RunUpdate) -> Result<bool> {
        self.store.update_workflow_run(job_id, update)
    }

    async fn upsert_worker(&self, worker: &WorkerRecord) -> Result<()> {
        self.store.upsert_worker(worker)
    }

    async fn get_worker(&self, device_hash: &str) -> Result<Option<WorkerRecord>> {
        self.store.get_worker(device_hash)
    }

    async fn set_worker_status(&self, device_hash: &str, status: WorkerStatus) -> Result<()> {
        self.store.set_worker_status(device_hash, status)
    }
}
