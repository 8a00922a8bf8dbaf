use crate::types::{
    JobId, OperationId, RunStatus, WorkerRecord, WorkerStatus, WorkflowRunRecord,
};
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

const RUNS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");
const WORKERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("workers");

/// Partial update of a run record.
///
/// `None` fields are left untouched. When `prev_state` is set the update only
/// applies if the record is currently in that state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub worker_id: Option<String>,
    pub return_values: Option<Value>,
    pub error: Option<String>,
    pub execution_order: Option<Vec<OperationId>>,
    pub prev_state: Option<RunStatus>,
}

impl RunUpdate {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn expecting(mut self, prev_state: RunStatus) -> Self {
        self.prev_state = Some(prev_state);
        self
    }
}

/// Index store for run and worker records using redb
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create data directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _runs_table = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open runs table")?;
            let _workers_table = write_txn
                .open_table(WORKERS_TABLE)
                .context("Failed to open workers table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Shared handle for other tables living in the same database
    pub fn database(&self) -> Arc<Database> {
        self.db.clone()
    }

    /// Insert or replace a run record
    pub fn put_run(&self, run: &WorkflowRunRecord) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open table")?;

            let key = run.id.to_string();
            let value = serde_json::to_vec(run).context("Failed to serialize run")?;

            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert run")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    /// Get a run by job ID
    pub fn get_run(&self, job_id: &JobId) -> Result<Option<WorkflowRunRecord>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(RUNS_TABLE).context("Failed to open table")?;

        let key = job_id.to_string();
        let value = table.get(key.as_str()).context("Failed to get run")?;

        match value {
            Some(guard) => {
                let run: WorkflowRunRecord = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize run")?;
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    /// List runs, most recent first
    pub fn list_runs(&self) -> Result<Vec<WorkflowRunRecord>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(RUNS_TABLE).context("Failed to open table")?;

        let mut runs = Vec::new();
        for item in table.iter().context("Failed to iterate runs")? {
            let (_key, value) = item.context("Failed to read item")?;
            let run: WorkflowRunRecord = serde_json::from_slice(value.value())
                .context("Failed to deserialize run")?;
            runs.push(run);
        }

        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(runs)
    }

    /// Apply a partial update inside one write transaction.
    /// Returns false when the run is missing or not in `prev_state`.
    pub fn update_workflow_run(&self, job_id: &JobId, update: RunUpdate) -> Result<bool> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let applied = {
            let mut table = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open table")?;

            let key = job_id.to_string();
            let current: Option<WorkflowRunRecord> = match table
                .get(key.as_str())
                .context("Failed to get run")?
            {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).context("Failed to deserialize run")?,
                ),
                None => None,
            };

            match current {
                Some(mut run) if update.prev_state.map_or(true, |prev| run.status == prev) => {
                    let now = chrono::Utc::now();
                    if let Some(status) = update.status {
                        run.status = status;
                        if status == RunStatus::Running && run.started_at.is_none() {
                            run.started_at = Some(now);
                        }
                        if status.is_terminal() {
                            run.completed_at = Some(now);
                        }
                        // Errors of earlier attempts do not outlive a success
                        if status == RunStatus::Completed {
                            run.error = None;
                        }
                    }
                    if let Some(worker_id) = update.worker_id {
                        run.worker_id = Some(worker_id);
                    }
                    if let Some(return_values) = update.return_values {
                        run.return_values = Some(return_values);
                    }
                    if let Some(error) = update.error {
                        run.error = Some(error);
                    }
                    if let Some(order) = update.execution_order {
                        run.execution_order = order;
                    }

                    let value = serde_json::to_vec(&run).context("Failed to serialize run")?;
                    table
                        .insert(key.as_str(), value.as_slice())
                        .context("Failed to update run")?;
                    true
                }
                _ => false,
            }
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(applied)
    }

    /// Insert or replace a worker row, keyed by device hash
    pub fn upsert_worker(&self, worker: &WorkerRecord) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(WORKERS_TABLE)
                .context("Failed to open table")?;

            let value = serde_json::to_vec(worker).context("Failed to serialize worker")?;

            table
                .insert(worker.device_hash.as_str(), value.as_slice())
                .context("Failed to insert worker")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    /// Get a worker by device hash
    pub fn get_worker(&self, device_hash: &str) -> Result<Option<WorkerRecord>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(WORKERS_TABLE)
            .context("Failed to open table")?;

        let value = table.get(device_hash).context("Failed to get worker")?;

        match value {
            Some(guard) => {
                let worker: WorkerRecord = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize worker")?;
                Ok(Some(worker))
            }
            None => Ok(None),
        }
    }

    /// List all workers in join order
    pub fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(WORKERS_TABLE)
            .context("Failed to open table")?;

        let mut workers = Vec::new();
        for item in table.iter().context("Failed to iterate workers")? {
            let (_key, value) = item.context("Failed to read item")?;
            let worker: WorkerRecord = serde_json::from_slice(value.value())
                .context("Failed to deserialize worker")?;
            workers.push(worker);
        }

        workers.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));

        Ok(workers)
    }

    /// Update a worker's status; a missing row is an error
    pub fn set_worker_status(&self, device_hash: &str, status: WorkerStatus) -> Result<()> {
        let mut worker = self
            .get_worker(device_hash)?
            .context("Worker not found")?;

        worker.status = status;
        worker.updated_at = chrono::Utc::now();

        self.upsert_worker(&worker)
    }
}

/// Persistence consumed by the producer and the worker runtime
pub trait RunStore: Send + Sync {
    fn put_run(&self, run: &WorkflowRunRecord) -> Result<()>;

    fn get_run(&self, job_id: &JobId) -> Result<Option<WorkflowRunRecord>>;

    fn update_workflow_run(&self, job_id: &JobId, update: RunUpdate) -> Result<bool>;

    fn upsert_worker(&self, worker: &WorkerRecord) -> Result<()>;

    fn list_workers(&self) -> Result<Vec<WorkerRecord>>;

    fn set_worker_status(&self, device_hash: &str, status: WorkerStatus) -> Result<()>;
}

impl RunStore for RedbStore {
    fn put_run(&self, run: &WorkflowRunRecord) -> Result<()> {
        RedbStore::put_run(self, run)
    }

    fn get_run(&self, job_id: &JobId) -> Result<Option<WorkflowRunRecord>> {
        RedbStore::get_run(self, job_id)
    }

    fn update_workflow_run(&self, job_id: &JobId, update: RunUpdate) -> Result<bool> {
        RedbStore::update_workflow_run(self, job_id, update)
    }

    fn upsert_worker(&self, worker: &WorkerRecord) -> Result<()> {
        RedbStore::upsert_worker(self, worker)
    }

    fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        RedbStore::list_workers(self)
    }

    fn set_worker_status(&self, device_hash: &str, status: WorkerStatus) -> Result<()> {
        RedbStore::set_worker_status(self, device_hash, status)
    }
}
