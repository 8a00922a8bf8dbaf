//! Durable job queue on redb with retry, retention and repeatable schedules.

pub mod broker;
pub mod producer;
pub mod wake;

pub use broker::{JobBroker, LocalBroker};
pub use producer::{EnqueueError, WorkflowProducer};
pub use wake::{HttpPinger, WorkerPinger, WorkerWaker};

use crate::types::{JobId, JobPayload};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, Table, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const JOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");
const REPEATABLES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("repeatables");

type JobTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

/// Attempts per job, including the first
pub const DEFAULT_ATTEMPTS: u32 = 2;

/// Base delay for exponential retry back-off
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(2);

/// State of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

/// Options applied when a job is enqueued
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub job_id: Option<JobId>,
    pub attempts: u32,
    pub backoff: Duration,
    pub delay: Option<Duration>,
    pub repeat_key: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            attempts: DEFAULT_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
            delay: None,
            repeat_key: None,
        }
    }
}

/// How long finished jobs are kept
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub completed_age: Duration,
    pub completed_count: usize,
    pub failed_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_age: Duration::from_secs(60 * 60),
            completed_count: 1000,
            failed_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// A job as stored in the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    pub id: JobId,
    pub payload: JobPayload,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub available_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_reason: Option<String>,
    #[serde(default)]
    pub return_value: Option<Value>,
    #[serde(default)]
    pub repeat_key: Option<String>,
    /// Worker holding (or last holding) the claim
    #[serde(default)]
    pub claimed_by: Option<String>,
}

impl QueuedJob {
    fn is_available(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, JobState::Waiting | JobState::Delayed) && self.available_at <= now
    }

    /// Back-off before the next attempt: base * 2^(attempts made - 1)
    pub fn retry_delay(&self) -> Duration {
        let exponent = self.attempts_made.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(1 << exponent))
    }
}

/// What happened to a job reported as failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailOutcome {
    Retrying { available_at: DateTime<Utc> },
    Failed,
}

/// Number of jobs per state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// A cron schedule that enqueues a fresh job every time it fires
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatableJob {
    pub key: String,
    pub pattern: String,
    pub payload: JobPayload,
    pub next_run: DateTime<Utc>,
}

/// Parse a cron pattern; classic five-field patterns get a seconds field
pub fn parse_cron(pattern: &str) -> Result<cron::Schedule> {
    let normalized = if pattern.split_whitespace().count() == 5 {
        format!("0 {}", pattern.trim())
    } else {
        pattern.trim().to_string()
    };
    cron::Schedule::from_str(&normalized)
        .with_context(|| format!("Invalid cron pattern '{}'", pattern))
}

fn next_fire(schedule: &cron::Schedule, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    schedule
        .after(&after)
        .next()
        .context("Cron pattern has no upcoming run")
}

/// Durable queue sharing the run store's database
#[derive(Clone)]
pub struct JobQueue {
    db: Arc<Database>,
    retention: RetentionPolicy,
}

impl JobQueue {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _jobs_table = write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open jobs table")?;
            let _repeatables_table = write_txn
                .open_table(REPEATABLES_TABLE)
                .context("Failed to open repeatables table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self {
            db,
            retention: RetentionPolicy::default(),
        })
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Add a job to the queue
    pub fn enqueue(&self, payload: JobPayload, options: JobOptions) -> Result<QueuedJob> {
        let now = Utc::now();
        let job = new_job(payload, options, now);

        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open table")?;
            write_job(&mut table, &job)?;
        }
        write_txn.commit().context("Failed to commit")?;

        tracing::debug!("Enqueued job {} ({:?})", job.id, job.state);
        Ok(job)
    }

    /// Get a job by ID
    pub fn get(&self, job_id: &JobId) -> Result<Option<QueuedJob>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(JOBS_TABLE).context("Failed to open table")?;

        let key = job_id.to_string();
        let value = table.get(key.as_str()).context("Failed to get job")?;

        match value {
            Some(guard) => {
                let job: QueuedJob =
                    serde_json::from_slice(guard.value()).context("Failed to deserialize job")?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Claim the oldest available job for `worker_id`. The claim happens
    /// inside one write transaction, so two consumers never receive the same job.
    pub fn dequeue(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<QueuedJob>> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let claimed = {
            let mut table = write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open table")?;

            let mut next: Option<QueuedJob> = None;
            for job in read_jobs(&table)? {
                if !job.is_available(now) {
                    continue;
                }
                let older = next.as_ref().map_or(true, |n| {
                    (job.available_at, job.enqueued_at) < (n.available_at, n.enqueued_at)
                });
                if older {
                    next = Some(job);
                }
            }

            match next {
                Some(mut job) => {
                    job.state = JobState::Active;
                    job.claimed_by = Some(worker_id.to_string());
                    write_job(&mut table, &job)?;
                    Some(job)
                }
                None => None,
            }
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(claimed)
    }

    /// Mark an active job completed and apply completed-job retention
    pub fn complete(&self, job_id: &JobId, return_value: Value, now: DateTime<Utc>) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open table")?;

            let mut job = load_job(&table, job_id)?;
            job.state = JobState::Completed;
            job.finished_at = Some(now);
            job.return_value = Some(return_value);
            job.failed_reason = None;
            write_job(&mut table, &job)?;

            trim(
                &mut table,
                JobState::Completed,
                self.retention.completed_age,
                Some(self.retention.completed_count),
                now,
            )?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    /// Record a failed attempt. Retryable failures are delayed with
    /// exponential back-off until the attempts run out.
    pub fn fail(
        &self,
        job_id: &JobId,
        reason: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let outcome = {
            let mut table = write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open table")?;

            let mut job = load_job(&table, job_id)?;
            job.attempts_made += 1;
            job.failed_reason = Some(reason.to_string());

            let outcome = if retryable && job.attempts_made < job.max_attempts {
                let delay = chrono::Duration::from_std(job.retry_delay())
                    .context("Retry delay out of range")?;
                job.state = JobState::Delayed;
                job.available_at = now + delay;
                job.claimed_by = None;
                FailOutcome::Retrying {
                    available_at: job.available_at,
                }
            } else {
                job.state = JobState::Failed;
                job.finished_at = Some(now);
                FailOutcome::Failed
            };
            write_job(&mut table, &job)?;

            if outcome == FailOutcome::Failed {
                trim(&mut table, JobState::Failed, self.retention.failed_age, None, now)?;
            }
            outcome
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(outcome)
    }

    /// Put jobs `worker_id` left active (it crashed mid-run) back in line.
    /// Claims of other workers are left alone.
    pub fn recover_active(&self, worker_id: &str) -> Result<usize> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let recovered = {
            let mut table = write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open table")?;

            let stale: Vec<QueuedJob> = read_jobs(&table)?
                .into_iter()
                .filter(|job| {
                    job.state == JobState::Active && job.claimed_by.as_deref() == Some(worker_id)
                })
                .collect();
            for mut job in stale.iter().cloned() {
                job.state = JobState::Waiting;
                job.claimed_by = None;
                write_job(&mut table, &job)?;
            }
            stale.len()
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(recovered)
    }

    /// Count jobs per state
    pub fn counts(&self) -> Result<JobCounts> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(JOBS_TABLE).context("Failed to open table")?;

        let mut counts = JobCounts::default();
        for job in read_jobs(&table)? {
            match job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    /// Register a repeatable schedule, replacing any schedule under the same key
    pub fn add_repeatable(
        &self,
        key: &str,
        pattern: &str,
        payload: JobPayload,
        now: DateTime<Utc>,
    ) -> Result<RepeatableJob> {
        let schedule = parse_cron(pattern)?;
        let repeatable = RepeatableJob {
            key: key.to_string(),
            pattern: pattern.to_string(),
            payload,
            next_run: next_fire(&schedule, now)?,
        };

        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(REPEATABLES_TABLE)
                .context("Failed to open table")?;

            let replaced = table
                .remove(key)
                .context("Failed to remove repeatable")?
                .is_some();
            if replaced {
                tracing::debug!("Replaced existing schedule for {}", key);
            }

            let value = serde_json::to_vec(&repeatable).context("Failed to serialize repeatable")?;
            table
                .insert(key, value.as_slice())
                .context("Failed to insert repeatable")?;
        }
        write_txn.commit().context("Failed to commit")?;

        Ok(repeatable)
    }

    /// Remove a repeatable schedule; returns whether one existed
    pub fn remove_repeatable(&self, key: &str) -> Result<bool> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let removed = {
            let mut table = write_txn
                .open_table(REPEATABLES_TABLE)
                .context("Failed to open table")?;
            let removed = table
                .remove(key)
                .context("Failed to remove repeatable")?
                .is_some();
            removed
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(removed)
    }

    /// List repeatable schedules
    pub fn list_repeatables(&self) -> Result<Vec<RepeatableJob>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(REPEATABLES_TABLE)
            .context("Failed to open table")?;

        let mut repeatables = Vec::new();
        for item in table.iter().context("Failed to iterate repeatables")? {
            let (_key, value) = item.context("Failed to read item")?;
            let repeatable: RepeatableJob = serde_json::from_slice(value.value())
                .context("Failed to deserialize repeatable")?;
            repeatables.push(repeatable);
        }
        Ok(repeatables)
    }

    /// Enqueue one job for every schedule that is due and advance it
    pub fn promote_due_repeatables(&self, now: DateTime<Utc>) -> Result<Vec<QueuedJob>> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let promoted = {
            let mut repeatables = write_txn
                .open_table(REPEATABLES_TABLE)
                .context("Failed to open repeatables table")?;
            let mut jobs = write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open jobs table")?;

            let mut due = Vec::new();
            for item in repeatables.iter().context("Failed to iterate repeatables")? {
                let (_key, value) = item.context("Failed to read item")?;
                let repeatable: RepeatableJob = serde_json::from_slice(value.value())
                    .context("Failed to deserialize repeatable")?;
                if repeatable.next_run <= now {
                    due.push(repeatable);
                }
            }

            let mut promoted = Vec::with_capacity(due.len());
            for mut repeatable in due {
                let options = JobOptions {
                    repeat_key: Some(repeatable.key.clone()),
                    ..Default::default()
                };
                let job = new_job(repeatable.payload.clone(), options, now);
                write_job(&mut jobs, &job)?;

                repeatable.next_run = next_fire(&parse_cron(&repeatable.pattern)?, now)?;
                let value =
                    serde_json::to_vec(&repeatable).context("Failed to serialize repeatable")?;
                repeatables
                    .insert(repeatable.key.as_str(), value.as_slice())
                    .context("Failed to update repeatable")?;

                tracing::info!("Promoted schedule {} to job {}", repeatable.key, job.id);
                promoted.push(job);
            }
            promoted
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(promoted)
    }
}

fn new_job(payload: JobPayload, options: JobOptions, now: DateTime<Utc>) -> QueuedJob {
    let (state, available_at) = match options.delay.and_then(|d| chrono::Duration::from_std(d).ok()) {
        Some(delay) if delay > chrono::Duration::zero() => (JobState::Delayed, now + delay),
        _ => (JobState::Waiting, now),
    };

    QueuedJob {
        id: options.job_id.unwrap_or_default(),
        payload,
        state,
        attempts_made: 0,
        max_attempts: options.attempts.max(1),
        backoff_ms: options.backoff.as_millis() as u64,
        available_at,
        enqueued_at: now,
        finished_at: None,
        failed_reason: None,
        return_value: None,
        repeat_key: options.repeat_key,
        claimed_by: None,
    }
}

fn write_job(table: &mut JobTable<'_>, job: &QueuedJob) -> Result<()> {
    let key = job.id.to_string();
    let value = serde_json::to_vec(job).context("Failed to serialize job")?;
    table
        .insert(key.as_str(), value.as_slice())
        .context("Failed to insert job")?;
    Ok(())
}

fn load_job(table: &impl ReadableTable<&'static str, &'static [u8]>, job_id: &JobId) -> Result<QueuedJob> {
    let key = job_id.to_string();
    let guard = table
        .get(key.as_str())
        .context("Failed to get job")?
        .with_context(|| format!("Job {} not found", job_id))?;
    serde_json::from_slice(guard.value()).context("Failed to deserialize job")
}

fn read_jobs(table: &impl ReadableTable<&'static str, &'static [u8]>) -> Result<Vec<QueuedJob>> {
    let mut jobs = Vec::new();
    for item in table.iter().context("Failed to iterate jobs")? {
        let (_key, value) = item.context("Failed to read item")?;
        let job: QueuedJob =
            serde_json::from_slice(value.value()).context("Failed to deserialize job")?;
        jobs.push(job);
    }
    Ok(jobs)
}

/// Drop finished jobs in `state` older than `max_age`, then keep at most
/// `max_count` of the newest.
fn trim(
    table: &mut JobTable<'_>,
    state: JobState,
    max_age: Duration,
    max_count: Option<usize>,
    now: DateTime<Utc>,
) -> Result<usize> {
    let cutoff = now - chrono::Duration::from_std(max_age).context("Retention age out of range")?;

    let mut finished: Vec<QueuedJob> = read_jobs(&*table)?
        .into_iter()
        .filter(|job| job.state == state)
        .collect();
    finished.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));

    let mut removed = 0;
    for (position, job) in finished.iter().enumerate() {
        let expired = job.finished_at.map_or(false, |at| at < cutoff);
        let over_count = max_count.map_or(false, |max| position >= max);
        if expired || over_count {
            let key = job.id.to_string();
            table.remove(key.as_str()).context("Failed to remove job")?;
            removed += 1;
        }
    }

    if removed > 0 {
        tracing::debug!("Trimmed {} {:?} jobs", removed, state);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RedbStore;
    use crate::types::WorkflowDefinition;
    use tempfile::NamedTempFile;

    fn payload(workflow_id: &str) -> JobPayload {
        JobPayload {
            workflow: WorkflowDefinition {
                id: workflow_id.to_string(),
                name: "Test".to_string(),
                operations: vec![],
                connections: vec![],
                dryrun: false,
                max_execution_time_ms: None,
            },
            user_id: "user-1".to_string(),
            max_execution_time: None,
            cron: None,
        }
    }

    fn queue(file: &NamedTempFile) -> JobQueue {
        let store = RedbStore::new(file.path().to_path_buf()).unwrap();
        JobQueue::new(store.database()).unwrap()
    }

    #[test]
    fn test_dequeue_claims_oldest_once() {
        let file = NamedTempFile::new().unwrap();
        let queue = queue(&file);

        let first = queue.enqueue(payload("a"), JobOptions::default()).unwrap();
        let second = queue.enqueue(payload("b"), JobOptions::default()).unwrap();
        let now = Utc::now();

        assert_eq!(queue.dequeue("w1", now).unwrap().unwrap().id, first.id);
        assert_eq!(queue.dequeue("w1", now).unwrap().unwrap().id, second.id);
        assert!(queue.dequeue("w1", now).unwrap().is_none());
        assert_eq!(queue.counts().unwrap().active, 2);
    }

    #[test]
    fn test_retry_with_exponential_backoff_then_fail() {
        let file = NamedTempFile::new().unwrap();
        let queue = queue(&file);

        let job = queue.enqueue(payload("a"), JobOptions::default()).unwrap();
        let now = Utc::now();
        queue.dequeue("w1", now).unwrap().unwrap();

        let outcome = queue.fail(&job.id, "Operation x failed", true, now).unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                available_at: now + chrono::Duration::seconds(2)
            }
        );
        assert!(queue.dequeue("w1", now).unwrap().is_none());

        let later = now + chrono::Duration::seconds(3);
        let retried = queue.dequeue("w1", later).unwrap().unwrap();
        assert_eq!(retried.attempts_made, 1);

        let outcome = queue.fail(&job.id, "Operation x failed", true, later).unwrap();
        assert_eq!(outcome, FailOutcome::Failed);

        let stored = queue.get(&job.id).unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.failed_reason.as_deref(), Some("Operation x failed"));
    }

    #[test]
    fn test_non_retryable_failure_is_final() {
        let file = NamedTempFile::new().unwrap();
        let queue = queue(&file);

        let job = queue.enqueue(payload("a"), JobOptions::default()).unwrap();
        queue.dequeue("w1", Utc::now()).unwrap();
        let outcome = queue.fail(&job.id, "Invalid workflow", false, Utc::now()).unwrap();
        assert_eq!(outcome, FailOutcome::Failed);
    }

    #[test]
    fn test_completed_retention() {
        let file = NamedTempFile::new().unwrap();
        let queue = queue(&file).with_retention(RetentionPolicy {
            completed_age: Duration::from_secs(3600),
            completed_count: 2,
            failed_age: Duration::from_secs(3600),
        });

        let now = Utc::now();
        let mut ids = Vec::new();
        for i in 0..3 {
            let job = queue.enqueue(payload(&format!("wf-{i}")), JobOptions::default()).unwrap();
            // Strictly after the enqueue stamped `available_at`
            let at = now + chrono::Duration::seconds(i + 1);
            assert_eq!(queue.dequeue("w1", at).unwrap().unwrap().id, job.id);
            queue.complete(&job.id, Value::Null, at).unwrap();
            ids.push(job.id);
        }

        assert!(queue.get(&ids[0]).unwrap().is_none());
        assert_eq!(queue.counts().unwrap().completed, 2);

        // Completing much later expires everything older than an hour
        let job = queue.enqueue(payload("late"), JobOptions::default()).unwrap();
        let later = now + chrono::Duration::hours(2);
        queue.dequeue("w1", later).unwrap().unwrap();
        queue.complete(&job.id, Value::Null, later).unwrap();
        assert_eq!(queue.counts().unwrap().completed, 1);
    }

    #[test]
    fn test_repeatable_replaces_existing_schedule() {
        let file = NamedTempFile::new().unwrap();
        let queue = queue(&file);
        let now = Utc::now();

        queue.add_repeatable("wf-1", "*/5 * * * *", payload("wf-1"), now).unwrap();
        queue.add_repeatable("wf-1", "0 * * * *", payload("wf-1"), now).unwrap();

        let repeatables = queue.list_repeatables().unwrap();
        assert_eq!(repeatables.len(), 1);
        assert_eq!(repeatables[0].pattern, "0 * * * *");

        assert!(queue.remove_repeatable("wf-1").unwrap());
        assert!(!queue.remove_repeatable("wf-1").unwrap());
    }

    #[test]
    fn test_promote_due_repeatables() {
        let file = NamedTempFile::new().unwrap();
        let queue = queue(&file);
        let now = Utc::now();

        let repeatable = queue.add_repeatable("wf-1", "* * * * *", payload("wf-1"), now).unwrap();
        assert!(queue.promote_due_repeatables(now).unwrap().is_empty());

        let fire_at = repeatable.next_run;
        let promoted = queue.promote_due_repeatables(fire_at).unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].repeat_key.as_deref(), Some("wf-1"));
        assert!(queue.list_repeatables().unwrap()[0].next_run > fire_at);
        assert!(queue.promote_due_repeatables(fire_at).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_cron_rejected() {
        assert!(parse_cron("not a cron").is_err());
        assert!(parse_cron("*/15 * * * *").is_ok());
        assert!(parse_cron("0 */15 * * * *").is_ok());
    }

    #[test]
    fn test_recover_active_jobs() {
        let file = NamedTempFile::new().unwrap();
        let queue = queue(&file);

        let mine = queue.enqueue(payload("a"), JobOptions::default()).unwrap();
        let theirs = queue.enqueue(payload("b"), JobOptions::default()).unwrap();
        let now = Utc::now();
        assert_eq!(queue.dequeue("w1", now).unwrap().unwrap().id, mine.id);
        assert_eq!(queue.dequeue("w2", now).unwrap().unwrap().id, theirs.id);

        assert_eq!(queue.recover_active("w1").unwrap(), 1);
        let counts = queue.counts().unwrap();
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.active, 1);
        assert_eq!(queue.get(&theirs.id).unwrap().unwrap().claimed_by.as_deref(), Some("w2"));
        assert_eq!(queue.get(&mine.id).unwrap().unwrap().claimed_by, None);
    }
}
