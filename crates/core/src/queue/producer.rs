use super::wake::WorkerWaker;
use super::{parse_cron, JobOptions, JobQueue, QueuedJob, RepeatableJob};
use crate::accounts::PlanProvider;
use crate::error::WorkflowError;
use crate::storage::RunStore;
use crate::types::{JobPayload, Plan, RunStatus, WorkflowDefinition, WorkflowRunRecord};
use crate::workflow::validate_definition;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Reasons a workflow is not accepted into the queue
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("Workflow has {operations} operations, plan {plan} allows {limit}")]
    PlanLimitExceeded {
        plan: String,
        operations: usize,
        limit: usize,
    },

    #[error("Plan {0} does not allow workflow execution")]
    ExecutionDisallowed(String),

    #[error(transparent)]
    InvalidWorkflow(#[from] WorkflowError),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Admission-checked entry point into the job queue
pub struct WorkflowProducer {
    queue: JobQueue,
    store: Arc<dyn RunStore>,
    plans: Arc<dyn PlanProvider>,
    waker: Option<Arc<WorkerWaker>>,
}

impl WorkflowProducer {
    pub fn new(queue: JobQueue, store: Arc<dyn RunStore>, plans: Arc<dyn PlanProvider>) -> Self {
        Self {
            queue,
            store,
            plans,
            waker: None,
        }
    }

    /// Try to wake a sleeping worker after every enqueue
    pub fn with_waker(mut self, waker: Arc<WorkerWaker>) -> Self {
        self.waker = Some(waker);
        self
    }

    /// Plan checks run before anything is validated or persisted
    async fn admit(&self, definition: &WorkflowDefinition, user_id: &str) -> Result<Plan, EnqueueError> {
        let plan = self.plans.get_plan(user_id).await?;

        if !plan.execution_allowed {
            return Err(EnqueueError::ExecutionDisallowed(plan.name));
        }
        if definition.operations.len() > plan.max_operations {
            return Err(EnqueueError::PlanLimitExceeded {
                plan: plan.name,
                operations: definition.operations.len(),
                limit: plan.max_operations,
            });
        }

        validate_definition(definition)?;
        Ok(plan)
    }

    fn payload(definition: WorkflowDefinition, user_id: &str, plan: &Plan, cron: Option<String>) -> JobPayload {
        let max_execution_time = definition
            .max_execution_time_ms
            .map_or(plan.max_execution_time, |ms| ms.min(plan.max_execution_time));

        JobPayload {
            workflow: definition,
            user_id: user_id.to_string(),
            max_execution_time: Some(max_execution_time),
            cron,
        }
    }

    /// Enqueue a workflow run for a user and record it as queued
    pub async fn create_workflow_queue(
        &self,
        definition: WorkflowDefinition,
        user_id: &str,
        workflow_record_id: &str,
    ) -> Result<QueuedJob, EnqueueError> {
        let plan = self.admit(&definition, user_id).await?;

        let payload = Self::payload(definition, user_id, &plan, None);
        let job = self.queue.enqueue(payload, JobOptions::default())?;
        self.record_run(&job, workflow_record_id)?;

        tracing::info!(
            "Queued workflow {} for user {} as job {}",
            workflow_record_id,
            user_id,
            job.id
        );

        self.wake_in_background();
        Ok(job)
    }

    /// Register (or re-register) a cron schedule for a workflow
    pub async fn schedule_workflow(
        &self,
        definition: WorkflowDefinition,
        user_id: &str,
        workflow_record_id: &str,
        cron: &str,
    ) -> Result<RepeatableJob, EnqueueError> {
        let plan = self.admit(&definition, user_id).await?;
        parse_cron(cron).map_err(|e| EnqueueError::InvalidSchedule(format!("{:#}", e)))?;

        let payload = Self::payload(definition, user_id, &plan, Some(cron.to_string()));
        let repeatable = self
            .queue
            .add_repeatable(workflow_record_id, cron, payload, Utc::now())?;

        tracing::info!(
            "Scheduled workflow {} ({}), next run at {}",
            workflow_record_id,
            cron,
            repeatable.next_run
        );
        Ok(repeatable)
    }

    /// Enqueue due schedules and record their runs
    pub fn promote_due(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<QueuedJob>> {
        let promoted = self.queue.promote_due_repeatables(now)?;
        for job in &promoted {
            let workflow_id = job
                .repeat_key
                .clone()
                .unwrap_or_else(|| job.payload.workflow.id.clone());
            self.record_run(job, &workflow_id)?;
        }
        Ok(promoted)
    }

    fn record_run(&self, job: &QueuedJob, workflow_record_id: &str) -> anyhow::Result<()> {
        self.store.put_run(&WorkflowRunRecord {
            id: job.id,
            workflow_id: workflow_record_id.to_string(),
            user_id: job.payload.user_id.clone(),
            payload: job.payload.clone(),
            cron: job.payload.cron.clone(),
            status: RunStatus::Queued,
            worker_id: None,
            return_values: None,
            error: None,
            execution_order: vec![],
            created_at: job.enqueued_at,
            started_at: None,
            completed_at: None,
        })
    }

    /// Waking is best effort and never fails the enqueue
    fn wake_in_background(&self) {
        let Some(waker) = self.waker.clone() else {
            return;
        };

        tokio::spawn(async move {
            if let Err(e) = waker.wake().await {
                tracing::warn!("Failed to wake a worker: {:#}", e);
            }
        });
    }
}
