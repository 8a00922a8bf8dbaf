use super::context::ExecutionContext;
use super::dag;
use super::validate::validate_definition;
use crate::catalog::CatalogClient;
use crate::error::{WorkflowError, WorkflowResult};
use crate::operations::OperationRegistry;
use crate::types::{
    Credentials, Operation, OperationId, OperationResult, OperationTiming, ProgressAck,
    WorkflowDefinition,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Receives progress after every executed operation
#[async_trait]
pub trait OperationObserver: Send + Sync {
    async fn on_operation(&self, operation_id: &OperationId, timing: &OperationTiming)
        -> ProgressAck;
}

/// Deadline and cancellation state of one run
struct RunState {
    deadline: Instant,
    limit_ms: u64,
    cancel: CancellationToken,
}

impl RunState {
    /// Fail if the run may not start new work
    fn check(&self) -> WorkflowResult<()> {
        if Instant::now() >= self.deadline {
            return Err(WorkflowError::Timeout {
                limit_ms: self.limit_ms,
            });
        }
        if self.cancel.is_cancelled() {
            return Err(WorkflowError::Cancelled);
        }
        Ok(())
    }
}

/// Aborts the deadline timer when the run ends
struct TimerGuard(JoinHandle<()>);

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Executes workflow definitions against a registry of handlers
pub struct Runner {
    registry: Arc<OperationRegistry>,
    client: Arc<dyn CatalogClient>,
    credentials: Option<Credentials>,
    shutdown: CancellationToken,
}

impl Runner {
    pub fn new(registry: Arc<OperationRegistry>, client: Arc<dyn CatalogClient>) -> Self {
        Self {
            registry,
            client,
            credentials: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Run on behalf of a user
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Tie runs to an outer cancellation signal (worker shutdown)
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Operations in execution order, for persisting alongside the run
    pub fn sort_operations(&self, definition: &WorkflowDefinition) -> WorkflowResult<Vec<Operation>> {
        dag::sort_operations(definition)
    }

    /// Execute a workflow within `timeout_ms` and return the output results
    /// in execution order.
    pub async fn run_workflow(
        &self,
        definition: &WorkflowDefinition,
        timeout_ms: u64,
        observer: Option<&dyn OperationObserver>,
    ) -> WorkflowResult<Vec<OperationResult>> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let cancel = self.shutdown.child_token();

        let _timer = TimerGuard(tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep_until(deadline).await;
                cancel.cancel();
            }
        }));

        let state = RunState {
            deadline,
            limit_ms: timeout_ms,
            cancel,
        };

        tracing::info!(
            "Running workflow {} ({} operations, timeout {}ms)",
            definition.id,
            definition.operations.len(),
            timeout_ms
        );

        let mut ctx = ExecutionContext::new(definition, self.credentials.clone());
        let result = self.execute(definition, &mut ctx, &state, observer).await;
        ctx.clear();

        match &result {
            Ok(results) => tracing::info!(
                "Workflow {} completed with {} outputs",
                definition.id,
                results.len()
            ),
            Err(e) => tracing::error!("Workflow {} failed: {}", definition.id, e),
        }

        result
    }

    async fn execute(
        &self,
        definition: &WorkflowDefinition,
        ctx: &mut ExecutionContext,
        state: &RunState,
        observer: Option<&dyn OperationObserver>,
    ) -> WorkflowResult<Vec<OperationResult>> {
        state.check()?;

        let sorted = dag::sort_operations(definition)?;
        let sorted_definition = WorkflowDefinition {
            operations: sorted,
            ..definition.clone()
        };
        // The definition may have changed since it was enqueued
        validate_definition(&sorted_definition)?;

        if let Some(credentials) = ctx.credentials() {
            tracing::debug!(
                "Workflow {} runs as user {}",
                definition.id,
                credentials.user_id
            );
        }

        for op in &sorted_definition.operations {
            if ctx.is_executed(op.id.as_str()) {
                continue;
            }
            state.check()?;
            self.execute_operation(&sorted_definition, op, ctx, state, observer)
                .await?;
        }

        let mut outputs = ctx.take_outputs();
        let results = sorted_definition
            .operations
            .iter()
            .filter_map(|op| {
                outputs.remove(op.id.as_str()).map(|entry| OperationResult {
                    operation_id: op.id.clone(),
                    operation_type: entry.operation_type,
                    result: Arc::try_unwrap(entry.value).unwrap_or_else(|shared| (*shared).clone()),
                    started_at: entry.started_at,
                    completed_at: entry.completed_at,
                    execution_time_ms: entry.execution_time_ms,
                })
            })
            .collect();

        Ok(results)
    }

    /// Resolve inputs, dispatch to the handler and cache the result.
    /// Boxed because input resolution may recurse into an upstream operation.
    fn execute_operation<'a>(
        &'a self,
        definition: &'a WorkflowDefinition,
        op: &'a Operation,
        ctx: &'a mut ExecutionContext,
        state: &'a RunState,
        observer: Option<&'a dyn OperationObserver>,
    ) -> BoxFuture<'a, WorkflowResult<Arc<Value>>> {
        Box::pin(async move {
            let mut sources = Vec::with_capacity(op.sources.len());
            for source in &op.sources {
                state.check()?;
                let value = match ctx.lookup(source) {
                    Some(value) => value,
                    None => {
                        let upstream = definition.operation(source.as_str()).ok_or_else(|| {
                            WorkflowError::UnsatisfiableSource {
                                operation: op.id.to_string(),
                                missing: source.to_string(),
                            }
                        })?;
                        tracing::debug!(
                            "Result of {} not cached, executing it before {}",
                            upstream.id,
                            op.id
                        );
                        self.execute_operation(definition, upstream, &mut *ctx, state, observer)
                            .await?
                    }
                };
                ctx.release(source);
                sources.push(value);
            }

            state.check()?;
            let op_type = op.operation_type()?;
            let handler = self.registry.resolve(&op_type)?;
            let params = if definition.dryrun {
                with_dryrun(&op.params)
            } else {
                op.params.clone()
            };

            tracing::debug!("Executing operation {} ({})", op.id, op.op_type);
            let started_at = Utc::now();
            let start = Instant::now();

            let value = handler
                .call(self.client.as_ref(), &sources, &params)
                .await
                .map_err(|e| WorkflowError::operation_failed(op.id.as_str(), e))?;
            drop(sources);

            let execution_time_ms = start.elapsed().as_millis() as u64;
            let completed_at = Utc::now();
            state.check()?;

            let value = ctx.store(op, value, started_at, completed_at, execution_time_ms);

            if let Some(observer) = observer {
                let timing = OperationTiming {
                    started_at,
                    completed_at,
                    execution_time_ms,
                    operation: op.clone(),
                };
                if let ProgressAck::Other(ack) = observer.on_operation(&op.id, &timing).await {
                    tracing::warn!(
                        "Progress update for operation {} not acknowledged: {}",
                        op.id,
                        ack
                    );
                }
            }

            Ok(value)
        })
    }
}

/// Params with `dryrun: true` set, so mutating handlers skip side effects
fn with_dryrun(params: &Value) -> Value {
    let mut map = params.as_object().cloned().unwrap_or_default();
    map.insert("dryrun".to_string(), Value::Bool(true));
    Value::Object(map)
}
