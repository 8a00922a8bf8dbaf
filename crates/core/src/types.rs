use crate::error::WorkflowError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Borrow;
use std::collections::HashSet;
use uuid::Uuid;

/// Suffix older definitions append to a source id when they reference the
/// item list of an upstream operation.
pub const LEGACY_RESULT_SUFFIX: &str = ".tracks";

/// Unique identifier for a queued job (also the id of its run record)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Unique identifier for an operation within a workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub String);

impl OperationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id with any legacy `.tracks` suffix removed
    pub fn base(&self) -> &str {
        self.0
            .strip_suffix(LEGACY_RESULT_SUFFIX)
            .unwrap_or(&self.0)
    }
}

impl Borrow<str> for OperationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A workflow: a DAG of typed operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub dryrun: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_execution_time_ms: Option<u64>,
}

impl WorkflowDefinition {
    /// Find an operation by id, accepting the legacy `.tracks` alias
    pub fn operation(&self, id: &str) -> Option<&Operation> {
        let base = id.strip_suffix(LEGACY_RESULT_SUFFIX).unwrap_or(id);
        self.operations.iter().find(|op| op.id.as_str() == base)
    }

    /// Rebuild the connection view from the operations' `sources`
    pub fn derive_connections(&self) -> Vec<Connection> {
        self.operations
            .iter()
            .flat_map(|op| {
                op.sources.iter().map(move |source| Connection {
                    id: format!("{}->{}", source.base(), op.id),
                    source: OperationId::new(source.base()),
                    target: op.id.clone(),
                })
            })
            .collect()
    }

    /// Ids of the operations whose results are returned from a run.
    ///
    /// When any operation sets `output`, exactly the flagged ones are outputs;
    /// otherwise every operation nothing else consumes is.
    pub fn output_ids(&self) -> HashSet<OperationId> {
        if self.operations.iter().any(|op| op.output.is_some()) {
            return self
                .operations
                .iter()
                .filter(|op| op.output == Some(true))
                .map(|op| op.id.clone())
                .collect();
        }

        let consumed: HashSet<&str> = self
            .operations
            .iter()
            .flat_map(|op| op.sources.iter().map(|s| s.base()))
            .collect();

        self.operations
            .iter()
            .filter(|op| !consumed.contains(op.id.as_str()))
            .map(|op| op.id.clone())
            .collect()
    }
}

/// A single typed node of the workflow DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    #[serde(rename = "type")]
    pub op_type: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub sources: Vec<OperationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<bool>,
}

impl Operation {
    /// Root operations take no upstream input
    pub fn is_root(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn operation_type(&self) -> Result<OperationType, WorkflowError> {
        self.op_type.parse()
    }
}

/// Edge view of the DAG, kept consistent with `Operation::sources`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub source: OperationId,
    pub target: OperationId,
}

/// Parsed `Category.method` dispatch key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationType {
    pub category: String,
    pub method: String,
}

impl OperationType {
    pub fn new(category: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            method: method.into(),
        }
    }
}

impl std::str::FromStr for OperationType {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((category, method))
                if !category.is_empty() && !method.is_empty() && !method.contains('.') =>
            {
                Ok(Self::new(category, method))
            }
            _ => Err(WorkflowError::Validation(format!(
                "operation type '{}' is not of the form Category.method",
                s
            ))),
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.category, self.method)
    }
}

/// Result of one executed output operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub operation_id: OperationId,
    pub operation_type: String,
    pub result: Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}

/// Timing metadata handed to progress observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationTiming {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(rename = "executionTime")]
    pub execution_time_ms: u64,
    pub operation: Operation,
}

/// Acknowledgement returned by a progress observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressAck {
    Ok,
    Other(String),
}

/// Payload carried by a queued job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub workflow: WorkflowDefinition,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_execution_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
}

/// Status of a workflow run record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Durable record of one queued workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunRecord {
    pub id: JobId,
    pub workflow_id: String,
    pub user_id: String,
    pub payload: JobPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub return_values: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub execution_order: Vec<OperationId>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Subscription plan limits consulted at enqueue time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub name: String,
    #[serde(default = "default_execution_allowed")]
    pub execution_allowed: bool,
    pub max_execution_time: u64,
    pub max_operations: usize,
}

fn default_execution_allowed() -> bool {
    true
}

impl Default for Plan {
    fn default() -> Self {
        Self {
            name: "free".to_string(),
            execution_allowed: true,
            max_execution_time: 5 * 60 * 1000,
            max_operations: 25,
        }
    }
}

/// Lifecycle status of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Working,
    Sleeping,
}

/// Row describing one worker process, keyed by device hash
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRecord {
    pub device_hash: String,
    pub name: String,
    pub status: WorkerStatus,
    pub concurrency: usize,
    pub thread_count: usize,
    #[serde(default)]
    pub endpoint: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Credentials of the user a run executes on behalf of
#[derive(Clone)]
pub struct Credentials {
    pub user_id: String,
    pub access_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}
