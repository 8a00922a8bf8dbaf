use crate::types::{Credentials, Operation, OperationId, WorkflowDefinition, LEGACY_RESULT_SUFFIX};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

/// A result kept for the final output of a run
#[derive(Debug, Clone)]
pub struct OutputEntry {
    pub value: Arc<Value>,
    pub operation_type: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}

/// Per-run state owned by exactly one runner.
///
/// Intermediate results are cached weakly. A result is pinned by a strong
/// reference only until every declared consumer has picked it up, after which
/// its memory goes away with the last handler that used it. Output results
/// are held strongly until the run returns.
pub struct ExecutionContext {
    credentials: Option<Credentials>,
    cache: HashMap<String, Weak<Value>>,
    pinned: HashMap<String, Arc<Value>>,
    /// Consumers that have not yet resolved each result
    consumers: HashMap<String, usize>,
    outputs: HashMap<String, OutputEntry>,
    output_ids: HashSet<OperationId>,
    executed: HashSet<String>,
}

impl ExecutionContext {
    pub fn new(definition: &WorkflowDefinition, credentials: Option<Credentials>) -> Self {
        let mut consumers: HashMap<String, usize> = HashMap::new();
        for op in &definition.operations {
            for source in &op.sources {
                *consumers.entry(source.base().to_string()).or_default() += 1;
            }
        }

        Self {
            credentials,
            cache: HashMap::new(),
            pinned: HashMap::new(),
            consumers,
            outputs: HashMap::new(),
            output_ids: definition.output_ids(),
            executed: HashSet::new(),
        }
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn is_executed(&self, id: &str) -> bool {
        self.executed.contains(id)
    }

    /// Look up a live cached result, also under the legacy `.tracks` alias
    pub fn lookup(&self, source: &OperationId) -> Option<Arc<Value>> {
        let base = source.base();
        [
            source.as_str().to_string(),
            base.to_string(),
            format!("{}{}", base, LEGACY_RESULT_SUFFIX),
        ]
        .iter()
        .find_map(|key| self.cache.get(key).and_then(Weak::upgrade))
    }

    /// Cache a fresh result and mark the operation executed
    pub fn store(
        &mut self,
        op: &Operation,
        value: Value,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        execution_time_ms: u64,
    ) -> Arc<Value> {
        let id = op.id.as_str().to_string();
        let value = Arc::new(value);

        self.cache.insert(id.clone(), Arc::downgrade(&value));

        // A re-executed result is pinned only for the consumers still waiting
        if self.consumers.get(&id).copied().unwrap_or(0) > 0 {
            self.pinned.insert(id.clone(), value.clone());
        }

        if self.output_ids.contains(&op.id) {
            self.outputs.insert(
                id.clone(),
                OutputEntry {
                    value: value.clone(),
                    operation_type: op.op_type.clone(),
                    started_at,
                    completed_at,
                    execution_time_ms,
                },
            );
        }

        self.executed.insert(id);
        value
    }

    /// One consumer has taken its reference to `source`
    pub fn release(&mut self, source: &OperationId) {
        let base = source.base();
        if let Some(remaining) = self.consumers.get_mut(base) {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.pinned.remove(base);
            }
        }
    }

    /// Move the output results out of the context
    pub fn take_outputs(&mut self) -> HashMap<String, OutputEntry> {
        std::mem::take(&mut self.outputs)
    }

    /// Number of results still held strongly, pinned or output
    pub fn retained(&self) -> usize {
        self.pinned.len() + self.outputs.len()
    }

    /// Drop every cached value and the credentials
    pub fn clear(&mut self) {
        self.cache.clear();
        self.pinned.clear();
        self.outputs.clear();
        self.executed.clear();
        self.credentials = None;
    }
}
