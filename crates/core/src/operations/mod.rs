//! Operation registry and the built-in operation handlers.

mod combiner;
mod filter;
mod order;
mod playlist;
mod source;

pub use combiner::{Alternate, Push};
pub use filter::{Dedupe, Limit, Match};
pub use order::{Reverse, Sort};
pub use playlist::{Append, Replace};
pub use source::{Items, PlaylistItems};

use crate::catalog::CatalogClient;
use crate::error::{WorkflowError, WorkflowResult};
use crate::types::OperationType;
use crate::workflow::schema::OperationSchema;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Uniform handler signature every operation implements.
///
/// `sources` holds the resolved upstream results in declared order.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn call(
        &self,
        client: &dyn CatalogClient,
        sources: &[Arc<Value>],
        params: &Value,
    ) -> Result<Value>;
}

/// A named bundle of methods
pub struct Category {
    name: String,
    methods: HashMap<String, Arc<dyn OperationHandler>>,
}

impl Category {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Add a method to the category
    pub fn method(mut self, name: impl Into<String>, handler: impl OperationHandler + 'static) -> Self {
        self.methods.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Lookup table from (category, method) to handler
pub struct OperationRegistry {
    categories: HashMap<String, Category>,
}

impl OperationRegistry {
    /// Create an empty registry (for tests and custom setups)
    pub fn empty() -> Self {
        Self {
            categories: HashMap::new(),
        }
    }

    /// Create a registry with every built-in operation
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();

        registry.register(
            Category::new("Source")
                .method("items", Items)
                .method("playlist", PlaylistItems),
        );
        registry.register(
            Category::new("Filter")
                .method("limit", Limit)
                .method("dedupe", Dedupe)
                .method("match", Match),
        );
        registry.register(
            Category::new("Order")
                .method("reverse", Reverse)
                .method("sort", Sort),
        );
        registry.register(
            Category::new("Combiner")
                .method("push", Push)
                .method("alternate", Alternate),
        );
        registry.register(
            Category::new("Playlist")
                .method("replace", Replace)
                .method("append", Append),
        );

        registry
    }

    /// Register a category, merging with any existing one of the same name
    pub fn register(&mut self, category: Category) {
        match self.categories.get_mut(&category.name) {
            Some(existing) => existing.methods.extend(category.methods),
            None => {
                self.categories.insert(category.name.clone(), category);
            }
        }
    }

    /// Get the handler for an operation type
    pub fn get(&self, op_type: &OperationType) -> Option<Arc<dyn OperationHandler>> {
        self.categories
            .get(&op_type.category)
            .and_then(|c| c.methods.get(&op_type.method))
            .cloned()
    }

    /// Resolve a handler or fail with `UnknownOperation`
    pub fn resolve(&self, op_type: &OperationType) -> WorkflowResult<Arc<dyn OperationHandler>> {
        self.get(op_type)
            .ok_or_else(|| WorkflowError::UnknownOperation(op_type.to_string()))
    }

    /// List registered types as `Category.method`, sorted
    pub fn list(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .categories
            .values()
            .flat_map(|c| c.methods.keys().map(move |m| format!("{}.{}", c.name, m)))
            .collect();
        types.sort();
        types
    }

    /// Startup check: every declared operation type must have a handler
    pub fn verify(&self, schemas: &[OperationSchema]) -> WorkflowResult<()> {
        let mut missing = BTreeSet::new();
        for schema in schemas {
            let op_type: OperationType = schema.op_type.parse()?;
            if self.get(&op_type).is_none() {
                missing.insert(schema.op_type);
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            let names: Vec<&str> = missing.into_iter().collect();
            Err(WorkflowError::Validation(format!(
                "no handler registered for declared operation types: {}",
                names.join(", ")
            )))
        }
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Concatenate the item arrays of all sources in declared order
pub(crate) fn source_items(sources: &[Arc<Value>]) -> Result<Vec<Value>> {
    let mut items = Vec::new();
    for (i, source) in sources.iter().enumerate() {
        match source.as_ref() {
            Value::Array(values) => items.extend(values.iter().cloned()),
            other => {
                return Err(anyhow!(
                    "source {} must be a list of items, got {}",
                    i,
                    type_name(other)
                ))
            }
        }
    }
    Ok(items)
}

/// Parse handler params, treating `null` as an empty object
pub(crate) fn parse_params<T: serde::de::DeserializeOwned>(params: &Value) -> Result<T> {
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params.clone()
    };
    serde_json::from_value(params).map_err(|e| anyhow!("invalid params: {}", e))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
