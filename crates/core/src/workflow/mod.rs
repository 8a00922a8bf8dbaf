pub mod context;
pub mod dag;
pub mod runner;
pub mod schema;
pub mod validate;

pub use context::ExecutionContext;
pub use dag::{sort_operations, WorkflowDag};
pub use runner::{OperationObserver, Runner};
pub use schema::{schema_for, validate_params, OperationSchema, OPERATION_SCHEMAS};
pub use validate::validate_definition;
