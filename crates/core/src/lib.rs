// Core types and functionality for the tunegraph workflow engine

pub mod accounts;
pub mod catalog;
pub mod error;
pub mod operations;
pub mod queue;
pub mod storage;
pub mod types;
pub mod workflow;

pub use error::{WorkflowError, WorkflowResult};
pub use types::*;
