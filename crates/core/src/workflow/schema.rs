//! Parameter schemas for the built-in operation types.

use crate::error::{WorkflowError, WorkflowResult};
use crate::types::Operation;
use serde_json::Value;

/// JSON type a parameter must have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Boolean,
    Array,
    Any,
}

impl ParamKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

/// A single declared parameter
#[derive(Debug, Clone, Copy)]
pub struct ParamField {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
}

const fn required(name: &'static str, kind: ParamKind) -> ParamField {
    ParamField {
        name,
        kind,
        required: true,
    }
}

const fn optional(name: &'static str, kind: ParamKind) -> ParamField {
    ParamField {
        name,
        kind,
        required: false,
    }
}

/// Declared parameters of one operation type
#[derive(Debug, Clone, Copy)]
pub struct OperationSchema {
    pub op_type: &'static str,
    pub description: &'static str,
    pub params: &'static [ParamField],
}

/// Every operation type a workflow may use. The registry must provide a
/// handler for each of these at startup.
pub const OPERATION_SCHEMAS: &[OperationSchema] = &[
    OperationSchema {
        op_type: "Source.items",
        description: "Literal list of items",
        params: &[required("items", ParamKind::Array)],
    },
    OperationSchema {
        op_type: "Source.playlist",
        description: "All items of a catalog collection",
        params: &[required("playlistId", ParamKind::String)],
    },
    OperationSchema {
        op_type: "Filter.limit",
        description: "Keep at most `limit` items after `offset`",
        params: &[
            required("limit", ParamKind::Integer),
            optional("offset", ParamKind::Integer),
        ],
    },
    OperationSchema {
        op_type: "Filter.dedupe",
        description: "Drop items whose field was already seen",
        params: &[optional("field", ParamKind::String)],
    },
    OperationSchema {
        op_type: "Filter.match",
        description: "Keep items whose field equals a value",
        params: &[
            required("field", ParamKind::String),
            required("equals", ParamKind::Any),
            optional("invert", ParamKind::Boolean),
        ],
    },
    OperationSchema {
        op_type: "Order.reverse",
        description: "Reverse item order",
        params: &[],
    },
    OperationSchema {
        op_type: "Order.sort",
        description: "Stable sort by a field",
        params: &[
            required("field", ParamKind::String),
            optional("descending", ParamKind::Boolean),
        ],
    },
    OperationSchema {
        op_type: "Combiner.push",
        description: "Concatenate sources in declared order",
        params: &[],
    },
    OperationSchema {
        op_type: "Combiner.alternate",
        description: "Interleave sources round-robin",
        params: &[],
    },
    OperationSchema {
        op_type: "Playlist.replace",
        description: "Replace the contents of a collection",
        params: &[
            required("playlistId", ParamKind::String),
            optional("dryrun", ParamKind::Boolean),
        ],
    },
    OperationSchema {
        op_type: "Playlist.append",
        description: "Append items to a collection",
        params: &[
            required("playlistId", ParamKind::String),
            optional("dryrun", ParamKind::Boolean),
        ],
    },
];

/// Look up the schema declared for an operation type
pub fn schema_for(op_type: &str) -> Option<&'static OperationSchema> {
    OPERATION_SCHEMAS.iter().find(|s| s.op_type == op_type)
}

/// Check an operation's params against its declared schema
pub fn validate_params(op: &Operation) -> WorkflowResult<()> {
    let schema = schema_for(&op.op_type)
        .ok_or_else(|| WorkflowError::UnknownOperation(op.op_type.clone()))?;

    let params = match &op.params {
        Value::Object(map) => Some(map),
        Value::Null => None,
        _ => {
            return Err(WorkflowError::Validation(format!(
                "operation {}: params must be an object",
                op.id
            )))
        }
    };

    for field in schema.params {
        match params.and_then(|p| p.get(field.name)) {
            None | Some(Value::Null) if field.required => {
                return Err(WorkflowError::Validation(format!(
                    "operation {}: missing required param '{}'",
                    op.id, field.name
                )));
            }
            Some(value) if !value.is_null() && !field.kind.accepts(value) => {
                return Err(WorkflowError::Validation(format!(
                    "operation {}: param '{}' must be {:?}",
                    op.id, field.name, field.kind
                )));
            }
            _ => {}
        }
    }

    Ok(())
}
