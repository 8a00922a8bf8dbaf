use super::dag::WorkflowDag;
use super::schema::validate_params;
use crate::error::{WorkflowError, WorkflowResult};
use crate::types::WorkflowDefinition;
use std::collections::HashSet;

/// Full pre-execution check of a definition: operation types and params,
/// duplicate ids, the connection view, unknown sources and cycles.
pub fn validate_definition(definition: &WorkflowDefinition) -> WorkflowResult<()> {
    if definition.operations.is_empty() {
        return Err(WorkflowError::Validation(
            "workflow has no operations".to_string(),
        ));
    }

    let mut seen = HashSet::with_capacity(definition.operations.len());
    for op in &definition.operations {
        if !seen.insert(op.id.as_str()) {
            return Err(WorkflowError::Validation(format!(
                "duplicate operation id {}",
                op.id
            )));
        }
        op.operation_type()?;
        validate_params(op)?;
    }

    validate_connections(definition)?;
    WorkflowDag::from_definition(definition)?;

    Ok(())
}

/// The connection list is a derived view of `sources`. An empty list is
/// accepted; otherwise it must describe exactly the source edges, which also
/// means at least one connection per non-root operation.
fn validate_connections(definition: &WorkflowDefinition) -> WorkflowResult<()> {
    if definition.connections.is_empty() {
        return Ok(());
    }

    let non_roots = definition
        .operations
        .iter()
        .filter(|op| !op.is_root())
        .count();
    if definition.connections.len() < non_roots {
        return Err(WorkflowError::Validation(format!(
            "expected at least {} connections, found {}",
            non_roots,
            definition.connections.len()
        )));
    }

    let expected: HashSet<(String, String)> = definition
        .derive_connections()
        .into_iter()
        .map(|c| (c.source.0, c.target.0))
        .collect();

    let mut actual = HashSet::with_capacity(definition.connections.len());
    for connection in &definition.connections {
        let edge = (
            connection.source.base().to_string(),
            connection.target.base().to_string(),
        );
        if !expected.contains(&edge) {
            return Err(WorkflowError::Validation(format!(
                "connection {} ({} -> {}) has no matching source reference",
                connection.id, connection.source, connection.target
            )));
        }
        actual.insert(edge);
    }

    if let Some((source, target)) = expected.difference(&actual).next() {
        return Err(WorkflowError::Validation(format!(
            "source reference {} -> {} has no connection",
            source, target
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Connection, Operation, OperationId};
    use serde_json::json;

    fn op(id: &str, op_type: &str, params: serde_json::Value, sources: &[&str]) -> Operation {
        Operation {
            id: OperationId::new(id),
            op_type: op_type.to_string(),
            params,
            sources: sources.iter().map(|s| OperationId::new(*s)).collect(),
            output: None,
        }
    }

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".to_string(),
            name: "Test".to_string(),
            operations: vec![
                op("src", "Source.items", json!({"items": []}), &[]),
                op("limit", "Filter.limit", json!({"limit": 5}), &["src"]),
                op("rev", "Order.reverse", json!({}), &["src", "limit"]),
            ],
            connections: vec![],
            dryrun: false,
            max_execution_time_ms: None,
        }
    }

    #[test]
    fn test_valid_definition() {
        assert!(validate_definition(&definition()).is_ok());
    }

    #[test]
    fn test_derived_connections_validate() {
        let mut def = definition();
        def.connections = def.derive_connections();
        assert_eq!(def.connections.len(), 3);
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn test_missing_connection_rejected() {
        let mut def = definition();
        def.connections = def.derive_connections();
        def.connections.pop();
        def.connections.push(Connection {
            id: "dup".to_string(),
            source: OperationId::new("src"),
            target: OperationId::new("limit"),
        });
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("has no connection"));
    }

    #[test]
    fn test_stray_connection_rejected() {
        let mut def = definition();
        def.connections = def.derive_connections();
        def.connections.push(Connection {
            id: "stray".to_string(),
            source: OperationId::new("rev"),
            target: OperationId::new("src"),
        });
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("stray"));
    }

    #[test]
    fn test_too_few_connections_rejected() {
        let mut def = definition();
        def.connections = def.derive_connections();
        def.connections.truncate(1);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("at least 2 connections"));
    }

    #[test]
    fn test_bad_params_rejected() {
        let mut def = definition();
        def.operations[1].params = json!({"limit": "lots"});
        assert!(matches!(
            validate_definition(&def),
            Err(WorkflowError::Validation(_))
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut def = definition();
        def.operations[0].sources = vec![OperationId::new("rev")];
        assert!(matches!(
            validate_definition(&def),
            Err(WorkflowError::CyclicGraph(_))
        ));
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let mut def = definition();
        def.operations.clear();
        assert!(validate_definition(&def).is_err());
    }
}
