use crate::error::{WorkflowError, WorkflowResult};
use crate::types::{Operation, WorkflowDefinition};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// DAG representation of a workflow definition
pub struct WorkflowDag<'a> {
    definition: &'a WorkflowDefinition,
    graph: DiGraph<&'a Operation, ()>,
}

impl<'a> WorkflowDag<'a> {
    /// Build a DAG from a workflow definition.
    ///
    /// Fails on duplicate ids, on sources that name no operation, and on
    /// cycles (naming the operation where the cycle was detected).
    pub fn from_definition(definition: &'a WorkflowDefinition) -> WorkflowResult<Self> {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();

        for op in &definition.operations {
            let node = graph.add_node(op);
            if indices.insert(op.id.as_str(), node).is_some() {
                return Err(WorkflowError::Validation(format!(
                    "duplicate operation id {}",
                    op.id
                )));
            }
        }

        for op in &definition.operations {
            let target = indices[op.id.as_str()];
            for source in &op.sources {
                let source_idx = indices.get(source.base()).ok_or_else(|| {
                    WorkflowError::UnsatisfiableSource {
                        operation: op.id.to_string(),
                        missing: source.to_string(),
                    }
                })?;

                // Edge from source to dependent (source -> op)
                graph.add_edge(*source_idx, target, ());
            }
        }

        let dag = Self { definition, graph };

        if let Some(node) = dag.find_cycle() {
            return Err(WorkflowError::CyclicGraph(dag.graph[node].id.to_string()));
        }

        Ok(dag)
    }

    /// Depth-first search along source edges, tracking the recursion stack.
    /// Returns the node closing the first back edge found.
    fn find_cycle(&self) -> Option<NodeIndex> {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();

        self.graph
            .node_indices()
            .find_map(|node| self.visit(node, &mut visited, &mut on_stack))
    }

    fn visit(
        &self,
        node: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        on_stack: &mut HashSet<NodeIndex>,
    ) -> Option<NodeIndex> {
        if on_stack.contains(&node) {
            return Some(node);
        }
        if !visited.insert(node) {
            return None;
        }

        on_stack.insert(node);
        for source in self.graph.neighbors_directed(node, Direction::Incoming) {
            if let Some(cycle) = self.visit(source, visited, on_stack) {
                return Some(cycle);
            }
        }
        on_stack.remove(&node);

        None
    }

    /// Operations in execution order (sources first).
    ///
    /// Each pass takes the first remaining operation, in declaration order,
    /// whose sources are all placed. Gives up after `2 * n` passes.
    pub fn topological_order(&self) -> WorkflowResult<Vec<Operation>> {
        let operations = &self.definition.operations;
        let max_passes = operations.len() * 2;

        let mut remaining: Vec<&Operation> = operations.iter().collect();
        let mut placed: HashSet<&str> = HashSet::with_capacity(operations.len());
        let mut sorted = Vec::with_capacity(operations.len());
        let mut passes = 0;

        while !remaining.is_empty() {
            if passes >= max_passes {
                let stuck = remaining[0];
                let missing = stuck
                    .sources
                    .iter()
                    .find(|s| !placed.contains(s.base()))
                    .map(|s| s.to_string())
                    .unwrap_or_default();
                return Err(WorkflowError::UnsatisfiableSource {
                    operation: stuck.id.to_string(),
                    missing,
                });
            }
            passes += 1;

            let ready = remaining
                .iter()
                .position(|op| op.sources.iter().all(|s| placed.contains(s.base())));

            if let Some(pos) = ready {
                let op = remaining.remove(pos);
                placed.insert(op.id.as_str());
                sorted.push(op.clone());
            }
        }

        Ok(sorted)
    }
}

/// Validate the graph and return its operations in execution order
pub fn sort_operations(definition: &WorkflowDefinition) -> WorkflowResult<Vec<Operation>> {
    WorkflowDag::from_definition(definition)?.topological_order()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperationId;
    use serde_json::json;

    fn op(id: &str, sources: &[&str]) -> Operation {
        Operation {
            id: OperationId::new(id),
            op_type: "Combiner.push".to_string(),
            params: json!({}),
            sources: sources.iter().map(|s| OperationId::new(*s)).collect(),
            output: None,
        }
    }

    fn workflow(operations: Vec<Operation>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".to_string(),
            name: "Test".to_string(),
            operations,
            connections: vec![],
            dryrun: false,
            max_execution_time_ms: None,
        }
    }

    fn ids(ops: &[Operation]) -> Vec<&str> {
        ops.iter().map(|o| o.id.as_str()).collect()
    }

    fn assert_sources_first(def: &WorkflowDefinition, order: &[Operation]) {
        assert_eq!(order.len(), def.operations.len());
        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, o)| (o.id.as_str(), i))
            .collect();
        for op in order {
            for source in &op.sources {
                assert!(
                    position[source.base()] < position[op.id.as_str()],
                    "{} must come before {}",
                    source,
                    op.id
                );
            }
        }
    }

    #[test]
    fn test_linear_dag() {
        let def = workflow(vec![op("c", &["b"]), op("b", &["a"]), op("a", &[])]);
        let order = sort_operations(&def).unwrap();
        assert_eq!(ids(&order), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        let def = workflow(vec![
            op("x", &[]),
            op("merge", &["y", "x"]),
            op("y", &[]),
            op("z", &[]),
        ]);
        let order = sort_operations(&def).unwrap();
        assert_eq!(ids(&order), vec!["x", "y", "merge", "z"]);
    }

    #[test]
    fn test_sort_is_deterministic() {
        let def = workflow(vec![
            op("d", &["b", "c"]),
            op("b", &["a"]),
            op("c", &["a"]),
            op("a", &[]),
            op("e", &["d", "a"]),
        ]);
        let first = sort_operations(&def).unwrap();
        let second = sort_operations(&def).unwrap();
        assert_eq!(ids(&first), ids(&second));
        assert_sources_first(&def, &first);
    }

    #[test]
    fn test_generated_dags_sort_sources_first() {
        // Small linear congruential generator keeps the graphs reproducible
        let mut seed: u64 = 0x2545_f491;
        let mut next = move |bound: usize| {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((seed >> 33) as usize) % bound.max(1)
        };

        for size in 1..30 {
            let mut ops: Vec<Operation> = Vec::new();
            for i in 0..size {
                let mut sources = Vec::new();
                for j in 0..i {
                    if next(3) == 0 {
                        sources.push(format!("n{}", j));
                    }
                }
                let refs: Vec<&str> = sources.iter().map(|s| s.as_str()).collect();
                ops.push(op(&format!("n{}", i), &refs));
            }
            // Shuffle declaration order so the sorter has real work to do
            for i in (1..ops.len()).rev() {
                let j = next(i + 1);
                ops.swap(i, j);
            }

            let def = workflow(ops);
            let order = sort_operations(&def).unwrap();
            assert_sources_first(&def, &order);
        }
    }

    #[test]
    fn test_cycle_rejected_without_partial_order() {
        let def = workflow(vec![
            op("root", &[]),
            op("a", &["root", "c"]),
            op("b", &["a"]),
            op("c", &["b"]),
        ]);
        let err = sort_operations(&def).unwrap_err();
        match err {
            WorkflowError::CyclicGraph(id) => assert!(["a", "b", "c"].contains(&id.as_str())),
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_self_loop_rejected() {
        let def = workflow(vec![op("a", &["a"])]);
        assert!(matches!(
            sort_operations(&def),
            Err(WorkflowError::CyclicGraph(id)) if id == "a"
        ));
    }

    #[test]
    fn test_unknown_source_reported() {
        let def = workflow(vec![op("a", &[]), op("b", &["ghost"])]);
        match sort_operations(&def).unwrap_err() {
            WorkflowError::UnsatisfiableSource { operation, missing } => {
                assert_eq!(operation, "b");
                assert_eq!(missing, "ghost");
            }
            other => panic!("expected unsatisfiable source, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let def = workflow(vec![op("a", &[]), op("a", &[])]);
        assert!(matches!(
            sort_operations(&def),
            Err(WorkflowError::Validation(msg)) if msg.contains("duplicate")
        ));
    }

    #[test]
    fn test_legacy_source_alias() {
        let def = workflow(vec![op("b", &["a.tracks"]), op("a", &[])]);
        let dag = WorkflowDag::from_definition(&def).unwrap();
        assert_eq!(ids(&dag.topological_order().unwrap()), vec!["a", "b"]);
    }
}
