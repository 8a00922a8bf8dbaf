use super::{source_items, OperationHandler};
use crate::catalog::CatalogClient;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// `Combiner.push`: concatenate sources in declared order
pub struct Push;

#[async_trait]
impl OperationHandler for Push {
    async fn call(
        &self,
        _client: &dyn CatalogClient,
        sources: &[Arc<Value>],
        _params: &Value,
    ) -> Result<Value> {
        Ok(Value::Array(source_items(sources)?))
    }
}

/// `Combiner.alternate`: take one item from each source in turn
pub struct Alternate;

#[async_trait]
impl OperationHandler for Alternate {
    async fn call(
        &self,
        _client: &dyn CatalogClient,
        sources: &[Arc<Value>],
        _params: &Value,
    ) -> Result<Value> {
        let lists = sources
            .iter()
            .enumerate()
            .map(|(i, s)| {
                s.as_array()
                    .ok_or_else(|| anyhow!("source {} must be a list of items", i))
            })
            .collect::<Result<Vec<_>>>()?;

        let longest = lists.iter().map(|l| l.len()).max().unwrap_or(0);
        let mut items = Vec::with_capacity(lists.iter().map(|l| l.len()).sum());
        for i in 0..longest {
            for list in &lists {
                if let Some(item) = list.get(i) {
                    items.push(item.clone());
                }
            }
        }
        Ok(Value::Array(items))
    }
}
