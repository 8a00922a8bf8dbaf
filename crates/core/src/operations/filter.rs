use super::{parse_params, source_items, OperationHandler};
use crate::catalog::CatalogClient;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// `Filter.limit`: keep `limit` items starting at `offset`
pub struct Limit;

#[derive(Deserialize)]
struct LimitParams {
    limit: usize,
    #[serde(default)]
    offset: usize,
}

#[async_trait]
impl OperationHandler for Limit {
    async fn call(
        &self,
        _client: &dyn CatalogClient,
        sources: &[Arc<Value>],
        params: &Value,
    ) -> Result<Value> {
        let params: LimitParams = parse_params(params)?;
        let items = source_items(sources)?;
        Ok(Value::Array(
            items
                .into_iter()
                .skip(params.offset)
                .take(params.limit)
                .collect(),
        ))
    }
}

/// `Filter.dedupe`: first occurrence of each field value wins
pub struct Dedupe;

#[derive(Deserialize)]
struct DedupeParams {
    #[serde(default = "default_dedupe_field")]
    field: String,
}

fn default_dedupe_field() -> String {
    "uri".to_string()
}

#[async_trait]
impl OperationHandler for Dedupe {
    async fn call(
        &self,
        _client: &dyn CatalogClient,
        sources: &[Arc<Value>],
        params: &Value,
    ) -> Result<Value> {
        let params: DedupeParams = parse_params(params)?;
        let mut seen = HashSet::new();
        let items = source_items(sources)?
            .into_iter()
            .filter(|item| {
                // Items without the field are never considered duplicates
                match item.get(&params.field) {
                    Some(key) => seen.insert(key.to_string()),
                    None => true,
                }
            })
            .collect();
        Ok(Value::Array(items))
    }
}

/// `Filter.match`: keep items whose field equals a value
pub struct Match;

#[derive(Deserialize)]
struct MatchParams {
    field: String,
    equals: Value,
    #[serde(default)]
    invert: bool,
}

#[async_trait]
impl OperationHandler for Match {
    async fn call(
        &self,
        _client: &dyn CatalogClient,
        sources: &[Arc<Value>],
        params: &Value,
    ) -> Result<Value> {
        let params: MatchParams = parse_params(params)?;
        let items = source_items(sources)?
            .into_iter()
            .filter(|item| (item.get(&params.field) == Some(&params.equals)) != params.invert)
            .collect();
        Ok(Value::Array(items))
    }
}
