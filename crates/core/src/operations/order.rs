use super::{parse_params, source_items, OperationHandler};
use crate::catalog::CatalogClient;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

/// `Order.reverse`
pub struct Reverse;

#[async_trait]
impl OperationHandler for Reverse {
    async fn call(
        &self,
        _client: &dyn CatalogClient,
        sources: &[Arc<Value>],
        _params: &Value,
    ) -> Result<Value> {
        let mut items = source_items(sources)?;
        items.reverse();
        Ok(Value::Array(items))
    }
}

/// `Order.sort`: stable sort on one field
pub struct Sort;

#[derive(Deserialize)]
struct SortParams {
    field: String,
    #[serde(default)]
    descending: bool,
}

#[async_trait]
impl OperationHandler for Sort {
    async fn call(
        &self,
        _client: &dyn CatalogClient,
        sources: &[Arc<Value>],
        params: &Value,
    ) -> Result<Value> {
        let params: SortParams = parse_params(params)?;
        let mut items = source_items(sources)?;
        items.sort_by(|a, b| {
            let ordering = compare(a.get(&params.field), b.get(&params.field));
            if params.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
        Ok(Value::Array(items))
    }
}

/// Numbers numerically, strings lexically, missing values last
fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}
