use super::{parse_params, OperationHandler};
use crate::catalog::{fetch_all_items, CatalogClient};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// `Source.items`: literal items from the params
pub struct Items;

#[derive(Deserialize)]
struct ItemsParams {
    items: Vec<Value>,
}

#[async_trait]
impl OperationHandler for Items {
    async fn call(
        &self,
        _client: &dyn CatalogClient,
        _sources: &[Arc<Value>],
        params: &Value,
    ) -> Result<Value> {
        let params: ItemsParams = parse_params(params)?;
        Ok(Value::Array(params.items))
    }
}

/// `Source.playlist`: every item of a catalog collection
pub struct PlaylistItems;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistParams {
    playlist_id: String,
}

#[async_trait]
impl OperationHandler for PlaylistItems {
    async fn call(
        &self,
        client: &dyn CatalogClient,
        _sources: &[Arc<Value>],
        params: &Value,
    ) -> Result<Value> {
        let params: PlaylistParams = parse_params(params)?;
        let items = fetch_all_items(client, &params.playlist_id)
            .await
            .with_context(|| format!("Failed to read playlist {}", params.playlist_id))?;
        Ok(Value::Array(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::testing::FakeCatalog;
    use serde_json::json;

    #[tokio::test]
    async fn test_items_returns_literal_list() {
        let catalog = FakeCatalog::default();
        let result = Items
            .call(&catalog, &[], &json!({"items": [{"uri": "a"}]}))
            .await
            .unwrap();
        assert_eq!(result, json!([{"uri": "a"}]));
    }

    #[tokio::test]
    async fn test_playlist_reads_collection() {
        let catalog = FakeCatalog::with_collection("p1", vec![json!({"uri": "x"}), json!({"uri": "y"})]);
        let result = PlaylistItems
            .call(&catalog, &[], &json!({"playlistId": "p1"}))
            .await
            .unwrap();
        assert_eq!(result.as_array().unwrap().len(), 2);
        assert_eq!(catalog.write_calls(), 0);
    }
}
