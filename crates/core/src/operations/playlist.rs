use super::{parse_params, source_items, OperationHandler};
use crate::catalog::{fetch_all_items, item_uris, BatchIo, CatalogClient};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteParams {
    playlist_id: String,
    #[serde(default)]
    dryrun: bool,
}

/// `Playlist.replace`: the collection ends up holding exactly the input items.
/// Returns the final item list; in dryrun mode nothing is written.
pub struct Replace;

#[async_trait]
impl OperationHandler for Replace {
    async fn call(
        &self,
        client: &dyn CatalogClient,
        sources: &[Arc<Value>],
        params: &Value,
    ) -> Result<Value> {
        let params: WriteParams = parse_params(params)?;
        let items = source_items(sources)?;

        if params.dryrun {
            tracing::debug!("Dryrun: skipping replace of playlist {}", params.playlist_id);
        } else {
            BatchIo::new(client)
                .replace_batch(&params.playlist_id, &item_uris(&items))
                .await
                .with_context(|| format!("Failed to replace playlist {}", params.playlist_id))?;
        }

        Ok(Value::Array(items))
    }
}

/// `Playlist.append`: add the input items after the current contents.
/// Returns the resulting item list; in dryrun mode nothing is written.
pub struct Append;

#[async_trait]
impl OperationHandler for Append {
    async fn call(
        &self,
        client: &dyn CatalogClient,
        sources: &[Arc<Value>],
        params: &Value,
    ) -> Result<Value> {
        let params: WriteParams = parse_params(params)?;
        let items = source_items(sources)?;

        let mut current = fetch_all_items(client, &params.playlist_id)
            .await
            .with_context(|| format!("Failed to read playlist {}", params.playlist_id))?;

        if params.dryrun {
            tracing::debug!("Dryrun: skipping append to playlist {}", params.playlist_id);
        } else {
            BatchIo::new(client)
                .add_batch(&params.playlist_id, &item_uris(&items))
                .await
                .with_context(|| format!("Failed to append to playlist {}", params.playlist_id))?;
        }

        current.extend(items);
        Ok(Value::Array(current))
    }
}
