//! Client for the external catalog service that owns items and collections.

pub mod batch;

pub use batch::{BatchError, BatchIo, BATCH_SIZE};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Errors returned by the catalog service
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The service asked us to back off
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Non-success response
    #[error("Catalog error (status {status}): {message}")]
    Status { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unexpected catalog response: {0}")]
    Decode(String),
}

/// One page of a collection listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<Value>,
    /// Size of the whole collection, when the service reports it
    #[serde(default)]
    pub total: Option<usize>,
}

/// Operations the engine needs from the catalog service
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Fetch a page of items from a collection
    async fn collection_items(
        &self,
        collection_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Page, CatalogError>;

    /// Append items (by uri) to a collection
    async fn add_items(&self, collection_id: &str, uris: &[String]) -> Result<(), CatalogError>;

    /// Remove items (by uri) from a collection
    async fn remove_items(&self, collection_id: &str, uris: &[String])
        -> Result<(), CatalogError>;
}

/// Catalog client over HTTP with bearer authentication
pub struct HttpCatalogClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl HttpCatalogClient {
    pub fn new(base_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        }
    }

    fn items_url(&self, collection_id: &str) -> String {
        format!("{}/collections/{}/items", self.base_url, collection_id)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, CatalogError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(1);
            return Err(CatalogError::RateLimited {
                retry_after: Duration::from_secs(retry_after),
            });
        }

        let message = response.text().await.unwrap_or_default();
        Err(CatalogError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn collection_items(
        &self,
        collection_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Page, CatalogError> {
        let response = self
            .http
            .get(self.items_url(collection_id))
            .bearer_auth(&self.access_token)
            .query(&[("offset", offset), ("limit", limit)])
            .send()
            .await?;

        let response = Self::check(response).await?;
        response
            .json::<Page>()
            .await
            .map_err(|e| CatalogError::Decode(e.to_string()))
    }

    async fn add_items(&self, collection_id: &str, uris: &[String]) -> Result<(), CatalogError> {
        let response = self
            .http
            .post(self.items_url(collection_id))
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({ "uris": uris }))
            .send()
            .await?;

        Self::check(response).await?;
        Ok(())
    }

    async fn remove_items(
        &self,
        collection_id: &str,
        uris: &[String],
    ) -> Result<(), CatalogError> {
        let response = self
            .http
            .delete(self.items_url(collection_id))
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({ "uris": uris }))
            .send()
            .await?;

        Self::check(response).await?;
        Ok(())
    }
}

/// Read every item of a collection, one page at a time
pub async fn fetch_all_items(
    client: &dyn CatalogClient,
    collection_id: &str,
) -> Result<Vec<Value>, CatalogError> {
    let mut items = Vec::new();
    loop {
        let page = client
            .collection_items(collection_id, items.len(), BATCH_SIZE)
            .await?;
        let fetched = page.items.len();
        items.extend(page.items);

        let reached_total = page.total.is_some_and(|total| items.len() >= total);
        if fetched < BATCH_SIZE || reached_total {
            break;
        }
    }
    Ok(items)
}

/// The `uri` of each item, skipping items without one
pub fn item_uris(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| item.get("uri").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}


#[cfg(test)]
mod tests {
    use super::testing::FakeCatalog;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fetch_all_items_paginates() {
        let items: Vec<Value> = (0..120).map(|i| json!({ "uri": format!("item:{i}") })).collect();
        let catalog = FakeCatalog::with_collection("mix", items);

        let fetched = fetch_all_items(&catalog, "mix").await.unwrap();
        assert_eq!(fetched.len(), 120);
        assert_eq!(fetched[119]["uri"], "item:119");
        assert_eq!(*catalog.reads.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_fetch_all_items_without_total() {
        let items: Vec<Value> = (0..120).map(|i| json!({ "uri": format!("item:{i}") })).collect();
        let catalog = FakeCatalog::with_collection("mix", items).without_total();

        let fetched = fetch_all_items(&catalog, "mix").await.unwrap();
        assert_eq!(fetched.len(), 120);
        assert_eq!(*catalog.reads.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_fetch_stops_on_reported_total() {
        let items: Vec<Value> = (0..100).map(|i| json!({ "uri": format!("item:{i}") })).collect();
        let catalog = FakeCatalog::with_collection("mix", items);

        let fetched = fetch_all_items(&catalog, "mix").await.unwrap();
        assert_eq!(fetched.len(), 100);
        assert_eq!(*catalog.reads.lock().unwrap(), 2);
    }

    #[test]
    fn test_page_total_is_optional() {
        let page: Page = serde_json::from_value(json!({"items": [{"uri": "a"}]})).unwrap();
        assert_eq!(page.total, None);
        assert_eq!(page.items.len(), 1);
    }

    #[test]
    fn test_item_uris_skips_items_without_uri() {
        let items = vec![json!({"uri": "a"}), json!({"name": "b"}), json!({"uri": "c"})];
        assert_eq!(item_uris(&items), vec!["a".to_string(), "c".to_string()]);
    }
}
