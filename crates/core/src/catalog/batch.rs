//! Chunked, rate-limit aware writes against catalog collections.

use super::{fetch_all_items, item_uris, CatalogClient, CatalogError};
use std::time::Duration;

/// Items per catalog call
pub const BATCH_SIZE: usize = 50;

/// A chunk failed with something other than a rate limit
#[derive(Debug, thiserror::Error)]
#[error("Batch {action} failed on chunk {chunk} of collection {collection_id}")]
pub struct BatchError {
    pub action: &'static str,
    pub collection_id: String,
    pub chunk: usize,
    #[source]
    pub source: CatalogError,
}

#[derive(Clone, Copy)]
enum Write {
    Add,
    Remove,
}

impl Write {
    fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
        }
    }
}

/// Batch writer bound to a catalog client
pub struct BatchIo<'a> {
    client: &'a dyn CatalogClient,
}

impl<'a> BatchIo<'a> {
    pub fn new(client: &'a dyn CatalogClient) -> Self {
        Self { client }
    }

    /// Append `uris` to a collection in chunks
    pub async fn add_batch(&self, collection_id: &str, uris: &[String]) -> Result<(), BatchError> {
        self.write_chunks(Write::Add, collection_id, uris).await
    }

    /// Remove `uris` from a collection in chunks
    pub async fn remove_batch(
        &self,
        collection_id: &str,
        uris: &[String],
    ) -> Result<(), BatchError> {
        self.write_chunks(Write::Remove, collection_id, uris).await
    }

    /// Remove everything currently in the collection, then add `uris`
    pub async fn replace_batch(
        &self,
        collection_id: &str,
        uris: &[String],
    ) -> Result<(), BatchError> {
        let existing = fetch_all_items(self.client, collection_id)
            .await
            .map_err(|source| BatchError {
                action: "read",
                collection_id: collection_id.to_string(),
                chunk: 0,
                source,
            })?;

        self.remove_batch(collection_id, &item_uris(&existing)).await?;
        self.add_batch(collection_id, uris).await
    }

    async fn write_chunks(
        &self,
        write: Write,
        collection_id: &str,
        uris: &[String],
    ) -> Result<(), BatchError> {
        for (chunk, uris) in uris.chunks(BATCH_SIZE).enumerate() {
            loop {
                let result = match write {
                    Write::Add => self.client.add_items(collection_id, uris).await,
                    Write::Remove => self.client.remove_items(collection_id, uris).await,
                };

                match result {
                    Ok(()) => break,
                    Err(CatalogError::RateLimited { retry_after }) => {
                        tracing::debug!(
                            "Rate limited on {} chunk {} of {}, sleeping {:?}",
                            write.name(),
                            chunk,
                            collection_id,
                            retry_after
                        );
                        tokio::time::sleep(retry_after.max(Duration::from_millis(1))).await;
                    }
                    Err(source) => {
                        return Err(BatchError {
                            action: write.name(),
                            collection_id: collection_id.to_string(),
                            chunk,
                            source,
                        })
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::testing::FakeCatalog;
    use serde_json::json;

    fn uris(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("item:{i}")).collect()
    }

    #[tokio::test]
    async fn test_add_batch_chunks_by_fifty() {
        let catalog = FakeCatalog::default();
        BatchIo::new(&catalog).add_batch("mix", &uris(120)).await.unwrap();

        let adds = catalog.adds.lock().unwrap();
        let sizes: Vec<usize> = adds.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_sleeps_and_retries_same_chunk() {
        let catalog = FakeCatalog::default();
        catalog.write_failures.lock().unwrap().extend([
            CatalogError::RateLimited {
                retry_after: Duration::from_secs(3),
            },
            CatalogError::RateLimited {
                retry_after: Duration::from_secs(3),
            },
        ]);

        let started = tokio::time::Instant::now();
        BatchIo::new(&catalog).add_batch("mix", &uris(10)).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(6));
        let adds = catalog.adds.lock().unwrap();
        assert_eq!(adds.len(), 1);
        assert_eq!(adds[0].len(), 10);
    }

    #[tokio::test]
    async fn test_other_errors_abort_with_cause() {
        let catalog = FakeCatalog::default();
        catalog.write_failures.lock().unwrap().push(CatalogError::Status {
            status: 403,
            message: "forbidden".to_string(),
        });

        let err = BatchIo::new(&catalog)
            .remove_batch("mix", &uris(60))
            .await
            .unwrap_err();

        assert_eq!(err.action, "remove");
        assert_eq!(err.chunk, 0);
        assert!(matches!(err.source, CatalogError::Status { status: 403, .. }));
        assert_eq!(catalog.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_replace_batch_clears_then_adds() {
        let existing: Vec<_> = (0..70).map(|i| json!({ "uri": format!("old:{i}") })).collect();
        let catalog = FakeCatalog::with_collection("mix", existing);

        BatchIo::new(&catalog)
            .replace_batch("mix", &uris(3))
            .await
            .unwrap();

        assert_eq!(catalog.removes.lock().unwrap().len(), 2);
        let collections = catalog.collections.lock().unwrap();
        let remaining: Vec<&str> = collections["mix"]
            .iter()
            .filter_map(|i| i["uri"].as_str())
            .collect();
        assert_eq!(remaining, vec!["item:0", "item:1", "item:2"]);
    }

    #[tokio::test]
    async fn test_replace_batch_clears_collections_without_total() {
        let existing: Vec<_> = (0..120).map(|i| json!({ "uri": format!("old:{i}") })).collect();
        let catalog = FakeCatalog::with_collection("mix", existing).without_total();

        BatchIo::new(&catalog)
            .replace_batch("mix", &uris(2))
            .await
            .unwrap();

        let collections = catalog.collections.lock().unwrap();
        let remaining: Vec<&str> = collections["mix"]
            .iter()
            .filter_map(|i| i["uri"].as_str())
            .collect();
        assert_eq!(remaining, vec!["item:0", "item:1"]);
    }
}
