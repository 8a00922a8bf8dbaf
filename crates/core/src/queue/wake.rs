use crate::storage::RunStore;
use crate::types::WorkerStatus;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Reaches a worker's liveness endpoint
#[async_trait]
pub trait WorkerPinger: Send + Sync {
    async fn ping(&self, endpoint: &str) -> Result<()>;
}

/// Pings over HTTP; a request to a stopped worker's endpoint starts it
pub struct HttpPinger {
    http: reqwest::Client,
}

impl HttpPinger {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl WorkerPinger for HttpPinger {
    async fn ping(&self, endpoint: &str) -> Result<()> {
        self.http
            .get(endpoint)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", endpoint))?
            .error_for_status()
            .with_context(|| format!("Unhealthy response from {}", endpoint))?;
        Ok(())
    }
}

/// Wakes a sleeping worker when nothing else would consume new jobs
pub struct WorkerWaker {
    store: Arc<dyn RunStore>,
    pinger: Arc<dyn WorkerPinger>,
}

impl WorkerWaker {
    pub fn new(store: Arc<dyn RunStore>, pinger: Arc<dyn WorkerPinger>) -> Self {
        Self { store, pinger }
    }

    /// Returns the device hash of the worker that answered, if a wake was
    /// needed and succeeded.
    pub async fn wake(&self) -> Result<Option<String>> {
        let workers = self.store.list_workers()?;

        if workers.iter().any(|w| w.status != WorkerStatus::Sleeping) {
            tracing::debug!("A worker is already available, no wake needed");
            return Ok(None);
        }

        // list_workers returns join order
        for worker in workers.iter().filter(|w| w.status == WorkerStatus::Sleeping) {
            let Some(endpoint) = worker.endpoint.as_deref() else {
                continue;
            };

            match self.pinger.ping(endpoint).await {
                Ok(()) => {
                    tracing::info!("Woke worker {} at {}", worker.name, endpoint);
                    return Ok(Some(worker.device_hash.clone()));
                }
                Err(e) => {
                    tracing::debug!("Worker {} did not answer: {:#}", worker.name, e);
                }
            }
        }

        tracing::warn!("No sleeping worker could be woken");
        Ok(None)
    }
}
