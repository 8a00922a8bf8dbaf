//! Coordinator process: owns the database, promotes due schedules and
//! serves the queue API to workers and the CLI.

use crate::api;
use crate::config::{AppState, ServerConfig};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tunegraph_core::queue::WorkflowProducer;

/// Run until `shutdown` fires
pub async fn run(config: ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let state = Arc::new(AppState::new(&config)?);
    tracing::info!("Opened {}", config.database_path().display());

    let promoter = tokio::spawn(promote_loop(
        state.producer.clone(),
        config.coordinator.promote_interval(),
        shutdown.clone(),
    ));

    let listener = tokio::net::TcpListener::bind(config.coordinator.bind_addr()).await?;
    let result = api::serve(listener, state, shutdown.clone()).await;
    shutdown.cancel();

    if let Err(e) = promoter.await {
        tracing::warn!("Schedule promoter failed: {}", e);
    }

    result
}

/// Enqueue due schedules every `interval` until `shutdown` fires
async fn promote_loop(
    producer: Arc<WorkflowProducer>,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            _ = ticker.tick() => {}
        }

        match producer.promote_due(Utc::now()) {
            Ok(jobs) if !jobs.is_empty() => {
                tracing::debug!("Promoted {} scheduled workflows", jobs.len());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to promote scheduled workflows: {:#}", e),
        }
    }
}
