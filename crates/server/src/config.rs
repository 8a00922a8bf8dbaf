use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tunegraph_core::accounts::{StaticCredentials, StaticPlans};
use tunegraph_core::queue::{HttpPinger, JobQueue, LocalBroker, WorkerWaker, WorkflowProducer};
use tunegraph_core::storage::RedbStore;
use tunegraph_core::Plan;

/// Prefix of environment variables carrying per-user access tokens
pub const TOKEN_ENV_PREFIX: &str = "TUNEGRAPH_TOKEN_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub plans: PlansConfig,

    /// Access tokens by user id
    #[serde(default)]
    pub credentials: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_file")]
    pub database_file: String,
}

fn default_database_file() -> String {
    "tunegraph.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_file: default_database_file(),
        }
    }
}

/// The coordinator owns the database and serves the queue API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_coordinator_port")]
    pub port: u16,

    /// Address workers and the CLI use to reach the coordinator
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_request_timeout_ms")]
    pub timeout_ms: u64,

    /// How often due schedules are promoted into the queue
    #[serde(default = "default_poll_interval_ms")]
    pub promote_interval_ms: u64,
}

fn default_coordinator_port() -> u16 {
    8080
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_coordinator_port(),
            url: None,
            timeout_ms: default_request_timeout_ms(),
            promote_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl CoordinatorConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url(&self) -> String {
        self.url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.bind_addr()))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn promote_interval(&self) -> Duration {
        Duration::from_millis(self.promote_interval_ms.max(10))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_name")]
    pub name: String,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Address other processes use to reach this worker's liveness endpoint
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Deadline for jobs whose payload carries none
    #[serde(default = "default_execution_time_ms")]
    pub default_execution_time_ms: u64,

    #[serde(default = "default_wake_timeout_ms")]
    pub wake_timeout_ms: u64,
}

fn default_worker_name() -> String {
    "worker".to_string()
}

fn default_concurrency() -> usize {
    2
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_execution_time_ms() -> u64 {
    5 * 60 * 1000
}

fn default_wake_timeout_ms() -> u64 {
    5000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: default_worker_name(),
            concurrency: default_concurrency(),
            host: default_host(),
            port: default_port(),
            endpoint: None,
            poll_interval_ms: default_poll_interval_ms(),
            default_execution_time_ms: default_execution_time_ms(),
            wake_timeout_ms: default_wake_timeout_ms(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn wake_timeout(&self) -> Duration {
        Duration::from_millis(self.wake_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_url")]
    pub base_url: String,
}

fn default_catalog_url() -> String {
    "http://127.0.0.1:9000".to_string()
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: default_catalog_url(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlansConfig {
    #[serde(default)]
    pub default: Plan,

    /// Plan overrides by user id
    #[serde(default)]
    pub users: HashMap<String, Plan>,
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::default()
        };

        config.data_dir = data_dir;
        config.apply_token_env(std::env::vars());

        Ok(config)
    }

    /// `TUNEGRAPH_TOKEN_<USER>` overrides the configured token of `<user>`
    /// (user ids matched in lower case).
    fn apply_token_env(&mut self, vars: impl Iterator<Item = (String, String)>) {
        for (key, value) in vars {
            if let Some(user) = key.strip_prefix(TOKEN_ENV_PREFIX) {
                if !user.is_empty() {
                    self.credentials.insert(user.to_lowercase(), value);
                }
            }
        }
    }

    /// Get the database file path
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.database_file)
    }

    pub fn plan_provider(&self) -> StaticPlans {
        StaticPlans::new(self.plans.default.clone(), self.plans.users.clone())
    }

    pub fn credential_resolver(&self) -> StaticCredentials {
        StaticCredentials::new(self.credentials.clone())
    }
}

/// Shared state of the coordinator process
pub struct AppState {
    pub store: Arc<RedbStore>,
    pub producer: Arc<WorkflowProducer>,
    pub broker: Arc<LocalBroker>,
}

impl AppState {
    /// Open the database; fails while another process holds it
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let store = Arc::new(RedbStore::new(config.database_path())?);
        let queue = JobQueue::new(store.database())?;

        let pinger = Arc::new(HttpPinger::new(config.worker.wake_timeout())?);
        let waker = Arc::new(WorkerWaker::new(store.clone(), pinger));
        let producer = WorkflowProducer::new(
            queue.clone(),
            store.clone(),
            Arc::new(config.plan_provider()),
        )
        .with_waker(waker);

        Ok(Self {
            broker: Arc::new(LocalBroker::new(queue, store.clone())),
            producer: Arc::new(producer),
            store,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config =
            ServerConfig::load(&dir.path().join("missing.toml"), dir.path().join("data")).unwrap();

        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(config.coordinator.url(), "http://127.0.0.1:8080");
        assert_eq!(config.plans.default.name, "free");
        assert!(config.database_path().ends_with("tunegraph.redb"));
        assert!(dir.path().join("data").exists());
    }

    #[test]
    fn test_parse_sections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tunegraph.toml");
        std::fs::write(
            &path,
            r#"
[coordinator]
host = "0.0.0.0"
url = "http://queue.internal:8080"

[worker]
name = "edge-1"
concurrency = 4
endpoint = "http://edge-1.internal:8081/"

[catalog]
base_url = "https://catalog.example.com/v1"

[plans.default]
name = "free"
maxExecutionTime = 60000
maxOperations = 10

[plans.users.alice]
name = "pro"
maxExecutionTime = 600000
maxOperations = 100

[credentials]
alice = "token-a"
"#,
        )
        .unwrap();

        let config = ServerConfig::load(&path, dir.path().to_path_buf()).unwrap();
        assert_eq!(config.worker.name, "edge-1");
        assert_eq!(config.coordinator.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.coordinator.url(), "http://queue.internal:8080");
        assert_eq!(config.worker.poll_interval_ms, 1000);
        assert_eq!(config.plans.users["alice"].max_operations, 100);
        assert_eq!(config.catalog.base_url, "https://catalog.example.com/v1");
        assert_eq!(config.credentials["alice"], "token-a");
    }

    #[test]
    fn test_token_env_override() {
        let mut config = ServerConfig::default();
        config.credentials.insert("alice".to_string(), "old".to_string());

        config.apply_token_env(
            vec![
                ("TUNEGRAPH_TOKEN_ALICE".to_string(), "new".to_string()),
                ("TUNEGRAPH_TOKEN_".to_string(), "ignored".to_string()),
                ("PATH".to_string(), "/usr/bin".to_string()),
            ]
            .into_iter(),
        );

        assert_eq!(config.credentials["alice"], "new");
        assert_eq!(config.credentials.len(), 1);
    }
}
