use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tunegraph_core::accounts::CredentialResolver;
use tunegraph_core::catalog::HttpCatalogClient;
use tunegraph_core::operations::OperationRegistry;
use tunegraph_core::workflow::{sort_operations, validate_definition, Runner, OPERATION_SCHEMAS};
use tunegraph_core::{Credentials, JobId, WorkflowDefinition};

mod api;
mod client;
mod config;
mod coordinator;
mod shutdown;
mod worker;

use client::CoordinatorClient;
use config::ServerConfig;
use worker::WorkerRuntime;

#[derive(Parser, Debug)]
#[command(name = "tunegraph")]
#[command(about = "Workflow DAG execution engine for catalog collections", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "tunegraph.toml")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Own the database and serve the queue API until SIGTERM/SIGINT
    Serve,

    /// Consume the job queue until SIGTERM/SIGINT
    Worker {
        /// Overrides `worker.name` from the configuration
        #[arg(long)]
        name: Option<String>,

        /// Overrides `coordinator.url` from the configuration
        #[arg(long, env = "TUNEGRAPH_COORDINATOR")]
        coordinator: Option<String>,
    },

    /// Queue one run of a workflow file
    Enqueue {
        file: PathBuf,
        #[arg(long)]
        user: String,
        /// Workflow record id (defaults to the definition id)
        #[arg(long)]
        record: Option<String>,
    },

    /// Register a cron schedule for a workflow file
    Schedule {
        file: PathBuf,
        #[arg(long)]
        user: String,
        #[arg(long)]
        record: Option<String>,
        #[arg(long)]
        cron: String,
    },

    /// Print the run record of a queued job
    Status { job_id: JobId },

    /// Validate a workflow file and print its execution order
    Validate { file: PathBuf },

    /// List the operation types this build can execute
    Operations,

    /// Run a workflow file in this process, bypassing the queue
    Run {
        file: PathBuf,
        #[arg(long)]
        user: String,
        #[arg(long)]
        dryrun: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunegraph=info,tower_http=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    let mut config = ServerConfig::load(&args.config, args.data_dir)?;
    tracing::debug!("Data directory: {}", config.data_dir.display());

    let registry = OperationRegistry::with_defaults();
    registry.verify(OPERATION_SCHEMAS)?;
    let registry = Arc::new(registry);

    match args.command {
        Command::Serve => {
            tracing::info!("Starting tunegraph coordinator on {}", config.coordinator.bind_addr());
            let shutdown = CancellationToken::new();
            shutdown::spawn_signal_listener(shutdown.clone());
            coordinator::run(config, shutdown).await
        }
        Command::Worker { name, coordinator } => {
            if let Some(url) = coordinator {
                config.coordinator.url = Some(url);
            }
            run_worker(config, registry, name).await
        }
        Command::Enqueue { file, user, record } => {
            let definition = read_definition(&file)?;
            let client = coordinator_client(&config)?;

            let job = client.enqueue(&definition, &user, record.as_deref()).await?;
            println!("{}", job.id);
            Ok(())
        }
        Command::Schedule {
            file,
            user,
            record,
            cron,
        } => {
            let definition = read_definition(&file)?;
            let client = coordinator_client(&config)?;

            let repeatable = client
                .schedule(&definition, &user, record.as_deref(), &cron)
                .await?;
            println!("{} next run at {}", repeatable.key, repeatable.next_run);
            Ok(())
        }
        Command::Status { job_id } => {
            let run = coordinator_client(&config)?
                .get_run(&job_id)
                .await?
                .with_context(|| format!("No run recorded for job {}", job_id))?;
            println!("{}", serde_json::to_string_pretty(&run)?);
            Ok(())
        }
        Command::Operations => {
            for schema in OPERATION_SCHEMAS {
                println!("{}\t{}", schema.op_type, schema.description);
            }
            Ok(())
        }
        Command::Validate { file } => {
            let definition = read_definition(&file)?;
            validate_definition(&definition)?;
            for operation in sort_operations(&definition)? {
                println!("{}\t{}", operation.id, operation.op_type);
            }
            Ok(())
        }
        Command::Run { file, user, dryrun } => {
            let mut definition = read_definition(&file)?;
            definition.dryrun |= dryrun;

            let token = config.credential_resolver().get_access_token(&user).await?;
            let client = Arc::new(HttpCatalogClient::new(config.catalog.base_url.clone(), &token));
            let shutdown = CancellationToken::new();
            shutdown::spawn_signal_listener(shutdown.clone());

            let runner = Runner::new(registry, client)
                .with_credentials(Credentials {
                    user_id: user,
                    access_token: token,
                })
                .with_shutdown(shutdown);
            let timeout_ms = definition
                .max_execution_time_ms
                .unwrap_or(config.worker.default_execution_time_ms);

            let results = runner.run_workflow(&definition, timeout_ms, None).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
            Ok(())
        }
    }
}

fn read_definition(path: &Path) -> Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse workflow file {}", path.display()))
}

fn coordinator_client(config: &ServerConfig) -> Result<CoordinatorClient> {
    CoordinatorClient::new(config.coordinator.url(), config.coordinator.timeout())
}

async fn run_worker(
    mut config: ServerConfig,
    registry: Arc<OperationRegistry>,
    name: Option<String>,
) -> Result<()> {
    if let Some(name) = name {
        config.worker.name = name;
    }
    let bind_addr = format!("{}:{}", config.worker.host, config.worker.port);
    if config.worker.endpoint.is_none() {
        config.worker.endpoint = Some(format!("http://{}/", bind_addr));
    }

    tracing::info!(
        "Starting tunegraph worker {} against {}",
        config.worker.name,
        config.coordinator.url()
    );

    let broker = Arc::new(coordinator_client(&config)?);
    let device_hash = worker::device_hash(&worker::host_name(), &config.worker.name);

    let runtime = Arc::new(WorkerRuntime::new(
        device_hash.clone(),
        config.worker.clone(),
        broker,
        registry,
        Arc::new(config.credential_resolver()),
        worker::http_clients(config.catalog.base_url.clone()),
    ));

    let shutdown = CancellationToken::new();
    shutdown::spawn_signal_listener(shutdown.clone());

    let liveness = tokio::spawn(worker::liveness::serve(
        bind_addr,
        device_hash,
        shutdown.clone(),
    ));

    let result = runtime.run(shutdown.clone()).await;
    shutdown.cancel();

    match liveness.await {
        Ok(Err(e)) => tracing::warn!("Liveness endpoint stopped with error: {:#}", e),
        Err(e) => tracing::warn!("Liveness task failed: {}", e),
        Ok(Ok(())) => {}
    }

    result
}
