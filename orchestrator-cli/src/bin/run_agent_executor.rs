//! Agent executor daemon. Ticks `AgentExecutor::tick()`, advancing claimed
//! `AgentRun`s through their pre-planned steps. Shares the same task
//! registrations as the dispatcher, since a `task_call` step executes the
//! identical `Task` trait object.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use orchestrator_core::agent::{AgentExecutor, AgentExecutorConfig};
use orchestrator_core::dispatcher::Task;
use orchestrator_core::domain::TaskKey;
use orchestrator_core::gpu_registry::GpuRegistry;
use orchestrator_core::host_registry::HostRegistry;
use orchestrator_core::llm_client::{LlmClient, RemoteLlmClient};
use orchestrator_core::store::Store;
use orchestrator_core::store_memory::MemoryStore;
use orchestrator_core::tasks::{GpuReportTask, LogTriageTask, RepoCopilotPlanTask, ServiceMapTask};
use orchestrator_core::worker::{BollardRuntime, ContainerRuntime, WorkerOrchestrator};
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "run-agent-executor")]
struct Args {
    /// Postgres connection string. Falls back to `DATABASE_URL`, then to an
    /// in-memory store if neither is set.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Seconds between ticks.
    #[arg(long, env = "AGENT_EXECUTOR_TICK_SECONDS", default_value_t = 2)]
    tick_seconds: u64,

    /// Claim lease, in seconds, held while an agent run is being advanced.
    #[arg(long, env = "AGENT_EXECUTOR_CLAIM_TTL_SECONDS", default_value_t = 300)]
    claim_ttl_seconds: i64,

    /// Max agent runs claimed per tick.
    #[arg(long, env = "AGENT_EXECUTOR_MAX_CLAIM", default_value_t = 10)]
    max_claim: usize,

    /// Root directory task artifacts are written under.
    #[arg(long, env = "LOGS_ROOT", default_value = "/var/log/orchestrator")]
    logs_root: String,

    /// Root directory mounted read-only into each worker container at
    /// `/uploads`.
    #[arg(long, env = "UPLOADS_ROOT", default_value = "/var/lib/orchestrator/uploads")]
    uploads_root: String,

    /// OpenAI/vLLM-compatible completion endpoint used by `log_triage` and
    /// `repo_copilot_plan`.
    #[arg(long, env = "LLM_ENDPOINT", default_value = "http://localhost:8000/v1")]
    llm_endpoint: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orchestrator_cli::logging::init_tracing()?;

    let args = Args::parse();

    let store: Arc<dyn Store> = match args.database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("connecting to Postgres");
            let pool = sqlx::PgPool::connect(&url).await?;
            let pg = orchestrator_core::store_postgres::PostgresStore::new(pool);
            pg.migrate().await?;
            tracing::info!("using PostgresStore (migrations applied)");
            Arc::new(pg)
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!("--database-url set but postgres feature not enabled, using MemoryStore");
            Arc::new(MemoryStore::new())
        }
        None => {
            tracing::info!("using MemoryStore (no database URL configured)");
            Arc::new(MemoryStore::new())
        }
    };

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(BollardRuntime);
    let llm: Arc<dyn LlmClient> = Arc::new(RemoteLlmClient::default());

    let hosts = Arc::new(HostRegistry::new(store.clone()));
    let gpus = Arc::new(GpuRegistry::new(store.clone()));
    let worker = Arc::new(WorkerOrchestrator::new(
        store.clone(),
        hosts,
        gpus,
        runtime.clone(),
        args.logs_root.clone(),
        args.uploads_root.clone(),
    ));

    let mut tasks: HashMap<TaskKey, Arc<dyn Task>> = HashMap::new();
    tasks.insert(
        TaskKey::LogTriage,
        Arc::new(LogTriageTask::new(
            store.clone(),
            runtime,
            llm.clone(),
            args.llm_endpoint.clone(),
            args.logs_root.clone(),
        )),
    );
    tasks.insert(TaskKey::GpuReport, Arc::new(GpuReportTask::new(store.clone(), args.logs_root.clone())));
    tasks.insert(TaskKey::ServiceMap, Arc::new(ServiceMapTask::new(store.clone(), args.logs_root.clone())));
    tasks.insert(
        TaskKey::RepoCopilotPlan,
        Arc::new(RepoCopilotPlanTask::new(store.clone(), llm, args.llm_endpoint.clone(), args.logs_root.clone())),
    );

    let claimant = format!("agent-executor-{}", uuid::Uuid::new_v4());
    let executor = AgentExecutor::new(
        store,
        tasks,
        worker,
        AgentExecutorConfig {
            claimant,
            claim_ttl: chrono::Duration::seconds(args.claim_ttl_seconds),
            max_claim: args.max_claim,
        },
    );

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(tick_seconds = args.tick_seconds, "agent executor started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match executor.tick().await {
            Ok(report) => {
                if report.advanced > 0 || report.skipped_for_approval > 0 {
                    tracing::info!(
                        advanced = report.advanced,
                        skipped_for_approval = report.skipped_for_approval,
                        "agent executor tick"
                    );
                }
            }
            Err(e) => tracing::error!(error = %e, "agent executor tick failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(args.tick_seconds)) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!("agent executor shut down");
    Ok(())
}
