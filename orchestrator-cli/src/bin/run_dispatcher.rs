//! Dispatcher daemon. Ticks `Dispatcher::tick()`, with the full closed set of
//! task keys (`log_triage`, `gpu_report`, `service_map`, `repo_copilot_plan`)
//! registered against real capability implementations: `BollardRuntime` for
//! container log collection, `RemoteLlmClient` for completions.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use orchestrator_core::dispatcher::{Dispatcher, DispatcherConfig};
use orchestrator_core::gpu_registry::GpuRegistry;
use orchestrator_core::host_registry::HostRegistry;
use orchestrator_core::llm_client::{LlmClient, RemoteLlmClient};
use orchestrator_core::notify::{Notifier, WebhookSink};
use orchestrator_core::store::Store;
use orchestrator_core::store_memory::MemoryStore;
use orchestrator_core::tasks::{GpuReportTask, LogTriageTask, RepoCopilotPlanTask, ServiceMapTask};
use orchestrator_core::worker::{BollardRuntime, ContainerRuntime, WorkerOrchestrator};
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "run-dispatcher")]
struct Args {
    /// Postgres connection string. Falls back to `DATABASE_URL`, then to an
    /// in-memory store if neither is set.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Seconds between ticks.
    #[arg(long, env = "DISPATCHER_TICK_SECONDS", default_value_t = 2)]
    tick_seconds: u64,

    /// Claim lease, in seconds, held while a queue item is being executed.
    #[arg(long, env = "DISPATCHER_CLAIM_TTL_SECONDS", default_value_t = 300)]
    claim_ttl_seconds: i64,

    /// Max queue items claimed per tick.
    #[arg(long, env = "DISPATCHER_MAX_CLAIM", default_value_t = 10)]
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
    let notifier = Arc::new(Notifier::new(store.clone(), Arc::new(WebhookSink::default())));

    let claimant = format!("dispatcher-{}", uuid::Uuid::new_v4());
    let mut dispatcher = Dispatcher::new(
        store.clone(),
        worker,
        notifier,
        DispatcherConfig {
            claimant,
            claim_ttl: chrono::Duration::seconds(args.claim_ttl_seconds),
            max_claim: args.max_claim,
        },
    );

    dispatcher.register_task(Arc::new(LogTriageTask::new(
        store.clone(),
        runtime,
        llm.clone(),
        args.llm_endpoint.clone(),
        args.logs_root.clone(),
    )));
    dispatcher.register_task(Arc::new(GpuReportTask::new(store.clone(), args.logs_root.clone())));
    dispatcher.register_task(Arc::new(ServiceMapTask::new(store.clone(), args.logs_root.clone())));
    dispatcher.register_task(Arc::new(RepoCopilotPlanTask::new(
        store.clone(),
        llm,
        args.llm_endpoint.clone(),
        args.logs_root.clone(),
    )));

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(tick_seconds = args.tick_seconds, "dispatcher started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match dispatcher.tick().await {
            Ok(report) => {
                if report.completed > 0 || report.failed > 0 || report.skipped > 0 {
                    tracing::info!(
                        completed = report.completed,
                        failed = report.failed,
                        skipped = report.skipped,
                        "dispatcher tick"
                    );
                }
            }
            Err(e) => tracing::error!(error = %e, "dispatcher tick failed"),
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

    tracing::info!("dispatcher shut down");
    Ok(())
}
