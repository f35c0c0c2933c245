//! Scheduler daemon. Ticks `Scheduler::tick()` on a fixed interval until
//! `ctrl_c` or SIGTERM, following the same bootstrap idiom (tracing + env
//! filter, CLI-arg-then-env `DATABASE_URL`, conditional Postgres/Memory
//! store) as the rest of this workspace's binaries.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use orchestrator_core::host_registry::HostRegistry;
use orchestrator_core::scheduler::{Scheduler, SchedulerConfig};
use orchestrator_core::store::Store;
use orchestrator_core::store_memory::MemoryStore;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "run-scheduler")]
struct Args {
    /// Postgres connection string. Falls back to `DATABASE_URL`, then to an
    /// in-memory store if neither is set.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Seconds between ticks.
    #[arg(long, env = "SCHEDULER_TICK_SECONDS", default_value_t = 5)]
    tick_seconds: u64,

    /// Claim lease, in seconds, held while a schedule is being fired.
    #[arg(long, env = "SCHEDULER_CLAIM_TTL_SECONDS", default_value_t = 30)]
    claim_ttl_seconds: i64,

    /// Max schedules claimed per tick.
    #[arg(long, env = "SCHEDULER_MAX_CLAIM", default_value_t = 50)]
    max_claim: usize,
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

    let hosts = Arc::new(HostRegistry::new(store.clone()));
    let claimant = format!("scheduler-{}", uuid::Uuid::new_v4());
    let scheduler = Scheduler::new(
        store,
        hosts,
        SchedulerConfig {
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

    tracing::info!(tick_seconds = args.tick_seconds, "scheduler started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match scheduler.tick().await {
            Ok(report) => {
                if report.fired > 0 || report.deferred > 0 || report.disabled > 0 {
                    tracing::info!(
                        fired = report.fired,
                        deferred = report.deferred,
                        disabled = report.disabled,
                        "scheduler tick"
                    );
                }
            }
            Err(e) => tracing::error!(error = %e, "scheduler tick failed"),
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

    tracing::info!("scheduler shut down");
    Ok(())
}
