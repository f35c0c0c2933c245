//! Integration tests: exercise the full schedule → run → job → notification
//! lifecycle through the engine facades (`Scheduler`, `Dispatcher`,
//! `Notifier`), the same pipeline the CLI binaries drive tick by tick.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use uuid::Uuid;

use orchestrator_core::dispatcher::{Dispatcher, DispatcherConfig, Task};
use orchestrator_core::domain::*;
use orchestrator_core::gpu_registry::GpuRegistry;
use orchestrator_core::guardrail;
use orchestrator_core::host_registry::HostRegistry;
use orchestrator_core::notify::{NotificationPayload, NotificationSink, Notifier};
use orchestrator_core::scheduler::{Scheduler, SchedulerConfig};
use orchestrator_core::store::Store;
use orchestrator_core::store_memory::MemoryStore;
use orchestrator_core::worker::{NullContainerRuntime, WorkerOrchestrator};

fn directive() -> Directive {
    Directive {
        id: Uuid::new_v4(),
        name: "nightly-log-scan".into(),
        directive_type: DirectiveType::D1,
        description: "scan container logs for anomalies".into(),
        task_config: serde_json::json!({}),
        task_list: vec!["log_triage".into()],
        version: 1,
        is_active: true,
    }
}

struct EchoTask;

#[async_trait]
impl Task for EchoTask {
    fn key(&self) -> TaskKey {
        TaskKey::LogTriage
    }

    async fn execute(&self, _job: &Job) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::json!({"summary": "no anomalies", "total_tokens": 42}))
    }
}

#[derive(Default)]
struct RecordingSink {
    delivered: tokio::sync::Mutex<Vec<(Uuid, RunStatus)>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, target: &NotificationTarget, payload: &NotificationPayload) -> anyhow::Result<()> {
        self.delivered.lock().await.push((target.id, payload.status));
        Ok(())
    }
}

async fn seed_worker_host(store: &Arc<MemoryStore>, task_type: TaskKey) {
    store
        .save_host(WorkerHost {
            id: Uuid::new_v4(),
            name: "test-host".into(),
            kind: HostKind::LocalSocket,
            endpoint: "unix:///var/run/docker.sock".into(),
            is_enabled: true,
            health: HostHealth::Healthy,
            last_heartbeat_at: Some(orchestrator_core::clock::now()),
            has_gpu: false,
            max_concurrent_runs: 10,
            active_runs_count: 0,
        })
        .await
        .unwrap();

    let (image_name, image_tag) = orchestrator_core::dispatcher::worker_image_for(task_type);
    store
        .seed_image_allowlist(WorkerImageAllowlist {
            image_name: image_name.into(),
            image_tag: image_tag.into(),
            requires_gpu: false,
            min_vram_mb: 0,
            is_active: true,
        })
        .await;
}

fn test_worker(store: Arc<MemoryStore>) -> Arc<WorkerOrchestrator> {
    let hosts = Arc::new(HostRegistry::new(store.clone()));
    let gpus = Arc::new(GpuRegistry::new(store.clone()));
    Arc::new(WorkerOrchestrator::new(
        store,
        hosts,
        gpus,
        Arc::new(NullContainerRuntime),
        "/tmp/orchestrator-test-logs".into(),
        "/tmp/orchestrator-test-uploads".into(),
    ))
}

/// Full pipeline: a due schedule fires a run, the dispatcher completes its one
/// job, and the notifier delivers a terminal notification for it — this is
/// scenario S1/S6 from the original spec (fire, complete, notify).
#[tokio::test]
async fn schedule_fire_to_notification_end_to_end() {
    let store = Arc::new(MemoryStore::new());
    let hosts = Arc::new(HostRegistry::new(store.clone()));
    seed_worker_host(&store, TaskKey::LogTriage).await;

    let d = directive();
    store.upsert_directive(d.clone()).await.unwrap();

    let job_template = JobTemplate {
        id: Uuid::new_v4(),
        name: "nightly".into(),
        task_type: TaskKey::LogTriage,
        default_config: serde_json::json!({}),
        is_active: true,
    };
    store.upsert_job_template(job_template.clone()).await.unwrap();

    let schedule = Schedule {
        id: Uuid::new_v4(),
        name: "nightly-log-scan".into(),
        job_id: job_template.id,
        directive_id: d.id,
        kind: ScheduleKind::Interval { seconds: 3600 },
        next_run_at: Some(orchestrator_core::clock::now() - Duration::seconds(1)),
        last_fire_at: None,
        is_enabled: true,
        max_concurrent_global: 5,
        max_concurrent_per_job: 5,
        claimed_by: None,
        claimed_until: None,
    };
    store.save_schedule(schedule).await.unwrap();

    store
        .seed_notification_target(NotificationTarget {
            id: Uuid::new_v4(),
            channel: NotificationChannel::Webhook,
            address: "http://example.test/hook".into(),
            is_enabled: true,
            notify_on_statuses: vec![RunStatus::Success, RunStatus::Failed],
        })
        .await;

    let scheduler = Scheduler::new(
        store.clone(),
        hosts,
        SchedulerConfig {
            claimant: "scheduler-test".into(),
            claim_ttl: Duration::seconds(120),
            max_claim: 10,
        },
    );
    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.fired, 1);

    let sink = Arc::new(RecordingSink::default());
    let notifier = Arc::new(Notifier::new(store.clone(), sink.clone()));

    let mut dispatcher = Dispatcher::new(
        store.clone(),
        test_worker(store.clone()),
        notifier,
        DispatcherConfig {
            claimant: "dispatcher-test".into(),
            claim_ttl: Duration::seconds(120),
            max_claim: 10,
        },
    );
    dispatcher.register_task(Arc::new(EchoTask));
    let report = dispatcher.tick().await.unwrap();
    assert_eq!(report.completed, 1);

    let run = store
        .get_last_successful_run(job_template.id)
        .await
        .unwrap()
        .expect("completed job should produce a successful run");
    assert_eq!(run.status, RunStatus::Success);
    assert!(run.assigned_host_id.is_some());

    let delivered = sink.delivered.lock().await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].1, RunStatus::Success);
}

/// A blocked schedule (global concurrency already saturated) is deferred, not
/// disabled or dropped — this is scenario S2 from the original spec.
#[tokio::test]
async fn concurrency_limit_defers_schedule_instead_of_firing() {
    let store = Arc::new(MemoryStore::new());
    let hosts = Arc::new(HostRegistry::new(store.clone()));

    let d = directive();
    store.upsert_directive(d.clone()).await.unwrap();

    let job_template = JobTemplate {
        id: Uuid::new_v4(),
        name: "nightly".into(),
        task_type: TaskKey::LogTriage,
        default_config: serde_json::json!({}),
        is_active: true,
    };
    store.upsert_job_template(job_template.clone()).await.unwrap();

    // An already-running run against the same job template saturates the
    // per-job concurrency gate.
    let mut existing_run = store.create_run(Run::new(DirectiveSnapshot::from(&d))).await.unwrap();
    existing_run.status = RunStatus::Running;
    let existing_run_id = existing_run.id;
    store.update_run(existing_run).await.unwrap();
    store
        .create_job(Job {
            id: Uuid::new_v4(),
            run_id: existing_run_id,
            job_template_id: job_template.id,
            task_type: TaskKey::LogTriage,
            config: serde_json::json!({}),
            status: JobStatus::Running,
            result: None,
            last_error: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
        })
        .await
        .unwrap();

    let schedule = Schedule {
        id: Uuid::new_v4(),
        name: "nightly".into(),
        job_id: job_template.id,
        directive_id: d.id,
        kind: ScheduleKind::Interval { seconds: 60 },
        next_run_at: Some(orchestrator_core::clock::now() - Duration::seconds(1)),
        last_fire_at: None,
        is_enabled: true,
        max_concurrent_global: 10,
        max_concurrent_per_job: 1,
        claimed_by: None,
        claimed_until: None,
    };
    store.save_schedule(schedule).await.unwrap();

    let scheduler = Scheduler::new(
        store.clone(),
        hosts,
        SchedulerConfig {
            claimant: "scheduler-test".into(),
            claim_ttl: Duration::seconds(120),
            max_claim: 10,
        },
    );
    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(report.fired, 0);
}

/// A worker self-report carrying a forbidden field (e.g. raw LLM prompt text)
/// is rejected before it can reach the store — scenario S5 from the original
/// spec's privacy/redaction requirements.
#[test]
fn worker_self_report_with_prompt_text_is_rejected() {
    let payload = serde_json::json!({
        "container_id": "c-123",
        "prompt": "summarize these logs: ...",
    });
    let result = guardrail::assert_payload_has_no_forbidden_fields(&payload);
    assert!(result.is_err());
}
