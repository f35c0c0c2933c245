//! Job queue dispatcher. Claims due `JobQueueItem`s, executes each through a
//! `Task` dispatch table keyed by `TaskKey` (a flat match table stands in for
//! the original per-task class hierarchy — see the design notes), spawns and
//! tears down the ephemeral worker container backing each job via
//! `WorkerOrchestrator`, and derives the owning `Run`'s aggregate status from
//! all of its `Job`s every time a job finishes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use uuid::Uuid;

use crate::domain::*;
use crate::error::Result;
use crate::guardrail;
use crate::notify::Notifier;
use crate::store::Store;
use crate::worker::WorkerOrchestrator;

#[async_trait]
pub trait Task: Send + Sync {
    fn key(&self) -> TaskKey;
    async fn execute(&self, job: &Job) -> anyhow::Result<serde_json::Value>;
}

/// Canonical worker image backing each task type.
pub fn worker_image_for(task_type: TaskKey) -> (&'static str, &'static str) {
    match task_type {
        TaskKey::LogTriage => ("orchestrator/log-triage", "latest"),
        TaskKey::GpuReport => ("orchestrator/gpu-report", "latest"),
        TaskKey::ServiceMap => ("orchestrator/service-map", "latest"),
        TaskKey::RepoCopilotPlan => ("orchestrator/repo-copilot-plan", "latest"),
    }
}

pub struct DispatcherConfig {
    pub claimant: String,
    pub claim_ttl: Duration,
    pub max_claim: usize,
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    tasks: HashMap<TaskKey, Arc<dyn Task>>,
    worker: Arc<WorkerOrchestrator>,
    notifier: Arc<Notifier>,
    config: DispatcherConfig,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        worker: Arc<WorkerOrchestrator>,
        notifier: Arc<Notifier>,
        config: DispatcherConfig,
    ) -> Self {
        Dispatcher {
            store,
            tasks: HashMap::new(),
            worker,
            notifier,
            config,
        }
    }

    pub fn register_task(&mut self, task: Arc<dyn Task>) {
        self.tasks.insert(task.key(), task);
    }

    pub async fn tick(&self) -> Result<TickReport> {
        self.worker.probe_all().await?;

        let mut report = TickReport::default();

        let claimed = self
            .store
            .claim_due_queue_items(&self.config.claimant, self.config.claim_ttl, self.config.max_claim)
            .await?;

        for item in claimed {
            match self.process_one(item).await {
                Ok(Outcome::Completed) => report.completed += 1,
                Ok(Outcome::Failed) => report.failed += 1,
                Ok(Outcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    tracing::error!(error = %e, "dispatcher tick failed for queue item, continuing");
                }
            }
        }

        Ok(report)
    }

    async fn process_one(&self, mut item: JobQueueItem) -> Result<Outcome> {
        let mut job = match self.store.get_job(item.job_id).await? {
            Some(j) => j,
            None => {
                item.status = QueueItemStatus::Failed;
                item.last_error = Some("job not found".into());
                self.store.update_queue_item(item).await?;
                return Ok(Outcome::Failed);
            }
        };

        if job.status.is_terminal() {
            item.status = QueueItemStatus::Completed;
            self.store.update_queue_item(item).await?;
            return Ok(Outcome::Skipped);
        }

        item.status = QueueItemStatus::Running;
        self.store.update_queue_item(item.clone()).await?;

        let mut run = self.store.get_run(job.run_id).await?;
        if let Some(r) = run.as_mut() {
            if r.status == RunStatus::Pending {
                r.status = RunStatus::Running;
                r.started_at = Some(crate::clock::now());
            }
            *r = self.store.update_run(r.clone()).await?;
        }

        job.status = JobStatus::Running;
        self.store.update_job(job.clone()).await?;

        let target_host_id = run.as_ref().and_then(|r| r.assigned_host_id);
        let (job, assigned_host_id) = run_job(&self.store, &self.tasks, &self.worker, job, target_host_id).await?;

        if let (Some(host_id), Some(mut r)) = (assigned_host_id, run) {
            if r.assigned_host_id.is_none() {
                r.assigned_host_id = Some(host_id);
                self.store.update_run(r).await?;
            }
        }

        match job.status {
            JobStatus::Success => {
                item.status = QueueItemStatus::Completed;
                self.store.update_queue_item(item).await?;
                self.update_run_status(job.run_id).await?;
                Ok(Outcome::Completed)
            }
            _ => {
                item.status = QueueItemStatus::Failed;
                item.last_error = job.last_error.clone();
                self.store.update_queue_item(item).await?;
                self.update_run_status(job.run_id).await?;
                Ok(Outcome::Failed)
            }
        }
    }

    /// Derives `Run.status` from the statuses of all of its `Job`s: any job
    /// still running or pending keeps the run non-terminal; once every job is
    /// terminal, all-success is `Success`, all-failed is `Failed`, and a mix
    /// is `Partial`. Delivers a terminal notification once the derived status
    /// lands on one of those terminal values.
    async fn update_run_status(&self, run_id: Uuid) -> Result<()> {
        let jobs = self.store.jobs_for_run(run_id).await?;
        let mut run = match self.store.get_run(run_id).await? {
            Some(r) => r,
            None => return Ok(()),
        };

        if jobs.iter().any(|j| j.status == JobStatus::Running) {
            run.status = RunStatus::Running;
        } else if jobs.iter().any(|j| j.status == JobStatus::Pending) {
            run.status = RunStatus::Pending;
        } else {
            let success_count = jobs.iter().filter(|j| j.status == JobStatus::Success).count();
            let failed_count = jobs.iter().filter(|j| j.status == JobStatus::Failed).count();
            run.status = if failed_count == 0 {
                RunStatus::Success
            } else if success_count == 0 {
                RunStatus::Failed
            } else {
                RunStatus::Partial
            };
            if run.status.is_terminal() {
                run.ended_at = Some(crate::clock::now());
                run.total_prompt_tokens = jobs.iter().map(|j| j.prompt_tokens).sum();
                run.total_completion_tokens = jobs.iter().map(|j| j.completion_tokens).sum();
                run.total_tokens = jobs.iter().map(|j| j.total_tokens).sum();
            }
        }

        let run = self.store.update_run(run).await?;
        if run.status.is_terminal() {
            if let Err(e) = self.notifier.notify_run_terminal(&run).await {
                tracing::warn!(run_id = %run.id, error = %e, "failed to deliver terminal run notification");
            }
        }
        Ok(())
    }
}

enum Outcome {
    Completed,
    Failed,
    Skipped,
}

/// Spawns the worker container backing `job`, runs its registered `Task`,
/// tears the container back down, and persists the final job status,
/// rejecting a result payload the guardrail flags before it is ever stored.
/// Shared by the dispatcher's queue-driven path and the agent executor's
/// inline `task_call` path so both run jobs through the identical
/// host/GPU/guardrail pipeline. Returns the persisted job plus the id of the
/// host it ran on, if a host was actually selected.
pub async fn run_job(
    store: &Arc<dyn Store>,
    tasks: &HashMap<TaskKey, Arc<dyn Task>>,
    worker: &WorkerOrchestrator,
    mut job: Job,
    target_host_id: Option<Uuid>,
) -> Result<(Job, Option<Uuid>)> {
    let (image_name, image_tag) = worker_image_for(job.task_type);

    let (host, spawned) = match worker.spawn_worker(job.id, image_name, image_tag, target_host_id, None).await {
        Ok(pair) => pair,
        Err(e) => {
            job.status = JobStatus::Failed;
            job.last_error = Some(e.to_string());
            let job = store.update_job(job).await?;
            return Ok((job, None));
        }
    };

    let outcome = match tasks.get(&job.task_type) {
        Some(task) => task.execute(&job).await,
        None => Err(anyhow::anyhow!("no task registered for {:?}", job.task_type)),
    };

    if let Err(e) = worker.stop_worker(&host, &spawned.container_id).await {
        tracing::warn!(container_id = %spawned.container_id, error = %e, "failed to stop worker container");
    }

    match outcome {
        Ok(result) => match guardrail::assert_payload_has_no_forbidden_fields(&result) {
            Ok(()) => {
                job.status = JobStatus::Success;
                job.result = Some(result);
            }
            Err(e) => {
                job.status = JobStatus::Failed;
                job.last_error = Some(e.to_string());
            }
        },
        Err(e) => {
            job.status = JobStatus::Failed;
            job.last_error = Some(e.to_string());
        }
    }

    let job = store.update_job(job).await?;
    Ok((job, Some(host.id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu_registry::GpuRegistry;
    use crate::host_registry::HostRegistry;
    use crate::notify::{NotificationPayload, NotificationSink, Notifier};
    use crate::store_memory::MemoryStore;
    use crate::worker::NullContainerRuntime;

    struct EchoTask;

    #[async_trait]
    impl Task for EchoTask {
        fn key(&self) -> TaskKey {
            TaskKey::LogTriage
        }

        async fn execute(&self, _job: &Job) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({"ok": true}))
        }
    }

    struct FailingTask;

    #[async_trait]
    impl Task for FailingTask {
        fn key(&self) -> TaskKey {
            TaskKey::GpuReport
        }

        async fn execute(&self, _job: &Job) -> anyhow::Result<serde_json::Value> {
            Err(anyhow::anyhow!("boom"))
        }
    }

    struct DiscardingSink;

    #[async_trait]
    impl NotificationSink for DiscardingSink {
        async fn deliver(&self, _target: &NotificationTarget, _payload: &NotificationPayload) -> anyhow::Result<()> {
            Ok(())
        }
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

    fn test_notifier(store: Arc<MemoryStore>) -> Arc<Notifier> {
        Arc::new(Notifier::new(store, Arc::new(DiscardingSink)))
    }

    async fn seed_host_and_allowlist(store: &Arc<MemoryStore>, task_type: TaskKey) {
        store
            .save_host(WorkerHost {
                id: Uuid::new_v4(),
                name: "test-host".into(),
                kind: HostKind::LocalSocket,
                endpoint: "unix:///var/run/docker.sock".into(),
                is_enabled: true,
                health: HostHealth::Healthy,
                last_heartbeat_at: Some(crate::clock::now()),
                has_gpu: false,
                max_concurrent_runs: 10,
                active_runs_count: 0,
            })
            .await
            .unwrap();

        let (image_name, image_tag) = worker_image_for(task_type);
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

    async fn seeded_run_and_job(store: &Arc<MemoryStore>, task_type: TaskKey) -> (Uuid, Job) {
        seed_host_and_allowlist(store, task_type).await;

        let directive = Directive {
            id: Uuid::new_v4(),
            name: "d".into(),
            directive_type: DirectiveType::D1,
            description: "".into(),
            task_config: serde_json::json!({}),
            task_list: vec![],
            version: 1,
            is_active: true,
        };
        let job_template = JobTemplate {
            id: Uuid::new_v4(),
            name: "t".into(),
            task_type,
            default_config: serde_json::json!({}),
            is_active: true,
        };
        store.upsert_job_template(job_template.clone()).await.unwrap();
        let run = store.create_run(Run::new(DirectiveSnapshot::from(&directive))).await.unwrap();
        let job = store
            .create_job(Job {
                id: Uuid::new_v4(),
                run_id: run.id,
                job_template_id: job_template.id,
                task_type,
                config: serde_json::json!({}),
                status: JobStatus::Pending,
                result: None,
                last_error: None,
                prompt_tokens: 0,
                completion_tokens: 0,
                total_tokens: 0,
            })
            .await
            .unwrap();
        (run.id, job)
    }

    #[tokio::test]
    async fn successful_job_marks_run_success() {
        let store = Arc::new(MemoryStore::new());
        let (run_id, job) = seeded_run_and_job(&store, TaskKey::LogTriage).await;
        store
            .enqueue_job(JobQueueItem {
                id: Uuid::new_v4(),
                job_id: job.id,
                status: QueueItemStatus::Pending,
                created_at: crate::clock::now(),
                claimed_by: None,
                claimed_until: None,
                last_error: None,
            })
            .await
            .unwrap();

        let mut dispatcher = Dispatcher::new(
            store.clone(),
            test_worker(store.clone()),
            test_notifier(store.clone()),
            DispatcherConfig {
                claimant: "test".into(),
                claim_ttl: Duration::seconds(60),
                max_claim: 10,
            },
        );
        dispatcher.register_task(Arc::new(EchoTask));

        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.completed, 1);

        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert!(run.assigned_host_id.is_some());
    }

    #[tokio::test]
    async fn failing_job_marks_run_failed() {
        let store = Arc::new(MemoryStore::new());
        let (run_id, job) = seeded_run_and_job(&store, TaskKey::GpuReport).await;
        store
            .enqueue_job(JobQueueItem {
                id: Uuid::new_v4(),
                job_id: job.id,
                status: QueueItemStatus::Pending,
                created_at: crate::clock::now(),
                claimed_by: None,
                claimed_until: None,
                last_error: None,
            })
            .await
            .unwrap();

        let mut dispatcher = Dispatcher::new(
            store.clone(),
            test_worker(store.clone()),
            test_notifier(store.clone()),
            DispatcherConfig {
                claimant: "test".into(),
                claim_ttl: Duration::seconds(60),
                max_claim: 10,
            },
        );
        dispatcher.register_task(Arc::new(FailingTask));

        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.failed, 1);

        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn job_with_no_allowlisted_image_fails_without_running_the_task() {
        let store = Arc::new(MemoryStore::new());
        // No seed_host_and_allowlist call: the image is not on the allowlist.
        let directive = Directive {
            id: Uuid::new_v4(),
            name: "d".into(),
            directive_type: DirectiveType::D1,
            description: "".into(),
            task_config: serde_json::json!({}),
            task_list: vec![],
            version: 1,
            is_active: true,
        };
        let run = store.create_run(Run::new(DirectiveSnapshot::from(&directive))).await.unwrap();
        let job = store
            .create_job(Job {
                id: Uuid::new_v4(),
                run_id: run.id,
                job_template_id: Uuid::new_v4(),
                task_type: TaskKey::ServiceMap,
                config: serde_json::json!({}),
                status: JobStatus::Pending,
                result: None,
                last_error: None,
                prompt_tokens: 0,
                completion_tokens: 0,
                total_tokens: 0,
            })
            .await
            .unwrap();
        store
            .enqueue_job(JobQueueItem {
                id: Uuid::new_v4(),
                job_id: job.id,
                status: QueueItemStatus::Pending,
                created_at: crate::clock::now(),
                claimed_by: None,
                claimed_until: None,
                last_error: None,
            })
            .await
            .unwrap();

        let dispatcher = Dispatcher::new(
            store.clone(),
            test_worker(store.clone()),
            test_notifier(store.clone()),
            DispatcherConfig {
                claimant: "test".into(),
                claim_ttl: Duration::seconds(60),
                max_claim: 10,
            },
        );

        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.failed, 1);
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert!(job.last_error.unwrap().contains("allowlist"));
    }
}
