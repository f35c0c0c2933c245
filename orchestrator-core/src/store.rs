//! Persistence trait for all orchestrator state. The scheduler, dispatcher,
//! agent executor, and worker orchestrator operate exclusively through this
//! trait, enabling pluggable backends (`MemoryStore` for tests, `PostgresStore`
//! for production).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::*;
use crate::error::Result;

#[async_trait]
pub trait Store: Send + Sync {
    // Directives
    async fn get_directive(&self, id: Uuid) -> Result<Option<Directive>>;
    async fn get_directive_by_name(&self, name: &str) -> Result<Option<Directive>>;
    async fn upsert_directive(&self, directive: Directive) -> Result<Directive>;

    // Job templates
    async fn get_job_template(&self, id: Uuid) -> Result<Option<JobTemplate>>;
    async fn upsert_job_template(&self, template: JobTemplate) -> Result<JobTemplate>;

    // Schedules
    async fn claim_due_schedules(
        &self,
        claimant: &str,
        lease: chrono::Duration,
        limit: usize,
        at: DateTime<Utc>,
    ) -> Result<Vec<Schedule>>;
    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>>;
    async fn save_schedule(&self, schedule: Schedule) -> Result<Schedule>;
    async fn release_schedule_claim(&self, id: Uuid) -> Result<()>;
    async fn record_scheduled_run(&self, row: ScheduledRun) -> Result<()>;

    // Runs
    async fn create_run(&self, run: Run) -> Result<Run>;
    async fn get_run(&self, id: Uuid) -> Result<Option<Run>>;
    async fn update_run(&self, run: Run) -> Result<Run>;
    async fn count_running_runs(&self) -> Result<i64>;
    async fn count_running_runs_for_job(&self, job_template_id: Uuid) -> Result<i64>;
    async fn get_last_successful_run(&self, job_template_id: Uuid) -> Result<Option<Run>>;

    // Jobs
    async fn create_job(&self, job: Job) -> Result<Job>;
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;
    async fn update_job(&self, job: Job) -> Result<Job>;
    async fn jobs_for_run(&self, run_id: Uuid) -> Result<Vec<Job>>;

    // Job queue
    async fn enqueue_job(&self, item: JobQueueItem) -> Result<JobQueueItem>;
    async fn claim_due_queue_items(
        &self,
        claimant: &str,
        lease: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<JobQueueItem>>;
    async fn update_queue_item(&self, item: JobQueueItem) -> Result<JobQueueItem>;

    // Artifacts
    async fn save_artifact(&self, artifact: RunArtifact) -> Result<RunArtifact>;

    // LLM calls (guarded — see crate::guardrail)
    async fn record_llm_call(&self, call: LlmCall) -> Result<LlmCall>;
    async fn llm_calls_for_job(&self, job_id: Uuid) -> Result<Vec<LlmCall>>;

    // Worker hosts
    async fn list_hosts(&self) -> Result<Vec<WorkerHost>>;
    async fn get_host(&self, id: Uuid) -> Result<Option<WorkerHost>>;
    async fn save_host(&self, host: WorkerHost) -> Result<WorkerHost>;

    // GPUs
    async fn list_gpus(&self, host_id: Uuid) -> Result<Vec<GpuState>>;
    async fn list_all_gpus(&self) -> Result<Vec<GpuState>>;
    async fn save_gpu(&self, gpu: GpuState) -> Result<GpuState>;

    // Allowlists
    async fn get_image_allowlist_entry(
        &self,
        image_name: &str,
        image_tag: &str,
    ) -> Result<Option<WorkerImageAllowlist>>;
    async fn is_container_allowed(&self, container_id: &str) -> Result<bool>;
    async fn list_enabled_containers(&self) -> Result<Vec<ContainerAllowlist>>;

    // Container snapshots
    async fn save_container_snapshot(&self, snapshot: ContainerSnapshot) -> Result<()>;

    // Worker audit
    async fn append_worker_audit(&self, audit: WorkerAudit) -> Result<WorkerAudit>;

    // Agent runs
    async fn create_agent_run(&self, run: AgentRun) -> Result<AgentRun>;
    async fn get_agent_run(&self, id: Uuid) -> Result<Option<AgentRun>>;
    async fn update_agent_run(&self, run: AgentRun) -> Result<AgentRun>;
    async fn claim_due_agent_runs(
        &self,
        claimant: &str,
        lease: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<AgentRun>>;

    // Agent steps
    async fn create_agent_step(&self, step: AgentStep) -> Result<AgentStep>;
    async fn update_agent_step(&self, step: AgentStep) -> Result<AgentStep>;
    async fn steps_for_agent_run(&self, agent_run_id: Uuid) -> Result<Vec<AgentStep>>;

    // Notifications
    async fn list_notification_targets(&self) -> Result<Vec<NotificationTarget>>;
    async fn record_run_notification(&self, notification: RunNotification) -> Result<()>;
}
