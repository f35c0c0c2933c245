//! In-memory `Store` backend. Used by unit/integration tests and as the
//! zero-dependency fallback when `DATABASE_URL` is unset.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::*;
use crate::error::Result;
use crate::store::Store;

#[derive(Default)]
struct Inner {
    directives: HashMap<Uuid, Directive>,
    job_templates: HashMap<Uuid, JobTemplate>,
    schedules: HashMap<Uuid, Schedule>,
    scheduled_runs: Vec<ScheduledRun>,
    runs: HashMap<Uuid, Run>,
    jobs: HashMap<Uuid, Job>,
    queue: HashMap<Uuid, JobQueueItem>,
    artifacts: Vec<RunArtifact>,
    llm_calls: Vec<LlmCall>,
    hosts: HashMap<Uuid, WorkerHost>,
    gpus: HashMap<String, GpuState>,
    image_allowlist: HashMap<(String, String), WorkerImageAllowlist>,
    container_allowlist: HashMap<String, ContainerAllowlist>,
    container_snapshots: Vec<ContainerSnapshot>,
    worker_audits: Vec<WorkerAudit>,
    agent_runs: HashMap<Uuid, AgentRun>,
    agent_steps: HashMap<Uuid, AgentStep>,
    notification_targets: HashMap<Uuid, NotificationTarget>,
    run_notifications: Vec<RunNotification>,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Test/seed helper — not part of the `Store` trait.
    pub async fn seed_image_allowlist(&self, entry: WorkerImageAllowlist) {
        let mut inner = self.inner.write().await;
        inner
            .image_allowlist
            .insert((entry.image_name.clone(), entry.image_tag.clone()), entry);
    }

    pub async fn seed_container_allowlist(&self, entry: ContainerAllowlist) {
        let mut inner = self.inner.write().await;
        inner.container_allowlist.insert(entry.container_id.clone(), entry);
    }

    pub async fn seed_notification_target(&self, target: NotificationTarget) {
        let mut inner = self.inner.write().await;
        inner.notification_targets.insert(target.id, target);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_directive(&self, id: Uuid) -> Result<Option<Directive>> {
        Ok(self.inner.read().await.directives.get(&id).cloned())
    }

    async fn get_directive_by_name(&self, name: &str) -> Result<Option<Directive>> {
        Ok(self
            .inner
            .read()
            .await
            .directives
            .values()
            .find(|d| d.name == name)
            .cloned())
    }

    async fn upsert_directive(&self, directive: Directive) -> Result<Directive> {
        let mut inner = self.inner.write().await;
        inner.directives.insert(directive.id, directive.clone());
        Ok(directive)
    }

    async fn get_job_template(&self, id: Uuid) -> Result<Option<JobTemplate>> {
        Ok(self.inner.read().await.job_templates.get(&id).cloned())
    }

    async fn upsert_job_template(&self, template: JobTemplate) -> Result<JobTemplate> {
        let mut inner = self.inner.write().await;
        inner.job_templates.insert(template.id, template.clone());
        Ok(template)
    }

    async fn claim_due_schedules(
        &self,
        claimant: &str,
        lease: chrono::Duration,
        limit: usize,
        at: DateTime<Utc>,
    ) -> Result<Vec<Schedule>> {
        let mut inner = self.inner.write().await;
        let mut due: Vec<Uuid> = inner
            .schedules
            .values()
            .filter(|s| s.is_due(at) && !s.is_claimed(at))
            .map(|s| s.id)
            .collect();
        due.sort();
        due.truncate(limit);
        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(s) = inner.schedules.get_mut(&id) {
                s.claimed_by = Some(claimant.to_string());
                s.claimed_until = Some(at + lease);
                claimed.push(s.clone());
            }
        }
        Ok(claimed)
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>> {
        Ok(self.inner.read().await.schedules.get(&id).cloned())
    }

    async fn save_schedule(&self, schedule: Schedule) -> Result<Schedule> {
        let mut inner = self.inner.write().await;
        inner.schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn release_schedule_claim(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(s) = inner.schedules.get_mut(&id) {
            s.claimed_by = None;
            s.claimed_until = None;
        }
        Ok(())
    }

    async fn record_scheduled_run(&self, row: ScheduledRun) -> Result<()> {
        self.inner.write().await.scheduled_runs.push(row);
        Ok(())
    }

    async fn create_run(&self, run: Run) -> Result<Run> {
        let mut inner = self.inner.write().await;
        inner.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>> {
        Ok(self.inner.read().await.runs.get(&id).cloned())
    }

    async fn update_run(&self, run: Run) -> Result<Run> {
        let mut inner = self.inner.write().await;
        inner.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn count_running_runs(&self) -> Result<i64> {
        Ok(self
            .inner
            .read()
            .await
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Running)
            .count() as i64)
    }

    async fn count_running_runs_for_job(&self, job_template_id: Uuid) -> Result<i64> {
        let inner = self.inner.read().await;
        let running_run_ids: std::collections::HashSet<Uuid> = inner
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Running)
            .map(|r| r.id)
            .collect();
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.job_template_id == job_template_id && running_run_ids.contains(&j.run_id))
            .count() as i64)
    }

    async fn get_last_successful_run(&self, job_template_id: Uuid) -> Result<Option<Run>> {
        let inner = self.inner.read().await;
        let mut candidates: Vec<&Run> = inner
            .jobs
            .values()
            .filter(|j| j.job_template_id == job_template_id && j.status == JobStatus::Success)
            .filter_map(|j| inner.runs.get(&j.run_id))
            .filter(|r| r.status == RunStatus::Success)
            .collect();
        candidates.sort_by_key(|r| r.ended_at);
        Ok(candidates.last().cloned().cloned())
    }

    async fn create_job(&self, job: Job) -> Result<Job> {
        let mut inner = self.inner.write().await;
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.inner.read().await.jobs.get(&id).cloned())
    }

    async fn update_job(&self, job: Job) -> Result<Job> {
        let mut inner = self.inner.write().await;
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn jobs_for_run(&self, run_id: Uuid) -> Result<Vec<Job>> {
        Ok(self
            .inner
            .read()
            .await
            .jobs
            .values()
            .filter(|j| j.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn enqueue_job(&self, item: JobQueueItem) -> Result<JobQueueItem> {
        let mut inner = self.inner.write().await;
        inner.queue.insert(item.id, item.clone());
        Ok(item)
    }

    async fn claim_due_queue_items(
        &self,
        claimant: &str,
        lease: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<JobQueueItem>> {
        let at = Utc::now();
        let mut inner = self.inner.write().await;
        let mut due: Vec<Uuid> = inner
            .queue
            .values()
            .filter(|q| {
                q.status == QueueItemStatus::Pending
                    && !matches!(q.claimed_until, Some(t) if t > at)
            })
            .map(|q| q.id)
            .collect();
        due.sort_by_key(|id| inner.queue[id].created_at);
        due.truncate(limit);
        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(q) = inner.queue.get_mut(&id) {
                q.status = QueueItemStatus::Claimed;
                q.claimed_by = Some(claimant.to_string());
                q.claimed_until = Some(at + lease);
                claimed.push(q.clone());
            }
        }
        Ok(claimed)
    }

    async fn update_queue_item(&self, item: JobQueueItem) -> Result<JobQueueItem> {
        let mut inner = self.inner.write().await;
        inner.queue.insert(item.id, item.clone());
        Ok(item)
    }

    async fn save_artifact(&self, artifact: RunArtifact) -> Result<RunArtifact> {
        self.inner.write().await.artifacts.push(artifact.clone());
        Ok(artifact)
    }

    async fn record_llm_call(&self, call: LlmCall) -> Result<LlmCall> {
        crate::guardrail::assert_no_forbidden_content(&call)?;
        self.inner.write().await.llm_calls.push(call.clone());
        Ok(call)
    }

    async fn llm_calls_for_job(&self, job_id: Uuid) -> Result<Vec<LlmCall>> {
        Ok(self
            .inner
            .read()
            .await
            .llm_calls
            .iter()
            .filter(|c| c.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn list_hosts(&self) -> Result<Vec<WorkerHost>> {
        Ok(self.inner.read().await.hosts.values().cloned().collect())
    }

    async fn get_host(&self, id: Uuid) -> Result<Option<WorkerHost>> {
        Ok(self.inner.read().await.hosts.get(&id).cloned())
    }

    async fn save_host(&self, host: WorkerHost) -> Result<WorkerHost> {
        let mut inner = self.inner.write().await;
        inner.hosts.insert(host.id, host.clone());
        Ok(host)
    }

    async fn list_gpus(&self, host_id: Uuid) -> Result<Vec<GpuState>> {
        Ok(self
            .inner
            .read()
            .await
            .gpus
            .values()
            .filter(|g| g.host_id == host_id)
            .cloned()
            .collect())
    }

    async fn list_all_gpus(&self) -> Result<Vec<GpuState>> {
        Ok(self.inner.read().await.gpus.values().cloned().collect())
    }

    async fn save_gpu(&self, gpu: GpuState) -> Result<GpuState> {
        let mut inner = self.inner.write().await;
        inner.gpus.insert(gpu.gpu_id.clone(), gpu.clone());
        Ok(gpu)
    }

    async fn get_image_allowlist_entry(
        &self,
        image_name: &str,
        image_tag: &str,
    ) -> Result<Option<WorkerImageAllowlist>> {
        Ok(self
            .inner
            .read()
            .await
            .image_allowlist
            .get(&(image_name.to_string(), image_tag.to_string()))
            .cloned())
    }

    async fn is_container_allowed(&self, container_id: &str) -> Result<bool> {
        Ok(self
            .inner
            .read()
            .await
            .container_allowlist
            .get(container_id)
            .map(|c| c.is_active)
            .unwrap_or(false))
    }

    async fn list_enabled_containers(&self) -> Result<Vec<ContainerAllowlist>> {
        Ok(self
            .inner
            .read()
            .await
            .container_allowlist
            .values()
            .filter(|c| c.is_active)
            .cloned()
            .collect())
    }

    async fn save_container_snapshot(&self, snapshot: ContainerSnapshot) -> Result<()> {
        self.inner.write().await.container_snapshots.push(snapshot);
        Ok(())
    }

    async fn append_worker_audit(&self, audit: WorkerAudit) -> Result<WorkerAudit> {
        self.inner.write().await.worker_audits.push(audit.clone());
        Ok(audit)
    }

    async fn create_agent_run(&self, run: AgentRun) -> Result<AgentRun> {
        let mut inner = self.inner.write().await;
        inner.agent_runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_agent_run(&self, id: Uuid) -> Result<Option<AgentRun>> {
        Ok(self.inner.read().await.agent_runs.get(&id).cloned())
    }

    async fn update_agent_run(&self, run: AgentRun) -> Result<AgentRun> {
        let mut inner = self.inner.write().await;
        inner.agent_runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn claim_due_agent_runs(
        &self,
        claimant: &str,
        lease: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<AgentRun>> {
        let at = Utc::now();
        let mut inner = self.inner.write().await;
        let mut due: Vec<Uuid> = inner
            .agent_runs
            .values()
            .filter(|r| {
                !r.status.is_terminal()
                    && r.status != AgentRunStatus::PendingApproval
                    && !matches!(r.claimed_until, Some(t) if t > at)
            })
            .map(|r| r.id)
            .collect();
        due.sort();
        due.truncate(limit);
        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(r) = inner.agent_runs.get_mut(&id) {
                r.claimed_by = Some(claimant.to_string());
                r.claimed_until = Some(at + lease);
                claimed.push(r.clone());
            }
        }
        Ok(claimed)
    }

    async fn create_agent_step(&self, step: AgentStep) -> Result<AgentStep> {
        let mut inner = self.inner.write().await;
        inner.agent_steps.insert(step.id, step.clone());
        Ok(step)
    }

    async fn update_agent_step(&self, step: AgentStep) -> Result<AgentStep> {
        let mut inner = self.inner.write().await;
        inner.agent_steps.insert(step.id, step.clone());
        Ok(step)
    }

    async fn steps_for_agent_run(&self, agent_run_id: Uuid) -> Result<Vec<AgentStep>> {
        let mut steps: Vec<AgentStep> = self
            .inner
            .read()
            .await
            .agent_steps
            .values()
            .filter(|s| s.agent_run_id == agent_run_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_index);
        Ok(steps)
    }

    async fn list_notification_targets(&self) -> Result<Vec<NotificationTarget>> {
        Ok(self
            .inner
            .read()
            .await
            .notification_targets
            .values()
            .filter(|t| t.is_enabled)
            .cloned()
            .collect())
    }

    async fn record_run_notification(&self, notification: RunNotification) -> Result<()> {
        self.inner.write().await.run_notifications.push(notification);
        Ok(())
    }
}
