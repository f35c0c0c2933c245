//! Scheduler loop. One `tick()` performs, in order: (1) heartbeat every
//! enabled host, (2) claim due schedules and either fire them or defer/disable
//! them, (3) nothing else — job execution itself is the dispatcher's job
//! (see [`crate::dispatcher`]). Concurrency gates and the `60s` backoff on a
//! blocked schedule are carried over unchanged from the original scheduler
//! command.

use std::sync::Arc;

use chrono::Duration;
use uuid::Uuid;

use crate::domain::*;
use crate::error::Result;
use crate::host_registry::HostRegistry;
use crate::store::Store;

/// How long a blocked schedule is deferred before being reconsidered.
pub const CONCURRENCY_BACKOFF: Duration = Duration::seconds(60);

pub struct SchedulerConfig {
    pub claimant: String,
    pub claim_ttl: Duration,
    pub max_claim: usize,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    hosts: Arc<HostRegistry>,
    config: SchedulerConfig,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub fired: usize,
    pub deferred: usize,
    pub disabled: usize,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, hosts: Arc<HostRegistry>, config: SchedulerConfig) -> Self {
        Scheduler { store, hosts, config }
    }

    pub async fn tick(&self) -> Result<TickReport> {
        let at = crate::clock::now();

        for host in self.store.list_hosts().await?.into_iter().filter(|h| h.is_enabled) {
            self.hosts.heartbeat(host.id, host.health.clone()).await?;
        }
        self.hosts.sweep_stale().await?;

        let mut report = TickReport::default();

        let due = self
            .store
            .claim_due_schedules(&self.config.claimant, self.config.claim_ttl, self.config.max_claim, at)
            .await?;

        for schedule in due {
            match self.fire_one(schedule, at).await {
                Ok(FireOutcome::Fired) => report.fired += 1,
                Ok(FireOutcome::Deferred) => report.deferred += 1,
                Ok(FireOutcome::Disabled) => report.disabled += 1,
                Err(e) => {
                    tracing::error!(error = %e, "schedule tick failed, continuing with remaining schedules");
                }
            }
        }

        Ok(report)
    }

    async fn can_run(&self, job_template_id: Uuid, max_global: i32, max_per_job: i32) -> Result<bool> {
        let global_running = self.store.count_running_runs().await?;
        if global_running >= max_global as i64 {
            return Ok(false);
        }
        let job_running = self.store.count_running_runs_for_job(job_template_id).await?;
        Ok(job_running < max_per_job as i64)
    }

    async fn fire_one(&self, mut schedule: Schedule, at: chrono::DateTime<chrono::Utc>) -> Result<FireOutcome> {
        let job_template = match self.store.get_job_template(schedule.job_id).await? {
            Some(j) => j,
            None => {
                schedule.is_enabled = false;
                schedule.claimed_by = None;
                schedule.claimed_until = None;
                self.store.save_schedule(schedule).await?;
                return Ok(FireOutcome::Disabled);
            }
        };

        if !job_template.is_active {
            schedule.is_enabled = false;
            schedule.claimed_by = None;
            schedule.claimed_until = None;
            self.store.save_schedule(schedule).await?;
            return Ok(FireOutcome::Disabled);
        }

        if !self
            .can_run(job_template.id, schedule.max_concurrent_global, schedule.max_concurrent_per_job)
            .await?
        {
            schedule.next_run_at = Some(at + CONCURRENCY_BACKOFF);
            schedule.claimed_by = None;
            schedule.claimed_until = None;
            self.store.save_schedule(schedule).await?;
            return Ok(FireOutcome::Deferred);
        }

        let directive = match self.store.get_directive(schedule.directive_id).await? {
            Some(d) => d,
            None => {
                schedule.is_enabled = false;
                schedule.claimed_by = None;
                schedule.claimed_until = None;
                self.store.save_schedule(schedule).await?;
                return Ok(FireOutcome::Disabled);
            }
        };

        let run = Run::new(DirectiveSnapshot::from(&directive));
        let run = self.store.create_run(run).await?;

        let job = Job {
            id: Uuid::new_v4(),
            run_id: run.id,
            job_template_id: job_template.id,
            task_type: job_template.task_type,
            config: job_template.default_config.clone(),
            status: JobStatus::Pending,
            result: None,
            last_error: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
        };
        let job = self.store.create_job(job).await?;

        self.store
            .enqueue_job(JobQueueItem {
                id: Uuid::new_v4(),
                job_id: job.id,
                status: QueueItemStatus::Pending,
                created_at: at,
                claimed_by: None,
                claimed_until: None,
                last_error: None,
            })
            .await?;

        self.store
            .record_scheduled_run(ScheduledRun {
                id: Uuid::new_v4(),
                schedule_id: schedule.id,
                run_id: run.id,
                fired_at: at,
            })
            .await?;

        let previous_last_fire = schedule.last_fire_at;
        match schedule.kind {
            ScheduleKind::OneShot => {
                schedule.is_enabled = false;
                schedule.next_run_at = None;
            }
            _ => {
                schedule.next_run_at = crate::clock::compute_next_run(&schedule.kind, previous_last_fire, at)?;
            }
        }
        schedule.last_fire_at = Some(at);
        schedule.claimed_by = None;
        schedule.claimed_until = None;
        self.store.save_schedule(schedule).await?;

        Ok(FireOutcome::Fired)
    }
}

enum FireOutcome {
    Fired,
    Deferred,
    Disabled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;

    fn directive() -> Directive {
        Directive {
            id: Uuid::new_v4(),
            name: "nightly-scan".into(),
            directive_type: DirectiveType::D1,
            description: "scan".into(),
            task_config: serde_json::json!({}),
            task_list: vec!["log_triage".into()],
            version: 1,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn firing_a_due_schedule_creates_run_job_and_queue_item() {
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

        let schedule = Schedule {
            id: Uuid::new_v4(),
            name: "nightly".into(),
            job_id: job_template.id,
            directive_id: d.id,
            kind: ScheduleKind::Interval { seconds: 60 },
            next_run_at: Some(crate::clock::now() - Duration::seconds(1)),
            last_fire_at: None,
            is_enabled: true,
            max_concurrent_global: 10,
            max_concurrent_per_job: 10,
            claimed_by: None,
            claimed_until: None,
        };
        store.save_schedule(schedule).await.unwrap();

        let scheduler = Scheduler::new(
            store.clone(),
            hosts,
            SchedulerConfig {
                claimant: "test".into(),
                claim_ttl: Duration::seconds(120),
                max_claim: 10,
            },
        );

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.fired, 1);
    }

    #[tokio::test]
    async fn dangling_job_template_disables_schedule() {
        let store = Arc::new(MemoryStore::new());
        let hosts = Arc::new(HostRegistry::new(store.clone()));
        let d = directive();
        store.upsert_directive(d.clone()).await.unwrap();

        let schedule = Schedule {
            id: Uuid::new_v4(),
            name: "dangling".into(),
            job_id: Uuid::new_v4(),
            directive_id: d.id,
            kind: ScheduleKind::Interval { seconds: 60 },
            next_run_at: Some(crate::clock::now() - Duration::seconds(1)),
            last_fire_at: None,
            is_enabled: true,
            max_concurrent_global: 10,
            max_concurrent_per_job: 10,
            claimed_by: None,
            claimed_until: None,
        };
        store.save_schedule(schedule).await.unwrap();

        let scheduler = Scheduler::new(
            store.clone(),
            hosts,
            SchedulerConfig {
                claimant: "test".into(),
                claim_ttl: Duration::seconds(120),
                max_claim: 10,
            },
        );

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.disabled, 1);
    }
}
