//! Public facade over the scheduler/dispatcher/agent engines. Everything an
//! operator-facing CLI or API surface needs — creating a schedule, launching a
//! one-off run, firing a schedule on demand, starting or cancelling an agent
//! run, and reading back a run's report — without reaching into `Store` or
//! the tick-loop internals directly.

use std::sync::Arc;

use uuid::Uuid;

use crate::agent::{Planner, RuleBasedPlanner};
use crate::domain::*;
use crate::error::{OrchestratorError, Result};
use crate::store::Store;

pub struct Orchestrator {
    store: Arc<dyn Store>,
}

/// A run's terminal state plus the jobs that ran under it, assembled for
/// display — the same data `report_markdown`/`report_json` summarize, read
/// back alongside the per-job detail those fields don't carry.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run: Run,
    pub jobs: Vec<Job>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Orchestrator { store }
    }

    /// Validates that the schedule's `job_id`/`directive_id` resolve before
    /// persisting it, so a typo'd reference fails at creation time rather
    /// than silently disabling itself on its first scheduler tick.
    pub async fn create_schedule(&self, schedule: Schedule) -> Result<Schedule> {
        self.store
            .get_job_template(schedule.job_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("job template {} not found", schedule.job_id)))?;
        self.store
            .get_directive(schedule.directive_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("directive {} not found", schedule.directive_id)))?;
        self.store.save_schedule(schedule).await
    }

    /// Launches a one-off `Run`/`Job`/queue item pair outside of any
    /// schedule, the same shape `Scheduler::fire_one` produces for a due
    /// schedule. The dispatcher picks the queued job up on its next tick.
    pub async fn launch_run(&self, job_template_id: Uuid, directive_id: Uuid) -> Result<Run> {
        let job_template = self
            .store
            .get_job_template(job_template_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("job template {job_template_id} not found")))?;
        if !job_template.is_active {
            return Err(OrchestratorError::ValidationError(format!(
                "job template {job_template_id} is not active"
            )));
        }
        let directive = self
            .store
            .get_directive(directive_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("directive {directive_id} not found")))?;

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
                created_at: crate::clock::now(),
                claimed_by: None,
                claimed_until: None,
                last_error: None,
            })
            .await?;

        Ok(run)
    }

    /// Fires a schedule immediately, independent of its `next_run_at`, by
    /// delegating to [`Orchestrator::launch_run`] against the schedule's job
    /// template and directive. Does not touch the schedule's own
    /// `next_run_at`/`last_fire_at` bookkeeping — its regular cadence is
    /// undisturbed by an operator-triggered extra fire.
    pub async fn run_schedule_now(&self, schedule_id: Uuid) -> Result<Run> {
        let schedule = self
            .store
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("schedule {schedule_id} not found")))?;
        if !schedule.is_enabled {
            return Err(OrchestratorError::IllegalTransition(format!(
                "schedule {schedule_id} is disabled"
            )));
        }
        self.launch_run(schedule.job_id, schedule.directive_id).await
    }

    /// Plans and persists a new `AgentRun` with its `AgentStep`s, ready for
    /// `AgentExecutor::tick` to pick up. Uses [`RuleBasedPlanner`] unless a
    /// planner is supplied, matching the default the CLI binaries wire up.
    pub async fn launch_agent(
        &self,
        directive_id: Uuid,
        operator_goal: String,
        max_steps: i32,
        time_budget_minutes: i64,
        token_budget: i64,
        planner: Option<&dyn Planner>,
    ) -> Result<AgentRun> {
        let directive = self
            .store
            .get_directive(directive_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("directive {directive_id} not found")))?;

        let default_planner = RuleBasedPlanner;
        let planner = planner.unwrap_or(&default_planner);
        let planned_steps = planner.plan(&operator_goal, &directive);
        if planned_steps.is_empty() {
            return Err(OrchestratorError::ValidationError(
                "operator goal matched no task in the directive's task list".into(),
            ));
        }

        let agent_run = AgentRun {
            id: Uuid::new_v4(),
            operator_goal,
            directive_snapshot: Some(DirectiveSnapshot::from(&directive)),
            status: AgentRunStatus::Pending,
            current_step: 0,
            max_steps,
            time_budget_minutes,
            token_budget,
            tokens_used: 0,
            error_message: None,
            started_at: None,
            ended_at: None,
            claimed_by: None,
            claimed_until: None,
        };
        let agent_run = self.store.create_agent_run(agent_run).await?;

        for (index, planned) in planned_steps.into_iter().enumerate() {
            let (step_type, inputs) = match planned {
                crate::agent::PlannedStep::TaskCall { task_id, inputs } => {
                    let mut inputs = inputs;
                    inputs["task_id"] = serde_json::Value::String(task_id);
                    (StepType::TaskCall, inputs)
                }
                crate::agent::PlannedStep::Wait { seconds } => {
                    (StepType::Wait, serde_json::json!({"seconds": seconds}))
                }
            };
            self.store
                .create_agent_step(AgentStep {
                    id: Uuid::new_v4(),
                    agent_run_id: agent_run.id,
                    step_index: index as i32,
                    step_type,
                    inputs,
                    status: StepStatus::Pending,
                    task_run_id: None,
                    outputs_ref: None,
                    error_message: None,
                    attempt: 0,
                })
                .await?;
        }

        Ok(agent_run)
    }

    /// Marks a not-yet-terminal `AgentRun` cancelled. The executor's budget
    /// check observes `AgentRunStatus::Cancelled` between steps and stops
    /// advancing it on its next tick rather than being interrupted mid-step.
    pub async fn cancel_agent(&self, agent_run_id: Uuid) -> Result<AgentRun> {
        let mut run = self
            .store
            .get_agent_run(agent_run_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("agent run {agent_run_id} not found")))?;
        if run.status.is_terminal() {
            return Err(OrchestratorError::IllegalTransition(format!(
                "agent run {agent_run_id} is already terminal ({:?})",
                run.status
            )));
        }
        run.status = AgentRunStatus::Cancelled;
        self.store.update_agent_run(run).await
    }

    pub async fn get_run_report(&self, run_id: Uuid) -> Result<RunReport> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("run {run_id} not found")))?;
        let jobs = self.store.jobs_for_run(run_id).await?;
        Ok(RunReport { run, jobs })
    }

    /// How long it has been since `job_template_id` last completed
    /// successfully, or `None` if it has never succeeded.
    pub async fn since_last_success(&self, job_template_id: Uuid) -> Result<Option<chrono::Duration>> {
        let last = self.store.get_last_successful_run(job_template_id).await?;
        Ok(last.and_then(|r| r.ended_at).map(|ended_at| crate::clock::now() - ended_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;

    fn directive() -> Directive {
        Directive {
            id: Uuid::new_v4(),
            name: "d".into(),
            directive_type: DirectiveType::D1,
            description: "".into(),
            task_config: serde_json::json!({}),
            task_list: vec!["log_triage".into()],
            version: 1,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn launch_run_enqueues_a_pending_job() {
        let store = Arc::new(MemoryStore::new());
        let d = directive();
        store.upsert_directive(d.clone()).await.unwrap();
        let job_template = JobTemplate {
            id: Uuid::new_v4(),
            name: "t".into(),
            task_type: TaskKey::LogTriage,
            default_config: serde_json::json!({}),
            is_active: true,
        };
        store.upsert_job_template(job_template.clone()).await.unwrap();

        let orchestrator = Orchestrator::new(store.clone());
        let run = orchestrator.launch_run(job_template.id, d.id).await.unwrap();

        let jobs = store.jobs_for_run(run.id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn launch_run_rejects_inactive_job_template() {
        let store = Arc::new(MemoryStore::new());
        let d = directive();
        store.upsert_directive(d.clone()).await.unwrap();
        let job_template = JobTemplate {
            id: Uuid::new_v4(),
            name: "t".into(),
            task_type: TaskKey::LogTriage,
            default_config: serde_json::json!({}),
            is_active: false,
        };
        store.upsert_job_template(job_template.clone()).await.unwrap();

        let orchestrator = Orchestrator::new(store.clone());
        let result = orchestrator.launch_run(job_template.id, d.id).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn launch_agent_plans_steps_from_operator_goal() {
        let store = Arc::new(MemoryStore::new());
        let d = directive();
        store.upsert_directive(d.clone()).await.unwrap();

        let orchestrator = Orchestrator::new(store.clone());
        let agent_run = orchestrator
            .launch_agent(d.id, "please run log_triage".into(), 10, 60, 1000, None)
            .await
            .unwrap();

        let steps = store.steps_for_agent_run(agent_run.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step_type, StepType::TaskCall);
    }

    #[tokio::test]
    async fn launch_agent_rejects_unmatched_goal() {
        let store = Arc::new(MemoryStore::new());
        let d = directive();
        store.upsert_directive(d.clone()).await.unwrap();

        let orchestrator = Orchestrator::new(store.clone());
        let result = orchestrator.launch_agent(d.id, "do nothing useful".into(), 10, 60, 1000, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancel_agent_marks_non_terminal_run_cancelled() {
        let store = Arc::new(MemoryStore::new());
        let run = store
            .create_agent_run(AgentRun {
                id: Uuid::new_v4(),
                operator_goal: "goal".into(),
                directive_snapshot: None,
                status: AgentRunStatus::Running,
                current_step: 0,
                max_steps: 5,
                time_budget_minutes: 60,
                token_budget: 1000,
                tokens_used: 0,
                error_message: None,
                started_at: Some(crate::clock::now()),
                ended_at: None,
                claimed_by: None,
                claimed_until: None,
            })
            .await
            .unwrap();

        let orchestrator = Orchestrator::new(store.clone());
        let cancelled = orchestrator.cancel_agent(run.id).await.unwrap();
        assert_eq!(cancelled.status, AgentRunStatus::Cancelled);
    }

    #[tokio::test]
    async fn since_last_success_is_none_without_a_prior_success() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Orchestrator::new(store.clone());
        let elapsed = orchestrator.since_last_success(Uuid::new_v4()).await.unwrap();
        assert!(elapsed.is_none());
    }
}
