//! Agent step executor. Drives an `AgentRun`'s pre-populated `AgentStep`s
//! strictly in `step_index` order under three simultaneous budgets (steps,
//! wall time, tokens), with bounded per-step retry and cooperative
//! cancellation observed between steps and inside `wait`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tokio::time::sleep;
use uuid::Uuid;

use crate::dispatcher::Task;
use crate::domain::*;
use crate::error::Result;
use crate::store::Store;
use crate::worker::WorkerOrchestrator;

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(2);

/// A planner turns an operator goal plus a directive's allowed task list into
/// an ordered step sequence. The default implementation below is a literal
/// keyword matcher; generative planning is explicitly out of scope here.
pub trait Planner: Send + Sync {
    fn plan(&self, goal: &str, directive: &Directive) -> Vec<PlannedStep>;
}

#[derive(Debug, Clone)]
pub enum PlannedStep {
    TaskCall { task_id: String, inputs: serde_json::Value },
    Wait { seconds: u64 },
}

/// Matches the operator goal against each task key in the directive's
/// `task_list`, in list order, and emits one `task_call` per keyword hit.
pub struct RuleBasedPlanner;

impl Planner for RuleBasedPlanner {
    fn plan(&self, goal: &str, directive: &Directive) -> Vec<PlannedStep> {
        let goal_lower = goal.to_lowercase();
        directive
            .task_list
            .iter()
            .filter(|task_id| goal_lower.contains(task_id.as_str()))
            .map(|task_id| PlannedStep::TaskCall {
                task_id: task_id.clone(),
                inputs: serde_json::json!({}),
            })
            .collect()
    }
}

pub struct AgentExecutorConfig {
    pub claimant: String,
    pub claim_ttl: Duration,
    pub max_claim: usize,
}

pub struct AgentExecutor {
    store: Arc<dyn Store>,
    tasks: std::collections::HashMap<TaskKey, Arc<dyn Task>>,
    worker: Arc<WorkerOrchestrator>,
    config: AgentExecutorConfig,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub advanced: usize,
    pub skipped_for_approval: usize,
}

impl AgentExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        tasks: std::collections::HashMap<TaskKey, Arc<dyn Task>>,
        worker: Arc<WorkerOrchestrator>,
        config: AgentExecutorConfig,
    ) -> Self {
        AgentExecutor { store, tasks, worker, config }
    }

    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();
        let claimed = self
            .store
            .claim_due_agent_runs(&self.config.claimant, self.config.claim_ttl, self.config.max_claim)
            .await?;

        for run in claimed {
            if run.status == AgentRunStatus::PendingApproval {
                self.release_claim(run).await?;
                report.skipped_for_approval += 1;
                continue;
            }
            self.run_to_completion_or_budget(run).await?;
            report.advanced += 1;
        }

        Ok(report)
    }

    async fn release_claim(&self, mut run: AgentRun) -> Result<()> {
        run.claimed_by = None;
        run.claimed_until = None;
        self.store.update_agent_run(run).await?;
        Ok(())
    }

    async fn run_to_completion_or_budget(&self, mut run: AgentRun) -> Result<()> {
        if run.status != AgentRunStatus::Running {
            run.status = AgentRunStatus::Running;
            if run.started_at.is_none() {
                run.started_at = Some(crate::clock::now());
            }
            run = self.store.update_agent_run(run).await?;
        }

        let steps = self.store.steps_for_agent_run(run.id).await?;

        loop {
            if let Some(terminal) = self.check_budgets(&run) {
                run.status = terminal;
                run.ended_at = Some(crate::clock::now());
                self.release_claim(run).await?;
                return Ok(());
            }

            let step = match steps.iter().find(|s| s.step_index == run.current_step) {
                Some(s) => s.clone(),
                None => {
                    run.status = AgentRunStatus::Completed;
                    run.ended_at = Some(crate::clock::now());
                    self.release_claim(run).await?;
                    return Ok(());
                }
            };

            match self.execute_step_with_retry(&run, step).await {
                Ok(tokens_added) => {
                    run.tokens_used += tokens_added;
                    run.current_step += 1;
                    run = self.store.update_agent_run(run).await?;
                }
                Err(e) => {
                    run.status = AgentRunStatus::Failed;
                    run.error_message = Some(e.to_string());
                    run.ended_at = Some(crate::clock::now());
                    self.release_claim(run).await?;
                    return Ok(());
                }
            }
        }
    }

    fn check_budgets(&self, run: &AgentRun) -> Option<AgentRunStatus> {
        if run.current_step >= run.max_steps {
            return Some(AgentRunStatus::Completed);
        }
        if let Some(started_at) = run.started_at {
            let elapsed = crate::clock::now() - started_at;
            if elapsed > Duration::minutes(run.time_budget_minutes) {
                return Some(AgentRunStatus::Timeout);
            }
        }
        if run.tokens_used >= run.token_budget {
            return Some(AgentRunStatus::Expired);
        }
        if run.status == AgentRunStatus::Cancelled {
            return Some(AgentRunStatus::Cancelled);
        }
        None
    }

    async fn execute_step_with_retry(&self, run: &AgentRun, mut step: AgentStep) -> anyhow::Result<i64> {
        step.status = StepStatus::Running;
        step.attempt = 0;
        step = self.store.update_agent_step(step).await?;

        loop {
            step.attempt += 1;
            let outcome = self.execute_step_once(run, &mut step).await;
            match outcome {
                Ok(tokens) => {
                    step.status = StepStatus::Success;
                    self.store.update_agent_step(step).await?;
                    return Ok(tokens);
                }
                Err(e) if step.attempt < MAX_RETRIES => {
                    tracing::warn!(attempt = step.attempt, error = %e, "agent step failed, retrying");
                    sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    step.status = StepStatus::Failed;
                    step.error_message = Some(e.to_string());
                    self.store.update_agent_step(step).await?;
                    return Err(e);
                }
            }
        }
    }

    async fn execute_step_once(&self, run: &AgentRun, step: &mut AgentStep) -> anyhow::Result<i64> {
        match step.step_type {
            StepType::TaskCall => self.execute_task_call(run, step).await,
            StepType::Wait => {
                let seconds = step.inputs.get("seconds").and_then(|v| v.as_u64()).unwrap_or(1);
                sleep(std::time::Duration::from_secs(seconds)).await;
                Ok(0)
            }
            StepType::Decision | StepType::Notify => Ok(0),
        }
    }

    /// Runs a `task_call` step through the same spawn/execute/guardrail
    /// pipeline the dispatcher drives for scheduled jobs: an ephemeral
    /// `JobTemplate` and a real `Run`/`Job` pair back the step so its
    /// `task_run_id` points at a genuine row and its token usage comes from
    /// actually recorded `LlmCall`s rather than a task's self-reported total.
    async fn execute_task_call(&self, run: &AgentRun, step: &mut AgentStep) -> anyhow::Result<i64> {
        let task_key_str = step
            .inputs
            .get("task_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("task_call step missing task_id"))?;
        let task_key = parse_task_key(task_key_str)?;

        let directive_snapshot = run
            .directive_snapshot
            .clone()
            .ok_or_else(|| anyhow::anyhow!("agent run has no directive snapshot"))?;

        let job_template = JobTemplate {
            id: Uuid::new_v4(),
            name: format!("agent-task-call-{task_key_str}"),
            task_type: task_key,
            default_config: directive_snapshot.task_config.clone(),
            is_active: true,
        };
        self.store.upsert_job_template(job_template.clone()).await?;

        let mut task_run = Run::new(directive_snapshot.clone());
        task_run.status = RunStatus::Running;
        task_run.started_at = Some(crate::clock::now());
        let task_run = self.store.create_run(task_run).await?;
        step.task_run_id = Some(task_run.id);

        let job = Job {
            id: Uuid::new_v4(),
            run_id: task_run.id,
            job_template_id: job_template.id,
            task_type: task_key,
            config: directive_snapshot.task_config.clone(),
            status: JobStatus::Pending,
            result: None,
            last_error: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
        };
        let job = self.store.create_job(job).await?;

        let (job, _host_id) =
            crate::dispatcher::run_job(&self.store, &self.tasks, &self.worker, job, None).await?;

        let calls = self.store.llm_calls_for_job(job.id).await?;
        let total_tokens: i64 = calls.iter().map(|c| c.total_tokens).sum();

        let mut task_run = task_run;
        task_run.ended_at = Some(crate::clock::now());
        task_run.status = if job.status == JobStatus::Success {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };
        task_run.total_prompt_tokens = calls.iter().map(|c| c.prompt_tokens).sum();
        task_run.total_completion_tokens = calls.iter().map(|c| c.completion_tokens).sum();
        task_run.total_tokens = total_tokens;
        self.store.update_run(task_run).await?;

        if job.status != JobStatus::Success {
            return Err(anyhow::anyhow!(job.last_error.unwrap_or_else(|| "task_call job failed".into())));
        }

        Ok(total_tokens)
    }
}

fn parse_task_key(s: &str) -> anyhow::Result<TaskKey> {
    match s {
        "log_triage" => Ok(TaskKey::LogTriage),
        "gpu_report" => Ok(TaskKey::GpuReport),
        "service_map" => Ok(TaskKey::ServiceMap),
        "repo_copilot_plan" => Ok(TaskKey::RepoCopilotPlan),
        other => Err(anyhow::anyhow!("unknown task key: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu_registry::GpuRegistry;
    use crate::host_registry::HostRegistry;
    use crate::store_memory::MemoryStore;
    use crate::worker::NullContainerRuntime;

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

    #[test]
    fn planner_matches_keyword_in_task_list() {
        let directive = Directive {
            id: Uuid::new_v4(),
            name: "d".into(),
            directive_type: DirectiveType::D1,
            description: "".into(),
            task_config: serde_json::json!({}),
            task_list: vec!["log_triage".into(), "gpu_report".into()],
            version: 1,
            is_active: true,
        };
        let steps = RuleBasedPlanner.plan("please run log_triage now", &directive);
        assert_eq!(steps.len(), 1);
    }

    #[tokio::test]
    async fn max_steps_truncates_to_completed() {
        let store = Arc::new(MemoryStore::new());
        let run = AgentRun {
            id: Uuid::new_v4(),
            operator_goal: "noop".into(),
            directive_snapshot: None,
            status: AgentRunStatus::Pending,
            current_step: 0,
            max_steps: 0,
            time_budget_minutes: 60,
            token_budget: 1000,
            tokens_used: 0,
            error_message: None,
            started_at: None,
            ended_at: None,
            claimed_by: None,
            claimed_until: None,
        };
        let run = store.create_agent_run(run).await.unwrap();
        let run_id = run.id;

        let executor = AgentExecutor::new(
            store.clone(),
            std::collections::HashMap::new(),
            test_worker(store.clone()),
            AgentExecutorConfig {
                claimant: "test".into(),
                claim_ttl: Duration::seconds(60),
                max_claim: 10,
            },
        );
        executor.run_to_completion_or_budget(run).await.unwrap();

        let run = store.get_agent_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, AgentRunStatus::Completed);
    }

    struct RecordingTask {
        store: Arc<MemoryStore>,
    }

    #[async_trait]
    impl crate::dispatcher::Task for RecordingTask {
        fn key(&self) -> TaskKey {
            TaskKey::LogTriage
        }

        async fn execute(&self, job: &Job) -> anyhow::Result<serde_json::Value> {
            // Real task implementations report usage through `record_llm_call`,
            // not through the job result payload.
            self.store
                .record_llm_call(LlmCall {
                    id: Uuid::new_v4(),
                    job_id: job.id,
                    endpoint: "test".into(),
                    model_id: "test-model".into(),
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                    call_duration_ms: 1,
                    success: true,
                    error_type: None,
                })
                .await?;
            Ok(serde_json::json!({"job_id": job.id}))
        }
    }

    #[tokio::test]
    async fn task_call_step_runs_a_real_job_and_sums_recorded_tokens() {
        let store = Arc::new(MemoryStore::new());
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
        let (image_name, image_tag) = crate::dispatcher::worker_image_for(TaskKey::LogTriage);
        store
            .seed_image_allowlist(WorkerImageAllowlist {
                image_name: image_name.into(),
                image_tag: image_tag.into(),
                requires_gpu: false,
                min_vram_mb: 0,
                is_active: true,
            })
            .await;

        let directive = Directive {
            id: Uuid::new_v4(),
            name: "d".into(),
            directive_type: DirectiveType::D1,
            description: "".into(),
            task_config: serde_json::json!({}),
            task_list: vec!["log_triage".into()],
            version: 1,
            is_active: true,
        };
        let directive_snapshot = DirectiveSnapshot::from(&directive);

        let agent_run = AgentRun {
            id: Uuid::new_v4(),
            operator_goal: "run log_triage".into(),
            directive_snapshot: Some(directive_snapshot),
            status: AgentRunStatus::Pending,
            current_step: 0,
            max_steps: 5,
            time_budget_minutes: 60,
            token_budget: 1000,
            tokens_used: 0,
            error_message: None,
            started_at: None,
            ended_at: None,
            claimed_by: None,
            claimed_until: None,
        };
        let agent_run = store.create_agent_run(agent_run).await.unwrap();

        let mut step = AgentStep {
            id: Uuid::new_v4(),
            agent_run_id: agent_run.id,
            step_index: 0,
            step_type: StepType::TaskCall,
            inputs: serde_json::json!({"task_id": "log_triage"}),
            status: StepStatus::Pending,
            task_run_id: None,
            outputs_ref: None,
            error_message: None,
            attempt: 0,
        };
        step = store.create_agent_step(step).await.unwrap();

        let mut tasks: std::collections::HashMap<TaskKey, Arc<dyn crate::dispatcher::Task>> =
            std::collections::HashMap::new();
        tasks.insert(TaskKey::LogTriage, Arc::new(RecordingTask { store: store.clone() }));

        let executor = AgentExecutor::new(
            store.clone(),
            tasks,
            test_worker(store.clone()),
            AgentExecutorConfig {
                claimant: "test".into(),
                claim_ttl: Duration::seconds(60),
                max_claim: 10,
            },
        );

        let tokens = executor.execute_task_call(&agent_run, &mut step).await.unwrap();
        assert_eq!(tokens, 15);
        let task_run_id = step.task_run_id.expect("task_run_id should be set");

        let task_run = store.get_run(task_run_id).await.unwrap().unwrap();
        assert_eq!(task_run.status, RunStatus::Success);
        assert_eq!(task_run.total_tokens, 15);
    }
}
