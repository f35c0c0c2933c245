//! Domain entities. Field shapes follow the directive/schedule/run/job model;
//! `Run.directive_snapshot` and `GPUState`'s scoring are the two details worth
//! calling out: the snapshot is a value copy taken at dispatch time, not a
//! live reference, and the GPU score is always derived, never stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn now() -> DateTime<Utc> {
    Utc::now()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveType {
    D1,
    D2,
    D3,
    D4,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directive {
    pub id: Uuid,
    pub name: String,
    pub directive_type: DirectiveType,
    pub description: String,
    pub task_config: serde_json::Value,
    pub task_list: Vec<String>,
    pub version: i32,
    pub is_active: bool,
}

/// The value copy embedded in a `Run` at dispatch time. Never a live FK.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectiveSnapshot {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub task_config: serde_json::Value,
}

impl From<&Directive> for DirectiveSnapshot {
    fn from(d: &Directive) -> Self {
        DirectiveSnapshot {
            id: d.id,
            name: d.name.clone(),
            description: d.description.clone(),
            task_config: d.task_config.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKey {
    LogTriage,
    GpuReport,
    ServiceMap,
    RepoCopilotPlan,
}

impl TaskKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKey::LogTriage => "log_triage",
            TaskKey::GpuReport => "gpu_report",
            TaskKey::ServiceMap => "service_map",
            TaskKey::RepoCopilotPlan => "repo_copilot_plan",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTemplate {
    pub id: Uuid,
    pub name: String,
    pub task_type: TaskKey,
    pub default_config: serde_json::Value,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Interval { seconds: i64 },
    Cron { expression: String, timezone: String },
    OneShot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub job_id: Uuid,
    pub directive_id: Uuid,
    pub kind: ScheduleKind,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_fire_at: Option<DateTime<Utc>>,
    pub is_enabled: bool,
    pub max_concurrent_global: i32,
    pub max_concurrent_per_job: i32,
    pub claimed_by: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn is_due(&self, at: DateTime<Utc>) -> bool {
        self.is_enabled
            && self
                .next_run_at
                .map(|t| t <= at)
                .unwrap_or(false)
    }

    pub fn is_claimed(&self, at: DateTime<Utc>) -> bool {
        matches!(self.claimed_until, Some(t) if t > at)
    }
}

/// History row: one `Schedule` fire produces one of these alongside a `Run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledRun {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub run_id: Uuid,
    pub fired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Partial,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Partial | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Tracks whether a run containing a guarded step needs operator sign-off
/// before it may proceed. Distinct from `RunStatus`: a run can sit in
/// `Running` while its approval is `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    None,
    Pending,
    Approved,
    Denied,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub directive_snapshot: DirectiveSnapshot,
    pub status: RunStatus,
    pub approval_status: ApprovalStatus,
    pub assigned_host_id: Option<Uuid>,
    pub report_markdown: Option<String>,
    pub report_json: Option<serde_json::Value>,
    pub total_prompt_tokens: i64,
    pub total_completion_tokens: i64,
    pub total_tokens: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(directive_snapshot: DirectiveSnapshot) -> Self {
        Run {
            id: Uuid::new_v4(),
            directive_snapshot,
            status: RunStatus::Pending,
            approval_status: ApprovalStatus::None,
            assigned_host_id: None,
            report_markdown: None,
            report_json: None,
            total_prompt_tokens: 0,
            total_completion_tokens: 0,
            total_tokens: 0,
            created_at: now(),
            started_at: None,
            ended_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub run_id: Uuid,
    pub job_template_id: Uuid,
    pub task_type: TaskKey,
    pub config: serde_json::Value,
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    Claimed,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQueueItem {
    pub id: Uuid,
    pub job_id: Uuid,
    pub status: QueueItemStatus,
    pub created_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Report,
    Log,
    Raw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunArtifact {
    pub id: Uuid,
    pub run_id: Uuid,
    pub artifact_type: ArtifactType,
    pub file_path: String,
    pub file_size_bytes: i64,
    pub mime_type: String,
}

/// CRITICAL GUARDRAIL: never add a field here for prompt or response text.
/// See [`crate::guardrail`] — any write with a forbidden field populated is
/// rejected before it reaches a store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCall {
    pub id: Uuid,
    pub job_id: Uuid,
    pub endpoint: String,
    pub model_id: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub call_duration_ms: i64,
    pub success: bool,
    pub error_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKind {
    LocalSocket,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostHealth {
    Healthy,
    Degraded,
    Unreachable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHost {
    pub id: Uuid,
    pub name: String,
    pub kind: HostKind,
    pub endpoint: String,
    pub is_enabled: bool,
    pub health: HostHealth,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub has_gpu: bool,
    pub max_concurrent_runs: i32,
    pub active_runs_count: i32,
}

impl WorkerHost {
    pub fn has_capacity(&self) -> bool {
        self.active_runs_count < self.max_concurrent_runs
    }

    pub fn is_stale(&self, at: DateTime<Utc>, staleness: chrono::Duration) -> bool {
        match self.last_heartbeat_at {
            Some(t) => at - t > staleness,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuState {
    pub gpu_id: String,
    pub host_id: Uuid,
    pub total_vram_mb: i64,
    pub used_vram_mb: i64,
    pub free_vram_mb: i64,
    pub utilization_percent: f64,
    pub is_available: bool,
    pub active_workers: i32,
}

impl GpuState {
    /// Lower is better. `0.6` weight on VRAM pressure, `0.4` on utilization —
    /// matches the weighting used by the worker orchestrator's GPU picker.
    pub fn scheduling_score(&self) -> f64 {
        let vram_headroom = if self.total_vram_mb > 0 {
            self.free_vram_mb as f64 / self.total_vram_mb as f64
        } else {
            0.0
        };
        let util_normalized = self.utilization_percent / 100.0;
        (1.0 - vram_headroom) * 0.6 + util_normalized * 0.4
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerImageAllowlist {
    pub image_name: String,
    pub image_tag: String,
    pub requires_gpu: bool,
    pub min_vram_mb: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerAllowlist {
    pub container_id: String,
    pub container_name: String,
    pub description: String,
    pub is_active: bool,
    pub tags: serde_json::Value,
}

/// Periodic container-state snapshot, used only for drift detection against
/// the allowlist — never consulted for scheduling decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub id: Uuid,
    pub container_id: String,
    pub image: String,
    pub observed_at: DateTime<Utc>,
    pub is_running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerOperation {
    Spawn,
    Start,
    Stop,
    Remove,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAudit {
    pub id: Uuid,
    pub job_id: Option<Uuid>,
    pub operation: WorkerOperation,
    pub container_id: Option<String>,
    pub gpu_assigned: Option<String>,
    pub gpu_selection_reason: Option<String>,
    pub config_snapshot: serde_json::Value,
    pub success: bool,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Pending,
    PendingApproval,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Expired,
}

impl AgentRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentRunStatus::Completed
                | AgentRunStatus::Failed
                | AgentRunStatus::Cancelled
                | AgentRunStatus::Timeout
                | AgentRunStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: Uuid,
    pub operator_goal: String,
    pub directive_snapshot: Option<DirectiveSnapshot>,
    pub status: AgentRunStatus,
    pub current_step: i32,
    pub max_steps: i32,
    pub time_budget_minutes: i64,
    pub token_budget: i64,
    pub tokens_used: i64,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    TaskCall,
    Wait,
    Decision,
    Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    pub id: Uuid,
    pub agent_run_id: Uuid,
    pub step_index: i32,
    pub step_type: StepType,
    pub inputs: serde_json::Value,
    pub status: StepStatus,
    pub task_run_id: Option<Uuid>,
    pub outputs_ref: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub attempt: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Webhook,
    Email,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationTarget {
    pub id: Uuid,
    pub channel: NotificationChannel,
    pub address: String,
    pub is_enabled: bool,
    pub notify_on_statuses: Vec<RunStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationOutcome {
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunNotification {
    pub id: Uuid,
    pub run_id: Uuid,
    pub target_id: Uuid,
    pub outcome: NotificationOutcome,
    pub error_text: Option<String>,
    pub created_at: DateTime<Utc>,
}
