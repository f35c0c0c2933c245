//! Postgres-backed `Store`. Queries are plain `sqlx::query`/`query_as` calls
//! rather than the `query!` macro family — the schema is applied at runtime
//! via `sqlx::migrate!`, so there is nothing for the compile-time macro to
//! check against. Claim operations use a `WITH ... FOR UPDATE SKIP LOCKED`
//! CTE so concurrent schedulers/dispatchers never double-claim a row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPool, Row};
use uuid::Uuid;

use crate::domain::*;
use crate::error::{OrchestratorError, Result};
use crate::store::Store;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        PostgresStore { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn map_sqlx(e: sqlx::Error) -> OrchestratorError {
    OrchestratorError::Other(anyhow::anyhow!(e))
}

fn json_col<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).expect("domain type always serializes")
}

fn from_json_col<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| OrchestratorError::Other(anyhow::anyhow!(e)))
}

#[async_trait]
impl Store for PostgresStore {
    async fn get_directive(&self, id: Uuid) -> Result<Option<Directive>> {
        let row = sqlx::query(
            r#"SELECT id, name, directive_type, description, task_config, task_list, version, is_active
               FROM directives WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.map(|r| directive_from_row(&r)).transpose()
    }

    async fn get_directive_by_name(&self, name: &str) -> Result<Option<Directive>> {
        let row = sqlx::query(
            r#"SELECT id, name, directive_type, description, task_config, task_list, version, is_active
               FROM directives WHERE name = $1"#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.map(|r| directive_from_row(&r)).transpose()
    }

    async fn upsert_directive(&self, directive: Directive) -> Result<Directive> {
        sqlx::query(
            r#"INSERT INTO directives (id, name, directive_type, description, task_config, task_list, version, is_active)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT (id) DO UPDATE SET
                   name = EXCLUDED.name,
                   directive_type = EXCLUDED.directive_type,
                   description = EXCLUDED.description,
                   task_config = EXCLUDED.task_config,
                   task_list = EXCLUDED.task_list,
                   version = EXCLUDED.version,
                   is_active = EXCLUDED.is_active"#,
        )
        .bind(directive.id)
        .bind(&directive.name)
        .bind(json_col(&directive.directive_type))
        .bind(&directive.description)
        .bind(&directive.task_config)
        .bind(json_col(&directive.task_list))
        .bind(directive.version)
        .bind(directive.is_active)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(directive)
    }

    async fn get_job_template(&self, id: Uuid) -> Result<Option<JobTemplate>> {
        let row = sqlx::query(
            r#"SELECT id, name, task_type, default_config, is_active FROM job_templates WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.map(|r| job_template_from_row(&r)).transpose()
    }

    async fn upsert_job_template(&self, template: JobTemplate) -> Result<JobTemplate> {
        sqlx::query(
            r#"INSERT INTO job_templates (id, name, task_type, default_config, is_active)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (id) DO UPDATE SET
                   name = EXCLUDED.name, task_type = EXCLUDED.task_type,
                   default_config = EXCLUDED.default_config, is_active = EXCLUDED.is_active"#,
        )
        .bind(template.id)
        .bind(&template.name)
        .bind(json_col(&template.task_type))
        .bind(&template.default_config)
        .bind(template.is_active)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(template)
    }

    async fn claim_due_schedules(
        &self,
        claimant: &str,
        lease: chrono::Duration,
        limit: usize,
        at: DateTime<Utc>,
    ) -> Result<Vec<Schedule>> {
        let lease_seconds = lease.num_seconds();
        let rows = sqlx::query(
            r#"
            WITH claimed AS (
                SELECT id
                FROM schedules
                WHERE is_enabled AND next_run_at <= $1
                  AND (claimed_until IS NULL OR claimed_until <= $1)
                ORDER BY next_run_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE schedules
            SET claimed_by = $3, claimed_until = $1 + make_interval(secs => $4)
            FROM claimed
            WHERE schedules.id = claimed.id
            RETURNING schedules.id, schedules.name, schedules.job_id, schedules.directive_id, schedules.kind,
                      schedules.next_run_at, schedules.last_fire_at, schedules.is_enabled,
                      schedules.max_concurrent_global, schedules.max_concurrent_per_job,
                      schedules.claimed_by, schedules.claimed_until
            "#,
        )
        .bind(at)
        .bind(limit as i64)
        .bind(claimant)
        .bind(lease_seconds as f64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(schedule_from_row).collect()
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>> {
        let row = sqlx::query(
            r#"SELECT id, name, job_id, directive_id, kind, next_run_at, last_fire_at, is_enabled,
                      max_concurrent_global, max_concurrent_per_job, claimed_by, claimed_until
               FROM schedules WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.map(|r| schedule_from_row(&r)).transpose()
    }

    async fn save_schedule(&self, schedule: Schedule) -> Result<Schedule> {
        sqlx::query(
            r#"INSERT INTO schedules
                   (id, name, job_id, directive_id, kind, next_run_at, last_fire_at, is_enabled,
                    max_concurrent_global, max_concurrent_per_job, claimed_by, claimed_until)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
               ON CONFLICT (id) DO UPDATE SET
                   name = EXCLUDED.name, job_id = EXCLUDED.job_id, directive_id = EXCLUDED.directive_id,
                   kind = EXCLUDED.kind, next_run_at = EXCLUDED.next_run_at,
                   last_fire_at = EXCLUDED.last_fire_at,
                   is_enabled = EXCLUDED.is_enabled,
                   max_concurrent_global = EXCLUDED.max_concurrent_global,
                   max_concurrent_per_job = EXCLUDED.max_concurrent_per_job,
                   claimed_by = EXCLUDED.claimed_by, claimed_until = EXCLUDED.claimed_until"#,
        )
        .bind(schedule.id)
        .bind(&schedule.name)
        .bind(schedule.job_id)
        .bind(schedule.directive_id)
        .bind(json_col(&schedule.kind))
        .bind(schedule.next_run_at)
        .bind(schedule.last_fire_at)
        .bind(schedule.is_enabled)
        .bind(schedule.max_concurrent_global)
        .bind(schedule.max_concurrent_per_job)
        .bind(&schedule.claimed_by)
        .bind(schedule.claimed_until)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(schedule)
    }

    async fn release_schedule_claim(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE schedules SET claimed_by = NULL, claimed_until = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn record_scheduled_run(&self, row: ScheduledRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO scheduled_runs (id, schedule_id, run_id, fired_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(row.id)
        .bind(row.schedule_id)
        .bind(row.run_id)
        .bind(row.fired_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn create_run(&self, run: Run) -> Result<Run> {
        sqlx::query(
            r#"INSERT INTO runs
                   (id, directive_snapshot, status, approval_status, assigned_host_id,
                    report_markdown, report_json,
                    total_prompt_tokens, total_completion_tokens, total_tokens,
                    created_at, started_at, ended_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"#,
        )
        .bind(run.id)
        .bind(json_col(&run.directive_snapshot))
        .bind(json_col(&run.status))
        .bind(json_col(&run.approval_status))
        .bind(run.assigned_host_id)
        .bind(&run.report_markdown)
        .bind(&run.report_json)
        .bind(run.total_prompt_tokens)
        .bind(run.total_completion_tokens)
        .bind(run.total_tokens)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.ended_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>> {
        let row = sqlx::query(
            r#"SELECT id, directive_snapshot, status, approval_status, assigned_host_id,
                      report_markdown, report_json,
                      total_prompt_tokens, total_completion_tokens, total_tokens,
                      created_at, started_at, ended_at
               FROM runs WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.map(|r| run_from_row(&r)).transpose()
    }

    async fn update_run(&self, run: Run) -> Result<Run> {
        sqlx::query(
            r#"UPDATE runs SET status = $2, approval_status = $3, assigned_host_id = $4,
                   report_markdown = $5, report_json = $6,
                   total_prompt_tokens = $7, total_completion_tokens = $8, total_tokens = $9,
                   started_at = $10, ended_at = $11
               WHERE id = $1"#,
        )
        .bind(run.id)
        .bind(json_col(&run.status))
        .bind(json_col(&run.approval_status))
        .bind(run.assigned_host_id)
        .bind(&run.report_markdown)
        .bind(&run.report_json)
        .bind(run.total_prompt_tokens)
        .bind(run.total_completion_tokens)
        .bind(run.total_tokens)
        .bind(run.started_at)
        .bind(run.ended_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(run)
    }

    async fn count_running_runs(&self) -> Result<i64> {
        let row = sqlx::query("SELECT count(*) AS n FROM runs WHERE status = '\"running\"'::jsonb")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(row.try_get::<i64, _>("n").map_err(map_sqlx)?)
    }

    async fn count_running_runs_for_job(&self, job_template_id: Uuid) -> Result<i64> {
        let row = sqlx::query(
            r#"SELECT count(*) AS n FROM jobs j JOIN runs r ON r.id = j.run_id
               WHERE j.job_template_id = $1 AND r.status = '"running"'::jsonb"#,
        )
        .bind(job_template_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.try_get::<i64, _>("n").map_err(map_sqlx)?)
    }

    async fn get_last_successful_run(&self, job_template_id: Uuid) -> Result<Option<Run>> {
        let row = sqlx::query(
            r#"SELECT r.id, r.directive_snapshot, r.status, r.approval_status, r.assigned_host_id,
                      r.report_markdown, r.report_json,
                      r.total_prompt_tokens, r.total_completion_tokens, r.total_tokens,
                      r.created_at, r.started_at, r.ended_at
               FROM runs r JOIN jobs j ON j.run_id = r.id
               WHERE j.job_template_id = $1 AND r.status = '"success"'::jsonb
               ORDER BY r.ended_at DESC LIMIT 1"#,
        )
        .bind(job_template_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.map(|r| run_from_row(&r)).transpose()
    }

    async fn create_job(&self, job: Job) -> Result<Job> {
        sqlx::query(
            r#"INSERT INTO jobs (id, run_id, job_template_id, task_type, config, status, result,
                   last_error, prompt_tokens, completion_tokens, total_tokens)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
        )
        .bind(job.id)
        .bind(job.run_id)
        .bind(job.job_template_id)
        .bind(json_col(&job.task_type))
        .bind(&job.config)
        .bind(json_col(&job.status))
        .bind(&job.result)
        .bind(&job.last_error)
        .bind(job.prompt_tokens)
        .bind(job.completion_tokens)
        .bind(job.total_tokens)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"SELECT id, run_id, job_template_id, task_type, config, status, result,
                      last_error, prompt_tokens, completion_tokens, total_tokens
               FROM jobs WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn update_job(&self, job: Job) -> Result<Job> {
        sqlx::query(
            r#"UPDATE jobs SET status = $2, result = $3, last_error = $4,
                   prompt_tokens = $5, completion_tokens = $6, total_tokens = $7
               WHERE id = $1"#,
        )
        .bind(job.id)
        .bind(json_col(&job.status))
        .bind(&job.result)
        .bind(&job.last_error)
        .bind(job.prompt_tokens)
        .bind(job.completion_tokens)
        .bind(job.total_tokens)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(job)
    }

    async fn jobs_for_run(&self, run_id: Uuid) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"SELECT id, run_id, job_template_id, task_type, config, status, result,
                      last_error, prompt_tokens, completion_tokens, total_tokens
               FROM jobs WHERE run_id = $1"#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn enqueue_job(&self, item: JobQueueItem) -> Result<JobQueueItem> {
        sqlx::query(
            r#"INSERT INTO job_queue (id, job_id, status, created_at, claimed_by, claimed_until, last_error)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(item.id)
        .bind(item.job_id)
        .bind(json_col(&item.status))
        .bind(item.created_at)
        .bind(&item.claimed_by)
        .bind(item.claimed_until)
        .bind(&item.last_error)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(item)
    }

    async fn claim_due_queue_items(
        &self,
        claimant: &str,
        lease: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<JobQueueItem>> {
        let lease_seconds = lease.num_seconds();
        let rows = sqlx::query(
            r#"
            WITH claimed AS (
                SELECT id
                FROM job_queue
                WHERE status = '"pending"'::jsonb AND (claimed_until IS NULL OR claimed_until <= now())
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE job_queue
            SET status = '"claimed"'::jsonb, claimed_by = $2, claimed_until = now() + make_interval(secs => $3)
            FROM claimed
            WHERE job_queue.id = claimed.id
            RETURNING job_queue.id, job_queue.job_id, job_queue.status, job_queue.created_at,
                      job_queue.claimed_by, job_queue.claimed_until, job_queue.last_error
            "#,
        )
        .bind(limit as i64)
        .bind(claimant)
        .bind(lease_seconds as f64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(queue_item_from_row).collect()
    }

    async fn update_queue_item(&self, item: JobQueueItem) -> Result<JobQueueItem> {
        sqlx::query(
            r#"UPDATE job_queue SET status = $2, claimed_by = $3, claimed_until = $4, last_error = $5
               WHERE id = $1"#,
        )
        .bind(item.id)
        .bind(json_col(&item.status))
        .bind(&item.claimed_by)
        .bind(item.claimed_until)
        .bind(&item.last_error)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(item)
    }

    async fn save_artifact(&self, artifact: RunArtifact) -> Result<RunArtifact> {
        sqlx::query(
            r#"INSERT INTO run_artifacts (id, run_id, artifact_type, file_path, file_size_bytes, mime_type)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(artifact.id)
        .bind(artifact.run_id)
        .bind(json_col(&artifact.artifact_type))
        .bind(&artifact.file_path)
        .bind(artifact.file_size_bytes)
        .bind(&artifact.mime_type)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(artifact)
    }

    async fn record_llm_call(&self, call: LlmCall) -> Result<LlmCall> {
        crate::guardrail::assert_no_forbidden_content(&call)?;
        sqlx::query(
            r#"INSERT INTO llm_calls
                   (id, job_id, endpoint, model_id, prompt_tokens, completion_tokens, total_tokens,
                    call_duration_ms, success, error_type)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(call.id)
        .bind(call.job_id)
        .bind(&call.endpoint)
        .bind(&call.model_id)
        .bind(call.prompt_tokens)
        .bind(call.completion_tokens)
        .bind(call.total_tokens)
        .bind(call.call_duration_ms)
        .bind(call.success)
        .bind(&call.error_type)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(call)
    }

    async fn llm_calls_for_job(&self, job_id: Uuid) -> Result<Vec<LlmCall>> {
        let rows = sqlx::query(
            r#"SELECT id, job_id, endpoint, model_id, prompt_tokens, completion_tokens, total_tokens,
                      call_duration_ms, success, error_type
               FROM llm_calls WHERE job_id = $1"#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(llm_call_from_row).collect()
    }

    async fn list_hosts(&self) -> Result<Vec<WorkerHost>> {
        let rows = sqlx::query(
            r#"SELECT id, name, kind, endpoint, is_enabled, health, last_heartbeat_at,
                      has_gpu, max_concurrent_runs, active_runs_count FROM worker_hosts"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(host_from_row).collect()
    }

    async fn get_host(&self, id: Uuid) -> Result<Option<WorkerHost>> {
        let row = sqlx::query(
            r#"SELECT id, name, kind, endpoint, is_enabled, health, last_heartbeat_at,
                      has_gpu, max_concurrent_runs, active_runs_count FROM worker_hosts WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.map(|r| host_from_row(&r)).transpose()
    }

    async fn save_host(&self, host: WorkerHost) -> Result<WorkerHost> {
        sqlx::query(
            r#"INSERT INTO worker_hosts
                   (id, name, kind, endpoint, is_enabled, health, last_heartbeat_at,
                    has_gpu, max_concurrent_runs, active_runs_count)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
               ON CONFLICT (id) DO UPDATE SET
                   name = EXCLUDED.name, kind = EXCLUDED.kind, endpoint = EXCLUDED.endpoint,
                   is_enabled = EXCLUDED.is_enabled, health = EXCLUDED.health,
                   last_heartbeat_at = EXCLUDED.last_heartbeat_at, has_gpu = EXCLUDED.has_gpu,
                   max_concurrent_runs = EXCLUDED.max_concurrent_runs,
                   active_runs_count = EXCLUDED.active_runs_count"#,
        )
        .bind(host.id)
        .bind(&host.name)
        .bind(json_col(&host.kind))
        .bind(&host.endpoint)
        .bind(host.is_enabled)
        .bind(json_col(&host.health))
        .bind(host.last_heartbeat_at)
        .bind(host.has_gpu)
        .bind(host.max_concurrent_runs)
        .bind(host.active_runs_count)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(host)
    }

    async fn list_gpus(&self, host_id: Uuid) -> Result<Vec<GpuState>> {
        let rows = sqlx::query(
            r#"SELECT gpu_id, host_id, total_vram_mb, used_vram_mb, free_vram_mb,
                      utilization_percent, is_available, active_workers
               FROM gpu_states WHERE host_id = $1"#,
        )
        .bind(host_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(gpu_from_row).collect()
    }

    async fn list_all_gpus(&self) -> Result<Vec<GpuState>> {
        let rows = sqlx::query(
            r#"SELECT gpu_id, host_id, total_vram_mb, used_vram_mb, free_vram_mb,
                      utilization_percent, is_available, active_workers
               FROM gpu_states"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(gpu_from_row).collect()
    }

    async fn save_gpu(&self, gpu: GpuState) -> Result<GpuState> {
        sqlx::query(
            r#"INSERT INTO gpu_states
                   (gpu_id, host_id, total_vram_mb, used_vram_mb, free_vram_mb,
                    utilization_percent, is_available, active_workers)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT (gpu_id) DO UPDATE SET
                   host_id = EXCLUDED.host_id, total_vram_mb = EXCLUDED.total_vram_mb,
                   used_vram_mb = EXCLUDED.used_vram_mb, free_vram_mb = EXCLUDED.free_vram_mb,
                   utilization_percent = EXCLUDED.utilization_percent,
                   is_available = EXCLUDED.is_available, active_workers = EXCLUDED.active_workers"#,
        )
        .bind(&gpu.gpu_id)
        .bind(gpu.host_id)
        .bind(gpu.total_vram_mb)
        .bind(gpu.used_vram_mb)
        .bind(gpu.free_vram_mb)
        .bind(gpu.utilization_percent)
        .bind(gpu.is_available)
        .bind(gpu.active_workers)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(gpu)
    }

    async fn get_image_allowlist_entry(
        &self,
        image_name: &str,
        image_tag: &str,
    ) -> Result<Option<WorkerImageAllowlist>> {
        let row = sqlx::query(
            r#"SELECT image_name, image_tag, requires_gpu, min_vram_mb, is_active
               FROM worker_image_allowlist WHERE image_name = $1 AND image_tag = $2"#,
        )
        .bind(image_name)
        .bind(image_tag)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(|r| WorkerImageAllowlist {
            image_name: r.get("image_name"),
            image_tag: r.get("image_tag"),
            requires_gpu: r.get("requires_gpu"),
            min_vram_mb: r.get("min_vram_mb"),
            is_active: r.get("is_active"),
        }))
    }

    async fn is_container_allowed(&self, container_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT is_active FROM container_allowlist WHERE container_id = $1")
            .bind(container_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(row.map(|r| r.get::<bool, _>("is_active")).unwrap_or(false))
    }

    async fn list_enabled_containers(&self) -> Result<Vec<ContainerAllowlist>> {
        let rows = sqlx::query(
            r#"SELECT container_id, container_name, description, is_active, tags
               FROM container_allowlist WHERE is_active"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter()
            .map(|r| {
                Ok(ContainerAllowlist {
                    container_id: r.try_get("container_id").map_err(map_sqlx)?,
                    container_name: r.try_get("container_name").map_err(map_sqlx)?,
                    description: r.try_get("description").map_err(map_sqlx)?,
                    is_active: r.try_get("is_active").map_err(map_sqlx)?,
                    tags: r.try_get("tags").map_err(map_sqlx)?,
                })
            })
            .collect()
    }

    async fn save_container_snapshot(&self, snapshot: ContainerSnapshot) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO container_snapshots (id, container_id, image, observed_at, is_running)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(snapshot.id)
        .bind(&snapshot.container_id)
        .bind(&snapshot.image)
        .bind(snapshot.observed_at)
        .bind(snapshot.is_running)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn append_worker_audit(&self, audit: WorkerAudit) -> Result<WorkerAudit> {
        sqlx::query(
            r#"INSERT INTO worker_audit
                   (id, job_id, operation, container_id, gpu_assigned, gpu_selection_reason,
                    config_snapshot, success, message, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(audit.id)
        .bind(audit.job_id)
        .bind(json_col(&audit.operation))
        .bind(&audit.container_id)
        .bind(&audit.gpu_assigned)
        .bind(&audit.gpu_selection_reason)
        .bind(&audit.config_snapshot)
        .bind(audit.success)
        .bind(&audit.message)
        .bind(audit.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(audit)
    }

    async fn create_agent_run(&self, run: AgentRun) -> Result<AgentRun> {
        sqlx::query(
            r#"INSERT INTO agent_runs
                   (id, operator_goal, directive_snapshot, status, current_step, max_steps,
                    time_budget_minutes, token_budget, tokens_used, error_message,
                    started_at, ended_at, claimed_by, claimed_until)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"#,
        )
        .bind(run.id)
        .bind(&run.operator_goal)
        .bind(&run.directive_snapshot.as_ref().map(json_col))
        .bind(json_col(&run.status))
        .bind(run.current_step)
        .bind(run.max_steps)
        .bind(run.time_budget_minutes)
        .bind(run.token_budget)
        .bind(run.tokens_used)
        .bind(&run.error_message)
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(&run.claimed_by)
        .bind(run.claimed_until)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(run)
    }

    async fn get_agent_run(&self, id: Uuid) -> Result<Option<AgentRun>> {
        let row = sqlx::query(
            r#"SELECT id, operator_goal, directive_snapshot, status, current_step, max_steps,
                      time_budget_minutes, token_budget, tokens_used, error_message,
                      started_at, ended_at, claimed_by, claimed_until FROM agent_runs WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.map(|r| agent_run_from_row(&r)).transpose()
    }

    async fn update_agent_run(&self, run: AgentRun) -> Result<AgentRun> {
        sqlx::query(
            r#"UPDATE agent_runs SET status = $2, current_step = $3, tokens_used = $4,
                   error_message = $5, started_at = $6, ended_at = $7,
                   claimed_by = $8, claimed_until = $9
               WHERE id = $1"#,
        )
        .bind(run.id)
        .bind(json_col(&run.status))
        .bind(run.current_step)
        .bind(run.tokens_used)
        .bind(&run.error_message)
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(&run.claimed_by)
        .bind(run.claimed_until)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(run)
    }

    async fn claim_due_agent_runs(
        &self,
        claimant: &str,
        lease: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<AgentRun>> {
        let lease_seconds = lease.num_seconds();
        let rows = sqlx::query(
            r#"
            WITH claimed AS (
                SELECT id
                FROM agent_runs
                WHERE status NOT IN ('"completed"'::jsonb, '"failed"'::jsonb, '"cancelled"'::jsonb,
                                      '"timeout"'::jsonb, '"expired"'::jsonb, '"pending_approval"'::jsonb)
                  AND (claimed_until IS NULL OR claimed_until <= now())
                ORDER BY id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE agent_runs
            SET claimed_by = $2, claimed_until = now() + make_interval(secs => $3)
            FROM claimed
            WHERE agent_runs.id = claimed.id
            RETURNING agent_runs.id, agent_runs.operator_goal, agent_runs.directive_snapshot,
                      agent_runs.status, agent_runs.current_step, agent_runs.max_steps,
                      agent_runs.time_budget_minutes, agent_runs.token_budget, agent_runs.tokens_used,
                      agent_runs.error_message, agent_runs.started_at, agent_runs.ended_at,
                      agent_runs.claimed_by, agent_runs.claimed_until
            "#,
        )
        .bind(limit as i64)
        .bind(claimant)
        .bind(lease_seconds as f64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(agent_run_from_row).collect()
    }

    async fn create_agent_step(&self, step: AgentStep) -> Result<AgentStep> {
        sqlx::query(
            r#"INSERT INTO agent_steps
                   (id, agent_run_id, step_index, step_type, inputs, status,
                    task_run_id, outputs_ref, error_message, attempt)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(step.id)
        .bind(step.agent_run_id)
        .bind(step.step_index)
        .bind(json_col(&step.step_type))
        .bind(&step.inputs)
        .bind(json_col(&step.status))
        .bind(step.task_run_id)
        .bind(&step.outputs_ref)
        .bind(&step.error_message)
        .bind(step.attempt)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(step)
    }

    async fn update_agent_step(&self, step: AgentStep) -> Result<AgentStep> {
        sqlx::query(
            r#"UPDATE agent_steps SET status = $2, task_run_id = $3, outputs_ref = $4,
                   error_message = $5, attempt = $6
               WHERE id = $1"#,
        )
        .bind(step.id)
        .bind(json_col(&step.status))
        .bind(step.task_run_id)
        .bind(&step.outputs_ref)
        .bind(&step.error_message)
        .bind(step.attempt)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(step)
    }

    async fn steps_for_agent_run(&self, agent_run_id: Uuid) -> Result<Vec<AgentStep>> {
        let rows = sqlx::query(
            r#"SELECT id, agent_run_id, step_index, step_type, inputs, status,
                      task_run_id, outputs_ref, error_message, attempt
               FROM agent_steps WHERE agent_run_id = $1 ORDER BY step_index"#,
        )
        .bind(agent_run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(agent_step_from_row).collect()
    }

    async fn list_notification_targets(&self) -> Result<Vec<NotificationTarget>> {
        let rows = sqlx::query(
            r#"SELECT id, channel, address, is_enabled, notify_on_statuses
               FROM notification_targets WHERE is_enabled"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(notification_target_from_row).collect()
    }

    async fn record_run_notification(&self, notification: RunNotification) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO run_notifications (id, run_id, target_id, outcome, error_text, created_at)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(notification.id)
        .bind(notification.run_id)
        .bind(notification.target_id)
        .bind(json_col(&notification.outcome))
        .bind(&notification.error_text)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }
}

fn directive_from_row(row: &sqlx::postgres::PgRow) -> Result<Directive> {
    Ok(Directive {
        id: row.try_get("id").map_err(map_sqlx)?,
        name: row.try_get("name").map_err(map_sqlx)?,
        directive_type: from_json_col(row.try_get("directive_type").map_err(map_sqlx)?)?,
        description: row.try_get("description").map_err(map_sqlx)?,
        task_config: row.try_get("task_config").map_err(map_sqlx)?,
        task_list: from_json_col(row.try_get("task_list").map_err(map_sqlx)?)?,
        version: row.try_get("version").map_err(map_sqlx)?,
        is_active: row.try_get("is_active").map_err(map_sqlx)?,
    })
}

fn job_template_from_row(row: &sqlx::postgres::PgRow) -> Result<JobTemplate> {
    Ok(JobTemplate {
        id: row.try_get("id").map_err(map_sqlx)?,
        name: row.try_get("name").map_err(map_sqlx)?,
        task_type: from_json_col(row.try_get("task_type").map_err(map_sqlx)?)?,
        default_config: row.try_get("default_config").map_err(map_sqlx)?,
        is_active: row.try_get("is_active").map_err(map_sqlx)?,
    })
}

fn schedule_from_row(row: &sqlx::postgres::PgRow) -> Result<Schedule> {
    Ok(Schedule {
        id: row.try_get("id").map_err(map_sqlx)?,
        name: row.try_get("name").map_err(map_sqlx)?,
        job_id: row.try_get("job_id").map_err(map_sqlx)?,
        directive_id: row.try_get("directive_id").map_err(map_sqlx)?,
        kind: from_json_col(row.try_get("kind").map_err(map_sqlx)?)?,
        next_run_at: row.try_get("next_run_at").map_err(map_sqlx)?,
        last_fire_at: row.try_get("last_fire_at").map_err(map_sqlx)?,
        is_enabled: row.try_get("is_enabled").map_err(map_sqlx)?,
        max_concurrent_global: row.try_get("max_concurrent_global").map_err(map_sqlx)?,
        max_concurrent_per_job: row.try_get("max_concurrent_per_job").map_err(map_sqlx)?,
        claimed_by: row.try_get("claimed_by").map_err(map_sqlx)?,
        claimed_until: row.try_get("claimed_until").map_err(map_sqlx)?,
    })
}

fn llm_call_from_row(row: &sqlx::postgres::PgRow) -> Result<LlmCall> {
    Ok(LlmCall {
        id: row.try_get("id").map_err(map_sqlx)?,
        job_id: row.try_get("job_id").map_err(map_sqlx)?,
        endpoint: row.try_get("endpoint").map_err(map_sqlx)?,
        model_id: row.try_get("model_id").map_err(map_sqlx)?,
        prompt_tokens: row.try_get("prompt_tokens").map_err(map_sqlx)?,
        completion_tokens: row.try_get("completion_tokens").map_err(map_sqlx)?,
        total_tokens: row.try_get("total_tokens").map_err(map_sqlx)?,
        call_duration_ms: row.try_get("call_duration_ms").map_err(map_sqlx)?,
        success: row.try_get("success").map_err(map_sqlx)?,
        error_type: row.try_get("error_type").map_err(map_sqlx)?,
    })
}

fn run_from_row(row: &sqlx::postgres::PgRow) -> Result<Run> {
    Ok(Run {
        id: row.try_get("id").map_err(map_sqlx)?,
        directive_snapshot: from_json_col(row.try_get("directive_snapshot").map_err(map_sqlx)?)?,
        status: from_json_col(row.try_get("status").map_err(map_sqlx)?)?,
        approval_status: from_json_col(row.try_get("approval_status").map_err(map_sqlx)?)?,
        assigned_host_id: row.try_get("assigned_host_id").map_err(map_sqlx)?,
        report_markdown: row.try_get("report_markdown").map_err(map_sqlx)?,
        report_json: row.try_get("report_json").map_err(map_sqlx)?,
        total_prompt_tokens: row.try_get("total_prompt_tokens").map_err(map_sqlx)?,
        total_completion_tokens: row.try_get("total_completion_tokens").map_err(map_sqlx)?,
        total_tokens: row.try_get("total_tokens").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        started_at: row.try_get("started_at").map_err(map_sqlx)?,
        ended_at: row.try_get("ended_at").map_err(map_sqlx)?,
    })
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job> {
    Ok(Job {
        id: row.try_get("id").map_err(map_sqlx)?,
        run_id: row.try_get("run_id").map_err(map_sqlx)?,
        job_template_id: row.try_get("job_template_id").map_err(map_sqlx)?,
        task_type: from_json_col(row.try_get("task_type").map_err(map_sqlx)?)?,
        config: row.try_get("config").map_err(map_sqlx)?,
        status: from_json_col(row.try_get("status").map_err(map_sqlx)?)?,
        result: row.try_get("result").map_err(map_sqlx)?,
        last_error: row.try_get("last_error").map_err(map_sqlx)?,
        prompt_tokens: row.try_get("prompt_tokens").map_err(map_sqlx)?,
        completion_tokens: row.try_get("completion_tokens").map_err(map_sqlx)?,
        total_tokens: row.try_get("total_tokens").map_err(map_sqlx)?,
    })
}

fn queue_item_from_row(row: &sqlx::postgres::PgRow) -> Result<JobQueueItem> {
    Ok(JobQueueItem {
        id: row.try_get("id").map_err(map_sqlx)?,
        job_id: row.try_get("job_id").map_err(map_sqlx)?,
        status: from_json_col(row.try_get("status").map_err(map_sqlx)?)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        claimed_by: row.try_get("claimed_by").map_err(map_sqlx)?,
        claimed_until: row.try_get("claimed_until").map_err(map_sqlx)?,
        last_error: row.try_get("last_error").map_err(map_sqlx)?,
    })
}

fn host_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkerHost> {
    Ok(WorkerHost {
        id: row.try_get("id").map_err(map_sqlx)?,
        name: row.try_get("name").map_err(map_sqlx)?,
        kind: from_json_col(row.try_get("kind").map_err(map_sqlx)?)?,
        endpoint: row.try_get("endpoint").map_err(map_sqlx)?,
        is_enabled: row.try_get("is_enabled").map_err(map_sqlx)?,
        health: from_json_col(row.try_get("health").map_err(map_sqlx)?)?,
        last_heartbeat_at: row.try_get("last_heartbeat_at").map_err(map_sqlx)?,
        has_gpu: row.try_get("has_gpu").map_err(map_sqlx)?,
        max_concurrent_runs: row.try_get("max_concurrent_runs").map_err(map_sqlx)?,
        active_runs_count: row.try_get("active_runs_count").map_err(map_sqlx)?,
    })
}

fn gpu_from_row(row: &sqlx::postgres::PgRow) -> Result<GpuState> {
    Ok(GpuState {
        gpu_id: row.try_get("gpu_id").map_err(map_sqlx)?,
        host_id: row.try_get("host_id").map_err(map_sqlx)?,
        total_vram_mb: row.try_get("total_vram_mb").map_err(map_sqlx)?,
        used_vram_mb: row.try_get("used_vram_mb").map_err(map_sqlx)?,
        free_vram_mb: row.try_get("free_vram_mb").map_err(map_sqlx)?,
        utilization_percent: row.try_get("utilization_percent").map_err(map_sqlx)?,
        is_available: row.try_get("is_available").map_err(map_sqlx)?,
        active_workers: row.try_get("active_workers").map_err(map_sqlx)?,
    })
}

fn agent_run_from_row(row: &sqlx::postgres::PgRow) -> Result<AgentRun> {
    let snapshot_json: Option<serde_json::Value> = row.try_get("directive_snapshot").map_err(map_sqlx)?;
    Ok(AgentRun {
        id: row.try_get("id").map_err(map_sqlx)?,
        operator_goal: row.try_get("operator_goal").map_err(map_sqlx)?,
        directive_snapshot: snapshot_json.map(from_json_col).transpose()?,
        status: from_json_col(row.try_get("status").map_err(map_sqlx)?)?,
        current_step: row.try_get("current_step").map_err(map_sqlx)?,
        max_steps: row.try_get("max_steps").map_err(map_sqlx)?,
        time_budget_minutes: row.try_get("time_budget_minutes").map_err(map_sqlx)?,
        token_budget: row.try_get("token_budget").map_err(map_sqlx)?,
        tokens_used: row.try_get("tokens_used").map_err(map_sqlx)?,
        error_message: row.try_get("error_message").map_err(map_sqlx)?,
        started_at: row.try_get("started_at").map_err(map_sqlx)?,
        ended_at: row.try_get("ended_at").map_err(map_sqlx)?,
        claimed_by: row.try_get("claimed_by").map_err(map_sqlx)?,
        claimed_until: row.try_get("claimed_until").map_err(map_sqlx)?,
    })
}

fn agent_step_from_row(row: &sqlx::postgres::PgRow) -> Result<AgentStep> {
    Ok(AgentStep {
        id: row.try_get("id").map_err(map_sqlx)?,
        agent_run_id: row.try_get("agent_run_id").map_err(map_sqlx)?,
        step_index: row.try_get("step_index").map_err(map_sqlx)?,
        step_type: from_json_col(row.try_get("step_type").map_err(map_sqlx)?)?,
        inputs: row.try_get("inputs").map_err(map_sqlx)?,
        status: from_json_col(row.try_get("status").map_err(map_sqlx)?)?,
        task_run_id: row.try_get("task_run_id").map_err(map_sqlx)?,
        outputs_ref: row.try_get("outputs_ref").map_err(map_sqlx)?,
        error_message: row.try_get("error_message").map_err(map_sqlx)?,
        attempt: row.try_get("attempt").map_err(map_sqlx)?,
    })
}

fn notification_target_from_row(row: &sqlx::postgres::PgRow) -> Result<NotificationTarget> {
    Ok(NotificationTarget {
        id: row.try_get("id").map_err(map_sqlx)?,
        channel: from_json_col(row.try_get("channel").map_err(map_sqlx)?)?,
        address: row.try_get("address").map_err(map_sqlx)?,
        is_enabled: row.try_get("is_enabled").map_err(map_sqlx)?,
        notify_on_statuses: from_json_col(row.try_get("notify_on_statuses").map_err(map_sqlx)?)?,
    })
}
