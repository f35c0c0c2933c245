//! Worker orchestrator. Spawns/stops ephemeral worker containers behind a
//! `ContainerRuntime` capability trait so the Docker Engine API wire protocol
//! stays an injected dependency, not something this crate's tests need to
//! exercise for real.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{WorkerAudit, WorkerHost, WorkerOperation};
use crate::error::{OrchestratorError, Result};
use crate::gpu_registry::GpuRegistry;
use crate::host_registry::HostRegistry;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub tag: String,
    pub labels: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub logs_root: String,
    pub uploads_root: String,
    pub gpu_id: Option<String>,
    pub mem_limit_bytes: i64,
}

#[derive(Debug, Clone)]
pub struct SpawnedContainer {
    pub container_id: String,
}

/// Injected capability — the concrete implementation talks to a Docker Engine
/// API endpoint (local socket or TCP, per `WorkerHost::kind`) via `bollard`.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn spawn(&self, endpoint: &str, spec: &ContainerSpec) -> anyhow::Result<SpawnedContainer>;
    async fn stop(&self, endpoint: &str, container_id: &str) -> anyhow::Result<()>;
    async fn list_active(&self, endpoint: &str, label_key: &str) -> anyhow::Result<Vec<String>>;
    async fn collect_logs(
        &self,
        endpoint: &str,
        container_id: &str,
        since: Option<chrono::DateTime<chrono::Utc>>,
        tail: usize,
    ) -> anyhow::Result<String>;
}

/// Real implementation backed by `bollard`. Connection is per-call (cheap —
/// bollard's client is a thin hyper wrapper) rather than pooled, since spawns
/// happen at dispatcher cadence, not per-request.
pub struct BollardRuntime;

#[async_trait]
impl ContainerRuntime for BollardRuntime {
    async fn spawn(&self, endpoint: &str, spec: &ContainerSpec) -> anyhow::Result<SpawnedContainer> {
        use bollard::container::Config;
        use bollard::models::{DeviceRequest, HostConfig};
        use bollard::Docker;

        let docker = connect(endpoint)?;

        let device_requests = spec.gpu_id.as_ref().map(|gpu_id| {
            vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                count: None,
                device_ids: Some(vec![gpu_id.clone()]),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                options: None,
            }]
        });

        let host_config = HostConfig {
            network_mode: Some("bridge".to_string()),
            binds: Some(vec![
                format!("{}:/logs:rw", spec.logs_root),
                format!("{}:/uploads:ro", spec.uploads_root),
            ]),
            device_requests,
            memory: Some(spec.mem_limit_bytes),
            memory_swap: Some(spec.mem_limit_bytes),
            auto_remove: Some(true),
            ..Default::default()
        };

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let config = Config {
            image: Some(format!("{}:{}", spec.image, spec.tag)),
            labels: Some(spec.labels.clone()),
            env: Some(env),
            host_config: Some(host_config),
            ..Default::default()
        };

        let name = format!("orch-worker-{}", Uuid::new_v4());
        let created = docker
            .create_container(
                Some(bollard::container::CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;
        docker
            .start_container(&created.id, None::<bollard::container::StartContainerOptions<String>>)
            .await?;

        Ok(SpawnedContainer { container_id: created.id })
    }

    async fn stop(&self, endpoint: &str, container_id: &str) -> anyhow::Result<()> {
        let docker = connect(endpoint)?;
        docker.stop_container(container_id, None).await?;
        Ok(())
    }

    async fn list_active(&self, endpoint: &str, label_key: &str) -> anyhow::Result<Vec<String>> {
        use bollard::container::ListContainersOptions;

        let docker = connect(endpoint)?;
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label_key.to_string()]);
        let containers = docker
            .list_containers(Some(ListContainersOptions {
                all: false,
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn collect_logs(
        &self,
        endpoint: &str,
        container_id: &str,
        since: Option<chrono::DateTime<chrono::Utc>>,
        tail: usize,
    ) -> anyhow::Result<String> {
        use bollard::container::LogsOptions;
        use futures_util::StreamExt;

        let docker = connect(endpoint)?;
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: tail.to_string(),
            since: since.map(|t| t.timestamp()).unwrap_or(0),
            ..Default::default()
        };
        let mut stream = docker.logs(container_id, Some(options));
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => out.extend_from_slice(&log.into_bytes()),
                Err(_) => break,
            }
        }
        Ok(String::from_utf8(out.clone()).unwrap_or_else(|_| String::from_utf8_lossy(&out).into_owned()))
    }
}

fn connect(endpoint: &str) -> anyhow::Result<bollard::Docker> {
    if endpoint.starts_with("tcp://") || endpoint.starts_with("http://") {
        Ok(bollard::Docker::connect_with_http(endpoint, 30, bollard::API_DEFAULT_VERSION)?)
    } else {
        Ok(bollard::Docker::connect_with_local_defaults()?)
    }
}

/// Test double — records nothing, always succeeds, never touches a socket.
#[derive(Default)]
pub struct NullContainerRuntime;

#[async_trait]
impl ContainerRuntime for NullContainerRuntime {
    async fn spawn(&self, _endpoint: &str, _spec: &ContainerSpec) -> anyhow::Result<SpawnedContainer> {
        Ok(SpawnedContainer {
            container_id: format!("null-{}", Uuid::new_v4()),
        })
    }

    async fn stop(&self, _endpoint: &str, _container_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn list_active(&self, _endpoint: &str, _label_key: &str) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn collect_logs(
        &self,
        _endpoint: &str,
        _container_id: &str,
        _since: Option<chrono::DateTime<chrono::Utc>>,
        _tail: usize,
    ) -> anyhow::Result<String> {
        Ok(String::new())
    }
}

pub struct WorkerOrchestrator {
    store: Arc<dyn Store>,
    hosts: Arc<HostRegistry>,
    gpus: Arc<GpuRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    logs_root: String,
    uploads_root: String,
}

impl WorkerOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        hosts: Arc<HostRegistry>,
        gpus: Arc<GpuRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        logs_root: String,
        uploads_root: String,
    ) -> Self {
        WorkerOrchestrator {
            store,
            hosts,
            gpus,
            runtime,
            logs_root,
            uploads_root,
        }
    }

    async fn audit(
        &self,
        job_id: Option<Uuid>,
        operation: WorkerOperation,
        container_id: Option<String>,
        gpu_assigned: Option<String>,
        gpu_selection_reason: Option<String>,
        config_snapshot: serde_json::Value,
        success: bool,
        message: impl Into<String>,
    ) -> Result<()> {
        self.store
            .append_worker_audit(WorkerAudit {
                id: Uuid::new_v4(),
                job_id,
                operation,
                container_id,
                gpu_assigned,
                gpu_selection_reason,
                config_snapshot,
                success,
                message: message.into(),
                created_at: crate::clock::now(),
            })
            .await?;
        Ok(())
    }

    pub async fn spawn_worker(
        &self,
        job_id: Uuid,
        image_name: &str,
        image_tag: &str,
        target_host_id: Option<Uuid>,
        explicit_gpu: Option<&str>,
    ) -> Result<(WorkerHost, SpawnedContainer)> {
        let allowlist_entry = self
            .store
            .get_image_allowlist_entry(image_name, image_tag)
            .await?;
        let entry = match &allowlist_entry {
            Some(e) if e.is_active => e,
            _ => {
                self.audit(
                    Some(job_id),
                    WorkerOperation::Error,
                    None,
                    None,
                    None,
                    serde_json::json!({"image": image_name, "tag": image_tag}),
                    false,
                    "image not on allowlist",
                )
                .await?;
                return Err(OrchestratorError::ImageNotAllowed(format!(
                    "{image_name}:{image_tag} is not on the active allowlist"
                )));
            }
        };

        let host = match self.hosts.select_host(target_host_id, entry.requires_gpu).await {
            Ok(h) => h,
            Err(e) => {
                self.audit(
                    Some(job_id),
                    WorkerOperation::Error,
                    None,
                    None,
                    None,
                    serde_json::json!({"image": image_name, "tag": image_tag}),
                    false,
                    format!("host selection failed: {e}"),
                )
                .await?;
                return Err(e);
            }
        };

        let gpu_selection = if entry.requires_gpu {
            match self.gpus.select_gpu(host.id, entry.min_vram_mb, explicit_gpu).await {
                Ok(sel) => Some(sel),
                Err(e) => {
                    self.audit(
                        Some(job_id),
                        WorkerOperation::Error,
                        None,
                        None,
                        None,
                        serde_json::json!({"image": image_name, "tag": image_tag, "host_id": host.id}),
                        false,
                        format!("GPU selection failed: {e}"),
                    )
                    .await?;
                    return Err(e);
                }
            }
        } else {
            None
        };

        let mut labels = HashMap::new();
        labels.insert("orchestrator.job_id".to_string(), job_id.to_string());
        labels.insert("orchestrator.ephemeral".to_string(), "true".to_string());

        let spec = ContainerSpec {
            image: image_name.to_string(),
            tag: image_tag.to_string(),
            labels,
            env: HashMap::new(),
            logs_root: self.logs_root.clone(),
            uploads_root: self.uploads_root.clone(),
            gpu_id: gpu_selection.as_ref().map(|s| s.gpu_id.clone()),
            mem_limit_bytes: 4 * 1024 * 1024 * 1024,
        };

        let config_snapshot = serde_json::json!({
            "image": image_name,
            "tag": image_tag,
            "host_id": host.id,
            "gpu_id": gpu_selection.as_ref().map(|s| s.gpu_id.clone()),
        });

        match self.runtime.spawn(&host.endpoint, &spec).await {
            Ok(spawned) => {
                if let Some(sel) = &gpu_selection {
                    if let Some(mut gpu) = self
                        .store
                        .list_gpus(host.id)
                        .await?
                        .into_iter()
                        .find(|g| g.gpu_id == sel.gpu_id)
                    {
                        gpu.active_workers += 1;
                        self.store.save_gpu(gpu).await?;
                    }
                }
                self.hosts.increment_active_runs(host.id).await?;
                self.audit(
                    Some(job_id),
                    WorkerOperation::Spawn,
                    Some(spawned.container_id.clone()),
                    gpu_selection.as_ref().map(|s| s.gpu_id.clone()),
                    gpu_selection.as_ref().map(|s| s.reason.clone()),
                    config_snapshot,
                    true,
                    "worker spawned",
                )
                .await?;
                Ok((host, spawned))
            }
            Err(e) => {
                self.audit(
                    Some(job_id),
                    WorkerOperation::Error,
                    None,
                    gpu_selection.as_ref().map(|s| s.gpu_id.clone()),
                    gpu_selection.as_ref().map(|s| s.reason.clone()),
                    config_snapshot,
                    false,
                    format!("container runtime spawn failed: {e}"),
                )
                .await?;
                Err(OrchestratorError::TransientRuntimeError(e.to_string()))
            }
        }
    }

    pub async fn stop_worker(&self, host: &WorkerHost, container_id: &str) -> Result<()> {
        self.runtime
            .stop(&host.endpoint, container_id)
            .await
            .map_err(|e| OrchestratorError::TransientRuntimeError(e.to_string()))?;
        self.hosts.decrement_active_runs(host.id).await?;
        self.audit(
            None,
            WorkerOperation::Stop,
            Some(container_id.to_string()),
            None,
            None,
            serde_json::json!({}),
            true,
            "worker stopped",
        )
        .await?;
        Ok(())
    }

    /// Probes every enabled host once. Called at dispatcher cadence so a host
    /// that never gets a scheduled job still has its health refreshed.
    pub async fn probe_all(&self) -> Result<()> {
        for host in self.store.list_hosts().await?.into_iter().filter(|h| h.is_enabled) {
            self.hosts.probe(host.id, self.runtime.as_ref()).await?;
        }
        Ok(())
    }

    /// Compares `bollard`'s live container list against the allowlist and
    /// records a snapshot per observed container; does not stop anything.
    pub async fn cleanup_orphans(&self, host: &WorkerHost) -> Result<Vec<String>> {
        let active = self
            .runtime
            .list_active(&host.endpoint, "orchestrator.ephemeral")
            .await
            .map_err(|e| OrchestratorError::TransientRuntimeError(e.to_string()))?;
        let mut orphans = Vec::new();
        for container_id in &active {
            if !self.store.is_container_allowed(container_id).await? {
                orphans.push(container_id.clone());
            }
        }
        Ok(orphans)
    }
}
