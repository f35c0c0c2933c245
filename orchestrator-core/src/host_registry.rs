//! Host registry & health monitor. Selection rule: an explicit target host is
//! honored only if it is enabled, healthy, and not stale; otherwise (and on
//! auto-select) candidates are filtered to enabled+healthy+capacity-checked
//! hosts and sorted by `(not has_capacity(), active_runs_count)` — the same
//! ordering the original host router used, ties broken by insertion order.

use std::sync::Arc;

use chrono::Duration;
use uuid::Uuid;

use crate::domain::{HostHealth, WorkerHost};
use crate::error::{OrchestratorError, Result};
use crate::store::Store;

/// Hosts are considered stale if no heartbeat has landed within this window.
pub const STALE_AFTER: Duration = Duration::seconds(90);

pub struct HostRegistry {
    store: Arc<dyn Store>,
}

impl HostRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        HostRegistry { store }
    }

    pub async fn heartbeat(&self, host_id: Uuid, health: HostHealth) -> Result<()> {
        if let Some(mut host) = self.store.get_host(host_id).await? {
            host.health = health;
            host.last_heartbeat_at = Some(crate::clock::now());
            self.store.save_host(host).await?;
        }
        Ok(())
    }

    pub async fn sweep_stale(&self) -> Result<()> {
        let at = crate::clock::now();
        for mut host in self.store.list_hosts().await? {
            if host.is_stale(at, STALE_AFTER) && host.health != HostHealth::Unreachable {
                host.health = HostHealth::Unreachable;
                self.store.save_host(host).await?;
            }
        }
        Ok(())
    }

    /// Pings a single host through its container runtime and records the
    /// observed health as a heartbeat. A failed ping degrades the host rather
    /// than marking it unreachable outright — `sweep_stale` is what escalates
    /// a host that never recovers.
    pub async fn probe(&self, host_id: Uuid, runtime: &dyn crate::worker::ContainerRuntime) -> Result<()> {
        let host = match self.store.get_host(host_id).await? {
            Some(h) => h,
            None => return Ok(()),
        };
        match runtime.list_active(&host.endpoint, "orchestrator.ephemeral").await {
            Ok(_) => self.heartbeat(host_id, HostHealth::Healthy).await,
            Err(e) => {
                tracing::warn!(host_id = %host_id, error = %e, "host probe failed");
                self.heartbeat(host_id, HostHealth::Degraded).await
            }
        }
    }

    async fn available_candidates(&self, requires_gpu: bool) -> Result<Vec<WorkerHost>> {
        let at = crate::clock::now();
        let mut candidates: Vec<WorkerHost> = self
            .store
            .list_hosts()
            .await?
            .into_iter()
            .filter(|h| h.is_enabled && h.health == HostHealth::Healthy && !h.is_stale(at, STALE_AFTER))
            .filter(|h| !requires_gpu || h.has_gpu)
            .collect();
        candidates.sort_by_key(|h| (!h.has_capacity(), h.active_runs_count));
        Ok(candidates)
    }

    pub async fn select_host(
        &self,
        target_host_id: Option<Uuid>,
        requires_gpu: bool,
    ) -> Result<WorkerHost> {
        if let Some(id) = target_host_id {
            let at = crate::clock::now();
            if let Some(host) = self.store.get_host(id).await? {
                if host.is_enabled && host.health == HostHealth::Healthy && !host.is_stale(at, STALE_AFTER) {
                    return Ok(host);
                }
                tracing::warn!(host_id = %id, "explicit host target is unhealthy or stale, falling back to auto-select");
            } else {
                tracing::warn!(host_id = %id, "explicit host target not found, falling back to auto-select");
            }
        }
        self.available_candidates(requires_gpu)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| OrchestratorError::NoHostAvailable("no enabled, healthy, capacity-bearing host found".into()))
    }

    pub async fn increment_active_runs(&self, host_id: Uuid) -> Result<()> {
        if let Some(mut host) = self.store.get_host(host_id).await? {
            host.active_runs_count += 1;
            self.store.save_host(host).await?;
        }
        Ok(())
    }

    pub async fn decrement_active_runs(&self, host_id: Uuid) -> Result<()> {
        if let Some(mut host) = self.store.get_host(host_id).await? {
            host.active_runs_count = (host.active_runs_count - 1).max(0);
            self.store.save_host(host).await?;
        }
        Ok(())
    }
}
