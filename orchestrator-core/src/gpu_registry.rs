//! GPU registry & scheduler. Scoring mirrors [`crate::domain::GpuState::scheduling_score`]:
//! lower score wins, ties broken lexically by `gpu_id`.

use std::sync::Arc;

use uuid::Uuid;

use crate::domain::GpuState;
use crate::error::{OrchestratorError, Result};
use crate::store::Store;

pub struct GpuRegistry {
    store: Arc<dyn Store>,
}

pub struct GpuSelection {
    pub gpu_id: String,
    pub reason: String,
}

impl GpuRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        GpuRegistry { store }
    }

    pub async fn record_metrics(&self, gpu: GpuState) -> Result<()> {
        self.store.save_gpu(gpu).await?;
        Ok(())
    }

    pub async fn mark_unavailable(&self, host_id: Uuid, gpu_id: &str) -> Result<()> {
        let gpus = self.store.list_gpus(host_id).await?;
        if let Some(mut gpu) = gpus.into_iter().find(|g| g.gpu_id == gpu_id) {
            gpu.is_available = false;
            self.store.save_gpu(gpu).await?;
        }
        Ok(())
    }

    /// `explicit_gpu` honors an operator override provided the GPU has
    /// sufficient headroom; otherwise falls back to auto-select with a
    /// warning, matching the worker orchestrator's GPU picker.
    pub async fn select_gpu(
        &self,
        host_id: Uuid,
        min_vram_mb: i64,
        explicit_gpu: Option<&str>,
    ) -> Result<GpuSelection> {
        let gpus = self.store.list_gpus(host_id).await?;

        if let Some(requested) = explicit_gpu {
            if let Some(gpu) = gpus.iter().find(|g| g.gpu_id == requested) {
                if gpu.is_available && gpu.free_vram_mb >= min_vram_mb {
                    return Ok(GpuSelection {
                        gpu_id: gpu.gpu_id.clone(),
                        reason: format!(
                            "explicit override: gpu {} has {} MB free (>= {} MB required)",
                            gpu.gpu_id, gpu.free_vram_mb, min_vram_mb
                        ),
                    });
                }
                tracing::warn!(
                    gpu_id = %requested,
                    "explicit GPU override lacks headroom or is unavailable, falling back to auto-select"
                );
            } else {
                tracing::warn!(gpu_id = %requested, "explicit GPU override not found on host, falling back to auto-select");
            }
        }

        let mut suitable: Vec<&GpuState> = gpus
            .iter()
            .filter(|g| g.is_available && g.free_vram_mb >= min_vram_mb)
            .collect();
        suitable.sort_by(|a, b| {
            a.scheduling_score()
                .partial_cmp(&b.scheduling_score())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.gpu_id.cmp(&b.gpu_id))
        });

        let chosen = suitable
            .first()
            .ok_or_else(|| OrchestratorError::NoGpuAvailable(format!("no GPU with >= {min_vram_mb} MB free")))?;

        Ok(GpuSelection {
            gpu_id: chosen.gpu_id.clone(),
            reason: format!(
                "auto-selected: score={:.4} free_vram_mb={} utilization={:.1}%",
                chosen.scheduling_score(),
                chosen.free_vram_mb,
                chosen.utilization_percent
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;

    fn gpu(id: &str, host: Uuid, free: i64, total: i64, util: f64) -> GpuState {
        GpuState {
            gpu_id: id.to_string(),
            host_id: host,
            total_vram_mb: total,
            used_vram_mb: total - free,
            free_vram_mb: free,
            utilization_percent: util,
            is_available: true,
            active_workers: 0,
        }
    }

    #[tokio::test]
    async fn picks_lowest_score_gpu() {
        let store = Arc::new(MemoryStore::new());
        let host = Uuid::new_v4();
        store.save_gpu(gpu("gpu-0", host, 2000, 16000, 90.0)).await.unwrap();
        store.save_gpu(gpu("gpu-1", host, 14000, 16000, 10.0)).await.unwrap();
        let registry = GpuRegistry::new(store);
        let selection = registry.select_gpu(host, 0, None).await.unwrap();
        assert_eq!(selection.gpu_id, "gpu-1");
    }

    #[tokio::test]
    async fn ties_break_lexically() {
        let store = Arc::new(MemoryStore::new());
        let host = Uuid::new_v4();
        store.save_gpu(gpu("gpu-b", host, 8000, 16000, 50.0)).await.unwrap();
        store.save_gpu(gpu("gpu-a", host, 8000, 16000, 50.0)).await.unwrap();
        let registry = GpuRegistry::new(store);
        let selection = registry.select_gpu(host, 0, None).await.unwrap();
        assert_eq!(selection.gpu_id, "gpu-a");
    }

    #[tokio::test]
    async fn no_gpu_available_errors() {
        let store = Arc::new(MemoryStore::new());
        let host = Uuid::new_v4();
        let registry = GpuRegistry::new(store);
        assert!(registry.select_gpu(host, 0, None).await.is_err());
    }
}
