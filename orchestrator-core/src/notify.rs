//! Notification sink adapter. Fires on every terminal `Run` transition;
//! payloads are strictly structural (counts, timestamps, truncated error
//! text) — never report content beyond what the Run itself already persists.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::*;
use crate::error::Result;
use crate::store::Store;

const MAX_ERROR_TEXT_LEN: usize = 1000;

#[derive(Debug, Serialize)]
pub struct NotificationPayload {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub directive_name: String,
    pub jobs_total: usize,
    pub jobs_completed: usize,
    pub jobs_failed: usize,
    pub total_tokens: i64,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error_text: Option<String>,
}

/// Injected delivery capability — the concrete implementation posts a
/// webhook over `reqwest`; a test double can record payloads in memory.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, target: &NotificationTarget, payload: &NotificationPayload) -> anyhow::Result<()>;
}

pub struct WebhookSink {
    client: reqwest::Client,
}

impl Default for WebhookSink {
    fn default() -> Self {
        WebhookSink {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn deliver(&self, target: &NotificationTarget, payload: &NotificationPayload) -> anyhow::Result<()> {
        self.client
            .post(&target.address)
            .json(payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

pub struct Notifier {
    store: Arc<dyn Store>,
    sink: Arc<dyn NotificationSink>,
}

impl Notifier {
    pub fn new(store: Arc<dyn Store>, sink: Arc<dyn NotificationSink>) -> Self {
        Notifier { store, sink }
    }

    pub async fn notify_run_terminal(&self, run: &Run) -> Result<()> {
        if !run.status.is_terminal() {
            return Ok(());
        }

        let jobs = self.store.jobs_for_run(run.id).await?;
        let jobs_completed = jobs.iter().filter(|j| j.status == JobStatus::Success).count();
        let jobs_failed = jobs.iter().filter(|j| j.status == JobStatus::Failed).count();
        let error_text = jobs
            .iter()
            .filter_map(|j| j.last_error.clone())
            .collect::<Vec<_>>()
            .join("; ");
        let error_text = if error_text.is_empty() {
            None
        } else {
            Some(truncate(&error_text, MAX_ERROR_TEXT_LEN))
        };

        let payload = NotificationPayload {
            run_id: run.id,
            status: run.status,
            directive_name: run.directive_snapshot.name.clone(),
            jobs_total: jobs.len(),
            jobs_completed,
            jobs_failed,
            total_tokens: run.total_tokens,
            started_at: run.started_at,
            ended_at: run.ended_at,
            error_text,
        };

        let targets = self.store.list_notification_targets().await?;
        for target in targets {
            if !target.notify_on_statuses.contains(&run.status) {
                continue;
            }
            let outcome = match self.sink.deliver(&target, &payload).await {
                Ok(()) => NotificationOutcome::Delivered,
                Err(e) => {
                    tracing::warn!(target_id = %target.id, error = %e, "notification delivery failed");
                    NotificationOutcome::Failed
                }
            };
            self.store
                .record_run_notification(RunNotification {
                    id: Uuid::new_v4(),
                    run_id: run.id,
                    target_id: target.id,
                    outcome,
                    error_text: None,
                    created_at: crate::clock::now(),
                })
                .await?;
        }

        Ok(())
    }
}

fn truncate(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        text.to_string()
    } else {
        text.chars().take(max_len).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(&self, target: &NotificationTarget, _payload: &NotificationPayload) -> anyhow::Result<()> {
            self.delivered.lock().await.push(target.id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn notifies_only_enabled_targets_matching_status() {
        let store = Arc::new(MemoryStore::new());
        store
            .seed_notification_target(NotificationTarget {
                id: Uuid::new_v4(),
                channel: NotificationChannel::Webhook,
                address: "http://example.test/hook".into(),
                is_enabled: true,
                notify_on_statuses: vec![RunStatus::Failed],
            })
            .await;

        let directive = Directive {
            id: Uuid::new_v4(),
            name: "d".into(),
            directive_type: DirectiveType::D1,
            description: "".into(),
            task_config: serde_json::json!({}),
            task_list: vec![],
            version: 1,
            is_active: true,
        };
        let mut run = Run::new(DirectiveSnapshot::from(&directive));
        run.status = RunStatus::Success;

        let sink = Arc::new(RecordingSink::default());
        let notifier = Notifier::new(store.clone(), sink.clone());
        notifier.notify_run_terminal(&run).await.unwrap();
        assert!(sink.delivered.lock().await.is_empty());

        run.status = RunStatus::Failed;
        notifier.notify_run_terminal(&run).await.unwrap();
        assert_eq!(sink.delivered.lock().await.len(), 1);
    }
}
