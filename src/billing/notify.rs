use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

/// key: guardian-notifier -> outbound email/messaging collaborator
#[async_trait]
pub trait GuardianNotifier: Send + Sync {
    async fn notify_guardian(&self, event: &'static str, payload: Value);
}

/// Default notifier: records the notification in the service log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl GuardianNotifier for LoggingNotifier {
    async fn notify_guardian(&self, event: &'static str, payload: Value) {
        info!(event, %payload, "guardian notification dispatched");
    }
}

/// Fire-and-forget: the caller never waits on delivery.
pub fn notify_detached(notifier: Arc<dyn GuardianNotifier>, event: &'static str, payload: Value) {
    tokio::spawn(async move {
        notifier.notify_guardian(event, payload).await;
    });
}
