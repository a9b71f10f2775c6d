use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle event published on every consent status transition.
#[derive(Debug, Clone, Serialize)]
pub struct ConsentStateChangeEvent {
    pub consent_id: Uuid,
    pub client_id: String,
    pub user_id: Option<String>,
    pub previous_status: Option<String>,
    pub new_status: String,
    pub reason: String,
    pub metadata: HashMap<String, Value>,
}

/// Fire-and-forget publication of lifecycle events.
///
/// `notify` is infallible at this boundary: implementations own their
/// failure handling, and lifecycle operations never fail because of
/// notification fan-out. Token revocation and external auditing consume
/// these events outside this core.
#[async_trait]
pub trait StateChangeNotifier: Send + Sync {
    async fn notify(&self, event: ConsentStateChangeEvent);
}

/// In-tree notifier that emits events through the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl StateChangeNotifier for TracingNotifier {
    async fn notify(&self, event: ConsentStateChangeEvent) {
        tracing::info!(
            consent_id = %event.consent_id,
            client_id = %event.client_id,
            user_id = event.user_id.as_deref().unwrap_or(""),
            previous_status = event.previous_status.as_deref().unwrap_or(""),
            new_status = %event.new_status,
            reason = %event.reason,
            "consent state changed"
        );
    }
}
