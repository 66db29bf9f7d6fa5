//! Alerting collaborator.

use async_trait::async_trait;

use crate::types::HealthStatus;

/// Receives sequence health alerts. Best-effort: failures are the sink's problem.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, sequence_id: &str, status: HealthStatus, detail: &str);
}
