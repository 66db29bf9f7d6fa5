//! Health alert dispatch — webhook or log. Fire-and-forget: a failed alert
//! is logged, never retried, and never blocks the engine.

use std::sync::Arc;

use async_trait::async_trait;
use cadence_core::config::AlertConfig;
use cadence_core::traits::AlertSink;
use cadence_core::types::HealthStatus;
use serde::{Deserialize, Serialize};

/// Payload posted to the alert webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub sequence_id: String,
    pub status: HealthStatus,
    pub detail: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// POSTs alerts as JSON to an HTTP endpoint.
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
    headers: Vec<(String, String)>,
}

impl WebhookAlertSink {
    pub fn new(url: &str, headers: Vec<(String, String)>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            headers,
        }
    }

    /// Send one alert. Returns Err(reason) on failure.
    pub async fn post(&self, alert: &Alert) -> Result<(), String> {
        let mut req = self
            .client
            .post(&self.url)
            .json(alert)
            .timeout(std::time::Duration::from_secs(10));
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| format!("Alert webhook send failed: {e}"))?;

        if resp.status().is_success() {
            tracing::info!("✅ Alert sent to {}: {} is {}", self.url, alert.sequence_id, alert.status);
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(format!("Alert webhook error {status}: {body}"))
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify(&self, sequence_id: &str, status: HealthStatus, detail: &str) {
        let alert = Alert {
            sequence_id: sequence_id.to_string(),
            status,
            detail: detail.to_string(),
            timestamp: chrono::Utc::now(),
        };
        if let Err(e) = self.post(&alert).await {
            tracing::warn!("⚠️ {e}");
        }
    }
}

/// Writes alerts to the log only.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, sequence_id: &str, status: HealthStatus, detail: &str) {
        tracing::error!("🚨 Sequence {sequence_id} health {status}: {detail}");
    }
}

/// Webhook sink when a URL is configured, log sink otherwise.
pub fn alert_sink_from_config(config: &AlertConfig) -> Arc<dyn AlertSink> {
    match config.webhook_url.as_deref() {
        Some(url) if !url.trim().is_empty() => Arc::new(WebhookAlertSink::new(url, config.headers.clone())),
        _ => Arc::new(LogAlertSink),
    }
}

/// Deliver an alert in the background if a runtime is available.
pub fn spawn_alert(sink: Arc<dyn AlertSink>, sequence_id: &str, status: HealthStatus, detail: String) {
    let sequence_id = sequence_id.to_string();
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                sink.notify(&sequence_id, status, &detail).await;
            });
        }
        Err(_) => tracing::warn!("⚠️ No runtime for alert on {sequence_id} ({status}): {detail}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingAlertSink;

    #[test]
    fn test_sink_from_config() {
        // Only checks construction; no network.
        let _log = alert_sink_from_config(&AlertConfig::default());
        let _hook = alert_sink_from_config(&AlertConfig {
            webhook_url: Some("http://127.0.0.1:9/alerts".into()),
            headers: vec![("Authorization".into(), "Bearer t".into())],
        });
    }

    #[tokio::test]
    async fn test_webhook_failure_is_reported_not_raised() {
        let sink = WebhookAlertSink::new("http://127.0.0.1:9/alerts", vec![]);
        let alert = Alert {
            sequence_id: "s1".into(),
            status: HealthStatus::Critical,
            detail: "error rate 40%".into(),
            timestamp: chrono::Utc::now(),
        };
        assert!(sink.post(&alert).await.is_err());
        // The trait method swallows the failure.
        sink.notify("s1", HealthStatus::Critical, "error rate 40%").await;
    }

    #[tokio::test]
    async fn test_spawn_alert_delivers_in_background() {
        let sink = Arc::new(RecordingAlertSink::default());
        spawn_alert(sink.clone(), "s1", HealthStatus::Critical, "detail".into());
        for _ in 0..50 {
            if !sink.alerts.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(sink.alerts.lock().unwrap()[0], ("s1".to_string(), HealthStatus::Critical));
    }

    #[test]
    fn test_alert_payload_shape() {
        let alert = Alert {
            sequence_id: "s1".into(),
            status: HealthStatus::Warning,
            detail: "x".into(),
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["status"], "warning");
        assert_eq!(json["sequence_id"], "s1");
    }
}
