//! Telemetry snapshots pushed by the encoding engine

use crate::clock;
use crate::error::{ControlError, ControlResult};
use crate::keyed::KeyedSlots;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn idle() -> String {
    "idle".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InputHealth {
    pub connected: bool,
    /// kbps
    pub bitrate: f64,
    /// Percent
    pub packet_loss: f64,
    /// Milliseconds
    pub latency: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputHealth {
    pub active: bool,
    pub viewers: u64,
    pub uptime: f64,
    pub errors: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Performance {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub fps: f64,
    pub queue_size: u64,
}

/// Latest reported health of one encoder
///
/// Fields the engine reports beyond the known ones are kept in `extra` and
/// echoed back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncoderStatus {
    #[serde(default = "idle", alias = "state")]
    pub status: String,
    #[serde(default)]
    pub uptime: f64,
    #[serde(default)]
    pub input_health: InputHealth,
    #[serde(default)]
    pub output_health: OutputHealth,
    #[serde(default)]
    pub performance: Performance,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for EncoderStatus {
    fn default() -> Self {
        Self {
            status: idle(),
            uptime: 0.0,
            input_health: InputHealth::default(),
            output_health: OutputHealth::default(),
            performance: Performance::default(),
            last_updated: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct StatusAggregator {
    snapshots: KeyedSlots<EncoderStatus>,
}

impl StatusAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the encoder's snapshot and stamps `lastUpdated`
    pub async fn report(
        &self,
        encoder_id: &str,
        status: Option<EncoderStatus>,
    ) -> ControlResult<EncoderStatus> {
        let mut status =
            status.ok_or_else(|| ControlError::validation("Missing encoder ID or status"))?;

        let slot = self.snapshots.entry(encoder_id).await;
        let mut current = slot.lock().await;
        status.last_updated = Some(match current.last_updated {
            Some(prev) => clock::now_after(prev),
            None => clock::now(),
        });
        *current = status.clone();

        tracing::debug!(encoder_id = %encoder_id, status = %status.status, "status reported");
        Ok(status)
    }

    /// Last reported snapshot, or the zeroed default for silent encoders
    pub async fn get(&self, encoder_id: &str) -> EncoderStatus {
        match self.snapshots.get(encoder_id).await {
            Some(slot) => slot.lock().await.clone(),
            None => EncoderStatus::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_unknown_encoder_gets_zeroed_default() {
        let aggregator = StatusAggregator::new();
        let status = aggregator.get("enc1").await;
        assert_eq!(status, EncoderStatus::default());

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["status"], "idle");
        assert_eq!(value["inputHealth"]["connected"], false);
        assert_eq!(value["performance"]["queueSize"], 0);
        assert!(value["lastUpdated"].is_null());
    }

    #[tokio::test]
    async fn test_report_replaces_snapshot() {
        let aggregator = StatusAggregator::new();
        let first: EncoderStatus = serde_json::from_value(json!({
            "status": "running",
            "uptime": 120,
            "inputHealth": {"connected": true, "bitrate": 5000, "packetLoss": 0.1, "latency": 40},
            "performance": {"cpuUsage": 37.5, "fps": 29.97}
        }))
        .unwrap();
        let stored = aggregator.report("enc1", Some(first)).await.unwrap();
        assert!(stored.last_updated.is_some());

        let second: EncoderStatus =
            serde_json::from_value(json!({"state": "degraded"})).unwrap();
        let replaced = aggregator.report("enc1", Some(second)).await.unwrap();

        let current = aggregator.get("enc1").await;
        assert_eq!(current, replaced);
        assert_eq!(current.status, "degraded");
        assert!(!current.input_health.connected);
        assert!(current.last_updated > stored.last_updated);
    }

    #[tokio::test]
    async fn test_unknown_fields_survive() {
        let aggregator = StatusAggregator::new();
        let status: EncoderStatus = serde_json::from_value(json!({
            "status": "running",
            "gpu": {"temperature": 71}
        }))
        .unwrap();
        aggregator.report("enc1", Some(status)).await.unwrap();

        let value = serde_json::to_value(aggregator.get("enc1").await).unwrap();
        assert_eq!(value["gpu"]["temperature"], 71);
    }

    #[tokio::test]
    async fn test_report_requires_status() {
        let aggregator = StatusAggregator::new();
        let err = aggregator.report("enc1", None).await.unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
        assert_eq!(err.to_string(), "Missing encoder ID or status");
        assert_eq!(aggregator.get("enc1").await, EncoderStatus::default());
    }
}
