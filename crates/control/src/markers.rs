//! SCTE-35 marker timeline
//!
//! An append-only log of markers per encoder plus the source-level SCTE-35
//! settings. Removal is a tombstone: the marker keeps its place in the log
//! with status `removed`. The timeline does not require the encoder to have a
//! stored configuration or to be running.

use crate::clock;
use crate::error::{ControlError, ControlResult};
use crate::ids::{IdGenerator, IdKind};
use crate::keyed::KeyedSlots;
use crate::lenient;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub const DEFAULT_MARKER_TYPE: &str = "program_start";
pub const DEFAULT_MARKER_DURATION: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerStatus {
    Inserted,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scte35Marker {
    pub marker_id: String,
    pub encoder_id: String,
    #[serde(rename = "type")]
    pub marker_type: String,
    /// Seconds
    pub duration: u32,
    pub upid: String,
    pub description: String,
    pub inserted_at: DateTime<Utc>,
    pub status: MarkerStatus,
    pub removed_at: Option<DateTime<Utc>>,
}

/// Fields of an insert request; absent fields take the defaults
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerInsert {
    #[serde(default, alias = "type")]
    pub marker_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_u32")]
    pub duration: Option<u32>,
    #[serde(default)]
    pub upid: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Source-level SCTE-35 handling for one encoder
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scte35Settings {
    #[serde(default)]
    pub enabled: bool,
    /// Where markers come from, e.g. `embedded` or `manual`
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub passthrough: bool,
    /// Insertion policy, e.g. `none`, `splice_insert`, `time_signal`
    #[serde(default)]
    pub insertion: Option<String>,
    #[serde(default)]
    pub upid_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_u32")]
    pub duration: Option<u32>,
    #[serde(default, deserialize_with = "lenient::opt_u32")]
    pub preroll: Option<u32>,
    #[serde(default, deserialize_with = "lenient::opt_u32")]
    pub postroll: Option<u32>,
}

/// Outcome of a remove request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerRemoval {
    pub marker_id: String,
    pub status: MarkerStatus,
    pub timestamp: DateTime<Utc>,
    /// False when the id matched no marker; the removal still succeeds
    pub known: bool,
}

#[derive(Debug, Default)]
struct Timeline {
    markers: Vec<Scte35Marker>,
    settings: Option<Scte35Settings>,
}

pub struct MarkerTimeline {
    timelines: KeyedSlots<Timeline>,
    /// marker id -> owning encoder id
    owners: RwLock<HashMap<String, String>>,
    ids: Arc<dyn IdGenerator>,
}

impl MarkerTimeline {
    pub fn new(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            timelines: KeyedSlots::new(),
            owners: RwLock::new(HashMap::new()),
            ids,
        }
    }

    pub async fn insert(&self, encoder_id: &str, request: MarkerInsert) -> Scte35Marker {
        let marker = Scte35Marker {
            marker_id: self.ids.next_id(IdKind::Marker),
            encoder_id: encoder_id.to_string(),
            marker_type: request
                .marker_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DEFAULT_MARKER_TYPE.to_string()),
            duration: request.duration.unwrap_or(DEFAULT_MARKER_DURATION),
            upid: request.upid.unwrap_or_default(),
            description: request.description.unwrap_or_default(),
            inserted_at: clock::now(),
            status: MarkerStatus::Inserted,
            removed_at: None,
        };

        let slot = self.timelines.entry(encoder_id).await;
        let mut timeline = slot.lock().await;
        self.owners
            .write()
            .await
            .insert(marker.marker_id.clone(), encoder_id.to_string());
        timeline.markers.push(marker.clone());

        tracing::info!(
            encoder_id = %encoder_id,
            marker_id = %marker.marker_id,
            marker_type = %marker.marker_type,
            duration = marker.duration,
            "scte-35 marker inserted"
        );
        marker
    }

    /// Tombstones a marker. Unknown ids are reported as removed as well.
    pub async fn remove(&self, marker_id: Option<&str>) -> ControlResult<MarkerRemoval> {
        let marker_id = marker_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ControlError::validation("Missing marker ID for removal"))?;

        let owner = self.owners.read().await.get(marker_id).cloned();
        let now = clock::now();

        let mut known = false;
        if let Some(encoder_id) = owner {
            if let Some(slot) = self.timelines.get(&encoder_id).await {
                let mut timeline = slot.lock().await;
                if let Some(marker) = timeline
                    .markers
                    .iter_mut()
                    .find(|m| m.marker_id == marker_id)
                {
                    known = true;
                    if marker.status == MarkerStatus::Inserted {
                        marker.status = MarkerStatus::Removed;
                        marker.removed_at = Some(now);
                    }
                }
            }
        }

        if known {
            tracing::info!(marker_id = %marker_id, "scte-35 marker removed");
        } else {
            tracing::debug!(marker_id = %marker_id, "removal of unknown scte-35 marker");
        }

        Ok(MarkerRemoval {
            marker_id: marker_id.to_string(),
            status: MarkerStatus::Removed,
            timestamp: now,
            known,
        })
    }

    /// All markers of an encoder, tombstones included, oldest first
    pub async fn list(&self, encoder_id: &str) -> Vec<Scte35Marker> {
        let Some(slot) = self.timelines.get(encoder_id).await else {
            return Vec::new();
        };
        let mut markers = slot.lock().await.markers.clone();
        // Stable sort keeps insertion order for equal timestamps
        markers.sort_by_key(|m| m.inserted_at);
        markers
    }

    pub async fn configure(
        &self,
        encoder_id: &str,
        settings: Option<Scte35Settings>,
    ) -> ControlResult<Scte35Settings> {
        let settings = settings.ok_or_else(|| ControlError::validation("Missing configuration"))?;
        let slot = self.timelines.entry(encoder_id).await;
        slot.lock().await.settings = Some(settings.clone());
        tracing::info!(
            encoder_id = %encoder_id,
            enabled = settings.enabled,
            "scte-35 settings configured"
        );
        Ok(settings)
    }

    pub async fn settings(&self, encoder_id: &str) -> Option<Scte35Settings> {
        let slot = self.timelines.get(encoder_id).await?;
        let settings = slot.lock().await.settings.clone();
        settings
    }
}
