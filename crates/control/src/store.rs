//! Versioned configuration documents, one per encoder
//!
//! `create` always writes version 1 and replaces whatever was there. `update`
//! shallow-merges the supplied top-level sections, bumps the version by one
//! and refreshes `lastUpdated` to a strictly later instant. Concurrent updates
//! for the same encoder are serialized by its slot lock, so no version is ever
//! skipped or reused. There is no stale-version check: last writer wins.

use crate::clock;
use crate::error::{ControlError, ControlResult};
use crate::keyed::KeyedSlots;
use crate::storage::ConfigBackend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

pub const MISSING_SECTIONS: &str =
    "Missing required configuration (input, encoding, or output)";
pub const CONFIG_NOT_FOUND: &str = "Configuration not found";

/// The current configuration document of one encoder
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    pub encoder_id: String,
    pub version: u64,
    pub input_config: Value,
    pub encoding_config: Value,
    pub output_config: Value,
    pub scte35_config: Option<Value>,
    pub ssai_config: Option<Value>,
    pub last_updated: DateTime<Utc>,
}

/// Sections supplied on create (and on encoder start)
///
/// A JSON `null` counts as absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSections {
    #[serde(default)]
    pub input_config: Option<Value>,
    #[serde(default)]
    pub encoding_config: Option<Value>,
    #[serde(default)]
    pub output_config: Option<Value>,
    #[serde(default)]
    pub scte35_config: Option<Value>,
    #[serde(default)]
    pub ssai_config: Option<Value>,
}

impl ConfigSections {
    /// True when input, encoding and output are all present
    pub fn is_complete(&self) -> bool {
        self.input_config.is_some()
            && self.encoding_config.is_some()
            && self.output_config.is_some()
    }

    /// Fills absent sections from a stored document
    pub fn or_stored(mut self, stored: &Configuration) -> Self {
        self.input_config.get_or_insert_with(|| stored.input_config.clone());
        self.encoding_config
            .get_or_insert_with(|| stored.encoding_config.clone());
        self.output_config.get_or_insert_with(|| stored.output_config.clone());
        if self.scte35_config.is_none() {
            self.scte35_config = stored.scte35_config.clone();
        }
        if self.ssai_config.is_none() {
            self.ssai_config = stored.ssai_config.clone();
        }
        self
    }
}

/// Partial update. `None` means "not supplied"; `Some(Value::Null)` is an
/// explicit null, which clears an optional section.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    #[serde(default, deserialize_with = "supplied")]
    pub input_config: Option<Value>,
    #[serde(default, deserialize_with = "supplied")]
    pub encoding_config: Option<Value>,
    #[serde(default, deserialize_with = "supplied")]
    pub output_config: Option<Value>,
    #[serde(default, deserialize_with = "supplied")]
    pub scte35_config: Option<Value>,
    #[serde(default, deserialize_with = "supplied")]
    pub ssai_config: Option<Value>,
}

fn supplied<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

fn merge_required(target: &mut Value, update: Option<Value>, name: &str) -> ControlResult<()> {
    match update {
        None => Ok(()),
        Some(Value::Null) => Err(ControlError::validation(format!(
            "{} cannot be null",
            name
        ))),
        Some(value) => {
            *target = value;
            Ok(())
        }
    }
}

fn merge_optional(target: &mut Option<Value>, update: Option<Value>) {
    match update {
        None => {}
        Some(Value::Null) => *target = None,
        Some(value) => *target = Some(value),
    }
}

#[derive(Debug, Default)]
struct ConfigSlot {
    current: Option<Configuration>,
    history: VecDeque<Configuration>,
}

pub struct ConfigurationStore {
    docs: KeyedSlots<ConfigSlot>,
    backend: Arc<dyn ConfigBackend>,
    history_limit: usize,
}

impl ConfigurationStore {
    pub fn new(backend: Arc<dyn ConfigBackend>, history_limit: usize) -> Self {
        Self {
            docs: KeyedSlots::new(),
            backend,
            history_limit,
        }
    }

    /// Loads persisted documents; returns how many were restored
    pub async fn init(&self) -> ControlResult<usize> {
        let configs = self.backend.load_all()?;
        let count = configs.len();
        for config in configs {
            let slot = self.docs.entry(&config.encoder_id).await;
            slot.lock().await.current = Some(config);
        }
        tracing::info!(count, "configuration store initialised");
        Ok(count)
    }

    pub async fn get(&self, encoder_id: &str) -> ControlResult<Configuration> {
        let slot = self
            .docs
            .get(encoder_id)
            .await
            .ok_or_else(|| ControlError::not_found(CONFIG_NOT_FOUND))?;
        let guard = slot.lock().await;
        guard
            .current
            .clone()
            .ok_or_else(|| ControlError::not_found(CONFIG_NOT_FOUND))
    }

    pub async fn list(&self) -> Vec<Configuration> {
        let mut configs = Vec::new();
        for (_, slot) in self.docs.entries().await {
            if let Some(config) = slot.lock().await.current.clone() {
                configs.push(config);
            }
        }
        configs
    }

    /// Stores version 1, replacing any prior document and its history
    pub async fn create(
        &self,
        encoder_id: &str,
        sections: ConfigSections,
    ) -> ControlResult<Configuration> {
        let ConfigSections {
            input_config: Some(input_config),
            encoding_config: Some(encoding_config),
            output_config: Some(output_config),
            scte35_config,
            ssai_config,
        } = sections
        else {
            return Err(ControlError::validation(MISSING_SECTIONS));
        };

        let config = Configuration {
            encoder_id: encoder_id.to_string(),
            version: 1,
            input_config,
            encoding_config,
            output_config,
            scte35_config,
            ssai_config,
            last_updated: clock::now(),
        };

        let slot = self.docs.entry(encoder_id).await;
        let mut guard = slot.lock().await;
        self.backend.save(&config)?;
        guard.current = Some(config.clone());
        guard.history.clear();

        tracing::info!(encoder_id = %encoder_id, "configuration created");
        Ok(config)
    }

    pub async fn update(
        &self,
        encoder_id: &str,
        update: ConfigUpdate,
    ) -> ControlResult<Configuration> {
        let slot = self
            .docs
            .get(encoder_id)
            .await
            .ok_or_else(|| ControlError::not_found(CONFIG_NOT_FOUND))?;
        let mut guard = slot.lock().await;
        let previous = guard
            .current
            .clone()
            .ok_or_else(|| ControlError::not_found(CONFIG_NOT_FOUND))?;

        let mut next = previous.clone();
        merge_required(&mut next.input_config, update.input_config, "inputConfig")?;
        merge_required(&mut next.encoding_config, update.encoding_config, "encodingConfig")?;
        merge_required(&mut next.output_config, update.output_config, "outputConfig")?;
        merge_optional(&mut next.scte35_config, update.scte35_config);
        merge_optional(&mut next.ssai_config, update.ssai_config);
        next.version = previous.version + 1;
        next.last_updated = clock::now_after(previous.last_updated);

        self.backend.save(&next)?;
        guard.current = Some(next.clone());
        if self.history_limit > 0 {
            guard.history.push_back(previous);
            while guard.history.len() > self.history_limit {
                guard.history.pop_front();
            }
        }

        tracing::info!(encoder_id = %encoder_id, version = next.version, "configuration updated");
        Ok(next)
    }

    pub async fn delete(&self, encoder_id: &str) -> ControlResult<()> {
        let slot = self
            .docs
            .get(encoder_id)
            .await
            .ok_or_else(|| ControlError::not_found(CONFIG_NOT_FOUND))?;
        let mut guard = slot.lock().await;
        if guard.current.is_none() {
            return Err(ControlError::not_found(CONFIG_NOT_FOUND));
        }

        self.backend.remove(encoder_id)?;
        guard.current = None;
        guard.history.clear();

        tracing::info!(encoder_id = %encoder_id, "configuration deleted");
        Ok(())
    }

    /// Superseded versions, oldest first
    pub async fn history(&self, encoder_id: &str) -> ControlResult<Vec<Configuration>> {
        let slot = self
            .docs
            .get(encoder_id)
            .await
            .ok_or_else(|| ControlError::not_found(CONFIG_NOT_FOUND))?;
        let guard = slot.lock().await;
        if guard.current.is_none() {
            return Err(ControlError::not_found(CONFIG_NOT_FOUND));
        }
        Ok(guard.history.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{JsonDirBackend, MemoryBackend};
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn memory_store() -> ConfigurationStore {
        ConfigurationStore::new(Arc::new(MemoryBackend), 16)
    }

    fn full_sections() -> ConfigSections {
        ConfigSections {
            input_config: Some(json!({"type": "srt", "url": "srt://localhost:9999"})),
            encoding_config: Some(json!({"video": {"codec": "h264", "bitrate": "5000"}})),
            output_config: Some(json!({"hls": {"enabled": true, "segmentDuration": "6"}})),
            scte35_config: None,
            ssai_config: None,
        }
    }

    #[tokio::test]
    async fn test_create_starts_at_version_one() {
        let store = memory_store();
        let config = store.create("enc1", full_sections()).await.unwrap();
        assert_eq!(config.version, 1);
        assert_eq!(config.encoder_id, "enc1");
        assert_eq!(config.scte35_config, None);
        assert_eq!(store.get("enc1").await.unwrap(), config);
    }

    #[tokio::test]
    async fn test_create_rejects_missing_sections() {
        let store = memory_store();
        for missing in 0..3 {
            let mut sections = full_sections();
            match missing {
                0 => sections.input_config = None,
                1 => sections.encoding_config = None,
                _ => sections.output_config = None,
            }
            let err = store.create("enc1", sections).await.unwrap_err();
            assert!(matches!(err, ControlError::Validation(_)));
        }
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_overwrites_and_resets_version() {
        let store = memory_store();
        store.create("enc1", full_sections()).await.unwrap();
        store
            .update("enc1", ConfigUpdate::default())
            .await
            .unwrap();
        let again = store.create("enc1", full_sections()).await.unwrap();
        assert_eq!(again.version, 1);
        assert!(store.history("enc1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_merges_top_level_sections() {
        let store = memory_store();
        let created = store.create("enc1", full_sections()).await.unwrap();

        let update: ConfigUpdate =
            serde_json::from_value(json!({"encodingConfig": {"bitrate": "8000"}})).unwrap();
        let updated = store.update("enc1", update).await.unwrap();

        assert_eq!(updated.version, 2);
        assert_eq!(updated.encoding_config, json!({"bitrate": "8000"}));
        assert_eq!(updated.input_config, created.input_config);
        assert_eq!(updated.output_config, created.output_config);
        assert!(updated.last_updated > created.last_updated);
    }

    #[tokio::test]
    async fn test_update_null_handling() {
        let store = memory_store();
        let mut sections = full_sections();
        sections.ssai_config = Some(json!({"provider": "vast"}));
        store.create("enc1", sections).await.unwrap();

        let clear: ConfigUpdate = serde_json::from_value(json!({"ssaiConfig": null})).unwrap();
        let updated = store.update("enc1", clear).await.unwrap();
        assert_eq!(updated.ssai_config, None);

        let bad: ConfigUpdate = serde_json::from_value(json!({"inputConfig": null})).unwrap();
        let err = store.update("enc1", bad).await.unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
        // A rejected update leaves the version untouched
        assert_eq!(store.get("enc1").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_update_missing_document() {
        let store = memory_store();
        let err = store
            .update("ghost", ConfigUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::NotFound(ref m) if m == CONFIG_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_delete_then_get() {
        let store = memory_store();
        store.create("enc1", full_sections()).await.unwrap();
        store.delete("enc1").await.unwrap();

        assert!(matches!(
            store.get("enc1").await.unwrap_err(),
            ControlError::NotFound(_)
        ));
        assert!(matches!(
            store.delete("enc1").await.unwrap_err(),
            ControlError::NotFound(_)
        ));
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_updates_never_lose_a_version() {
        let store = Arc::new(memory_store());
        store.create("enc1", full_sections()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let update: ConfigUpdate =
                    serde_json::from_value(json!({"encodingConfig": {"bitrate": i}})).unwrap();
                store.update("enc1", update).await.unwrap().version
            }));
        }

        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap());
        }
        versions.sort_unstable();
        assert_eq!(versions, (2..=21).collect::<Vec<u64>>());
        assert_eq!(store.get("enc1").await.unwrap().version, 21);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let store = ConfigurationStore::new(Arc::new(MemoryBackend), 3);
        store.create("enc1", full_sections()).await.unwrap();
        for _ in 0..5 {
            store
                .update("enc1", ConfigUpdate::default())
                .await
                .unwrap();
        }
        let history = store.history("enc1").await.unwrap();
        let versions: Vec<u64> = history.iter().map(|c| c.version).collect();
        assert_eq!(versions, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_init_restores_persisted_documents() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(JsonDirBackend::new(temp.path()));

        let store = ConfigurationStore::new(backend.clone(), 16);
        store.create("enc1", full_sections()).await.unwrap();
        store.create("enc2", full_sections()).await.unwrap();
        store
            .update("enc2", ConfigUpdate::default())
            .await
            .unwrap();
        store.delete("enc1").await.unwrap();

        let restored = ConfigurationStore::new(backend, 16);
        assert_eq!(restored.init().await.unwrap(), 1);
        assert_eq!(restored.get("enc2").await.unwrap().version, 2);
        assert!(restored.get("enc1").await.is_err());
    }

    #[test]
    fn test_sections_fill_from_stored() {
        let stored = Configuration {
            encoder_id: "enc1".into(),
            version: 3,
            input_config: json!({"type": "rtmp"}),
            encoding_config: json!({"video": {}}),
            output_config: json!({"srt": {}}),
            scte35_config: Some(json!({"enabled": true})),
            ssai_config: None,
            last_updated: Utc::now(),
        };
        let supplied = ConfigSections {
            input_config: Some(json!({"type": "srt"})),
            ..Default::default()
        };
        let merged = supplied.or_stored(&stored);
        assert!(merged.is_complete());
        assert_eq!(merged.input_config, Some(json!({"type": "srt"})));
        assert_eq!(merged.output_config, Some(json!({"srt": {}})));
        assert_eq!(merged.scte35_config, Some(json!({"enabled": true})));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(25))]

        #[test]
        fn prop_each_update_bumps_version_by_one(updates in 0usize..30) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = memory_store();
                let mut last = store.create("enc1", full_sections()).await.unwrap();
                for _ in 0..updates {
                    let next = store.update("enc1", ConfigUpdate::default()).await.unwrap();
                    assert_eq!(next.version, last.version + 1);
                    assert!(next.last_updated > last.last_updated);
                    last = next;
                }
                assert_eq!(last.version, updates as u64 + 1);
            });
        }
    }
}
