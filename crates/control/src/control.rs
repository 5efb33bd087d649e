//! Control plane assembly
//!
//! Builds every component from [`Config`], restores persisted configuration on
//! `init`, and carries the few operations that span more than one component.

use crate::ads::{
    AdBreak, AdBreakRequest, AdDecisionServer, AdOrchestrator, HttpAdDecisionServer,
    StaticAdDecisionServer,
};
use crate::engine::{EncodingEngine, SimulatedEngine};
use crate::error::{ControlError, ControlResult};
use crate::ids::{IdGenerator, MonotonicIdGenerator};
use crate::lifecycle::{EncoderInstance, EncoderLifecycle, LifecycleTimeouts, StopOutcome};
use crate::markers::MarkerTimeline;
use crate::server::ServerError;
use crate::status::{EncoderStatus, StatusAggregator};
use crate::storage::{ConfigBackend, JsonDirBackend, MemoryBackend};
use crate::store::{ConfigSections, ConfigurationStore};
use encoder_control_config::{Config, ConfigError, DecisionServerKind};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error type for daemon startup and serving
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Initialisation failed: {0}")]
    Init(#[from] ControlError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Pluggable seams of the control plane
pub struct Components {
    pub backend: Arc<dyn ConfigBackend>,
    pub engine: Arc<dyn EncodingEngine>,
    pub ids: Arc<dyn IdGenerator>,
    pub decision_server: Arc<dyn AdDecisionServer>,
}

impl Components {
    /// The implementations selected by `config`
    pub fn from_config(config: &Config) -> Self {
        let backend: Arc<dyn ConfigBackend> = match &config.storage.state_dir {
            Some(dir) => Arc::new(JsonDirBackend::new(dir)),
            None => Arc::new(MemoryBackend),
        };
        let decision_server: Arc<dyn AdDecisionServer> = match config.ssai.decision_server {
            DecisionServerKind::Static => Arc::new(StaticAdDecisionServer),
            DecisionServerKind::Http => Arc::new(HttpAdDecisionServer::new(Duration::from_secs(
                config.ssai.decision_timeout_secs,
            ))),
        };

        Self {
            backend,
            engine: Arc::new(SimulatedEngine::new(config.engine.clone())),
            ids: Arc::new(MonotonicIdGenerator::new()),
            decision_server,
        }
    }
}

/// Result of a start request
#[derive(Debug, Clone)]
pub struct StartedEncoder {
    pub instance: EncoderInstance,
    /// The sections the encoder was started with, after filling from storage
    pub config: ConfigSections,
}

pub struct ControlPlane {
    pub config: Config,
    pub store: ConfigurationStore,
    pub lifecycle: EncoderLifecycle,
    pub markers: MarkerTimeline,
    pub ads: AdOrchestrator,
    pub status: StatusAggregator,
}

impl ControlPlane {
    pub fn new(config: Config) -> Self {
        let components = Components::from_config(&config);
        Self::with_components(config, components)
    }

    pub fn with_components(config: Config, components: Components) -> Self {
        let store = ConfigurationStore::new(components.backend, config.storage.history_limit);
        let lifecycle = EncoderLifecycle::new(
            components.engine,
            components.ids.clone(),
            LifecycleTimeouts::from(&config.lifecycle),
        );
        let markers = MarkerTimeline::new(components.ids.clone());
        let ads = AdOrchestrator::new(
            components.decision_server,
            components.ids,
            config.ssai.require_running,
            Duration::from_secs(config.ssai.decision_timeout_secs),
        );

        Self {
            config,
            store,
            lifecycle,
            markers,
            ads,
            status: StatusAggregator::new(),
        }
    }

    /// Restores persisted configuration documents
    pub async fn init(&self) -> Result<(), DaemonError> {
        let restored = self.store.init().await?;
        tracing::info!(
            restored,
            decision_server = ?self.config.ssai.decision_server,
            persistent = self.config.storage.state_dir.is_some(),
            "control plane initialised"
        );
        Ok(())
    }

    /// Cancels in-flight bring-ups
    pub async fn shutdown(&self) {
        tracing::info!("control plane shutting down");
        self.lifecycle.shutdown().await;
    }

    /// Starts an encoder, taking absent sections from its stored configuration
    ///
    /// The stored version is bound to the instance only when stored sections
    /// were actually used.
    pub async fn start_encoder(
        &self,
        encoder_id: Option<&str>,
        sections: ConfigSections,
    ) -> ControlResult<StartedEncoder> {
        let (sections, config_version) = match encoder_id {
            Some(id) if !sections.is_complete() => match self.store.get(id).await {
                Ok(stored) => (sections.or_stored(&stored), Some(stored.version)),
                Err(_) => (sections, None),
            },
            _ => (sections, None),
        };

        let instance = self
            .lifecycle
            .start(encoder_id, &sections, config_version)
            .await?;
        Ok(StartedEncoder {
            instance,
            config: sections,
        })
    }

    pub async fn stop_encoder(&self, encoder_id: &str) -> ControlResult<StopOutcome> {
        self.lifecycle.stop(encoder_id).await
    }

    /// Reported telemetry together with the lifecycle view, if the encoder is known
    pub async fn encoder_status(
        &self,
        encoder_id: &str,
    ) -> (EncoderStatus, Option<EncoderInstance>) {
        let status = self.status.get(encoder_id).await;
        let instance = self.lifecycle.get(encoder_id).await.ok();
        (status, instance)
    }

    /// Ad insertion gated on the encoder's current lifecycle state
    pub async fn insert_ad(
        &self,
        encoder_id: &str,
        request: Option<AdBreakRequest>,
    ) -> ControlResult<AdBreak> {
        let state = self.lifecycle.state(encoder_id).await;
        self.ads.insert_ad(encoder_id, state, request).await
    }
}
