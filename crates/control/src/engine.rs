//! Encoding engine interface
//!
//! The control plane never touches media itself. Bring-up and tear-down are
//! delegated to an [`EncodingEngine`]; the engine reports progress through a
//! [`ProgressReporter`] and must stop promptly when the cancellation token
//! fires. [`SimulatedEngine`] walks the bring-up steps with configurable
//! delays and is what the daemon runs when no real engine is wired in.

use async_trait::async_trait;
use encoder_control_config::EngineConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("input unavailable: {0}")]
    Input(String),

    #[error("output negotiation failed: {0}")]
    Output(String),

    #[error("pipeline failure: {0}")]
    Pipeline(String),

    #[error("cancelled")]
    Cancelled,
}

/// Ordered steps of an encoder bring-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BringUpStep {
    AcquireInput,
    NegotiateOutputs,
    WarmUpPipeline,
}

impl BringUpStep {
    pub const ALL: [BringUpStep; 3] = [
        BringUpStep::AcquireInput,
        BringUpStep::NegotiateOutputs,
        BringUpStep::WarmUpPipeline,
    ];

    /// Percentage reached once this step has finished
    pub fn completed_percent(&self) -> u8 {
        match self {
            BringUpStep::AcquireInput => 33,
            BringUpStep::NegotiateOutputs => 66,
            BringUpStep::WarmUpPipeline => 100,
        }
    }
}

/// Bring-up progress as observed by status queries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BringUpProgress {
    pub step: Option<BringUpStep>,
    pub percent: u8,
}

/// Engine-side handle for publishing bring-up progress
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: watch::Sender<BringUpProgress>,
}

impl ProgressReporter {
    /// A reporter together with the receiver the lifecycle reads from
    pub fn channel() -> (Self, watch::Receiver<BringUpProgress>) {
        let (tx, rx) = watch::channel(BringUpProgress::default());
        (Self { tx }, rx)
    }

    /// Marks `step` as the one currently executing
    pub fn begin(&self, step: BringUpStep) {
        self.tx.send_modify(|p| p.step = Some(step));
    }

    /// Marks `step` as finished
    pub fn finish(&self, step: BringUpStep) {
        self.tx.send_modify(|p| {
            p.step = Some(step);
            p.percent = step.completed_percent();
        });
    }
}

/// The configuration sections an engine needs to bring an encoder up
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSpec {
    pub input: Value,
    pub encoding: Value,
    pub output: Value,
}

#[async_trait]
pub trait EncodingEngine: Send + Sync {
    /// Acquire input, negotiate outputs and warm up the pipeline
    async fn bring_up(
        &self,
        encoder_id: &str,
        spec: &EngineSpec,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError>;

    /// Release everything `bring_up` acquired
    async fn tear_down(&self, encoder_id: &str) -> Result<(), EngineError>;
}

/// Engine stand-in that only waits out the configured step delays
#[derive(Debug, Clone, Default)]
pub struct SimulatedEngine {
    config: EngineConfig,
}

impl SimulatedEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    fn step_delay(&self, step: BringUpStep) -> Duration {
        let ms = match step {
            BringUpStep::AcquireInput => self.config.acquire_input_ms,
            BringUpStep::NegotiateOutputs => self.config.negotiate_outputs_ms,
            BringUpStep::WarmUpPipeline => self.config.warm_up_ms,
        };
        Duration::from_millis(ms)
    }
}

#[async_trait]
impl EncodingEngine for SimulatedEngine {
    async fn bring_up(
        &self,
        encoder_id: &str,
        _spec: &EngineSpec,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        for step in BringUpStep::ALL {
            progress.begin(step);
            tracing::debug!(encoder_id = %encoder_id, ?step, "bring-up step");
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(self.step_delay(step)) => {}
            }
            progress.finish(step);
        }
        Ok(())
    }

    async fn tear_down(&self, encoder_id: &str) -> Result<(), EngineError> {
        tracing::debug!(encoder_id = %encoder_id, "tear-down");
        tokio::time::sleep(Duration::from_millis(self.config.tear_down_ms)).await;
        Ok(())
    }
}
