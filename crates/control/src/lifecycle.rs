//! Encoder lifecycle state machine
//!
//! ```text
//! idle ──start──▶ starting ──ok──▶ running ──stop──▶ stopping ──ok──▶ idle
//!                    │  └──────────────stop──────────────▲  │
//!                    └──fail/timeout──▶ error ◀──fail/timeout┘
//!                                         └──reset──▶ idle
//! ```
//!
//! `start` and `stop` only flip the state and spawn the slow phase on the
//! encoding engine; callers poll `get` to observe completion. Each phase
//! carries the slot generation it was spawned under and applies its result
//! only if that generation is still current, so a stop that overtakes a
//! bring-up can never be undone by the bring-up finishing late.

use crate::clock;
use crate::engine::{
    BringUpProgress, EncodingEngine, EngineError, EngineSpec, ProgressReporter,
};
use crate::error::{ControlError, ControlResult};
use crate::ids::{IdGenerator, IdKind};
use crate::keyed::{KeyedSlots, Slot};
use crate::store::ConfigSections;
use chrono::{DateTime, Utc};
use encoder_control_config::LifecycleConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const MISSING_START_CONFIG: &str = "Missing required configuration";
pub const ENCODER_NOT_FOUND: &str = "Encoder not found";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Error,
}

impl std::fmt::Display for EncoderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncoderState::Idle => write!(f, "idle"),
            EncoderState::Starting => write!(f, "starting"),
            EncoderState::Running => write!(f, "running"),
            EncoderState::Stopping => write!(f, "stopping"),
            EncoderState::Error => write!(f, "error"),
        }
    }
}

impl EncoderState {
    /// States from which a new start is accepted
    pub fn can_start(&self) -> bool {
        matches!(self, EncoderState::Idle | EncoderState::Error)
    }
}

/// Point-in-time view of one encoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncoderInstance {
    pub id: String,
    pub state: EncoderState,
    /// Version of the stored configuration bound at start
    pub config_version: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub progress: BringUpProgress,
    pub last_error: Option<String>,
}

impl EncoderInstance {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: EncoderState::Idle,
            config_version: None,
            started_at: None,
            stopped_at: None,
            progress: BringUpProgress::default(),
            last_error: None,
        }
    }
}

/// Result of a stop request
#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    /// Nothing was running; the instance (if known) is returned unchanged
    NoOp(Option<EncoderInstance>),
    /// Tear-down has been started or is already in flight
    Stopping(EncoderInstance),
}

#[derive(Debug, Clone, Copy)]
pub struct LifecycleTimeouts {
    pub bring_up: Duration,
    pub tear_down: Duration,
}

impl From<&LifecycleConfig> for LifecycleTimeouts {
    fn from(config: &LifecycleConfig) -> Self {
        Self {
            bring_up: Duration::from_secs(config.bring_up_timeout_secs),
            tear_down: Duration::from_secs(config.tear_down_timeout_secs),
        }
    }
}

impl Default for LifecycleTimeouts {
    fn default() -> Self {
        Self::from(&LifecycleConfig::default())
    }
}

struct EncoderSlot {
    instance: EncoderInstance,
    generation: u64,
    cancel: Option<CancellationToken>,
    bring_up: Option<JoinHandle<()>>,
    progress: Option<watch::Receiver<BringUpProgress>>,
}

impl EncoderSlot {
    fn new(id: &str) -> Self {
        Self {
            instance: EncoderInstance::new(id),
            generation: 0,
            cancel: None,
            bring_up: None,
            progress: None,
        }
    }

    fn snapshot(&self) -> EncoderInstance {
        let mut instance = self.instance.clone();
        if let Some(rx) = &self.progress {
            instance.progress = rx.borrow().clone();
        }
        instance
    }

    /// Freezes the live progress into the instance and drops the receiver
    fn settle_progress(&mut self) {
        if let Some(rx) = self.progress.take() {
            self.instance.progress = rx.borrow().clone();
        }
    }

    fn fail(&mut self, message: String) {
        self.settle_progress();
        self.cancel = None;
        self.bring_up = None;
        self.instance.state = EncoderState::Error;
        self.instance.last_error = Some(message);
    }
}

pub struct EncoderLifecycle {
    slots: KeyedSlots<EncoderSlot>,
    engine: Arc<dyn EncodingEngine>,
    ids: Arc<dyn IdGenerator>,
    timeouts: LifecycleTimeouts,
}

impl EncoderLifecycle {
    pub fn new(
        engine: Arc<dyn EncodingEngine>,
        ids: Arc<dyn IdGenerator>,
        timeouts: LifecycleTimeouts,
    ) -> Self {
        Self {
            slots: KeyedSlots::new(),
            engine,
            ids,
            timeouts,
        }
    }

    /// Begins bringing an encoder up and returns immediately in `starting`
    ///
    /// Fails with a validation error (creating nothing) if input, encoding or
    /// output configuration is missing, and with a conflict if the encoder is
    /// already starting, running or stopping.
    pub async fn start(
        &self,
        encoder_id: Option<&str>,
        sections: &ConfigSections,
        config_version: Option<u64>,
    ) -> ControlResult<EncoderInstance> {
        let spec = match (
            &sections.input_config,
            &sections.encoding_config,
            &sections.output_config,
        ) {
            (Some(input), Some(encoding), Some(output)) => EngineSpec {
                input: input.clone(),
                encoding: encoding.clone(),
                output: output.clone(),
            },
            _ => return Err(ControlError::validation(MISSING_START_CONFIG)),
        };

        let id = match encoder_id {
            Some(id) => id.to_string(),
            None => self.ids.next_id(IdKind::Encoder),
        };

        let slot = self
            .slots
            .get_or_insert_with(&id, || EncoderSlot::new(&id))
            .await;
        let mut guard = slot.lock().await;

        let current = guard.instance.state;
        if !current.can_start() {
            return Err(ControlError::conflict(format!(
                "Encoder {} is already {}",
                id, current
            )));
        }

        guard.generation += 1;
        let generation = guard.generation;
        let token = CancellationToken::new();
        let (reporter, rx) = ProgressReporter::channel();

        guard.instance.state = EncoderState::Starting;
        guard.instance.config_version = config_version;
        guard.instance.started_at = None;
        guard.instance.last_error = None;
        guard.instance.progress = BringUpProgress::default();
        guard.progress = Some(rx);
        guard.cancel = Some(token.clone());

        let handle = tokio::spawn(run_bring_up(
            slot.clone(),
            generation,
            self.engine.clone(),
            id.clone(),
            spec,
            reporter,
            token,
            self.timeouts.bring_up,
        ));
        guard.bring_up = Some(handle);

        tracing::info!(encoder_id = %id, ?config_version, "encoder starting");
        Ok(guard.snapshot())
    }

    /// Stops an encoder; stopping something that is not running succeeds
    ///
    /// A stop during `starting` cancels the bring-up, and tear-down waits for
    /// the cancelled bring-up to unwind before releasing resources.
    pub async fn stop(&self, encoder_id: &str) -> ControlResult<StopOutcome> {
        let Some(slot) = self.slots.get(encoder_id).await else {
            tracing::debug!(encoder_id = %encoder_id, "stop for unknown encoder");
            return Ok(StopOutcome::NoOp(None));
        };
        let mut guard = slot.lock().await;

        match guard.instance.state {
            EncoderState::Idle | EncoderState::Error => {
                Ok(StopOutcome::NoOp(Some(guard.snapshot())))
            }
            EncoderState::Stopping => Ok(StopOutcome::Stopping(guard.snapshot())),
            EncoderState::Starting | EncoderState::Running => {
                if let Some(token) = guard.cancel.take() {
                    token.cancel();
                }
                let pending = guard.bring_up.take();
                guard.settle_progress();

                guard.generation += 1;
                let generation = guard.generation;
                guard.instance.state = EncoderState::Stopping;

                tokio::spawn(run_tear_down(
                    slot.clone(),
                    generation,
                    self.engine.clone(),
                    encoder_id.to_string(),
                    pending,
                    self.timeouts.tear_down,
                ));

                tracing::info!(encoder_id = %encoder_id, "encoder stopping");
                Ok(StopOutcome::Stopping(guard.snapshot()))
            }
        }
    }

    /// Clears an `error` state back to `idle`
    pub async fn reset(&self, encoder_id: &str) -> ControlResult<EncoderInstance> {
        let slot = self
            .slots
            .get(encoder_id)
            .await
            .ok_or_else(|| ControlError::not_found(ENCODER_NOT_FOUND))?;
        let mut guard = slot.lock().await;

        if guard.instance.state != EncoderState::Error {
            return Err(ControlError::conflict(format!(
                "Encoder {} is {}; only errored encoders can be reset",
                encoder_id, guard.instance.state
            )));
        }

        guard.generation += 1;
        guard.instance.state = EncoderState::Idle;
        guard.instance.last_error = None;
        tracing::info!(encoder_id = %encoder_id, "encoder reset");
        Ok(guard.snapshot())
    }

    pub async fn get(&self, encoder_id: &str) -> ControlResult<EncoderInstance> {
        let slot = self
            .slots
            .get(encoder_id)
            .await
            .ok_or_else(|| ControlError::not_found(ENCODER_NOT_FOUND))?;
        let guard = slot.lock().await;
        Ok(guard.snapshot())
    }

    /// Current state, `None` for encoders never started
    pub async fn state(&self, encoder_id: &str) -> Option<EncoderState> {
        self.get(encoder_id).await.ok().map(|i| i.state)
    }

    pub async fn list(&self) -> Vec<EncoderInstance> {
        let mut instances = Vec::new();
        for (_, slot) in self.slots.entries().await {
            instances.push(slot.lock().await.snapshot());
        }
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        instances
    }

    /// Cancels every in-flight bring-up
    pub async fn shutdown(&self) {
        for (id, slot) in self.slots.entries().await {
            let guard = slot.lock().await;
            if let Some(token) = &guard.cancel {
                tracing::info!(encoder_id = %id, "cancelling bring-up for shutdown");
                token.cancel();
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_bring_up(
    slot: Slot<EncoderSlot>,
    generation: u64,
    engine: Arc<dyn EncodingEngine>,
    encoder_id: String,
    spec: EngineSpec,
    reporter: ProgressReporter,
    token: CancellationToken,
    limit: Duration,
) {
    let outcome =
        tokio::time::timeout(limit, engine.bring_up(&encoder_id, &spec, &reporter, &token)).await;

    let mut guard = slot.lock().await;
    if guard.generation != generation || guard.instance.state != EncoderState::Starting {
        tracing::debug!(encoder_id = %encoder_id, "bring-up superseded");
        return;
    }

    match outcome {
        Ok(Ok(())) => {
            guard.settle_progress();
            guard.cancel = None;
            guard.bring_up = None;
            guard.instance.state = EncoderState::Running;
            guard.instance.started_at = Some(clock::now());
            tracing::info!(encoder_id = %encoder_id, "encoder running");
        }
        Ok(Err(EngineError::Cancelled)) => {
            tracing::warn!(encoder_id = %encoder_id, "bring-up cancelled");
            guard.fail("bring-up cancelled".to_string());
        }
        Ok(Err(e)) => {
            tracing::warn!(encoder_id = %encoder_id, error = %e, "bring-up failed");
            guard.fail(format!("bring-up failed: {}", e));
        }
        Err(_) => {
            token.cancel();
            tracing::warn!(encoder_id = %encoder_id, ?limit, "bring-up timed out");
            guard.fail(format!("bring-up timed out after {}s", limit.as_secs_f64()));
        }
    }
}

async fn run_tear_down(
    slot: Slot<EncoderSlot>,
    generation: u64,
    engine: Arc<dyn EncodingEngine>,
    encoder_id: String,
    pending_bring_up: Option<JoinHandle<()>>,
    limit: Duration,
) {
    let outcome = tokio::time::timeout(limit, async {
        if let Some(handle) = pending_bring_up {
            // The cancelled bring-up must release the engine before tear-down
            let _ = handle.await;
        }
        engine.tear_down(&encoder_id).await
    })
    .await;

    let mut guard = slot.lock().await;
    if guard.generation != generation || guard.instance.state != EncoderState::Stopping {
        tracing::debug!(encoder_id = %encoder_id, "tear-down superseded");
        return;
    }

    match outcome {
        Ok(Ok(())) => {
            guard.instance.state = EncoderState::Idle;
            guard.instance.stopped_at = Some(clock::now());
            tracing::info!(encoder_id = %encoder_id, "encoder stopped");
        }
        Ok(Err(e)) => {
            tracing::warn!(encoder_id = %encoder_id, error = %e, "tear-down failed");
            guard.fail(format!("tear-down failed: {}", e));
        }
        Err(_) => {
            tracing::warn!(encoder_id = %encoder_id, ?limit, "tear-down timed out");
            guard.fail(format!("tear-down timed out after {}s", limit.as_secs_f64()));
        }
    }
}
