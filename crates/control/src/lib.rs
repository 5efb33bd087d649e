//! Encoder control plane
//!
//! Tracks live encoders through their lifecycle, keeps versioned per-encoder
//! configuration, records SCTE-35 markers, orchestrates server-side ad
//! insertion, aggregates reported telemetry, and serves all of it over HTTP.

pub mod ads;
pub mod clock;
pub mod control;
pub mod engine;
pub mod error;
pub mod ids;
pub mod keyed;
pub mod lenient;
pub mod lifecycle;
pub mod markers;
pub mod server;
pub mod status;
pub mod storage;
pub mod store;

pub use ads::{
    AdBreak, AdBreakRequest, AdBreakStatus, AdDecisionError, AdDecisionServer, AdOrchestrator,
    AdStatus, HttpAdDecisionServer, SsaiSettings, StaticAdDecisionServer, TrackingEvent,
    TrackingKind, TrackingReport,
};
pub use control::{Components, ControlPlane, DaemonError, StartedEncoder};
pub use encoder_control_config as config;
pub use encoder_control_config::Config;
pub use engine::{
    BringUpProgress, BringUpStep, EncodingEngine, EngineError, EngineSpec, ProgressReporter,
    SimulatedEngine,
};
pub use error::{ControlError, ControlResult};
pub use ids::{IdGenerator, IdKind, MonotonicIdGenerator, SequentialIdGenerator};
pub use lifecycle::{
    EncoderInstance, EncoderLifecycle, EncoderState, LifecycleTimeouts, StopOutcome,
};
pub use markers::{
    MarkerInsert, MarkerRemoval, MarkerStatus, MarkerTimeline, Scte35Marker, Scte35Settings,
};
pub use server::{create_router, run_server, ServerError};
pub use status::{EncoderStatus, StatusAggregator};
pub use storage::{ConfigBackend, JsonDirBackend, MemoryBackend, StorageError};
pub use store::{ConfigSections, ConfigUpdate, Configuration, ConfigurationStore};
