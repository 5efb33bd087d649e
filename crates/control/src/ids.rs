//! Identifier generation for encoders, markers, and ad breaks
//!
//! Ids carry a kind prefix, a millisecond timestamp, a process-wide counter
//! and a short random suffix. The counter alone guarantees uniqueness within
//! a process; the timestamp and suffix keep ids distinct across restarts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// What an identifier names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    Encoder,
    Marker,
    AdBreak,
}

impl IdKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            IdKind::Encoder => "encoder_",
            IdKind::Marker => "scte35_",
            IdKind::AdBreak => "adbreak_",
        }
    }
}

/// Source of fresh identifiers
pub trait IdGenerator: Send + Sync {
    fn next_id(&self, kind: IdKind) -> String;
}

/// Default generator: `<prefix><millis>_<counter>_<random>`
#[derive(Debug, Default)]
pub struct MonotonicIdGenerator {
    counter: AtomicU64,
}

impl MonotonicIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for MonotonicIdGenerator {
    fn next_id(&self, kind: IdKind) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let random = Uuid::new_v4().simple().to_string();
        format!("{}{}_{}_{}", kind.prefix(), millis, seq, &random[..8])
    }
}

/// Deterministic generator for tests: `<prefix>1`, `<prefix>2`, ...
///
/// The sequence is shared across kinds so every id in a run is distinct.
#[derive(Debug, Default)]
pub struct SequentialIdGenerator {
    counter: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self, kind: IdKind) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}{}", kind.prefix(), n)
    }
}
