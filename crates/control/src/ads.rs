//! Server-side ad insertion orchestration
//!
//! Ad breaks are scheduled per encoder, handed to an [`AdDecisionServer`]
//! and settle as `inserted` or `failed`. The decision call happens outside
//! the encoder's ledger lock so status queries never wait on the network;
//! while it is in flight the break counts as an active (`scheduled`) break.
//! The call runs on its own task under a deadline, so every break settles even
//! when the caller goes away. All reported counters are derived from the break
//! and tracking logs.

use crate::clock;
use crate::error::{ControlError, ControlResult};
use crate::ids::{IdGenerator, IdKind};
use crate::keyed::KeyedSlots;
use crate::lenient;
use crate::lifecycle::EncoderState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_AD_DURATION: u32 = 30;
pub const DEFAULT_AD_SERVER: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdBreakStatus {
    Scheduled,
    Inserted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdBreak {
    pub ad_break_id: String,
    pub encoder_id: String,
    /// Seconds
    pub duration: u32,
    pub ad_server: String,
    pub vast_url: String,
    pub status: AdBreakStatus,
    pub scheduled_at: DateTime<Utc>,
    pub inserted_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdBreakRequest {
    #[serde(default, deserialize_with = "lenient::opt_u32")]
    pub duration: Option<u32>,
    #[serde(default)]
    pub ad_server: Option<String>,
    #[serde(default)]
    pub vast_url: Option<String>,
}

/// Ad decision settings bound to one encoder
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SsaiSettings {
    /// Response format of the decision server, e.g. `vast` or `vmap`
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Decision timeout in seconds
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub timeout: Option<f64>,
    /// What to play when no ad fills, e.g. `slate`
    #[serde(default)]
    pub fallback: Option<String>,
    #[serde(default)]
    pub tracking: bool,
    #[serde(default)]
    pub beacons: Option<String>,
    #[serde(default)]
    pub dynamic: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingKind {
    Impression,
    Start,
    FirstQuartile,
    Midpoint,
    ThirdQuartile,
    Complete,
    Skip,
    Error,
    #[serde(other)]
    #[default]
    Other,
}

/// A tracking beacon as reported by the player or packager
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingReport {
    #[serde(default)]
    pub event: TrackingKind,
    #[serde(default)]
    pub ad_break_id: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// A recorded tracking beacon. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingEvent {
    pub event: TrackingKind,
    pub ad_break_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// Aggregate SSAI counters for one encoder
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdStatus {
    pub enabled: bool,
    pub active_ad_breaks: usize,
    pub total_ads_inserted: usize,
    /// Percentage of settled breaks that were filled
    pub ad_fill_rate: f64,
    /// Mean duration in seconds over inserted breaks
    pub average_duration: f64,
    pub last_ad_insertion: Option<DateTime<Utc>>,
    pub tracking_events: usize,
    pub impressions: usize,
    pub completions: usize,
}

#[derive(Debug, Error)]
pub enum AdDecisionError {
    #[error("no ad decision URL configured")]
    NoUrl,

    #[error("request failed: {0}")]
    Request(String),

    #[error("decision server timed out")]
    Timeout,

    #[error("decision server answered with status {0}")]
    Status(u16),

    #[error("no ad returned for the break")]
    NoFill,

    #[error("decision aborted: {0}")]
    Aborted(String),
}

/// External service that fills ad breaks
#[async_trait]
pub trait AdDecisionServer: Send + Sync {
    async fn decide(
        &self,
        encoder_id: &str,
        ad_break: &AdBreak,
        settings: Option<&SsaiSettings>,
    ) -> Result<(), AdDecisionError>;
}

/// Fills every break without contacting anything
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticAdDecisionServer;

#[async_trait]
impl AdDecisionServer for StaticAdDecisionServer {
    async fn decide(
        &self,
        _encoder_id: &str,
        _ad_break: &AdBreak,
        _settings: Option<&SsaiSettings>,
    ) -> Result<(), AdDecisionError> {
        Ok(())
    }
}

/// Requests a VAST document for each break over HTTP
///
/// The break's `vastUrl` wins over the encoder's configured `url`. A
/// response without any `<Ad>` element is treated as no fill.
#[derive(Debug, Clone)]
pub struct HttpAdDecisionServer {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl HttpAdDecisionServer {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            default_timeout,
        }
    }

    fn resolve_url<'a>(
        ad_break: &'a AdBreak,
        settings: Option<&'a SsaiSettings>,
    ) -> Option<&'a str> {
        if !ad_break.vast_url.is_empty() {
            return Some(&ad_break.vast_url);
        }
        settings
            .and_then(|s| s.url.as_deref())
            .filter(|url| !url.is_empty())
    }
}

/// True when a VAST body carries at least one `<Ad>` element
///
/// Namespace prefixes are ignored. Comments and CDATA never count, and a
/// document that stops parsing before any `<Ad>` is no fill.
pub fn vast_has_ad(body: &str) -> bool {
    let mut reader = Reader::from_str(body);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e) | Event::Empty(e)) if e.local_name().as_ref() == b"Ad" => {
                return true;
            }
            Ok(Event::Eof) => return false,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "unparseable VAST response");
                return false;
            }
        }
    }
}

#[async_trait]
impl AdDecisionServer for HttpAdDecisionServer {
    async fn decide(
        &self,
        encoder_id: &str,
        ad_break: &AdBreak,
        settings: Option<&SsaiSettings>,
    ) -> Result<(), AdDecisionError> {
        let url = Self::resolve_url(ad_break, settings).ok_or(AdDecisionError::NoUrl)?;
        let timeout = settings
            .and_then(|s| s.timeout)
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or(self.default_timeout);

        tracing::debug!(
            encoder_id = %encoder_id,
            url = %url,
            ?timeout,
            "requesting ad decision"
        );

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AdDecisionError::Timeout
                } else {
                    AdDecisionError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AdDecisionError::Status(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AdDecisionError::Request(e.to_string()))?;
        if vast_has_ad(&body) {
            Ok(())
        } else {
            Err(AdDecisionError::NoFill)
        }
    }
}

#[derive(Debug, Default)]
struct AdLedger {
    enabled: bool,
    settings: Option<SsaiSettings>,
    breaks: Vec<AdBreak>,
    tracking: Vec<TrackingEvent>,
}

impl AdLedger {
    /// Moves a scheduled break to its final state
    fn settle(
        &mut self,
        ad_break_id: &str,
        decision: Result<(), AdDecisionError>,
    ) -> ControlResult<AdBreak> {
        let Some(ad_break) = self
            .breaks
            .iter_mut()
            .find(|b| b.ad_break_id == ad_break_id)
        else {
            return Err(ControlError::Internal(format!(
                "ad break {} vanished from ledger",
                ad_break_id
            )));
        };

        match decision {
            Ok(()) => {
                ad_break.status = AdBreakStatus::Inserted;
                ad_break.inserted_at = Some(clock::now());
                tracing::info!(
                    encoder_id = %ad_break.encoder_id,
                    ad_break_id = %ad_break.ad_break_id,
                    "ad break inserted"
                );
                Ok(ad_break.clone())
            }
            Err(e) => {
                ad_break.status = AdBreakStatus::Failed;
                ad_break.error = Some(e.to_string());
                tracing::warn!(
                    encoder_id = %ad_break.encoder_id,
                    ad_break_id = %ad_break.ad_break_id,
                    error = %e,
                    "ad break failed"
                );
                Err(ControlError::AdDecision(format!(
                    "{}: {}",
                    ad_break.ad_break_id, e
                )))
            }
        }
    }

    fn status(&self) -> AdStatus {
        let mut active = 0;
        let mut inserted = 0;
        let mut failed = 0;
        let mut inserted_duration: u64 = 0;
        let mut last_insertion: Option<DateTime<Utc>> = None;

        for ad_break in &self.breaks {
            match ad_break.status {
                AdBreakStatus::Scheduled => active += 1,
                AdBreakStatus::Failed => failed += 1,
                AdBreakStatus::Inserted => {
                    inserted += 1;
                    inserted_duration += u64::from(ad_break.duration);
                    if ad_break.inserted_at > last_insertion {
                        last_insertion = ad_break.inserted_at;
                    }
                }
            }
        }

        let settled = inserted + failed;
        let ad_fill_rate = if settled == 0 {
            0.0
        } else {
            inserted as f64 / settled as f64 * 100.0
        };
        let average_duration = if inserted == 0 {
            0.0
        } else {
            inserted_duration as f64 / inserted as f64
        };

        let count = |kind: TrackingKind| self.tracking.iter().filter(|e| e.event == kind).count();

        AdStatus {
            enabled: self.enabled,
            active_ad_breaks: active,
            total_ads_inserted: inserted,
            ad_fill_rate,
            average_duration,
            last_ad_insertion: last_insertion,
            tracking_events: self.tracking.len(),
            impressions: count(TrackingKind::Impression),
            completions: count(TrackingKind::Complete),
        }
    }
}

pub struct AdOrchestrator {
    ledgers: KeyedSlots<AdLedger>,
    decision_server: Arc<dyn AdDecisionServer>,
    ids: Arc<dyn IdGenerator>,
    require_running: bool,
    /// Upper bound on one decision, whatever the server implementation
    decision_timeout: Duration,
}

impl AdOrchestrator {
    pub fn new(
        decision_server: Arc<dyn AdDecisionServer>,
        ids: Arc<dyn IdGenerator>,
        require_running: bool,
        decision_timeout: Duration,
    ) -> Self {
        Self {
            ledgers: KeyedSlots::new(),
            decision_server,
            ids,
            require_running,
            decision_timeout,
        }
    }

    /// Binds decision settings to the encoder and enables SSAI for it
    pub async fn configure(
        &self,
        encoder_id: &str,
        settings: Option<SsaiSettings>,
    ) -> ControlResult<SsaiSettings> {
        let settings =
            settings.ok_or_else(|| ControlError::validation("Missing ad configuration"))?;
        let slot = self.ledgers.entry(encoder_id).await;
        let mut ledger = slot.lock().await;
        ledger.settings = Some(settings.clone());
        ledger.enabled = true;
        tracing::info!(encoder_id = %encoder_id, provider = ?settings.provider, "ssai configured");
        Ok(settings)
    }

    /// Schedules an ad break and asks the decision server to fill it
    ///
    /// `encoder_state` is the lifecycle state of the encoder at request time.
    pub async fn insert_ad(
        &self,
        encoder_id: &str,
        encoder_state: Option<EncoderState>,
        request: Option<AdBreakRequest>,
    ) -> ControlResult<AdBreak> {
        let request =
            request.ok_or_else(|| ControlError::validation("Missing ad break configuration"))?;

        if self.require_running && encoder_state != Some(EncoderState::Running) {
            return Err(ControlError::conflict(format!(
                "Encoder {} is not running",
                encoder_id
            )));
        }

        let scheduled = AdBreak {
            ad_break_id: self.ids.next_id(IdKind::AdBreak),
            encoder_id: encoder_id.to_string(),
            duration: request.duration.unwrap_or(DEFAULT_AD_DURATION),
            ad_server: request
                .ad_server
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_AD_SERVER.to_string()),
            vast_url: request.vast_url.unwrap_or_default(),
            status: AdBreakStatus::Scheduled,
            scheduled_at: clock::now(),
            inserted_at: None,
            error: None,
        };

        let slot = self.ledgers.entry(encoder_id).await;
        let settings = {
            let mut ledger = slot.lock().await;
            ledger.breaks.push(scheduled.clone());
            ledger.settings.clone()
        };
        tracing::info!(
            encoder_id = %encoder_id,
            ad_break_id = %scheduled.ad_break_id,
            duration = scheduled.duration,
            "ad break scheduled"
        );

        let server = self.decision_server.clone();
        let limit = self.decision_timeout;
        let settlement = tokio::spawn(async move {
            let request = scheduled.clone();
            let mut decide = tokio::spawn(async move {
                server
                    .decide(&request.encoder_id, &request, settings.as_ref())
                    .await
            });
            let decision = match tokio::time::timeout(limit, &mut decide).await {
                Ok(Ok(decision)) => decision,
                Ok(Err(e)) => Err(AdDecisionError::Aborted(e.to_string())),
                Err(_) => {
                    decide.abort();
                    Err(AdDecisionError::Timeout)
                }
            };
            let mut ledger = slot.lock().await;
            ledger.settle(&scheduled.ad_break_id, decision)
        });

        match settlement.await {
            Ok(result) => result,
            Err(e) => Err(ControlError::Internal(format!(
                "ad break settlement failed: {}",
                e
            ))),
        }
    }

    pub async fn status(&self, encoder_id: &str) -> AdStatus {
        let slot = self.ledgers.entry(encoder_id).await;
        let status = slot.lock().await.status();
        status
    }

    pub async fn update_tracking(
        &self,
        encoder_id: &str,
        report: Option<TrackingReport>,
    ) -> ControlResult<TrackingEvent> {
        let report = report.ok_or_else(|| ControlError::validation("Missing tracking data"))?;
        let event = TrackingEvent {
            event: report.event,
            ad_break_id: report.ad_break_id,
            recorded_at: clock::now(),
            payload: report.payload,
        };

        let slot = self.ledgers.entry(encoder_id).await;
        slot.lock().await.tracking.push(event.clone());
        tracing::debug!(encoder_id = %encoder_id, event = ?event.event, "tracking event recorded");
        Ok(event)
    }

    pub async fn ad_breaks(&self, encoder_id: &str) -> Vec<AdBreak> {
        match self.ledgers.get(encoder_id).await {
            Some(slot) => slot.lock().await.breaks.clone(),
            None => Vec::new(),
        }
    }

    pub async fn settings(&self, encoder_id: &str) -> Option<SsaiSettings> {
        let slot = self.ledgers.get(encoder_id).await?;
        let settings = slot.lock().await.settings.clone();
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SequentialIdGenerator;
    use serde_json::json;

    /// Fails every break whose ad server is named "broken"
    struct SelectiveAdServer;

    #[async_trait]
    impl AdDecisionServer for SelectiveAdServer {
        async fn decide(
            &self,
            _encoder_id: &str,
            ad_break: &AdBreak,
            _settings: Option<&SsaiSettings>,
        ) -> Result<(), AdDecisionError> {
            if ad_break.ad_server == "broken" {
                Err(AdDecisionError::Status(503))
            } else {
                Ok(())
            }
        }
    }

    /// Never answers
    struct SilentAdServer;

    #[async_trait]
    impl AdDecisionServer for SilentAdServer {
        async fn decide(
            &self,
            _encoder_id: &str,
            _ad_break: &AdBreak,
            _settings: Option<&SsaiSettings>,
        ) -> Result<(), AdDecisionError> {
            std::future::pending().await
        }
    }

    /// Panics mid-decision
    struct FaultyAdServer;

    #[async_trait]
    impl AdDecisionServer for FaultyAdServer {
        async fn decide(
            &self,
            _encoder_id: &str,
            _ad_break: &AdBreak,
            _settings: Option<&SsaiSettings>,
        ) -> Result<(), AdDecisionError> {
            panic!("decision server fault")
        }
    }

    fn orchestrator_with(
        server: Arc<dyn AdDecisionServer>,
        decision_timeout: Duration,
    ) -> AdOrchestrator {
        AdOrchestrator::new(
            server,
            Arc::new(SequentialIdGenerator::new()),
            true,
            decision_timeout,
        )
    }

    fn orchestrator(require_running: bool) -> AdOrchestrator {
        AdOrchestrator::new(
            Arc::new(SelectiveAdServer),
            Arc::new(SequentialIdGenerator::new()),
            require_running,
            Duration::from_secs(5),
        )
    }

    fn ad_break(vast_url: &str) -> AdBreak {
        AdBreak {
            ad_break_id: "adbreak_1".into(),
            encoder_id: "enc1".into(),
            duration: 30,
            ad_server: "default".into(),
            vast_url: vast_url.into(),
            status: AdBreakStatus::Scheduled,
            scheduled_at: Utc::now(),
            inserted_at: None,
            error: None,
        }
    }

    /// Serves canned VAST responses on an ephemeral local port
    async fn vast_server() -> String {
        use axum::http::StatusCode;
        use axum::routing::get;

        let app = axum::Router::new()
            .route(
                "/filled",
                get(|| async { r#"<VAST version="3.0"><Ad id="1"><InLine/></Ad></VAST>"# }),
            )
            .route("/empty", get(|| async { r#"<VAST version="3.0"/>"# }))
            .route(
                "/unavailable",
                get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
            )
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "<VAST/>"
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    const RUNNING: Option<EncoderState> = Some(EncoderState::Running);

    #[tokio::test]
    async fn test_insert_applies_defaults() {
        let ads = orchestrator(true);
        let ad_break = ads
            .insert_ad("enc1", RUNNING, Some(AdBreakRequest::default()))
            .await
            .unwrap();

        assert_eq!(ad_break.duration, 30);
        assert_eq!(ad_break.ad_server, "default");
        assert_eq!(ad_break.vast_url, "");
        assert_eq!(ad_break.status, AdBreakStatus::Inserted);
        assert!(ad_break.inserted_at.is_some());
    }

    #[tokio::test]
    async fn test_insert_requires_request() {
        let ads = orchestrator(true);
        let err = ads.insert_ad("enc1", RUNNING, None).await.unwrap_err();
        assert!(
            matches!(err, ControlError::Validation(ref m) if m == "Missing ad break configuration")
        );
    }

    #[tokio::test]
    async fn test_insert_gated_on_running() {
        let ads = orchestrator(true);
        for state in [
            None,
            Some(EncoderState::Idle),
            Some(EncoderState::Starting),
            Some(EncoderState::Stopping),
            Some(EncoderState::Error),
        ] {
            let err = ads
                .insert_ad("enc1", state, Some(AdBreakRequest::default()))
                .await
                .unwrap_err();
            assert!(matches!(err, ControlError::Conflict(_)));
        }
        assert!(ads.ad_breaks("enc1").await.is_empty());

        let ungated = orchestrator(false);
        assert!(ungated
            .insert_ad("enc1", None, Some(AdBreakRequest::default()))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_status_after_successful_inserts() {
        let ads = orchestrator(true);
        for duration in [20, 30, 40] {
            ads.insert_ad(
                "enc1",
                RUNNING,
                Some(AdBreakRequest {
                    duration: Some(duration),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        }

        let status = ads.status("enc1").await;
        assert_eq!(status.active_ad_breaks, 0);
        assert_eq!(status.total_ads_inserted, 3);
        assert_eq!(status.ad_fill_rate, 100.0);
        assert_eq!(status.average_duration, 30.0);
        assert!(status.last_ad_insertion.is_some());
        assert!(!status.enabled);
    }

    #[tokio::test]
    async fn test_failed_decision_is_surfaced_and_counted() {
        let ads = orchestrator(true);
        ads.insert_ad("enc1", RUNNING, Some(AdBreakRequest::default()))
            .await
            .unwrap();
        let err = ads
            .insert_ad(
                "enc1",
                RUNNING,
                Some(AdBreakRequest {
                    ad_server: Some("broken".into()),
                    ..Default::default()
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::AdDecision(_)));

        let breaks = ads.ad_breaks("enc1").await;
        assert_eq!(breaks.len(), 2);
        assert_eq!(breaks[1].status, AdBreakStatus::Failed);
        assert!(breaks[1].error.as_deref().unwrap().contains("503"));

        let status = ads.status("enc1").await;
        assert_eq!(status.total_ads_inserted, 1);
        assert_eq!(status.ad_fill_rate, 50.0);
    }

    #[tokio::test]
    async fn test_empty_status() {
        let ads = orchestrator(true);
        let status = ads.status("enc1").await;
        assert!(!status.enabled);
        assert_eq!(status.active_ad_breaks, 0);
        assert_eq!(status.total_ads_inserted, 0);
        assert_eq!(status.ad_fill_rate, 0.0);
        assert_eq!(status.average_duration, 0.0);
        assert!(status.last_ad_insertion.is_none());
    }

    #[tokio::test]
    async fn test_configure_enables() {
        let ads = orchestrator(true);
        assert!(matches!(
            ads.configure("enc1", None).await.unwrap_err(),
            ControlError::Validation(_)
        ));

        let settings: SsaiSettings = serde_json::from_value(json!({
            "enabled": true,
            "provider": "vast",
            "url": "https://ads.example.com/vast",
            "timeout": "10",
            "fallback": "slate",
            "tracking": true,
            "beacons": "all",
            "dynamic": false
        }))
        .unwrap();
        ads.configure("enc1", Some(settings)).await.unwrap();

        assert!(ads.status("enc1").await.enabled);
        let stored = ads.settings("enc1").await.unwrap();
        assert_eq!(stored.timeout, Some(10.0));
        assert_eq!(stored.fallback.as_deref(), Some("slate"));
    }

    #[tokio::test]
    async fn test_tracking_feeds_counters() {
        let ads = orchestrator(true);
        assert!(matches!(
            ads.update_tracking("enc1", None).await.unwrap_err(),
            ControlError::Validation(_)
        ));

        for report in [
            json!({"event": "impression", "adBreakId": "adbreak_1"}),
            json!({"event": "complete", "adBreakId": "adbreak_1", "viewer": "abc"}),
            json!({"event": "beacon_from_the_future"}),
            json!({"clicks": 3}),
        ] {
            let report: TrackingReport = serde_json::from_value(report).unwrap();
            ads.update_tracking("enc1", Some(report)).await.unwrap();
        }

        let status = ads.status("enc1").await;
        assert_eq!(status.tracking_events, 4);
        assert_eq!(status.impressions, 1);
        assert_eq!(status.completions, 1);
    }

    #[tokio::test]
    async fn test_tracking_event_keeps_payload() {
        let ads = orchestrator(true);
        let report: TrackingReport =
            serde_json::from_value(json!({"event": "midpoint", "position": 15})).unwrap();
        let event = ads.update_tracking("enc1", Some(report)).await.unwrap();

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "midpoint");
        assert_eq!(value["position"], 15);
        assert!(value["recordedAt"].is_string());
    }

    #[tokio::test]
    async fn test_hung_decision_times_out() {
        let ads = orchestrator_with(Arc::new(SilentAdServer), Duration::from_millis(50));
        let err = ads
            .insert_ad("enc1", RUNNING, Some(AdBreakRequest::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::AdDecision(ref m) if m.contains("timed out")));

        let status = ads.status("enc1").await;
        assert_eq!(status.active_ad_breaks, 0);
        assert_eq!(ads.ad_breaks("enc1").await[0].status, AdBreakStatus::Failed);
    }

    #[tokio::test]
    async fn test_abandoned_request_still_settles() {
        let ads = Arc::new(orchestrator_with(
            Arc::new(SilentAdServer),
            Duration::from_millis(100),
        ));

        let request = {
            let ads = ads.clone();
            tokio::spawn(async move {
                ads.insert_ad("enc1", RUNNING, Some(AdBreakRequest::default()))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        request.abort();
        assert_eq!(ads.status("enc1").await.active_ad_breaks, 1);

        for _ in 0..100 {
            if ads.status("enc1").await.active_ad_breaks == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let breaks = ads.ad_breaks("enc1").await;
        assert_eq!(breaks.len(), 1);
        assert_eq!(breaks[0].status, AdBreakStatus::Failed);
        assert!(breaks[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_panicking_decision_fails_break() {
        let ads = orchestrator_with(Arc::new(FaultyAdServer), Duration::from_secs(5));
        let err = ads
            .insert_ad("enc1", RUNNING, Some(AdBreakRequest::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::AdDecision(_)));
        assert_eq!(ads.ad_breaks("enc1").await[0].status, AdBreakStatus::Failed);
    }

    #[test]
    fn test_vast_has_ad() {
        assert!(vast_has_ad(r#"<VAST version="3.0"><Ad id="1"><InLine/></Ad></VAST>"#));
        assert!(vast_has_ad("<VAST><Ad>\n</Ad></VAST>"));
        assert!(vast_has_ad(r#"<VAST><Ad id="1"/></VAST>"#));
        assert!(vast_has_ad(
            r#"<vast:VAST><vast:Ad id="1"><vast:InLine/></vast:Ad></vast:VAST>"#
        ));
        assert!(!vast_has_ad(r#"<VAST version="3.0"/>"#));
        assert!(!vast_has_ad("<VAST><AdSystem>x</AdSystem></VAST>"));
        assert!(!vast_has_ad(
            r#"<VAST version="3.0"><!-- <Ad id="1"> removed --></VAST>"#
        ));
        assert!(!vast_has_ad(
            r#"<VAST><Extensions><![CDATA[<Ad id="1">]]></Extensions></VAST>"#
        ));
        assert!(!vast_has_ad(""));
    }

    #[test]
    fn test_http_url_resolution() {
        let mut ad_break = ad_break("");
        let settings = SsaiSettings {
            url: Some("https://ads.example.com/vast".into()),
            ..Default::default()
        };

        assert_eq!(HttpAdDecisionServer::resolve_url(&ad_break, None), None);
        assert_eq!(
            HttpAdDecisionServer::resolve_url(&ad_break, Some(&settings)),
            Some("https://ads.example.com/vast")
        );
        ad_break.vast_url = "https://other.example.com/break.xml".into();
        assert_eq!(
            HttpAdDecisionServer::resolve_url(&ad_break, Some(&settings)),
            Some("https://other.example.com/break.xml")
        );
    }

    #[tokio::test]
    async fn test_http_server_without_url_fails() {
        let server = HttpAdDecisionServer::new(Duration::from_secs(1));
        let result = server.decide("enc1", &ad_break(""), None).await;
        assert!(matches!(result, Err(AdDecisionError::NoUrl)));
    }

    #[tokio::test]
    async fn test_http_server_fills_from_vast() {
        let base = vast_server().await;
        let server = HttpAdDecisionServer::new(Duration::from_secs(2));
        let settings = SsaiSettings {
            url: Some(format!("{}/filled", base)),
            ..Default::default()
        };
        assert!(server
            .decide("enc1", &ad_break(""), Some(&settings))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_http_server_failures() {
        let base = vast_server().await;
        let server = HttpAdDecisionServer::new(Duration::from_secs(2));

        let result = server
            .decide("enc1", &ad_break(&format!("{}/empty", base)), None)
            .await;
        assert!(matches!(result, Err(AdDecisionError::NoFill)));

        let result = server
            .decide("enc1", &ad_break(&format!("{}/unavailable", base)), None)
            .await;
        assert!(matches!(result, Err(AdDecisionError::Status(503))));

        let closed = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let result = server
            .decide("enc1", &ad_break(&format!("http://{}/vast", closed)), None)
            .await;
        assert!(matches!(result, Err(AdDecisionError::Request(_))));
    }

    #[tokio::test]
    async fn test_http_server_honours_configured_timeout() {
        let base = vast_server().await;
        let server = HttpAdDecisionServer::new(Duration::from_secs(10));
        let settings = SsaiSettings {
            url: Some(format!("{}/slow", base)),
            timeout: Some(0.1),
            ..Default::default()
        };
        let result = server.decide("enc1", &ad_break(""), Some(&settings)).await;
        assert!(matches!(result, Err(AdDecisionError::Timeout)));
    }

    #[tokio::test]
    async fn test_http_server_ignores_unrepresentable_timeout() {
        let base = vast_server().await;
        let server = HttpAdDecisionServer::new(Duration::from_secs(2));
        let settings: SsaiSettings = serde_json::from_value(json!({
            "url": format!("{}/filled", base),
            "timeout": 1e30
        }))
        .unwrap();
        assert_eq!(settings.timeout, Some(1e30));
        assert!(server
            .decide("enc1", &ad_break(""), Some(&settings))
            .await
            .is_ok());
    }
}
