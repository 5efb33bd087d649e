//! HTTP API for the control plane
//!
//! Every success body carries `success: true`; failures are `{error}` with
//! the status code chosen by [`ControlError`].

use crate::ads::{AdBreakRequest, SsaiSettings, TrackingReport};
use crate::clock;
use crate::control::ControlPlane;
use crate::error::{ControlError, ControlResult};
use crate::lifecycle::StopOutcome;
use crate::markers::{MarkerInsert, Scte35Settings};
use crate::status::EncoderStatus;
use crate::store::{ConfigSections, ConfigUpdate};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

const SCTE35_ACTIONS: [&str; 4] = ["insert", "remove", "list", "configure"];
const SSAI_ACTIONS: [&str; 4] = ["configure", "insert_ad", "get_status", "update_tracking"];

type Plane = State<Arc<ControlPlane>>;
type Body = Result<Json<Value>, JsonRejection>;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncoderQuery {
    #[serde(default)]
    encoder_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    #[serde(default)]
    encoder_id: Option<String>,
    #[serde(flatten)]
    sections: ConfigSections,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncoderRequest {
    #[serde(default)]
    encoder_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    #[serde(default)]
    encoder_id: Option<String>,
    #[serde(default)]
    status: Option<EncoderStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigCreate {
    #[serde(default)]
    encoder_id: Option<String>,
    #[serde(flatten)]
    sections: ConfigSections,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigPatch {
    #[serde(default)]
    encoder_id: Option<String>,
    #[serde(flatten)]
    update: ConfigUpdate,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Scte35Command {
    Insert(MarkerInsert),
    Remove {
        #[serde(default, rename = "markerId")]
        marker_id: Option<String>,
    },
    List,
    Configure {
        #[serde(default)]
        config: Option<Scte35Settings>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum SsaiCommand {
    Configure {
        #[serde(default, rename = "adConfig")]
        ad_config: Option<SsaiSettings>,
    },
    InsertAd {
        #[serde(default, rename = "adBreak")]
        ad_break: Option<AdBreakRequest>,
    },
    GetStatus,
    UpdateTracking {
        #[serde(default)]
        tracking: Option<TrackingReport>,
    },
}

fn body_value(body: Body) -> ControlResult<Value> {
    body.map(|Json(value)| value).map_err(|rejection| {
        ControlError::validation(format!("Invalid JSON body: {}", rejection.body_text()))
    })
}

fn parse<T: DeserializeOwned>(value: Value) -> ControlResult<T> {
    serde_json::from_value(value)
        .map_err(|e| ControlError::validation(format!("Invalid request body: {}", e)))
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

fn require_encoder_id(value: Option<String>) -> ControlResult<String> {
    present(value).ok_or_else(|| ControlError::validation("Missing encoder ID"))
}

/// Checks `encoderId` and `action` before the action payload is decoded
fn action_envelope(body: &Value, valid: &[&str]) -> ControlResult<(String, String)> {
    let field = |name: &str| {
        body.get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let (Some(encoder_id), Some(action)) = (field("encoderId"), field("action")) else {
        return Err(ControlError::validation("Missing encoder ID or action"));
    };
    if !valid.contains(&action.as_str()) {
        return Err(ControlError::validation(format!(
            "Invalid action. Must be one of: {}",
            valid.join(", ")
        )));
    }
    Ok((encoder_id, action))
}

fn action_response(encoder_id: String, action: String, result: Value) -> Json<Value> {
    Json(json!({
        "success": true,
        "encoderId": encoder_id,
        "action": action,
        "result": result,
        "timestamp": clock::now(),
    }))
}

fn to_value<T: serde::Serialize>(value: &T) -> ControlResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| ControlError::Internal(format!("serialize response: {}", e)))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn start_encoder(State(plane): Plane, body: Body) -> ControlResult<Json<Value>> {
    let request: StartRequest = parse(body_value(body)?)?;
    let encoder_id = present(request.encoder_id);

    let started = plane
        .start_encoder(encoder_id.as_deref(), request.sections)
        .await?;

    Ok(Json(json!({
        "success": true,
        "encoderId": started.instance.id,
        "status": started.instance.state,
        "config": started.config,
        "configVersion": started.instance.config_version,
        "startTime": clock::now(),
        "message": "Encoder start initiated",
    })))
}

async fn stop_encoder(State(plane): Plane, body: Body) -> ControlResult<Json<Value>> {
    let request: EncoderRequest = parse(body_value(body)?)?;
    let encoder_id = require_encoder_id(request.encoder_id)?;

    let status = match plane.stop_encoder(&encoder_id).await? {
        StopOutcome::Stopping(_) => "stopping",
        StopOutcome::NoOp(_) => "stopped",
    };

    Ok(Json(json!({
        "success": true,
        "encoderId": encoder_id,
        "status": status,
        "stopTime": clock::now(),
    })))
}

async fn reset_encoder(State(plane): Plane, body: Body) -> ControlResult<Json<Value>> {
    let request: EncoderRequest = parse(body_value(body)?)?;
    let encoder_id = require_encoder_id(request.encoder_id)?;

    let instance = plane.lifecycle.reset(&encoder_id).await?;
    Ok(Json(json!({
        "success": true,
        "encoderId": encoder_id,
        "status": instance.state,
    })))
}

async fn get_status(
    State(plane): Plane,
    Query(query): Query<EncoderQuery>,
) -> ControlResult<Json<Value>> {
    let encoder_id = require_encoder_id(query.encoder_id)?;
    let (status, lifecycle) = plane.encoder_status(&encoder_id).await;

    Ok(Json(json!({
        "success": true,
        "encoderId": encoder_id,
        "status": status,
        "lifecycle": lifecycle,
        "timestamp": clock::now(),
    })))
}

async fn report_status(State(plane): Plane, body: Body) -> ControlResult<Json<Value>> {
    let request: StatusReport = parse(body_value(body)?)?;
    let encoder_id = present(request.encoder_id)
        .ok_or_else(|| ControlError::validation("Missing encoder ID or status"))?;

    plane.status.report(&encoder_id, request.status).await?;
    Ok(Json(json!({
        "success": true,
        "encoderId": encoder_id,
        "message": "Status updated successfully",
    })))
}

async fn get_config(
    State(plane): Plane,
    Query(query): Query<EncoderQuery>,
) -> ControlResult<Json<Value>> {
    match present(query.encoder_id) {
        Some(encoder_id) => {
            let config = plane.store.get(&encoder_id).await?;
            Ok(Json(json!({
                "success": true,
                "encoderId": encoder_id,
                "config": config,
            })))
        }
        None => {
            let mut configs = plane.store.list().await;
            configs.sort_by(|a, b| a.encoder_id.cmp(&b.encoder_id));
            Ok(Json(json!({
                "success": true,
                "count": configs.len(),
                "configs": configs,
            })))
        }
    }
}

async fn config_history(
    State(plane): Plane,
    Query(query): Query<EncoderQuery>,
) -> ControlResult<Json<Value>> {
    let encoder_id = require_encoder_id(query.encoder_id)?;
    let history = plane.store.history(&encoder_id).await?;

    Ok(Json(json!({
        "success": true,
        "encoderId": encoder_id,
        "count": history.len(),
        "history": history,
    })))
}

async fn create_config(State(plane): Plane, body: Body) -> ControlResult<Json<Value>> {
    let request: ConfigCreate = parse(body_value(body)?)?;
    let encoder_id = require_encoder_id(request.encoder_id)?;

    let config = plane.store.create(&encoder_id, request.sections).await?;
    Ok(Json(json!({
        "success": true,
        "encoderId": encoder_id,
        "config": config,
        "message": "Configuration saved successfully",
    })))
}

async fn update_config(State(plane): Plane, body: Body) -> ControlResult<Json<Value>> {
    let request: ConfigPatch = parse(body_value(body)?)?;
    let encoder_id = require_encoder_id(request.encoder_id)?;

    let config = plane.store.update(&encoder_id, request.update).await?;
    Ok(Json(json!({
        "success": true,
        "encoderId": encoder_id,
        "config": config,
        "message": "Configuration updated successfully",
    })))
}

async fn delete_config(
    State(plane): Plane,
    Query(query): Query<EncoderQuery>,
) -> ControlResult<Json<Value>> {
    let encoder_id = require_encoder_id(query.encoder_id)?;

    plane.store.delete(&encoder_id).await?;
    Ok(Json(json!({
        "success": true,
        "encoderId": encoder_id,
        "message": "Configuration deleted successfully",
    })))
}

async fn scte35(State(plane): Plane, body: Body) -> ControlResult<Json<Value>> {
    let body = body_value(body)?;
    let (encoder_id, action) = action_envelope(&body, &SCTE35_ACTIONS)?;

    let result = match parse::<Scte35Command>(body)? {
        Scte35Command::Insert(request) => {
            to_value(&plane.markers.insert(&encoder_id, request).await)?
        }
        Scte35Command::Remove { marker_id } => {
            to_value(&plane.markers.remove(marker_id.as_deref()).await?)?
        }
        Scte35Command::List => {
            let markers = plane.markers.list(&encoder_id).await;
            json!({ "count": markers.len(), "markers": markers })
        }
        Scte35Command::Configure { config } => {
            let config = plane.markers.configure(&encoder_id, config).await?;
            json!({ "config": config, "status": "configured", "timestamp": clock::now() })
        }
    };

    Ok(action_response(encoder_id, action, result))
}

async fn ssai(State(plane): Plane, body: Body) -> ControlResult<Json<Value>> {
    let body = body_value(body)?;
    let (encoder_id, action) = action_envelope(&body, &SSAI_ACTIONS)?;

    let result = match parse::<SsaiCommand>(body)? {
        SsaiCommand::Configure { ad_config } => {
            let ad_config = plane.ads.configure(&encoder_id, ad_config).await?;
            json!({
                "adConfig": ad_config,
                "enabled": true,
                "status": "configured",
                "timestamp": clock::now(),
            })
        }
        SsaiCommand::InsertAd { ad_break } => {
            to_value(&plane.insert_ad(&encoder_id, ad_break).await?)?
        }
        SsaiCommand::GetStatus => to_value(&plane.ads.status(&encoder_id).await)?,
        SsaiCommand::UpdateTracking { tracking } => {
            let event = plane.ads.update_tracking(&encoder_id, tracking).await?;
            json!({ "tracking": event, "status": "updated", "timestamp": clock::now() })
        }
    };

    Ok(action_response(encoder_id, action, result))
}

/// Builds the router with every control endpoint
pub fn create_router(plane: Arc<ControlPlane>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/encoder/start", post(start_encoder))
        .route("/encoder/stop", post(stop_encoder))
        .route("/encoder/reset", post(reset_encoder))
        .route("/encoder/status", get(get_status).post(report_status))
        .route(
            "/encoder/config",
            get(get_config)
                .post(create_config)
                .put(update_config)
                .delete(delete_config),
        )
        .route("/encoder/config/history", get(config_history))
        .route("/encoder/scte35", post(scte35))
        .route("/encoder/ssai", post(ssai))
        .layer(TraceLayer::new_for_http())
        .with_state(plane)
}

/// Serves the control API on the configured bind address until `shutdown` resolves
pub async fn run_server<F>(plane: Arc<ControlPlane>, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = plane.config.server.bind_address.clone();
    let app = create_router(plane);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "control API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
