//! The HTTP/WebSocket surface described in full in the external
//! interfaces section of this system's design: trunk management,
//! call origination, the IVR action-script endpoint, OTP validation,
//! and the push websocket. Thin by design -- every handler's job is to
//! parse the request, call one collaborator, and shape the response;
//! none of the call-session logic itself lives here.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::action_engine::ActionEngine;
use crate::call_store::CallStore;
use crate::catalog::CampaignCatalog;
use crate::channel::{ChannelRegistry, ChannelSession};
use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::origination_queue::OriginationQueue;
use crate::pbx::PbxClient;
use crate::push::ws::push_ws;
use crate::push::PushRegistry;
use crate::trunk::TrunkStore;
use crate::validation::ValidationEndpoint;

#[derive(Clone)]
pub struct AppState {
    pub trunks: Arc<TrunkStore>,
    pub calls: Arc<CallStore>,
    pub queue: Arc<OriginationQueue>,
    pub push: Arc<PushRegistry>,
    pub pbx: Arc<dyn PbxClient>,
    pub catalog: Arc<dyn CampaignCatalog>,
    pub channels: Arc<ChannelRegistry>,
    pub actions: Arc<ActionEngine>,
    pub validation: Arc<ValidationEndpoint>,
    pub config: Config,
}

/// Lets the `/ws` handler pull just the push registry out of `AppState`
/// via `State<Arc<PushRegistry>>` instead of the whole state struct.
impl axum::extract::FromRef<AppState> for Arc<PushRegistry> {
    fn from_ref(state: &AppState) -> Self {
        state.push.clone()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/trunks/assign", post(assign_trunk))
        .route("/api/trunks/release", post(release_trunk))
        .route("/trunk/add", post(add_trunk))
        .route("/trunk/delete/:trunk_id", delete(delete_trunk))
        .route("/trunk/list", get(list_trunks))
        .route("/api/calls/create", post(create_call))
        .route("/api/calls/:id/destroy", post(destroy_call))
        .route("/api/calls/queue/stats", get(queue_stats))
        .route("/action/debug/campaigns", get(debug_campaigns))
        .route("/action/debug/reload", post(debug_reload))
        .route("/action/:status", get(action))
        .route("/otp/validate/:call_id", post(validate_otp))
        .route("/ws", get(push_ws))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct AssignTrunkRequest {
    user_token: String,
}

#[derive(Debug, Serialize)]
struct AssignTrunkResponse {
    success: bool,
    assignment_uuid: Uuid,
    trunk_name: String,
}

async fn assign_trunk(State(state): State<AppState>, Json(req): Json<AssignTrunkRequest>) -> Result<impl IntoResponse> {
    let assignment = state.trunks.assign(&req.user_token).await?;
    Ok(Json(AssignTrunkResponse {
        success: true,
        assignment_uuid: assignment.assignment_id,
        trunk_name: assignment.trunk_id,
    }))
}

#[derive(Debug, Deserialize)]
struct ReleaseTrunkRequest {
    assignment_uuid: Uuid,
}

async fn release_trunk(State(state): State<AppState>, Json(req): Json<ReleaseTrunkRequest>) -> Result<impl IntoResponse> {
    state.trunks.release(req.assignment_uuid).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
struct AddTrunkRequest {
    ip_server: String,
    sip_username: String,
    sip_password: String,
    sip_server_url: String,
    #[serde(rename = "type")]
    kind: String,
}

async fn add_trunk(Json(req): Json<AddTrunkRequest>) -> Result<impl IntoResponse> {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{}:56201/add-trunk", req.ip_server))
        .json(&serde_json::json!({
            "username": req.sip_username,
            "password": req.sip_password,
            "server": req.sip_server_url,
            "type": req.kind,
        }))
        .send()
        .await
        .map_err(|e| OrchestratorError::PbxUnavailable { reason: e.to_string() })?;
    proxy_response(resp).await
}

#[derive(Debug, Deserialize)]
struct DeleteTrunkRequest {
    ip_server: String,
}

async fn delete_trunk(Path(trunk_id): Path<String>, Json(req): Json<DeleteTrunkRequest>) -> Result<impl IntoResponse> {
    let client = reqwest::Client::new();
    let resp = client
        .delete(format!("http://{}:56201/delete-trunk/{}", req.ip_server, trunk_id))
        .send()
        .await
        .map_err(|e| OrchestratorError::PbxUnavailable { reason: e.to_string() })?;
    proxy_response(resp).await
}

async fn proxy_response(resp: reqwest::Response) -> Result<Response> {
    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = resp.text().await.unwrap_or_default();
    Ok((status, body).into_response())
}

async fn list_trunks(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.trunks.stats().await)
        .into_response()
}

#[derive(Debug, Deserialize)]
struct CreateCallRequest {
    phone_number: String,
    campaign: String,
    assignment_uuid: Uuid,
}

#[derive(Debug, Serialize)]
struct CreateCallResponse {
    success: bool,
    call_id: String,
}

/// `spec.md` documents this endpoint as returning only `200 | 404 | 500`.
/// Everything internal to `create_call_inner` -- a saturated origination
/// queue, an unreachable PBX, a malformed trunk snapshot -- collapses to
/// 500 here; only an unknown assignment id is distinguished as 404.
async fn create_call(State(state): State<AppState>, Json(req): Json<CreateCallRequest>) -> Response {
    match create_call_inner(state, req).await {
        Ok(call_id) => Json(CreateCallResponse { success: true, call_id }).into_response(),
        Err(OrchestratorError::NotFound { .. }) => {
            (StatusCode::NOT_FOUND, Json(serde_json::json!({ "success": false }))).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "call creation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "success": false }))).into_response()
        }
    }
}

async fn create_call_inner(state: AppState, req: CreateCallRequest) -> Result<String> {
    let assignment = state
        .trunks
        .lookup(req.assignment_uuid)
        .ok_or_else(|| OrchestratorError::not_found(format!("assignment {}", req.assignment_uuid)))?;
    state.trunks.keep_alive(req.assignment_uuid).await?;

    let from_number = assignment
        .trunk_snapshot
        .random_number()
        .ok_or_else(|| OrchestratorError::BadRequest { reason: "trunk has no phone numbers".to_string() })?
        .to_string();
    let trunk_id = assignment.trunk_id.clone();
    let to_number = req.phone_number.clone();

    let pbx = Arc::clone(&state.pbx);
    let channel_id = state
        .queue
        .enqueue(&trunk_id, move || async move { pbx.originate(&trunk_id, &from_number, &to_number).await })
        .await?;

    state.calls.save(&channel_id, "created", &req.campaign);

    let session = ChannelSession::new(channel_id.clone(), channel_id.clone(), Arc::clone(&state.pbx), Arc::downgrade(&state.channels));
    state.channels.register(session);

    Ok(channel_id)
}

async fn destroy_call(State(state): State<AppState>, Path(call_id): Path<String>) -> Result<impl IntoResponse> {
    let session = state
        .channels
        .lookup(&call_id)
        .ok_or_else(|| OrchestratorError::not_found(format!("call {call_id}")))?;
    session.destroy().await;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn queue_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.queue.stats().await)
}

#[derive(Debug, Deserialize)]
struct ActionQuery {
    uuid: String,
    #[serde(rename = "Digits")]
    digits: Option<String>,
}

async fn action(State(state): State<AppState>, Path(status): Path<String>, Query(query): Query<ActionQuery>) -> Response {
    let xml = state.actions.handle(&status, &query.uuid, query.digits.as_deref()).await;
    (StatusCode::OK, [(header::CONTENT_TYPE, "application/xml")], xml).into_response()
}

async fn debug_campaigns(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.catalog.snapshot().await)
}

async fn debug_reload(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.catalog.reload().await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
struct ValidateRequest {
    #[serde(rename = "isValid")]
    is_valid: bool,
}

async fn validate_otp(State(state): State<AppState>, Path(call_id): Path<String>, Json(req): Json<ValidateRequest>) -> Response {
    if state.validation.validate(&call_id, req.is_valid).await {
        (StatusCode::OK, Json(serde_json::json!({ "success": true }))).into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(serde_json::json!({ "success": false }))).into_response()
    }
}

/// Spawns the background tasks every singleton needs: call-store
/// sweeper, trunk-inventory and campaign-catalog refreshers, and the
/// PBX event demultiplexer. Returns their handles so the caller can
/// abort them on shutdown.
pub fn spawn_background_tasks(state: &AppState) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();
    handles.push(state.calls.spawn_sweeper(state.config.call_sweep_interval, state.config.call_ttl));
    handles
}

pub fn terminal_close_delay_default() -> Duration {
    Duration::from_secs(5)
}
