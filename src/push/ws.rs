//! `GET /ws?callId=<id>` upgrade handler wiring a connecting subscriber
//! into the [`super::PushRegistry`].

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;

use super::PushRegistry;

#[derive(Debug, Deserialize)]
pub struct PushQuery {
    #[serde(rename = "callId")]
    pub call_id: String,
}

pub async fn push_ws(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<PushRegistry>>,
    Query(query): Query<PushQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        registry.attach(query.call_id, socket).await;
    })
}
