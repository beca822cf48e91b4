//! PBX control-plane collaborator.
//!
//! `PBXClient` is the narrow, opaque interface the rest of the system
//! drives the PBX through (REST originate/answer/play/stopPlayback/hangup)
//! plus the event stream `PBXEventDemux` (in [`demux`]) consumes. The
//! concrete `HttpPbxClient` here is one reasonable implementation
//! against a FreePBX/ARI-style REST surface; it is intentionally thin
//! since the PBX's own wire protocol is out of this system's scope.

pub mod demux;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{OrchestratorError, Result};

#[async_trait]
pub trait PbxClient: Send + Sync {
    /// Originate a new call on `trunk_id` from `from_number` to
    /// `to_number`. Returns the PBX channel id for the new leg.
    async fn originate(&self, trunk_id: &str, from_number: &str, to_number: &str) -> Result<String>;

    async fn answer(&self, channel_id: &str) -> Result<()>;

    /// Start media playback of `audio` (a `custom/<campaign>/<status>`
    /// sound path) on `channel_id`, tagged with `playback_id`.
    async fn play(&self, channel_id: &str, audio: &str, playback_id: &str) -> Result<()>;

    async fn stop_playback(&self, playback_id: &str) -> Result<()>;

    /// Best-effort hangup. A 404 (channel already gone) is folded into
    /// `Ok(())` by callers, not treated as failure.
    async fn hangup(&self, channel_id: &str) -> Result<()>;
}

pub struct HttpPbxClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpPbxClient {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self { base_url: base_url.trim_end_matches('/').to_string(), http }
    }

    fn map_status(resp: &reqwest::Response) -> Result<()> {
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            Err(OrchestratorError::Pbx404)
        } else if !resp.status().is_success() {
            Err(OrchestratorError::PbxUnavailable { reason: format!("pbx returned {}", resp.status()) })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PbxClient for HttpPbxClient {
    async fn originate(&self, trunk_id: &str, from_number: &str, to_number: &str) -> Result<String> {
        let resp = self
            .http
            .post(format!("{}/channels/originate", self.base_url))
            .json(&serde_json::json!({
                "trunk_id": trunk_id,
                "from": from_number,
                "to": to_number,
            }))
            .send()
            .await
            .map_err(|e| OrchestratorError::PbxUnavailable { reason: e.to_string() })?;
        Self::map_status(&resp)?;
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| OrchestratorError::Parse { reason: e.to_string() })?;
        body.get("channel_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| OrchestratorError::Parse { reason: "missing channel_id".into() })
    }

    async fn answer(&self, channel_id: &str) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/channels/{}/answer", self.base_url, channel_id))
            .send()
            .await
            .map_err(|e| OrchestratorError::PbxUnavailable { reason: e.to_string() })?;
        Self::map_status(&resp)
    }

    async fn play(&self, channel_id: &str, audio: &str, playback_id: &str) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/channels/{}/play", self.base_url, channel_id))
            .json(&serde_json::json!({ "media": format!("sound:{audio}"), "playback_id": playback_id }))
            .send()
            .await
            .map_err(|e| OrchestratorError::PbxUnavailable { reason: e.to_string() })?;
        Self::map_status(&resp)
    }

    async fn stop_playback(&self, playback_id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(format!("{}/playbacks/{}", self.base_url, playback_id))
            .send()
            .await
            .map_err(|e| OrchestratorError::PbxUnavailable { reason: e.to_string() })?;
        match Self::map_status(&resp) {
            Err(OrchestratorError::Pbx404) => Ok(()),
            other => other,
        }
    }

    async fn hangup(&self, channel_id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(format!("{}/channels/{}", self.base_url, channel_id))
            .send()
            .await
            .map_err(|e| OrchestratorError::PbxUnavailable { reason: e.to_string() })?;
        match Self::map_status(&resp) {
            Err(OrchestratorError::Pbx404) => Ok(()),
            other => other,
        }
    }
}

/// Hangup-cause code (ISDN Q.850-style, as relayed by the PBX) mapped
/// to the wire string the push channel reports to subscribers.
pub fn hangup_cause_to_wire(cause: u32) -> &'static str {
    match cause {
        16 => "normal",
        17 => "busy",
        18 | 19 => "no-answer",
        21 => "rejected",
        34 => "congestion",
        _ => "unknown",
    }
}
