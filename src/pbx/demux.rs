//! Demultiplexes the PBX's single websocket event stream out to the
//! right [`ChannelSession`], with dedup windows for the events the PBX
//! is known to redeliver and a bounded reconnect policy.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use futures::StreamExt;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::channel::ChannelRegistry;
use crate::config::Config;
use crate::pbx::hangup_cause_to_wire;
use crate::push::PushRegistry;

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    channel: Option<String>,
    uuid: Option<String>,
    digit: Option<String>,
    playback_id: Option<String>,
    target_uri: Option<String>,
    state: Option<String>,
    cause: Option<u32>,
}

impl RawEvent {
    fn channel_id(&self) -> Option<&str> {
        self.channel.as_deref().or(self.uuid.as_deref())
    }
}

/// Strips a PBX `channel:<id>` URI prefix some event payloads wrap the
/// channel id in.
fn strip_channel_prefix(uri: &str) -> &str {
    uri.strip_prefix("channel:").unwrap_or(uri)
}

pub struct PbxEventDemux {
    registry: Arc<ChannelRegistry>,
    push: Arc<PushRegistry>,
    ws_url: String,
    action_base_url: String,
    reconnect_attempts: u32,
    reconnect_backoff: Duration,
    dedup_window: Duration,
    playback_seen: Arc<DashSet<String>>,
    hangup_seen: Arc<DashSet<String>>,
}

impl PbxEventDemux {
    pub fn new(ws_url: String, registry: Arc<ChannelRegistry>, push: Arc<PushRegistry>, config: &Config) -> Arc<Self> {
        Arc::new(Self {
            registry,
            push,
            ws_url,
            action_base_url: config.action_base_url.trim_end_matches('/').to_string(),
            reconnect_attempts: config.demux_reconnect_attempts,
            reconnect_backoff: config.demux_reconnect_backoff,
            dedup_window: config.dedup_window,
            playback_seen: Arc::new(DashSet::new()),
            hangup_seen: Arc::new(DashSet::new()),
        })
    }

    /// Runs until the reconnect budget is exhausted, at which point it
    /// emits a `server_failed` push to every live call and returns.
    pub async fn run(self: Arc<Self>) {
        let mut attempt = 0u32;
        loop {
            match tokio_tungstenite::connect_async(&self.ws_url).await {
                Ok((stream, _)) => {
                    attempt = 0;
                    tracing::info!(url = %self.ws_url, "pbx event stream connected");
                    let (_, mut read) = stream.split();
                    while let Some(msg) = read.next().await {
                        match msg {
                            Ok(WsMessage::Text(text)) => self.dispatch(&text).await,
                            Ok(WsMessage::Close(_)) => break,
                            Ok(_) => {}
                            Err(e) => {
                                tracing::warn!(error = %e, "pbx event stream error");
                                break;
                            }
                        }
                    }
                    tracing::warn!("pbx event stream disconnected");
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "pbx event stream connect failed");
                }
            }

            attempt += 1;
            if attempt >= self.reconnect_attempts {
                tracing::error!(attempts = attempt, "pbx event stream reconnect budget exhausted");
                self.emit_server_failed();
                return;
            }
            tokio::time::sleep(self.reconnect_backoff).await;
        }
    }

    fn emit_server_failed(&self) {
        for call_id in self.push.active_call_ids() {
            self.push.send(&call_id, serde_json::json!({ "callId": call_id, "event": "server_failed" }));
        }
    }

    async fn dispatch(&self, text: &str) {
        let event: RawEvent = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable pbx event, dropping");
                return;
            }
        };

        match event.kind.as_str() {
            "stasis_entered" => {
                if let Some(channel_id) = event.channel_id() {
                    if let Some(session) = self.registry.lookup(channel_id) {
                        let url = format!("{}/action/answer?uuid={channel_id}", self.action_base_url);
                        let _ = session.start(&url).await;
                        self.push.send(channel_id, serde_json::json!({ "callId": channel_id, "status": "answered" }));
                    }
                }
            }
            "dtmf_received" => {
                if let (Some(channel_id), Some(digit)) = (event.channel_id(), event.digit.as_deref()) {
                    if let (Some(session), Some(d)) = (self.registry.lookup(channel_id), digit.chars().next()) {
                        session.on_dtmf(d).await;
                    }
                }
            }
            "playback_finished" => {
                let channel_id = event
                    .target_uri
                    .as_deref()
                    .map(strip_channel_prefix)
                    .or_else(|| event.channel_id());
                let Some(channel_id) = channel_id else { return };
                let playback_id = event.playback_id.clone().unwrap_or_default();
                let dedup_key = format!("{channel_id}:{playback_id}");
                if !self.playback_seen.insert(dedup_key.clone()) {
                    return;
                }
                spawn_dedup_expiry(Arc::clone(&self.playback_seen), dedup_key, self.dedup_window);
                if let Some(session) = self.registry.lookup(channel_id) {
                    session.on_playback_finished(&playback_id).await;
                }
            }
            "channel_state_change" => {
                if event.state.as_deref() == Some("Ringing") {
                    if let Some(channel_id) = event.channel_id() {
                        self.push.send(channel_id, serde_json::json!({ "callId": channel_id, "status": "ringing" }));
                    }
                }
            }
            "channel_hangup" => {
                let Some(channel_id) = event.channel_id() else { return };
                if !self.hangup_seen.insert(channel_id.to_string()) {
                    return;
                }
                spawn_dedup_expiry(Arc::clone(&self.hangup_seen), channel_id.to_string(), self.dedup_window);
                let cause = hangup_cause_to_wire(event.cause.unwrap_or(0));
                let session = self.registry.lookup(channel_id);
                let call_duration = match &session {
                    Some(s) => s.call_duration_secs().await,
                    None => None,
                };
                self.push.mark_terminal(
                    channel_id,
                    serde_json::json!({
                        "callId": channel_id,
                        "status": "completed",
                        "callDuration": call_duration,
                        "hangupCause": cause,
                    }),
                );
                if let Some(session) = session {
                    session.destroy().await;
                }
            }
            other => {
                tracing::debug!(kind = other, "unhandled pbx event kind");
            }
        }
    }
}

fn spawn_dedup_expiry(set: Arc<DashSet<String>>, key: String, window: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(window).await;
        set.remove(&key);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelSession;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::sync::Weak;

    #[test]
    fn strips_channel_uri_prefix() {
        assert_eq!(strip_channel_prefix("channel:chan-1"), "chan-1");
        assert_eq!(strip_channel_prefix("chan-1"), "chan-1");
    }

    #[tokio::test]
    async fn dedup_set_forgets_key_after_window() {
        let set = Arc::new(DashSet::new());
        set.insert("k".to_string());
        spawn_dedup_expiry(Arc::clone(&set), "k".to_string(), Duration::from_millis(20));
        assert!(set.contains("k"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!set.contains("k"));
    }

    struct NoopPbx;

    #[async_trait]
    impl crate::pbx::PbxClient for NoopPbx {
        async fn originate(&self, _trunk_id: &str, _from: &str, _to: &str) -> Result<String> {
            Ok("chan-x".to_string())
        }
        async fn answer(&self, _channel_id: &str) -> Result<()> {
            Ok(())
        }
        async fn play(&self, _channel_id: &str, _audio: &str, _playback_id: &str) -> Result<()> {
            Ok(())
        }
        async fn stop_playback(&self, _playback_id: &str) -> Result<()> {
            Ok(())
        }
        async fn hangup(&self, _channel_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn demux_with_registry() -> (Arc<PbxEventDemux>, Arc<ChannelRegistry>, Arc<PushRegistry>) {
        let registry = ChannelRegistry::new();
        let push = PushRegistry::new(Duration::from_secs(5));
        let config = Config::default();
        let demux = PbxEventDemux::new("ws://unused".to_string(), registry.clone(), push.clone(), &config);
        (demux, registry, push)
    }

    #[tokio::test]
    async fn ringing_push_carries_call_id_and_status() {
        let (demux, _registry, push) = demux_with_registry();
        demux.dispatch(r#"{"type":"channel_state_change","channel":"chan-1","state":"Ringing"}"#).await;
        let pushed = push.pending("chan-1").expect("ringing push buffered");
        assert_eq!(pushed["callId"], serde_json::json!("chan-1"));
        assert_eq!(pushed["status"], serde_json::json!("ringing"));
    }

    #[tokio::test]
    async fn hangup_push_carries_status_completed_and_cause() {
        let (demux, registry, push) = demux_with_registry();
        let session = ChannelSession::new("chan-1".to_string(), "chan-1".to_string(), Arc::new(NoopPbx), Weak::new());
        registry.register(session);

        demux.dispatch(r#"{"type":"channel_hangup","channel":"chan-1","cause":17}"#).await;
        let pushed = push.pending("chan-1").expect("hangup push buffered");
        assert_eq!(pushed["callId"], serde_json::json!("chan-1"));
        assert_eq!(pushed["status"], serde_json::json!("completed"));
        assert_eq!(pushed["hangupCause"], serde_json::json!("busy"));
    }

    #[tokio::test]
    async fn duplicate_hangup_events_are_deduplicated() {
        let (demux, _registry, push) = demux_with_registry();
        demux.dispatch(r#"{"type":"channel_hangup","channel":"chan-2","cause":16}"#).await;
        push.close("chan-2");
        demux.dispatch(r#"{"type":"channel_hangup","channel":"chan-2","cause":16}"#).await;
        assert!(push.pending("chan-2").is_none());
    }
}
