//! Per-call push session registry: at most one open websocket per
//! `call_id`, with best-effort buffering for a subscriber that hasn't
//! connected yet.

pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

struct PushEntry {
    tx: Option<mpsc::UnboundedSender<Message>>,
    pending: Option<Value>,
}

impl Default for PushEntry {
    fn default() -> Self {
        Self { tx: None, pending: None }
    }
}

pub struct PushRegistry {
    sessions: DashMap<String, PushEntry>,
    terminal_close_delay: Duration,
}

impl PushRegistry {
    pub fn new(terminal_close_delay: Duration) -> Arc<Self> {
        Arc::new(Self { sessions: DashMap::new(), terminal_close_delay })
    }

    /// Debug affordance: a read-through view of which call ids
    /// currently have an open socket. Never a parallel source of
    /// truth -- it's derived from `sessions` on each call.
    pub fn active_call_ids(&self) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|e| e.value().tx.is_some())
            .map(|e| e.key().clone())
            .collect()
    }

    /// Attach a freshly-upgraded socket to `call_id`. Rejects (closes
    /// the new socket immediately) if one is already open for this id.
    /// Flushes any buffered pending message through the new socket.
    pub async fn attach(self: &Arc<Self>, call_id: String, socket: WebSocket) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        // The already-open check and the tx/pending mutation happen
        // inside one `entry()` call so they share the DashMap shard
        // lock for `call_id` -- two concurrent upgrades can't both
        // observe "not open" and both attach.
        let accepted = {
            let mut entry = self.sessions.entry(call_id.clone()).or_default();
            if entry.tx.is_some() {
                None
            } else {
                entry.tx = Some(tx.clone());
                Some(entry.pending.take())
            }
        };

        let Some(pending) = accepted else {
            tracing::warn!(%call_id, "rejecting second push socket for call");
            let _ = sink.send(Message::Close(None)).await;
            return;
        };

        if let Some(payload) = pending {
            let _ = tx.send(Message::Text(payload.to_string()));
        }

        let writer_call_id = call_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    tracing::debug!(call_id = %writer_call_id, "push socket write failed, closing");
                    break;
                }
            }
        });

        let registry = Arc::clone(self);
        let reader_call_id = call_id.clone();
        tokio::spawn(async move {
            while let Some(Ok(msg)) = stream.next().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
            }
            registry.forget_socket(&reader_call_id);
        });
    }

    fn forget_socket(&self, call_id: &str) {
        if let Some(mut entry) = self.sessions.get_mut(call_id) {
            entry.tx = None;
        }
    }

    /// Send `payload` to `call_id`'s subscriber. If no socket is open,
    /// the payload replaces whatever was previously pending.
    pub fn send(&self, call_id: &str, payload: Value) {
        let mut entry = self.sessions.entry(call_id.to_string()).or_default();
        match &entry.tx {
            Some(tx) => {
                if tx.send(Message::Text(payload.to_string())).is_err() {
                    entry.tx = None;
                    entry.pending = Some(payload);
                }
            }
            None => entry.pending = Some(payload),
        }
    }

    /// Send one final status message, then close the socket 5s later
    /// (configurable via `terminal_close_delay`) so any in-flight
    /// message has a chance to be delivered first.
    pub fn mark_terminal(self: &Arc<Self>, call_id: &str, terminal_payload: Value) {
        self.send(call_id, terminal_payload);
        let registry = Arc::clone(self);
        let call_id = call_id.to_string();
        let delay = self.terminal_close_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry.close(&call_id);
        });
    }

    pub fn close(&self, call_id: &str) {
        self.sessions.remove(call_id);
    }

    /// Read-through peek at the currently buffered pending message for
    /// `call_id`, if any. Debug/test affordance only -- never mutates.
    pub fn pending(&self, call_id: &str) -> Option<Value> {
        self.sessions.get(call_id).and_then(|e| e.pending.clone())
    }

    pub fn shutdown(&self) {
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_without_socket_buffers_latest_only() {
        let registry = PushRegistry::new(Duration::from_secs(5));
        registry.send("c1", serde_json::json!({"a": 1}));
        registry.send("c1", serde_json::json!({"a": 2}));
        let entry = registry.sessions.get("c1").unwrap();
        assert_eq!(entry.pending, Some(serde_json::json!({"a": 2})));
    }

    #[test]
    fn close_forgets_the_session() {
        let registry = PushRegistry::new(Duration::from_secs(5));
        registry.send("c1", serde_json::json!({"a": 1}));
        registry.close("c1");
        assert!(registry.sessions.get("c1").is_none());
    }
}
