//! Per-call metadata: the thin keyed store that `ActionEngine` and
//! `ValidationEndpoint` mutate as a call walks its IVR dialogue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GatherStage {
    First,
    Second,
}

#[derive(Debug, Clone)]
pub struct CallData {
    pub call_id: String,
    pub state: String,
    pub campaign: String,
    pub created_at: Instant,
    pub selected_option: Option<String>,
    pub gather_stage: Option<GatherStage>,
    /// Not part of the spec's data model proper -- tracks the sweeper's
    /// "without activity" clock separately from `created_at`, bumped on
    /// every `update`/`save` rather than only at creation.
    last_activity: Instant,
}

impl CallData {
    fn new(call_id: String, state: String, campaign: String) -> Self {
        let now = Instant::now();
        Self {
            call_id,
            state,
            campaign,
            created_at: now,
            selected_option: None,
            gather_stage: None,
            last_activity: now,
        }
    }
}

/// A partial update applied by [`CallStore::update`]. Fields left as
/// `None` are left untouched on the stored record.
#[derive(Debug, Default, Clone)]
pub struct CallDataPatch {
    pub state: Option<String>,
    pub selected_option: Option<String>,
    pub gather_stage: Option<Option<GatherStage>>,
}

pub struct CallStore {
    calls: DashMap<String, CallData>,
}

impl CallStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { calls: DashMap::new() })
    }

    /// Overwrites any existing record for `call_id`.
    pub fn save(&self, call_id: &str, state: &str, campaign: &str) {
        self.calls.insert(
            call_id.to_string(),
            CallData::new(call_id.to_string(), state.to_string(), campaign.to_string()),
        );
    }

    /// Merges a partial update into the existing record. A call_id
    /// with no existing record is a no-op, per spec. Any merge counts
    /// as activity and resets the sweeper's idle clock.
    pub fn update(&self, call_id: &str, patch: CallDataPatch) {
        if let Some(mut entry) = self.calls.get_mut(call_id) {
            if let Some(state) = patch.state {
                entry.state = state;
            }
            if let Some(opt) = patch.selected_option {
                entry.selected_option = Some(opt);
            }
            if let Some(stage) = patch.gather_stage {
                entry.gather_stage = stage;
            }
            entry.last_activity = Instant::now();
        }
    }

    pub fn get(&self, call_id: &str) -> Option<CallData> {
        self.calls.get(call_id).map(|e| e.clone())
    }

    pub fn remove(&self, call_id: &str) {
        self.calls.remove(call_id);
    }

    /// Remove entries that have seen no `update` (no ActionEngine/
    /// ValidationEndpoint activity) for longer than `ttl`. Intended to
    /// run every `interval` on a background task spawned by the caller.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let before = self.calls.len();
        self.calls.retain(|_, data| now.duration_since(data.last_activity) <= ttl);
        before - self.calls.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, ttl: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = store.sweep(ttl);
                if removed > 0 {
                    tracing::info!(removed, "call store sweep removed stale entries");
                }
            }
        })
    }
}
