//! Process-wide table of live [`ChannelSession`]s, keyed by the single
//! identifier this system treats `call_id` and PBX `channel_id` as
//! (one channel per call, no bridging).
//!
//! `ChannelRegistry` is the sole long-term owner of each session's
//! `Arc`. Everything else -- `ActionEngine`, `ValidationEndpoint`, the
//! PBX event demultiplexer -- only ever gets a transient cloned handle
//! back out of `lookup`, never holds one across an await boundary it
//! doesn't need to, and never holds the registry's own `Arc` itself
//! except weakly (see [`ChannelSession`]'s `registry` field). That
//! keeps the pair from forming a reference cycle: the registry is the
//! only strong path to a session, and a session's own best-effort
//! deregister-on-destroy is what ultimately drops it.

use std::sync::Arc;

use dashmap::DashMap;

use super::ChannelSession;

pub struct ChannelRegistry {
    sessions: DashMap<String, Arc<ChannelSession>>,
}

impl ChannelRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { sessions: DashMap::new() })
    }

    pub fn register(&self, session: Arc<ChannelSession>) {
        self.sessions.insert(session.channel_id.clone(), session);
    }

    pub fn lookup(&self, channel_id: &str) -> Option<Arc<ChannelSession>> {
        self.sessions.get(channel_id).map(|e| Arc::clone(e.value()))
    }

    pub fn deregister(&self, channel_id: &str) {
        self.sessions.remove(channel_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
