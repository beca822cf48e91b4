//! Trunk inventory, usage caps, and sliding-TTL assignment reservations.
//!
//! `TrunkStore` is the singleton that answers two questions for the rest
//! of the system: "which outbound route can tenant X use right now" and
//! "how many calls is route Y currently carrying". It owns no network
//! I/O itself -- inventory arrives from an external fetcher via
//! [`TrunkStore::update_inventory`], on whatever cadence that fetcher runs.

pub mod fetcher;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

/// The two trunk families the cap rule distinguishes. Derived purely
/// from a `trunk_id` prefix match, never stored independently of the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrunkKind {
    CustomOrTelnyx,
    Other,
}

impl TrunkKind {
    fn classify(trunk_id: &str) -> Self {
        if trunk_id.starts_with("telnyx_") || trunk_id.starts_with("custom_") {
            TrunkKind::CustomOrTelnyx
        } else {
            TrunkKind::Other
        }
    }
}

#[derive(Debug, Clone)]
pub struct Trunk {
    pub trunk_id: String,
    pub phone_numbers: Vec<String>,
    pub is_verified: bool,
    pub kind: TrunkKind,
}

impl Trunk {
    pub fn new(trunk_id: String, phone_numbers_csv: &str, is_verified: bool) -> Self {
        let kind = TrunkKind::classify(&trunk_id);
        let phone_numbers = phone_numbers_csv
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Self { trunk_id, phone_numbers, is_verified, kind }
    }

    /// `None` means unlimited (the `other` family).
    pub fn usage_cap(&self) -> Option<u32> {
        match self.kind {
            TrunkKind::Other => None,
            TrunkKind::CustomOrTelnyx if self.is_verified => Some(9),
            TrunkKind::CustomOrTelnyx => Some(4),
        }
    }

    /// Choose one of this trunk's phone numbers uniformly at random, as
    /// the "from" number for an origination.
    pub fn random_number(&self) -> Option<&str> {
        self.phone_numbers.choose(&mut rand::thread_rng()).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TrunkAssignment {
    pub assignment_id: Uuid,
    pub trunk_id: String,
    pub trunk_snapshot: Trunk,
    pub assigned_at: Instant,
    pub expires_at: Instant,
}

struct AssignmentEntry {
    assignment: TrunkAssignment,
    timer: JoinHandle<()>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct TrunkStats {
    pub trunk_id: String,
    pub kind: &'static str,
    pub capacity: Option<u32>,
    pub in_use: u32,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct AggregateStats {
    pub trunks: Vec<TrunkStats>,
    pub total_assignments: usize,
}

/// Normalize a user token the way every caller is expected to: strip
/// dashes. Both storage and lookup go through this so inventory keyed
/// by a dashed token still matches a dashless lookup and vice versa.
fn normalize_token(token: &str) -> String {
    token.chars().filter(|c| *c != '-').collect()
}

pub struct TrunkStore {
    trunks_by_user: RwLock<HashMap<String, Vec<Trunk>>>,
    usage: DashMap<String, u32>,
    assignments: DashMap<Uuid, Mutex<AssignmentEntry>>,
    ttl: Duration,
}

impl TrunkStore {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            trunks_by_user: RwLock::new(HashMap::new()),
            usage: DashMap::new(),
            assignments: DashMap::new(),
            ttl,
        })
    }

    /// Replace the entire inventory. Existing assignments are
    /// reconciled against the new snapshot: trunks still present get
    /// their embedded snapshot refreshed (a deep copy, so releasing the
    /// assignment later doesn't touch the live inventory entry);
    /// trunks that vanished are left on the assignment (a later
    /// origination attempt against it will simply fail against the
    /// PBX) but their usage counters are dropped since nothing should
    /// be able to reserve against a trunk that no longer exists.
    pub async fn update_inventory(&self, by_user: HashMap<String, Vec<Trunk>>) {
        let by_trunk_id: HashMap<&str, &Trunk> = by_user
            .values()
            .flatten()
            .map(|t| (t.trunk_id.as_str(), t))
            .collect();

        let mut live_counts: HashMap<String, u32> = HashMap::new();
        for mut entry in self.assignments.iter_mut() {
            let mut guard = entry.value().lock();
            if let Some(fresh) = by_trunk_id.get(guard.assignment.trunk_id.as_str()) {
                guard.assignment.trunk_snapshot = (*fresh).clone();
                *live_counts.entry(guard.assignment.trunk_id.clone()).or_insert(0) += 1;
            } else {
                tracing::warn!(
                    trunk_id = %guard.assignment.trunk_id,
                    assignment_id = %guard.assignment.assignment_id,
                    "trunk vanished from inventory; invalidated assignment left in place"
                );
            }
        }

        self.usage.retain(|trunk_id, _| by_trunk_id.contains_key(trunk_id.as_str()));

        // A trunk that vanished and later reappears had its counter
        // dropped by the `retain` above on the vanish cycle; nothing
        // else re-establishes it for the assignments that survived the
        // gap. Bring each surviving trunk's counter back up to at least
        // the number of live assignments still pointing at it, so a
        // vanish-then-reappear cycle can't be used to oversubscribe the
        // trunk past its cap.
        for (trunk_id, count) in live_counts {
            let mut usage = self.usage.entry(trunk_id).or_insert(0);
            if *usage < count {
                *usage = count;
            }
        }

        let normalized: HashMap<String, Vec<Trunk>> = by_user
            .into_iter()
            .map(|(token, trunks)| (normalize_token(&token), trunks))
            .collect();
        *self.trunks_by_user.write().await = normalized;

        tracing::info!(users = self.trunks_by_user.read().await.len(), "trunk inventory refreshed");
    }

    /// List the trunks currently visible for a user token, for
    /// diagnostics/`find_available` style read access without
    /// reserving anything.
    pub async fn find_available(&self, user_token: &str) -> Vec<Trunk> {
        let key = normalize_token(user_token);
        let guard = self.trunks_by_user.read().await;
        guard
            .get(&key)
            .map(|trunks| {
                trunks
                    .iter()
                    .filter(|t| self.usage_below_cap(t))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn usage_below_cap(&self, trunk: &Trunk) -> bool {
        match trunk.usage_cap() {
            None => true,
            Some(cap) => self.usage.get(&trunk.trunk_id).map(|u| *u).unwrap_or(0) < cap,
        }
    }

    /// Check `trunk`'s usage against its cap and increment it in the
    /// same `DashMap` shard-lock scope, closing the gap a separate
    /// check-then-act would leave between reading and writing the same
    /// counter. Returns a clone of `trunk` iff the reservation succeeded.
    fn try_reserve(&self, trunk: &Trunk) -> Option<Trunk> {
        let mut usage = self.usage.entry(trunk.trunk_id.clone()).or_insert(0);
        let below_cap = match trunk.usage_cap() {
            None => true,
            Some(cap) => *usage < cap,
        };
        if !below_cap {
            return None;
        }
        *usage += 1;
        Some(trunk.clone())
    }

    /// Reserve the first trunk for `user_token` (in inventory iteration
    /// order) whose current usage is below its cap. The cap check and
    /// the usage increment happen atomically per trunk (see
    /// `try_reserve`), so two concurrent `assign` calls racing against
    /// the same near-cap trunk cannot both succeed.
    pub async fn assign(self: &Arc<Self>, user_token: &str) -> Result<TrunkAssignment> {
        let key = normalize_token(user_token);
        let guard = self.trunks_by_user.read().await;
        let trunks = guard
            .get(&key)
            .ok_or_else(|| OrchestratorError::not_found(format!("no trunks for user {user_token}")))?;
        let trunk = trunks
            .iter()
            .find_map(|t| self.try_reserve(t))
            .ok_or_else(|| OrchestratorError::not_found(format!("no available trunk for user {user_token}")))?;
        drop(guard);

        let assignment_id = Uuid::new_v4();
        let now = Instant::now();
        let assignment = TrunkAssignment {
            assignment_id,
            trunk_id: trunk.trunk_id.clone(),
            trunk_snapshot: trunk,
            assigned_at: now,
            expires_at: now + self.ttl,
        };

        let timer = self.spawn_ttl_timer(assignment_id);
        self.assignments.insert(assignment_id, Mutex::new(AssignmentEntry { assignment: assignment.clone(), timer }));

        Ok(assignment)
    }

    fn spawn_ttl_timer(self: &Arc<Self>, assignment_id: Uuid) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            tracing::info!(%assignment_id, "assignment TTL expired, auto-releasing");
            let _ = store.release(assignment_id).await;
        })
    }

    /// Cancel and re-arm the TTL timer, refreshing `assigned_at`.
    pub async fn keep_alive(self: &Arc<Self>, assignment_id: Uuid) -> Result<()> {
        let entry = self
            .assignments
            .get(&assignment_id)
            .ok_or_else(|| OrchestratorError::not_found(format!("assignment {assignment_id}")))?;

        let new_timer = self.spawn_ttl_timer(assignment_id);
        let mut guard = entry.lock();
        guard.timer.abort();
        guard.timer = new_timer;
        let now = Instant::now();
        guard.assignment.assigned_at = now;
        guard.assignment.expires_at = now + self.ttl;
        Ok(())
    }

    /// Idempotent: releasing an id that is already gone is not an
    /// error from the timer's point of view, but an explicit caller
    /// request against an unknown id is reported as not-found.
    pub async fn release(&self, assignment_id: Uuid) -> Result<()> {
        let Some((_, entry)) = self.assignments.remove(&assignment_id) else {
            return Err(OrchestratorError::not_found(format!("assignment {assignment_id}")));
        };
        let entry = entry.into_inner();
        entry.timer.abort();

        if let Some(mut usage) = self.usage.get_mut(&entry.assignment.trunk_id) {
            *usage = usage.saturating_sub(1);
        }
        Ok(())
    }

    pub fn lookup(&self, assignment_id: Uuid) -> Option<TrunkAssignment> {
        self.assignments.get(&assignment_id).map(|e| e.lock().assignment.clone())
    }

    pub async fn stats(&self) -> AggregateStats {
        let guard = self.trunks_by_user.read().await;
        let mut seen = std::collections::HashSet::new();
        let mut trunks = Vec::new();
        for t in guard.values().flatten() {
            if !seen.insert(t.trunk_id.clone()) {
                continue;
            }
            trunks.push(TrunkStats {
                trunk_id: t.trunk_id.clone(),
                kind: match t.kind {
                    TrunkKind::CustomOrTelnyx => "custom_or_telnyx",
                    TrunkKind::Other => "other",
                },
                capacity: t.usage_cap(),
                in_use: self.usage.get(&t.trunk_id).map(|u| *u).unwrap_or(0),
            });
        }
        AggregateStats { trunks, total_assignments: self.assignments.len() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn trunk(id: &str, phones: &str, verified: bool) -> Trunk {
        Trunk::new(id.to_string(), phones, verified)
    }

    async fn store_with(user: &str, trunks: Vec<Trunk>) -> Arc<TrunkStore> {
        let store = TrunkStore::new(Duration::from_secs(120));
        let mut map = HashMap::new();
        map.insert(user.to_string(), trunks);
        store.update_inventory(map).await;
        store
    }

    #[tokio::test]
    async fn unverified_custom_trunk_caps_at_four() {
        let store = store_with("U", vec![trunk("custom_A", "+15551234567", false)]).await;
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(store.assign("U").await.expect("assign").assignment_id);
        }
        assert!(store.assign("U").await.is_err());
        store.release(ids[0]).await.unwrap();
        assert!(store.assign("U").await.is_ok());
    }

    #[tokio::test]
    async fn verified_custom_trunk_caps_at_nine() {
        let store = store_with("U", vec![trunk("custom_V", "+15551234567", true)]).await;
        for _ in 0..9 {
            store.assign("U").await.expect("assign");
        }
        assert!(store.assign("U").await.is_err());
    }

    #[tokio::test]
    async fn other_trunks_are_unbounded() {
        let store = store_with("U", vec![trunk("sip_generic", "+15551234567", false)]).await;
        for _ in 0..50 {
            store.assign("U").await.expect("assign");
        }
    }

    #[tokio::test]
    async fn user_token_dashes_are_ignored() {
        let store = store_with("user-token", vec![trunk("custom_A", "+1", false)]).await;
        assert!(store.assign("usertoken").await.is_ok());
    }

    #[tokio::test]
    async fn usage_matches_live_assignment_count() {
        let store = store_with("U", vec![trunk("custom_A", "+1", false)]).await;
        let a = store.assign("U").await.unwrap();
        let b = store.assign("U").await.unwrap();
        assert_eq!(*store.usage.get("custom_A").unwrap(), 2);
        store.release(a.assignment_id).await.unwrap();
        assert_eq!(*store.usage.get("custom_A").unwrap(), 1);
        store.release(b.assignment_id).await.unwrap();
        assert_eq!(*store.usage.get("custom_A").unwrap(), 0);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_unknown_id_errors() {
        let store = store_with("U", vec![trunk("custom_A", "+1", false)]).await;
        let a = store.assign("U").await.unwrap();
        store.release(a.assignment_id).await.unwrap();
        assert!(store.release(a.assignment_id).await.is_err());
    }

    #[tokio::test]
    #[serial(assignment_ttl)]
    async fn ttl_expiry_auto_releases() {
        let store = TrunkStore::new(Duration::from_millis(30));
        let mut map = HashMap::new();
        map.insert("U".to_string(), vec![trunk("custom_A", "+1", false)]);
        store.update_inventory(map).await;

        let a = store.assign("U").await.unwrap();
        assert_eq!(*store.usage.get("custom_A").unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.lookup(a.assignment_id).is_none());
        assert_eq!(store.usage.get("custom_A").map(|u| *u).unwrap_or(0), 0);
    }

    #[tokio::test]
    #[serial(assignment_ttl)]
    async fn keep_alive_extends_and_prevents_expiry() {
        let store = TrunkStore::new(Duration::from_millis(60));
        let mut map = HashMap::new();
        map.insert("U".to_string(), vec![trunk("custom_A", "+1", false)]);
        store.update_inventory(map).await;

        let a = store.assign("U").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        store.keep_alive(a.assignment_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.lookup(a.assignment_id).is_some());
    }

    #[tokio::test]
    async fn inventory_refresh_drops_usage_for_vanished_trunk() {
        let store = store_with("U", vec![trunk("custom_A", "+1", false)]).await;
        store.assign("U").await.unwrap();
        assert!(store.usage.contains_key("custom_A"));
        store.update_inventory(HashMap::new()).await;
        assert!(!store.usage.contains_key("custom_A"));
    }

    #[tokio::test]
    async fn reappearing_trunk_reestablishes_usage_for_surviving_assignments() {
        let store = store_with("U", vec![trunk("custom_A", "+1", false)]).await;
        // Take all 4 slots on an unverified custom trunk, never released.
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(store.assign("U").await.expect("assign").assignment_id);
        }

        // Trunk vanishes from inventory: usage counter is dropped, but
        // the assignments are left in place per spec.
        store.update_inventory(HashMap::new()).await;
        assert!(!store.usage.contains_key("custom_A"));
        for id in &ids {
            assert!(store.lookup(*id).is_some());
        }

        // Trunk reappears. Without reconciliation, usage would read 0
        // here and let 4 more assignments in despite 4 still being live.
        let mut map = HashMap::new();
        map.insert("U".to_string(), vec![trunk("custom_A", "+1", false)]);
        store.update_inventory(map).await;
        assert_eq!(*store.usage.get("custom_A").unwrap(), 4);
        assert!(store.assign("U").await.is_err());

        store.release(ids[0]).await.unwrap();
        assert!(store.assign("U").await.is_ok());
    }
}
