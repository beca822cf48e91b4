//! The campaign catalog: a periodically-refreshed map of
//! `(campaign, step) → ActionSpec` that drives everything `ActionEngine`
//! emits. Structurally this mirrors how [`crate::trunk::TrunkStore`]
//! treats trunk inventory -- an external fetch on a timer feeding an
//! in-memory snapshot nothing else mutates directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct ActionSpec {
    pub audio: String,
    pub next: Option<String>,
    pub dgts: Option<u32>,
    #[serde(rename = "finishOnKey")]
    pub finish_on_key: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_timeout() -> u64 {
    5
}

impl ActionSpec {
    /// `finish_on_key` is only meaningful as a single character; a
    /// multi-character value (or an absent one) means fixed-length
    /// gather.
    pub fn finish_on_key_char(&self) -> Option<char> {
        self.finish_on_key.as_deref().and_then(|s| {
            let mut chars = s.chars();
            let first = chars.next()?;
            if chars.next().is_none() {
                Some(first)
            } else {
                None
            }
        })
    }
}

type CampaignMap = HashMap<String, ActionSpec>;

#[async_trait]
pub trait CampaignCatalog: Send + Sync {
    async fn get(&self, campaign: &str, step: &str) -> Option<ActionSpec>;

    async fn is_two_gather(&self, campaign: &str) -> bool {
        self.get(campaign, "gather1").await.is_some()
    }

    async fn snapshot(&self) -> serde_json::Value;

    async fn reload(&self) -> Result<()>;
}

/// Fetches `{ <campaign>: { <step>: ActionSpec } }` from a single URL
/// on a timer and on explicit `/action/debug/reload` requests.
pub struct HttpCampaignCatalog {
    catalog_url: String,
    http: reqwest::Client,
    campaigns: DashMap<String, CampaignMap>,
}

impl HttpCampaignCatalog {
    pub fn new(catalog_url: String, timeout: Duration) -> Arc<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build().expect("reqwest client");
        Arc::new(Self { catalog_url, http, campaigns: DashMap::new() })
    }

    pub fn spawn_refresher(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let catalog = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = catalog.reload().await {
                    tracing::warn!(error = %e, "campaign catalog refresh failed");
                }
            }
        })
    }

    async fn fetch(&self) -> Result<HashMap<String, CampaignMap>> {
        let resp = self
            .http
            .get(&self.catalog_url)
            .send()
            .await
            .map_err(|e| OrchestratorError::TimeoutFetch { what: e.to_string() })?;
        resp.json().await.map_err(|e| OrchestratorError::Parse { reason: e.to_string() })
    }
}

#[async_trait]
impl CampaignCatalog for HttpCampaignCatalog {
    async fn get(&self, campaign: &str, step: &str) -> Option<ActionSpec> {
        self.campaigns.get(campaign)?.get(step).cloned()
    }

    async fn snapshot(&self) -> serde_json::Value {
        let map: HashMap<String, HashMap<String, String>> = self
            .campaigns
            .iter()
            .map(|e| {
                let steps = e.value().keys().map(|k| (k.clone(), e.value()[k].audio.clone())).collect();
                (e.key().clone(), steps)
            })
            .collect();
        serde_json::json!({ "campaigns": map })
    }

    async fn reload(&self) -> Result<()> {
        let fresh = self.fetch().await?;
        self.campaigns.clear();
        for (campaign, steps) in fresh {
            self.campaigns.insert(campaign, steps);
        }
        tracing::info!(campaigns = self.campaigns.len(), "campaign catalog reloaded");
        Ok(())
    }
}

/// A catalog whose contents are set directly rather than fetched.
/// Used by tests and by any deployment that wants to seed the catalog
/// without running the HTTP fetcher.
pub struct StaticCampaignCatalog {
    campaigns: DashMap<String, CampaignMap>,
}

impl StaticCampaignCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { campaigns: DashMap::new() })
    }

    pub fn insert(&self, campaign: &str, step: &str, spec: ActionSpec) {
        self.campaigns.entry(campaign.to_string()).or_default().insert(step.to_string(), spec);
    }
}

#[async_trait]
impl CampaignCatalog for StaticCampaignCatalog {
    async fn get(&self, campaign: &str, step: &str) -> Option<ActionSpec> {
        self.campaigns.get(campaign)?.get(step).cloned()
    }

    async fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({ "campaigns": self.campaigns.len() })
    }

    async fn reload(&self) -> Result<()> {
        Ok(())
    }
}
