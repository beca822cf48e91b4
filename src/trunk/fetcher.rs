//! Periodic HTTP fetch of trunk inventory into [`super::TrunkStore`].
//! Mirrors [`crate::catalog::HttpCampaignCatalog`]'s fetch-on-a-timer
//! shape: a single GET, reshaped into the store's own types, pushed in
//! wholesale via `update_inventory`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::{Trunk, TrunkStore};
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Deserialize)]
struct InventoryResponse {
    success: bool,
    #[serde(default)]
    trunks: HashMap<String, Vec<InventoryTrunk>>,
}

#[derive(Debug, Deserialize)]
struct InventoryTrunk {
    sip_id: String,
    sip_phone: String,
    sip_verified: bool,
}

pub struct TrunkInventoryFetcher {
    inventory_url: String,
    http: reqwest::Client,
    store: Arc<TrunkStore>,
}

impl TrunkInventoryFetcher {
    pub fn new(inventory_url: String, timeout: Duration, store: Arc<TrunkStore>) -> Arc<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build().expect("reqwest client");
        Arc::new(Self { inventory_url, http, store })
    }

    pub async fn fetch_once(&self) -> Result<()> {
        let resp = self
            .http
            .get(&self.inventory_url)
            .send()
            .await
            .map_err(|e| OrchestratorError::TimeoutFetch { what: e.to_string() })?;
        let body: InventoryResponse = resp.json().await.map_err(|e| OrchestratorError::Parse { reason: e.to_string() })?;
        if !body.success {
            return Err(OrchestratorError::Parse { reason: "trunk inventory response reported failure".to_string() });
        }

        let by_user = body
            .trunks
            .into_iter()
            .map(|(user, trunks)| {
                let trunks = trunks
                    .into_iter()
                    .map(|t| Trunk::new(t.sip_id, &t.sip_phone, t.sip_verified))
                    .collect();
                (user, trunks)
            })
            .collect();

        self.store.update_inventory(by_user).await;
        Ok(())
    }

    pub fn spawn_refresher(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let fetcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = fetcher.fetch_once().await {
                    tracing::warn!(error = %e, "trunk inventory refresh failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_phone_numbers() {
        let t = Trunk::new("custom_A".to_string(), "+15551234567,+15557654321", false);
        assert_eq!(t.phone_numbers.len(), 2);
    }
}
