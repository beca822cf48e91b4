//! `POST /otp/validate/:callId` -- the side-channel by which a tenant's
//! OTP decision steers an already-running [`crate::channel::ChannelSession`]
//! onto a new action URL, independent of whatever PBX event it's
//! currently waiting on.

use std::sync::Arc;

use crate::call_store::{CallDataPatch, CallStore, GatherStage};
use crate::catalog::CampaignCatalog;
use crate::channel::ChannelRegistry;
use crate::push::PushRegistry;

pub struct ValidationEndpoint {
    call_store: Arc<CallStore>,
    catalog: Arc<dyn CampaignCatalog>,
    push: Arc<PushRegistry>,
    registry: Arc<ChannelRegistry>,
    action_base_url: String,
}

impl ValidationEndpoint {
    pub fn new(
        call_store: Arc<CallStore>,
        catalog: Arc<dyn CampaignCatalog>,
        push: Arc<PushRegistry>,
        registry: Arc<ChannelRegistry>,
        action_base_url: String,
    ) -> Arc<Self> {
        Arc::new(Self { call_store, catalog, push, registry, action_base_url })
    }

    /// Returns `false` if `call_id` is unknown -- callers map that to
    /// a 404, the one case in this endpoint that isn't locked into the
    /// "always XML, always 200" discipline `ActionEngine` has.
    pub async fn validate(&self, call_id: &str, is_valid: bool) -> bool {
        let Some(call) = self.call_store.get(call_id) else {
            return false;
        };
        let two_gather = self.catalog.is_two_gather(&call.campaign).await;

        if is_valid {
            if two_gather {
                match call.gather_stage {
                    None | Some(GatherStage::First) => {
                        self.call_store.update(
                            call_id,
                            CallDataPatch { gather_stage: Some(Some(GatherStage::Second)), ..Default::default() },
                        );
                        self.steer(call_id, "gather1").await;
                        self.push.send(
                            call_id,
                            serde_json::json!({ "callId": call_id, "OtpValidation": "valid", "gatherStage": "second" }),
                        );
                    }
                    Some(GatherStage::Second) => {
                        self.steer(call_id, "completed").await;
                        self.push.send(
                            call_id,
                            serde_json::json!({ "callId": call_id, "OtpValidation": "valid", "gatherStage": "completed" }),
                        );
                    }
                }
            } else {
                let step = match call.selected_option.as_deref() {
                    Some("1") => "completed_option1",
                    Some("2") => "completed_option2",
                    _ => "completed",
                };
                self.steer(call_id, step).await;
                self.push.send(
                    call_id,
                    serde_json::json!({ "callId": call_id, "OtpValidation": "valid", "selectedOption": call.selected_option }),
                );
            }
        } else if two_gather {
            match call.gather_stage {
                None | Some(GatherStage::First) => {
                    self.call_store.update(
                        call_id,
                        CallDataPatch { gather_stage: Some(Some(GatherStage::First)), ..Default::default() },
                    );
                    self.steer(call_id, "invalid").await;
                    self.push.send(call_id, serde_json::json!({ "callId": call_id, "OtpValidation": "invalid" }));
                }
                Some(GatherStage::Second) => {
                    self.steer(call_id, "gather1").await;
                    self.push.send(call_id, serde_json::json!({ "callId": call_id, "OtpValidation": "invalid" }));
                }
            }
        } else {
            self.steer(call_id, "invalid").await;
            self.push.send(call_id, serde_json::json!({ "callId": call_id, "OtpValidation": "invalid" }));
        }

        true
    }

    async fn steer(&self, call_id: &str, step: &str) {
        let Some(session) = self.registry.lookup(call_id) else {
            tracing::warn!(call_id, step, "validation steer with no live channel session");
            return;
        };
        let url = format!("{}/action/{}", self.action_base_url.trim_end_matches('/'), step);
        if let Err(e) = session.set_action(&url, &[]).await {
            tracing::warn!(call_id, step, error = %e, "failed to steer channel session");
        }
    }
}
