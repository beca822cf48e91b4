//! End-to-end walks of the literal scenarios this system is expected to
//! carry out: trunk reservation round trips, the menu-split campaign
//! shape, single-gather OTP rejection, and the full two-gather happy
//! path through a real channel session. Everything runs against a real
//! in-process `axum::serve` instance so action-script URLs resolve the
//! same way they would against a live PBX.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use ivr_orchestrator::action_engine::ActionEngine;
use ivr_orchestrator::call_store::{CallStore, GatherStage};
use ivr_orchestrator::catalog::{ActionSpec, StaticCampaignCatalog};
use ivr_orchestrator::channel::{ChannelRegistry, ChannelSession};
use ivr_orchestrator::config::Config;
use ivr_orchestrator::error::Result as OrchResult;
use ivr_orchestrator::http::{router, AppState};
use ivr_orchestrator::origination_queue::OriginationQueue;
use ivr_orchestrator::pbx::PbxClient;
use ivr_orchestrator::push::PushRegistry;
use ivr_orchestrator::trunk::{Trunk, TrunkStore};
use ivr_orchestrator::validation::ValidationEndpoint;

/// A PBX that never fails and hands out sequential synthetic channel ids.
struct MockPbx {
    next_id: AtomicUsize,
}

impl MockPbx {
    fn new() -> Arc<Self> {
        Arc::new(Self { next_id: AtomicUsize::new(1) })
    }
}

#[async_trait]
impl PbxClient for MockPbx {
    async fn originate(&self, _trunk_id: &str, _from: &str, _to: &str) -> OrchResult<String> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("call-{n}"))
    }

    async fn answer(&self, _channel_id: &str) -> OrchResult<()> {
        Ok(())
    }

    async fn play(&self, _channel_id: &str, _audio: &str, _playback_id: &str) -> OrchResult<()> {
        Ok(())
    }

    async fn stop_playback(&self, _playback_id: &str) -> OrchResult<()> {
        Ok(())
    }

    async fn hangup(&self, _channel_id: &str) -> OrchResult<()> {
        Ok(())
    }
}

fn spec(next: Option<&str>, dgts: Option<u32>, timeout: u64) -> ActionSpec {
    ActionSpec {
        audio: "audio".to_string(),
        next: next.map(str::to_string),
        dgts,
        finish_on_key: None,
        method: None,
        timeout,
    }
}

/// Binds an ephemeral listener, wires a fresh `AppState` around it (so
/// `action_base_url` matches the port it's actually bound to), and
/// serves the router on a background task.
async fn spawn_server(catalog: Arc<StaticCampaignCatalog>, pbx: Arc<dyn PbxClient>) -> (String, AppState) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let base_url = format!("http://{addr}");

    let mut config = Config::default();
    config.action_base_url = base_url.clone();

    let trunks = TrunkStore::new(config.assignment_ttl);
    let calls = CallStore::new();
    let queue = OriginationQueue::new(config.origination_spacing, config.origination_queue_limit);
    let push = PushRegistry::new(config.push_terminal_close_delay);
    let channels = ChannelRegistry::new();
    let actions = ActionEngine::new(calls.clone(), catalog.clone(), push.clone(), config.action_base_url.clone());
    let validation = ValidationEndpoint::new(calls.clone(), catalog.clone(), push.clone(), channels.clone(), config.action_base_url.clone());

    let state = AppState {
        trunks,
        calls,
        queue,
        push,
        pbx,
        catalog,
        channels,
        actions,
        validation,
        config,
    };

    let app = router(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (base_url, state)
}

#[tokio::test]
async fn trunk_assign_release_and_call_create_round_trip() {
    let catalog = StaticCampaignCatalog::new();
    let (base_url, state) = spawn_server(catalog, MockPbx::new()).await;

    let mut by_user = HashMap::new();
    by_user.insert("tenant-a".to_string(), vec![Trunk::new("custom_A".to_string(), "+15551234567", false)]);
    state.trunks.update_inventory(by_user).await;

    let http = reqwest::Client::new();

    let assign: serde_json::Value = http
        .post(format!("{base_url}/api/trunks/assign"))
        .json(&json!({ "user_token": "tenant-a" }))
        .send()
        .await
        .expect("assign request")
        .json()
        .await
        .expect("assign body");
    assert_eq!(assign["success"], json!(true));
    let assignment_uuid = assign["assignment_uuid"].as_str().expect("uuid").to_string();

    let create: serde_json::Value = http
        .post(format!("{base_url}/api/calls/create"))
        .json(&json!({
            "phone_number": "+15559876543",
            "campaign": "promo",
            "assignment_uuid": assignment_uuid,
        }))
        .send()
        .await
        .expect("create request")
        .json()
        .await
        .expect("create body");
    assert_eq!(create["success"], json!(true));
    let call_id = create["call_id"].as_str().expect("call_id").to_string();

    assert!(state.calls.get(&call_id).is_some());
    assert!(state.channels.lookup(&call_id).is_some());

    let release: serde_json::Value = http
        .post(format!("{base_url}/api/trunks/release"))
        .json(&json!({ "assignment_uuid": assignment_uuid }))
        .send()
        .await
        .expect("release request")
        .json()
        .await
        .expect("release body");
    assert_eq!(release["success"], json!(true));
}

#[tokio::test]
async fn menu_split_hoists_digit_and_validation_steers_by_selected_option() {
    let catalog = StaticCampaignCatalog::new();
    catalog.insert("venmo_fraude", "options", spec(Some("options"), Some(1), 5));
    catalog.insert("venmo_fraude", "option1", spec(None, None, 5));
    let (base_url, state) = spawn_server(catalog, MockPbx::new()).await;

    state.calls.save("call-menu", "options", "venmo_fraude");

    let http = reqwest::Client::new();
    let xml = http
        .get(format!("{base_url}/action/options?uuid=call-menu&Digits=1"))
        .send()
        .await
        .expect("action request")
        .text()
        .await
        .expect("xml body");
    assert!(xml.contains("custom/venmo_fraude/option1"), "unexpected xml: {xml}");
    assert_eq!(state.calls.get("call-menu").unwrap().selected_option.as_deref(), Some("1"));

    let resp = http
        .post(format!("{base_url}/otp/validate/call-menu"))
        .json(&json!({ "isValid": true }))
        .send()
        .await
        .expect("validate request");
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let pushed = state.push.pending("call-menu").expect("buffered push");
    assert_eq!(pushed["OtpValidation"], json!("valid"));
    assert_eq!(pushed["selectedOption"], json!("1"));
}

#[tokio::test]
async fn invalid_otp_on_single_gather_campaign_keeps_stage_unset() {
    let catalog = StaticCampaignCatalog::new();
    catalog.insert("single_campaign", "gather", spec(Some("confirm"), Some(4), 5));
    let (base_url, state) = spawn_server(catalog, MockPbx::new()).await;

    state.calls.save("call-inv", "gather", "single_campaign");

    let http = reqwest::Client::new();
    let resp = http
        .post(format!("{base_url}/otp/validate/call-inv"))
        .json(&json!({ "isValid": false }))
        .send()
        .await
        .expect("validate request");
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    assert_eq!(state.calls.get("call-inv").unwrap().gather_stage, None);
    let pushed = state.push.pending("call-inv").expect("buffered push");
    assert_eq!(pushed["OtpValidation"], json!("invalid"));
}

/// The scenario this whole system exists for: a two-gather campaign
/// walked from `stasis_entered` through both OTP gathers to completion,
/// with the OTP decisions arriving out-of-band via the validation
/// endpoint rather than through further DTMF.
#[tokio::test]
async fn two_gather_happy_path_drives_full_ivr_walk() {
    let catalog = StaticCampaignCatalog::new();
    catalog.insert("promo", "answer", spec(Some("gather"), Some(3), 5));
    catalog.insert("promo", "gather", spec(Some("confirm"), Some(1), 5));
    catalog.insert("promo", "confirm", spec(None, None, 7));
    catalog.insert("promo", "gather1", spec(Some("completed"), Some(1), 5));
    catalog.insert("promo", "completed", spec(None, None, 0));

    let (base_url, state) = spawn_server(catalog, MockPbx::new()).await;

    let call_id = "call-ivr".to_string();
    state.calls.save(&call_id, "created", "promo");
    let session = ChannelSession::new(call_id.clone(), call_id.clone(), Arc::clone(&state.pbx), Arc::downgrade(&state.channels));
    state.channels.register(Arc::clone(&session));

    session.start(&format!("{base_url}/action/answer?uuid={call_id}")).await.expect("start");
    assert!(session.is_answered().await);
    assert!(session.is_gathering().await);

    for digit in "123".chars() {
        session.on_dtmf(digit).await;
    }

    assert_eq!(state.calls.get(&call_id).unwrap().gather_stage, Some(GatherStage::First));
    let pushed = state.push.pending(&call_id).expect("otp push buffered");
    assert_eq!(pushed["SendOtp"], json!("123"));
    assert!(session.is_gathering().await);

    assert!(state.validation.validate(&call_id, true).await);
    assert_eq!(state.calls.get(&call_id).unwrap().gather_stage, Some(GatherStage::Second));
    let pushed = state.push.pending(&call_id).expect("first validation push buffered");
    assert_eq!(pushed["OtpValidation"], json!("valid"));
    assert_eq!(pushed["gatherStage"], json!("second"));
    assert!(session.is_gathering().await);

    session.on_dtmf('9').await;
    assert!(!session.is_destroyed().await);

    assert!(state.validation.validate(&call_id, true).await);
    let pushed = state.push.pending(&call_id).expect("second validation push buffered");
    assert_eq!(pushed["OtpValidation"], json!("valid"));
    assert_eq!(pushed["gatherStage"], json!("completed"));
}
