//! The IVR state machine that drives one active PBX channel through a
//! forward-only walk across campaign-supplied action scripts.
//!
//! All mutation of a [`ChannelSession`]'s state happens while holding
//! its own `tokio::sync::Mutex`, which is held across the awaits
//! inside a single logical operation (a DTMF digit, a playback-finished
//! event, a timer firing, an external steer). That is what gives the
//! spec's "processed one at a time, in arrival order" guarantee: two
//! concurrent events on the same channel simply queue up on the lock.

pub mod actions;
pub mod registry;

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{OrchestratorError, Result};
use crate::pbx::PbxClient;

pub use registry::ChannelRegistry;

use actions::{parse_actions, ActionName, ParsedAction};

#[derive(Debug, Default)]
pub struct GatherState {
    pub running: bool,
    pub collected: String,
    pub num_digits: usize,
    pub finish_on_key: Option<char>,
    pub next_action_url: Option<String>,
    pub timeout_s: u64,
    timer: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
pub struct PlaybackState {
    pub id: Option<String>,
    pub playing: bool,
}

/// Never populated anywhere in this implementation, matching the
/// source this spec was distilled from -- retained for forward
/// compatibility per the spec's own open question about it.
struct PendingNext {
    #[allow(dead_code)]
    url: String,
    #[allow(dead_code)]
    params: Vec<(String, String)>,
}

struct Inner {
    remaining_actions: VecDeque<ParsedAction>,
    gather: GatherState,
    playback: PlaybackState,
    post_playback_timer: Option<JoinHandle<()>>,
    /// The timeout attribute of the most recently issued `play`
    /// action, remembered so the "no remaining actions after playback
    /// finishes" branch can arm a final timer with it.
    last_play_timeout: u64,
    pending_next: Option<PendingNext>,
    answered_at: Option<Instant>,
    destroyed: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            remaining_actions: VecDeque::new(),
            gather: GatherState::default(),
            playback: PlaybackState::default(),
            post_playback_timer: None,
            last_play_timeout: 0,
            pending_next: None,
            answered_at: None,
            destroyed: false,
        }
    }
}

fn destroy_locked(inner: &mut Inner) {
    inner.destroyed = true;
    if let Some(t) = inner.post_playback_timer.take() {
        t.abort();
    }
    if let Some(t) = inner.gather.timer.take() {
        t.abort();
    }
    inner.gather.running = false;
    inner.playback.playing = false;
    inner.playback.id = None;
}

pub struct ChannelSession {
    pub channel_id: String,
    pub call_id: String,
    inner: Mutex<Inner>,
    pbx: Arc<dyn PbxClient>,
    http: reqwest::Client,
    registry: Weak<ChannelRegistry>,
}

impl ChannelSession {
    pub fn new(
        channel_id: String,
        call_id: String,
        pbx: Arc<dyn PbxClient>,
        registry: Weak<ChannelRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel_id,
            call_id,
            inner: Mutex::new(Inner::default()),
            pbx,
            http: reqwest::Client::new(),
            registry,
        })
    }

    /// `stasis_entered`: answer the channel, record the answer time,
    /// then fetch and run the initial action script.
    pub async fn start(self: &Arc<Self>, initial_url: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return Ok(());
        }
        if let Err(e) = self.pbx.answer(&self.channel_id).await {
            tracing::warn!(channel_id = %self.channel_id, error = %e, "answer failed, continuing anyway");
        }
        inner.answered_at = Some(Instant::now());
        if self.load_actions_into(&mut inner, initial_url, &[]).await.is_err() {
            destroy_locked(&mut inner);
            drop(inner);
            self.finish_destroy().await;
            return Ok(());
        }
        let became_destroyed = self.run_next_loop(&mut inner).await;
        drop(inner);
        if became_destroyed {
            self.finish_destroy().await;
        }
        Ok(())
    }

    /// Resume the forward walk across `remaining_actions`. Public
    /// entry point used after an external caller has already primed
    /// `remaining_actions` via `load_actions`/`set_action`.
    pub async fn run_next(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return;
        }
        let became_destroyed = self.run_next_loop(&mut inner).await;
        drop(inner);
        if became_destroyed {
            self.finish_destroy().await;
        }
    }

    /// Returns `true` if this call newly latched `destroyed`.
    async fn run_next_loop(self: &Arc<Self>, inner: &mut Inner) -> bool {
        loop {
            if inner.destroyed {
                return false;
            }
            let Some(action) = inner.remaining_actions.pop_front() else {
                return false;
            };
            match action.name {
                Some(ActionName::Play) => {
                    if self.do_play(inner, &action).await {
                        return true;
                    }
                    // "after issuing play, immediately call run_next" --
                    // loop continues regardless of play success, per
                    // spec §7 ("play-error tries the next action").
                }
                Some(ActionName::Gather) => {
                    self.do_gather(inner, &action);
                    return false; // gather is blocking: do not pop further
                }
                Some(ActionName::Redirect) => {
                    if let Some(t) = inner.post_playback_timer.take() {
                        t.abort();
                    }
                    let url = action.data.clone();
                    if self.load_actions_into(inner, &url, &[]).await.is_err() {
                        destroy_locked(inner);
                        return true;
                    }
                    // tail call: loop continues into run_next semantics
                }
                Some(ActionName::Hangup) => {
                    destroy_locked(inner);
                    return true;
                }
                None => continue,
            }
        }
    }

    async fn do_play(self: &Arc<Self>, inner: &mut Inner, action: &ParsedAction) -> bool {
        let playback_id = format!(
            "{}_{}_{}",
            self.channel_id,
            now_millis(),
            rand::thread_rng().gen_range(1000..9999)
        );
        inner.playback.id = Some(playback_id.clone());
        inner.playback.playing = true;

        let timeout = action.attr_u64("timeout").unwrap_or(0);
        inner.last_play_timeout = timeout;
        if timeout > 0 {
            inner.post_playback_timer = Some(self.spawn_post_playback_timer(timeout));
        }

        if let Err(e) = self.pbx.play(&self.channel_id, &action.data, &playback_id).await {
            tracing::warn!(channel_id = %self.channel_id, error = %e, "play failed, continuing to next action");
        }
        false
    }

    fn do_gather(self: &Arc<Self>, inner: &mut Inner, action: &ParsedAction) {
        let finish_on_key = action.attr("finishOnKey").and_then(|s| s.chars().next());
        let num_digits = action.attr_u64("numDigits").unwrap_or(1) as usize;
        let timeout_s = action.attr_u64("timeout").unwrap_or(5);

        inner.gather = GatherState {
            running: true,
            collected: String::new(),
            num_digits,
            finish_on_key,
            next_action_url: action.attr("action").map(|s| s.to_string()),
            timeout_s,
            timer: None,
        };

        if !inner.playback.playing {
            inner.gather.timer = Some(self.spawn_gather_timer(timeout_s));
        }
        // else: armed later, once playback_finished arrives.
    }

    fn spawn_post_playback_timer(self: &Arc<Self>, timeout_s: u64) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(timeout_s)).await;
            this.handle_post_playback_timeout().await;
        })
    }

    fn spawn_gather_timer(self: &Arc<Self>, timeout_s: u64) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(timeout_s)).await;
            this.handle_gather_timeout().await;
        })
    }

    async fn handle_post_playback_timeout(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return;
        }
        inner.post_playback_timer = None;
        destroy_locked(&mut inner);
        drop(inner);
        self.finish_destroy().await;
    }

    async fn handle_gather_timeout(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return;
        }
        inner.gather.timer = None;
        inner.gather.running = false;
        destroy_locked(&mut inner);
        drop(inner);
        self.finish_destroy().await;
    }

    /// Unconditional barge-in plus digit accumulation / terminal-key
    /// detection.
    pub async fn on_dtmf(self: &Arc<Self>, digit: char) {
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return;
        }

        if inner.playback.playing {
            if let Some(pb_id) = inner.playback.id.take() {
                let _ = self.pbx.stop_playback(&pb_id).await;
            }
            inner.playback.playing = false;
            if let Some(t) = inner.post_playback_timer.take() {
                t.abort();
            }
        }

        if !inner.gather.running {
            return;
        }

        let terminal = inner.gather.finish_on_key == Some(digit);
        if !terminal {
            inner.gather.collected.push(digit);
        }
        let length_reached = inner.gather.finish_on_key.is_none()
            && inner.gather.collected.len() >= inner.gather.num_digits.max(1);

        if terminal || length_reached {
            inner.gather.running = false;
            if let Some(t) = inner.gather.timer.take() {
                t.abort();
            }
            let url = inner.gather.next_action_url.clone().unwrap_or_default();
            let digits = inner.gather.collected.clone();
            let params = vec![("Digits".to_string(), digits)];

            if self.load_actions_into(&mut inner, &url, &params).await.is_err() {
                destroy_locked(&mut inner);
                drop(inner);
                self.finish_destroy().await;
                return;
            }
            let became_destroyed = self.run_next_loop(&mut inner).await;
            drop(inner);
            if became_destroyed {
                self.finish_destroy().await;
            }
        }
    }

    /// `playback_finished(pb_id)`. Late/duplicate events for a
    /// playback that is no longer current are dropped (the demux also
    /// dedupes by `playback_id`, this is a second, cheaper guard).
    pub async fn on_playback_finished(self: &Arc<Self>, playback_id: &str) {
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return;
        }
        if !playback_id.is_empty() && inner.playback.id.as_deref() != Some(playback_id) {
            return;
        }

        inner.playback.playing = false;
        if let Some(t) = inner.post_playback_timer.take() {
            t.abort();
        }

        if let Some(pending) = inner.pending_next.take() {
            if self.load_actions_into(&mut inner, &pending.url, &pending.params).await.is_err() {
                destroy_locked(&mut inner);
                drop(inner);
                self.finish_destroy().await;
                return;
            }
            let became_destroyed = self.run_next_loop(&mut inner).await;
            drop(inner);
            if became_destroyed {
                self.finish_destroy().await;
            }
        } else if inner.gather.running {
            let timeout_s = inner.gather.timeout_s;
            inner.gather.timer = Some(self.spawn_gather_timer(timeout_s));
        } else if inner.remaining_actions.is_empty() {
            let timeout = inner.last_play_timeout;
            inner.post_playback_timer = Some(self.spawn_post_playback_timer(timeout));
        } else {
            let became_destroyed = self.run_next_loop(&mut inner).await;
            drop(inner);
            if became_destroyed {
                self.finish_destroy().await;
            }
        }
    }

    /// External steering (`ValidationEndpoint`): hot-swap the action
    /// script under the running session, overriding whatever it was
    /// waiting on.
    pub async fn set_action(self: &Arc<Self>, url: &str, params: &[(String, String)]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return Ok(());
        }
        if let Some(t) = inner.post_playback_timer.take() {
            t.abort();
        }
        if self.load_actions_into(&mut inner, url, params).await.is_err() {
            destroy_locked(&mut inner);
            drop(inner);
            self.finish_destroy().await;
            return Ok(());
        }
        let became_destroyed = self.run_next_loop(&mut inner).await;
        drop(inner);
        if became_destroyed {
            self.finish_destroy().await;
        }
        Ok(())
    }

    /// Idempotent. Cancels all timers and best-effort hangs up the PBX
    /// channel (a 404 there is silent -- the channel is already gone).
    pub async fn destroy(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return;
        }
        destroy_locked(&mut inner);
        drop(inner);
        self.finish_destroy().await;
    }

    async fn finish_destroy(self: &Arc<Self>) {
        let _ = self.pbx.hangup(&self.channel_id).await;
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(&self.channel_id);
        }
    }

    pub async fn is_destroyed(&self) -> bool {
        self.inner.lock().await.destroyed
    }

    pub async fn is_answered(&self) -> bool {
        self.inner.lock().await.answered_at.is_some()
    }

    /// Wall-clock seconds since `stasis_entered` answered this channel,
    /// for the `callDuration` field of the terminal push message. `None`
    /// if the channel was never answered (e.g. it hung up while ringing).
    pub async fn call_duration_secs(&self) -> Option<u64> {
        self.inner.lock().await.answered_at.map(|t| t.elapsed().as_secs())
    }

    pub async fn is_gathering(&self) -> bool {
        self.inner.lock().await.gather.running
    }

    async fn load_actions_into(
        self: &Arc<Self>,
        inner: &mut Inner,
        url: &str,
        params: &[(String, String)],
    ) -> Result<()> {
        let full_url = build_action_url(url, &self.channel_id, params)?;
        tracing::debug!(channel_id = %self.channel_id, url = %full_url, "loading actions");

        let resp = self
            .http
            .get(&full_url)
            .send()
            .await
            .map_err(|e| OrchestratorError::TimeoutFetch { what: e.to_string() })?;
        let body = resp.text().await.map_err(|e| OrchestratorError::Parse { reason: e.to_string() })?;
        let parsed = parse_actions(&body)?;
        inner.remaining_actions = parsed.into_iter().collect();
        Ok(())
    }
}

fn now_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Merge `params` into `url`'s query string and, unless it already
/// carries `uuid=`, append `uuid=<channel_id>`. Pure and therefore
/// directly testable for the idempotency property the spec calls out:
/// calling this twice with the same `url`/`params` yields the same
/// query regardless of whether `uuid=` was already present.
fn build_action_url(url: &str, channel_id: &str, params: &[(String, String)]) -> Result<String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|e| OrchestratorError::Parse { reason: e.to_string() })?;
    let had_uuid = parsed.query_pairs().any(|(k, _)| k == "uuid");
    {
        let mut qp = parsed.query_pairs_mut();
        for (k, v) in params {
            qp.append_pair(k, v);
        }
        if !had_uuid {
            qp.append_pair("uuid", channel_id);
        }
    }
    Ok(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_action_url_appends_uuid_once() {
        let a = build_action_url("http://x/action/gather", "chan-1", &[]).unwrap();
        assert!(a.contains("uuid=chan-1"));
        let b = build_action_url("http://x/action/gather?uuid=chan-1", "chan-1", &[]).unwrap();
        assert_eq!(a.matches("uuid=").count(), 1);
        assert_eq!(b.matches("uuid=").count(), 1);
    }

    #[test]
    fn build_action_url_is_idempotent_regardless_of_uuid_presence() {
        let with_digits = |uuid_present: bool| {
            let base = if uuid_present { "http://x/action/gather?uuid=chan-1" } else { "http://x/action/gather" };
            build_action_url(base, "chan-1", &[("Digits".to_string(), "123".to_string())]).unwrap()
        };
        let a = with_digits(true);
        let b = with_digits(false);
        let mut a_parsed: Vec<_> = reqwest::Url::parse(&a).unwrap().query_pairs().into_owned().collect();
        let mut b_parsed: Vec<_> = reqwest::Url::parse(&b).unwrap().query_pairs().into_owned().collect();
        a_parsed.sort();
        b_parsed.sort();
        assert_eq!(a_parsed, b_parsed);
    }
}
