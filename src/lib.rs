//! Call-session control plane for an outbound IVR telephony orchestrator.
//!
//! This crate owns trunk assignment, per-trunk origination rate
//! limiting, the PBX event demultiplexer, the per-channel IVR state
//! machine, the campaign-driven action-script responder, OTP-decision
//! steering, and the per-call push notification channel. The HTTP
//! transport, config loading, and logging setup the binary wires
//! together live in [`http`], [`config`], and `main`; everything else
//! here is pure library surface so it can be exercised directly in
//! tests without standing up a server.

pub mod action_engine;
pub mod call_store;
pub mod catalog;
pub mod channel;
pub mod config;
pub mod error;
pub mod http;
pub mod origination_queue;
pub mod pbx;
pub mod push;
pub mod trunk;
pub mod validation;

pub use config::Config;
pub use error::{OrchestratorError, Result};
