//! Error types for the IVR orchestrator.
//!
//! Every fallible operation in this crate returns [`OrchestratorError`].
//! Variants line up one-to-one with the error "Kinds" the system is
//! specified against: bad input, missing records, a saturated queue,
//! an unreachable PBX, a PBX operation that 404s (treated as already
//! gone), an unknown campaign/step, a timed-out outbound fetch, or a
//! malformed response body.
//!
//! # Recovery
//!
//! Not every variant means the same thing to a caller. [`OrchestratorError::is_recoverable`]
//! classifies which ones are worth retrying (a saturated trunk queue, a
//! fetch timeout) versus which ones are terminal for the current
//! operation (an unknown assignment, a malformed body).
//!
//! ```
//! use ivr_orchestrator::error::OrchestratorError;
//!
//! let err = OrchestratorError::QueueFull { trunk_id: "telnyx_1".into() };
//! assert!(err.is_recoverable());
//! assert_eq!(err.category(), "queue_full");
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// A required field was missing or malformed in the request body.
    #[error("bad request: {reason}")]
    BadRequest { reason: String },

    /// An assignment, call, or channel id does not exist.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// The per-trunk origination queue is already at `OriginationQueue::LIMIT`.
    #[error("origination queue full for trunk {trunk_id}")]
    QueueFull { trunk_id: String },

    /// A PBX REST call failed for a reason other than 404.
    #[error("pbx unavailable: {reason}")]
    PbxUnavailable { reason: String },

    /// A PBX REST call returned 404. Treated as "already gone", never
    /// surfaced as a hard failure on its own -- callers match on it to
    /// decide whether to continue silently.
    #[error("pbx resource not found")]
    Pbx404,

    /// The campaign catalog has no entry for the requested campaign or step.
    #[error("catalog miss: {campaign}/{step}")]
    CatalogMiss { campaign: String, step: String },

    /// An outbound HTTP fetch (action script, trunk inventory, catalog)
    /// did not complete within its configured timeout.
    #[error("timed out fetching {what}")]
    TimeoutFetch { what: String },

    /// A response body could not be parsed into the expected shape.
    #[error("parse error: {reason}")]
    Parse { reason: String },
}

impl OrchestratorError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Coarse category string, stable across variant field changes --
    /// useful for metrics/log grouping without matching on the enum.
    pub fn category(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "bad_request",
            Self::NotFound { .. } => "not_found",
            Self::QueueFull { .. } => "queue_full",
            Self::PbxUnavailable { .. } => "pbx_unavailable",
            Self::Pbx404 => "pbx_404",
            Self::CatalogMiss { .. } => "catalog_miss",
            Self::TimeoutFetch { .. } => "timeout_fetch",
            Self::Parse { .. } => "parse_error",
        }
    }

    /// Whether a caller might reasonably retry. Pbx404 is excluded even
    /// though it is "recovered locally" by callers -- recovery there
    /// means "treat as success", not "retry".
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::QueueFull { .. } | Self::TimeoutFetch { .. } | Self::PbxUnavailable { .. })
    }
}

/// JSON error responses for the plain HTTP endpoints. The `/action/*`
/// endpoints never route through this -- they always render XML with a
/// 200, since the PBX can only interpret XML (see `action_engine`).
impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } | Self::Pbx404 | Self::CatalogMiss { .. } => StatusCode::NOT_FOUND,
            Self::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::PbxUnavailable { .. } | Self::TimeoutFetch { .. } => StatusCode::BAD_GATEWAY,
            Self::Parse { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "success": false,
            "error": self.to_string(),
            "category": self.category(),
        });
        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
