//! Error taxonomy for the sync layer.
//!
//! Every failure class has a fixed handling rule:
//!
//! - `TransientTransport`: the transport already retried up to its bound;
//!   fatal for this call only, never session-fatal.
//! - `SessionExpired`: the session has been invalidated; callers must not
//!   retry, the user has to re-authenticate.
//! - `Conflict`: the sync client already re-issued the write once as a
//!   forced overwrite; fatal for this call.
//! - "Not found" is never an error. Lookups return `Ok(None)`.

use thiserror::Error;

/// Errors surfaced by the transport and record-sync layers.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store kept misrouting the request; the bounded backoff schedule
    /// is exhausted.
    #[error("transient transport failure after {attempts} attempts")]
    TransientTransport { attempts: u32 },

    /// The store answered unauthenticated. The session is already
    /// invalidated by the time this is returned.
    #[error("session expired, sign in again")]
    SessionExpired,

    /// The store rejected a write because the supplied change tag is stale.
    /// `server_tag` is the record's current tag when the conflict response
    /// carried one.
    #[error("record conflict, server change tag {server_tag:?}")]
    Conflict { server_tag: Option<String> },

    /// Application-level rejection embedded in an otherwise successful
    /// response body.
    #[error("store rejected the operation: {code}")]
    Rejected { code: String },

    /// Non-2xx HTTP response outside the classes above.
    #[error("store returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The request never produced a response (connect/timeout/TLS).
    #[error("request failed: {0}")]
    Request(String),

    /// The response body did not match the expected shape.
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

impl StoreError {
    /// True for the one class callers may retry themselves by re-invoking
    /// the operation later (the transport already exhausted its own bound).
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::TransientTransport { .. })
    }
}
