//! Error taxonomy for the sync engine.
//!
//! Credential failures (`AuthError`) force re-authentication and always
//! propagate to the caller. Transport and feed failures never cross
//! component boundaries as errors — they surface as observable status
//! values on the pairing state or the collection handle instead.

use thiserror::Error;

/// Credential-related failures. All variants mean the caller must
/// redirect to login; the guard has already cleared local storage
/// for the unrecoverable variants.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No credential is persisted locally.
    #[error("not authenticated")]
    Unauthenticated,
    /// The stored token could not be decoded (malformed or missing
    /// expiry claim). Storage has been cleared.
    #[error("stored credential is invalid: {0}")]
    InvalidCredential(String),
    /// The token was near expiry and the refresh exchange failed.
    /// Storage has been cleared.
    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),
    /// The persisted store itself failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the request/response layer.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request never completed (network, DNS, timeout).
    #[error("request failed: {0}")]
    RequestFailed(String),
    /// The server answered with `success: false`.
    #[error("server rejected request: {0}")]
    Rejected(String),
    /// The response body did not match the expected envelope.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// Errors from the bidirectional channel and the change-feed transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// A send on an open connection failed.
    #[error("send failed: {0}")]
    SendFailed(String),
    /// The connection closed unexpectedly.
    #[error("connection closed")]
    Closed,
    /// Any other transport-level error.
    #[error("transport error: {0}")]
    Other(String),
}

/// Errors from the local persisted store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store read failed: {0}")]
    Read(String),
    #[error("store write failed: {0}")]
    Write(String),
}
