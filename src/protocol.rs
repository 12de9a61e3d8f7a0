//! Pairing channel wire protocol (JSON over WebSocket text frames).
//!
//! Every transport message is a closed sum type dispatched through the
//! pairing reducer, so the state machine is testable without a live
//! channel.

use serde::{Deserialize, Serialize};

/// Events the client emits on the pairing channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Ask the server for a pairing session. Carries the previously
    /// persisted session id on the resume path, nothing on the fresh
    /// path.
    RequestQr {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Unlink the paired device instance.
    DisconnectInstance { session_id: String },
}

/// Events the server emits on the pairing channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A pairing session exists; the id must be persisted for resume.
    SessionCreated { session_id: String },
    /// A scannable pairing artifact. May arrive repeatedly; each one
    /// replaces the previous artifact and re-identifies the session.
    QrCode {
        session_id: String,
        /// Data-URI image payload.
        qr: String,
    },
    /// Session connectivity changed.
    ConnectionStatus {
        #[serde(default)]
        session_id: Option<String>,
        status: ConnectionState,
    },
    /// Channel-level error.
    Error {
        code: ChannelErrorCode,
        #[serde(default)]
        message: String,
    },
    /// Catch-all for message types this client does not know.
    #[serde(other)]
    Other,
}

/// Connectivity states the server reports for a pairing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Qr,
    Authenticated,
    Ready,
    AuthFailure,
    Error,
}

/// Error codes carried by [`ServerEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ChannelErrorCode {
    /// The credential used to open the channel has expired.
    #[serde(rename = "TOKEN_EXPIRED")]
    TokenExpired,
    /// The account has reached its paired-instance limit.
    #[serde(rename = "INSTANCE_LIMIT_EXCEEDED")]
    InstanceLimitExceeded,
    /// Any other code.
    #[serde(other)]
    Other,
}
