//! Change-feed transport.
//!
//! A managed subscription to row-level insert/update/delete
//! notifications, filtered to one owning key. [`FeedConnector`] /
//! [`FeedTransport`] form the same trait seam as the pairing channel;
//! [`WsFeedConnector`] is the WebSocket implementation.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::error::TransportError;

/// Configuration for a change-feed subscription: a table plus an
/// equality filter on the owning-key column.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// WebSocket server URL for the feed endpoint.
    pub server_url: String,
    pub auth_token: Option<String>,
    /// Table/collection name to subscribe to.
    pub table: String,
    /// Owning-key column the filter applies to.
    pub filter_column: String,
    /// Owning-key value.
    pub filter_value: String,
}

impl FeedConfig {
    pub fn new(
        server_url: impl Into<String>,
        table: impl Into<String>,
        filter_column: impl Into<String>,
        filter_value: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            auth_token: None,
            table: table.into(),
            filter_column: filter_column.into(),
            filter_value: filter_value.into(),
        }
    }

    pub fn with_auth(mut self, token: String) -> Self {
        self.auth_token = Some(token);
        self
    }

    /// Build the WebSocket URL with the auth token attached.
    pub fn build_url(&self) -> Result<String, TransportError> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|e| TransportError::ConnectionFailed(format!("invalid URL: {e}")))?;
        if let Some(ref token) = self.auth_token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url.to_string())
    }

    /// The subscribe frame sent right after the socket opens.
    pub fn subscribe_frame(&self) -> String {
        serde_json::json!({
            "action": "subscribe",
            "table": self.table,
            "filter": format!("{}=eq.{}", self.filter_column, self.filter_value),
        })
        .to_string()
    }
}

/// Kind of a change-feed mutation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Identity of a record referenced by a delete event. Delete payloads
/// may carry only the key columns, so this is all the fold relies on.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RecordRef {
    pub id: String,
}

/// One mutation event from the feed. `new` is the full row for
/// inserts/updates; `old` identifies the row for deletes.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "eventType")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub new: Option<serde_json::Value>,
    #[serde(default)]
    pub old: Option<RecordRef>,
}

/// Subscription status reported by the feed transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Subscribed,
    ChannelError,
    Closed,
}

impl FeedStatus {
    /// Status text surfaced on the collection handle.
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedStatus::Subscribed => "subscribed",
            FeedStatus::ChannelError => "channel_error",
            FeedStatus::Closed => "closed",
        }
    }
}

/// A parsed frame from the feed.
#[derive(Debug, Clone)]
pub enum FeedFrame {
    Change(ChangeEvent),
    Status(FeedStatus),
}

#[derive(Deserialize)]
struct StatusWire {
    status: FeedStatus,
}

/// Parse a raw text frame into a [`FeedFrame`]. Unknown frames yield
/// `None` and are skipped by callers.
pub fn parse_frame(text: &str) -> Option<FeedFrame> {
    if let Ok(change) = serde_json::from_str::<ChangeEvent>(text) {
        return Some(FeedFrame::Change(change));
    }
    if let Ok(wire) = serde_json::from_str::<StatusWire>(text) {
        return Some(FeedFrame::Status(wire.status));
    }
    None
}

/// An open change-feed subscription.
#[async_trait]
pub trait FeedTransport: Send {
    /// Receive the next frame. `None` means the stream ended.
    async fn recv(&mut self) -> Option<Result<FeedFrame, TransportError>>;

    /// Request transport-level unsubscription and close.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Creates feed subscriptions.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    type Transport: FeedTransport;

    async fn subscribe(&self, config: &FeedConfig) -> Result<Self::Transport, TransportError>;
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// WebSocket-backed feed transport.
pub struct WsFeedTransport {
    ws: WsStream,
}

#[async_trait]
impl FeedTransport for WsFeedTransport {
    async fn recv(&mut self) -> Option<Result<FeedFrame, TransportError>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                    Some(frame) => return Some(Ok(frame)),
                    None => {
                        log::debug!("[WsFeedTransport] Skipping unknown frame: {text}");
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) => return Some(Ok(FeedFrame::Status(FeedStatus::Closed))),
                Some(Ok(_)) => continue, // ping/pong/binary keepalive noise
                Some(Err(e)) => return Some(Err(TransportError::Other(e.to_string()))),
                None => return None,
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Best-effort unsubscribe before the close frame.
        let _ = self
            .ws
            .send(Message::Text(r#"{"action":"unsubscribe"}"#.into()))
            .await;
        self.ws
            .close(None)
            .await
            .map_err(|e| TransportError::Other(e.to_string()))
    }
}

/// Connector that opens [`WsFeedTransport`] subscriptions.
pub struct WsFeedConnector;

#[async_trait]
impl FeedConnector for WsFeedConnector {
    type Transport = WsFeedTransport;

    async fn subscribe(&self, config: &FeedConfig) -> Result<Self::Transport, TransportError> {
        let (mut ws, _response) = connect_async(&config.build_url()?)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        ws.send(Message::Text(config.subscribe_frame().into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(WsFeedTransport { ws })
    }
}
