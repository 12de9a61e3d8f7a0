//! Bidirectional event channel transport.
//!
//! [`ChannelTransport`] is the seam the pairing driver is written
//! against; [`TokioChannel`] is the tokio-tungstenite implementation.
//! Tests plug in channel-backed fakes through [`ChannelConnector`].

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::error::TransportError;

/// Configuration for opening a pairing channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket server URL (e.g. `wss://pairing.example.com/channel`).
    pub server_url: String,
    /// Credential supplied as the channel's authentication parameter.
    pub auth_token: Option<String>,
}

impl ChannelConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            auth_token: None,
        }
    }

    /// Set the authentication token.
    pub fn with_auth(mut self, token: String) -> Self {
        self.auth_token = Some(token);
        self
    }

    /// Build the WebSocket URL with query parameters.
    pub fn build_url(&self) -> Result<String, TransportError> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|e| TransportError::ConnectionFailed(format!("invalid URL: {e}")))?;
        if let Some(ref token) = self.auth_token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url.to_string())
    }
}

/// A message received from the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// An open bidirectional event channel.
#[async_trait]
pub trait ChannelTransport: Send {
    /// Send a text frame.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Send a keepalive ping.
    async fn send_ping(&mut self) -> Result<(), TransportError>;

    /// Receive the next message. `None` means the stream ended.
    async fn recv(&mut self) -> Option<Result<WsMessage, TransportError>>;

    /// Close the channel gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Creates channel connections. The seam that lets tests substitute a
/// fake channel for the real WebSocket.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    type Transport: ChannelTransport;

    async fn connect(&self, config: &ChannelConfig) -> Result<Self::Transport, TransportError>;
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`ChannelTransport`] backed by tokio-tungstenite.
pub struct TokioChannel {
    ws: WsStream,
}

impl TokioChannel {
    /// Connect to a WebSocket URL.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(Self { ws })
    }
}

#[async_trait]
impl ChannelTransport for TokioChannel {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.ws
            .send(Message::Ping(vec![].into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<WsMessage, TransportError>> {
        match self.ws.next().await {
            Some(Ok(Message::Text(text))) => Some(Ok(WsMessage::Text(text.to_string()))),
            Some(Ok(Message::Binary(data))) => Some(Ok(WsMessage::Binary(data.to_vec()))),
            Some(Ok(Message::Ping(data))) => Some(Ok(WsMessage::Ping(data.to_vec()))),
            Some(Ok(Message::Pong(data))) => Some(Ok(WsMessage::Pong(data.to_vec()))),
            Some(Ok(Message::Close(_))) => Some(Ok(WsMessage::Close)),
            Some(Ok(Message::Frame(_))) => {
                // Raw frames are not expected; skip.
                Some(Ok(WsMessage::Pong(vec![])))
            }
            Some(Err(e)) => Some(Err(TransportError::Other(e.to_string()))),
            None => None,
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.ws
            .close(None)
            .await
            .map_err(|e| TransportError::Other(e.to_string()))
    }
}

/// Connector that opens [`TokioChannel`] connections.
pub struct TokioConnector;

#[async_trait]
impl ChannelConnector for TokioConnector {
    type Transport = TokioChannel;

    async fn connect(&self, config: &ChannelConfig) -> Result<Self::Transport, TransportError> {
        TokioChannel::connect(&config.build_url()?).await
    }
}
