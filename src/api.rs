//! Request/response layer.
//!
//! Everything the engine needs from the conventional HTTP side of the
//! backend: bulk fetches for the two collections and the credential
//! refresh exchange. The server answers every call with a uniform
//! `{success, data, error}` envelope.
//!
//! [`DataApi`] is the seam the rest of the engine is written against;
//! [`HttpApi`] is the reqwest-backed implementation.

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::credential::Credential;
use crate::error::ApiError;
use crate::models::{Conversation, Message};

/// Uniform response envelope used by every request/response call.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(default)]
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    /// Unwrap the envelope into its payload or the server's error text.
    pub fn into_result(self) -> Result<T, ApiError> {
        if self.success {
            self.data
                .ok_or_else(|| ApiError::MalformedResponse("success without data".into()))
        } else {
            Err(ApiError::Rejected(
                self.error.unwrap_or_else(|| "unknown error".into()),
            ))
        }
    }
}

/// The request/response collaborator the engine talks to.
#[async_trait]
pub trait DataApi: Send + Sync {
    /// Authoritative bulk fetch of the conversation list for an account.
    async fn conversations(&self, account_id: &str) -> Result<Vec<Conversation>, ApiError>;

    /// Authoritative bulk fetch of the message list for a conversation.
    async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, ApiError>;

    /// Exchange a refresh token for a fresh credential pair.
    async fn refresh_credential(&self, refresh_token: &str) -> Result<Credential, ApiError>;
}

/// HTTP implementation of [`DataApi`].
pub struct HttpApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpApi {
    /// Create a client against `base_url` (e.g. `https://api.example.com`).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get_enveloped<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ApiError::RequestFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ApiError::RequestFailed(format!("HTTP {}", resp.status())));
        }
        let envelope: Envelope<T> = resp
            .json()
            .await
            .map_err(|e| ApiError::MalformedResponse(e.to_string()))?;
        envelope.into_result()
    }
}

#[async_trait]
impl DataApi for HttpApi {
    async fn conversations(&self, account_id: &str) -> Result<Vec<Conversation>, ApiError> {
        self.get_enveloped(&format!("/conversations?account_id={account_id}"))
            .await
    }

    async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, ApiError> {
        self.get_enveloped(&format!("/messages?conversation_id={conversation_id}"))
            .await
    }

    async fn refresh_credential(&self, refresh_token: &str) -> Result<Credential, ApiError> {
        let url = format!("{}/auth/refresh", self.base_url);
        let body = serde_json::json!({ "refresh_token": refresh_token });
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::RequestFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ApiError::RequestFailed(format!("HTTP {}", resp.status())));
        }
        let envelope: Envelope<Credential> = resp
            .json()
            .await
            .map_err(|e| ApiError::MalformedResponse(e.to_string()))?;
        envelope.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_success() {
        let json = r#"{"success": true, "data": 42}"#;
        let envelope: Envelope<u32> = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.into_result().unwrap(), 42);
    }

    #[test]
    fn test_envelope_failure_carries_server_error() {
        let json = r#"{"success": false, "error": "no such account"}"#;
        let envelope: Envelope<u32> = serde_json::from_str(json).unwrap();
        match envelope.into_result() {
            Err(ApiError::Rejected(msg)) => assert_eq!(msg, "no such account"),
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn test_envelope_success_without_data_is_malformed() {
        let json = r#"{"success": true}"#;
        let envelope: Envelope<u32> = serde_json::from_str(json).unwrap();
        assert!(matches!(
            envelope.into_result(),
            Err(ApiError::MalformedResponse(_))
        ));
    }
}
