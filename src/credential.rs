//! Credential lifecycle guard.
//!
//! Inspects the locally persisted bearer credential before any transport
//! is opened. A token within the refresh window of its expiry is never
//! handed out; it is exchanged first. The expiry claim is decoded
//! locally from the token's payload segment, no server contact needed.

use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::api::DataApi;
use crate::error::AuthError;
use crate::store::{ACCESS_TOKEN_KEY, LocalStore, REFRESH_TOKEN_KEY};

/// Bearer credential pair: a signed access token with an embedded
/// expiry claim and its refresh companion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
}

impl Credential {
    /// Decode the expiry timestamp embedded in the access token.
    pub fn expires_at(&self) -> Result<DateTime<Utc>, AuthError> {
        decode_expiry(&self.access_token)
    }
}

#[derive(Deserialize)]
struct ExpiryClaim {
    exp: i64,
}

/// Decode the `exp` claim from the payload segment of a signed token.
fn decode_expiry(token: &str) -> Result<DateTime<Utc>, AuthError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| AuthError::InvalidCredential("token has no payload segment".into()))?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| AuthError::InvalidCredential(format!("payload is not base64url: {e}")))?;
    let claim: ExpiryClaim = serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::InvalidCredential(format!("payload is not a claim set: {e}")))?;
    DateTime::from_timestamp(claim.exp, 0)
        .ok_or_else(|| AuthError::InvalidCredential("exp claim out of range".into()))
}

/// Guards the persisted credential against use near expiry.
///
/// `ensure_valid` is idempotent and side-effect-free beyond the store
/// and the refresh endpoint; it never opens a transport itself.
pub struct CredentialGuard {
    store: Arc<dyn LocalStore>,
    api: Arc<dyn DataApi>,
    refresh_window: Duration,
}

impl CredentialGuard {
    /// Tokens closer than this to expiry are refreshed before use.
    pub const DEFAULT_REFRESH_WINDOW_SECS: i64 = 5 * 60;

    pub fn new(store: Arc<dyn LocalStore>, api: Arc<dyn DataApi>) -> Self {
        Self {
            store,
            api,
            refresh_window: Duration::seconds(Self::DEFAULT_REFRESH_WINDOW_SECS),
        }
    }

    /// Override the refresh window (tests, aggressive clients).
    pub fn with_refresh_window(mut self, window: Duration) -> Self {
        self.refresh_window = window;
        self
    }

    /// Return a credential that is safe to hand to a transport.
    ///
    /// Reads the persisted pair, refreshing it first when the access
    /// token is within the refresh window of expiry. Any unrecoverable
    /// outcome clears the persisted pair before returning, so a failed
    /// caller can only redirect to login.
    pub async fn ensure_valid(&self) -> Result<Credential, AuthError> {
        let access_token = match self.store.get(ACCESS_TOKEN_KEY)? {
            Some(token) => token,
            None => return Err(AuthError::Unauthenticated),
        };
        let refresh_token = self.store.get(REFRESH_TOKEN_KEY)?.unwrap_or_default();
        let credential = Credential {
            access_token,
            refresh_token,
        };

        let expires_at = match credential.expires_at() {
            Ok(ts) => ts,
            Err(e) => {
                log::warn!("[CredentialGuard] Stored token undecodable, clearing: {e}");
                self.clear()?;
                return Err(e);
            }
        };

        if expires_at - Utc::now() >= self.refresh_window {
            return Ok(credential);
        }

        log::info!("[CredentialGuard] Token expires at {expires_at}, refreshing");
        match self.api.refresh_credential(&credential.refresh_token).await {
            Ok(fresh) => {
                self.persist(&fresh)?;
                Ok(fresh)
            }
            Err(e) => {
                log::error!("[CredentialGuard] Refresh failed, clearing credentials: {e}");
                self.clear()?;
                Err(AuthError::RefreshFailed(e.to_string()))
            }
        }
    }

    /// Persist a credential pair. Each key is a single atomic replace.
    pub fn persist(&self, credential: &Credential) -> Result<(), AuthError> {
        self.store.set(ACCESS_TOKEN_KEY, &credential.access_token)?;
        self.store
            .set(REFRESH_TOKEN_KEY, &credential.refresh_token)?;
        Ok(())
    }

    /// Clear the persisted credential pair (logout, unrecoverable
    /// auth failure).
    pub fn clear(&self) -> Result<(), AuthError> {
        self.store.remove(ACCESS_TOKEN_KEY)?;
        self.store.remove(REFRESH_TOKEN_KEY)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::DataApi;
    use crate::error::ApiError;
    use crate::models::{Conversation, Message};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Builds an unsigned JWT-shaped token expiring `secs_from_now`
    /// seconds from now.
    fn token_expiring_in(secs_from_now: i64) -> String {
        let exp = (Utc::now() + Duration::seconds(secs_from_now)).timestamp();
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(format!(r#"{{"exp":{exp}}}"#));
        format!("hdr.{payload}.sig")
    }

    struct FakeApi {
        refresh_calls: AtomicUsize,
        refresh_result: Result<Credential, String>,
    }

    impl FakeApi {
        fn refreshing_to(credential: Credential) -> Self {
            Self {
                refresh_calls: AtomicUsize::new(0),
                refresh_result: Ok(credential),
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                refresh_calls: AtomicUsize::new(0),
                refresh_result: Err(message.to_string()),
            }
        }

        fn calls(&self) -> usize {
            self.refresh_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DataApi for FakeApi {
        async fn conversations(&self, _: &str) -> Result<Vec<Conversation>, ApiError> {
            Ok(vec![])
        }

        async fn messages(&self, _: &str) -> Result<Vec<Message>, ApiError> {
            Ok(vec![])
        }

        async fn refresh_credential(&self, _: &str) -> Result<Credential, ApiError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.refresh_result
                .clone()
                .map_err(ApiError::Rejected)
        }
    }

    fn guard_with(
        store: Arc<MemoryStore>,
        api: Arc<FakeApi>,
    ) -> CredentialGuard {
        CredentialGuard::new(store, api)
    }

    #[tokio::test]
    async fn test_missing_credential_is_unauthenticated() {
        let store = Arc::new(MemoryStore::new());
        let api = Arc::new(FakeApi::failing("unused"));
        let guard = guard_with(store, api.clone());

        assert!(matches!(
            guard.ensure_valid().await,
            Err(AuthError::Unauthenticated)
        ));
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn test_fresh_credential_returned_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let api = Arc::new(FakeApi::failing("should not be called"));
        let token = token_expiring_in(10 * 60);
        store.set(ACCESS_TOKEN_KEY, &token).unwrap();
        store.set(REFRESH_TOKEN_KEY, "r1").unwrap();

        let guard = guard_with(store, api.clone());
        let credential = guard.ensure_valid().await.unwrap();

        assert_eq!(credential.access_token, token);
        assert_eq!(credential.refresh_token, "r1");
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn test_expiring_credential_triggers_exactly_one_refresh() {
        let store = Arc::new(MemoryStore::new());
        let fresh = Credential {
            access_token: token_expiring_in(60 * 60),
            refresh_token: "r2".into(),
        };
        let api = Arc::new(FakeApi::refreshing_to(fresh.clone()));
        store.set(ACCESS_TOKEN_KEY, &token_expiring_in(4 * 60)).unwrap();
        store.set(REFRESH_TOKEN_KEY, "r1").unwrap();

        let guard = guard_with(store.clone(), api.clone());
        let credential = guard.ensure_valid().await.unwrap();

        assert_eq!(api.calls(), 1);
        assert_eq!(credential, fresh);
        // New pair persisted.
        assert_eq!(
            store.get(ACCESS_TOKEN_KEY).unwrap(),
            Some(fresh.access_token)
        );
        assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap(), Some("r2".into()));
    }

    #[tokio::test]
    async fn test_refresh_failure_clears_storage() {
        let store = Arc::new(MemoryStore::new());
        let api = Arc::new(FakeApi::failing("refresh token revoked"));
        store.set(ACCESS_TOKEN_KEY, &token_expiring_in(60)).unwrap();
        store.set(REFRESH_TOKEN_KEY, "r1").unwrap();

        let guard = guard_with(store.clone(), api);
        assert!(matches!(
            guard.ensure_valid().await,
            Err(AuthError::RefreshFailed(_))
        ));
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap(), None);
        assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_undecodable_token_clears_storage() {
        let store = Arc::new(MemoryStore::new());
        let api = Arc::new(FakeApi::failing("unused"));
        store.set(ACCESS_TOKEN_KEY, "not-a-jwt").unwrap();

        let guard = guard_with(store.clone(), api.clone());
        assert!(matches!(
            guard.ensure_valid().await,
            Err(AuthError::InvalidCredential(_))
        ));
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap(), None);
        assert_eq!(api.calls(), 0);
    }

    #[test]
    fn test_decode_expiry_rejects_bad_payload() {
        assert!(decode_expiry("a.%%%.c").is_err());
        assert!(decode_expiry("nodots").is_err());
    }
}
