//! End-to-end tests of the pairing session over a scripted channel.
//!
//! Everything runs against in-process fakes: a channel-backed transport
//! standing in for the WebSocket, an in-memory store, and a stub data
//! API. The driver, reducer, and credential guard are the real thing.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use tokio::sync::mpsc;

use pairsync::credential::Credential;
use pairsync::error::{ApiError, TransportError};
use pairsync::pairing::{
    PairingClient, PairingClientConfig, PairingEvent, PairingEventHandler, PairingStatus,
};
use pairsync::store::{ACCESS_TOKEN_KEY, LocalStore, MemoryStore, REFRESH_TOKEN_KEY, SESSION_ID_KEY};
use pairsync::transport::{ChannelConfig, ChannelConnector, ChannelTransport, WsMessage};
use pairsync::{Conversation, CredentialGuard, DataApi, Message};

/// Builds an unsigned JWT-shaped token expiring `secs_from_now` seconds
/// from now.
fn token_expiring_in(secs_from_now: i64) -> String {
    let exp = (Utc::now() + chrono::Duration::seconds(secs_from_now)).timestamp();
    let payload =
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
    format!("hdr.{payload}.sig")
}

struct FakeApi {
    refresh_result: Result<Credential, String>,
    refresh_calls: AtomicUsize,
}

impl FakeApi {
    fn never_refreshing() -> Arc<Self> {
        Arc::new(Self {
            refresh_result: Err("refresh not expected".into()),
            refresh_calls: AtomicUsize::new(0),
        })
    }

    fn refreshing_to(credential: Credential) -> Arc<Self> {
        Arc::new(Self {
            refresh_result: Ok(credential),
            refresh_calls: AtomicUsize::new(0),
        })
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
        self.refresh_result.clone().map_err(ApiError::Rejected)
    }
}

/// Channel transport fed by a test-side sender.
struct ScriptChannel {
    rx: mpsc::UnboundedReceiver<WsMessage>,
    sent: Arc<Mutex<Vec<String>>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl ChannelTransport for ScriptChannel {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<WsMessage, TransportError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Test-side view of what the scripted channel saw.
#[derive(Clone)]
struct ChannelProbe {
    sent: Arc<Mutex<Vec<String>>>,
    closes: Arc<AtomicUsize>,
    auth_seen: Arc<Mutex<Option<String>>>,
}

impl ChannelProbe {
    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn auth_seen(&self) -> Option<String> {
        self.auth_seen.lock().unwrap().clone()
    }
}

/// Connector that hands out one scripted channel and records the auth
/// token it was opened with.
struct ScriptConnector {
    rx: Mutex<Option<mpsc::UnboundedReceiver<WsMessage>>>,
    probe: ChannelProbe,
}

impl ScriptConnector {
    fn new() -> (Self, mpsc::UnboundedSender<WsMessage>, ChannelProbe) {
        let (tx, rx) = mpsc::unbounded_channel();
        let probe = ChannelProbe {
            sent: Arc::new(Mutex::new(Vec::new())),
            closes: Arc::new(AtomicUsize::new(0)),
            auth_seen: Arc::new(Mutex::new(None)),
        };
        (
            Self {
                rx: Mutex::new(Some(rx)),
                probe: probe.clone(),
            },
            tx,
            probe,
        )
    }
}

#[async_trait]
impl ChannelConnector for ScriptConnector {
    type Transport = ScriptChannel;

    async fn connect(&self, config: &ChannelConfig) -> Result<Self::Transport, TransportError> {
        *self.probe.auth_seen.lock().unwrap() = config.auth_token.clone();
        match self.rx.lock().unwrap().take() {
            Some(rx) => Ok(ScriptChannel {
                rx,
                sent: Arc::clone(&self.probe.sent),
                closes: Arc::clone(&self.probe.closes),
            }),
            None => Err(TransportError::ConnectionFailed("channel exhausted".into())),
        }
    }
}

/// Records every surfaced event for later assertions.
struct CollectingHandler {
    events: Mutex<Vec<PairingEvent>>,
}

impl CollectingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    fn events(&self) -> Vec<PairingEvent> {
        self.events.lock().unwrap().clone()
    }

    fn has(&self, wanted: &PairingEvent) -> bool {
        self.events.lock().unwrap().iter().any(|e| e == wanted)
    }
}

impl PairingEventHandler for CollectingHandler {
    fn on_event(&self, event: PairingEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn server_frame(json: &str) -> WsMessage {
    WsMessage::Text(json.to_string())
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within timeout");
}

fn fast_config() -> PairingClientConfig {
    let mut config = PairingClientConfig::new("wss://pairing.example.com/channel");
    config.settle_delay = Duration::from_millis(20);
    config.redirect_delay = Duration::from_millis(20);
    config.ping_interval = Duration::from_secs(60);
    config
}

struct Harness {
    client: Arc<PairingClient<ScriptConnector>>,
    store: Arc<MemoryStore>,
    handler: Arc<CollectingHandler>,
    server: mpsc::UnboundedSender<WsMessage>,
    probe: ChannelProbe,
}

fn harness_with(api: Arc<FakeApi>, store: Arc<MemoryStore>) -> Harness {
    let (connector, server, probe) = ScriptConnector::new();
    let handler = CollectingHandler::new();
    let guard = Arc::new(CredentialGuard::new(store.clone(), api));
    let client = Arc::new(PairingClient::new(
        fast_config(),
        connector,
        guard,
        store.clone(),
        handler.clone(),
    ));
    Harness {
        client,
        store,
        handler,
        server,
        probe,
    }
}

fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .set(ACCESS_TOKEN_KEY, &token_expiring_in(60 * 60))
        .unwrap();
    store.set(REFRESH_TOKEN_KEY, "r1").unwrap();
    store
}

#[tokio::test]
async fn test_full_pairing_flow_reaches_ready() {
    let h = harness_with(FakeApi::never_refreshing(), seeded_store());
    let client = Arc::clone(&h.client);
    let task = tokio::spawn(async move { client.run().await });

    // Fresh path: the driver requests an artifact with no session id.
    wait_until(|| !h.probe.sent().is_empty()).await;
    assert_eq!(h.probe.sent()[0], r#"{"type":"request_qr"}"#);

    h.server
        .send(server_frame(r#"{"type":"session_created","session_id":"s1"}"#))
        .unwrap();
    h.server
        .send(server_frame(
            r#"{"type":"qr_code","session_id":"s1","qr":"data:image/png;base64,abc"}"#,
        ))
        .unwrap();
    wait_until(|| h.client.snapshot().qr.is_some()).await;
    assert_eq!(h.client.snapshot().status, PairingStatus::QrPending);
    assert_eq!(h.store.get(SESSION_ID_KEY).unwrap(), Some("s1".into()));

    h.server
        .send(server_frame(
            r#"{"type":"connection_status","session_id":"s1","status":"authenticated"}"#,
        ))
        .unwrap();
    h.server
        .send(server_frame(
            r#"{"type":"connection_status","session_id":"s1","status":"ready"}"#,
        ))
        .unwrap();

    wait_until(|| h.client.snapshot().status == PairingStatus::Ready).await;
    let snapshot = h.client.snapshot();
    assert_eq!(snapshot.qr, None);
    assert_eq!(snapshot.session_id, Some("s1".into()));

    // The refetch fires once, after the settle delay.
    wait_until(|| h.handler.has(&PairingEvent::RefetchConversations)).await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    let refetches = h
        .handler
        .events()
        .iter()
        .filter(|e| matches!(e, PairingEvent::RefetchConversations))
        .count();
    assert_eq!(refetches, 1);

    h.client.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_token_expired_clears_credentials_and_redirects() {
    let h = harness_with(FakeApi::never_refreshing(), seeded_store());
    let client = Arc::clone(&h.client);
    let task = tokio::spawn(async move { client.run().await });

    wait_until(|| h.client.is_running()).await;
    h.server
        .send(server_frame(
            r#"{"type":"error","code":"TOKEN_EXPIRED","message":"jwt expired"}"#,
        ))
        .unwrap();

    wait_until(|| h.client.snapshot().status == PairingStatus::Error).await;
    wait_until(|| h.store.get(ACCESS_TOKEN_KEY).unwrap().is_none()).await;
    assert_eq!(h.store.get(REFRESH_TOKEN_KEY).unwrap(), None);
    assert!(h.handler.has(&PairingEvent::Error("jwt expired".into())));

    // Redirect arrives after the grace delay, through teardown or not.
    wait_until(|| h.handler.has(&PairingEvent::RedirectToLogin)).await;

    h.client.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_instance_limit_surfaces_error_but_keeps_credentials() {
    let h = harness_with(FakeApi::never_refreshing(), seeded_store());
    let client = Arc::clone(&h.client);
    let task = tokio::spawn(async move { client.run().await });

    wait_until(|| h.client.is_running()).await;
    h.server
        .send(server_frame(
            r#"{"type":"error","code":"INSTANCE_LIMIT_EXCEEDED","message":"too many devices"}"#,
        ))
        .unwrap();

    wait_until(|| h.client.snapshot().status == PairingStatus::Error).await;
    assert!(h.handler.has(&PairingEvent::Error("too many devices".into())));
    // Credentials stay usable for a plain retry.
    assert!(h.store.get(ACCESS_TOKEN_KEY).unwrap().is_some());
    assert!(!h.handler.has(&PairingEvent::RedirectToLogin));

    h.client.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_near_expiry_token_is_refreshed_before_connect() {
    let store = seeded_store();
    store
        .set(ACCESS_TOKEN_KEY, &token_expiring_in(2 * 60))
        .unwrap();
    let fresh = Credential {
        access_token: token_expiring_in(60 * 60),
        refresh_token: "r2".into(),
    };
    let api = FakeApi::refreshing_to(fresh.clone());
    let h = harness_with(api.clone(), store);

    let client = Arc::clone(&h.client);
    let task = tokio::spawn(async move { client.run().await });

    wait_until(|| h.client.is_running()).await;
    assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
    // The channel opened with the refreshed token, never the stale one.
    assert_eq!(h.probe.auth_seen(), Some(fresh.access_token.clone()));
    assert_eq!(
        h.store.get(ACCESS_TOKEN_KEY).unwrap(),
        Some(fresh.access_token)
    );

    h.client.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_missing_credential_redirects_without_connecting() {
    let h = harness_with(FakeApi::never_refreshing(), Arc::new(MemoryStore::new()));

    let result = h.client.run().await;
    assert!(result.is_err());
    assert!(!h.client.is_running());
    wait_until(|| h.handler.has(&PairingEvent::RedirectToLogin)).await;
}

#[tokio::test]
async fn test_unpair_forgets_session_and_notifies_server() {
    let store = seeded_store();
    store.set(SESSION_ID_KEY, "s1").unwrap();
    let h = harness_with(FakeApi::never_refreshing(), store);

    let client = Arc::clone(&h.client);
    let task = tokio::spawn(async move { client.run().await });
    wait_until(|| h.client.is_running()).await;

    h.client.unpair();
    wait_until(|| h.store.get(SESSION_ID_KEY).unwrap().is_none()).await;

    let sent = h.probe.sent();
    assert!(
        sent.iter()
            .any(|t| t.contains("disconnect_instance") && t.contains("s1")),
        "sent frames: {sent:?}"
    );
    // Resume path was taken on connect.
    assert!(sent[0].contains(r#""session_id":"s1""#), "first frame: {}", sent[0]);

    h.client.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_closes_channel_once() {
    let h = harness_with(FakeApi::never_refreshing(), seeded_store());
    let client = Arc::clone(&h.client);
    let task = tokio::spawn(async move { client.run().await });
    wait_until(|| h.client.is_running()).await;

    h.client.shutdown();
    h.client.shutdown();
    task.await.unwrap().unwrap();

    assert!(!h.client.is_running());
    assert_eq!(h.probe.closes(), 1);
}

#[tokio::test]
async fn test_server_close_ends_session_cleanly() {
    let h = harness_with(FakeApi::never_refreshing(), seeded_store());
    let client = Arc::clone(&h.client);
    let task = tokio::spawn(async move { client.run().await });
    wait_until(|| h.client.is_running()).await;

    h.server.send(WsMessage::Close).unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(h.client.snapshot().status, PairingStatus::Disconnected);
    assert_eq!(h.probe.closes(), 1);
}
