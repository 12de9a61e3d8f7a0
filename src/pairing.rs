//! Pairing session state machine.
//!
//! Drives the device-linking workflow over the bidirectional event
//! channel: request a session, receive a scannable pairing artifact,
//! observe authentication/readiness transitions.
//!
//! The protocol logic lives in [`PairingMachine`], a pure reducer:
//! every transport message is an input, every side effect is a returned
//! [`PairingAction`] for the driver to execute. That keeps the
//! transition table unit-testable without a live channel.
//!
//! ```text
//! disconnected → connecting → {qr_pending ⇄ authenticated} → ready
//!                     │                                        │
//!                     └──────────────→ error ←─────────────────┘
//! ```
//!
//! [`PairingClient`] owns the channel, obtains a valid credential from
//! the guard before connecting, executes actions, and enforces the
//! liveness discipline: teardown happens exactly once no matter how
//! many callbacks are still in flight.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::credential::CredentialGuard;
use crate::error::AuthError;
use crate::protocol::{ChannelErrorCode, ClientEvent, ConnectionState, ServerEvent};
use crate::store::{LocalStore, SESSION_ID_KEY};
use crate::transport::{ChannelConfig, ChannelConnector, ChannelTransport, WsMessage};

/// Observable status of the pairing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    Disconnected,
    Connecting,
    QrPending,
    Authenticated,
    Ready,
    Error,
}

/// Inputs fed into the reducer by the driver.
#[derive(Debug)]
pub enum PairingInput {
    /// The channel opened.
    Connected,
    /// A server event arrived on the channel.
    Server(ServerEvent),
    /// The channel closed or errored.
    Disconnected,
    /// Manual re-request of a pairing artifact (user pressed retry).
    RetryRequested,
    /// Unlink the paired instance and forget the session.
    UnpairRequested,
    /// User-initiated teardown of the session view.
    CancelRequested,
}

/// Side effects returned by the reducer for the driver to execute.
#[derive(Debug, PartialEq)]
pub enum PairingAction {
    /// Send a client event on the channel.
    Send(ClientEvent),
    /// Persist the session id for the resume path.
    PersistSessionId(String),
    /// Forget the persisted session id.
    ClearSessionId,
    /// Clear the persisted credential pair (credential expired).
    ClearCredentials,
    /// Schedule the "session expired" redirect after a short delay.
    ScheduleRedirect,
    /// Schedule the post-ready conversation refetch after the settle
    /// delay.
    ScheduleRefetch,
    /// Surface an observable event.
    Emit(PairingEvent),
}

/// Observable events surfaced to the view-model layer.
#[derive(Debug, Clone, PartialEq)]
pub enum PairingEvent {
    StatusChanged(PairingStatus),
    /// The pairing artifact changed. `None` means it was cleared.
    QrUpdated(Option<String>),
    /// User-visible error text (feed of the `error` status).
    Error(String),
    /// Credential failure: the app must navigate to login.
    RedirectToLogin,
    /// The conversation collection should be (re)fetched.
    RefetchConversations,
}

/// Trait for receiving pairing events.
///
/// Implementors translate events into frontend-specific actions.
pub trait PairingEventHandler: Send + Sync {
    fn on_event(&self, event: PairingEvent);
}

/// Snapshot of the observable session state.
#[derive(Debug, Clone, PartialEq)]
pub struct PairingSnapshot {
    pub status: PairingStatus,
    pub session_id: Option<String>,
    /// Current scannable artifact (data-URI), if one is pending.
    pub qr: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug)]
struct MachineState {
    status: PairingStatus,
    session_id: Option<String>,
    qr: Option<String>,
    error: Option<String>,
}

impl MachineState {
    fn initial() -> Self {
        Self {
            status: PairingStatus::Disconnected,
            session_id: None,
            qr: None,
            error: None,
        }
    }
}

/// Pure pairing state machine: `process(input) -> Vec<PairingAction>`.
pub struct PairingMachine {
    state: Mutex<MachineState>,
}

impl Default for PairingMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PairingMachine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MachineState::initial()),
        }
    }

    /// Seed the machine with a previously persisted session id so the
    /// first `request_qr` takes the resume path.
    pub fn resume_with(&self, session_id: Option<String>) {
        self.state.lock().unwrap().session_id = session_id;
    }

    /// Snapshot of the observable state.
    pub fn snapshot(&self) -> PairingSnapshot {
        let state = self.state.lock().unwrap();
        PairingSnapshot {
            status: state.status,
            session_id: state.session_id.clone(),
            qr: state.qr.clone(),
            error: state.error.clone(),
        }
    }

    /// Process one input and return the actions it implies.
    pub fn process(&self, input: PairingInput) -> Vec<PairingAction> {
        let mut state = self.state.lock().unwrap();
        let mut actions = Vec::new();

        match input {
            PairingInput::Connected => {
                state.error = None;
                set_status(&mut state, &mut actions, PairingStatus::Connecting);
                actions.push(PairingAction::Send(ClientEvent::RequestQr {
                    session_id: state.session_id.clone(),
                }));
            }

            PairingInput::Server(ServerEvent::SessionCreated { session_id }) => {
                log::info!("[PairingMachine] Session created: {session_id}");
                state.session_id = Some(session_id.clone());
                actions.push(PairingAction::PersistSessionId(session_id));
                set_status(&mut state, &mut actions, PairingStatus::QrPending);
            }

            PairingInput::Server(ServerEvent::QrCode { session_id, qr }) => {
                // Each artifact replaces the prior one and re-identifies
                // the session.
                if state.session_id.as_deref() != Some(session_id.as_str()) {
                    state.session_id = Some(session_id.clone());
                    actions.push(PairingAction::PersistSessionId(session_id));
                }
                state.qr = Some(qr.clone());
                actions.push(PairingAction::Emit(PairingEvent::QrUpdated(Some(qr))));
                set_status(&mut state, &mut actions, PairingStatus::QrPending);
            }

            PairingInput::Server(ServerEvent::ConnectionStatus { status, .. }) => {
                self.apply_connection_status(&mut state, &mut actions, status);
            }

            PairingInput::Server(ServerEvent::Error { code, message }) => {
                self.apply_channel_error(&mut state, &mut actions, code, message);
            }

            PairingInput::Server(ServerEvent::Other) => {
                log::debug!("[PairingMachine] Ignoring unknown server event");
            }

            PairingInput::Disconnected => {
                log::info!("[PairingMachine] Channel disconnected");
                clear_qr(&mut state, &mut actions);
                set_status(&mut state, &mut actions, PairingStatus::Disconnected);
            }

            PairingInput::RetryRequested => match state.status {
                PairingStatus::QrPending | PairingStatus::Error => {
                    actions.push(PairingAction::Send(ClientEvent::RequestQr {
                        session_id: state.session_id.clone(),
                    }));
                }
                status => {
                    log::debug!("[PairingMachine] Retry ignored in {status:?}");
                }
            },

            PairingInput::UnpairRequested => {
                if let Some(session_id) = state.session_id.take() {
                    actions.push(PairingAction::Send(ClientEvent::DisconnectInstance {
                        session_id,
                    }));
                    actions.push(PairingAction::ClearSessionId);
                }
                clear_qr(&mut state, &mut actions);
                state.error = None;
                set_status(&mut state, &mut actions, PairingStatus::Disconnected);
            }

            PairingInput::CancelRequested => {
                clear_qr(&mut state, &mut actions);
                state.error = None;
                set_status(&mut state, &mut actions, PairingStatus::Disconnected);
            }
        }

        actions
    }

    fn apply_connection_status(
        &self,
        state: &mut MachineState,
        actions: &mut Vec<PairingAction>,
        status: ConnectionState,
    ) {
        match status {
            ConnectionState::Connecting => {
                set_status(state, actions, PairingStatus::Connecting);
            }
            ConnectionState::Qr => {
                set_status(state, actions, PairingStatus::QrPending);
            }
            ConnectionState::Authenticated => {
                // The artifact is no longer meaningful once scanned.
                clear_qr(state, actions);
                set_status(state, actions, PairingStatus::Authenticated);
            }
            ConnectionState::Ready => {
                clear_qr(state, actions);
                if state.status != PairingStatus::Ready {
                    set_status(state, actions, PairingStatus::Ready);
                    // One settle delay, then refetch conversations.
                    actions.push(PairingAction::ScheduleRefetch);
                }
            }
            ConnectionState::Disconnected => {
                clear_qr(state, actions);
                set_status(state, actions, PairingStatus::Disconnected);
            }
            ConnectionState::AuthFailure | ConnectionState::Error => {
                let message = if status == ConnectionState::AuthFailure {
                    "device authentication failed"
                } else {
                    "connection error"
                };
                clear_qr(state, actions);
                state.error = Some(message.to_string());
                actions.push(PairingAction::Emit(PairingEvent::Error(message.into())));
                set_status(state, actions, PairingStatus::Error);
            }
        }
    }

    fn apply_channel_error(
        &self,
        state: &mut MachineState,
        actions: &mut Vec<PairingAction>,
        code: ChannelErrorCode,
        message: String,
    ) {
        clear_qr(state, actions);
        match code {
            ChannelErrorCode::TokenExpired => {
                // Credential failures propagate to a redirect,
                // independent of the current pairing status.
                log::warn!("[PairingMachine] Credential expired: {message}");
                let text = if message.is_empty() {
                    "session expired".to_string()
                } else {
                    message
                };
                state.error = Some(text.clone());
                actions.push(PairingAction::ClearCredentials);
                actions.push(PairingAction::Emit(PairingEvent::Error(text)));
                actions.push(PairingAction::ScheduleRedirect);
            }
            ChannelErrorCode::InstanceLimitExceeded => {
                log::warn!("[PairingMachine] Instance limit exceeded: {message}");
                state.error = Some(message.clone());
                actions.push(PairingAction::Emit(PairingEvent::Error(message)));
            }
            ChannelErrorCode::Other => {
                log::error!("[PairingMachine] Channel error: {message}");
                state.error = Some(message.clone());
                actions.push(PairingAction::Emit(PairingEvent::Error(message)));
            }
        }
        set_status(state, actions, PairingStatus::Error);
    }
}

fn set_status(state: &mut MachineState, actions: &mut Vec<PairingAction>, status: PairingStatus) {
    if state.status != status {
        state.status = status;
        actions.push(PairingAction::Emit(PairingEvent::StatusChanged(status)));
    }
}

fn clear_qr(state: &mut MachineState, actions: &mut Vec<PairingAction>) {
    if state.qr.take().is_some() {
        actions.push(PairingAction::Emit(PairingEvent::QrUpdated(None)));
    }
}

/// Commands sent to a running [`PairingClient`].
#[derive(Debug)]
enum PairingCommand {
    Retry,
    Unpair,
    Shutdown,
}

/// Timing configuration for the pairing driver.
#[derive(Debug, Clone)]
pub struct PairingClientConfig {
    /// Channel endpoint; the driver attaches the credential itself.
    pub channel: ChannelConfig,
    /// Delay between reaching `ready` and the conversation refetch,
    /// allowing server-side propagation to settle.
    pub settle_delay: Duration,
    /// Delay before the redirect signal after a credential failure,
    /// so the "session expired" message is visible.
    pub redirect_delay: Duration,
    /// Keepalive ping interval while connected.
    pub ping_interval: Duration,
}

impl PairingClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            channel: ChannelConfig::new(server_url),
            settle_delay: Duration::from_secs(2),
            redirect_delay: Duration::from_millis(1500),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// Driver that owns the pairing channel and executes reducer actions.
pub struct PairingClient<C: ChannelConnector> {
    config: PairingClientConfig,
    connector: C,
    guard: Arc<CredentialGuard>,
    store: Arc<dyn LocalStore>,
    handler: Arc<dyn PairingEventHandler>,
    machine: Arc<PairingMachine>,
    running: Arc<AtomicBool>,
    cmd_tx: mpsc::UnboundedSender<PairingCommand>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<PairingCommand>>>,
}

impl<C: ChannelConnector> PairingClient<C> {
    pub fn new(
        config: PairingClientConfig,
        connector: C,
        guard: Arc<CredentialGuard>,
        store: Arc<dyn LocalStore>,
        handler: Arc<dyn PairingEventHandler>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            config,
            connector,
            guard,
            store,
            handler,
            machine: Arc::new(PairingMachine::new()),
            running: Arc::new(AtomicBool::new(false)),
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
        }
    }

    /// Snapshot of the observable session state.
    pub fn snapshot(&self) -> PairingSnapshot {
        self.machine.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Request a fresh pairing artifact (manual retry).
    pub fn retry(&self) {
        let _ = self.cmd_tx.send(PairingCommand::Retry);
    }

    /// Unlink the paired instance and forget the stored session id.
    pub fn unpair(&self) {
        let _ = self.cmd_tx.send(PairingCommand::Unpair);
    }

    /// Tear the session down. Idempotent: only the first call acts,
    /// regardless of how many pending callbacks are in flight.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.cmd_tx.send(PairingCommand::Shutdown);
        }
    }

    /// Run the pairing session until the channel closes or the session
    /// is shut down.
    ///
    /// Credential failures return an error after emitting the redirect
    /// signal; transport failures surface as status text and return
    /// `Ok(())` — they are not errors to the caller.
    pub async fn run(&self) -> Result<(), AuthError> {
        // Never open the channel with a near-expiry token.
        let credential = match self.guard.ensure_valid().await {
            Ok(credential) => credential,
            Err(e) => {
                log::warn!("[PairingClient] No valid credential: {e}");
                self.handler
                    .on_event(PairingEvent::Error("session expired, redirecting".into()));
                self.schedule_redirect();
                return Err(e);
            }
        };

        // Resume path: hand the stored session id to the machine.
        let resume_id = self.store.get(SESSION_ID_KEY).unwrap_or_default();
        self.machine.resume_with(resume_id);

        let channel_config = self
            .config
            .channel
            .clone()
            .with_auth(credential.access_token);

        let mut transport = match self.connector.connect(&channel_config).await {
            Ok(transport) => transport,
            Err(e) => {
                log::error!("[PairingClient] Channel connect failed: {e}");
                self.handler
                    .on_event(PairingEvent::Error(format!("connection failed: {e}")));
                self.handler
                    .on_event(PairingEvent::StatusChanged(PairingStatus::Disconnected));
                return Ok(());
            }
        };

        log::info!("[PairingClient] Channel open");
        self.running.store(true, Ordering::SeqCst);
        self.execute(&mut transport, self.machine.process(PairingInput::Connected))
            .await;

        let mut cmd_rx = self
            .cmd_rx
            .lock()
            .unwrap()
            .take()
            .expect("PairingClient::run called twice");

        let mut ping_interval = tokio::time::interval(self.config.ping_interval);
        ping_interval.tick().await; // consume the immediate first tick

        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            tokio::select! {
                msg = transport.recv() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            match serde_json::from_str::<ServerEvent>(&text) {
                                Ok(event) => {
                                    let actions =
                                        self.machine.process(PairingInput::Server(event));
                                    self.execute(&mut transport, actions).await;
                                }
                                Err(e) => {
                                    log::debug!("[PairingClient] Unparseable frame: {e}");
                                }
                            }
                        }
                        Some(Ok(WsMessage::Close)) | None => {
                            log::info!("[PairingClient] Channel closed by server");
                            let actions = self.machine.process(PairingInput::Disconnected);
                            self.execute(&mut transport, actions).await;
                            break;
                        }
                        Some(Ok(_)) => {} // ping/pong keepalive
                        Some(Err(e)) => {
                            log::error!("[PairingClient] Channel error: {e}");
                            self.handler.on_event(PairingEvent::Error(e.to_string()));
                            let actions = self.machine.process(PairingInput::Disconnected);
                            self.execute(&mut transport, actions).await;
                            break;
                        }
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(PairingCommand::Retry) => {
                            let actions = self.machine.process(PairingInput::RetryRequested);
                            self.execute(&mut transport, actions).await;
                        }
                        Some(PairingCommand::Unpair) => {
                            let actions = self.machine.process(PairingInput::UnpairRequested);
                            self.execute(&mut transport, actions).await;
                        }
                        Some(PairingCommand::Shutdown) | None => {
                            let actions = self.machine.process(PairingInput::CancelRequested);
                            self.execute(&mut transport, actions).await;
                            break;
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    if let Err(e) = transport.send_ping().await {
                        log::warn!("[PairingClient] Ping failed: {e}");
                        let actions = self.machine.process(PairingInput::Disconnected);
                        self.execute(&mut transport, actions).await;
                        break;
                    }
                }
            }
        }

        // The channel is released here and nowhere else, whatever
        // completion order the in-flight operations had.
        let _ = transport.close().await;
        self.running.store(false, Ordering::SeqCst);
        log::info!("[PairingClient] Session loop exited");
        Ok(())
    }

    async fn execute(&self, transport: &mut C::Transport, actions: Vec<PairingAction>) {
        for action in actions {
            match action {
                PairingAction::Send(event) => match serde_json::to_string(&event) {
                    Ok(text) => {
                        if let Err(e) = transport.send_text(text).await {
                            log::error!("[PairingClient] Send failed: {e}");
                            self.handler.on_event(PairingEvent::Error(e.to_string()));
                        }
                    }
                    Err(e) => log::error!("[PairingClient] Event serialization failed: {e}"),
                },
                PairingAction::PersistSessionId(session_id) => {
                    if let Err(e) = self.store.set(SESSION_ID_KEY, &session_id) {
                        log::error!("[PairingClient] Failed to persist session id: {e}");
                    }
                }
                PairingAction::ClearSessionId => {
                    if let Err(e) = self.store.remove(SESSION_ID_KEY) {
                        log::error!("[PairingClient] Failed to clear session id: {e}");
                    }
                }
                PairingAction::ClearCredentials => {
                    if let Err(e) = self.guard.clear() {
                        log::error!("[PairingClient] Failed to clear credentials: {e}");
                    }
                }
                PairingAction::ScheduleRedirect => {
                    self.schedule_redirect();
                }
                PairingAction::ScheduleRefetch => {
                    let handler = Arc::clone(&self.handler);
                    let running = Arc::clone(&self.running);
                    let delay = self.config.settle_delay;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if running.load(Ordering::SeqCst) {
                            handler.on_event(PairingEvent::RefetchConversations);
                        } else {
                            log::debug!("[PairingClient] Dropping refetch after teardown");
                        }
                    });
                }
                PairingAction::Emit(event) => {
                    self.handler.on_event(event);
                }
            }
        }
    }

    /// Redirects fire even through teardown: a credential failure must
    /// reach the login screen.
    fn schedule_redirect(&self) {
        let handler = Arc::clone(&self.handler);
        let delay = self.config.redirect_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handler.on_event(PairingEvent::RedirectToLogin);
        });
    }
}
