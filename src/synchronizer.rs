//! Change-feed synchronizer.
//!
//! For a collection key (the conversation list, or one conversation's
//! messages), performs one authoritative bulk fetch, then folds the
//! incremental change feed into the in-memory collection.
//!
//! Every subscription carries a liveness flag and a generation tag.
//! Disposal flips the flag synchronously; a later subscription for the
//! same key supersedes the generation. Every asynchronous completion
//! checks both before touching shared state, so no stale callback can
//! ever mutate a newer subscription's collection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;

use crate::api::DataApi;
use crate::collection::{CollectionOrder, FoldEvent, SyncedCollection};
use crate::error::ApiError;
use crate::feed::{
    ChangeEvent, ChangeKind, FeedConfig, FeedConnector, FeedFrame, FeedStatus, FeedTransport,
};
use crate::models::{Conversation, FeedRecord, Message};

/// Identifies one synchronized collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionKey {
    /// The conversation list of an account.
    Conversations { account_id: String },
    /// The message list of one conversation.
    Messages { conversation_id: String },
}

impl CollectionKey {
    /// Table the feed subscription targets.
    pub fn table(&self) -> &'static str {
        match self {
            CollectionKey::Conversations { .. } => "conversations",
            CollectionKey::Messages { .. } => "messages",
        }
    }

    /// Owning-key column for the feed filter.
    pub fn filter_column(&self) -> &'static str {
        match self {
            CollectionKey::Conversations { .. } => "account_id",
            CollectionKey::Messages { .. } => "conversation_id",
        }
    }

    /// Owning-key value for the feed filter.
    pub fn filter_value(&self) -> &str {
        match self {
            CollectionKey::Conversations { account_id } => account_id,
            CollectionKey::Messages { conversation_id } => conversation_id,
        }
    }

    /// Display order of the collection.
    pub fn order(&self) -> CollectionOrder {
        match self {
            CollectionKey::Conversations { .. } => CollectionOrder::NewestFirst,
            CollectionKey::Messages { .. } => CollectionOrder::CreatedAscending,
        }
    }

    fn generation_key(&self) -> String {
        format!("{}:{}", self.table(), self.filter_value())
    }
}

/// Bounded resubscription policy for the change feed.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Whether to automatically resubscribe after a feed error.
    pub enabled: bool,
    /// Maximum number of resubscription attempts.
    pub max_attempts: u32,
    /// Base delay for exponential backoff.
    pub base_delay: Duration,
    /// Cap on the backoff delay.
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Configuration for the synchronizer.
#[derive(Debug, Clone)]
pub struct SynchronizerConfig {
    /// WebSocket endpoint of the change feed.
    pub feed_url: String,
    /// Credential attached to feed subscriptions.
    pub auth_token: Option<String>,
    pub reconnect: ReconnectConfig,
}

impl SynchronizerConfig {
    pub fn new(feed_url: impl Into<String>) -> Self {
        Self {
            feed_url: feed_url.into(),
            auth_token: None,
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_auth(mut self, token: String) -> Self {
        self.auth_token = Some(token);
        self
    }
}

/// Observable snapshot of a synchronized collection.
#[derive(Debug, Clone)]
pub struct CollectionSnapshot<R> {
    /// Records in display order.
    pub records: Vec<R>,
    /// True while the initial bulk fetch is outstanding.
    pub loading: bool,
    /// Error text from a failed bulk fetch, if any. Non-fatal.
    pub error: Option<String>,
    /// Last feed subscription status text, if any. Non-fatal.
    pub feed_status: Option<String>,
}

struct Shared<R: FeedRecord> {
    collection: SyncedCollection<R>,
    loading: bool,
    error: Option<String>,
    feed_status: Option<String>,
}

/// Handle to one live subscription.
///
/// Dropping the handle disposes it.
pub struct CollectionHandle<R: FeedRecord> {
    shared: Arc<Mutex<Shared<R>>>,
    live: Arc<AtomicBool>,
    stop: Arc<Notify>,
    generation: u64,
}

impl<R: FeedRecord> CollectionHandle<R> {
    /// Snapshot of the collection and its status fields.
    pub fn snapshot(&self) -> CollectionSnapshot<R> {
        let shared = self.shared.lock().unwrap();
        CollectionSnapshot {
            records: shared.collection.to_vec(),
            loading: shared.loading,
            error: shared.error.clone(),
            feed_status: shared.feed_status.clone(),
        }
    }

    /// Generation tag of this subscription.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Synchronously mark the subscription inactive and request
    /// transport-level unsubscription. Idempotent; any event that
    /// arrives after this call is dropped by the liveness check.
    pub fn dispose(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            log::info!("[Synchronizer] Disposing subscription (gen {})", self.generation);
            self.stop.notify_one();
        }
    }
}

impl<R: FeedRecord> Drop for CollectionHandle<R> {
    fn drop(&mut self) {
        self.dispose();
    }
}

type FetchFn<R> = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<R>, ApiError>> + Send + Sync>;

/// Synchronizes collections against the bulk-fetch API and the change
/// feed.
pub struct Synchronizer<F: FeedConnector> {
    config: SynchronizerConfig,
    api: Arc<dyn DataApi>,
    connector: Arc<F>,
    // Latest generation per collection key. A new subscribe for a key
    // supersedes all earlier tasks for it.
    generations: Arc<Mutex<HashMap<String, u64>>>,
    next_generation: Arc<Mutex<u64>>,
}

impl<F: FeedConnector + 'static> Synchronizer<F> {
    pub fn new(config: SynchronizerConfig, api: Arc<dyn DataApi>, connector: F) -> Self {
        Self {
            config,
            api,
            connector: Arc::new(connector),
            generations: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Arc::new(Mutex::new(0)),
        }
    }

    /// Subscribe to the conversation list of an account.
    pub fn conversations(&self, account_id: &str) -> CollectionHandle<Conversation> {
        let api = Arc::clone(&self.api);
        let account_id_owned = account_id.to_string();
        let fetch: FetchFn<Conversation> = Arc::new(move || {
            let api = Arc::clone(&api);
            let account_id = account_id_owned.clone();
            Box::pin(async move { api.conversations(&account_id).await })
        });
        self.subscribe(
            CollectionKey::Conversations {
                account_id: account_id.to_string(),
            },
            fetch,
        )
    }

    /// Subscribe to the message list of a conversation.
    pub fn messages(&self, conversation_id: &str) -> CollectionHandle<Message> {
        let api = Arc::clone(&self.api);
        let conversation_id_owned = conversation_id.to_string();
        let fetch: FetchFn<Message> = Arc::new(move || {
            let api = Arc::clone(&api);
            let conversation_id = conversation_id_owned.clone();
            Box::pin(async move { api.messages(&conversation_id).await })
        });
        self.subscribe(
            CollectionKey::Messages {
                conversation_id: conversation_id.to_string(),
            },
            fetch,
        )
    }

    fn subscribe<R>(&self, key: CollectionKey, fetch: FetchFn<R>) -> CollectionHandle<R>
    where
        R: FeedRecord + DeserializeOwned,
    {
        let generation = {
            let mut next = self.next_generation.lock().unwrap();
            *next += 1;
            *next
        };
        self.generations
            .lock()
            .unwrap()
            .insert(key.generation_key(), generation);

        let shared = Arc::new(Mutex::new(Shared {
            collection: SyncedCollection::new(key.order()),
            loading: true,
            error: None,
            feed_status: None,
        }));
        let live = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(Notify::new());

        log::info!(
            "[Synchronizer] Subscribing to {} (gen {generation})",
            key.generation_key()
        );

        let task = CollectionTask {
            key,
            fetch,
            shared: Arc::clone(&shared),
            live: Arc::clone(&live),
            stop: Arc::clone(&stop),
            generation,
            generations: Arc::clone(&self.generations),
            connector: Arc::clone(&self.connector),
            config: self.config.clone(),
        };
        tokio::spawn(task.run());

        CollectionHandle {
            shared,
            live,
            stop,
            generation,
        }
    }
}

/// The background task behind one subscription.
struct CollectionTask<R: FeedRecord, F: FeedConnector> {
    key: CollectionKey,
    fetch: FetchFn<R>,
    shared: Arc<Mutex<Shared<R>>>,
    live: Arc<AtomicBool>,
    stop: Arc<Notify>,
    generation: u64,
    generations: Arc<Mutex<HashMap<String, u64>>>,
    connector: Arc<F>,
    config: SynchronizerConfig,
}

impl<R, F> CollectionTask<R, F>
where
    R: FeedRecord + DeserializeOwned,
    F: FeedConnector,
{
    /// True while this task's subscription is the one allowed to
    /// mutate shared state.
    fn is_current(&self) -> bool {
        if !self.live.load(Ordering::SeqCst) {
            return false;
        }
        let generations = self.generations.lock().unwrap();
        generations.get(&self.key.generation_key()) == Some(&self.generation)
    }

    async fn run(self) {
        // --- Authoritative bulk fetch ---
        if !self.bulk_fetch().await {
            return;
        }

        // --- Feed subscription loop with bounded resubscription ---
        let feed_config = FeedConfig {
            server_url: self.config.feed_url.clone(),
            auth_token: self.config.auth_token.clone(),
            table: self.key.table().to_string(),
            filter_column: self.key.filter_column().to_string(),
            filter_value: self.key.filter_value().to_string(),
        };
        let rc = &self.config.reconnect;
        let mut attempt = 0u32;

        loop {
            if !self.is_current() {
                return;
            }

            if attempt > 0 {
                if !rc.enabled || attempt > rc.max_attempts {
                    log::warn!(
                        "[Synchronizer] Giving up on feed for {} after {} attempts",
                        self.key.generation_key(),
                        attempt - 1
                    );
                    self.set_feed_status(FeedStatus::Closed);
                    return;
                }
                let delay = std::cmp::min(
                    rc.base_delay.saturating_mul(2u32.saturating_pow(attempt - 1)),
                    rc.max_delay,
                );
                log::info!(
                    "[Synchronizer] Resubscribing to {} in {:?} (attempt {}/{})",
                    self.key.generation_key(),
                    delay,
                    attempt,
                    rc.max_attempts
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.stop.notified() => return,
                }
                // Close the gap the dead subscription may have left.
                if !self.bulk_fetch().await {
                    return;
                }
            }

            let mut subscription = tokio::select! {
                result = self.connector.subscribe(&feed_config) => {
                    match result {
                        Ok(subscription) => subscription,
                        Err(e) => {
                            log::error!("[Synchronizer] Feed subscribe failed: {e}");
                            self.set_feed_status(FeedStatus::ChannelError);
                            attempt += 1;
                            continue;
                        }
                    }
                }
                _ = self.stop.notified() => return,
            };

            self.set_feed_status(FeedStatus::Subscribed);

            let outcome = self.pump(&mut subscription).await;
            let _ = subscription.close().await;
            match outcome {
                PumpOutcome::Stopped => return,
                PumpOutcome::Lost => attempt += 1,
            }
        }
    }

    /// Run the bulk fetch and apply it if still current. Returns false
    /// when the task should exit.
    async fn bulk_fetch(&self) -> bool {
        let result = tokio::select! {
            result = (self.fetch)() => result,
            _ = self.stop.notified() => return false,
        };

        if !self.is_current() {
            log::debug!(
                "[Synchronizer] Dropping stale fetch result (gen {})",
                self.generation
            );
            return false;
        }

        let mut shared = self.shared.lock().unwrap();
        shared.loading = false;
        match result {
            Ok(records) => {
                log::info!(
                    "[Synchronizer] Fetched {} records for {}",
                    records.len(),
                    self.key.generation_key()
                );
                shared.error = None;
                shared.collection.replace_all(records);
            }
            Err(e) => {
                // Non-fatal: the feed still opens so future events are
                // not blocked by a transient fetch failure.
                log::error!("[Synchronizer] Bulk fetch failed: {e}");
                shared.error = Some(e.to_string());
            }
        }
        true
    }

    /// Consume frames until the feed is lost or the task is stopped.
    async fn pump(&self, subscription: &mut F::Transport) -> PumpOutcome {
        loop {
            tokio::select! {
                frame = subscription.recv() => {
                    match frame {
                        Some(Ok(FeedFrame::Change(change))) => {
                            if !self.is_current() {
                                log::debug!(
                                    "[Synchronizer] Dropping event for stale gen {}",
                                    self.generation
                                );
                                return PumpOutcome::Stopped;
                            }
                            self.fold(change);
                        }
                        Some(Ok(FeedFrame::Status(status))) => {
                            self.set_feed_status(status);
                            match status {
                                FeedStatus::Subscribed => {}
                                // The fetched collection is retained;
                                // only the subscription is re-established.
                                FeedStatus::ChannelError | FeedStatus::Closed => {
                                    return PumpOutcome::Lost;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            log::error!("[Synchronizer] Feed error: {e}");
                            self.set_feed_status(FeedStatus::ChannelError);
                            return PumpOutcome::Lost;
                        }
                        None => {
                            self.set_feed_status(FeedStatus::Closed);
                            return PumpOutcome::Lost;
                        }
                    }
                }
                _ = self.stop.notified() => return PumpOutcome::Stopped,
            }
        }
    }

    fn fold(&self, change: ChangeEvent) {
        let event = match change.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let value = match change.new {
                    Some(value) => value,
                    None => {
                        log::warn!("[Synchronizer] {:?} event without record", change.kind);
                        return;
                    }
                };
                let record: R = match serde_json::from_value(value) {
                    Ok(record) => record,
                    Err(e) => {
                        log::warn!("[Synchronizer] Undecodable record in event: {e}");
                        return;
                    }
                };
                if change.kind == ChangeKind::Insert {
                    FoldEvent::Insert(record)
                } else {
                    FoldEvent::Update(record)
                }
            }
            ChangeKind::Delete => match change.old {
                Some(old) => FoldEvent::Delete { id: old.id },
                None => {
                    log::warn!("[Synchronizer] Delete event without key");
                    return;
                }
            },
        };
        self.shared.lock().unwrap().collection.fold(event);
    }

    fn set_feed_status(&self, status: FeedStatus) {
        if self.is_current() {
            self.shared.lock().unwrap().feed_status = Some(status.as_str().to_string());
        }
    }
}

enum PumpOutcome {
    /// Disposed or superseded; exit without resubscribing.
    Stopped,
    /// The subscription died; eligible for bounded resubscription.
    Lost,
}
