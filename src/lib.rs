//! # Pairsync
//!
//! Client-resident synchronization engine for a paired messaging
//! account. Keeps a local mirror live against a remote backend over
//! three cooperating layers:
//!
//! - **Credential lifecycle**: [`CredentialGuard`] decodes JWT expiry
//!   locally and refreshes before any near-expiry token is used.
//! - **Pairing session**: [`PairingMachine`] / [`PairingClient`] drive
//!   the device-linking workflow over a bidirectional event channel.
//! - **Change-feed sync**: [`Synchronizer`] performs an authoritative
//!   bulk fetch per collection, then folds incremental insert/update/
//!   delete events on top, with generation-tagged liveness so disposed
//!   subscriptions can never mutate newer state.
//!
//! Transports are trait seams ([`ChannelConnector`], [`FeedConnector`])
//! so the protocol logic is testable against channel-backed fakes.

pub mod api;
pub mod collection;
pub mod credential;
pub mod error;
pub mod feed;
pub mod models;
pub mod pairing;
pub mod protocol;
pub mod store;
pub mod synchronizer;
pub mod transport;

pub use api::{DataApi, Envelope, HttpApi};
pub use collection::{CollectionOrder, FoldEvent, SyncedCollection};
pub use credential::{Credential, CredentialGuard};
pub use error::{ApiError, AuthError, StoreError, TransportError};
pub use feed::{
    ChangeEvent, ChangeKind, FeedConfig, FeedConnector, FeedFrame, FeedStatus, FeedTransport,
    WsFeedConnector,
};
pub use models::{Conversation, FeedRecord, Message};
pub use pairing::{
    PairingClient, PairingClientConfig, PairingEvent, PairingEventHandler, PairingMachine,
    PairingSnapshot, PairingStatus,
};
pub use protocol::{ChannelErrorCode, ClientEvent, ConnectionState, ServerEvent};
pub use store::{JsonFileStore, LocalStore, MemoryStore};
pub use synchronizer::{
    CollectionHandle, CollectionKey, CollectionSnapshot, ReconnectConfig, Synchronizer,
    SynchronizerConfig,
};
pub use transport::{ChannelConfig, ChannelConnector, ChannelTransport, TokioConnector};
