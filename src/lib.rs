//! dcflow - the transfer core of a Direct Connect client
//!
//! This library implements the download queue, client-to-client connection
//! scheduling and outbound search throttling of an ADC/NMDC file sharing
//! client. Hubs, hashing, sharing and the transfer itself are reached
//! through the collaborator traits in [`services`].
//!
//! # Modules
//!
//! - [`queue`] - Queued files, bundles, segment assignment, persistence
//! - [`connection`] - Connection queue, reconnect scheduler, handshakes
//! - [`search`] - Search queue and auto-search rotation
//! - [`services`] - Collaborator contracts
//! - [`settings`] - Runtime configuration
//! - [`hash`] - Tiger tree hash values
//! - [`user`] - Client identities

pub mod connection;
pub mod constants;
pub mod hash;
pub mod queue;
pub mod search;
pub mod services;
pub mod settings;
pub mod user;
pub mod xml;

pub use connection::{
    ConnectionError, ConnectionEvent, ConnectionManager, ConnectionQueueItem, ConnectionToken,
    CqiState, Direction, ReadyConnection,
};
pub use hash::{HashTree, TthValue};
pub use queue::{
    Bundle, BundleToken, DownloadOutcome, Priority, QueueError, QueueEvent, QueueItem,
    QueueItemId, QueueManager, SegmentError,
};
pub use search::{Search, SearchKind, SearchManager, SearchQueue};
pub use services::{
    ConnectionControl, DownloadEngine, HashStore, PartialQuery, SearchSink, ShareIndex,
    UserDirectory,
};
pub use settings::{
    AutoPriorityMode, ConnectionSettings, OverlapPolicy, QueueSettings, SearchSettings, Settings,
};
pub use user::{HintedUser, UserId};
