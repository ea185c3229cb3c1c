//! Contracts of the subsystems the queue and connection engines drive.
//!
//! Implementations are passed in as `Arc<dyn Trait>` at construction. None
//! of these methods is called while a manager holds its own lock, so an
//! implementation may call back into either manager.

use std::io;
use std::net::SocketAddr;
use std::path::Path;

use crate::connection::{ConnectionError, ConnectionToken, ReadyConnection};
use crate::hash::{HashTree, TthValue};
use crate::queue::Priority;
use crate::search::Search;
use crate::user::{HintedUser, UserId};

/// Hash tree storage and verification.
pub trait HashStore: Send + Sync {
    /// Leaf block size of a stored tree; `None` when the tree is unknown.
    fn block_size(&self, tth: &TthValue) -> Option<u64>;

    fn store_tree(&self, tree: HashTree);

    /// Hashes `path` against the stored tree of `tth`, one flag per block.
    ///
    /// Runs on a blocking thread.
    fn verify_blocks(&self, path: &Path, tth: &TthValue, size: u64) -> io::Result<Vec<bool>>;
}

pub trait ShareIndex: Send + Sync {
    fn is_shared(&self, tth: &TthValue, name: &str) -> bool;
}

/// Hub membership and identity lookups.
pub trait UserDirectory: Send + Sync {
    fn is_online(&self, user: &UserId) -> bool;

    /// Hubs the user is currently seen on.
    fn online_hubs(&self, user: &UserId) -> Vec<String>;

    fn find_by_nick(&self, hub: &str, nick: &str) -> Option<UserId>;

    /// Expected certificate keyprint, when the hub publishes one.
    fn keyprint(&self, user: &UserId, hub: &str) -> Option<String>;

    fn supports_mcn(&self, user: &UserId) -> bool;

    /// Asks the hub to have `user` connect to us (or us to them) with `token`.
    fn connect(&self, user: &HintedUser, token: &ConnectionToken) -> Result<(), ConnectionError>;
}

/// The transfer layer that runs downloads on ready connections.
pub trait DownloadEngine: Send + Sync {
    /// Whether a new download at `priority` fits the global slot limits.
    fn start_download_allowed(&self, priority: Priority) -> bool;

    fn connection_ready(&self, ready: ReadyConnection);

    fn abort_download(&self, token: &ConnectionToken);
}

/// A request to ask a partial source which blocks it has now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialQuery {
    pub user: HintedUser,
    pub udp: SocketAddr,
    pub tth: TthValue,
    /// Our own `[start, end)` block pairs, offered in return.
    pub parts: Vec<u32>,
}

/// Outbound search traffic.
pub trait SearchSink: Send + Sync {
    fn send_search(&self, search: &Search);

    fn send_partial_query(&self, query: &PartialQuery);
}

/// Control the queue engine needs over live connections.
pub trait ConnectionControl: Send + Sync {
    /// Takes the download connection with `token` out of the running state.
    fn detach_download(&self, token: &ConnectionToken);

    /// Makes sure a download connection to `user` is queued.
    fn request_download(&self, user: &HintedUser, small_slot: bool);
}
