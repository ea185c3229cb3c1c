//! Outbound search scheduling.
//!
//! Every producer of searches (manual searches, alternate-source lookups,
//! and bundle auto-search from the queue) feeds one [`SearchQueue`], which
//! spaces searches by kind and merges identical requests. The
//! [`SearchManager`] owns the queue and hands due searches to the
//! [`SearchSink`](crate::services::SearchSink) once a second.
//!
//! Picking *which* bundle to auto-search lives with the bundles in
//! [`BundleQueue`](crate::queue::BundleQueue).

mod manager;
mod queue;

pub use manager::SearchManager;
pub use queue::{FileType, Search, SearchKind, SearchQueue, SizeLimit};
