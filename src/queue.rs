//! The download queue.
//!
//! Queued files are [`QueueItem`]s, grouped into [`Bundle`]s (one per queued
//! directory, or one per lone file). Three indexes are kept in step under
//! one lock by the [`QueueManager`]:
//!
//! - [`FileQueue`] - items by id, target path and content hash
//! - [`UserQueue`] - per-priority, per-peer scheduling lists plus the
//!   downloads each peer is running
//! - [`BundleQueue`] - bundles by token and directory, plus the auto-search
//!   rotation
//!
//! Downloading is segmented: [`QueueItem::next_segment`] picks the next
//! range a peer should fetch from what is done, what other peers are
//! running and, for partial sources, what the peer actually has.
//!
//! # Examples
//!
//! ```
//! use dcflow::queue::{Segment, SegmentSet};
//!
//! let mut done = SegmentSet::new();
//! done.add(Segment::new(0, 1024), 4096);
//! done.add(Segment::new(1024, 1024), 4096);
//!
//! assert_eq!(done.len(), 1);
//! assert_eq!(done.downloaded_bytes(), 2048);
//! assert!(!done.covers(4096));
//! ```

pub mod auto_priority;
mod block_map;
mod bundle;
mod bundle_queue;
mod error;
mod file_queue;
mod item;
mod manager;
mod persistence;
mod priority;
mod segment;
mod user_queue;
mod worker;

pub use block_map::BlockMap;
pub use bundle::{Bundle, BundleKind, BundleStatus, BundleToken};
pub use bundle_queue::BundleQueue;
pub use error::{QueueError, SegmentError};
pub use file_queue::{
    default_priority, max_segments_for, Added, FileQueue, NewItem, PartialQueryTarget,
};
pub use item::{
    DownloadKind, ItemFlags, PartialSource, QueueItem, QueueItemId, RunningDownload,
    SegmentPolicy, SegmentRequest, Source, SourceFlags,
};
pub use manager::{
    DirectoryFile, DownloadAssignment, DownloadOutcome, DownloadRequest, NewSource, QueueEvent,
    QueueManager,
};
pub use persistence::{LoadedBundle, LoadedItem, LoadedSource};
pub use priority::Priority;
pub use segment::{Segment, SegmentSet};
pub use user_queue::{BlockInfo, NextDownload, NextRequest, UserQueue};
pub use worker::{MoveJob, MoveOutcome, RecheckJob, RecheckResult};

#[cfg(test)]
mod tests;
