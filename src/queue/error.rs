use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by queue operations.
///
/// None of these leave the queue in a partially modified state.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A different file (size or content hash) is already queued there.
    #[error("a different file is already queued at {0}")]
    DuplicateTarget(String),

    #[error("{0} has already finished downloading")]
    AlreadyFinished(String),

    #[error("source is already queued for {0}")]
    DuplicateSource(String),

    #[error("target path is too long: {0} bytes")]
    TargetTooLong(usize),

    #[error("invalid target path: {0}")]
    InvalidTarget(String),

    #[error("file is already shared: {0}")]
    AlreadyShared(String),

    #[error("zero-byte files are not queued")]
    ZeroSize,

    #[error("queue item not found")]
    NotFound,

    #[error("bundle not found")]
    BundleNotFound,

    #[error("no such running download")]
    UnknownDownload,

    /// Block verification needs the item's hash tree.
    #[error("hash tree of {0} is not available")]
    TreeUnavailable(String),

    #[error("{0} is being downloaded")]
    Running(String),

    #[error("queue file {path}: {reason}")]
    Persistence { path: PathBuf, reason: String },
}

/// Why no segment could be handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SegmentError {
    /// A partial source has none of the blocks we still need.
    #[error("source has no needed parts")]
    NoNeededParts,

    /// Every remaining block is done or claimed by a running download.
    #[error("no free block")]
    NoFreeBlock,

    /// The file fits a single segment and that segment is running.
    #[error("file too small for segmented download")]
    FileTooSmallToSegment,

    /// The item already runs its maximum number of segments.
    #[error("segment limit reached")]
    SegmentLimitReached,

    /// Nothing at or above the requested priority can be downloaded.
    #[error("no files available")]
    NoFilesAvailable,
}
