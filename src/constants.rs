//! Protocol constants and tuning parameters.
//!
//! This module contains the fixed values used by the queue, connection and
//! search schedulers. Values that users commonly tune live in
//! [`Settings`](crate::Settings) instead; the defaults there refer back to
//! the constants here.

use std::time::Duration;

// ============================================================================
// Identity
// ============================================================================

/// Length in bytes of a Tiger tree root and of a client identity.
pub const HASH_LEN: usize = 24;

/// Length of the base-32 form of a 24-byte value (unpadded).
pub const HASH_BASE32_LEN: usize = 39;

// ============================================================================
// Blocks and segments
// ============================================================================

/// Smallest hash tree block. Files at or below this size have a root-only
/// tree and never need a separate tree download.
pub const MIN_BLOCK_SIZE: u64 = 64 * 1024;

/// Files below this size are never split into more than one segment.
pub const MIN_SEGMENT_FILE_SIZE: u64 = 2 * 1024 * 1024;

/// Upper bound for the automatic segment table and for manual overrides.
pub const MAX_SEGMENTS: u8 = 10;

/// Size table used for automatic segment counts: a file at or above the
/// n-th boundary (in MiB) gets `n + 2` segments.
pub const SEGMENT_SIZE_STEPS_MIB: [u64; 9] = [2, 15, 30, 60, 120, 240, 480, 960, 1920];

/// Payloads at or below this size may use the small-file slot.
pub const SMALL_FILE_SIZE: u64 = 64 * 1024;

/// Default chunk size requested from a peer with no speed history.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Aim for segments that take about this long at the peer's observed speed.
pub const TARGET_SEGMENT_DURATION: Duration = Duration::from_secs(120);

// ============================================================================
// Queue
// ============================================================================

/// Longest accepted target path, in bytes.
pub const MAX_TARGET_LENGTH: usize = 4096;

/// How many recently searched items are skipped by the auto-search picker.
pub const RECENT_SEARCH_RING: usize = 5;

/// Extension used for in-progress temp files.
pub const TEMP_EXTENSION: &str = ".dctmp";

/// Suffix of the backup kept next to the queue file.
pub const BACKUP_SUFFIX: &str = ".bak";

/// Version written to the queue file.
pub const QUEUE_FILE_VERSION: u32 = 2;

// ============================================================================
// Connections
// ============================================================================

/// Base reconnect delay, multiplied by the consecutive error count.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(60);

/// A connection attempt still in CONNECTING after this long is failed.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(50);

/// Read timeout on an established peer connection.
pub const READ_TIMEOUT: Duration = Duration::from_secs(180);

/// Write timeout on an established peer connection.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest protocol line accepted before the peer is considered hostile.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Largest tie-break number sent in a direction negotiation.
pub const MAX_DIRECTION_NUMBER: u32 = 0x7FFF;

/// Inbound expectations are dropped after this long.
pub const EXPECTATION_LIFETIME: Duration = Duration::from_secs(120);

// ============================================================================
// Search
// ============================================================================

/// Minimum spacing after a manual search.
pub const MANUAL_SEARCH_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum spacing after a manual alternate-source search.
pub const ALTERNATE_SEARCH_INTERVAL: Duration = Duration::from_secs(10);

/// Minimum spacing after an automatic alternate-source search.
pub const AUTO_ALTERNATE_SEARCH_INTERVAL: Duration = Duration::from_secs(20);

/// Minimum spacing after a bundle auto-search.
pub const AUTO_SEARCH_INTERVAL: Duration = Duration::from_secs(20);

/// Recent-bundle search spacing for one, two, and three or more bundles.
pub const RECENT_SEARCH_TIERS: [Duration; 3] = [
    Duration::from_secs(15 * 60),
    Duration::from_secs(8 * 60),
    Duration::from_secs(5 * 60),
];

/// Items auto-searched per selected bundle.
pub const ITEMS_PER_BUNDLE_SEARCH: usize = 3;

// ============================================================================
// Partial file sharing
// ============================================================================

/// Items smaller than this are never offered or queried as partial.
pub const PARTIAL_SHARE_MIN_SIZE: u64 = 20 * 1024 * 1024;

/// Partial-availability queries sent per minute.
pub const PFS_QUERIES_PER_MINUTE: usize = 10;

/// Sources with this many unanswered queries are skipped.
pub const PFS_MAX_PENDING_QUERIES: u32 = 10;

/// Delay before the same partial source is queried again.
pub const PFS_REQUERY_INTERVAL: Duration = Duration::from_secs(5 * 60);
