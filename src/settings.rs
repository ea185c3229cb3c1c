//! Runtime configuration.
//!
//! Every manager takes its own sub-struct by value at construction. All
//! structs implement `Default` with the values shipped to users and offer
//! builder-style `with_*` setters for the knobs callers change most.
//!
//! ```
//! use dcflow::{AutoPriorityMode, QueueSettings, Settings};
//!
//! let settings = Settings {
//!     queue: QueueSettings::default()
//!         .with_auto_priority(AutoPriorityMode::Balanced)
//!         .with_manual_segments(4),
//!     ..Settings::default()
//! };
//! assert_eq!(settings.queue.manual_segments, Some(4));
//! ```

use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;

use crate::constants::{
    DEFAULT_CHUNK_SIZE, MAX_SEGMENTS, RECONNECT_BACKOFF, CONNECT_TIMEOUT, SMALL_FILE_SIZE,
    TARGET_SEGMENT_DURATION,
};

/// How auto-priority items and bundles are re-ranked each minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoPriorityMode {
    /// Auto-priority flags are kept but nothing is recalculated.
    Disabled,
    /// Each entry is ranked on its own downloaded fraction and age.
    #[default]
    Progress,
    /// Entries are ranked against each other by speed and source count.
    Balanced,
}

/// When a new source may duplicate a range another source is still fetching.
///
/// Overlap only kicks in for a segment that has been running at least
/// `min_running`, still needs more than `min_seconds_left`, and that the
/// requesting peer is projected to finish `speedup_factor` times faster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlapPolicy {
    pub enabled: bool,
    pub min_running: Duration,
    pub min_seconds_left: u64,
    pub speedup_factor: f64,
    /// Compare against the requesting peer's speed; when false the
    /// existing downloader's own projection alone decides.
    pub use_requester_speed: bool,
}

impl Default for OverlapPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_running: Duration::from_secs(2),
            min_seconds_left: 10,
            speedup_factor: 2.0,
            use_requester_speed: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Files at or below this size default to highest priority (0 = off).
    pub prio_highest_size: u64,
    pub prio_high_size: u64,
    pub prio_normal_size: u64,
    pub prio_low_size: u64,
    /// Filenames matching this pattern are queued at high priority.
    pub high_prio_files: Option<Regex>,
    /// Flat segment count instead of the size table.
    pub manual_segments: Option<u8>,
    pub multi_segment: bool,
    pub overlap: OverlapPolicy,
    pub target_segment_duration: Duration,
    pub default_chunk_size: u64,
    pub small_file_size: u64,
    pub auto_priority: AutoPriorityMode,
    /// Items with at least this many online sources are not auto-searched.
    pub auto_search_source_limit: usize,
    /// Bundles added within this window are searched from the recent bucket.
    pub recent_bundle_window: Duration,
    /// Floor for the interval between normal auto-searches.
    pub auto_search_interval: Duration,
    pub auto_search: bool,
    /// Directory new temp files are created in; `None` keeps them next to
    /// the target.
    pub temp_directory: Option<PathBuf>,
    pub queue_file: Option<PathBuf>,
    /// Directory downloaded file lists are written to.
    pub file_list_directory: PathBuf,
    pub partial_sharing: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            prio_highest_size: 64 * 1024,
            prio_high_size: 0,
            prio_normal_size: 0,
            prio_low_size: 0,
            high_prio_files: None,
            manual_segments: None,
            multi_segment: true,
            overlap: OverlapPolicy::default(),
            target_segment_duration: TARGET_SEGMENT_DURATION,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            small_file_size: SMALL_FILE_SIZE,
            auto_priority: AutoPriorityMode::default(),
            auto_search_source_limit: 5,
            recent_bundle_window: Duration::from_secs(24 * 60 * 60),
            auto_search_interval: Duration::from_secs(5 * 60),
            auto_search: true,
            temp_directory: None,
            queue_file: None,
            file_list_directory: PathBuf::from("FileLists"),
            partial_sharing: true,
        }
    }
}

impl QueueSettings {
    pub fn with_auto_priority(mut self, mode: AutoPriorityMode) -> Self {
        self.auto_priority = mode;
        self
    }

    pub fn with_manual_segments(mut self, segments: u8) -> Self {
        self.manual_segments = Some(segments.clamp(1, MAX_SEGMENTS));
        self
    }

    pub fn with_high_prio_files(mut self, pattern: Regex) -> Self {
        self.high_prio_files = Some(pattern);
        self
    }

    pub fn with_overlap(mut self, overlap: OverlapPolicy) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_queue_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.queue_file = Some(path.into());
        self
    }

    pub fn with_temp_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.temp_directory = Some(path.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// New connection queue items attempted per tick without throttling.
    pub first_attempt_burst: usize,
    /// Retries issued per tick (0 = unlimited).
    pub attempts_per_tick: usize,
    pub reconnect_backoff: Duration,
    pub connect_timeout: Duration,
    /// Local cap on simultaneous download connections per peer.
    pub slots_per_user: usize,
    pub multi_connection: bool,
    pub nick: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            first_attempt_burst: 16,
            attempts_per_tick: 2,
            reconnect_backoff: RECONNECT_BACKOFF,
            connect_timeout: CONNECT_TIMEOUT,
            slots_per_user: 3,
            multi_connection: true,
            nick: "dcflow".into(),
        }
    }
}

impl ConnectionSettings {
    pub fn with_slots_per_user(mut self, slots: usize) -> Self {
        self.slots_per_user = slots;
        self
    }

    pub fn with_attempts_per_tick(mut self, attempts: usize) -> Self {
        self.attempts_per_tick = attempts;
        self
    }

    pub fn with_nick(mut self, nick: impl Into<String>) -> Self {
        self.nick = nick.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct SearchSettings {
    /// Global floor for the spacing between outgoing searches.
    pub min_interval: Duration,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(10),
        }
    }
}

impl SearchSettings {
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub queue: QueueSettings,
    pub connection: ConnectionSettings,
    pub search: SearchSettings,
}
