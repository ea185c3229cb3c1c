use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

use rand::Rng as _;

use super::item::QueueItemId;
use super::priority::Priority;
use crate::user::HintedUser;

/// Stable key of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BundleToken(pub u32);

impl BundleToken {
    pub fn generate() -> Self {
        Self(rand::rng().random())
    }
}

impl fmt::Display for BundleToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleKind {
    /// A single file queued on its own.
    File,
    /// A directory tree; the target ends with a separator.
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleStatus {
    Queued,
    /// Every item finished; waiting for the files to be hashed.
    Downloaded,
    /// Hashing confirmed every file; the bundle is about to be purged.
    Finished,
}

/// A group of queue items scheduled and searched as a unit.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub token: BundleToken,
    pub target: String,
    pub kind: BundleKind,
    pub priority: Priority,
    pub auto_priority: bool,
    /// Unix seconds.
    pub added: u64,
    pub status: BundleStatus,
    pub(crate) items: Vec<QueueItemId>,
    pub(crate) finished: Vec<QueueItemId>,
    pub(crate) finished_bytes: u64,
    pub(crate) size: u64,
    pub(crate) notify: HashSet<HintedUser>,
    pub(crate) recent: bool,
    pub(crate) last_search: Option<Instant>,
}

impl Bundle {
    pub fn new(
        token: BundleToken,
        target: String,
        kind: BundleKind,
        priority: Priority,
        added: u64,
    ) -> Self {
        Self {
            token,
            target,
            kind,
            priority,
            auto_priority: false,
            added,
            status: BundleStatus::Queued,
            items: Vec::new(),
            finished: Vec::new(),
            finished_bytes: 0,
            size: 0,
            notify: HashSet::new(),
            recent: false,
            last_search: None,
        }
    }

    pub fn is_file_bundle(&self) -> bool {
        self.kind == BundleKind::File
    }

    pub fn items(&self) -> &[QueueItemId] {
        &self.items
    }

    pub fn finished_items(&self) -> &[QueueItemId] {
        &self.finished
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn finished_bytes(&self) -> u64 {
        self.finished_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.finished.is_empty()
    }

    pub fn is_paused(&self) -> bool {
        self.priority.is_paused()
    }

    pub fn is_recent(&self) -> bool {
        self.recent
    }

    pub fn notify_recipients(&self) -> impl Iterator<Item = &HintedUser> {
        self.notify.iter()
    }

    /// Re-evaluates the recent flag against the bundle's age.
    pub fn check_recent(&mut self, now_unix: u64, window: Duration) -> bool {
        self.recent = !window.is_zero() && self.added + window.as_secs() > now_unix;
        self.recent
    }

    pub(crate) fn add_item(&mut self, id: QueueItemId, size: u64) {
        if !self.items.contains(&id) {
            self.items.push(id);
            self.size += size;
        }
    }

    pub(crate) fn remove_item(&mut self, id: QueueItemId, size: u64) -> bool {
        let before = self.items.len();
        self.items.retain(|i| *i != id);
        let removed = self.items.len() != before;
        if removed {
            self.size = self.size.saturating_sub(size);
        }
        removed
    }

    pub(crate) fn mark_finished(&mut self, id: QueueItemId, size: u64) {
        self.items.retain(|i| *i != id);
        if !self.finished.contains(&id) {
            self.finished.push(id);
            self.finished_bytes += size;
        }
        if self.items.is_empty() {
            self.status = BundleStatus::Downloaded;
        }
    }

    pub(crate) fn remove_finished(&mut self, id: QueueItemId, size: u64) {
        let before = self.finished.len();
        self.finished.retain(|i| *i != id);
        if self.finished.len() != before {
            self.finished_bytes = self.finished_bytes.saturating_sub(size);
            self.size = self.size.saturating_sub(size);
        }
    }

    /// True when `path` lies inside this directory bundle.
    pub fn contains_path(&self, path: &str) -> bool {
        match self.kind {
            BundleKind::File => self.target.eq_ignore_ascii_case(path),
            BundleKind::Directory => path_within(&self.target, path),
        }
    }

    /// Last directory component, the key of the directory-name index.
    pub fn dir_name(&self) -> &str {
        let trimmed = self.target.trim_end_matches(['/', '\\']);
        match self.kind {
            BundleKind::Directory => trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed),
            BundleKind::File => {
                let parent = trimmed.rsplit_once(['/', '\\']).map(|(p, _)| p).unwrap_or("");
                parent.rsplit(['/', '\\']).next().unwrap_or(parent)
            }
        }
    }
}

/// Case-insensitive test that `path` starts with the directory `dir`.
pub(crate) fn path_within(dir: &str, path: &str) -> bool {
    path.len() >= dir.len()
        && path.is_char_boundary(dir.len())
        && path[..dir.len()].eq_ignore_ascii_case(dir)
}
