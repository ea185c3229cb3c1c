use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use super::error::SegmentError;
use super::file_queue::FileQueue;
use super::item::{QueueItem, QueueItemId, SegmentPolicy, SegmentRequest, SourceFlags};
use super::priority::Priority;
use super::segment::Segment;
use crate::user::UserId;

/// Block size of an item as known to the hash store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockInfo {
    Known(u64),
    /// The tree has to be downloaded before the file can be segmented.
    TreeNeeded,
}

/// Inputs to [`UserQueue::get_next`].
pub struct NextRequest<'a> {
    pub user: UserId,
    pub min_priority: Priority,
    pub chunk_size: u64,
    pub speed: u64,
    /// Drop partial sources that turn out to have nothing we need.
    pub allow_remove: bool,
    pub small_slot_only: bool,
    pub small_file_size: u64,
    pub now: Instant,
    pub policy: SegmentPolicy,
    pub block_info: &'a dyn Fn(&QueueItem) -> BlockInfo,
}

/// What a peer should fetch next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextDownload {
    Segment {
        item: QueueItemId,
        segment: Segment,
        block_size: u64,
    },
    /// The item's hash tree must be fetched first.
    Tree { item: QueueItemId },
}

impl NextDownload {
    pub fn item(&self) -> QueueItemId {
        match self {
            NextDownload::Segment { item, .. } | NextDownload::Tree { item } => *item,
        }
    }
}

/// Per-priority, per-peer scheduling lists plus the running map.
///
/// An item sits in at most one priority level at a time; `placed` records
/// which. Within a level a peer's list is in insertion order, except that
/// items with downloaded bytes are put at the front so partial work resumes
/// first.
#[derive(Debug)]
pub struct UserQueue {
    queues: Vec<HashMap<UserId, VecDeque<QueueItemId>>>,
    placed: HashMap<QueueItemId, Priority>,
    running: HashMap<UserId, Vec<QueueItemId>>,
}

impl Default for UserQueue {
    fn default() -> Self {
        Self {
            queues: (0..Priority::COUNT).map(|_| HashMap::new()).collect(),
            placed: HashMap::new(),
            running: HashMap::new(),
        }
    }
}

impl UserQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules every source of `item` at `priority`.
    pub fn add(&mut self, item: &QueueItem, priority: Priority) {
        for source in &item.sources {
            self.add_user(item, &source.user.user, priority);
        }
    }

    pub fn add_user(&mut self, item: &QueueItem, user: &UserId, priority: Priority) {
        if let Some(&current) = self.placed.get(&item.id) {
            if current != priority {
                self.remove(item);
                for source in &item.sources {
                    if &source.user.user != user {
                        self.push(item, &source.user.user, priority);
                    }
                }
            }
        }
        self.push(item, user, priority);
    }

    fn push(&mut self, item: &QueueItem, user: &UserId, priority: Priority) {
        let list = self.queues[priority.index()].entry(*user).or_default();
        if list.contains(&item.id) {
            return;
        }
        if item.downloaded_bytes() > 0 {
            list.push_front(item.id);
        } else {
            list.push_back(item.id);
        }
        self.placed.insert(item.id, priority);
    }

    /// Drops every scheduling entry of `item`, running entries included.
    pub fn remove(&mut self, item: &QueueItem) {
        let Some(priority) = self.placed.remove(&item.id) else {
            return;
        };
        let level = &mut self.queues[priority.index()];
        level.retain(|_, list| {
            list.retain(|id| *id != item.id);
            !list.is_empty()
        });
        self.running.retain(|_, ids| {
            ids.retain(|id| *id != item.id);
            !ids.is_empty()
        });
    }

    pub fn remove_user(&mut self, item: QueueItemId, user: &UserId) {
        let Some(&priority) = self.placed.get(&item) else {
            return;
        };
        let level = &mut self.queues[priority.index()];
        if let Some(list) = level.get_mut(user) {
            list.retain(|id| *id != item);
            if list.is_empty() {
                level.remove(user);
            }
        }
        if !level.values().any(|list| list.contains(&item)) {
            self.placed.remove(&item);
        }
        self.remove_running(user, item);
    }

    /// Moves an item to another priority level, keeping its sources.
    pub fn set_priority(&mut self, item: &QueueItem, priority: Priority) {
        let running: Vec<UserId> = self
            .running
            .iter()
            .filter(|(_, ids)| ids.contains(&item.id))
            .map(|(user, _)| *user)
            .collect();
        self.remove(item);
        self.add(item, priority);
        for user in running {
            self.add_running(&user, item.id);
        }
    }

    pub fn priority_of(&self, item: QueueItemId) -> Option<Priority> {
        self.placed.get(&item).copied()
    }

    /// Number of scheduling entries of `item` for `user` across all levels.
    pub fn entries(&self, item: QueueItemId, user: &UserId) -> usize {
        self.queues
            .iter()
            .filter_map(|level| level.get(user))
            .map(|list| list.iter().filter(|id| **id == item).count())
            .sum()
    }

    pub fn user_list(&self, user: &UserId, priority: Priority) -> Vec<QueueItemId> {
        self.queues[priority.index()]
            .get(user)
            .map(|l| l.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn add_running(&mut self, user: &UserId, item: QueueItemId) {
        let ids = self.running.entry(*user).or_default();
        if !ids.contains(&item) {
            ids.push(item);
        }
    }

    pub fn remove_running(&mut self, user: &UserId, item: QueueItemId) {
        if let Some(ids) = self.running.get_mut(user) {
            ids.retain(|id| *id != item);
            if ids.is_empty() {
                self.running.remove(user);
            }
        }
    }

    pub fn running(&self, user: &UserId) -> &[QueueItemId] {
        self.running.get(user).map(Vec::as_slice).unwrap_or(&[])
    }

    fn eligible(item: &QueueItem, user: &UserId, small_slot_only: bool, small: u64) -> bool {
        if item.is_finished() || !item.is_source(user) || item.is_downloading_by(user) {
            return false;
        }
        if small_slot_only && !(item.flags.is_file_list() || item.size <= small) {
            return false;
        }
        true
    }

    /// Highest priority at which `user` has something to download.
    pub fn has_download(
        &self,
        files: &FileQueue,
        user: &UserId,
        small_slot_only: bool,
        small_file_size: u64,
    ) -> Priority {
        for priority in Priority::Highest.descending_to(Priority::Lowest) {
            let Some(list) = self.queues[priority.index()].get(user) else {
                continue;
            };
            let found = list.iter().filter_map(|id| files.get(*id)).any(|item| {
                Self::eligible(item, user, small_slot_only, small_file_size)
            });
            if found {
                return priority;
            }
        }
        Priority::Paused
    }

    /// Finds what `request.user` should download next.
    ///
    /// Walks the peer's lists from the highest priority down to
    /// `min_priority` and returns the first item yielding a segment, or its
    /// tree when the tree is still missing. Partial sources without needed
    /// parts are dropped on the way when `allow_remove` is set.
    pub fn get_next(
        &mut self,
        files: &mut FileQueue,
        request: &NextRequest<'_>,
    ) -> Result<NextDownload, SegmentError> {
        let user = request.user;
        let mut last_error = SegmentError::NoFilesAvailable;

        for priority in Priority::Highest.descending_to(request.min_priority) {
            let ids: Vec<QueueItemId> = match self.queues[priority.index()].get(&user) {
                Some(list) => list.iter().copied().collect(),
                None => continue,
            };

            for id in ids {
                let Some(item) = files.get(id) else {
                    continue;
                };
                if !Self::eligible(item, &user, request.small_slot_only, request.small_file_size)
                {
                    continue;
                }

                if item.flags.is_file_list() {
                    if item.is_running() {
                        continue;
                    }
                    return Ok(NextDownload::Segment {
                        item: id,
                        segment: Segment::new(0, item.size),
                        block_size: item.size,
                    });
                }

                let source = item.source(&user);
                let no_tree = source.is_some_and(|s| s.flags.no_tree);
                let block_size = match (request.block_info)(item) {
                    BlockInfo::Known(size) => size,
                    BlockInfo::TreeNeeded if no_tree => item.size,
                    BlockInfo::TreeNeeded => {
                        let tree_running = item
                            .downloads
                            .iter()
                            .any(|d| d.kind == super::item::DownloadKind::Tree);
                        if tree_running {
                            continue;
                        }
                        return Ok(NextDownload::Tree { item: id });
                    }
                };

                let partial = source.filter(|s| s.is_partial()).and_then(|s| s.partial.as_ref());
                let segment_request = SegmentRequest {
                    block_size,
                    chunk_size: request.chunk_size,
                    speed: request.speed,
                    partial,
                    now: request.now,
                };

                match item.next_segment(&segment_request, &request.policy) {
                    Ok(segment) => {
                        return Ok(NextDownload::Segment {
                            item: id,
                            segment,
                            block_size,
                        })
                    }
                    Err(SegmentError::NoNeededParts) if request.allow_remove => {
                        if let Some(item) = files.get_mut(id) {
                            let reason = SourceFlags {
                                partial: true,
                                no_need_parts: true,
                                ..SourceFlags::default()
                            };
                            item.remove_source(&user, reason);
                        }
                        self.remove_user(id, &user);
                        last_error = SegmentError::NoNeededParts;
                    }
                    Err(err) => last_error = err,
                }
            }
        }

        Err(last_error)
    }
}
