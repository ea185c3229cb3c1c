use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use rand::Rng;

use super::error::QueueError;
use super::item::{file_name, ItemFlags, QueueItem, QueueItemId};
use super::priority::Priority;
use crate::constants::{
    MAX_SEGMENTS, MAX_TARGET_LENGTH, PARTIAL_SHARE_MIN_SIZE, PFS_MAX_PENDING_QUERIES,
    PFS_REQUERY_INTERVAL, RECENT_SEARCH_RING, SEGMENT_SIZE_STEPS_MIB,
};
use crate::hash::TthValue;
use crate::settings::QueueSettings;
use crate::user::{HintedUser, UserId};

const MIB: u64 = 1024 * 1024;

/// Parameters of a new queue item.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub target: String,
    pub size: u64,
    pub tth: TthValue,
    pub flags: ItemFlags,
    /// `None` picks the size-based default.
    pub priority: Option<Priority>,
    pub temp_target: String,
    /// Unix seconds.
    pub added: u64,
}

/// Outcome of [`FileQueue::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Added {
    New(QueueItemId),
    /// The same file was already queued at that target.
    Existing(QueueItemId),
}

impl Added {
    pub fn id(&self) -> QueueItemId {
        match self {
            Added::New(id) | Added::Existing(id) => *id,
        }
    }
}

/// A partial source due for an availability query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialQueryTarget {
    pub item: QueueItemId,
    pub user: HintedUser,
    pub udp: SocketAddr,
    pub tth: TthValue,
}

/// Default priority from the configured size thresholds and name pattern.
pub fn default_priority(size: u64, target: &str, settings: &QueueSettings) -> Priority {
    let within = |limit: u64| limit > 0 && size <= limit;

    let by_size = if within(settings.prio_highest_size) {
        Priority::Highest
    } else if within(settings.prio_high_size) {
        Priority::High
    } else if within(settings.prio_normal_size) {
        Priority::Normal
    } else if within(settings.prio_low_size) {
        Priority::Low
    } else {
        Priority::Normal
    };

    let pattern_match = settings
        .high_prio_files
        .as_ref()
        .is_some_and(|re| re.is_match(file_name(target)));

    if pattern_match && by_size < Priority::High {
        Priority::High
    } else {
        by_size
    }
}

/// Concurrent segment cap for a file of `size` bytes.
pub fn max_segments_for(size: u64, settings: &QueueSettings) -> u8 {
    if let Some(manual) = settings.manual_segments {
        return manual.clamp(1, MAX_SEGMENTS);
    }
    let steps = SEGMENT_SIZE_STEPS_MIB
        .iter()
        .take_while(|&&mib| size >= mib * MIB)
        .count() as u8;
    (steps + 1).min(MAX_SEGMENTS)
}

fn validate_target(target: &str) -> Result<(), QueueError> {
    if target.len() > MAX_TARGET_LENGTH {
        return Err(QueueError::TargetTooLong(target.len()));
    }
    if target.is_empty() || target.ends_with(['/', '\\']) {
        return Err(QueueError::InvalidTarget(target.to_string()));
    }
    if target.split(['/', '\\']).any(|c| c == "..") {
        return Err(QueueError::InvalidTarget(target.to_string()));
    }
    Ok(())
}

/// Owner of every queue item.
///
/// Items live in one arena keyed by [`QueueItemId`]; the target and content
/// hash indices and every other scheduler structure store ids only.
#[derive(Debug, Default)]
pub struct FileQueue {
    items: HashMap<QueueItemId, QueueItem>,
    by_target: BTreeMap<String, QueueItemId>,
    by_tth: HashMap<TthValue, Vec<QueueItemId>>,
    next_id: u64,
    recent_searches: VecDeque<QueueItemId>,
}

impl FileQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: QueueItemId) -> Option<&QueueItem> {
        self.items.get(&id)
    }

    pub fn get_mut(&mut self, id: QueueItemId) -> Option<&mut QueueItem> {
        self.items.get_mut(&id)
    }

    /// Items in target order.
    pub fn iter(&self) -> impl Iterator<Item = &QueueItem> {
        self.by_target.values().filter_map(|id| self.items.get(id))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut QueueItem> {
        self.items.values_mut()
    }

    pub fn find_target(&self, target: &str) -> Option<QueueItemId> {
        self.by_target.get(target).copied()
    }

    pub fn find_tth(&self, tth: &TthValue) -> &[QueueItemId] {
        self.by_tth.get(tth).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Linear scan for an item of the same size whose target ends with
    /// `suffix`, used to spot likely duplicates before queueing.
    pub fn find_by_size_and_suffix(&self, size: u64, suffix: &str) -> Option<QueueItemId> {
        let suffix = suffix.to_lowercase();
        self.iter()
            .find(|q| q.size == size && q.target.to_lowercase().ends_with(&suffix))
            .map(|q| q.id)
    }

    pub fn add(&mut self, new: NewItem, settings: &QueueSettings) -> Result<Added, QueueError> {
        validate_target(&new.target)?;
        if new.size == 0 {
            return Err(QueueError::ZeroSize);
        }

        if let Some(existing) = self.find_target(&new.target).and_then(|id| self.items.get(&id)) {
            if existing.is_finished() {
                return Err(QueueError::AlreadyFinished(new.target));
            }
            if existing.size != new.size || existing.tth != new.tth {
                return Err(QueueError::DuplicateTarget(new.target));
            }
            return Ok(Added::Existing(existing.id));
        }

        let priority = new
            .priority
            .unwrap_or_else(|| default_priority(new.size, &new.target, settings));
        let max_segments = if new.flags.is_file_list() {
            1
        } else {
            max_segments_for(new.size, settings)
        };

        self.next_id += 1;
        let id = QueueItemId(self.next_id);
        let item = QueueItem::new(
            id,
            new.target,
            new.temp_target,
            new.size,
            new.tth,
            priority,
            new.flags,
            max_segments,
            new.added,
        );
        self.insert(item);
        Ok(Added::New(id))
    }

    /// Re-inserts a fully built item, as done when loading the queue file.
    pub fn insert(&mut self, item: QueueItem) {
        self.next_id = self.next_id.max(item.id.0);
        self.by_target.insert(item.target.clone(), item.id);
        if !item.flags.is_file_list() {
            self.by_tth.entry(item.tth).or_default().push(item.id);
        }
        self.items.insert(item.id, item);
    }

    pub fn next_id(&mut self) -> QueueItemId {
        self.next_id += 1;
        QueueItemId(self.next_id)
    }

    pub fn remove(&mut self, id: QueueItemId) -> Option<QueueItem> {
        let item = self.items.remove(&id)?;
        self.by_target.remove(&item.target);
        if let Some(ids) = self.by_tth.get_mut(&item.tth) {
            ids.retain(|i| *i != id);
            if ids.is_empty() {
                self.by_tth.remove(&item.tth);
            }
        }
        self.recent_searches.retain(|i| *i != id);
        Some(item)
    }

    /// Changes an item's target, keeping its id.
    pub fn retarget(&mut self, id: QueueItemId, target: String) -> Result<(), QueueError> {
        validate_target(&target)?;
        if self.by_target.contains_key(&target) {
            return Err(QueueError::DuplicateTarget(target));
        }
        let item = self.items.get_mut(&id).ok_or(QueueError::NotFound)?;
        self.by_target.remove(&item.target);
        item.target = target.clone();
        self.by_target.insert(target, id);
        Ok(())
    }

    /// Picks an item to search alternate sources for.
    ///
    /// Starts at a random position in target order so the same items are not
    /// always favoured, and prefers items that are not running. Items
    /// searched recently, finished, paused, file lists and items with enough
    /// online sources are skipped.
    pub fn find_auto_search(
        &mut self,
        rng: &mut impl Rng,
        max_online_sources: usize,
        is_online: impl Fn(&UserId) -> bool,
        accept: impl Fn(&QueueItem) -> bool,
    ) -> Option<QueueItemId> {
        let ids: Vec<QueueItemId> = self.by_target.values().copied().collect();
        if ids.is_empty() {
            return None;
        }

        let start = rng.random_range(0..ids.len());
        let mut running_candidate = None;
        let mut found = None;

        for offset in 0..ids.len() {
            let id = ids[(start + offset) % ids.len()];
            let Some(item) = self.items.get(&id) else {
                continue;
            };
            if item.is_finished()
                || item.flags.is_file_list()
                || item.is_paused()
                || item.online_sources(&is_online) >= max_online_sources
                || self.recent_searches.contains(&id)
                || !accept(item)
            {
                continue;
            }
            if item.is_running() {
                running_candidate.get_or_insert(id);
                continue;
            }
            found = Some(id);
            break;
        }

        let chosen = found.or(running_candidate)?;
        self.recent_searches.push_back(chosen);
        while self.recent_searches.len() > RECENT_SEARCH_RING {
            self.recent_searches.pop_front();
        }
        Some(chosen)
    }

    /// Partial sources due for an availability query, soonest first.
    ///
    /// Each returned source has its pending counter bumped and its next query
    /// pushed back by the re-query interval.
    pub fn find_partial_query_targets(
        &mut self,
        now: Instant,
        limit: usize,
    ) -> Vec<PartialQueryTarget> {
        let mut due: Vec<(Instant, QueueItemId, UserId)> = Vec::new();
        for item in self.items.values() {
            if item.size < PARTIAL_SHARE_MIN_SIZE || item.downloaded_bytes() == 0 {
                continue;
            }
            for source in item.sources.iter().chain(item.bad_sources.iter()) {
                let Some(partial) = source.partial.as_ref() else {
                    continue;
                };
                if source.flags.partial
                    && partial.udp.is_some()
                    && partial.next_query <= now
                    && partial.pending_queries < PFS_MAX_PENDING_QUERIES
                {
                    due.push((partial.next_query, item.id, source.user.user));
                }
            }
        }

        due.sort_by_key(|(when, _, _)| *when);
        due.truncate(limit);

        let mut targets = Vec::with_capacity(due.len());
        for (_, id, user) in due {
            let Some(item) = self.items.get_mut(&id) else {
                continue;
            };
            let tth = item.tth;
            let source = item
                .sources
                .iter_mut()
                .chain(item.bad_sources.iter_mut())
                .find(|s| s.user.user == user);
            let Some(source) = source else {
                continue;
            };
            let hinted = source.user.clone();
            if let Some(partial) = source.partial.as_mut() {
                partial.pending_queries += 1;
                partial.next_query = now + PFS_REQUERY_INTERVAL;
                if let Some(udp) = partial.udp {
                    targets.push(PartialQueryTarget {
                        item: id,
                        user: hinted,
                        udp,
                        tth,
                    });
                }
            }
        }
        targets
    }
}
