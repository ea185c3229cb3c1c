use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::block_map::BlockMap;
use super::bundle::BundleToken;
use super::error::{QueueError, SegmentError};
use super::priority::Priority;
use super::segment::{round_down, round_up, Segment, SegmentSet};
use crate::connection::ConnectionToken;
use crate::hash::TthValue;
use crate::settings::OverlapPolicy;
use crate::user::{HintedUser, UserId};

/// Stable arena key of a queue item. Survives moves and renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueItemId(pub u64);

impl fmt::Display for QueueItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Independent attributes of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ItemFlags {
    /// A peer's full file list.
    pub user_list: bool,
    /// A single directory of a peer's file list.
    pub partial_list: bool,
    /// The list is fetched to queue a remote directory from it.
    pub directory_download: bool,
    pub text_view: bool,
    pub client_view: bool,
    /// The list is fetched to match it against the local queue.
    pub match_queue: bool,
    pub finished: bool,
    pub moved: bool,
    pub hashed: bool,
}

impl ItemFlags {
    pub fn file_list() -> Self {
        Self {
            user_list: true,
            ..Self::default()
        }
    }

    pub fn is_file_list(&self) -> bool {
        self.user_list || self.partial_list
    }
}

/// Attributes of a source, including why a bad source was demoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SourceFlags {
    pub partial: bool,
    pub no_tree: bool,
    pub bad_tree: bool,
    pub slow_source: bool,
    pub file_not_available: bool,
    /// A partial source had none of the blocks still needed.
    pub no_need_parts: bool,
    /// Removed by the user.
    pub removed: bool,
    /// The peer cannot serve files by content hash.
    pub no_tthf: bool,
    pub untrusted: bool,
}

impl SourceFlags {
    pub fn merge(&mut self, other: SourceFlags) {
        self.partial |= other.partial;
        self.no_tree |= other.no_tree;
        self.bad_tree |= other.bad_tree;
        self.slow_source |= other.slow_source;
        self.file_not_available |= other.file_not_available;
        self.no_need_parts |= other.no_need_parts;
        self.removed |= other.removed;
        self.no_tthf |= other.no_tthf;
        self.untrusted |= other.untrusted;
    }

    /// Reasons that keep a bad source from being re-added automatically.
    pub fn blocks_readd(&self) -> bool {
        self.removed || self.bad_tree || self.no_tthf || self.untrusted
    }
}

/// Block availability and query bookkeeping of a partial source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialSource {
    /// `[start, end)` block index pairs the peer has.
    pub parts: Vec<u32>,
    /// Where availability queries are sent.
    pub udp: Option<SocketAddr>,
    pub next_query: Instant,
    pub pending_queries: u32,
}

impl PartialSource {
    pub fn new(parts: Vec<u32>, udp: Option<SocketAddr>, now: Instant) -> Self {
        Self {
            parts,
            udp,
            next_query: now,
            pending_queries: 0,
        }
    }

    pub fn block_map(&self, block_count: usize) -> BlockMap {
        BlockMap::from_parts(&self.parts, block_count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub user: HintedUser,
    pub nick: String,
    pub flags: SourceFlags,
    pub partial: Option<PartialSource>,
}

impl Source {
    pub fn new(user: HintedUser, nick: impl Into<String>) -> Self {
        Self {
            user,
            nick: nick.into(),
            flags: SourceFlags::default(),
            partial: None,
        }
    }

    pub fn is_partial(&self) -> bool {
        self.flags.partial && self.partial.is_some()
    }
}

/// What a running download is fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadKind {
    File,
    /// The item's hash tree, needed before segmenting the file.
    Tree,
}

/// A transfer currently assigned to a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningDownload {
    pub token: ConnectionToken,
    pub user: UserId,
    pub kind: DownloadKind,
    pub segment: Segment,
    /// Block size the segment was aligned to.
    pub block_size: u64,
    pub started: Instant,
    /// Bytes received within the segment.
    pub pos: u64,
    /// Recent speed in bytes per second.
    pub speed: u64,
}

impl RunningDownload {
    pub fn seconds_left(&self) -> u64 {
        let remaining = self.segment.size().saturating_sub(self.pos);
        if self.speed == 0 {
            return u64::MAX;
        }
        remaining / self.speed
    }
}

/// Segmenting parameters that stay fixed across one queue's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct SegmentPolicy {
    pub multi_segment: bool,
    pub target_duration: Duration,
    pub overlap: OverlapPolicy,
}

/// Per-request inputs to [`QueueItem::next_segment`].
#[derive(Debug, Clone, Copy)]
pub struct SegmentRequest<'a> {
    pub block_size: u64,
    /// Chunk size the connection asks for.
    pub chunk_size: u64,
    /// The requesting peer's recent speed in bytes per second.
    pub speed: u64,
    pub partial: Option<&'a PartialSource>,
    pub now: Instant,
}

/// One local download target.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub target: String,
    pub temp_target: String,
    pub size: u64,
    pub tth: TthValue,
    pub priority: Priority,
    pub auto_priority: bool,
    pub flags: ItemFlags,
    pub max_segments: u8,
    /// Unix seconds.
    pub added: u64,
    pub bundle: Option<BundleToken>,
    pub(crate) done: SegmentSet,
    pub(crate) sources: Vec<Source>,
    pub(crate) bad_sources: Vec<Source>,
    pub(crate) downloads: Vec<RunningDownload>,
}

impl QueueItem {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: QueueItemId,
        target: String,
        temp_target: String,
        size: u64,
        tth: TthValue,
        priority: Priority,
        flags: ItemFlags,
        max_segments: u8,
        added: u64,
    ) -> Self {
        Self {
            id,
            target,
            temp_target,
            size,
            tth,
            priority,
            auto_priority: false,
            flags,
            max_segments: max_segments.max(1),
            added,
            bundle: None,
            done: SegmentSet::new(),
            sources: Vec::new(),
            bad_sources: Vec::new(),
            downloads: Vec::new(),
        }
    }

    pub fn done_segments(&self) -> &SegmentSet {
        &self.done
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn bad_sources(&self) -> &[Source] {
        &self.bad_sources
    }

    pub fn downloads(&self) -> &[RunningDownload] {
        &self.downloads
    }

    pub fn is_finished(&self) -> bool {
        self.flags.finished
    }

    pub fn is_running(&self) -> bool {
        !self.downloads.is_empty()
    }

    pub fn is_paused(&self) -> bool {
        self.priority.is_paused()
    }

    pub fn file_name(&self) -> &str {
        file_name(&self.target)
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.done.downloaded_bytes()
    }

    pub fn average_speed(&self) -> u64 {
        self.downloads.iter().map(|d| d.speed).sum()
    }

    /// Records completed bytes. Returns true once the file is complete.
    pub fn add_segment(&mut self, segment: Segment) -> bool {
        self.done.add(segment, self.size);
        self.done.covers(self.size)
    }

    pub fn reset_done(&mut self, done: SegmentSet) {
        self.done = done;
    }

    pub fn is_source(&self, user: &UserId) -> bool {
        self.sources.iter().any(|s| &s.user.user == user)
    }

    pub fn is_bad_source(&self, user: &UserId) -> bool {
        self.bad_sources.iter().any(|s| &s.user.user == user)
    }

    pub fn source(&self, user: &UserId) -> Option<&Source> {
        self.sources.iter().find(|s| &s.user.user == user)
    }

    pub fn source_mut(&mut self, user: &UserId) -> Option<&mut Source> {
        self.sources.iter_mut().find(|s| &s.user.user == user)
    }

    /// Adds a source, reviving it from the bad list when allowed.
    pub fn add_source(
        &mut self,
        user: HintedUser,
        nick: &str,
        force: bool,
    ) -> Result<&mut Source, QueueError> {
        if self.is_source(&user.user) {
            return Err(QueueError::DuplicateSource(self.target.clone()));
        }

        let mut source = Source::new(user.clone(), nick);
        if let Some(pos) = self.bad_sources.iter().position(|s| s.user.user == user.user) {
            if self.bad_sources[pos].flags.blocks_readd() && !force {
                return Err(QueueError::DuplicateSource(self.target.clone()));
            }
            let bad = self.bad_sources.remove(pos);
            source.flags.no_tree = bad.flags.no_tree;
        }

        self.sources.push(source);
        let last = self.sources.len() - 1;
        Ok(&mut self.sources[last])
    }

    /// Demotes a source to the bad list, recording why.
    pub fn remove_source(&mut self, user: &UserId, reason: SourceFlags) -> Option<Source> {
        let pos = self.sources.iter().position(|s| &s.user.user == user)?;
        let mut source = self.sources.remove(pos);
        source.flags.merge(reason);
        if !reason.no_need_parts {
            source.partial = None;
            source.flags.partial = false;
        }
        self.bad_sources.retain(|s| &s.user.user != user);
        self.bad_sources.push(source.clone());
        Some(source)
    }

    pub fn online_sources(&self, is_online: impl Fn(&UserId) -> bool) -> usize {
        self.sources.iter().filter(|s| is_online(&s.user.user)).count()
    }

    pub fn is_downloading_by(&self, user: &UserId) -> bool {
        self.downloads.iter().any(|d| &d.user == user)
    }

    pub fn download(&self, token: &ConnectionToken) -> Option<&RunningDownload> {
        self.downloads.iter().find(|d| &d.token == token)
    }

    pub fn download_mut(&mut self, token: &ConnectionToken) -> Option<&mut RunningDownload> {
        self.downloads.iter_mut().find(|d| &d.token == token)
    }

    pub fn take_download(&mut self, token: &ConnectionToken) -> Option<RunningDownload> {
        let pos = self.downloads.iter().position(|d| &d.token == token)?;
        Some(self.downloads.remove(pos))
    }

    /// Picks the next byte range a source should fetch.
    ///
    /// Ranges are aligned to `block_size`, never overlap done or claimed
    /// ranges, and shrink block by block when the preferred size collides
    /// with another claim. The first free range of the full preferred size
    /// wins; otherwise the largest shorter one does. A slow running segment
    /// may be shared with the requester under `policy.overlap`.
    pub fn next_segment(
        &self,
        request: &SegmentRequest<'_>,
        policy: &SegmentPolicy,
    ) -> Result<Segment, SegmentError> {
        let block_size = request.block_size;
        if self.size == 0 || block_size == 0 {
            return Err(SegmentError::NoFreeBlock);
        }

        if (!policy.multi_segment || block_size >= self.size) && request.partial.is_none() {
            return self.single_segment(block_size);
        }

        if self.downloads.len() >= self.max_segments as usize {
            return Err(SegmentError::SegmentLimitReached);
        }

        let available = match request.partial {
            Some(partial) => {
                let block_count = self.size.div_ceil(block_size) as usize;
                let needed = BlockMap::needed(&self.done, self.size, block_size);
                let map = partial.block_map(block_count).intersection(&needed);
                if map.is_empty() {
                    return Err(SegmentError::NoNeededParts);
                }
                Some(map.segments(self.size, block_size))
            }
            None => None,
        };

        let target = self.target_size(request, policy);
        let mut start = 0;
        let mut current = target;
        let mut best: Option<Segment> = None;

        while start < self.size {
            let end = (start + current).min(self.size);
            let block = Segment::new(start, end - start);

            let mut overlaps = if current <= block_size {
                // a partially done block is fetched again in full
                self.done.contains_range(start, end)
            } else {
                self.done.overlaps(&block)
            };
            if !overlaps {
                overlaps = self.downloads.iter().any(|d| d.segment.overlaps(&block));
            }

            if !overlaps {
                let candidate = match &available {
                    None => Some(block),
                    Some(parts) => parts.iter().find_map(|p| intersect(p, &block)),
                };
                if let Some(candidate) = candidate {
                    if candidate.size() >= target {
                        return Ok(candidate);
                    }
                    if best.is_none_or(|b| candidate.size() > b.size()) {
                        best = Some(candidate);
                    }
                }
            }

            if overlaps && current > block_size {
                current -= block_size;
            } else {
                start = end;
                current = target;
            }
        }

        if let Some(segment) = best {
            return Ok(segment);
        }

        if request.partial.is_none() {
            if let Some(segment) = self.overlap_slow_segment(request, &policy.overlap) {
                return Ok(segment);
            }
        }

        Err(SegmentError::NoFreeBlock)
    }

    fn single_segment(&self, block_size: u64) -> Result<Segment, SegmentError> {
        if self.done.covers(self.size) {
            return Err(SegmentError::NoFreeBlock);
        }
        if !self.downloads.is_empty() {
            return Err(SegmentError::FileTooSmallToSegment);
        }

        let mut gap_start = 0;
        let mut gap_end = self.size;
        for done in self.done.iter() {
            if done.start() > gap_start {
                gap_end = done.start();
                break;
            }
            gap_start = done.end();
        }

        let start = round_down(gap_start, block_size);
        let end = round_up(gap_end, block_size).min(self.size);
        if start >= end {
            return Err(SegmentError::NoFreeBlock);
        }
        Ok(Segment::new(start, end - start))
    }

    fn target_size(&self, request: &SegmentRequest<'_>, policy: &SegmentPolicy) -> u64 {
        let by_speed = request
            .speed
            .saturating_mul(policy.target_duration.as_secs());
        let mut target = request.chunk_size.max(by_speed);
        if !self.downloads.is_empty() {
            target = target.min(self.size / self.max_segments.max(1) as u64);
        }
        round_down(target, request.block_size).max(request.block_size)
    }

    fn overlap_slow_segment(
        &self,
        request: &SegmentRequest<'_>,
        overlap: &OverlapPolicy,
    ) -> Option<Segment> {
        if !overlap.enabled || (overlap.use_requester_speed && request.speed == 0) {
            return None;
        }

        for download in &self.downloads {
            if download.kind != DownloadKind::File || download.segment.is_overlapped() {
                continue;
            }
            let already_shared = self
                .downloads
                .iter()
                .any(|d| d.segment.is_overlapped() && d.segment.overlaps(&download.segment));
            if already_shared {
                continue;
            }
            if request.now.saturating_duration_since(download.started) < overlap.min_running {
                continue;
            }

            let seconds_left = download.seconds_left();
            if seconds_left < overlap.min_seconds_left {
                continue;
            }

            let pos = round_down(download.pos, request.block_size);
            let remaining = download.segment.size().saturating_sub(pos);
            if remaining == 0 {
                continue;
            }

            let worth_it = if overlap.use_requester_speed {
                let ours = remaining / request.speed;
                (ours as f64) * overlap.speedup_factor < seconds_left as f64
            } else {
                seconds_left as f64 > overlap.min_seconds_left as f64 * overlap.speedup_factor
            };

            if worth_it {
                return Some(Segment::overlapping(
                    download.segment.start() + pos,
                    remaining,
                ));
            }
        }
        None
    }
}

fn intersect(a: &Segment, b: &Segment) -> Option<Segment> {
    let start = a.start().max(b.start());
    let end = a.end().min(b.end());
    (start < end).then(|| Segment::new(start, end - start))
}

pub(crate) fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}
