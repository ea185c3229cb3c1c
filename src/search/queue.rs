use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use rand::Rng as _;

use crate::constants::{
    ALTERNATE_SEARCH_INTERVAL, AUTO_ALTERNATE_SEARCH_INTERVAL, AUTO_SEARCH_INTERVAL,
    MANUAL_SEARCH_INTERVAL,
};
use crate::hash::TthValue;

/// Who asked for a search. Lower kinds are sent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SearchKind {
    Manual,
    /// Alternate sources requested by the user for one item.
    Alternate,
    /// Alternate sources picked by the queue's own rotation.
    AlternateAuto,
    /// Bundle auto-search.
    AutoSearch,
}

impl SearchKind {
    /// Spacing that must follow a search of this kind.
    pub fn interval(self) -> Duration {
        match self {
            SearchKind::Manual => MANUAL_SEARCH_INTERVAL,
            SearchKind::Alternate => ALTERNATE_SEARCH_INTERVAL,
            SearchKind::AlternateAuto => AUTO_ALTERNATE_SEARCH_INTERVAL,
            SearchKind::AutoSearch => AUTO_SEARCH_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FileType {
    #[default]
    Any,
    /// The query is a base-32 content hash.
    Tth,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeLimit {
    AtLeast(u64),
    AtMost(u64),
    Exact(u64),
}

/// One outbound search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Search {
    pub kind: SearchKind,
    pub query: String,
    pub file_type: FileType,
    pub size: Option<SizeLimit>,
    pub token: String,
    /// Callers interested in the results; identical searches share one entry.
    pub owners: HashSet<String>,
}

impl Search {
    pub fn new(kind: SearchKind, query: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            kind,
            query: query.into(),
            file_type: FileType::Any,
            size: None,
            token: rand::rng().random::<u32>().to_string(),
            owners: HashSet::from([owner.into()]),
        }
    }

    /// Content hash search for alternate sources.
    pub fn for_tth(kind: SearchKind, tth: &TthValue, owner: impl Into<String>) -> Self {
        let mut search = Self::new(kind, tth.to_string(), owner);
        search.file_type = FileType::Tth;
        search
    }

    pub fn with_size(mut self, size: SizeLimit) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_file_type(mut self, file_type: FileType) -> Self {
        self.file_type = file_type;
        self
    }

    /// Same kind, query and constraints; owners and token are ignored.
    pub fn is_same(&self, other: &Search) -> bool {
        self.kind == other.kind
            && self.query == other.query
            && self.file_type == other.file_type
            && self.size == other.size
    }
}

impl fmt::Display for Search {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} search '{}'", self.kind, self.query)
    }
}

/// Rate-limited FIFO of outbound searches, ordered by kind.
///
/// ```
/// use std::time::{Duration, Instant};
/// use dcflow::search::{Search, SearchKind, SearchQueue};
///
/// let mut queue = SearchQueue::new(Duration::from_secs(10));
/// let now = Instant::now();
/// queue.add(Search::new(SearchKind::AutoSearch, "album", "auto"), now);
/// queue.add(Search::new(SearchKind::Manual, "song", "user"), now);
///
/// let first = queue.pop(now).unwrap();
/// assert_eq!(first.kind, SearchKind::Manual);
/// assert!(queue.pop(now).is_none());
/// ```
#[derive(Debug)]
pub struct SearchQueue {
    queue: VecDeque<Search>,
    min_interval: Duration,
    last_search: Option<Instant>,
    interval: Duration,
}

impl SearchQueue {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            min_interval,
            last_search: None,
            interval: min_interval,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Search> {
        self.queue.iter()
    }

    pub fn interval_of(&self, search: &Search) -> Duration {
        search.kind.interval().max(self.min_interval)
    }

    fn remaining(&self, now: Instant) -> Duration {
        match self.last_search {
            Some(last) => (last + self.interval).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Queues a search and returns the estimated wait until it is sent.
    ///
    /// A search identical to a queued one only adds its owners to the
    /// queued entry.
    pub fn add(&mut self, search: Search, now: Instant) -> Duration {
        let position = match self.queue.iter().position(|s| s.is_same(&search)) {
            Some(pos) => {
                self.queue[pos].owners.extend(search.owners);
                pos
            }
            None => {
                let pos = self
                    .queue
                    .iter()
                    .position(|s| s.kind > search.kind)
                    .unwrap_or(self.queue.len());
                self.queue.insert(pos, search);
                pos
            }
        };

        if position == 0 {
            self.interval = self.interval_of(&self.queue[0]);
        }

        self.queue
            .iter()
            .skip(1)
            .take(position)
            .fold(self.remaining(now), |wait, s| wait + self.interval_of(s))
    }

    /// Takes the head once the current interval has elapsed.
    pub fn pop(&mut self, now: Instant) -> Option<Search> {
        if self.queue.is_empty() || !self.remaining(now).is_zero() {
            return None;
        }
        let search = self.queue.pop_front()?;
        self.last_search = Some(now);
        self.interval = match self.queue.front() {
            Some(next) => self.interval_of(next),
            None => self.interval_of(&search),
        };
        Some(search)
    }

    /// Time until `pop` would succeed; `None` when the queue is empty.
    pub fn next_search_in(&self, now: Instant) -> Option<Duration> {
        (!self.queue.is_empty()).then(|| self.remaining(now))
    }

    /// Drops `owner` from every entry; entries left without owners go.
    pub fn cancel(&mut self, owner: &str) -> usize {
        let before = self.queue.len();
        self.queue.retain_mut(|s| !(s.owners.remove(owner) && s.owners.is_empty()));
        before - self.queue.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
