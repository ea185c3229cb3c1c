use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::Rng;
use tracing::trace;

use super::bundle::{path_within, Bundle, BundleKind, BundleToken};
use super::priority::Priority;
use crate::constants::RECENT_SEARCH_TIERS;

fn components(path: &str) -> impl DoubleEndedIterator<Item = &str> {
    path.split(['/', '\\']).filter(|c| !c.is_empty())
}

/// Every bundle, plus the structures that pick which one to auto-search.
///
/// Searchable bundles sit in one bucket per priority from `Lowest` up, or
/// in the recent bucket while they are new. Directory names of bundle roots
/// and the folders below them are indexed so a remote path can be matched
/// to a local bundle without walking every bundle.
#[derive(Debug)]
pub struct BundleQueue {
    bundles: HashMap<BundleToken, Bundle>,
    buckets: Vec<VecDeque<BundleToken>>,
    recent: VecDeque<BundleToken>,
    dir_index: HashMap<String, Vec<(BundleToken, String)>>,
    next_search: Option<Instant>,
    next_recent_search: Option<Instant>,
}

impl Default for BundleQueue {
    fn default() -> Self {
        Self {
            bundles: HashMap::new(),
            buckets: (0..Priority::COUNT).map(|_| VecDeque::new()).collect(),
            recent: VecDeque::new(),
            dir_index: HashMap::new(),
            next_search: None,
            next_recent_search: None,
        }
    }
}

impl BundleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    pub fn get(&self, token: BundleToken) -> Option<&Bundle> {
        self.bundles.get(&token)
    }

    pub fn get_mut(&mut self, token: BundleToken) -> Option<&mut Bundle> {
        self.bundles.get_mut(&token)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bundle> {
        self.bundles.values()
    }

    pub fn tokens(&self) -> Vec<BundleToken> {
        self.bundles.keys().copied().collect()
    }

    pub fn add(&mut self, bundle: Bundle) {
        let token = bundle.token;
        if bundle.kind == BundleKind::Directory {
            let root = bundle.target.clone();
            self.index_dir(token, &root);
        }
        self.bundles.insert(token, bundle);
        self.add_search(token);
    }

    pub fn remove(&mut self, token: BundleToken) -> Option<Bundle> {
        self.remove_search(token);
        self.dir_index.retain(|_, entries| {
            entries.retain(|(t, _)| *t != token);
            !entries.is_empty()
        });
        self.bundles.remove(&token)
    }

    /// Adds `dir` to the directory-name index under `token`.
    pub fn index_dir(&mut self, token: BundleToken, dir: &str) {
        let Some(name) = components(dir).next_back() else {
            return;
        };
        let entries = self.dir_index.entry(name.to_lowercase()).or_default();
        if !entries.iter().any(|(t, p)| *t == token && p.eq_ignore_ascii_case(dir)) {
            entries.push((token, dir.to_string()));
        }
    }

    /// Indexes every folder between a directory bundle's root and `target`.
    pub fn index_item(&mut self, token: BundleToken, target: &str) {
        let Some(bundle) = self.bundles.get(&token) else {
            return;
        };
        if bundle.kind != BundleKind::Directory {
            return;
        }
        let root_len = bundle.target.len();
        let mut dirs = Vec::new();
        let mut path = target;
        while let Some((parent, _)) = path.rsplit_once(['/', '\\']) {
            if parent.len() < root_len {
                break;
            }
            dirs.push(format!("{parent}/"));
            path = parent;
        }
        for dir in dirs {
            self.index_dir(token, &dir);
        }
    }

    /// Directory bundle that contains `path`.
    pub fn find_containing(&self, path: &str) -> Option<BundleToken> {
        self.bundles
            .values()
            .filter(|b| b.kind == BundleKind::Directory && b.contains_path(path))
            .max_by_key(|b| b.target.len())
            .map(|b| b.token)
    }

    /// Bundles located beneath the directory `dir`.
    pub fn find_sub_bundles(&self, dir: &str) -> Vec<BundleToken> {
        self.bundles
            .values()
            .filter(|b| b.target.len() > dir.len() && path_within(dir, &b.target))
            .map(|b| b.token)
            .collect()
    }

    /// Maps a folder of a remote share to the local folder it is queued as.
    ///
    /// Candidates are looked up by the remote folder's last name; the one
    /// sharing the longest run of trailing folder names wins.
    pub fn find_remote_dir(&self, remote_path: &str) -> Option<(BundleToken, String)> {
        let remote: Vec<String> = components(remote_path).map(str::to_lowercase).collect();
        let last = remote.last()?;
        let candidates = self.dir_index.get(last)?;

        candidates
            .iter()
            .map(|(token, local)| {
                let matched = components(local)
                    .rev()
                    .zip(remote.iter().rev())
                    .take_while(|(l, r)| l.to_lowercase() == **r)
                    .count();
                (matched, token, local)
            })
            .max_by_key(|(matched, _, _)| *matched)
            .map(|(_, token, local)| (*token, local.clone()))
    }

    // ------------------------------------------------------------------------
    // Auto-search buckets
    // ------------------------------------------------------------------------

    /// Places a bundle in the recent bucket or its priority bucket.
    pub fn add_search(&mut self, token: BundleToken) {
        let Some(bundle) = self.bundles.get(&token) else {
            return;
        };
        if bundle.is_paused() {
            return;
        }
        if bundle.recent {
            if !self.recent.contains(&token) {
                self.recent.push_back(token);
            }
        } else {
            let bucket = &mut self.buckets[bundle.priority.index()];
            if !bucket.contains(&token) {
                bucket.push_back(token);
            }
        }
    }

    pub fn remove_search(&mut self, token: BundleToken) {
        self.recent.retain(|t| *t != token);
        for bucket in &mut self.buckets {
            bucket.retain(|t| *t != token);
        }
    }

    /// Changes a bundle's priority and moves it to the matching bucket.
    pub fn set_priority(&mut self, token: BundleToken, priority: Priority) -> bool {
        let Some(bundle) = self.bundles.get_mut(&token) else {
            return false;
        };
        bundle.priority = priority;
        self.remove_search(token);
        self.add_search(token);
        true
    }

    pub fn recent_count(&self) -> usize {
        self.recent.len()
    }

    pub fn bucket(&self, priority: Priority) -> Vec<BundleToken> {
        self.buckets[priority.index()].iter().copied().collect()
    }

    /// Interval between searches from the priority buckets. Levels that
    /// are never drawn do not count.
    pub fn search_interval(&self, configured: Duration, allow: impl Fn(&Bundle) -> bool) -> Duration {
        let searchable = Priority::ALL
            .iter()
            .filter(|priority| priority.search_weight() > 0)
            .flat_map(|priority| &self.buckets[priority.index()])
            .filter_map(|t| self.bundles.get(t))
            .filter(|b| allow(b))
            .count();
        if searchable == 0 {
            return configured;
        }
        let spread = Duration::from_secs(60 * 60 / searchable as u64);
        configured.max(spread)
    }

    /// Interval between searches from the recent bucket.
    pub fn recent_interval(&self) -> Option<Duration> {
        match self.recent.len() {
            0 => None,
            1 => Some(RECENT_SEARCH_TIERS[0]),
            2 => Some(RECENT_SEARCH_TIERS[1]),
            _ => Some(RECENT_SEARCH_TIERS[2]),
        }
    }

    /// Weighted draw over the priority buckets.
    ///
    /// A bucket weighs `(priority - 1) * searchable entries`. The first
    /// searchable entry of the drawn bucket is rotated to its back and
    /// returned.
    pub fn pick_weighted(
        &mut self,
        rng: &mut impl Rng,
        allow: impl Fn(&Bundle) -> bool,
    ) -> Option<BundleToken> {
        let weights: Vec<usize> = Priority::ALL
            .iter()
            .map(|priority| {
                let searchable = self.buckets[priority.index()]
                    .iter()
                    .filter_map(|t| self.bundles.get(t))
                    .filter(|b| allow(b))
                    .count();
                priority.search_weight() * searchable
            })
            .collect();

        let dist = WeightedIndex::new(&weights).ok()?;
        let level = dist.sample(rng);

        let bucket = &mut self.buckets[level];
        let pos = bucket
            .iter()
            .position(|t| self.bundles.get(t).is_some_and(&allow))?;
        let token = bucket.remove(pos)?;
        bucket.push_back(token);
        trace!(bundle = %token, level, "picked bundle for search");
        Some(token)
    }

    /// Cycles the recent bucket once and returns its first searchable entry.
    ///
    /// Entries whose recent window has run out move to their priority
    /// bucket on the way.
    pub fn pick_recent(
        &mut self,
        now_unix: u64,
        window: Duration,
        allow: impl Fn(&Bundle) -> bool,
    ) -> Option<BundleToken> {
        for _ in 0..self.recent.len() {
            let token = self.recent.pop_front()?;
            let Some(bundle) = self.bundles.get_mut(&token) else {
                continue;
            };
            if !bundle.check_recent(now_unix, window) {
                trace!(bundle = %token, "bundle no longer recent");
                self.add_search(token);
                continue;
            }
            self.recent.push_back(token);
            if allow(bundle) {
                return Some(token);
            }
        }
        None
    }

    /// Returns the bundle due for an auto-search at `now`, if any.
    ///
    /// The priority buckets and the recent bucket each keep their own
    /// schedule; `force` ignores the priority schedule.
    #[allow(clippy::too_many_arguments)]
    pub fn due_search(
        &mut self,
        now: Instant,
        now_unix: u64,
        window: Duration,
        configured: Duration,
        force: bool,
        rng: &mut impl Rng,
        allow: impl Fn(&Bundle) -> bool,
    ) -> Option<BundleToken> {
        let normal_due = force || self.next_search.map_or(true, |at| at <= now);
        if normal_due {
            let picked = self.pick_weighted(rng, &allow);
            if picked.is_some() || self.next_search.is_none() {
                self.next_search = Some(now + self.search_interval(configured, &allow));
            }
            if picked.is_some() {
                return picked;
            }
        }

        let recent_due = self.next_recent_search.map_or(true, |at| at <= now);
        if recent_due {
            let picked = self.pick_recent(now_unix, window, &allow);
            if let Some(interval) = self.recent_interval() {
                self.next_recent_search = Some(now + interval);
            }
            return picked;
        }
        None
    }

    pub fn next_search_at(&self) -> Option<Instant> {
        self.next_search
    }
}
