//! The queue engine's public face.
//!
//! [`QueueManager`] owns the file, user and bundle queues behind one
//! `RwLock`. Collaborators (hash store, share index, user directory, search
//! manager, connection control) are only ever called after that lock has
//! been released; anything they need from the queue is copied out first.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, info, trace, warn};

use super::auto_priority::{self, Candidate};
use super::block_map::BlockMap;
use super::bundle::{Bundle, BundleKind, BundleStatus, BundleToken};
use super::bundle_queue::BundleQueue;
use super::error::{QueueError, SegmentError};
use super::file_queue::{Added, FileQueue, NewItem};
use super::item::{
    file_name, DownloadKind, ItemFlags, PartialSource, QueueItem, QueueItemId, RunningDownload,
    SegmentPolicy, SourceFlags,
};
use super::persistence::{self, LoadedBundle};
use super::priority::Priority;
use super::segment::{round_down, Segment, SegmentSet};
use super::user_queue::{BlockInfo, NextDownload, NextRequest, UserQueue};
use super::worker::{MoveJob, MoveOutcome, RecheckJob, RecheckResult};
use crate::connection::ConnectionToken;
use crate::constants::{
    HASH_LEN, ITEMS_PER_BUNDLE_SEARCH, MIN_BLOCK_SIZE, PFS_QUERIES_PER_MINUTE, TEMP_EXTENSION,
};
use crate::hash::{HashTree, TthValue};
use crate::search::{Search, SearchKind, SearchManager};
use crate::services::{ConnectionControl, HashStore, PartialQuery, ShareIndex, UserDirectory};
use crate::settings::{AutoPriorityMode, QueueSettings};
use crate::user::{HintedUser, UserId};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Owner tag of the searches the queue puts into the search queue.
const SEARCH_OWNER: &str = "queue";

/// Notifications about queue changes.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    ItemAdded { id: QueueItemId, target: String },
    ItemRemoved { id: QueueItemId },
    ItemRetargeted { id: QueueItemId, target: String },
    ItemFinished { id: QueueItemId },
    /// The finished file reached `path`.
    ItemMoved { id: QueueItemId, path: PathBuf },
    SourcesChanged { id: QueueItemId },
    PriorityChanged { id: QueueItemId, priority: Priority },
    BundleAdded { token: BundleToken },
    BundleRemoved { token: BundleToken },
    /// Every item of the bundle finished; `notify` lists the peers waiting
    /// to hear about it.
    BundleDownloaded {
        token: BundleToken,
        notify: Vec<HintedUser>,
    },
    BundlePriority {
        token: BundleToken,
        priority: Priority,
    },
    RecheckDone { id: QueueItemId, bad_blocks: usize },
    RecheckFailed { id: QueueItemId, reason: String },
}

/// One file of a directory being queued, relative to the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryFile {
    pub path: String,
    pub size: u64,
    pub tth: TthValue,
}

impl DirectoryFile {
    pub fn new(path: impl Into<String>, size: u64, tth: TthValue) -> Self {
        Self {
            path: path.into(),
            size,
            tth,
        }
    }
}

/// A peer a new item is downloaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSource {
    pub user: HintedUser,
    pub nick: String,
}

impl NewSource {
    pub fn new(user: HintedUser, nick: impl Into<String>) -> Self {
        Self {
            user,
            nick: nick.into(),
        }
    }
}

/// What a connection asks for in [`QueueManager::get_download`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloadRequest {
    /// `None` uses the configured default chunk size.
    pub chunk_size: Option<u64>,
    /// The peer's recent speed in bytes per second.
    pub speed: u64,
    pub small_slot: bool,
}

/// Work handed to a download connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadAssignment {
    pub token: ConnectionToken,
    pub item: QueueItemId,
    pub kind: DownloadKind,
    pub target: String,
    pub temp_target: String,
    pub tth: TthValue,
    pub size: u64,
    pub segment: Segment,
    pub block_size: u64,
    /// Hub the source is reached through.
    pub hub: String,
    pub flags: ItemFlags,
}

/// How a download ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The whole assigned segment arrived.
    Finished,
    /// The transfer stopped after `pos` bytes of the segment.
    Failed { pos: u64 },
    TreeFinished(HashTree),
    /// A partial source turned out to have nothing we need.
    NoNeededParts,
    FileNotAvailable,
    SlowSource,
}

#[derive(Debug, Default)]
struct QueueState {
    files: FileQueue,
    users: UserQueue,
    bundles: BundleQueue,
    running: HashMap<ConnectionToken, QueueItemId>,
}

/// Side effects collected under the lock and carried out after it.
#[derive(Debug, Default)]
struct Effects {
    events: Vec<QueueEvent>,
    detach: Vec<ConnectionToken>,
    moves: Vec<MoveJob>,
    connect: Vec<(HintedUser, bool)>,
    store_tree: Option<(QueueItemId, UserId, HashTree)>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn effective_priority(bundles: &BundleQueue, item: &QueueItem) -> Priority {
    match item.bundle.and_then(|t| bundles.get(t)) {
        Some(bundle) if bundle.is_paused() => Priority::Paused,
        _ => item.priority,
    }
}

fn dir_path(dir: &str) -> String {
    if dir.ends_with(['/', '\\']) {
        dir.to_string()
    } else {
        format!("{dir}/")
    }
}

/// Takes every running download of `id` matching `pred` out of the queue.
fn take_downloads(
    state: &mut QueueState,
    id: QueueItemId,
    pred: impl Fn(&RunningDownload) -> bool,
) -> Vec<ConnectionToken> {
    let Some(item) = state.files.get_mut(id) else {
        return Vec::new();
    };
    let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut item.downloads)
        .into_iter()
        .partition(|d| pred(d));
    item.downloads = kept;
    for download in &taken {
        state.running.remove(&download.token);
        state.users.remove_running(&download.user, id);
    }
    taken.into_iter().map(|d| d.token).collect()
}

/// Coordinates the file, user and bundle queues.
pub struct QueueManager {
    settings: QueueSettings,
    state: RwLock<QueueState>,
    hashes: Arc<dyn HashStore>,
    share: Arc<dyn ShareIndex>,
    users: Arc<dyn UserDirectory>,
    search: Arc<SearchManager>,
    connections: RwLock<Option<Weak<dyn ConnectionControl>>>,
    events: broadcast::Sender<QueueEvent>,
    mover_tx: mpsc::UnboundedSender<MoveJob>,
    mover_rx: Mutex<Option<mpsc::UnboundedReceiver<MoveJob>>>,
    recheck_tx: mpsc::UnboundedSender<RecheckJob>,
    recheck_rx: Mutex<Option<mpsc::UnboundedReceiver<RecheckJob>>>,
    dirty: AtomicBool,
}

impl QueueManager {
    pub fn new(
        settings: QueueSettings,
        hashes: Arc<dyn HashStore>,
        share: Arc<dyn ShareIndex>,
        users: Arc<dyn UserDirectory>,
        search: Arc<SearchManager>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (mover_tx, mover_rx) = mpsc::unbounded_channel();
        let (recheck_tx, recheck_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            settings,
            state: RwLock::new(QueueState::default()),
            hashes,
            share,
            users,
            search,
            connections: RwLock::new(None),
            events,
            mover_tx,
            mover_rx: Mutex::new(Some(mover_rx)),
            recheck_tx,
            recheck_rx: Mutex::new(Some(recheck_rx)),
            dirty: AtomicBool::new(false),
        })
    }

    /// Wires the connection engine in; held weakly.
    pub fn set_connection_control(&self, control: Weak<dyn ConnectionControl>) {
        *self.connections.write() = Some(control);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Spawns the minute timer, the mover and the recheck worker.
    ///
    /// The workers run once; later calls only log.
    pub fn start(self: &Arc<Self>) {
        let (Some(mut moves), Some(mut rechecks)) =
            (self.mover_rx.lock().take(), self.recheck_rx.lock().take())
        else {
            warn!("queue manager already started");
            return;
        };

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(job) = moves.recv().await {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let result = job.run().await;
                manager.on_moved(job.item, result);
            }
        });

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(job) = rechecks.recv().await {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let item = job.item;
                let result = job.run(Arc::clone(&manager.hashes)).await;
                manager.on_rechecked(item, result);
            }
        });

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(60));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                {
                    let mut rng = rand::rng();
                    manager.on_minute(Instant::now(), unix_now(), &mut rng);
                }
                if let Err(err) = manager.save_if_dirty().await {
                    warn!(error = %err, "failed to save queue");
                }
            }
        });
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    fn control(&self) -> Option<Arc<dyn ConnectionControl>> {
        self.connections.read().as_ref().and_then(Weak::upgrade)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Runs everything collected under the lock. Must be called unlocked.
    fn apply(&self, effects: Effects) {
        if !effects.detach.is_empty() {
            if let Some(control) = self.control() {
                for token in &effects.detach {
                    control.detach_download(token);
                }
            }
        }

        if let Some((id, user, tree)) = effects.store_tree {
            self.finish_tree(id, user, tree);
        }

        for job in effects.moves {
            if self.mover_tx.send(job).is_err() {
                warn!("mover worker is gone");
            }
        }

        if !effects.connect.is_empty() {
            if let Some(control) = self.control() {
                for (user, small) in &effects.connect {
                    if self.users.is_online(&user.user) {
                        control.request_download(user, *small);
                    }
                }
            }
        }

        for event in effects.events {
            self.emit(event);
        }
    }

    fn temp_target_for(&self, target: &str, tth: &TthValue) -> String {
        match &self.settings.temp_directory {
            Some(dir) => dir
                .join(format!("{}.{}{}", file_name(target), tth, TEMP_EXTENSION))
                .to_string_lossy()
                .into_owned(),
            None => format!("{target}{TEMP_EXTENSION}"),
        }
    }

    fn segment_policy(&self) -> SegmentPolicy {
        SegmentPolicy {
            multi_segment: self.settings.multi_segment,
            target_duration: self.settings.target_segment_duration,
            overlap: self.settings.overlap,
        }
    }

    // ------------------------------------------------------------------------
    // Adding
    // ------------------------------------------------------------------------

    /// Queues a single file, in the directory bundle containing it or in a
    /// new file bundle.
    pub fn add_file(
        &self,
        target: &str,
        size: u64,
        tth: TthValue,
        source: Option<NewSource>,
        priority: Option<Priority>,
    ) -> Result<QueueItemId, QueueError> {
        if self.share.is_shared(&tth, file_name(target)) {
            return Err(QueueError::AlreadyShared(target.to_string()));
        }

        let mut effects = Effects::default();
        let (created, result) = {
            let mut state = self.state.write();
            let now_unix = unix_now();
            let new = NewItem {
                target: target.to_string(),
                size,
                tth,
                flags: ItemFlags::default(),
                priority,
                temp_target: self.temp_target_for(target, &tth),
                added: now_unix,
            };
            let added = state.files.add(new, &self.settings)?;
            let created = matches!(added, Added::New(_));
            if let Added::New(id) = added {
                self.attach_to_bundle(&mut state, id, None, now_unix, &mut effects);
                effects.events.push(QueueEvent::ItemAdded {
                    id,
                    target: target.to_string(),
                });
            }
            let result = match source {
                Some(source) => self
                    .add_source_locked(&mut state, added.id(), source, false, &mut effects)
                    .map(|_| added.id()),
                None => Ok(added.id()),
            };
            (created, result)
        };
        if created || result.is_ok() {
            self.mark_dirty();
        }
        self.apply(effects);
        result
    }

    /// Queues the files of a remote directory under `dir`.
    ///
    /// The files join the bundle already containing `dir` when there is one;
    /// bundles located beneath `dir` are absorbed. Files that cannot be
    /// queued are skipped. Returns the bundle and the number of files added.
    pub fn add_directory(
        &self,
        dir: &str,
        files: Vec<DirectoryFile>,
        source: Option<NewSource>,
        priority: Option<Priority>,
    ) -> Result<(BundleToken, usize), QueueError> {
        let dir = dir_path(dir);
        let files: Vec<DirectoryFile> = files
            .into_iter()
            .filter(|f| {
                let shared = self.share.is_shared(&f.tth, file_name(&f.path));
                if shared {
                    debug!(path = %f.path, "skipping shared file");
                }
                !shared
            })
            .collect();

        let mut effects = Effects::default();
        let result = {
            let mut state = self.state.write();
            self.add_directory_locked(&mut state, &dir, files, source, priority, &mut effects)
        };
        self.mark_dirty();
        self.apply(effects);
        result
    }

    fn add_directory_locked(
        &self,
        state: &mut QueueState,
        dir: &str,
        files: Vec<DirectoryFile>,
        source: Option<NewSource>,
        priority: Option<Priority>,
        effects: &mut Effects,
    ) -> Result<(BundleToken, usize), QueueError> {
        let now_unix = unix_now();
        let (token, created) = match state.bundles.find_containing(dir) {
            Some(token) => (token, false),
            None => {
                let token = self.unused_token(&state.bundles);
                let mut bundle = Bundle::new(
                    token,
                    dir.to_string(),
                    BundleKind::Directory,
                    priority.unwrap_or_default(),
                    now_unix,
                );
                bundle.check_recent(now_unix, self.settings.recent_bundle_window);
                state.bundles.add(bundle);
                (token, true)
            }
        };

        for sub in state.bundles.find_sub_bundles(dir) {
            if sub != token {
                self.absorb_bundle(state, token, sub, effects);
            }
        }

        let mut added = 0;
        let mut last_error = None;
        for file in files {
            let target = format!("{dir}{}", file.path.trim_start_matches(['/', '\\']));
            let new = NewItem {
                temp_target: self.temp_target_for(&target, &file.tth),
                target: target.clone(),
                size: file.size,
                tth: file.tth,
                flags: ItemFlags::default(),
                priority,
                added: now_unix,
            };
            let id = match state.files.add(new, &self.settings) {
                Ok(Added::New(id)) => {
                    self.attach_to_bundle(state, id, Some(token), now_unix, effects);
                    effects.events.push(QueueEvent::ItemAdded { id, target });
                    added += 1;
                    id
                }
                Ok(Added::Existing(id)) => id,
                Err(err) => {
                    warn!(%target, error = %err, "skipping directory file");
                    last_error = Some(err);
                    continue;
                }
            };
            if let Some(source) = source.clone() {
                match self.add_source_locked(state, id, source, false, effects) {
                    Ok(()) | Err(QueueError::DuplicateSource(_)) => {}
                    Err(err) => warn!(item = %id, error = %err, "source not added"),
                }
            }
        }

        let empty = state.bundles.get(token).map_or(true, Bundle::is_empty);
        if created && empty {
            state.bundles.remove(token);
            return Err(last_error.unwrap_or_else(|| QueueError::InvalidTarget(dir.to_string())));
        }
        if created {
            effects.events.push(QueueEvent::BundleAdded { token });
            info!(bundle = %token, %dir, files = added, "directory bundle queued");
        }
        Ok((token, added))
    }

    fn unused_token(&self, bundles: &BundleQueue) -> BundleToken {
        loop {
            let token = BundleToken::generate();
            if bundles.get(token).is_none() {
                return token;
            }
        }
    }

    /// Puts a new item in `preferred`, the directory bundle containing it,
    /// or a new file bundle.
    fn attach_to_bundle(
        &self,
        state: &mut QueueState,
        id: QueueItemId,
        preferred: Option<BundleToken>,
        now_unix: u64,
        effects: &mut Effects,
    ) {
        let Some(item) = state.files.get(id) else {
            return;
        };
        let target = item.target.clone();
        let size = item.size;

        let token = match preferred.or_else(|| state.bundles.find_containing(&target)) {
            Some(token) => token,
            None => {
                let token = self.unused_token(&state.bundles);
                let mut bundle = Bundle::new(
                    token,
                    target.clone(),
                    BundleKind::File,
                    item.priority,
                    now_unix,
                );
                bundle.check_recent(now_unix, self.settings.recent_bundle_window);
                state.bundles.add(bundle);
                effects.events.push(QueueEvent::BundleAdded { token });
                token
            }
        };

        if let Some(bundle) = state.bundles.get_mut(token) {
            bundle.add_item(id, size);
            if bundle.status != BundleStatus::Queued {
                bundle.status = BundleStatus::Queued;
                state.bundles.add_search(token);
            }
        }
        state.bundles.index_item(token, &target);
        if let Some(item) = state.files.get_mut(id) {
            item.bundle = Some(token);
        }
    }

    /// Moves every item of `from` into `into` and drops `from`.
    fn absorb_bundle(
        &self,
        state: &mut QueueState,
        into: BundleToken,
        from: BundleToken,
        effects: &mut Effects,
    ) {
        let Some(old) = state.bundles.remove(from) else {
            return;
        };
        debug!(into = %into, from = %from, "merging bundle");

        for id in old.items().iter().chain(old.finished_items()) {
            let Some(item) = state.files.get_mut(*id) else {
                continue;
            };
            item.bundle = Some(into);
            let (size, finished, target) = (item.size, item.is_finished(), item.target.clone());
            if let Some(bundle) = state.bundles.get_mut(into) {
                bundle.add_item(*id, size);
                if finished {
                    bundle.mark_finished(*id, size);
                } else {
                    bundle.status = BundleStatus::Queued;
                }
            }
            state.bundles.index_item(into, &target);

            if let Some(item) = state.files.get(*id).filter(|item| !item.is_finished()) {
                let priority = effective_priority(&state.bundles, item);
                state.users.set_priority(item, priority);
            }
        }
        for recipient in old.notify {
            if let Some(bundle) = state.bundles.get_mut(into) {
                bundle.notify.insert(recipient);
            }
        }
        effects.events.push(QueueEvent::BundleRemoved { token: from });
    }

    /// Queues a peer's file list, or one directory of it.
    pub fn add_list(
        &self,
        source: NewSource,
        flags: ItemFlags,
        partial_dir: Option<&str>,
    ) -> Result<QueueItemId, QueueError> {
        let mut flags = flags;
        flags.user_list = partial_dir.is_none();
        flags.partial_list = partial_dir.is_some();

        let mut name = format!("{}.{}", source.nick, source.user.user);
        if let Some(dir) = partial_dir {
            let dir: String = dir
                .chars()
                .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
                .collect();
            name = format!("{name}.{dir}");
        }
        let target = self
            .settings
            .file_list_directory
            .join(name)
            .to_string_lossy()
            .into_owned();

        let mut effects = Effects::default();
        let result = {
            let mut state = self.state.write();
            let new = NewItem {
                temp_target: target.clone(),
                target: target.clone(),
                size: 1,
                tth: TthValue([0; HASH_LEN]),
                flags,
                priority: Some(Priority::Highest),
                added: unix_now(),
            };
            let added = state.files.add(new, &self.settings)?;
            if let Added::New(id) = added {
                effects.events.push(QueueEvent::ItemAdded { id, target });
            }
            match self.add_source_locked(&mut state, added.id(), source, true, &mut effects) {
                Ok(()) | Err(QueueError::DuplicateSource(_)) => Ok(added.id()),
                Err(err) => Err(err),
            }
        };
        self.apply(effects);
        result
    }

    // ------------------------------------------------------------------------
    // Sources
    // ------------------------------------------------------------------------

    fn add_source_locked(
        &self,
        state: &mut QueueState,
        id: QueueItemId,
        source: NewSource,
        force: bool,
        effects: &mut Effects,
    ) -> Result<(), QueueError> {
        let QueueState {
            files,
            users,
            bundles,
            ..
        } = state;
        let item = files.get_mut(id).ok_or(QueueError::NotFound)?;
        if item.is_finished() {
            return Err(QueueError::AlreadyFinished(item.target.clone()));
        }
        item.add_source(source.user.clone(), &source.nick, force)?;

        let item = &*item;
        let priority = effective_priority(bundles, item);
        users.add_user(item, &source.user.user, priority);

        let small = item.flags.is_file_list() || item.size <= self.settings.small_file_size;
        effects.connect.push((source.user, small));
        effects.events.push(QueueEvent::SourcesChanged { id });
        Ok(())
    }

    /// Adds a source to a queued item.
    pub fn add_source(
        &self,
        id: QueueItemId,
        source: NewSource,
        force: bool,
    ) -> Result<(), QueueError> {
        let mut effects = Effects::default();
        let result = {
            let mut state = self.state.write();
            self.add_source_locked(&mut state, id, source, force, &mut effects)
        };
        if result.is_ok() {
            self.mark_dirty();
        }
        self.apply(effects);
        result
    }

    /// Records block availability a peer reported for `tth`.
    ///
    /// A peer already queued as a partial source gets its parts replaced
    /// and its pending-query counter reset; otherwise it is added as a new
    /// partial source to every unfinished item with that content. Returns
    /// the number of items touched.
    pub fn add_partial_source(
        &self,
        tth: &TthValue,
        source: NewSource,
        parts: Vec<u32>,
        udp: Option<SocketAddr>,
    ) -> usize {
        if !self.settings.partial_sharing {
            return 0;
        }

        let now = Instant::now();
        let mut effects = Effects::default();
        let mut touched = 0;
        {
            let mut state = self.state.write();
            let ids: Vec<QueueItemId> = state.files.find_tth(tth).to_vec();
            for id in ids {
                let Some(item) = state.files.get_mut(id) else {
                    continue;
                };
                if item.is_finished() {
                    continue;
                }

                if let Some(existing) = item.source_mut(&source.user.user) {
                    if existing.flags.partial {
                        let partial = existing
                            .partial
                            .get_or_insert_with(|| PartialSource::new(Vec::new(), udp, now));
                        partial.parts = parts.clone();
                        partial.pending_queries = 0;
                        if udp.is_some() {
                            partial.udp = udp;
                        }
                        touched += 1;
                    }
                    continue;
                }

                match self.add_source_locked(&mut state, id, source.clone(), false, &mut effects) {
                    Ok(()) => {
                        if let Some(added) = state
                            .files
                            .get_mut(id)
                            .and_then(|item| item.source_mut(&source.user.user))
                        {
                            added.flags.partial = true;
                            added.partial = Some(PartialSource::new(parts.clone(), udp, now));
                        }
                        touched += 1;
                    }
                    Err(err) => trace!(item = %id, error = %err, "partial source not added"),
                }
            }
        }
        if touched > 0 {
            self.mark_dirty();
        }
        self.apply(effects);
        touched
    }

    fn remove_source_locked(
        &self,
        state: &mut QueueState,
        id: QueueItemId,
        user: &UserId,
        reason: SourceFlags,
        effects: &mut Effects,
    ) -> Result<(), QueueError> {
        let item = state.files.get_mut(id).ok_or(QueueError::NotFound)?;
        if item.remove_source(user, reason).is_none() {
            return Err(QueueError::NotFound);
        }
        state.users.remove_user(id, user);
        effects
            .detach
            .extend(take_downloads(state, id, |d| &d.user == user));
        effects.events.push(QueueEvent::SourcesChanged { id });
        Ok(())
    }

    /// Drops `user` as a source of `id`, detaching its running download.
    pub fn remove_source(
        &self,
        id: QueueItemId,
        user: &UserId,
        reason: SourceFlags,
    ) -> Result<(), QueueError> {
        let mut effects = Effects::default();
        let result = {
            let mut state = self.state.write();
            self.remove_source_locked(&mut state, id, user, reason, &mut effects)
        };
        if result.is_ok() {
            self.mark_dirty();
        }
        self.apply(effects);
        result
    }

    /// Drops `user` from every item. Returns the number of items changed.
    pub fn remove_user_sources(&self, user: &UserId, reason: SourceFlags) -> usize {
        let mut effects = Effects::default();
        let removed = {
            let mut state = self.state.write();
            let ids: Vec<QueueItemId> = state
                .files
                .iter()
                .filter(|item| item.is_source(user))
                .map(|item| item.id)
                .collect();
            ids.into_iter()
                .filter(|id| {
                    self.remove_source_locked(&mut state, *id, user, reason, &mut effects)
                        .is_ok()
                })
                .count()
        };
        if removed > 0 {
            self.mark_dirty();
        }
        self.apply(effects);
        removed
    }

    // ------------------------------------------------------------------------
    // Removing and moving
    // ------------------------------------------------------------------------

    fn remove_item_locked(
        &self,
        state: &mut QueueState,
        id: QueueItemId,
        effects: &mut Effects,
    ) -> Option<QueueItem> {
        effects.detach.extend(take_downloads(state, id, |_| true));
        let item = state.files.remove(id)?;
        state.users.remove(&item);

        if let Some(token) = item.bundle {
            let empty = match state.bundles.get_mut(token) {
                Some(bundle) => {
                    if item.is_finished() {
                        bundle.remove_finished(id, item.size);
                    } else {
                        bundle.remove_item(id, item.size);
                        if bundle.items().is_empty() && !bundle.finished_items().is_empty() {
                            bundle.status = BundleStatus::Downloaded;
                        }
                    }
                    bundle.is_empty()
                }
                None => false,
            };
            if empty {
                state.bundles.remove(token);
                effects.events.push(QueueEvent::BundleRemoved { token });
            }
        }
        effects.events.push(QueueEvent::ItemRemoved { id });
        Some(item)
    }

    /// Removes an item from the queue and returns it, so the caller can
    /// clean up its temp file.
    pub fn remove_item(&self, id: QueueItemId) -> Result<QueueItem, QueueError> {
        let mut effects = Effects::default();
        let removed = {
            let mut state = self.state.write();
            self.remove_item_locked(&mut state, id, &mut effects)
        };
        self.mark_dirty();
        self.apply(effects);
        removed.ok_or(QueueError::NotFound)
    }

    /// Removes a bundle with all its items.
    pub fn remove_bundle(&self, token: BundleToken) -> Result<Vec<QueueItem>, QueueError> {
        let mut effects = Effects::default();
        let removed = {
            let mut state = self.state.write();
            let bundle = state.bundles.get(token).ok_or(QueueError::BundleNotFound)?;
            let ids: Vec<QueueItemId> = bundle
                .items()
                .iter()
                .chain(bundle.finished_items())
                .copied()
                .collect();
            let removed: Vec<QueueItem> = ids
                .into_iter()
                .filter_map(|id| self.remove_item_locked(&mut state, id, &mut effects))
                .collect();
            if state.bundles.remove(token).is_some() {
                effects.events.push(QueueEvent::BundleRemoved { token });
            }
            removed
        };
        info!(bundle = %token, items = removed.len(), "bundle removed");
        self.mark_dirty();
        self.apply(effects);
        Ok(removed)
    }

    /// Changes an item's target.
    ///
    /// When `new_target` holds a finished item, or the same content is
    /// already queued there, the moved item's sources are merged into that
    /// item and the moved item is removed. A queued item with different
    /// content at `new_target` is never overwritten.
    pub fn move_item(&self, id: QueueItemId, new_target: &str) -> Result<(), QueueError> {
        let mut effects = Effects::default();
        let result = {
            let mut state = self.state.write();
            self.move_item_locked(&mut state, id, new_target, &mut effects)
        };
        if result.is_ok() {
            self.mark_dirty();
        }
        self.apply(effects);
        result
    }

    fn move_item_locked(
        &self,
        state: &mut QueueState,
        id: QueueItemId,
        new_target: &str,
        effects: &mut Effects,
    ) -> Result<(), QueueError> {
        let item = state.files.get(id).ok_or(QueueError::NotFound)?;
        if item.target == new_target {
            return Ok(());
        }
        if item.is_finished() {
            return Err(QueueError::AlreadyFinished(item.target.clone()));
        }
        let (size, tth) = (item.size, item.tth);
        let sources: Vec<NewSource> = item
            .sources()
            .iter()
            .map(|s| NewSource::new(s.user.clone(), s.nick.clone()))
            .collect();

        if let Some(other) = state.files.find_target(new_target) {
            let existing = state.files.get_mut(other).ok_or(QueueError::NotFound)?;
            if existing.is_finished() {
                // the finished file stays; it only learns the moved sources
                for source in sources {
                    if let Err(err) = existing.add_source(source.user, &source.nick, false) {
                        debug!(item = %other, error = %err, "source not merged");
                    }
                }
                effects.events.push(QueueEvent::SourcesChanged { id: other });
            } else if existing.size != size || existing.tth != tth {
                return Err(QueueError::DuplicateTarget(new_target.to_string()));
            } else {
                for source in sources {
                    match self.add_source_locked(state, other, source, false, effects) {
                        Ok(()) | Err(QueueError::DuplicateSource(_)) => {}
                        Err(err) => debug!(item = %other, error = %err, "source not merged"),
                    }
                }
            }
            self.remove_item_locked(state, id, effects);
            return Ok(());
        }

        state.files.retarget(id, new_target.to_string())?;

        // rebundle
        let old_bundle = state.files.get(id).and_then(|item| item.bundle);
        if let Some(token) = old_bundle {
            let empty = match state.bundles.get_mut(token) {
                Some(bundle) => {
                    bundle.remove_item(id, size);
                    bundle.is_empty()
                }
                None => false,
            };
            if empty {
                state.bundles.remove(token);
                effects.events.push(QueueEvent::BundleRemoved { token });
            }
        }
        self.attach_to_bundle(state, id, None, unix_now(), effects);
        if let Some(item) = state.files.get(id) {
            let priority = effective_priority(&state.bundles, item);
            state.users.set_priority(item, priority);
        }

        effects.events.push(QueueEvent::ItemRetargeted {
            id,
            target: new_target.to_string(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Priorities
    // ------------------------------------------------------------------------

    fn apply_item_priority(
        state: &mut QueueState,
        id: QueueItemId,
        effects: &mut Effects,
    ) -> Option<Priority> {
        let item = state.files.get(id)?;
        if item.is_finished() {
            return None;
        }
        let priority = effective_priority(&state.bundles, item);
        state.users.set_priority(item, priority);
        if priority.is_paused() {
            effects.detach.extend(take_downloads(state, id, |_| true));
        }
        Some(priority)
    }

    /// Sets an item's priority and turns its auto-priority off. Pausing
    /// detaches its running downloads.
    pub fn set_item_priority(&self, id: QueueItemId, priority: Priority) -> Result<(), QueueError> {
        let mut effects = Effects::default();
        {
            let mut state = self.state.write();
            let item = state.files.get_mut(id).ok_or(QueueError::NotFound)?;
            item.priority = priority;
            item.auto_priority = false;
            Self::apply_item_priority(&mut state, id, &mut effects);
        }
        effects
            .events
            .push(QueueEvent::PriorityChanged { id, priority });
        self.mark_dirty();
        self.apply(effects);
        Ok(())
    }

    pub fn set_item_auto_priority(&self, id: QueueItemId, enabled: bool) -> Result<(), QueueError> {
        let mut state = self.state.write();
        let item = state.files.get_mut(id).ok_or(QueueError::NotFound)?;
        item.auto_priority = enabled;
        drop(state);
        self.mark_dirty();
        Ok(())
    }

    /// Sets a bundle's priority and turns its auto-priority off. A paused
    /// bundle is neither searched nor scheduled.
    pub fn set_bundle_priority(
        &self,
        token: BundleToken,
        priority: Priority,
    ) -> Result<(), QueueError> {
        let mut effects = Effects::default();
        {
            let mut state = self.state.write();
            if !state.bundles.set_priority(token, priority) {
                return Err(QueueError::BundleNotFound);
            }
            let ids: Vec<QueueItemId> = match state.bundles.get_mut(token) {
                Some(bundle) => {
                    bundle.auto_priority = false;
                    bundle.items().to_vec()
                }
                None => Vec::new(),
            };
            for id in ids {
                Self::apply_item_priority(&mut state, id, &mut effects);
            }
        }
        debug!(bundle = %token, %priority, "bundle priority set");
        effects
            .events
            .push(QueueEvent::BundlePriority { token, priority });
        self.mark_dirty();
        self.apply(effects);
        Ok(())
    }

    pub fn set_bundle_auto_priority(
        &self,
        token: BundleToken,
        enabled: bool,
    ) -> Result<(), QueueError> {
        let mut state = self.state.write();
        let bundle = state
            .bundles
            .get_mut(token)
            .ok_or(QueueError::BundleNotFound)?;
        bundle.auto_priority = enabled;
        drop(state);
        self.mark_dirty();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Download assignment
    // ------------------------------------------------------------------------

    /// Highest priority `user` has something to download at; `Paused` when
    /// nothing, or when the peer is on none of `hubs`.
    pub fn has_download(&self, user: &UserId, hubs: &[String], small_slot: bool) -> Priority {
        if hubs.is_empty() {
            return Priority::Paused;
        }
        let state = self.state.read();
        state
            .users
            .has_download(&state.files, user, small_slot, self.settings.small_file_size)
    }

    /// Assigns the next segment (or tree) `user` should fetch over the
    /// connection `token`.
    pub fn get_download(
        &self,
        token: &ConnectionToken,
        user: &UserId,
        hubs: &[String],
        request: DownloadRequest,
    ) -> Result<DownloadAssignment, SegmentError> {
        // Block sizes come from the hash store, which is asked unlocked.
        let candidates: Vec<TthValue> = {
            let state = self.state.read();
            Priority::ALL
                .iter()
                .flat_map(|p| state.users.user_list(user, *p))
                .filter_map(|id| state.files.get(id))
                .filter(|item| !item.flags.is_file_list() && item.size > MIN_BLOCK_SIZE)
                .map(|item| item.tth)
                .collect()
        };
        let block_sizes: HashMap<TthValue, u64> = candidates
            .into_iter()
            .filter_map(|tth| self.hashes.block_size(&tth).map(|size| (tth, size)))
            .collect();
        let block_info = |item: &QueueItem| {
            if item.size <= MIN_BLOCK_SIZE {
                return BlockInfo::Known(item.size);
            }
            match block_sizes.get(&item.tth) {
                Some(size) => BlockInfo::Known(*size),
                None => BlockInfo::TreeNeeded,
            }
        };

        let result = {
            let mut state = self.state.write();
            if let Some(stale) = state.running.get(token).copied() {
                warn!(%token, item = %stale, "connection still had a download, dropping it");
                take_downloads(&mut state, stale, |d| &d.token == token);
            }

            let now = Instant::now();
            let next_request = NextRequest {
                user: *user,
                min_priority: Priority::Lowest,
                chunk_size: request
                    .chunk_size
                    .unwrap_or(self.settings.default_chunk_size),
                speed: request.speed,
                allow_remove: true,
                small_slot_only: request.small_slot,
                small_file_size: self.settings.small_file_size,
                now,
                policy: self.segment_policy(),
                block_info: &block_info,
            };

            let QueueState {
                files,
                users,
                running,
                ..
            } = &mut *state;
            let next = users.get_next(files, &next_request);
            match next {
                Ok(next) => {
                    let id = next.item();
                    let (kind, segment, block_size) = match next {
                        NextDownload::Segment {
                            segment,
                            block_size,
                            ..
                        } => (DownloadKind::File, segment, block_size),
                        NextDownload::Tree { .. } => (DownloadKind::Tree, Segment::default(), 0),
                    };
                    match files.get_mut(id) {
                        Some(item) => {
                            let mut hub = String::new();
                            if let Some(source) = item.source_mut(user) {
                                if !hubs.is_empty() && !hubs.contains(&source.user.hub) {
                                    debug!(%user, hub = %hubs[0], "refreshing stale hub hint");
                                    source.user.hub = hubs[0].clone();
                                }
                                hub = source.user.hub.clone();
                            }
                            item.downloads.push(RunningDownload {
                                token: token.clone(),
                                user: *user,
                                kind,
                                segment,
                                block_size,
                                started: now,
                                pos: 0,
                                speed: request.speed,
                            });
                            running.insert(token.clone(), id);
                            users.add_running(user, id);
                            trace!(item = %id, %segment, ?kind, "download assigned");
                            Ok(DownloadAssignment {
                                token: token.clone(),
                                item: id,
                                kind,
                                target: item.target.clone(),
                                temp_target: item.temp_target.clone(),
                                tth: item.tth,
                                size: item.size,
                                segment,
                                block_size,
                                hub,
                                flags: item.flags,
                            })
                        }
                        None => Err(SegmentError::NoFilesAvailable),
                    }
                }
                Err(err) => {
                    trace!(%user, error = %err, "nothing to download");
                    Err(err)
                }
            }
        };
        result
    }

    /// Progress report from a running download.
    pub fn update_download(
        &self,
        token: &ConnectionToken,
        pos: u64,
        speed: u64,
    ) -> Result<(), QueueError> {
        let mut state = self.state.write();
        let id = *state.running.get(token).ok_or(QueueError::UnknownDownload)?;
        let download = state
            .files
            .get_mut(id)
            .and_then(|item| item.download_mut(token))
            .ok_or(QueueError::UnknownDownload)?;
        download.pos = pos.min(download.segment.size());
        download.speed = speed;
        Ok(())
    }

    /// Ends the download running on `token`.
    pub fn put_download(
        &self,
        token: &ConnectionToken,
        outcome: DownloadOutcome,
    ) -> Result<(), QueueError> {
        let mut effects = Effects::default();
        {
            let mut state = self.state.write();
            let id = state
                .running
                .remove(token)
                .ok_or(QueueError::UnknownDownload)?;
            let Some(item) = state.files.get_mut(id) else {
                return Ok(());
            };
            let Some(download) = item.take_download(token) else {
                return Ok(());
            };
            let user = download.user;
            state.users.remove_running(&user, id);

            let reason = match outcome {
                DownloadOutcome::Finished if download.kind == DownloadKind::File => {
                    self.record_segment(&mut state, id, download.segment, &mut effects);
                    None
                }
                DownloadOutcome::Finished => None,
                DownloadOutcome::Failed { pos } => {
                    if download.kind == DownloadKind::File && download.block_size > 0 {
                        let done = round_down(pos.min(download.segment.size()), download.block_size);
                        if done > 0 {
                            let segment = Segment::new(download.segment.start(), done);
                            self.record_segment(&mut state, id, segment, &mut effects);
                        }
                    }
                    None
                }
                DownloadOutcome::TreeFinished(tree) => {
                    effects.store_tree = Some((id, user, tree));
                    None
                }
                DownloadOutcome::NoNeededParts => Some(SourceFlags {
                    partial: true,
                    no_need_parts: true,
                    ..SourceFlags::default()
                }),
                DownloadOutcome::FileNotAvailable => Some(SourceFlags {
                    file_not_available: true,
                    ..SourceFlags::default()
                }),
                DownloadOutcome::SlowSource => Some(SourceFlags {
                    slow_source: true,
                    ..SourceFlags::default()
                }),
            };

            if let Some(reason) = reason {
                let _ = self.remove_source_locked(&mut state, id, &user, reason, &mut effects);
            }
        }
        self.mark_dirty();
        self.apply(effects);
        Ok(())
    }

    /// Adds finished bytes to an item, detaching downloads made redundant
    /// and finishing the item once it is complete.
    fn record_segment(
        &self,
        state: &mut QueueState,
        id: QueueItemId,
        segment: Segment,
        effects: &mut Effects,
    ) {
        let Some(item) = state.files.get_mut(id) else {
            return;
        };
        let complete = item.add_segment(segment);
        let done = item.done.clone();
        effects.detach.extend(take_downloads(state, id, |d| {
            d.kind == DownloadKind::File && done.contains_range(d.segment.start(), d.segment.end())
        }));
        if complete {
            self.finish_item(state, id, effects);
        }
    }

    fn finish_item(&self, state: &mut QueueState, id: QueueItemId, effects: &mut Effects) {
        effects.detach.extend(take_downloads(state, id, |_| true));
        let Some(item) = state.files.get_mut(id) else {
            return;
        };
        item.flags.finished = true;
        let (size, bundle, from, to) = (
            item.size,
            item.bundle,
            PathBuf::from(&item.temp_target),
            PathBuf::from(&item.target),
        );
        let item = &*item;
        state.users.remove(item);
        info!(item = %id, target = %item.target, "download finished");
        effects.events.push(QueueEvent::ItemFinished { id });

        if let Some(token) = bundle {
            if let Some(bundle) = state.bundles.get_mut(token) {
                bundle.mark_finished(id, size);
                if bundle.status == BundleStatus::Downloaded {
                    let notify: Vec<HintedUser> = bundle.notify.drain().collect();
                    state.bundles.remove_search(token);
                    info!(bundle = %token, "bundle downloaded");
                    effects
                        .events
                        .push(QueueEvent::BundleDownloaded { token, notify });
                }
            }
        }

        effects.moves.push(MoveJob { item: id, from, to });
    }

    /// Stores a downloaded tree, or drops the source that sent a bad one.
    fn finish_tree(&self, id: QueueItemId, user: UserId, tree: HashTree) {
        let expected = self.state.read().files.get(id).map(|item| item.tth);
        let Some(expected) = expected else {
            return;
        };
        if tree.root == expected && tree.is_consistent() {
            debug!(item = %id, blocks = tree.leaf_count(), "hash tree stored");
            self.hashes.store_tree(tree);
            return;
        }

        warn!(item = %id, %user, "peer sent an invalid hash tree");
        let reason = SourceFlags {
            bad_tree: true,
            ..SourceFlags::default()
        };
        let _ = self.remove_source(id, &user, reason);
    }

    /// Result of the mover for a finished item.
    pub fn on_moved(&self, id: QueueItemId, result: io::Result<MoveOutcome>) {
        let mut effects = Effects::default();
        {
            let mut state = self.state.write();
            match result {
                Ok(outcome) => {
                    let path = outcome.path().to_path_buf();
                    if let MoveOutcome::MovedInPlace(_) = outcome {
                        warn!(item = %id, path = %path.display(), "file left in the temp directory");
                    }
                    let is_list = match state.files.get_mut(id) {
                        Some(item) => {
                            item.flags.moved = true;
                            item.flags.is_file_list()
                        }
                        None => false,
                    };
                    effects.events.push(QueueEvent::ItemMoved { id, path });
                    if is_list {
                        self.remove_item_locked(&mut state, id, &mut effects);
                    }
                }
                Err(err) => warn!(item = %id, error = %err, "failed to move finished file"),
            }
        }
        self.apply(effects);
    }

    /// Purges a downloaded bundle once its files are hashed.
    ///
    /// Returns false when the bundle still has queued items.
    pub fn bundle_hashed(&self, token: BundleToken) -> Result<bool, QueueError> {
        let mut effects = Effects::default();
        {
            let mut state = self.state.write();
            let bundle = state
                .bundles
                .get_mut(token)
                .ok_or(QueueError::BundleNotFound)?;
            if !bundle.items().is_empty() {
                debug!(bundle = %token, "bundle still has queued items");
                return Ok(false);
            }
            bundle.status = BundleStatus::Finished;
            let finished = bundle.finished_items().to_vec();
            for id in finished {
                if let Some(item) = state.files.get_mut(id) {
                    item.flags.hashed = true;
                }
                if state.files.remove(id).is_some() {
                    effects.events.push(QueueEvent::ItemRemoved { id });
                }
            }
            state.bundles.remove(token);
            effects.events.push(QueueEvent::BundleRemoved { token });
        }
        info!(bundle = %token, "bundle finished");
        self.mark_dirty();
        self.apply(effects);
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Integrity recheck
    // ------------------------------------------------------------------------

    /// Queues a verification of the item's temp file against its tree.
    pub fn recheck(&self, id: QueueItemId) -> Result<(), QueueError> {
        let (target, path, tth, size) = {
            let state = self.state.read();
            let item = state.files.get(id).ok_or(QueueError::NotFound)?;
            if item.is_finished() {
                return Err(QueueError::AlreadyFinished(item.target.clone()));
            }
            if item.is_running() {
                return Err(QueueError::Running(item.target.clone()));
            }
            (
                item.target.clone(),
                PathBuf::from(&item.temp_target),
                item.tth,
                item.size,
            )
        };

        let block_size = match self.hashes.block_size(&tth) {
            Some(block_size) => block_size,
            None if size <= MIN_BLOCK_SIZE => size,
            None => return Err(QueueError::TreeUnavailable(target)),
        };

        debug!(item = %id, "queueing recheck");
        self.recheck_tx
            .send(RecheckJob {
                item: id,
                path,
                tth,
                size,
                block_size,
            })
            .map_err(|_| QueueError::Io(io::Error::other("recheck worker is gone")))
    }

    /// Applies a recheck result.
    ///
    /// No bad blocks means the temp file is complete and gets moved;
    /// otherwise the done ranges are reset to the verified blocks.
    pub fn on_rechecked(&self, id: QueueItemId, result: io::Result<RecheckResult>) {
        let result = match result {
            Ok(result) => result,
            Err(err) => {
                warn!(item = %id, error = %err, "recheck failed");
                self.emit(QueueEvent::RecheckFailed {
                    id,
                    reason: err.to_string(),
                });
                return;
            }
        };

        let mut effects = Effects::default();
        {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let Some(item) = state.files.get_mut(id) else {
                return;
            };
            if item.is_running() || item.is_finished() {
                debug!(item = %id, "item changed during recheck, result dropped");
                return;
            }

            if result.is_complete() {
                let mut full = SegmentSet::new();
                full.add(Segment::new(0, item.size), item.size);
                item.reset_done(full);
                info!(item = %id, "recheck found no bad blocks");
                self.finish_item(state, id, &mut effects);
            } else {
                info!(item = %id, bad = result.bad_blocks, "recheck reset bad blocks");
                item.reset_done(result.good.clone());
                let item = &*item;
                let priority = effective_priority(&state.bundles, item);
                state.users.set_priority(item, priority);
            }
            effects.events.push(QueueEvent::RecheckDone {
                id,
                bad_blocks: result.bad_blocks,
            });
        }
        self.mark_dirty();
        self.apply(effects);
    }

    // ------------------------------------------------------------------------
    // Minute tick
    // ------------------------------------------------------------------------

    fn online_sources(&self) -> HashSet<UserId> {
        let users: HashSet<UserId> = {
            let state = self.state.read();
            state
                .files
                .iter()
                .filter(|item| !item.is_finished())
                .flat_map(|item| item.sources().iter().map(|s| s.user.user))
                .collect()
        };
        users
            .into_iter()
            .filter(|user| self.users.is_online(user))
            .collect()
    }

    /// Auto-priority, auto-search and partial-source queries.
    pub fn on_minute(&self, now: Instant, now_unix: u64, rng: &mut impl Rng) {
        let online = self.online_sources();
        let mut effects = Effects::default();
        let mut searches = Vec::new();
        let mut pfs = Vec::new();
        {
            let mut state = self.state.write();
            self.recalculate_priorities(&mut state, now_unix, &online, &mut effects);
            if self.settings.auto_search {
                searches = self.pick_auto_searches(&mut state, now, now_unix, &online, rng);
            }
            if self.settings.partial_sharing {
                let targets = state
                    .files
                    .find_partial_query_targets(now, PFS_QUERIES_PER_MINUTE);
                for target in targets {
                    let done = match state.files.get(target.item) {
                        Some(item) => (item.done.clone(), item.size),
                        None => continue,
                    };
                    pfs.push((target, done));
                }
            }
        }

        for search in searches {
            self.search.add(search);
        }

        for (target, (done, size)) in pfs {
            let Some(block_size) = self.hashes.block_size(&target.tth) else {
                continue;
            };
            let needed = BlockMap::needed(&done, size, block_size);
            let mut have = BlockMap::new(needed.block_count());
            for index in 0..needed.block_count() {
                if !needed.has(index) {
                    have.set(index);
                }
            }
            trace!(user = %target.user, tth = %target.tth, "querying partial source");
            self.search.send_partial_query(&PartialQuery {
                user: target.user,
                udp: target.udp,
                tth: target.tth,
                parts: have.to_parts(),
            });
        }

        if !effects.events.is_empty() {
            self.mark_dirty();
        }
        self.apply(effects);
    }

    fn recalculate_priorities(
        &self,
        state: &mut QueueState,
        now_unix: u64,
        online: &HashSet<UserId>,
        effects: &mut Effects,
    ) {
        let is_online = |u: &UserId| online.contains(u);
        let mut bundle_changes: Vec<(BundleToken, Priority)> = Vec::new();
        let mut item_changes: Vec<(QueueItemId, Priority)> = Vec::new();

        match self.settings.auto_priority {
            AutoPriorityMode::Disabled => return,
            AutoPriorityMode::Progress => {
                for bundle in state.bundles.iter().filter(|b| b.auto_priority) {
                    let downloaded = bundle.finished_bytes()
                        + bundle
                            .items()
                            .iter()
                            .filter_map(|id| state.files.get(*id))
                            .map(QueueItem::downloaded_bytes)
                            .sum::<u64>();
                    let elapsed = Duration::from_secs(now_unix.saturating_sub(bundle.added));
                    let priority = auto_priority::progress(downloaded, bundle.size(), elapsed);
                    bundle_changes.push((bundle.token, priority));
                }
                for item in state.files.iter().filter(|i| i.auto_priority && !i.is_finished()) {
                    let elapsed = Duration::from_secs(now_unix.saturating_sub(item.added));
                    let priority =
                        auto_priority::progress(item.downloaded_bytes(), item.size, elapsed);
                    item_changes.push((item.id, priority));
                }
            }
            AutoPriorityMode::Balanced => {
                let bundles: Vec<Candidate<BundleToken>> = state
                    .bundles
                    .iter()
                    .filter(|b| b.auto_priority && b.status == BundleStatus::Queued)
                    .map(|bundle| {
                        let items: Vec<&QueueItem> = bundle
                            .items()
                            .iter()
                            .filter_map(|id| state.files.get(*id))
                            .collect();
                        let sources: HashSet<UserId> = items
                            .iter()
                            .flat_map(|item| item.sources().iter().map(|s| s.user.user))
                            .filter(|u| is_online(u))
                            .collect();
                        Candidate {
                            key: bundle.token,
                            speed: items.iter().map(|item| item.average_speed()).sum(),
                            online_sources: sources.len(),
                        }
                    })
                    .collect();
                bundle_changes = auto_priority::balanced(&bundles);

                let items: Vec<Candidate<QueueItemId>> = state
                    .files
                    .iter()
                    .filter(|i| i.auto_priority && !i.is_finished() && !i.flags.is_file_list())
                    .map(|item| Candidate {
                        key: item.id,
                        speed: item.average_speed(),
                        online_sources: item.online_sources(is_online),
                    })
                    .collect();
                item_changes = auto_priority::balanced(&items);
            }
        }

        for (token, priority) in bundle_changes {
            let changed = state
                .bundles
                .get(token)
                .is_some_and(|b| b.priority != priority);
            if !changed {
                continue;
            }
            state.bundles.set_priority(token, priority);
            let ids = state
                .bundles
                .get(token)
                .map(|b| b.items().to_vec())
                .unwrap_or_default();
            for id in ids {
                Self::apply_item_priority(state, id, effects);
            }
            debug!(bundle = %token, %priority, "auto priority");
            effects
                .events
                .push(QueueEvent::BundlePriority { token, priority });
        }

        for (id, priority) in item_changes {
            let Some(item) = state.files.get_mut(id) else {
                continue;
            };
            if item.priority == priority {
                continue;
            }
            item.priority = priority;
            Self::apply_item_priority(state, id, effects);
            effects
                .events
                .push(QueueEvent::PriorityChanged { id, priority });
        }
    }

    fn pick_auto_searches(
        &self,
        state: &mut QueueState,
        now: Instant,
        now_unix: u64,
        online: &HashSet<UserId>,
        rng: &mut impl Rng,
    ) -> Vec<Search> {
        let allow = |b: &Bundle| b.status == BundleStatus::Queued && !b.items().is_empty();
        let Some(token) = state.bundles.due_search(
            now,
            now_unix,
            self.settings.recent_bundle_window,
            self.settings.auto_search_interval,
            false,
            rng,
            allow,
        ) else {
            return Vec::new();
        };

        match state.bundles.get_mut(token) {
            Some(bundle) => bundle.last_search = Some(now),
            None => return Vec::new(),
        }

        let mut searches = Vec::new();
        for _ in 0..ITEMS_PER_BUNDLE_SEARCH {
            let picked = state.files.find_auto_search(
                rng,
                self.settings.auto_search_source_limit,
                |u| online.contains(u),
                |item| item.bundle == Some(token),
            );
            let Some(id) = picked else {
                break;
            };
            let Some(item) = state.files.get(id) else {
                continue;
            };
            searches.push(Search::for_tth(
                SearchKind::AutoSearch,
                &item.tth,
                SEARCH_OWNER,
            ));
        }
        debug!(bundle = %token, searches = searches.len(), "auto search");
        searches
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Serialized queue, without file lists.
    pub fn to_xml(&self) -> String {
        let state = self.state.read();
        persistence::to_document(state.bundles.iter(), |id| state.files.get(id)).to_document()
    }

    /// Writes the queue file. Does nothing without a configured path.
    pub async fn save(&self) -> Result<(), QueueError> {
        let Some(path) = self.settings.queue_file.clone() else {
            return Ok(());
        };
        self.dirty.store(false, Ordering::Relaxed);
        let document = self.to_xml();
        if let Err(err) = persistence::write_atomically(&path, document.as_bytes()).await {
            self.mark_dirty();
            return Err(err);
        }
        Ok(())
    }

    pub async fn save_if_dirty(&self) -> Result<(), QueueError> {
        if self.is_dirty() {
            self.save().await?;
        }
        Ok(())
    }

    /// Loads the queue file (or its backup) into the queue. Returns the
    /// number of items loaded.
    pub async fn load(&self) -> Result<usize, QueueError> {
        let Some(path) = self.settings.queue_file.clone() else {
            return Ok(0);
        };
        let exists = tokio::fs::try_exists(&path).await?
            || tokio::fs::try_exists(persistence::backup_path(&path)).await?;
        if !exists {
            return Ok(0);
        }
        self.load_from(&path).await
    }

    async fn load_from(&self, path: &Path) -> Result<usize, QueueError> {
        let root = persistence::read_with_backup(path).await?;
        let loaded = persistence::from_document(&root).map_err(|reason| {
            QueueError::Persistence {
                path: path.to_path_buf(),
                reason,
            }
        })?;

        let mut count = 0;
        let mut effects = Effects::default();
        {
            let mut state = self.state.write();
            let now_unix = unix_now();
            for bundle in loaded {
                count += self.insert_loaded(&mut state, bundle, now_unix, &mut effects);
            }
        }
        self.apply(effects);
        info!(path = %path.display(), items = count, "queue loaded");
        Ok(count)
    }

    fn insert_loaded(
        &self,
        state: &mut QueueState,
        loaded: LoadedBundle,
        now_unix: u64,
        effects: &mut Effects,
    ) -> usize {
        let token = if state.bundles.get(loaded.token).is_some() {
            self.unused_token(&state.bundles)
        } else {
            loaded.token
        };
        let mut bundle = Bundle::new(
            token,
            loaded.target.clone(),
            loaded.kind,
            loaded.priority,
            loaded.added,
        );
        bundle.auto_priority = loaded.auto_priority;
        bundle.check_recent(now_unix, self.settings.recent_bundle_window);

        let mut ids = Vec::new();
        let mut complete = Vec::new();
        for entry in loaded.items {
            if state.files.find_target(&entry.target).is_some() {
                warn!(target = %entry.target, "skipping duplicate queue entry");
                continue;
            }
            let id = state.files.next_id();
            let temp_target = if entry.temp_target.is_empty() {
                self.temp_target_for(&entry.target, &entry.tth)
            } else {
                entry.temp_target.clone()
            };
            let mut item = QueueItem::new(
                id,
                entry.target,
                temp_target,
                entry.size,
                entry.tth,
                entry.priority,
                ItemFlags::default(),
                entry.max_segments,
                entry.added,
            );
            item.auto_priority = entry.auto_priority;
            item.bundle = Some(token);
            if entry.finished {
                item.flags.finished = true;
                item.add_segment(Segment::new(0, entry.size));
            } else {
                for segment in entry.segments {
                    item.add_segment(segment);
                }
                for source in entry.sources {
                    let user = HintedUser::new(source.user, source.hub);
                    if let Err(err) = item.add_source(user, &source.nick, true) {
                        debug!(error = %err, "skipping loaded source");
                    }
                }
                if item.done_segments().covers(item.size) {
                    complete.push(id);
                }
            }
            ids.push((id, item.size, item.is_finished(), item.target.clone()));
            state.files.insert(item);
        }

        if ids.is_empty() {
            warn!(bundle = %loaded.target, "skipping empty bundle");
            return 0;
        }

        state.bundles.add(bundle);
        for (id, size, finished, target) in &ids {
            if let Some(bundle) = state.bundles.get_mut(token) {
                bundle.add_item(*id, *size);
                if *finished {
                    bundle.mark_finished(*id, *size);
                }
            }
            state.bundles.index_item(token, target);
        }
        if let Some(bundle) = state.bundles.get_mut(token) {
            bundle.status = if bundle.items().is_empty() {
                BundleStatus::Downloaded
            } else {
                BundleStatus::Queued
            };
            if bundle.status == BundleStatus::Downloaded {
                state.bundles.remove_search(token);
            }
        }
        for (id, _, finished, _) in &ids {
            if *finished {
                continue;
            }
            if let Some(item) = state.files.get(*id) {
                let priority = effective_priority(&state.bundles, item);
                state.users.add(item, priority);
            }
        }
        for id in complete {
            debug!(item = %id, "loaded item is already complete");
            self.finish_item(state, id, effects);
        }
        ids.len()
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    pub fn item(&self, id: QueueItemId) -> Option<QueueItem> {
        self.state.read().files.get(id).cloned()
    }

    pub fn bundle(&self, token: BundleToken) -> Option<Bundle> {
        self.state.read().bundles.get(token).cloned()
    }

    pub fn bundles(&self) -> Vec<Bundle> {
        self.state.read().bundles.iter().cloned().collect()
    }

    pub fn item_count(&self) -> usize {
        self.state.read().files.len()
    }

    pub fn find_target(&self, target: &str) -> Option<QueueItemId> {
        self.state.read().files.find_target(target)
    }

    pub fn find_tth(&self, tth: &TthValue) -> Vec<QueueItemId> {
        self.state.read().files.find_tth(tth).to_vec()
    }

    pub fn find_by_size_and_suffix(&self, size: u64, suffix: &str) -> Option<QueueItemId> {
        self.state.read().files.find_by_size_and_suffix(size, suffix)
    }

    /// Priority level the item is scheduled at, if it has any sources.
    pub fn scheduled_priority(&self, id: QueueItemId) -> Option<Priority> {
        self.state.read().users.priority_of(id)
    }

    /// Scheduling entries of `id` for `user` across every priority level.
    pub fn schedule_entries(&self, id: QueueItemId, user: &UserId) -> usize {
        self.state.read().users.entries(id, user)
    }

    pub fn running_downloads(&self) -> usize {
        self.state.read().running.len()
    }

    /// Local folder and bundle a remote folder is queued as.
    pub fn find_remote_dir(&self, remote_path: &str) -> Option<(BundleToken, String)> {
        self.state.read().bundles.find_remote_dir(remote_path)
    }

    /// Adds a peer to be told when the bundle finishes.
    pub fn add_finished_notify(
        &self,
        token: BundleToken,
        user: HintedUser,
    ) -> Result<(), QueueError> {
        let mut state = self.state.write();
        let bundle = state
            .bundles
            .get_mut(token)
            .ok_or(QueueError::BundleNotFound)?;
        bundle.notify.insert(user);
        Ok(())
    }

    pub fn remove_finished_notify(
        &self,
        token: BundleToken,
        user: &HintedUser,
    ) -> Result<(), QueueError> {
        let mut state = self.state.write();
        let bundle = state
            .bundles
            .get_mut(token)
            .ok_or(QueueError::BundleNotFound)?;
        bundle.notify.remove(user);
        Ok(())
    }
}

