use super::*;
use crate::connection::{ConnectionError, ConnectionToken};
use crate::hash::{HashTree, TthValue};
use crate::search::{Search, SearchManager};
use crate::services::{
    ConnectionControl, HashStore, PartialQuery, SearchSink, ShareIndex, UserDirectory,
};
use crate::settings::{OverlapPolicy, QueueSettings, SearchSettings};
use crate::user::{HintedUser, UserId};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const MIB: u64 = 1024 * 1024;

#[derive(Default)]
struct FakeHashes {
    block_sizes: Mutex<HashMap<TthValue, u64>>,
    stored: Mutex<Vec<HashTree>>,
    verify: Mutex<Vec<bool>>,
}

impl FakeHashes {
    fn with_block_size(self, tth: TthValue, size: u64) -> Self {
        self.block_sizes.lock().insert(tth, size);
        self
    }
}

impl HashStore for FakeHashes {
    fn block_size(&self, tth: &TthValue) -> Option<u64> {
        self.block_sizes.lock().get(tth).copied()
    }

    fn store_tree(&self, tree: HashTree) {
        self.stored.lock().push(tree);
    }

    fn verify_blocks(&self, _path: &Path, _tth: &TthValue, _size: u64) -> io::Result<Vec<bool>> {
        Ok(self.verify.lock().clone())
    }
}

#[derive(Default)]
struct FakeShare {
    shared: HashSet<TthValue>,
}

impl ShareIndex for FakeShare {
    fn is_shared(&self, tth: &TthValue, _name: &str) -> bool {
        self.shared.contains(tth)
    }
}

#[derive(Default)]
struct FakeUsers {
    online: Mutex<HashSet<UserId>>,
}

impl UserDirectory for FakeUsers {
    fn is_online(&self, user: &UserId) -> bool {
        self.online.lock().contains(user)
    }

    fn online_hubs(&self, _user: &UserId) -> Vec<String> {
        vec![HUB.to_string()]
    }

    fn find_by_nick(&self, _hub: &str, _nick: &str) -> Option<UserId> {
        None
    }

    fn keyprint(&self, _user: &UserId, _hub: &str) -> Option<String> {
        None
    }

    fn supports_mcn(&self, _user: &UserId) -> bool {
        false
    }

    fn connect(&self, _user: &HintedUser, _token: &ConnectionToken) -> Result<(), ConnectionError> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink {
    searches: Mutex<Vec<Search>>,
    partial: Mutex<Vec<PartialQuery>>,
}

impl SearchSink for RecordingSink {
    fn send_search(&self, search: &Search) {
        self.searches.lock().push(search.clone());
    }

    fn send_partial_query(&self, query: &PartialQuery) {
        self.partial.lock().push(query.clone());
    }
}

#[derive(Default)]
struct FakeControl {
    detached: Mutex<Vec<ConnectionToken>>,
    requested: Mutex<Vec<(UserId, bool)>>,
}

impl ConnectionControl for FakeControl {
    fn detach_download(&self, token: &ConnectionToken) {
        self.detached.lock().push(token.clone());
    }

    fn request_download(&self, user: &HintedUser, small_slot: bool) {
        self.requested.lock().push((user.user, small_slot));
    }
}

const HUB: &str = "adc://hub.example:1511";

struct Harness {
    manager: Arc<QueueManager>,
    hashes: Arc<FakeHashes>,
    users: Arc<FakeUsers>,
    sink: Arc<RecordingSink>,
    search: Arc<SearchManager>,
    control: Arc<FakeControl>,
    _control_dyn: Arc<dyn ConnectionControl>,
}

fn harness(settings: QueueSettings, hashes: FakeHashes, share: FakeShare) -> Harness {
    let hashes = Arc::new(hashes);
    let users = Arc::new(FakeUsers::default());
    let sink = Arc::new(RecordingSink::default());
    let search = SearchManager::new(SearchSettings::default(), sink.clone());
    let manager = QueueManager::new(
        settings,
        hashes.clone(),
        Arc::new(share),
        users.clone(),
        search.clone(),
    );
    let control = Arc::new(FakeControl::default());
    let control_dyn: Arc<dyn ConnectionControl> = control.clone();
    let weak: Weak<dyn ConnectionControl> = Arc::downgrade(&control_dyn);
    manager.set_connection_control(weak);
    Harness {
        manager,
        hashes,
        users,
        sink,
        search,
        control,
        _control_dyn: control_dyn,
    }
}

fn default_harness() -> Harness {
    harness(
        QueueSettings::default(),
        FakeHashes::default(),
        FakeShare::default(),
    )
}

fn user(n: u8) -> UserId {
    UserId([n; 24])
}

fn tth(n: u8) -> TthValue {
    TthValue([n; 24])
}

fn source(n: u8) -> NewSource {
    NewSource::new(HintedUser::new(user(n), HUB), format!("peer{n}"))
}

fn hubs() -> Vec<String> {
    vec![HUB.to_string()]
}

fn token(name: &str) -> ConnectionToken {
    ConnectionToken::from(name)
}

fn running(token: &str, user: UserId, segment: Segment, block_size: u64) -> RunningDownload {
    RunningDownload {
        token: ConnectionToken::from(token),
        user,
        kind: DownloadKind::File,
        segment,
        block_size,
        started: Instant::now(),
        pos: 0,
        speed: 0,
    }
}

fn policy() -> SegmentPolicy {
    SegmentPolicy {
        multi_segment: true,
        target_duration: Duration::from_secs(120),
        overlap: OverlapPolicy::default(),
    }
}

// ============================================================================
// Segments and block maps
// ============================================================================

#[test]
fn test_segment_set_coalesces_adjacent_ranges() {
    let mut done = SegmentSet::new();
    done.add(Segment::new(2048, 1024), 8192);
    done.add(Segment::new(0, 1024), 8192);
    assert_eq!(done.len(), 2);

    done.add(Segment::new(1024, 1024), 8192);
    assert_eq!(done.len(), 1);
    assert_eq!(done.downloaded_bytes(), 3072);
    assert!(done.contains_range(512, 3072));
    assert!(!done.contains_range(0, 4096));
}

#[test]
fn test_segment_set_clamps_to_limit() {
    let mut done = SegmentSet::new();
    done.add(Segment::new(0, 10_000), 4096);
    assert!(done.covers(4096));
    assert_eq!(done.downloaded_bytes(), 4096);
}

#[test]
fn test_block_map_needed_complements_done() {
    let mut done = SegmentSet::new();
    done.add(Segment::new(0, 2 * MIB), 5 * MIB);
    let needed = BlockMap::needed(&done, 5 * MIB, MIB);
    assert_eq!(needed.block_count(), 5);
    assert_eq!(needed.to_parts(), vec![2, 5]);

    let peer = BlockMap::from_parts(&[0, 3], 5);
    let useful = peer.intersection(&needed);
    assert_eq!(useful.runs(), vec![(2, 3)]);
    assert_eq!(
        useful.segments(5 * MIB, MIB),
        vec![Segment::new(2 * MIB, MIB)]
    );
}

#[test]
fn test_four_segments_are_disjoint_and_capped() {
    let mut item = QueueItem::new(
        QueueItemId(1),
        "/dl/big.bin".into(),
        "/dl/big.bin.dctmp".into(),
        100 * MIB,
        tth(1),
        Priority::Normal,
        ItemFlags::default(),
        4,
        0,
    );
    let request = SegmentRequest {
        block_size: MIB,
        chunk_size: MIB,
        speed: 0,
        partial: None,
        now: Instant::now(),
    };

    let mut segments = Vec::new();
    for n in 0..4 {
        let segment = item.next_segment(&request, &policy()).unwrap();
        item.downloads
            .push(running(&format!("c{n}"), user(1), segment, MIB));
        segments.push(segment);
    }

    for (i, a) in segments.iter().enumerate() {
        for b in &segments[i + 1..] {
            assert!(!a.overlaps(b), "{a} overlaps {b}");
        }
        assert_eq!(a.start() % MIB, 0);
    }
    let total: u64 = segments.iter().map(Segment::size).sum();
    assert!(total <= item.size);

    assert_eq!(
        item.next_segment(&request, &policy()),
        Err(SegmentError::SegmentLimitReached)
    );

    let finished = item.take_download(&token("c0")).unwrap();
    item.add_segment(finished.segment);
    let fifth = item.next_segment(&request, &policy()).unwrap();
    assert!(segments.iter().all(|s| !s.overlaps(&fifth)));
}

#[test]
fn test_single_segment_when_multi_segment_off() {
    let item = QueueItem::new(
        QueueItemId(1),
        "/dl/a.bin".into(),
        "/dl/a.bin.dctmp".into(),
        10 * MIB,
        tth(1),
        Priority::Normal,
        ItemFlags::default(),
        4,
        0,
    );
    let request = SegmentRequest {
        block_size: MIB,
        chunk_size: MIB,
        speed: 0,
        partial: None,
        now: Instant::now(),
    };
    let policy = SegmentPolicy {
        multi_segment: false,
        ..policy()
    };
    assert_eq!(
        item.next_segment(&request, &policy).unwrap(),
        Segment::new(0, 10 * MIB)
    );
}

#[test]
fn test_partial_source_without_needed_blocks() {
    let mut item = QueueItem::new(
        QueueItemId(1),
        "/dl/a.bin".into(),
        "/dl/a.bin.dctmp".into(),
        4 * MIB,
        tth(1),
        Priority::Normal,
        ItemFlags::default(),
        4,
        0,
    );
    item.add_segment(Segment::new(0, 2 * MIB));
    let partial = PartialSource::new(vec![0, 2], None, Instant::now());
    let request = SegmentRequest {
        block_size: MIB,
        chunk_size: MIB,
        speed: 0,
        partial: Some(&partial),
        now: Instant::now(),
    };
    assert_eq!(
        item.next_segment(&request, &policy()),
        Err(SegmentError::NoNeededParts)
    );

    let partial = PartialSource::new(vec![0, 3], None, Instant::now());
    let request = SegmentRequest {
        partial: Some(&partial),
        ..request
    };
    assert_eq!(
        item.next_segment(&request, &policy()).unwrap(),
        Segment::new(2 * MIB, MIB)
    );
}

#[test]
fn test_largest_free_range_wins_when_none_is_full_size() {
    let mut item = QueueItem::new(
        QueueItemId(1),
        "/dl/gaps.bin".into(),
        "/dl/gaps.bin.dctmp".into(),
        16 * MIB,
        tth(1),
        Priority::Normal,
        ItemFlags::default(),
        4,
        0,
    );
    item.add_segment(Segment::new(MIB, MIB));
    item.add_segment(Segment::new(5 * MIB, MIB));
    item.add_segment(Segment::new(9 * MIB, 7 * MIB));
    let request = SegmentRequest {
        block_size: MIB,
        chunk_size: 4 * MIB,
        speed: 0,
        partial: None,
        now: Instant::now(),
    };
    // free: [0, 1), [2, 5), [6, 9) MiB
    assert_eq!(
        item.next_segment(&request, &policy()).unwrap(),
        Segment::new(2 * MIB, 3 * MIB)
    );
}

#[test]
fn test_complete_small_file_has_no_free_block() {
    let mut item = QueueItem::new(
        QueueItemId(1),
        "/dl/tiny.txt".into(),
        "/dl/tiny.txt.dctmp".into(),
        512 * 1024,
        tth(1),
        Priority::Normal,
        ItemFlags::default(),
        4,
        0,
    );
    item.add_segment(Segment::new(0, 512 * 1024));
    let request = SegmentRequest {
        block_size: MIB,
        chunk_size: MIB,
        speed: 0,
        partial: None,
        now: Instant::now(),
    };
    assert_eq!(
        item.next_segment(&request, &policy()),
        Err(SegmentError::NoFreeBlock)
    );
}

// ============================================================================
// File queue
// ============================================================================

fn new_item(target: &str, size: u64, hash: TthValue) -> NewItem {
    NewItem {
        target: target.to_string(),
        size,
        tth: hash,
        flags: ItemFlags::default(),
        priority: None,
        temp_target: format!("{target}.dctmp"),
        added: 0,
    }
}

#[test]
fn test_add_same_file_twice_is_idempotent() {
    let settings = QueueSettings::default();
    let mut files = FileQueue::new();
    let first = files.add(new_item("/dl/a.bin", 1000, tth(1)), &settings).unwrap();
    let second = files.add(new_item("/dl/a.bin", 1000, tth(1)), &settings).unwrap();

    assert!(matches!(first, Added::New(_)));
    assert_eq!(second, Added::Existing(first.id()));
    assert_eq!(files.len(), 1);
    assert_eq!(files.find_tth(&tth(1)), &[first.id()]);
}

#[test]
fn test_add_rejects_bad_entries() {
    let settings = QueueSettings::default();
    let mut files = FileQueue::new();
    files.add(new_item("/dl/a.bin", 1000, tth(1)), &settings).unwrap();

    assert!(matches!(
        files.add(new_item("/dl/a.bin", 2000, tth(1)), &settings),
        Err(QueueError::DuplicateTarget(_))
    ));
    assert!(matches!(
        files.add(new_item("/dl/b.bin", 0, tth(2)), &settings),
        Err(QueueError::ZeroSize)
    ));
    assert!(matches!(
        files.add(new_item("/dl/../etc/passwd", 10, tth(3)), &settings),
        Err(QueueError::InvalidTarget(_))
    ));
    assert!(matches!(
        files.add(new_item("/dl/dir/", 10, tth(4)), &settings),
        Err(QueueError::InvalidTarget(_))
    ));
}

#[test]
fn test_default_priority_from_size_and_pattern() {
    let settings = QueueSettings::default()
        .with_high_prio_files(regex::Regex::new(r"\.nfo$").unwrap());
    assert_eq!(default_priority(1024, "/dl/a.bin", &settings), Priority::Highest);
    assert_eq!(default_priority(10 * MIB, "/dl/a.bin", &settings), Priority::Normal);
    assert_eq!(default_priority(10 * MIB, "/dl/a.nfo", &settings), Priority::High);
}

#[test]
fn test_max_segments_grows_with_size() {
    let settings = QueueSettings::default();
    assert_eq!(max_segments_for(MIB, &settings), 1);
    assert_eq!(max_segments_for(100 * MIB, &settings), 5);
    assert!(max_segments_for(100 * 1024 * MIB, &settings) <= 10);

    let manual = QueueSettings::default().with_manual_segments(3);
    assert_eq!(max_segments_for(100 * MIB, &manual), 3);
}

// ============================================================================
// Auto priority and bundle search
// ============================================================================

#[test]
fn test_progress_priority_levels_and_aging() {
    let day = auto_priority::PROGRESS_AGING;
    assert_eq!(auto_priority::progress(0, 100, Duration::ZERO), Priority::Low);
    assert_eq!(auto_priority::progress(40, 100, Duration::ZERO), Priority::Normal);
    assert_eq!(auto_priority::progress(70, 100, Duration::ZERO), Priority::High);
    assert_eq!(auto_priority::progress(95, 100, Duration::ZERO), Priority::Highest);
    assert_eq!(auto_priority::progress(0, 100, day), Priority::Normal);
    assert_eq!(auto_priority::progress(70, 100, day), Priority::High);
}

#[test]
fn test_balanced_priority_is_monotonic() {
    let candidates: Vec<auto_priority::Candidate<u32>> = (0..9)
        .map(|n| auto_priority::Candidate {
            key: n,
            speed: n as u64 * 1000,
            online_sources: n as usize,
        })
        .collect();
    let mut ranked = auto_priority::balanced(&candidates);
    assert_eq!(ranked.len(), 9);
    ranked.sort_by_key(|(key, _)| *key);

    for pair in ranked.windows(2) {
        assert!(pair[0].1 <= pair[1].1, "{:?}", ranked);
    }
    assert_eq!(ranked[8].1, Priority::High);
    assert_eq!(ranked[0].1, Priority::Low);
}

#[test]
fn test_balanced_needs_two_distinct_scores() {
    let same = [
        auto_priority::Candidate {
            key: 1,
            speed: 10,
            online_sources: 1,
        },
        auto_priority::Candidate {
            key: 2,
            speed: 10,
            online_sources: 1,
        },
    ];
    assert!(auto_priority::balanced(&same).is_empty());
}

#[test]
fn test_weighted_draw_favours_higher_priority() {
    let mut bundles = BundleQueue::new();
    let high = BundleToken(1);
    let low = BundleToken(2);
    bundles.add(Bundle::new(high, "/dl/high/".into(), BundleKind::Directory, Priority::High, 0));
    bundles.add(Bundle::new(low, "/dl/low/".into(), BundleKind::Directory, Priority::Low, 0));

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let (mut highs, mut lows) = (0u32, 0u32);
    for _ in 0..1000 {
        match bundles.pick_weighted(&mut rng, |_| true) {
            Some(t) if t == high => highs += 1,
            Some(t) if t == low => lows += 1,
            other => panic!("unexpected pick {other:?}"),
        }
    }
    let ratio = highs as f64 / lows as f64;
    assert!((2.2..4.0).contains(&ratio), "ratio {ratio}");
}

#[test]
fn test_paused_bundle_is_not_searched() {
    let mut bundles = BundleQueue::new();
    let token = BundleToken(1);
    bundles.add(Bundle::new(token, "/dl/a/".into(), BundleKind::Directory, Priority::Normal, 0));
    assert_eq!(bundles.bucket(Priority::Normal), vec![token]);

    bundles.set_priority(token, Priority::Paused);
    assert!(bundles.bucket(Priority::Normal).is_empty());
    let mut rng = StdRng::seed_from_u64(1);
    assert_eq!(bundles.pick_weighted(&mut rng, |_| true), None);
}

#[test]
fn test_lowest_bundles_do_not_shorten_search_interval() {
    let mut bundles = BundleQueue::new();
    bundles.add(Bundle::new(BundleToken(1), "/dl/normal/".into(), BundleKind::Directory, Priority::Normal, 0));
    for n in 2..5 {
        bundles.add(Bundle::new(BundleToken(n), format!("/dl/low{n}/"), BundleKind::Directory, Priority::Lowest, 0));
    }
    assert_eq!(
        bundles.search_interval(Duration::from_secs(60), |_| true),
        Duration::from_secs(3600)
    );

    bundles.set_priority(BundleToken(2), Priority::High);
    assert_eq!(
        bundles.search_interval(Duration::from_secs(60), |_| true),
        Duration::from_secs(1800)
    );
}

#[test]
fn test_recent_bundles_use_their_own_bucket() {
    let mut bundles = BundleQueue::new();
    let token = BundleToken(1);
    let mut bundle = Bundle::new(token, "/dl/new/".into(), BundleKind::Directory, Priority::Normal, 1000);
    assert!(bundle.check_recent(1000, Duration::from_secs(3600)));
    bundles.add(bundle);

    assert_eq!(bundles.recent_count(), 1);
    assert!(bundles.bucket(Priority::Normal).is_empty());
    assert_eq!(
        bundles.pick_recent(1000, Duration::from_secs(3600), |_| true),
        Some(token)
    );
    // window ran out: moved to its priority bucket
    assert_eq!(bundles.pick_recent(1000 + 7200, Duration::from_secs(3600), |_| true), None);
    assert_eq!(bundles.bucket(Priority::Normal), vec![token]);
}

// ============================================================================
// Queue manager
// ============================================================================

#[test]
fn test_add_file_schedules_source_once() {
    let h = default_harness();
    h.users.online.lock().insert(user(1));

    let id = h
        .manager
        .add_file("/dl/a.bin", 10 * MIB, tth(1), Some(source(1)), None)
        .unwrap();
    let again = h
        .manager
        .add_file("/dl/a.bin", 10 * MIB, tth(1), None, None)
        .unwrap();
    assert_eq!(id, again);
    assert!(matches!(
        h.manager.add_source(id, source(1), false),
        Err(QueueError::DuplicateSource(_))
    ));

    h.manager.set_item_priority(id, Priority::High).unwrap();
    h.manager.set_item_priority(id, Priority::Low).unwrap();
    assert_eq!(h.manager.schedule_entries(id, &user(1)), 1);
    assert_eq!(h.manager.scheduled_priority(id), Some(Priority::Low));

    let item = h.manager.item(id).unwrap();
    assert_eq!(item.temp_target, "/dl/a.bin.dctmp");
    assert!(item.bundle.is_some());
    assert_eq!(h.control.requested.lock().as_slice(), &[(user(1), false)]);
}

#[test]
fn test_add_shared_file_is_rejected() {
    let mut share = FakeShare::default();
    share.shared.insert(tth(7));
    let h = harness(QueueSettings::default(), FakeHashes::default(), share);

    assert!(matches!(
        h.manager.add_file("/dl/a.bin", MIB, tth(7), None, None),
        Err(QueueError::AlreadyShared(_))
    ));
    assert_eq!(h.manager.item_count(), 0);
}

#[test]
fn test_temp_directory_names_include_hash() {
    let settings = QueueSettings::default().with_temp_directory("/tmp/dc");
    let h = harness(settings, FakeHashes::default(), FakeShare::default());
    let id = h.manager.add_file("/dl/a.bin", MIB, tth(1), None, None).unwrap();

    let item = h.manager.item(id).unwrap();
    assert_eq!(item.temp_target, format!("/tmp/dc/a.bin.{}.dctmp", tth(1)));
}

#[test]
fn test_directory_merges_into_parent_bundle() {
    let h = default_harness();
    let mut events = h.manager.subscribe();

    let (sub, added) = h
        .manager
        .add_directory(
            "/dl/Album/CD1",
            vec![DirectoryFile::new("01.flac", MIB, tth(1))],
            None,
            None,
        )
        .unwrap();
    assert_eq!(added, 1);

    let (parent, added) = h
        .manager
        .add_directory(
            "/dl/Album/",
            vec![
                DirectoryFile::new("cover.jpg", MIB, tth(2)),
                DirectoryFile::new("CD1/01.flac", MIB, tth(1)),
            ],
            None,
            None,
        )
        .unwrap();
    assert_eq!(added, 1);
    assert_ne!(sub, parent);
    assert!(h.manager.bundle(sub).is_none());
    assert_eq!(h.manager.bundle(parent).unwrap().items().len(), 2);

    let id = h.manager.find_target("/dl/Album/CD1/01.flac").unwrap();
    assert_eq!(h.manager.item(id).unwrap().bundle, Some(parent));

    let mut removed = false;
    while let Ok(event) = events.try_recv() {
        if event == (QueueEvent::BundleRemoved { token: sub }) {
            removed = true;
        }
    }
    assert!(removed);

    // later files land in the existing bundle
    let (again, _) = h
        .manager
        .add_directory(
            "/dl/Album/CD2",
            vec![DirectoryFile::new("01.flac", MIB, tth(3))],
            None,
            None,
        )
        .unwrap();
    assert_eq!(again, parent);
}

#[test]
fn test_find_remote_dir_matches_trailing_names() {
    let h = default_harness();
    let (token, _) = h
        .manager
        .add_directory(
            "/dl/Album/",
            vec![DirectoryFile::new("Sub/a.bin", MIB, tth(1))],
            None,
            None,
        )
        .unwrap();

    let (found, local) = h.manager.find_remote_dir("share/music/Album/Sub").unwrap();
    assert_eq!(found, token);
    assert_eq!(local, "/dl/Album/Sub/");
    assert!(h.manager.find_remote_dir("share/Other").is_none());
}

#[test]
fn test_empty_directory_is_an_error() {
    let h = default_harness();
    let result = h.manager.add_directory(
        "/dl/Empty",
        vec![DirectoryFile::new("zero.bin", 0, tth(1))],
        None,
        None,
    );
    assert!(matches!(result, Err(QueueError::ZeroSize)));
    assert!(h.manager.bundles().is_empty());
}

#[test]
fn test_download_finishes_small_file_and_bundle() {
    let h = default_harness();
    let mut events = h.manager.subscribe();
    let id = h
        .manager
        .add_file("/dl/small.txt", 10_000, tth(1), Some(source(1)), None)
        .unwrap();
    let bundle = h.manager.item(id).unwrap().bundle.unwrap();
    h.manager
        .add_finished_notify(bundle, HintedUser::new(user(9), HUB))
        .unwrap();

    assert_eq!(h.manager.has_download(&user(1), &hubs(), false), Priority::Highest);
    assert_eq!(h.manager.has_download(&user(1), &[], false), Priority::Paused);

    let assignment = h
        .manager
        .get_download(&token("c1"), &user(1), &hubs(), DownloadRequest::default())
        .unwrap();
    assert_eq!(assignment.kind, DownloadKind::File);
    assert_eq!(assignment.segment, Segment::new(0, 10_000));
    assert_eq!(assignment.hub, HUB);
    assert_eq!(h.manager.running_downloads(), 1);

    h.manager
        .put_download(&token("c1"), DownloadOutcome::Finished)
        .unwrap();
    assert!(h.manager.item(id).unwrap().is_finished());
    assert_eq!(h.manager.bundle(bundle).unwrap().status, BundleStatus::Downloaded);

    let mut notified = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let QueueEvent::BundleDownloaded { notify, .. } = event {
            notified = notify;
        }
    }
    assert_eq!(notified, vec![HintedUser::new(user(9), HUB)]);

    assert!(h.manager.bundle_hashed(bundle).unwrap());
    assert!(h.manager.item(id).is_none());
    assert!(h.manager.bundle(bundle).is_none());
}

#[test]
fn test_failed_download_keeps_whole_blocks() {
    let hashes = FakeHashes::default().with_block_size(tth(1), MIB);
    let h = harness(QueueSettings::default(), hashes, FakeShare::default());
    let id = h
        .manager
        .add_file("/dl/a.bin", 10 * MIB, tth(1), Some(source(1)), None)
        .unwrap();

    let request = DownloadRequest {
        chunk_size: Some(4 * MIB),
        ..DownloadRequest::default()
    };
    let assignment = h
        .manager
        .get_download(&token("c1"), &user(1), &hubs(), request)
        .unwrap();
    assert_eq!(assignment.segment, Segment::new(0, 4 * MIB));

    h.manager
        .put_download(&token("c1"), DownloadOutcome::Failed { pos: 2 * MIB + 100 })
        .unwrap();
    assert_eq!(h.manager.item(id).unwrap().downloaded_bytes(), 2 * MIB);
    assert!(matches!(
        h.manager.put_download(&token("c1"), DownloadOutcome::Finished),
        Err(QueueError::UnknownDownload)
    ));
}

#[test]
fn test_completed_segments_cover_the_file_exactly() {
    let size = 37 * MIB + 1;
    let hashes = FakeHashes::default().with_block_size(tth(1), MIB);
    let h = harness(QueueSettings::default(), hashes, FakeShare::default());
    let id = h
        .manager
        .add_file("/dl/odd.bin", size, tth(1), Some(source(1)), None)
        .unwrap();

    let request = DownloadRequest {
        chunk_size: Some(3 * MIB),
        ..DownloadRequest::default()
    };
    let mut done = Vec::new();
    for n in 0..100 {
        let conn = token(&format!("c{n}"));
        let Ok(assignment) = h.manager.get_download(&conn, &user(1), &hubs(), request) else {
            break;
        };
        assert_eq!(assignment.kind, DownloadKind::File);
        done.push(assignment.segment);
        h.manager
            .put_download(&conn, DownloadOutcome::Finished)
            .unwrap();
    }

    done.sort_by_key(Segment::start);
    let mut pos = 0;
    for segment in &done {
        assert_eq!(segment.start(), pos, "gap or overlap at {pos}");
        assert_eq!(segment.start() % MIB, 0);
        assert!(segment.end() % MIB == 0 || segment.end() == size);
        pos = segment.end();
    }
    assert_eq!(pos, size);
    assert!(h.manager.item(id).unwrap().is_finished());
}

#[test]
fn test_tree_is_fetched_before_segments() {
    let h = default_harness();
    let id = h
        .manager
        .add_file("/dl/a.bin", 10 * MIB, tth(1), Some(source(1)), None)
        .unwrap();

    let assignment = h
        .manager
        .get_download(&token("c1"), &user(1), &hubs(), DownloadRequest::default())
        .unwrap();
    assert_eq!(assignment.kind, DownloadKind::Tree);

    let tree = HashTree::new(tth(1), 10 * MIB, MIB, vec![0; 10 * 24]);
    h.manager
        .put_download(&token("c1"), DownloadOutcome::TreeFinished(tree.clone()))
        .unwrap();
    assert_eq!(h.hashes.stored.lock().as_slice(), &[tree]);
    assert!(h.manager.item(id).unwrap().is_source(&user(1)));
}

#[test]
fn test_bad_tree_demotes_source() {
    let h = default_harness();
    let id = h
        .manager
        .add_file("/dl/a.bin", 10 * MIB, tth(1), Some(source(1)), None)
        .unwrap();
    h.manager
        .get_download(&token("c1"), &user(1), &hubs(), DownloadRequest::default())
        .unwrap();

    let wrong_root = HashTree::new(tth(2), 10 * MIB, MIB, vec![0; 10 * 24]);
    h.manager
        .put_download(&token("c1"), DownloadOutcome::TreeFinished(wrong_root))
        .unwrap();

    let item = h.manager.item(id).unwrap();
    assert!(!item.is_source(&user(1)));
    assert!(item.bad_sources()[0].flags.bad_tree);
    assert!(h.hashes.stored.lock().is_empty());
    assert!(matches!(
        h.manager.add_source(id, source(1), false),
        Err(QueueError::DuplicateSource(_))
    ));
}

#[test]
fn test_remove_source_detaches_running_download() {
    let hashes = FakeHashes::default().with_block_size(tth(1), MIB);
    let h = harness(QueueSettings::default(), hashes, FakeShare::default());
    let id = h
        .manager
        .add_file("/dl/a.bin", 10 * MIB, tth(1), Some(source(1)), None)
        .unwrap();
    h.manager
        .get_download(&token("c1"), &user(1), &hubs(), DownloadRequest::default())
        .unwrap();

    let reason = SourceFlags {
        removed: true,
        ..SourceFlags::default()
    };
    h.manager.remove_source(id, &user(1), reason).unwrap();

    assert_eq!(h.control.detached.lock().as_slice(), &[token("c1")]);
    assert_eq!(h.manager.running_downloads(), 0);
    assert!(!h.manager.item(id).unwrap().is_running());
    assert_eq!(h.manager.has_download(&user(1), &hubs(), false), Priority::Paused);
}

#[test]
fn test_pausing_bundle_detaches_and_unschedules() {
    let hashes = FakeHashes::default().with_block_size(tth(1), MIB);
    let h = harness(QueueSettings::default(), hashes, FakeShare::default());
    let id = h
        .manager
        .add_file("/dl/a.bin", 10 * MIB, tth(1), Some(source(1)), None)
        .unwrap();
    let bundle = h.manager.item(id).unwrap().bundle.unwrap();
    h.manager
        .get_download(&token("c1"), &user(1), &hubs(), DownloadRequest::default())
        .unwrap();

    h.manager.set_bundle_priority(bundle, Priority::Paused).unwrap();
    assert_eq!(h.control.detached.lock().as_slice(), &[token("c1")]);
    assert_eq!(h.manager.has_download(&user(1), &hubs(), false), Priority::Paused);

    h.manager.set_bundle_priority(bundle, Priority::High).unwrap();
    assert_eq!(h.manager.has_download(&user(1), &hubs(), false), Priority::Normal);
}

#[test]
fn test_move_onto_same_content_merges_sources() {
    let h = default_harness();
    let a = h
        .manager
        .add_file("/dl/a.bin", MIB, tth(1), Some(source(1)), None)
        .unwrap();
    let b = h
        .manager
        .add_file("/dl/b.bin", MIB, tth(1), Some(source(2)), None)
        .unwrap();
    let other = h
        .manager
        .add_file("/dl/c.bin", MIB, tth(3), None, None)
        .unwrap();

    assert!(matches!(
        h.manager.move_item(a, "/dl/c.bin"),
        Err(QueueError::DuplicateTarget(_))
    ));
    assert!(h.manager.item(other).is_some());

    h.manager.move_item(a, "/dl/b.bin").unwrap();
    assert!(h.manager.item(a).is_none());
    let merged = h.manager.item(b).unwrap();
    assert!(merged.is_source(&user(1)));
    assert!(merged.is_source(&user(2)));

    h.manager.move_item(b, "/dl/renamed.bin").unwrap();
    assert_eq!(h.manager.find_target("/dl/renamed.bin"), Some(b));
    assert_eq!(h.manager.find_target("/dl/b.bin"), None);
}

#[test]
fn test_move_onto_finished_item_merges_sources() {
    let h = default_harness();
    let done = h
        .manager
        .add_file("/dl/done.txt", 10_000, tth(1), Some(source(1)), None)
        .unwrap();
    h.manager
        .get_download(&token("c1"), &user(1), &hubs(), DownloadRequest::default())
        .unwrap();
    h.manager
        .put_download(&token("c1"), DownloadOutcome::Finished)
        .unwrap();
    assert!(h.manager.item(done).unwrap().is_finished());

    let a = h
        .manager
        .add_file("/dl/a.txt", 20_000, tth(2), Some(source(2)), None)
        .unwrap();
    h.manager.move_item(a, "/dl/done.txt").unwrap();

    assert!(h.manager.item(a).is_none());
    assert_eq!(h.manager.find_target("/dl/done.txt"), Some(done));
    let kept = h.manager.item(done).unwrap();
    assert!(kept.is_finished());
    assert_eq!(kept.size, 10_000);
    assert!(kept.is_source(&user(1)));
    assert!(kept.is_source(&user(2)));
    assert_eq!(h.manager.has_download(&user(2), &hubs(), false), Priority::Paused);
}

#[test]
fn test_remove_last_item_drops_bundle() {
    let h = default_harness();
    let id = h.manager.add_file("/dl/a.bin", MIB, tth(1), None, None).unwrap();
    let bundle = h.manager.item(id).unwrap().bundle.unwrap();

    let removed = h.manager.remove_item(id).unwrap();
    assert_eq!(removed.target, "/dl/a.bin");
    assert!(h.manager.bundle(bundle).is_none());
    assert!(matches!(h.manager.remove_item(id), Err(QueueError::NotFound)));
}

#[test]
fn test_file_list_is_queued_at_highest() {
    let h = default_harness();
    let id = h
        .manager
        .add_list(source(1), ItemFlags::default(), None)
        .unwrap();
    let item = h.manager.item(id).unwrap();
    assert!(item.flags.user_list);
    assert_eq!(item.priority, Priority::Highest);
    assert_eq!(item.tth, TthValue([0; 24]));
    assert!(item.bundle.is_none());
    assert_eq!(item.target, item.temp_target);

    let assignment = h
        .manager
        .get_download(&token("c1"), &user(1), &hubs(), DownloadRequest::default())
        .unwrap();
    assert!(assignment.flags.user_list);
}

#[test]
fn test_partial_source_query_offers_our_blocks() {
    let hashes = FakeHashes::default().with_block_size(tth(1), MIB);
    let h = harness(QueueSettings::default(), hashes, FakeShare::default());
    let id = h
        .manager
        .add_file("/dl/big.bin", 30 * MIB, tth(1), Some(source(1)), None)
        .unwrap();
    h.manager
        .get_download(&token("c1"), &user(1), &hubs(), DownloadRequest::default())
        .unwrap();
    h.manager
        .put_download(&token("c1"), DownloadOutcome::Finished)
        .unwrap();

    let udp: SocketAddr = "192.0.2.7:4000".parse().unwrap();
    assert_eq!(
        h.manager.add_partial_source(&tth(1), source(2), vec![0, 10], Some(udp)),
        1
    );
    let item = h.manager.item(id).unwrap();
    assert!(item.source(&user(2)).unwrap().is_partial());

    let mut rng = StdRng::seed_from_u64(3);
    h.manager
        .on_minute(Instant::now() + Duration::from_secs(1), 0, &mut rng);

    let queries = h.sink.partial.lock().clone();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].user.user, user(2));
    assert_eq!(queries[0].udp, udp);
    assert_eq!(queries[0].parts, vec![0, 1]);

    // a fresh report resets the query counter and replaces the parts
    assert_eq!(
        h.manager.add_partial_source(&tth(1), source(2), vec![0, 20], Some(udp)),
        1
    );
    let item = h.manager.item(id).unwrap();
    let partial = item.source(&user(2)).unwrap().partial.clone().unwrap();
    assert_eq!(partial.parts, vec![0, 20]);
    assert_eq!(partial.pending_queries, 0);
}

#[test]
fn test_minute_tick_queues_auto_search() {
    let h = default_harness();
    h.manager
        .add_file("/dl/a.bin", 10 * MIB, tth(1), Some(source(1)), None)
        .unwrap();

    let mut rng = StdRng::seed_from_u64(11);
    h.manager.on_minute(Instant::now(), 0, &mut rng);
    assert_eq!(h.search.pending(), 1);
}

#[test]
fn test_recheck_result_resets_bad_blocks() {
    let hashes = FakeHashes::default().with_block_size(tth(1), MIB);
    let h = harness(QueueSettings::default(), hashes, FakeShare::default());
    let id = h
        .manager
        .add_file("/dl/a.bin", 4 * MIB, tth(1), Some(source(1)), None)
        .unwrap();
    let mut events = h.manager.subscribe();

    let good: SegmentSet = [(0, MIB), (2 * MIB, 2 * MIB)].into_iter().collect();
    h.manager.on_rechecked(
        id,
        Ok(RecheckResult {
            item: id,
            good,
            bad_blocks: 1,
            block_count: 4,
        }),
    );
    assert_eq!(h.manager.item(id).unwrap().downloaded_bytes(), 3 * MIB);
    assert_eq!(
        events.try_recv().unwrap(),
        QueueEvent::RecheckDone { id, bad_blocks: 1 }
    );

    let full: SegmentSet = [(0, 4 * MIB)].into_iter().collect();
    h.manager.on_rechecked(
        id,
        Ok(RecheckResult {
            item: id,
            good: full,
            bad_blocks: 0,
            block_count: 4,
        }),
    );
    assert!(h.manager.item(id).unwrap().is_finished());
}

#[test]
fn test_recheck_needs_tree() {
    let h = default_harness();
    let id = h
        .manager
        .add_file("/dl/a.bin", 10 * MIB, tth(1), None, None)
        .unwrap();
    assert!(matches!(
        h.manager.recheck(id),
        Err(QueueError::TreeUnavailable(_))
    ));
}

#[tokio::test]
async fn test_recheck_worker_reports_bad_blocks() {
    let hashes = FakeHashes::default().with_block_size(tth(1), MIB);
    *hashes.verify.lock() = vec![true, false, true, true];
    let h = harness(QueueSettings::default(), hashes, FakeShare::default());
    h.manager.start();
    let id = h
        .manager
        .add_file("/dl/a.bin", 4 * MIB, tth(1), None, None)
        .unwrap();
    let mut events = h.manager.subscribe();

    h.manager.recheck(id).unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event @ QueueEvent::RecheckDone { .. }) => return event,
                Ok(_) => continue,
                Err(err) => panic!("event channel closed: {err}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event, QueueEvent::RecheckDone { id, bad_blocks: 1 });
    assert_eq!(h.manager.item(id).unwrap().downloaded_bytes(), 3 * MIB);
}

#[tokio::test]
async fn test_finished_file_is_moved_into_place() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("out").join("a.txt");
    let target = target.to_string_lossy().into_owned();

    let h = default_harness();
    h.manager.start();
    let id = h
        .manager
        .add_file(&target, 5, tth(1), Some(source(1)), None)
        .unwrap();
    let temp = h.manager.item(id).unwrap().temp_target;
    tokio::fs::write(&temp, b"hello").await.unwrap();
    let mut events = h.manager.subscribe();

    h.manager
        .get_download(&token("c1"), &user(1), &hubs(), DownloadRequest::default())
        .unwrap();
    h.manager
        .put_download(&token("c1"), DownloadOutcome::Finished)
        .unwrap();

    let moved = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(QueueEvent::ItemMoved { path, .. }) = events.recv().await {
                return path;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(moved.to_string_lossy(), target);
    assert_eq!(tokio::fs::read(&target).await.unwrap(), b"hello");
    assert!(h.manager.item(id).unwrap().flags.moved);
}

#[tokio::test]
async fn test_queue_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("Queue.xml");
    let settings = QueueSettings::default().with_queue_file(&path);

    let hashes = FakeHashes::default().with_block_size(tth(1), MIB);
    let h = harness(settings.clone(), hashes, FakeShare::default());
    let id = h
        .manager
        .add_file("/dl/a.bin", 10 * MIB, tth(1), Some(source(1)), Some(Priority::High))
        .unwrap();
    h.manager
        .add_directory(
            "/dl/Album",
            vec![DirectoryFile::new("01.flac", MIB, tth(2))],
            Some(source(2)),
            None,
        )
        .unwrap();
    h.manager
        .get_download(&token("c1"), &user(1), &hubs(), DownloadRequest::default())
        .unwrap();
    h.manager
        .put_download(&token("c1"), DownloadOutcome::Finished)
        .unwrap();
    assert!(h.manager.is_dirty());
    h.manager.save().await.unwrap();
    assert!(!h.manager.is_dirty());

    let restored = harness(settings, FakeHashes::default(), FakeShare::default());
    assert_eq!(restored.manager.load().await.unwrap(), 2);

    let loaded = restored.manager.find_target("/dl/a.bin").unwrap();
    let item = restored.manager.item(loaded).unwrap();
    let original = h.manager.item(id).unwrap();
    assert_eq!(item.priority, Priority::High);
    assert_eq!(item.tth, tth(1));
    assert_eq!(item.downloaded_bytes(), MIB);
    assert_eq!(item.temp_target, original.temp_target);
    assert_eq!(item.sources()[0].user, HintedUser::new(user(1), HUB));
    assert_eq!(item.sources()[0].nick, "peer1");
    assert_eq!(
        restored.manager.scheduled_priority(loaded),
        Some(Priority::High)
    );

    let album = restored.manager.find_target("/dl/Album/01.flac").unwrap();
    let bundle = restored.manager.item(album).unwrap().bundle.unwrap();
    assert_eq!(
        restored.manager.bundle(bundle).unwrap().kind,
        BundleKind::Directory
    );
}

#[tokio::test]
async fn test_corrupt_queue_file_falls_back_to_backup() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("Queue.xml");
    let settings = QueueSettings::default().with_queue_file(&path);

    let h = harness(settings.clone(), FakeHashes::default(), FakeShare::default());
    h.manager.add_file("/dl/a.bin", MIB, tth(1), None, None).unwrap();
    h.manager.save().await.unwrap();
    h.manager.save().await.unwrap();
    tokio::fs::write(&path, b"<Downloads Version=\"2\"><Bundle")
        .await
        .unwrap();

    let restored = harness(settings, FakeHashes::default(), FakeShare::default());
    assert_eq!(restored.manager.load().await.unwrap(), 1);
    assert!(restored.manager.find_target("/dl/a.bin").is_some());
}

#[tokio::test]
async fn test_missing_queue_file_loads_nothing() {
    let dir = TempDir::new().unwrap();
    let settings = QueueSettings::default().with_queue_file(dir.path().join("none.xml"));
    let h = harness(settings, FakeHashes::default(), FakeShare::default());
    assert_eq!(h.manager.load().await.unwrap(), 0);
}

#[tokio::test]
async fn test_rejected_add_leaves_queue_clean() {
    let dir = TempDir::new().unwrap();
    let settings = QueueSettings::default().with_queue_file(dir.path().join("Queue.xml"));
    let h = harness(settings, FakeHashes::default(), FakeShare::default());
    h.manager
        .add_file("/dl/a.bin", MIB, tth(1), Some(source(1)), None)
        .unwrap();
    assert!(h.manager.is_dirty());
    h.manager.save().await.unwrap();

    assert!(matches!(
        h.manager.add_file("/dl/a.bin", MIB, tth(1), Some(source(1)), None),
        Err(QueueError::DuplicateSource(_))
    ));
    assert!(!h.manager.is_dirty());

    h.manager
        .add_file("/dl/a.bin", MIB, tth(1), Some(source(2)), None)
        .unwrap();
    assert!(h.manager.is_dirty());
}

#[tokio::test]
async fn test_fully_downloaded_entry_finishes_on_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("Queue.xml");
    let xml = format!(
        "<Downloads Version=\"2\">\
         <File Token=\"5\" Target=\"/dl/full.bin\" Priority=\"3\" AutoPriority=\"0\" Added=\"0\">\
         <Download Target=\"/dl/full.bin\" Size=\"{size}\" TTH=\"{tth}\" Priority=\"3\" \
         AutoPriority=\"0\" Added=\"0\" TempTarget=\"/dl/full.bin.dctmp\" MaxSegments=\"4\">\
         <Segment Start=\"0\" Size=\"{size}\"/>\
         <Source CID=\"{cid}\" Nick=\"peer1\" HubHint=\"{HUB}\"/>\
         </Download></File></Downloads>",
        size = 2 * MIB,
        tth = tth(1),
        cid = user(1),
    );
    tokio::fs::write(&path, xml).await.unwrap();

    let h = harness(
        QueueSettings::default().with_queue_file(&path),
        FakeHashes::default(),
        FakeShare::default(),
    );
    let mut events = h.manager.subscribe();
    assert_eq!(h.manager.load().await.unwrap(), 1);

    let id = h.manager.find_target("/dl/full.bin").unwrap();
    let item = h.manager.item(id).unwrap();
    assert!(item.is_finished());
    let bundle = h.manager.bundle(item.bundle.unwrap()).unwrap();
    assert_eq!(bundle.status, BundleStatus::Downloaded);
    assert_eq!(h.manager.has_download(&user(1), &hubs(), false), Priority::Paused);

    let mut finished = false;
    while let Ok(event) = events.try_recv() {
        finished |= matches!(event, QueueEvent::ItemFinished { id: done } if done == id);
    }
    assert!(finished);
}

#[tokio::test]
async fn test_move_job_falls_back_to_temp_directory() {
    let dir = TempDir::new().unwrap();
    let from = dir.path().join("a.bin.dctmp");
    tokio::fs::write(&from, b"data").await.unwrap();
    // a file where the target directory should be
    let blocker = dir.path().join("blocked");
    tokio::fs::write(&blocker, b"").await.unwrap();

    let job = MoveJob {
        item: QueueItemId(1),
        from: from.clone(),
        to: blocker.join("a.bin"),
    };
    let outcome = job.run().await.unwrap();
    assert_eq!(outcome, MoveOutcome::MovedInPlace(dir.path().join("a.bin")));
    assert!(!from.exists());
}
