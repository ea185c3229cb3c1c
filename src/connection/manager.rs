//! The connection engine.
//!
//! [`ConnectionManager`] keeps every pending and established peer
//! connection in one `RwLock`. The queue engine, the user directory and the
//! download engine are only asked after that lock has been released, so a
//! tick is split into a locked pass that picks candidates, an unlocked pass
//! that asks around, and a second locked pass that applies the answers.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{interval, timeout};
use tracing::{debug, info, trace, warn};

use super::error::ConnectionError;
use super::handshake::{
    Expectation, Handshake, HandshakeConfig, HandshakeContext, HandshakeOutcome,
};
use super::item::{ConnectionQueueItem, ConnectionToken, CqiFlags, CqiState, Direction, Failures};
use super::protocol::Dialect;
use super::transport::{AsyncStream, BoxedStream, LineTransport};
use crate::constants::EXPECTATION_LIFETIME;
use crate::queue::{Priority, QueueManager};
use crate::services::{ConnectionControl, DownloadEngine, UserDirectory};
use crate::settings::ConnectionSettings;
use crate::user::{HintedUser, UserId};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications about connection queue items.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Added {
        token: ConnectionToken,
        user: HintedUser,
        direction: Direction,
    },
    StateChanged {
        token: ConnectionToken,
        state: CqiState,
    },
    Failed {
        token: ConnectionToken,
        reason: String,
    },
    Removed {
        token: ConnectionToken,
    },
}

/// A connection that finished its handshake, handed to the download engine.
pub struct ReadyConnection {
    pub token: ConnectionToken,
    pub user: HintedUser,
    pub nick: String,
    pub direction: Direction,
    pub features: Vec<String>,
    pub transport: LineTransport<BoxedStream>,
}

impl fmt::Debug for ReadyConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyConnection")
            .field("token", &self.token)
            .field("user", &self.user)
            .field("nick", &self.nick)
            .field("direction", &self.direction)
            .field("features", &self.features)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct ConnectionState {
    downloads: HashMap<ConnectionToken, ConnectionQueueItem>,
    uploads: HashMap<ConnectionToken, ConnectionQueueItem>,
}

impl ConnectionState {
    fn user_downloads<'a>(
        &'a self,
        user: &'a UserId,
    ) -> impl Iterator<Item = &'a ConnectionQueueItem> + 'a {
        self.downloads
            .values()
            .filter(move |cqi| cqi.user.user == *user && !cqi.flags.remove)
    }
}

/// A download connection picked for an attempt this tick.
struct Candidate {
    token: ConnectionToken,
    user: HintedUser,
    small_slot: bool,
}

enum Attempt {
    Connect,
    NoSlots,
    Remove,
}

pub struct ConnectionManager {
    settings: ConnectionSettings,
    my_cid: UserId,
    state: RwLock<ConnectionState>,
    /// Inbound connections we asked for, by `nmdc:<nick>` or ADC token.
    expected: DashMap<String, Expectation>,
    queue: Arc<QueueManager>,
    users: Arc<dyn UserDirectory>,
    engine: Arc<dyn DownloadEngine>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    /// Creates the manager and registers it with `queue` for detaching and
    /// requesting downloads.
    pub fn new(
        settings: ConnectionSettings,
        my_cid: UserId,
        queue: Arc<QueueManager>,
        users: Arc<dyn UserDirectory>,
        engine: Arc<dyn DownloadEngine>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let manager = Arc::new(Self {
            settings,
            my_cid,
            state: RwLock::new(ConnectionState::default()),
            expected: DashMap::new(),
            queue,
            users,
            engine,
            events,
        });
        let weak = Arc::downgrade(&manager);
        let control: Weak<dyn ConnectionControl> = weak;
        manager.queue.set_connection_control(control);
        manager
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Spawns the once-a-second reconnect scheduler.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.on_second(Instant::now());
            }
        });
    }

    fn emit_all(&self, events: Vec<ConnectionEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }

    // ------------------------------------------------------------------------
    // Download connection queue
    // ------------------------------------------------------------------------

    /// Queues a download connection to `user` unless one is already pending.
    ///
    /// Small-slot connections are tracked apart from the regular ones.
    pub fn add_download(&self, user: &HintedUser, small_slot: bool) -> Option<ConnectionToken> {
        let mcn = self.settings.multi_connection && self.users.supports_mcn(&user.user);

        let token = {
            let mut state = self.state.write();
            if state
                .user_downloads(&user.user)
                .any(|cqi| cqi.flags.small_slot == small_slot)
            {
                return None;
            }

            let mut cqi = ConnectionQueueItem::new(user.clone(), Direction::Download);
            cqi.flags = CqiFlags {
                mcn,
                small_slot,
                remove: false,
            };
            let token = cqi.token.clone();
            state.downloads.insert(token.clone(), cqi);
            token
        };

        debug!(user = %user, token = %token, small_slot, "download connection queued");
        self.emit_all(vec![ConnectionEvent::Added {
            token: token.clone(),
            user: user.clone(),
            direction: Direction::Download,
        }]);
        Some(token)
    }

    /// The reconnect scheduler's tick.
    pub fn on_second(&self, now: Instant) {
        let mut events = Vec::new();

        let candidates = {
            let mut state = self.state.write();
            prune(&mut state, &mut events);
            self.time_out_attempts(&mut state, now, &mut events);
            self.due_candidates(&state, now)
        };

        let decisions: Vec<(Candidate, Attempt)> = candidates
            .into_iter()
            .map(|candidate| {
                let attempt = self.decide(&candidate);
                (candidate, attempt)
            })
            .collect();

        let mut connect = Vec::new();
        {
            let mut state = self.state.write();
            for (candidate, attempt) in decisions {
                let token = candidate.token;
                let Some(cqi) = state
                    .downloads
                    .get_mut(&token)
                    .filter(|cqi| cqi.state.is_idle())
                else {
                    continue;
                };

                match attempt {
                    Attempt::Remove => {
                        state.downloads.remove(&token);
                        events.push(ConnectionEvent::Removed { token });
                    }
                    Attempt::Connect => {
                        if cqi.state == CqiState::NoDownloadSlots {
                            // a slot freed up
                            events.push(ConnectionEvent::StateChanged {
                                token: token.clone(),
                                state: CqiState::Waiting,
                            });
                        }
                        cqi.state = CqiState::Connecting { since: now };
                        cqi.last_attempt = Some(now);
                        events.push(ConnectionEvent::StateChanged {
                            token: token.clone(),
                            state: cqi.state,
                        });
                        connect.push((candidate.user, token));
                    }
                    Attempt::NoSlots => {
                        cqi.last_attempt = Some(now);
                        if cqi.state != CqiState::NoDownloadSlots {
                            cqi.state = CqiState::NoDownloadSlots;
                            events.push(ConnectionEvent::StateChanged {
                                token,
                                state: CqiState::NoDownloadSlots,
                            });
                        }
                    }
                }
            }
        }
        self.emit_all(events);

        for (user, token) in connect {
            trace!(user = %user, token = %token, "connecting");
            if let Err(err) = self.users.connect(&user, &token) {
                self.on_failed(&token, &err);
            }
        }

        self.expected.retain(|_, expectation| {
            now.saturating_duration_since(expectation.registered) < EXPECTATION_LIFETIME
        });
    }

    fn time_out_attempts(
        &self,
        state: &mut ConnectionState,
        now: Instant,
        events: &mut Vec<ConnectionEvent>,
    ) {
        let expired: Vec<ConnectionToken> = state
            .downloads
            .values()
            .filter(|cqi| match cqi.state {
                CqiState::Connecting { since } => {
                    now.saturating_duration_since(since) >= self.settings.connect_timeout
                }
                _ => false,
            })
            .map(|cqi| cqi.token.clone())
            .collect();

        for token in expired {
            debug!(token = %token, "connect attempt timed out");
            fail_download(state, &token, false, "connection timed out".into(), events);
        }
    }

    /// Idle download connections whose backoff ran out, capped per tick.
    fn due_candidates(&self, state: &ConnectionState, now: Instant) -> Vec<Candidate> {
        let mut due: Vec<&ConnectionQueueItem> = state
            .downloads
            .values()
            .filter(|cqi| {
                cqi.state.is_idle()
                    && !cqi.flags.remove
                    && !cqi.is_protocol_blocked()
                    && cqi.attempt_due(now, self.settings.reconnect_backoff)
            })
            .collect();
        due.sort_by(|a, b| {
            a.last_attempt
                .cmp(&b.last_attempt)
                .then_with(|| a.token.cmp(&b.token))
        });

        let mut first = 0;
        let mut retries = 0;
        let mut candidates = Vec::new();
        for cqi in due {
            if cqi.last_attempt.is_none() {
                if first >= self.settings.first_attempt_burst {
                    continue;
                }
                first += 1;
            } else {
                let limit = self.settings.attempts_per_tick;
                if limit != 0 && retries >= limit {
                    continue;
                }
                retries += 1;
            }
            candidates.push(Candidate {
                token: cqi.token.clone(),
                user: cqi.user.clone(),
                small_slot: cqi.flags.small_slot,
            });
        }
        candidates
    }

    fn decide(&self, candidate: &Candidate) -> Attempt {
        let user = &candidate.user.user;
        if !self.users.is_online(user) {
            debug!(user = %candidate.user, "user offline, dropping connection");
            return Attempt::Remove;
        }

        let hubs = self.users.online_hubs(user);
        let priority = self.queue.has_download(user, &hubs, candidate.small_slot);
        if priority == Priority::Paused {
            debug!(user = %candidate.user, "nothing to download, dropping connection");
            return Attempt::Remove;
        }

        if candidate.small_slot || self.engine.start_download_allowed(priority) {
            Attempt::Connect
        } else {
            Attempt::NoSlots
        }
    }

    /// Records a failed connection.
    ///
    /// Download connections go back to waiting with one more failure (or
    /// blocked, for protocol errors); upload connections are dropped.
    pub fn on_failed(&self, token: &ConnectionToken, error: &ConnectionError) {
        let mut events = Vec::new();
        {
            let mut state = self.state.write();
            if state.uploads.remove(token).is_some() {
                events.push(ConnectionEvent::Removed {
                    token: token.clone(),
                });
            } else {
                fail_download(
                    &mut state,
                    token,
                    error.is_protocol_error(),
                    error.to_string(),
                    &mut events,
                );
            }
        }
        if !events.is_empty() {
            warn!(token = %token, error = %error, "connection failed");
        }
        self.emit_all(events);
    }

    /// A transfer started on the connection.
    ///
    /// For peers accepting several connections, another one is queued when
    /// the per-peer cap leaves room and none is already pending.
    pub fn set_running(&self, token: &ConnectionToken) -> Result<(), ConnectionError> {
        let mut events = Vec::new();
        {
            let mut state = self.state.write();
            let cqi = state
                .downloads
                .get_mut(token)
                .ok_or(ConnectionError::NotFound)?;
            cqi.state = CqiState::Running;
            events.push(ConnectionEvent::StateChanged {
                token: token.clone(),
                state: CqiState::Running,
            });

            if cqi.flags.mcn && !cqi.flags.small_slot {
                let user = cqi.user.clone();
                let max_conns = cqi.max_conns;
                let cap = max_conns.map_or(self.settings.slots_per_user, |max| {
                    max.min(self.settings.slots_per_user)
                });

                let regular: Vec<&ConnectionQueueItem> = state
                    .user_downloads(&user.user)
                    .filter(|cqi| !cqi.flags.small_slot)
                    .collect();
                let pending = regular
                    .iter()
                    .any(|cqi| cqi.state.is_idle() || cqi.state.is_connecting());

                if regular.len() < cap && !pending {
                    let mut extra = ConnectionQueueItem::new(user.clone(), Direction::Download);
                    extra.flags.mcn = true;
                    extra.max_conns = max_conns;
                    debug!(user = %user, token = %extra.token, "opening another connection");
                    events.push(ConnectionEvent::Added {
                        token: extra.token.clone(),
                        user,
                        direction: Direction::Download,
                    });
                    state.downloads.insert(extra.token.clone(), extra);
                }
            }
        }
        self.emit_all(events);
        Ok(())
    }

    /// The transfer on the connection ended; the connection stays up.
    pub fn set_active(&self, token: &ConnectionToken) -> Result<(), ConnectionError> {
        {
            let mut state = self.state.write();
            let cqi = state
                .downloads
                .get_mut(token)
                .ok_or(ConnectionError::NotFound)?;
            cqi.state = CqiState::Active;
        }
        self.emit_all(vec![ConnectionEvent::StateChanged {
            token: token.clone(),
            state: CqiState::Active,
        }]);
        Ok(())
    }

    /// The peer advertised how many connections it accepts from us.
    pub fn set_max_connections(&self, user: &UserId, max: usize) {
        let mut state = self.state.write();
        for cqi in state.downloads.values_mut() {
            if cqi.user.user == *user {
                cqi.max_conns = Some(max);
            }
        }
    }

    /// A connection closed without error.
    ///
    /// A download connection goes back to waiting and is dropped on a
    /// later tick if the queue has nothing more for the peer.
    pub fn put_connection(&self, token: &ConnectionToken, now: Instant) {
        let event = {
            let mut state = self.state.write();
            if state.uploads.remove(token).is_some() {
                Some(ConnectionEvent::Removed {
                    token: token.clone(),
                })
            } else if let Some(cqi) = state.downloads.get_mut(token) {
                cqi.state = CqiState::Waiting;
                cqi.last_attempt = Some(now);
                Some(ConnectionEvent::StateChanged {
                    token: token.clone(),
                    state: CqiState::Waiting,
                })
            } else {
                None
            }
        };
        self.emit_all(event.into_iter().collect());
    }

    /// Takes an established download connection back to waiting and
    /// aborts whatever transfer the engine has on it.
    pub fn detach(&self, token: &ConnectionToken) {
        let detached = {
            let mut state = self.state.write();
            match state.downloads.get_mut(token) {
                Some(cqi) if matches!(cqi.state, CqiState::Active | CqiState::Running) => {
                    cqi.state = CqiState::Waiting;
                    cqi.last_attempt = Some(Instant::now());
                    true
                }
                _ => false,
            }
        };

        if detached {
            debug!(token = %token, "detaching download");
            self.engine.abort_download(token);
            self.emit_all(vec![ConnectionEvent::StateChanged {
                token: token.clone(),
                state: CqiState::Waiting,
            }]);
        }
    }

    /// Clears the protocol error block so the next tick retries `user`.
    pub fn force_attempt(&self, user: &UserId) -> usize {
        let mut state = self.state.write();
        let mut forced = 0;
        for cqi in state.downloads.values_mut() {
            if cqi.user.user == *user && cqi.state.is_idle() {
                cqi.failures = Failures::None;
                cqi.last_attempt = None;
                cqi.state = CqiState::Waiting;
                forced += 1;
            }
        }
        forced
    }

    /// The peer left every hub: drops its connections.
    ///
    /// Running downloads are aborted; their entries are pruned on the next
    /// tick along with the idle ones.
    pub fn disconnect_user(&self, user: &UserId) {
        let mut events = Vec::new();
        let running: Vec<ConnectionToken> = {
            let mut state = self.state.write();
            let mut running = Vec::new();
            for cqi in state.downloads.values_mut() {
                if cqi.user.user != *user {
                    continue;
                }
                cqi.flags.remove = true;
                if cqi.state == CqiState::Running {
                    cqi.state = CqiState::Waiting;
                    running.push(cqi.token.clone());
                }
            }
            let uploads: Vec<ConnectionToken> = state
                .uploads
                .values()
                .filter(|cqi| cqi.user.user == *user)
                .map(|cqi| cqi.token.clone())
                .collect();
            for token in uploads {
                state.uploads.remove(&token);
                running.push(token.clone());
                events.push(ConnectionEvent::Removed { token });
            }
            running
        };

        for token in &running {
            self.engine.abort_download(token);
        }
        self.emit_all(events);
    }

    // ------------------------------------------------------------------------
    // Expected inbound connections
    // ------------------------------------------------------------------------

    /// A legacy peer `nick` was asked to connect to us on `hub`.
    pub fn expect_nmdc(&self, nick: &str, my_nick: &str, hub: &str) {
        self.expected.insert(
            nmdc_key(nick),
            Expectation {
                user: None,
                hub: hub.to_string(),
                my_nick: my_nick.to_string(),
                registered: Instant::now(),
            },
        );
    }

    /// An ADC peer was asked to connect to us with `token`.
    pub fn expect_adc(&self, token: &ConnectionToken, user: UserId, hub: &str) {
        self.expected.insert(
            token.to_string(),
            Expectation {
                user: Some(user),
                hub: hub.to_string(),
                my_nick: self.settings.nick.clone(),
                registered: Instant::now(),
            },
        );
    }

    pub fn expected_count(&self) -> usize {
        self.expected.len()
    }

    // ------------------------------------------------------------------------
    // Handshakes
    // ------------------------------------------------------------------------

    /// Opens a TCP connection to `addr` and runs the outgoing handshake.
    pub async fn connect_to(
        &self,
        addr: SocketAddr,
        dialect: Dialect,
        peer: HintedUser,
        token: ConnectionToken,
    ) -> Result<ConnectionToken, ConnectionError> {
        let stream = match timeout(self.settings.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                let err = ConnectionError::Io(err);
                self.on_failed(&token, &err);
                return Err(err);
            }
            Err(_) => {
                self.on_failed(&token, &ConnectionError::Timeout);
                return Err(ConnectionError::Timeout);
            }
        };
        self.run_outgoing(stream, dialect, peer, token, None).await
    }

    /// Runs the handshake on a connection we opened.
    ///
    /// We ask to download when `token` belongs to a queued download
    /// connection, otherwise to upload.
    pub async fn run_outgoing<S: AsyncStream + 'static>(
        &self,
        stream: S,
        dialect: Dialect,
        peer: HintedUser,
        token: ConnectionToken,
        peer_keyprint: Option<String>,
    ) -> Result<ConnectionToken, ConnectionError> {
        let want = if self.state.read().downloads.contains_key(&token) {
            Direction::Download
        } else {
            Direction::Upload
        };

        let mut handshake = {
            let mut rng = rand::rng();
            Handshake::outgoing(
                self.handshake_config(dialect, peer_keyprint),
                peer,
                token.clone(),
                want,
                &mut rng,
            )
        };
        let mut transport = LineTransport::new(stream, dialect).boxed();

        match self.drive(&mut handshake, &mut transport).await {
            Ok(outcome) => self.on_handshake(outcome, transport),
            Err(err) => {
                self.on_failed(&token, &err);
                Err(err)
            }
        }
    }

    /// Runs the handshake on a connection the peer opened.
    pub async fn run_incoming<S: AsyncStream + 'static>(
        &self,
        stream: S,
        dialect: Dialect,
        peer_keyprint: Option<String>,
    ) -> Result<ConnectionToken, ConnectionError> {
        let mut handshake = {
            let mut rng = rand::rng();
            Handshake::incoming(self.handshake_config(dialect, peer_keyprint), &mut rng)
        };
        let mut transport = LineTransport::new(stream, dialect).boxed();

        match self.drive(&mut handshake, &mut transport).await {
            Ok(outcome) => self.on_handshake(outcome, transport),
            Err(err) => {
                debug!(
                    user = ?handshake.user(),
                    error = %err,
                    "incoming handshake failed"
                );
                if let Some(token) = handshake.token() {
                    self.on_failed(token, &err);
                }
                Err(err)
            }
        }
    }

    fn handshake_config(&self, dialect: Dialect, peer_keyprint: Option<String>) -> HandshakeConfig {
        HandshakeConfig {
            dialect,
            my_nick: self.settings.nick.clone(),
            my_cid: self.my_cid,
            peer_keyprint,
        }
    }

    async fn drive(
        &self,
        handshake: &mut Handshake,
        transport: &mut LineTransport<BoxedStream>,
    ) -> Result<HandshakeOutcome, ConnectionError> {
        transport.send_all(&handshake.start()).await?;
        loop {
            let command = transport.receive().await?;
            trace!(?command, "handshake");
            let step = handshake.on_command(command, self)?;
            if !step.replies.is_empty() {
                transport.send_all(&step.replies).await?;
            }
            if let Some(outcome) = step.outcome {
                return Ok(outcome);
            }
        }
    }

    fn on_handshake(
        &self,
        outcome: HandshakeOutcome,
        transport: LineTransport<BoxedStream>,
    ) -> Result<ConnectionToken, ConnectionError> {
        let (token, event) = {
            let mut state = self.state.write();
            match outcome.direction {
                Direction::Download => {
                    let token = outcome
                        .token
                        .clone()
                        .filter(|token| state.downloads.contains_key(token))
                        .or_else(|| {
                            state
                                .user_downloads(&outcome.user.user)
                                .filter(|cqi| cqi.state.is_connecting() || cqi.state.is_idle())
                                .min_by_key(|cqi| !cqi.state.is_connecting())
                                .map(|cqi| cqi.token.clone())
                        })
                        .ok_or(ConnectionError::UnexpectedConnection)?;
                    let cqi = state
                        .downloads
                        .get_mut(&token)
                        .ok_or(ConnectionError::NotFound)?;
                    cqi.state = CqiState::Active;
                    cqi.failures = Failures::None;
                    let event = ConnectionEvent::StateChanged {
                        token: token.clone(),
                        state: CqiState::Active,
                    };
                    (token, event)
                }
                Direction::Upload => {
                    let token = outcome.token.clone().unwrap_or_else(ConnectionToken::generate);
                    let mut cqi = ConnectionQueueItem::with_token(
                        token.clone(),
                        outcome.user.clone(),
                        Direction::Upload,
                    );
                    cqi.state = CqiState::Active;
                    state.uploads.insert(token.clone(), cqi);
                    let event = ConnectionEvent::Added {
                        token: token.clone(),
                        user: outcome.user.clone(),
                        direction: Direction::Upload,
                    };
                    (token, event)
                }
            }
        };

        info!(
            user = %outcome.user,
            token = %token,
            direction = ?outcome.direction,
            "connection established"
        );
        self.emit_all(vec![event]);
        self.engine.connection_ready(ReadyConnection {
            token: token.clone(),
            user: outcome.user,
            nick: outcome.nick,
            direction: outcome.direction,
            features: outcome.features,
            transport,
        });
        Ok(token)
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    pub fn download(&self, token: &ConnectionToken) -> Option<ConnectionQueueItem> {
        self.state.read().downloads.get(token).cloned()
    }

    pub fn upload(&self, token: &ConnectionToken) -> Option<ConnectionQueueItem> {
        self.state.read().uploads.get(token).cloned()
    }

    /// Download connections to `user`, including ones flagged for removal.
    pub fn downloads_for(&self, user: &UserId) -> Vec<ConnectionQueueItem> {
        let state = self.state.read();
        let mut items: Vec<ConnectionQueueItem> = state
            .downloads
            .values()
            .filter(|cqi| cqi.user.user == *user)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.token.cmp(&b.token));
        items
    }

    pub fn download_count(&self) -> usize {
        self.state.read().downloads.len()
    }

    pub fn upload_count(&self) -> usize {
        self.state.read().uploads.len()
    }
}

fn nmdc_key(nick: &str) -> String {
    format!("nmdc:{nick}")
}

/// Drops idle download connections flagged for removal.
fn prune(state: &mut ConnectionState, events: &mut Vec<ConnectionEvent>) {
    let flagged: Vec<ConnectionToken> = state
        .downloads
        .values()
        .filter(|cqi| cqi.flags.remove && cqi.state.is_idle())
        .map(|cqi| cqi.token.clone())
        .collect();
    for token in flagged {
        trace!(token = %token, "pruning connection");
        state.downloads.remove(&token);
        events.push(ConnectionEvent::Removed { token });
    }
}

/// Puts a download connection back to waiting after a failure.
///
/// Other idle connections to a multi-connection peer are flagged for
/// removal so only one reconnect per peer stays pending.
fn fail_download(
    state: &mut ConnectionState,
    token: &ConnectionToken,
    protocol: bool,
    reason: String,
    events: &mut Vec<ConnectionEvent>,
) {
    let Some(cqi) = state.downloads.get_mut(token) else {
        return;
    };
    cqi.record_failure(protocol);
    let user = cqi.user.user;
    let mcn = cqi.flags.mcn;
    events.push(ConnectionEvent::Failed {
        token: token.clone(),
        reason,
    });

    if mcn {
        for sibling in state.downloads.values_mut() {
            if sibling.user.user == user
                && sibling.token != *token
                && !sibling.flags.small_slot
                && sibling.state.is_idle()
            {
                sibling.flags.remove = true;
            }
        }
    }
}

impl HandshakeContext for ConnectionManager {
    fn take_nmdc_expectation(&self, nick: &str) -> Option<Expectation> {
        self.expected.remove(&nmdc_key(nick)).map(|(_, e)| e)
    }

    fn take_adc_expectation(&self, token: &str) -> Option<Expectation> {
        self.expected.remove(token).map(|(_, e)| e)
    }

    fn find_by_nick(&self, hub: &str, nick: &str) -> Option<UserId> {
        self.users.find_by_nick(hub, nick)
    }

    fn keyprint(&self, user: &UserId, hub: &str) -> Option<String> {
        self.users.keyprint(user, hub)
    }

    fn wants_download(&self, user: &UserId) -> bool {
        self.state
            .read()
            .user_downloads(user)
            .any(|cqi| cqi.state.is_connecting() || cqi.state.is_idle())
    }
}

impl ConnectionControl for ConnectionManager {
    fn detach_download(&self, token: &ConnectionToken) {
        self.detach(token);
    }

    fn request_download(&self, user: &HintedUser, small_slot: bool) {
        self.add_download(user, small_slot);
    }
}
