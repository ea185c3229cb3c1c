use std::fmt;
use std::time::{Duration, Instant};

use rand::Rng as _;

use crate::user::HintedUser;

/// Identifies one connection attempt, the live connection it becomes, and
/// the download running on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionToken(String);

impl ConnectionToken {
    pub fn generate() -> Self {
        Self(rand::rng().random::<u32>().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionToken {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

impl From<String> for ConnectionToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl fmt::Display for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Download,
    Upload,
}

/// Where a connection queue item is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqiState {
    /// Idle until the reconnect scheduler picks it.
    Waiting,
    /// A connect request went out at `since`.
    Connecting { since: Instant },
    /// Handshake done, no transfer yet.
    Active,
    Running,
    /// The download engine had no free slot on the last attempt.
    NoDownloadSlots,
}

impl CqiState {
    pub fn is_connecting(&self) -> bool {
        matches!(self, CqiState::Connecting { .. })
    }

    /// States the reconnect scheduler acts on.
    pub fn is_idle(&self) -> bool {
        matches!(self, CqiState::Waiting | CqiState::NoDownloadSlots)
    }
}

/// Consecutive failures, or a protocol failure that blocks automatic retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Failures {
    #[default]
    None,
    Count(u32),
    Protocol,
}

impl Failures {
    pub fn count(&self) -> u32 {
        match self {
            Failures::None | Failures::Protocol => 0,
            Failures::Count(n) => *n,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CqiFlags {
    /// The peer accepts several connections from us.
    pub mcn: bool,
    /// Reserved for small files and lists; exempt from the per-peer cap.
    pub small_slot: bool,
    /// Pruned on the next scheduler tick.
    pub remove: bool,
}

/// One pending or established connection to a peer.
#[derive(Debug, Clone)]
pub struct ConnectionQueueItem {
    pub token: ConnectionToken,
    pub user: HintedUser,
    pub direction: Direction,
    pub flags: CqiFlags,
    /// Connection cap the peer advertised, if any.
    pub max_conns: Option<usize>,
    pub(crate) state: CqiState,
    pub(crate) last_attempt: Option<Instant>,
    pub(crate) failures: Failures,
}

impl ConnectionQueueItem {
    pub fn new(user: HintedUser, direction: Direction) -> Self {
        Self::with_token(ConnectionToken::generate(), user, direction)
    }

    pub fn with_token(token: ConnectionToken, user: HintedUser, direction: Direction) -> Self {
        Self {
            token,
            user,
            direction,
            flags: CqiFlags::default(),
            max_conns: None,
            state: CqiState::Waiting,
            last_attempt: None,
            failures: Failures::None,
        }
    }

    pub fn state(&self) -> CqiState {
        self.state
    }

    pub fn failures(&self) -> Failures {
        self.failures
    }

    pub fn last_attempt(&self) -> Option<Instant> {
        self.last_attempt
    }

    pub fn is_protocol_blocked(&self) -> bool {
        self.failures == Failures::Protocol
    }

    /// Whether the backoff since the last attempt has run out.
    ///
    /// The backoff is `base * max(1, failures)`.
    pub fn attempt_due(&self, now: Instant, base: Duration) -> bool {
        match self.last_attempt {
            None => true,
            Some(last) => {
                let factor = self.failures.count().max(1);
                now >= last + base * factor
            }
        }
    }

    pub(crate) fn record_failure(&mut self, protocol: bool) {
        self.failures = if protocol {
            Failures::Protocol
        } else {
            Failures::Count(self.failures.count() + 1)
        };
        self.state = CqiState::Waiting;
    }
}
