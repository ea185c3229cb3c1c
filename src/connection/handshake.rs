//! Handshake sequencing, independent of any socket.
//!
//! [`Handshake`] consumes the peer's commands one at a time and answers
//! with the lines to send back, until it yields a [`HandshakeOutcome`] or
//! rejects the peer. Lookups it needs (pending expectations, identities,
//! keyprints) go through [`HandshakeContext`].

use std::time::Instant;

use rand::Rng;

use super::error::ConnectionError;
use super::item::{ConnectionToken, Direction};
use super::protocol::{lock_to_key, Command, Dialect};
use crate::constants::MAX_DIRECTION_NUMBER;
use crate::user::{HintedUser, UserId};

/// Features a legacy peer must announce in `$Supports`.
pub const NMDC_REQUIRED: [&str; 2] = ["ADCGet", "TTHF"];
pub const NMDC_FEATURES: [&str; 5] = ["MiniSlots", "XmlBZList", "ADCGet", "TTHL", "TTHF"];
pub const ADC_FEATURES: [&str; 4] = ["BAS0", "BASE", "TIGR", "BZIP"];

const LOCK: &str = "EXTENDEDPROTOCOLABCABCABCABCABCABC";
const PK: &str = "DCFLOW010";

/// An inbound connection we asked a peer to make.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    /// Known for ADC; legacy peers are resolved by nick on arrival.
    pub user: Option<UserId>,
    pub hub: String,
    /// Our nick on that hub.
    pub my_nick: String,
    pub registered: Instant,
}

pub trait HandshakeContext {
    /// Removes and returns the expectation registered for a legacy nick.
    fn take_nmdc_expectation(&self, nick: &str) -> Option<Expectation>;

    /// Removes and returns the expectation registered for an ADC token.
    fn take_adc_expectation(&self, token: &str) -> Option<Expectation>;

    fn find_by_nick(&self, hub: &str, nick: &str) -> Option<UserId>;

    fn keyprint(&self, user: &UserId, hub: &str) -> Option<String>;

    /// Whether a download connection to `user` is being waited for.
    fn wants_download(&self, user: &UserId) -> bool;
}

#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub dialect: Dialect,
    pub my_nick: String,
    pub my_cid: UserId,
    /// Keyprint of the peer's certificate, when the stream is encrypted.
    pub peer_keyprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub user: HintedUser,
    pub nick: String,
    pub direction: Direction,
    pub token: Option<ConnectionToken>,
    pub features: Vec<String>,
}

/// Lines to send and, once finished, the outcome.
#[derive(Debug, Default)]
pub struct Step {
    pub replies: Vec<Command>,
    pub outcome: Option<HandshakeOutcome>,
}

impl Step {
    fn reply(replies: Vec<Command>) -> Self {
        Self {
            replies,
            outcome: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Nick,
    Lock,
    /// `$Supports`, `$Direction` and `$Key` in any order.
    Negotiate,
    Sup,
    Inf,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Outgoing,
    Incoming,
}

pub struct Handshake {
    config: HandshakeConfig,
    role: Role,
    stage: Stage,
    number: u32,
    want: Option<Direction>,
    user: Option<HintedUser>,
    nick: Option<String>,
    token: Option<ConnectionToken>,
    features: Vec<String>,
    their_direction: Option<(Direction, u32)>,
}

impl Handshake {
    /// We opened the connection to a known peer.
    pub fn outgoing(
        config: HandshakeConfig,
        peer: HintedUser,
        token: ConnectionToken,
        want: Direction,
        rng: &mut impl Rng,
    ) -> Self {
        let stage = match config.dialect {
            Dialect::Adc => Stage::Sup,
            Dialect::Nmdc => Stage::Nick,
        };
        Self {
            config,
            role: Role::Outgoing,
            stage,
            number: rng.random_range(0..=MAX_DIRECTION_NUMBER),
            want: Some(want),
            user: Some(peer),
            nick: None,
            token: Some(token),
            features: Vec::new(),
            their_direction: None,
        }
    }

    /// The peer connected to us; who it is comes out of the handshake.
    pub fn incoming(config: HandshakeConfig, rng: &mut impl Rng) -> Self {
        let stage = match config.dialect {
            Dialect::Adc => Stage::Sup,
            Dialect::Nmdc => Stage::Nick,
        };
        Self {
            config,
            role: Role::Incoming,
            stage,
            number: rng.random_range(0..=MAX_DIRECTION_NUMBER),
            want: None,
            user: None,
            nick: None,
            token: None,
            features: Vec::new(),
            their_direction: None,
        }
    }

    /// The peer, once identified.
    pub fn user(&self) -> Option<&HintedUser> {
        self.user.as_ref()
    }

    pub fn token(&self) -> Option<&ConnectionToken> {
        self.token.as_ref()
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn is_done(&self) -> bool {
        self.stage == Stage::Done
    }

    /// Lines to send before reading anything.
    pub fn start(&self) -> Vec<Command> {
        if self.role == Role::Incoming {
            return Vec::new();
        }
        match self.config.dialect {
            Dialect::Adc => vec![adc_sup()],
            Dialect::Nmdc => vec![Command::MyNick(self.config.my_nick.clone()), our_lock()],
        }
    }

    pub fn on_command(
        &mut self,
        command: Command,
        ctx: &dyn HandshakeContext,
    ) -> Result<Step, ConnectionError> {
        match command {
            Command::Sta { code, description } if code.starts_with('2') => {
                return Err(ConnectionError::Protocol(format!("{code} {description}")));
            }
            Command::Sta { .. } => return Ok(Step::default()),
            Command::Error(message) => return Err(ConnectionError::Protocol(message)),
            Command::MaxedOut => {
                return Err(ConnectionError::Protocol("no slots available".into()))
            }
            _ => {}
        }

        match (self.stage, command) {
            (Stage::Nick, Command::MyNick(nick)) => self.on_my_nick(nick, ctx),
            (Stage::Lock, Command::Lock { lock, .. }) => Ok(self.on_lock(&lock)),
            (Stage::Negotiate, Command::Supports(features)) => {
                self.features = features;
                Ok(Step::default())
            }
            (Stage::Negotiate, Command::Direction { direction, number }) => {
                self.their_direction = Some((direction, number));
                Ok(Step::default())
            }
            (Stage::Negotiate, Command::Key(key)) => self.on_key(&key, ctx),
            (Stage::Sup, Command::Sup { add, .. }) => self.on_sup(add),
            (Stage::Inf, command @ Command::Inf(_)) => self.on_inf(&command, ctx),
            (stage, command) => Err(ConnectionError::Protocol(format!(
                "unexpected {command:?} in {stage:?}"
            ))),
        }
    }

    fn on_my_nick(
        &mut self,
        nick: String,
        ctx: &dyn HandshakeContext,
    ) -> Result<Step, ConnectionError> {
        let hub = match self.role {
            Role::Outgoing => {
                let peer = self.user.as_ref().ok_or(ConnectionError::UnknownUser)?;
                peer.hub.clone()
            }
            Role::Incoming => {
                let expectation = ctx
                    .take_nmdc_expectation(&nick)
                    .ok_or(ConnectionError::UnexpectedConnection)?;
                self.config.my_nick = expectation.my_nick;
                expectation.hub
            }
        };

        let user = ctx.find_by_nick(&hub, &nick).ok_or(ConnectionError::UnknownUser)?;
        if let Some(peer) = &self.user {
            if peer.user != user {
                return Err(ConnectionError::UnknownUser);
            }
        }
        if self.want.is_none() {
            self.want = Some(if ctx.wants_download(&user) {
                Direction::Download
            } else {
                Direction::Upload
            });
        }

        self.user = Some(HintedUser::new(user, hub));
        self.nick = Some(nick);
        self.stage = Stage::Lock;
        Ok(Step::default())
    }

    fn on_lock(&mut self, lock: &str) -> Step {
        let mut replies = Vec::new();
        if self.role == Role::Incoming {
            replies.push(Command::MyNick(self.config.my_nick.clone()));
            replies.push(our_lock());
        }
        replies.push(Command::Supports(
            NMDC_FEATURES.iter().map(|f| f.to_string()).collect(),
        ));
        replies.push(Command::Direction {
            direction: self.want.unwrap_or(Direction::Upload),
            number: self.number,
        });
        replies.push(Command::Key(lock_to_key(lock.as_bytes())));
        self.stage = Stage::Negotiate;
        Step::reply(replies)
    }

    fn on_key(&mut self, key: &[u8], ctx: &dyn HandshakeContext) -> Result<Step, ConnectionError> {
        if key != lock_to_key(LOCK.as_bytes()).as_slice() {
            return Err(ConnectionError::Protocol("invalid key".into()));
        }
        let missing: Vec<&str> = NMDC_REQUIRED
            .iter()
            .filter(|f| !self.features.iter().any(|have| have.as_str() == **f))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(ConnectionError::MissingFeatures(missing.join(" ")));
        }
        let (theirs, their_number) = self
            .their_direction
            .ok_or_else(|| ConnectionError::Protocol("no direction".into()))?;
        let ours = self.want.unwrap_or(Direction::Upload);
        let direction = resolve_direction(ours, self.number, theirs, their_number)?;
        self.finish(direction, ctx)
    }

    fn on_sup(&mut self, add: Vec<String>) -> Result<Step, ConnectionError> {
        let has = |f: &str| add.iter().any(|a| a == f);
        let mut missing = Vec::new();
        if !has("BASE") && !has("BAS0") {
            missing.push("BASE");
        }
        if !has("TIGR") {
            missing.push("TIGR");
        }
        if !missing.is_empty() {
            return Err(ConnectionError::MissingFeatures(missing.join(" ")));
        }
        self.features = add;
        self.stage = Stage::Inf;

        let replies = match self.role {
            Role::Outgoing => Vec::new(),
            Role::Incoming => vec![
                adc_sup(),
                Command::Inf(vec![("ID".into(), self.config.my_cid.to_string())]),
            ],
        };
        Ok(Step::reply(replies))
    }

    fn on_inf(
        &mut self,
        command: &Command,
        ctx: &dyn HandshakeContext,
    ) -> Result<Step, ConnectionError> {
        let cid: UserId = command
            .inf_param("ID")
            .and_then(|id| id.parse().ok())
            .ok_or(ConnectionError::UnknownUser)?;

        match self.role {
            Role::Outgoing => {
                let peer = self.user.as_ref().ok_or(ConnectionError::UnknownUser)?;
                if peer.user != cid {
                    return Err(ConnectionError::UnknownUser);
                }
                let token = self.token.as_ref().map(|t| t.to_string()).unwrap_or_default();
                let reply = Command::Inf(vec![
                    ("ID".into(), self.config.my_cid.to_string()),
                    ("TO".into(), token),
                ]);
                let direction = self.want.unwrap_or(Direction::Upload);
                let mut step = self.finish(direction, ctx)?;
                step.replies.push(reply);
                Ok(step)
            }
            Role::Incoming => {
                let token = command
                    .inf_param("TO")
                    .ok_or(ConnectionError::UnexpectedConnection)?;
                let expectation = ctx
                    .take_adc_expectation(token)
                    .ok_or(ConnectionError::UnexpectedConnection)?;
                if expectation.user != Some(cid) {
                    return Err(ConnectionError::UnknownUser);
                }
                self.token = Some(ConnectionToken::from(token));
                self.user = Some(HintedUser::new(cid, expectation.hub));
                let direction = if ctx.wants_download(&cid) {
                    Direction::Download
                } else {
                    Direction::Upload
                };
                self.finish(direction, ctx)
            }
        }
    }

    fn finish(
        &mut self,
        direction: Direction,
        ctx: &dyn HandshakeContext,
    ) -> Result<Step, ConnectionError> {
        let user = self.user.clone().ok_or(ConnectionError::UnknownUser)?;
        if let (Some(expected), Some(actual)) =
            (ctx.keyprint(&user.user, &user.hub), self.config.peer_keyprint.as_ref())
        {
            if &expected != actual {
                return Err(ConnectionError::KeyprintMismatch);
            }
        }

        self.stage = Stage::Done;
        Ok(Step {
            replies: Vec::new(),
            outcome: Some(HandshakeOutcome {
                nick: self.nick.clone().unwrap_or_default(),
                user,
                direction,
                token: self.token.clone(),
                features: self.features.clone(),
            }),
        })
    }
}

fn our_lock() -> Command {
    Command::Lock {
        lock: LOCK.to_string(),
        pk: PK.to_string(),
    }
}

fn adc_sup() -> Command {
    Command::Sup {
        add: ADC_FEATURES.iter().map(|f| f.to_string()).collect(),
        remove: Vec::new(),
    }
}

/// Settles who downloads when both sides have announced a direction.
pub fn resolve_direction(
    ours: Direction,
    our_number: u32,
    theirs: Direction,
    their_number: u32,
) -> Result<Direction, ConnectionError> {
    match (ours, theirs) {
        (Direction::Download, Direction::Upload) => Ok(Direction::Download),
        (Direction::Upload, Direction::Download) => Ok(Direction::Upload),
        (Direction::Upload, Direction::Upload) => {
            Err(ConnectionError::Protocol("neither side downloads".into()))
        }
        (Direction::Download, Direction::Download) => {
            if our_number > their_number {
                Ok(Direction::Download)
            } else if our_number < their_number {
                Ok(Direction::Upload)
            } else {
                Err(ConnectionError::DirectionConflict)
            }
        }
    }
}
