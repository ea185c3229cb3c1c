use std::fmt;
use std::str::FromStr;

use rand::Rng as _;

use crate::constants::HASH_LEN;
use crate::hash::{decode_base32, DecodeError};
use data_encoding::BASE32_NOPAD;

/// A 24-byte client identity (CID).
///
/// Peers are identified by CID regardless of which hub they were seen on;
/// hub membership is carried separately by [`HintedUser`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub [u8; HASH_LEN]);

impl UserId {
    pub fn generate() -> Self {
        let mut id = [0u8; HASH_LEN];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != HASH_LEN {
            return None;
        }
        let mut id = [0u8; HASH_LEN];
        id.copy_from_slice(bytes);
        Some(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE32_NOPAD.encode(&self.0))
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = BASE32_NOPAD.encode(&self.0);
        write!(f, "UserId({}..)", &s[..8])
    }
}

impl FromStr for UserId {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_base32(s).map(Self)
    }
}

/// A user together with the hub it should be reached through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HintedUser {
    pub user: UserId,
    pub hub: String,
}

impl HintedUser {
    pub fn new(user: UserId, hub: impl Into<String>) -> Self {
        Self {
            user,
            hub: hub.into(),
        }
    }
}

impl fmt::Display for HintedUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.hub)
    }
}
