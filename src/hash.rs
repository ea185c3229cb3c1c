use std::fmt;
use std::str::FromStr;

use data_encoding::BASE32_NOPAD;
use thiserror::Error;

use crate::constants::{HASH_BASE32_LEN, HASH_LEN};

/// Error parsing a base-32 encoded 24-byte value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid base32 length: {0}")]
    InvalidLength(usize),

    #[error("invalid base32 data")]
    InvalidData,
}

pub(crate) fn decode_base32(s: &str) -> Result<[u8; HASH_LEN], DecodeError> {
    if s.len() != HASH_BASE32_LEN {
        return Err(DecodeError::InvalidLength(s.len()));
    }
    let bytes = BASE32_NOPAD
        .decode(s.to_ascii_uppercase().as_bytes())
        .map_err(|_| DecodeError::InvalidData)?;
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Root of a file's Tiger hash tree.
///
/// The root doubles as the file's content identity: two queue items with the
/// same root hold the same bytes.
///
/// # Examples
///
/// ```
/// use dcflow::TthValue;
///
/// let tth: TthValue = "LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ".parse().unwrap();
/// assert_eq!(tth.to_string(), "LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TthValue(pub [u8; HASH_LEN]);

impl TthValue {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != HASH_LEN {
            return None;
        }
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(bytes);
        Some(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Display for TthValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE32_NOPAD.encode(&self.0))
    }
}

impl fmt::Debug for TthValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = BASE32_NOPAD.encode(&self.0);
        write!(f, "TthValue({}..)", &s[..8])
    }
}

impl FromStr for TthValue {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_base32(s).map(Self)
    }
}

/// A downloaded hash tree, handed to the [`HashStore`](crate::HashStore)
/// once a tree transfer finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashTree {
    pub root: TthValue,
    pub file_size: u64,
    pub block_size: u64,
    /// Concatenated leaf hashes, `HASH_LEN` bytes each.
    pub leaves: Vec<u8>,
}

impl HashTree {
    pub fn new(root: TthValue, file_size: u64, block_size: u64, leaves: Vec<u8>) -> Self {
        Self {
            root,
            file_size,
            block_size,
            leaves,
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len() / HASH_LEN
    }

    /// A tree is usable when it has exactly one leaf per block.
    pub fn is_consistent(&self) -> bool {
        if self.block_size == 0 || self.leaves.len() % HASH_LEN != 0 {
            return false;
        }
        let blocks = self.file_size.div_ceil(self.block_size).max(1);
        self.leaf_count() as u64 == blocks
    }
}
