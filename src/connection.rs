//! Client-to-client connections.
//!
//! Download connections are queued per peer as [`ConnectionQueueItem`]s and
//! (re)attempted by the [`ConnectionManager`]'s once-a-second scheduler,
//! with a backoff that grows with consecutive failures. Established streams
//! go through a [`Handshake`] in either line dialect and are then handed to
//! the download engine as a [`ReadyConnection`].
//!
//! # Examples
//!
//! ```
//! use dcflow::connection::{lock_to_key, Command, Dialect};
//!
//! let line = Command::MyNick("alice".into()).encode();
//! assert_eq!(line, b"$MyNick alice|");
//! assert_eq!(
//!     Command::decode(Dialect::Nmdc, b"$MyNick alice").unwrap(),
//!     Command::MyNick("alice".into())
//! );
//! assert!(!lock_to_key(b"EXTENDEDPROTOCOLABCABCABCABCABCABC").is_empty());
//! ```

mod error;
mod handshake;
mod item;
mod manager;
mod protocol;
mod transport;

pub use error::ConnectionError;
pub use handshake::{
    resolve_direction, Expectation, Handshake, HandshakeConfig, HandshakeContext,
    HandshakeOutcome, Step, ADC_FEATURES, NMDC_FEATURES, NMDC_REQUIRED,
};
pub use item::{ConnectionQueueItem, ConnectionToken, CqiFlags, CqiState, Direction, Failures};
pub use manager::{ConnectionEvent, ConnectionManager, ReadyConnection};
pub use protocol::{adc_escape, adc_unescape, lock_to_key, Command, Dialect};
pub use transport::{AsyncStream, BoxedStream, LineTransport};
