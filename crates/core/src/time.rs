//! Logical time and source positions.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Logical commit time. Strictly increasing per commit, never reused.
///
/// `Timestamp::ZERO` means "nothing committed yet"; the first commit is at time 1.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The time before any commit.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Returns the timestamp following this one.
    #[inline]
    pub fn next(self) -> Timestamp {
        Timestamp(self.0 + 1)
    }

    /// Returns the raw clock value.
    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a source in its external stream, as reported by the connector.
///
/// Offsets are opaque to the engine: they are recorded per commit and handed back to
/// the connector on recovery so it can resume right after the last committed event.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Offset {
    /// Sequential position (line number, message offset, ...)
    Position(u64),
    /// Connector-defined cursor (file name plus position, LSN, ...)
    Token(String),
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Offset::Position(p) => write!(f, "#{p}"),
            Offset::Token(t) => write!(f, "{t}"),
        }
    }
}
