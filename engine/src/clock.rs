//! Lexicographic timestamps for last-write-wins ordering.
//!
//! Every field write carries one timestamp; comparing two timestamps as
//! plain strings yields the total order all peers agree on.

use serde::{Deserialize, Serialize};

/// A lexicographically comparable timestamp.
///
/// Wire format: `YYYY-MM-DDTHH:MM:SS.mmmZ#SSSSSS#<node>` - a fixed-width
/// ISO-8601 UTC instant, a zero-padded per-process sequence number, and a
/// process-unique node nonce. The instant dominates the ordering; the
/// suffix keeps timestamps from different peers distinct even when their
/// wall clocks collide on the same millisecond.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

impl Timestamp {
    /// Wrap a raw timestamp string.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the raw string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Timestamp {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// A monotonic timestamp source.
///
/// `tick` never issues a value smaller than a previously issued one, even
/// if the supplied wall clock runs backwards: the last instant is reused
/// and the sequence number keeps the output strictly increasing. Wall time
/// is an input, never read from the environment.
#[derive(Debug, Clone)]
pub struct Clock {
    node: String,
    instant: String,
    seq: u64,
}

impl Clock {
    /// Create a clock for a node. The node string should be unique per
    /// process (a random nonce is fine).
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            instant: format_instant(0),
            seq: 0,
        }
    }

    /// The node nonce this clock stamps into its output.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Issue the next timestamp for the given wall time (milliseconds
    /// since the Unix epoch).
    pub fn tick(&mut self, now_millis: i64) -> Timestamp {
        let instant = format_instant(now_millis);
        if instant > self.instant {
            self.instant = instant;
        }
        self.seq += 1;
        Timestamp(format!("{}#{:06}#{}", self.instant, self.seq, self.node))
    }
}

fn format_instant(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .unwrap_or_default()
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}
