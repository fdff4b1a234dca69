//! Snapshot metadata and its directory-name encoding.

use std::time::{SystemTime, UNIX_EPOCH};

/// Identity of one snapshot.
///
/// `position` is a log position the processor had fully and durably
/// applied when the copy was taken; `term` comes from the replication
/// layer at partition install time; `index` increases by one per
/// snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SnapshotMetadata {
    /// Manifest format version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Monotonically increasing snapshot counter.
    pub index: u64,
    /// Replication term the snapshot was taken under.
    pub term: u64,
    /// Wall-clock timestamp (millis since Unix epoch).
    pub timestamp_ms: u64,
    /// Log position this snapshot corresponds to.
    pub position: i64,
}

fn default_version() -> u32 {
    1
}

impl SnapshotMetadata {
    /// Creates metadata stamped with the current wall-clock time.
    #[must_use]
    pub fn new(index: u64, term: u64, position: i64) -> Self {
        #[allow(clippy::cast_possible_truncation)] // u64 millis outlive this software
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            version: 1,
            index,
            term,
            timestamp_ms,
            position,
        }
    }

    /// Returns the directory name encoding this metadata:
    /// `{index}-{term}-{timestamp}-{position}`.
    #[must_use]
    pub fn dir_name(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.index, self.term, self.timestamp_ms, self.position
        )
    }

    /// Parses a directory name produced by [`dir_name`](Self::dir_name).
    #[must_use]
    pub fn parse_dir_name(name: &str) -> Option<Self> {
        let mut parts = name.split('-');
        let index = parts.next()?.parse().ok()?;
        let term = parts.next()?.parse().ok()?;
        let timestamp_ms = parts.next()?.parse().ok()?;
        let position = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            version: 1,
            index,
            term,
            timestamp_ms,
            position,
        })
    }
}

impl std::fmt::Display for SnapshotMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}
