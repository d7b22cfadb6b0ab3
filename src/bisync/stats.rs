// ABOUTME: Result and statistics types produced by a bidirectional sync run
// ABOUTME: Serializable so callers can log or persist them as an audit trail

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Conflict policy used for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// A version column exists; the newer row overwrites the older one.
    LastWriteWins,
    /// No version column; only rows missing on the target are copied.
    InsertMissing,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::LastWriteWins => write!(f, "last-write-wins"),
            SyncMode::InsertMissing => write!(f, "insert-missing"),
        }
    }
}

/// Why a table was left out of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// One side has no introspectable columns for the table.
    MetadataUnavailable,
    /// Primary keys differ in membership or order, or no columns overlap.
    IncompatiblePrimaryKeyOrColumns,
    /// At least one side has no primary key.
    MissingPrimaryKey,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MetadataUnavailable => write!(f, "metadata-unavailable"),
            SkipReason::IncompatiblePrimaryKeyOrColumns => {
                write!(f, "incompatible-primary-key-or-columns")
            }
            SkipReason::MissingPrimaryKey => write!(f, "missing-primary-key"),
        }
    }
}

/// Which way rows flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LocalToPeer,
    PeerToLocal,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::LocalToPeer => write!(f, "local->peer"),
            Direction::PeerToLocal => write!(f, "peer->local"),
        }
    }
}

/// Outcome of one direction for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionSyncStats {
    /// Rows read from the source side
    pub examined: u64,
    /// Rows written to the target side
    pub applied: u64,
    pub mode: SyncMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSyncStats {
    pub table: String,
    pub local_to_peer: DirectionSyncStats,
    pub peer_to_local: DirectionSyncStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedTable {
    pub table: String,
    pub reason: SkipReason,
}

/// A table whose sync hit a database error while failures were isolated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTable {
    pub table: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTotals {
    /// Rows applied to the peer
    pub local_to_peer: u64,
    /// Rows applied to the local side
    pub peer_to_local: u64,
    /// Tables synchronized in both directions
    pub tables: usize,
    pub skipped_tables: usize,
    pub failed_tables: usize,
}

/// Number of sequences moved past the synced maximum, per side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceResetStats {
    pub local: usize,
    pub peer: usize,
}

/// Everything a caller learns from one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidirectionalSyncResult {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Peer connection string with credentials removed
    pub peer: String,
    pub dry_run: bool,
    pub totals: SyncTotals,
    pub skipped_tables: Vec<SkippedTable>,
    pub failed_tables: Vec<FailedTable>,
    pub tables: Vec<TableSyncStats>,
    pub sequences_reset: SequenceResetStats,
}

impl BidirectionalSyncResult {
    /// Start an empty result for a run against `peer` (already masked).
    pub fn new(peer: String, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            peer,
            dry_run,
            totals: SyncTotals::default(),
            skipped_tables: Vec::new(),
            failed_tables: Vec::new(),
            tables: Vec::new(),
            sequences_reset: SequenceResetStats::default(),
        }
    }

    pub fn record_table(&mut self, stats: TableSyncStats) {
        self.totals.local_to_peer += stats.local_to_peer.applied;
        self.totals.peer_to_local += stats.peer_to_local.applied;
        self.totals.tables += 1;
        self.tables.push(stats);
    }

    pub fn record_skip(&mut self, table: &str, reason: SkipReason) {
        self.totals.skipped_tables += 1;
        self.skipped_tables.push(SkippedTable {
            table: table.to_string(),
            reason,
        });
    }

    pub fn record_failure(&mut self, table: &str, error: String) {
        self.totals.failed_tables += 1;
        self.failed_tables.push(FailedTable {
            table: table.to_string(),
            error,
        });
    }

    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    /// Total rows written in either direction.
    pub fn total_applied(&self) -> u64 {
        self.totals.local_to_peer + self.totals.peer_to_local
    }

    /// True when no table failed.
    pub fn is_success(&self) -> bool {
        self.failed_tables.is_empty()
    }
}
