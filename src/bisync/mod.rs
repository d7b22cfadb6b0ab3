// ABOUTME: Bidirectional row sync between two independently-writable databases
// ABOUTME: Last-write-wins on a version column, insert-missing otherwise

pub mod dependencies;
pub mod dialect;
pub mod engine;
pub mod order;
pub mod reader;
pub mod schema;
pub mod sequences;
pub mod stats;
pub mod version;
pub mod writer;

use anyhow::{anyhow, Result};
use std::future::Future;
use tokio_util::sync::CancellationToken;

pub use dialect::{Dialect, PostgresDialect};
pub use engine::{BidirectionalSync, InspectReport};
pub use schema::{TableMetadata, TableShape};
pub use stats::{
    BidirectionalSyncResult, Direction, DirectionSyncStats, FailedTable, SequenceResetStats,
    SkipReason, SkippedTable, SyncMode, SyncTotals, TableSyncStats,
};

/// One row's values as text, laid out as `TableMetadata::columns`. `None` is SQL NULL.
pub type RowValues = Vec<Option<String>>;

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(anyhow!("sync run cancelled")),
        result = fut => result,
    }
}
