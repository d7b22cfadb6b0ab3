// ABOUTME: Batch applier for selected rows - writes them to the target side
// ABOUTME: Uses typed multi-row INSERT ... ON CONFLICT statements per chunk

use anyhow::{Context, Result};
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;

use super::dialect::Dialect;
use super::schema::TableMetadata;
use super::stats::SyncMode;
use super::{cancellable, RowValues};

/// PostgreSQL accepts at most 65535 bind parameters per statement.
const MAX_PARAMS: usize = 65_000;

/// Rows per statement: the configured size, shrunk for very wide tables.
pub fn effective_batch_size(configured: usize, num_columns: usize) -> usize {
    let by_params = std::cmp::max(1, MAX_PARAMS / std::cmp::max(1, num_columns));
    std::cmp::max(1, std::cmp::min(configured, by_params))
}

/// Writes rows into one target connection.
///
/// Each chunk is its own statement and commits on its own; there is no
/// transaction around a whole table.
pub struct BatchApplier<'a> {
    client: &'a Client,
    dialect: &'a dyn Dialect,
    batch_size: usize,
}

impl<'a> BatchApplier<'a> {
    pub fn new(client: &'a Client, dialect: &'a dyn Dialect, batch_size: usize) -> Self {
        Self {
            client,
            dialect,
            batch_size,
        }
    }

    /// Apply `rows` (laid out as `table.columns`) in order.
    ///
    /// `target_types` are the target side's SQL types for `table.columns`.
    /// Returns the number of rows the target reports as written.
    pub async fn apply(
        &self,
        schema: &str,
        table: &TableMetadata,
        target_types: &[String],
        mode: SyncMode,
        rows: &[RowValues],
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let chunk_size = effective_batch_size(self.batch_size, table.columns.len());
        let mut total_affected = 0u64;

        for (batch_idx, chunk) in rows.chunks(chunk_size).enumerate() {
            let query = self
                .dialect
                .build_upsert(schema, table, target_types, mode, chunk.len());
            if batch_idx == 0 {
                tracing::trace!("{} statement: {}", self.dialect.name(), query);
            }

            let params: Vec<&(dyn ToSql + Sync)> = chunk
                .iter()
                .flat_map(|row| row.iter().map(|v| v as &(dyn ToSql + Sync)))
                .collect();

            let affected = cancellable(cancel, async {
                self.client.execute(query.as_str(), &params).await.with_context(|| {
                    format!(
                        "Failed to apply batch {} ({} rows) to {}.{}",
                        batch_idx + 1,
                        chunk.len(),
                        schema,
                        table.table_name
                    )
                })
            })
            .await?;

            tracing::debug!(
                "{}.{} batch {}: {} rows sent, {} written",
                schema,
                table.table_name,
                batch_idx + 1,
                chunk.len(),
                affected
            );
            total_affected += affected;
        }

        Ok(total_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_batch_size_uses_configured_value() {
        assert_eq!(effective_batch_size(100, 12), 100);
    }

    #[test]
    fn test_effective_batch_size_respects_param_limit() {
        // 1000 columns * 100 rows would exceed the bind-parameter limit.
        assert_eq!(effective_batch_size(100, 1000), 65);
        assert_eq!(effective_batch_size(100, 100_000), 1);
    }

    #[test]
    fn test_effective_batch_size_never_zero() {
        assert_eq!(effective_batch_size(0, 5), 1);
        assert_eq!(effective_batch_size(10, 0), 10);
    }
}
