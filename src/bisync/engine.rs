// ABOUTME: BidirectionalSync orchestrator - one full pass between two databases
// ABOUTME: Connects both sides, syncs every common table both ways, resets sequences

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;

use super::cancellable;
use super::dependencies::{discovered_self_reference, load_foreign_keys, order_tables, ForeignKey};
use super::dialect::PostgresDialect;
use super::order::order_rows;
use super::reader::read_selected_rows;
use super::schema::{introspect_table, list_tables, reconcile_metadata, TableMetadata};
use super::sequences::reset_sequences;
use super::stats::{
    BidirectionalSyncResult, Direction, DirectionSyncStats, SkipReason, SyncMode, TableSyncStats,
};
use super::version::{build_version_index, RowSelector};
use super::writer::BatchApplier;
use crate::config::{FailureMode, SyncConfig};
use crate::postgres::{connect_with_retry, PgSession, SessionSettings};
use crate::utils::mask_connection_string;

/// Everything needed to sync one table in both directions.
#[derive(Debug, Clone)]
struct TablePlan {
    metadata: TableMetadata,
    /// Local SQL types for `metadata.columns`, used when writing to local
    local_types: Vec<String>,
    /// Peer SQL types for `metadata.columns`, used when writing to peer
    peer_types: Vec<String>,
    self_reference: Option<String>,
}

impl TablePlan {
    fn self_reference_position(&self) -> Option<usize> {
        self.self_reference
            .as_deref()
            .and_then(|c| self.metadata.column_index(c))
    }
}

/// What a sync run would do with one table, without touching any rows.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectReport {
    pub table: String,
    pub metadata: Option<TableMetadata>,
    pub mode: Option<SyncMode>,
    pub skip_reason: Option<SkipReason>,
    pub self_reference: Option<String>,
    pub local_types: Vec<String>,
    pub peer_types: Vec<String>,
}

/// Bidirectional sync between a local database and one peer.
///
/// A run is a single pass: every table present on both sides is synced
/// local->peer and then peer->local, after which integer sequences on both
/// sides are moved past their columns' maximum values. Rows deleted on one
/// side are not deleted on the other.
///
/// # Examples
///
/// ```no_run
/// # use anyhow::Result;
/// # use pg_bisync::{BidirectionalSync, SyncConfig};
/// # use tokio_util::sync::CancellationToken;
/// # async fn example() -> Result<()> {
/// let sync = BidirectionalSync::new(
///     "postgresql://app@localhost/app",
///     "postgresql://app@peer.internal/app",
///     SyncConfig::default(),
/// );
/// let result = sync.run(&CancellationToken::new()).await?;
/// println!("{} rows applied", result.total_applied());
/// # Ok(())
/// # }
/// ```
pub struct BidirectionalSync {
    local_url: String,
    peer_url: String,
    config: SyncConfig,
    dialect: PostgresDialect,
}

impl BidirectionalSync {
    pub fn new(local_url: impl Into<String>, peer_url: impl Into<String>, config: SyncConfig) -> Self {
        Self {
            local_url: local_url.into(),
            peer_url: peer_url.into(),
            config,
            dialect: PostgresDialect::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run one full pass.
    ///
    /// Returns a complete result or an error, never a partial result. Both
    /// connections are closed on every path once they were opened.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<BidirectionalSyncResult> {
        self.config.validate()?;

        let mut result = BidirectionalSyncResult::new(
            mask_connection_string(&self.peer_url),
            self.config.dry_run,
        );

        tracing::info!(
            "Starting bidirectional sync {} <-> {} (schema {}{})",
            mask_connection_string(&self.local_url),
            result.peer,
            self.config.schema,
            if self.config.dry_run { ", dry run" } else { "" }
        );

        let (local, peer) = self.connect_both(cancel).await?;
        let outcome = self
            .run_pass(local.client(), peer.client(), &mut result, cancel)
            .await;
        local.close().await;
        peer.close().await;
        outcome?;

        result.finish();
        tracing::info!(
            "Sync finished: {} tables, {} rows local->peer, {} rows peer->local, {} skipped, {} failed",
            result.totals.tables,
            result.totals.local_to_peer,
            result.totals.peer_to_local,
            result.totals.skipped_tables,
            result.totals.failed_tables
        );

        Ok(result)
    }

    /// Reconcile one table's metadata on both sides without syncing it.
    pub async fn inspect_table(
        &self,
        table: &str,
        cancel: &CancellationToken,
    ) -> Result<InspectReport> {
        self.config.validate()?;

        let (local, peer) = self.connect_both(cancel).await?;
        let outcome = self
            .inspect_with(local.client(), peer.client(), table, cancel)
            .await;
        local.close().await;
        peer.close().await;
        outcome
    }

    async fn inspect_with(
        &self,
        local: &Client,
        peer: &Client,
        table: &str,
        cancel: &CancellationToken,
    ) -> Result<InspectReport> {
        let foreign_keys = self.load_all_foreign_keys(local, peer, cancel).await?;

        let report = match self.plan_table(local, peer, table, &foreign_keys, cancel).await? {
            Ok(plan) => InspectReport {
                table: table.to_string(),
                mode: Some(plan.metadata.mode()),
                metadata: Some(plan.metadata),
                skip_reason: None,
                self_reference: plan.self_reference,
                local_types: plan.local_types,
                peer_types: plan.peer_types,
            },
            Err(reason) => InspectReport {
                table: table.to_string(),
                metadata: None,
                mode: None,
                skip_reason: Some(reason),
                self_reference: None,
                local_types: Vec::new(),
                peer_types: Vec::new(),
            },
        };

        Ok(report)
    }

    fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            statement_timeout: self.config.statement_timeout(),
        }
    }

    async fn connect_both(&self, cancel: &CancellationToken) -> Result<(PgSession, PgSession)> {
        let settings = self.session_settings();
        let retries = self.config.connect_retries;

        let local = cancellable(cancel, async {
            connect_with_retry(&self.local_url, &settings, retries)
                .await
                .context("Failed to connect to local database")
        })
        .await?;

        let peer = cancellable(cancel, async {
            connect_with_retry(&self.peer_url, &settings, retries)
                .await
                .context("Failed to connect to peer database")
        })
        .await;

        match peer {
            Ok(peer) => Ok((local, peer)),
            Err(e) => {
                local.close().await;
                Err(e)
            }
        }
    }

    async fn load_all_foreign_keys(
        &self,
        local: &Client,
        peer: &Client,
        cancel: &CancellationToken,
    ) -> Result<Vec<ForeignKey>> {
        let schema = &self.config.schema;
        let mut foreign_keys = cancellable(cancel, load_foreign_keys(local, schema))
            .await
            .context("Failed to load local foreign keys")?;
        foreign_keys.extend(
            cancellable(cancel, load_foreign_keys(peer, schema))
                .await
                .context("Failed to load peer foreign keys")?,
        );
        Ok(foreign_keys)
    }

    async fn run_pass(
        &self,
        local: &Client,
        peer: &Client,
        result: &mut BidirectionalSyncResult,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let schema = &self.config.schema;

        let local_tables = cancellable(cancel, list_tables(local, schema))
            .await
            .context("Failed to list local tables")?;
        let peer_tables = cancellable(cancel, list_tables(peer, schema))
            .await
            .context("Failed to list peer tables")?;
        let tables = common_tables(&local_tables, &peer_tables, &self.config);

        let foreign_keys = self.load_all_foreign_keys(local, peer, cancel).await?;
        let ordered = order_tables(&tables, &foreign_keys, &self.config.priority_tables);

        tracing::info!("Syncing {} tables in schema {}", ordered.len(), schema);
        tracing::debug!("Table order: {}", ordered.join(", "));

        for table in &ordered {
            if cancel.is_cancelled() {
                bail!("sync run cancelled");
            }

            let plan = match self.plan_table(local, peer, table, &foreign_keys, cancel).await {
                Ok(Ok(plan)) => plan,
                Ok(Err(reason)) => {
                    tracing::warn!("Skipping {}.{}: {}", schema, table, reason);
                    result.record_skip(table, reason);
                    continue;
                }
                Err(e) => {
                    self.handle_table_error(table, e, result, cancel)?;
                    continue;
                }
            };

            match self.sync_table(local, peer, &plan, cancel).await {
                Ok(stats) => result.record_table(stats),
                Err(e) => self.handle_table_error(table, e, result, cancel)?,
            }
        }

        if self.config.dry_run {
            tracing::info!("Dry run: leaving sequences untouched");
        } else {
            result.sequences_reset.local = reset_sequences(local, schema, "local", cancel).await?;
            result.sequences_reset.peer = reset_sequences(peer, schema, "peer", cancel).await?;
        }

        Ok(())
    }

    /// Propagate the error, or record it and keep going in `continue` mode.
    /// Cancellation always propagates.
    fn handle_table_error(
        &self,
        table: &str,
        error: anyhow::Error,
        result: &mut BidirectionalSyncResult,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let error = error.context(format!("Failed to sync table {}.{}", self.config.schema, table));

        if cancel.is_cancelled() || self.config.failure_mode == FailureMode::FailFast {
            return Err(error);
        }

        tracing::error!("{:#}", error);
        result.record_failure(table, format!("{:#}", error));
        Ok(())
    }

    /// Introspect both sides and build a plan, or the reason the table is skipped.
    async fn plan_table(
        &self,
        local: &Client,
        peer: &Client,
        table: &str,
        foreign_keys: &[ForeignKey],
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<TablePlan, SkipReason>> {
        let schema = &self.config.schema;

        let local_shape = cancellable(cancel, introspect_table(local, schema, table))
            .await
            .context("Failed to introspect local table")?;
        let peer_shape = cancellable(cancel, introspect_table(peer, schema, table))
            .await
            .context("Failed to introspect peer table")?;

        let (Some(local_shape), Some(peer_shape)) = (local_shape, peer_shape) else {
            return Ok(Err(SkipReason::MetadataUnavailable));
        };

        let metadata = match reconcile_metadata(table, &local_shape, &peer_shape) {
            Ok(metadata) => metadata,
            Err(reason) => return Ok(Err(reason)),
        };

        let local_types = local_shape.types_for(&metadata.columns)?;
        let peer_types = peer_shape.types_for(&metadata.columns)?;

        let self_reference = self.self_reference_for(&metadata, foreign_keys);

        Ok(Ok(TablePlan {
            metadata,
            local_types,
            peer_types,
            self_reference,
        }))
    }

    /// Configured self-reference first, then a single self FK from the catalog.
    fn self_reference_for(
        &self,
        metadata: &TableMetadata,
        foreign_keys: &[ForeignKey],
    ) -> Option<String> {
        let table = metadata.table_name.as_str();

        if let Some(column) = self.config.self_reference_for(table) {
            if metadata.column_index(column).is_some() {
                return Some(column.to_string());
            }
            tracing::warn!(
                "Configured self-reference {}.{} is not a synced column, ignoring it",
                table,
                column
            );
        }

        discovered_self_reference(foreign_keys, table)
            .filter(|column| metadata.column_index(column).is_some())
            .map(str::to_string)
    }

    async fn sync_table(
        &self,
        local: &Client,
        peer: &Client,
        plan: &TablePlan,
        cancel: &CancellationToken,
    ) -> Result<TableSyncStats> {
        let local_to_peer = self
            .sync_direction(Direction::LocalToPeer, local, peer, &plan.peer_types, plan, cancel)
            .await?;
        let peer_to_local = self
            .sync_direction(Direction::PeerToLocal, peer, local, &plan.local_types, plan, cancel)
            .await?;

        Ok(TableSyncStats {
            table: plan.metadata.table_name.clone(),
            local_to_peer,
            peer_to_local,
        })
    }

    async fn sync_direction(
        &self,
        direction: Direction,
        source: &Client,
        target: &Client,
        target_types: &[String],
        plan: &TablePlan,
        cancel: &CancellationToken,
    ) -> Result<DirectionSyncStats> {
        let schema = &self.config.schema;
        let metadata = &plan.metadata;
        let mode = metadata.mode();

        let index = cancellable(cancel, build_version_index(target, schema, metadata))
            .await
            .with_context(|| format!("{}: failed to index target rows", direction))?;
        let selector = RowSelector::new(metadata, &index);

        let selected = read_selected_rows(source, schema, metadata, &selector, cancel)
            .await
            .with_context(|| format!("{}: failed to read source rows", direction))?;
        let examined = selected.examined;
        let rows = order_rows(selected.rows, plan.self_reference_position());

        let applied = if self.config.dry_run {
            rows.len() as u64
        } else {
            BatchApplier::new(target, &self.dialect, self.config.batch_size)
                .apply(schema, metadata, target_types, mode, &rows, cancel)
                .await
                .with_context(|| format!("{}: failed to apply rows", direction))?
        };

        tracing::info!(
            "{}.{} {} ({}): examined {}, selected {}, applied {}",
            schema,
            metadata.table_name,
            direction,
            mode,
            examined,
            rows.len(),
            applied
        );

        Ok(DirectionSyncStats {
            examined,
            applied,
            mode,
        })
    }
}

/// Tables present on both sides, minus the excluded ones, in local order.
fn common_tables(local: &[String], peer: &[String], config: &SyncConfig) -> Vec<String> {
    let peer: HashSet<&str> = peer.iter().map(String::as_str).collect();

    local
        .iter()
        .filter(|t| peer.contains(t.as_str()))
        .filter(|t| {
            let excluded = config.is_excluded(t);
            if excluded {
                tracing::debug!("Excluding {} from sync", t);
            }
            !excluded
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn metadata(columns: &[&str]) -> TableMetadata {
        TableMetadata {
            table_name: "tours".to_string(),
            columns: names(columns),
            primary_key: names(&["id"]),
            version_column: None,
            column_types: BTreeMap::new(),
            identity_always: Vec::new(),
        }
    }

    fn sync_with(config: SyncConfig) -> BidirectionalSync {
        BidirectionalSync::new("postgresql://a@local/db", "postgresql://b@peer/db", config)
    }

    #[test]
    fn test_common_tables_intersects_and_excludes() {
        let local = names(&["users", "_prisma_migrations", "local_only", "tours"]);
        let peer = names(&["tours", "users", "peer_only", "_prisma_migrations"]);

        let tables = common_tables(&local, &peer, &SyncConfig::default());
        assert_eq!(tables, names(&["users", "tours"]));
    }

    #[test]
    fn test_configured_self_reference_wins() {
        let mut config = SyncConfig::default();
        config.self_references = vec![crate::config::SelfReference {
            table: "tours".to_string(),
            column: "related_tour_id".to_string(),
        }];
        let sync = sync_with(config);
        let fks = vec![ForeignKey {
            table: "tours".to_string(),
            referenced_table: "tours".to_string(),
            columns: names(&["parent_id"]),
        }];

        let meta = metadata(&["id", "parent_id", "related_tour_id"]);
        assert_eq!(
            sync.self_reference_for(&meta, &fks).as_deref(),
            Some("related_tour_id")
        );
    }

    #[test]
    fn test_self_reference_falls_back_to_catalog() {
        let sync = sync_with(SyncConfig::default());
        let fks = vec![ForeignKey {
            table: "tours".to_string(),
            referenced_table: "tours".to_string(),
            columns: names(&["parent_id"]),
        }];

        assert_eq!(
            sync.self_reference_for(&metadata(&["id", "parent_id"]), &fks)
                .as_deref(),
            Some("parent_id")
        );
        // Not a common column: nothing to order by.
        assert_eq!(sync.self_reference_for(&metadata(&["id"]), &fks), None);
    }

    #[test]
    fn test_self_reference_position() {
        let plan = TablePlan {
            metadata: metadata(&["id", "name", "parent_id"]),
            local_types: Vec::new(),
            peer_types: Vec::new(),
            self_reference: Some("parent_id".to_string()),
        };
        assert_eq!(plan.self_reference_position(), Some(2));
    }

    #[test]
    fn test_continue_mode_records_failure() {
        let mut config = SyncConfig::default();
        config.failure_mode = FailureMode::Continue;
        let sync = sync_with(config);
        let mut result = BidirectionalSyncResult::new("peer".to_string(), false);
        let cancel = CancellationToken::new();

        sync.handle_table_error("bookings", anyhow::anyhow!("boom"), &mut result, &cancel)
            .unwrap();

        assert_eq!(result.totals.failed_tables, 1);
        assert_eq!(result.failed_tables[0].table, "bookings");
        assert!(result.failed_tables[0].error.contains("boom"));
        assert!(result.failed_tables[0].error.contains("public.bookings"));
    }

    #[test]
    fn test_fail_fast_and_cancellation_propagate() {
        let sync = sync_with(SyncConfig::default());
        let mut result = BidirectionalSyncResult::new("peer".to_string(), false);
        let cancel = CancellationToken::new();
        assert!(sync
            .handle_table_error("bookings", anyhow::anyhow!("boom"), &mut result, &cancel)
            .is_err());

        let mut config = SyncConfig::default();
        config.failure_mode = FailureMode::Continue;
        let sync = sync_with(config);
        cancel.cancel();
        assert!(sync
            .handle_table_error("bookings", anyhow::anyhow!("boom"), &mut result, &cancel)
            .is_err());
        assert!(result.failed_tables.is_empty());
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_config_before_connecting() {
        let mut config = SyncConfig::default();
        config.batch_size = 0;
        let sync = sync_with(config);

        let err = sync.run(&CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().to_lowercase().contains("batch"));
    }
}
