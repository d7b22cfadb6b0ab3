// ABOUTME: Catalog introspection and metadata reconciliation for synced tables
// ABOUTME: Finds the common columns and primary key two databases agree on

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio_postgres::Client;

use super::stats::{SkipReason, SyncMode};

/// Version columns in order of preference.
const VERSION_CANDIDATES: [&str; 2] = ["updated_at", "created_at"];

/// Shape of one table on one side, as read from the catalogs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableShape {
    /// Non-generated columns in ordinal order
    pub columns: Vec<String>,
    /// Column name to full SQL type, e.g. `numeric(10,2)`
    pub column_types: BTreeMap<String, String>,
    /// Primary-key columns in constraint order
    pub primary_key: Vec<String>,
    /// `GENERATED ALWAYS AS IDENTITY` columns
    #[serde(default)]
    pub identity_always: BTreeSet<String>,
}

impl TableShape {
    /// SQL types for `columns`, in the same order.
    pub fn types_for(&self, columns: &[String]) -> Result<Vec<String>> {
        columns
            .iter()
            .map(|c| {
                self.column_types
                    .get(c)
                    .cloned()
                    .with_context(|| format!("No SQL type known for column \"{}\"", c))
            })
            .collect()
    }

    fn version_candidate(&self) -> Option<&'static str> {
        VERSION_CANDIDATES
            .into_iter()
            .find(|candidate| self.columns.iter().any(|c| c == candidate))
    }
}

/// The syncable contract both sides share for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub table_name: String,
    /// Common columns, in the local side's order
    pub columns: Vec<String>,
    /// Non-empty and identically ordered on both sides
    pub primary_key: Vec<String>,
    pub version_column: Option<String>,
    /// Local side's SQL types for `columns`
    pub column_types: BTreeMap<String, String>,
    /// Common columns that are `GENERATED ALWAYS AS IDENTITY` on either side
    #[serde(default)]
    pub identity_always: Vec<String>,
}

impl TableMetadata {
    pub fn mode(&self) -> SyncMode {
        if self.version_column.is_some() {
            SyncMode::LastWriteWins
        } else {
            SyncMode::InsertMissing
        }
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

/// Read a table's columns, SQL types and primary key from the catalogs.
///
/// Returns `Ok(None)` when the table does not exist or has no usable
/// columns. Generated columns are left out since they cannot be written.
pub async fn introspect_table(
    client: &Client,
    schema: &str,
    table: &str,
) -> Result<Option<TableShape>> {
    let column_rows = client
        .query(
            "SELECT a.attname, format_type(a.atttypid, a.atttypmod), a.attidentity = 'a'
             FROM pg_attribute a
             JOIN pg_class c ON c.oid = a.attrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1
               AND c.relname = $2
               AND a.attnum > 0
               AND NOT a.attisdropped
               AND a.attgenerated = ''
             ORDER BY a.attnum",
            &[&schema, &table],
        )
        .await
        .with_context(|| format!("Failed to get columns for {}.{}", schema, table))?;

    if column_rows.is_empty() {
        return Ok(None);
    }

    let mut columns = Vec::with_capacity(column_rows.len());
    let mut column_types = BTreeMap::new();
    let mut identity_always = BTreeSet::new();
    for row in &column_rows {
        let name: String = row.get(0);
        let sql_type: String = row.get(1);
        if row.get::<_, bool>(2) {
            identity_always.insert(name.clone());
        }
        columns.push(name.clone());
        column_types.insert(name, sql_type);
    }

    // Constraint order, not table order: it drives ON CONFLICT and key encoding.
    let pk_rows = client
        .query(
            "SELECT a.attname
             FROM pg_constraint con
             JOIN pg_class c ON c.oid = con.conrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             CROSS JOIN LATERAL unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
             JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = k.attnum
             WHERE con.contype = 'p'
               AND n.nspname = $1
               AND c.relname = $2
             ORDER BY k.ord",
            &[&schema, &table],
        )
        .await
        .with_context(|| format!("Failed to get primary key for {}.{}", schema, table))?;

    let primary_key = pk_rows.iter().map(|row| row.get(0)).collect();

    Ok(Some(TableShape {
        columns,
        column_types,
        primary_key,
        identity_always,
    }))
}

/// Intersect two sides' shapes into one syncable contract.
///
/// Mismatched primary keys are never guessed at: a different column set or a
/// different order means the table is skipped.
pub fn reconcile_metadata(
    table_name: &str,
    local: &TableShape,
    peer: &TableShape,
) -> std::result::Result<TableMetadata, SkipReason> {
    if local.primary_key.is_empty() || peer.primary_key.is_empty() {
        return Err(SkipReason::MissingPrimaryKey);
    }

    let columns: Vec<String> = local
        .columns
        .iter()
        .filter(|c| peer.columns.contains(c))
        .cloned()
        .collect();

    if columns.is_empty() || local.primary_key != peer.primary_key {
        return Err(SkipReason::IncompatiblePrimaryKeyOrColumns);
    }

    if !local.primary_key.iter().all(|pk| columns.contains(pk)) {
        return Err(SkipReason::IncompatiblePrimaryKeyOrColumns);
    }

    let version_column = [local.version_candidate(), peer.version_candidate()]
        .into_iter()
        .flatten()
        .find(|candidate| columns.iter().any(|c| c == candidate))
        .map(str::to_string);

    let column_types = columns
        .iter()
        .filter_map(|c| local.column_types.get(c).map(|t| (c.clone(), t.clone())))
        .collect();

    let identity_always = columns
        .iter()
        .filter(|c| local.identity_always.contains(*c) || peer.identity_always.contains(*c))
        .cloned()
        .collect();

    Ok(TableMetadata {
        table_name: table_name.to_string(),
        columns,
        primary_key: local.primary_key.clone(),
        version_column,
        column_types,
        identity_always,
    })
}

/// Base tables of `schema`, partitions excluded.
pub async fn list_tables(client: &Client, schema: &str) -> Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT c.relname
             FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1
               AND c.relkind IN ('r', 'p')
               AND NOT c.relispartition
             ORDER BY c.relname",
            &[&schema],
        )
        .await
        .with_context(|| format!("Failed to list tables in schema {}", schema))?;

    Ok(rows.iter().map(|row| row.get(0)).collect())
}
