// ABOUTME: Target-side version index and last-write-wins row selection
// ABOUTME: Decides which source rows are missing or newer on the target

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;
use std::collections::HashMap;
use tokio_postgres::Client;

use super::schema::TableMetadata;
use crate::utils::quote_ident;

/// What the target holds for one primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexedVersion {
    /// Row exists; the table has no version column.
    Present,
    /// Row exists with this version value (text form, may be NULL).
    Version(Option<String>),
}

/// Primary-key tuple to version, for every row on the target side.
#[derive(Debug, Clone, Default)]
pub struct VersionIndex {
    entries: HashMap<String, IndexedVersion>,
}

impl VersionIndex {
    pub fn insert(&mut self, key: String, version: IndexedVersion) {
        self.entries.insert(key, version);
    }

    pub fn get(&self, key: &str) -> Option<&IndexedVersion> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Stable key for a primary-key tuple: a JSON array of the text values.
pub fn encode_key<'a>(values: impl IntoIterator<Item = &'a Option<String>>) -> String {
    Value::Array(
        values
            .into_iter()
            .map(|v| match v {
                Some(s) => Value::String(s.clone()),
                None => Value::Null,
            })
            .collect(),
    )
    .to_string()
}

/// Load the target's version index.
///
/// Only the primary-key columns and the version column are read, never whole
/// rows.
pub async fn build_version_index(
    client: &Client,
    schema: &str,
    table: &TableMetadata,
) -> Result<VersionIndex> {
    let mut select_list: Vec<String> = table
        .primary_key
        .iter()
        .map(|c| format!("{}::text", quote_ident(c)))
        .collect();
    if let Some(version) = &table.version_column {
        select_list.push(format!("{}::text", quote_ident(version)));
    }

    let query = format!(
        "SELECT {} FROM {}.{}",
        select_list.join(", "),
        quote_ident(schema),
        quote_ident(&table.table_name)
    );

    let rows = client
        .query(&query, &[])
        .await
        .with_context(|| {
            format!(
                "Failed to read version index from {}.{}",
                schema, table.table_name
            )
        })?;

    let pk_len = table.primary_key.len();
    let mut index = VersionIndex::default();
    for row in &rows {
        let key_values: Vec<Option<String>> = (0..pk_len).map(|i| row.get(i)).collect();
        let version = if table.version_column.is_some() {
            IndexedVersion::Version(row.get(pk_len))
        } else {
            IndexedVersion::Present
        };
        index.insert(encode_key(&key_values), version);
    }

    tracing::debug!(
        "Version index for {}.{}: {} keys",
        schema,
        table.table_name,
        index.len()
    );

    Ok(index)
}

/// Decode a version value to epoch milliseconds.
///
/// Accepts the ISO renderings PostgreSQL produces for `timestamp`,
/// `timestamptz` and `date`, plus RFC 3339. Anything else is unknown.
pub fn decode_version_millis(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.timestamp_millis());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
}

/// Applies the per-row decision rule against a target's version index.
pub struct RowSelector<'a> {
    index: &'a VersionIndex,
    pk_positions: Vec<usize>,
    version_position: Option<usize>,
}

impl<'a> RowSelector<'a> {
    /// `table.columns` gives the layout of the rows passed to `should_apply`.
    pub fn new(table: &TableMetadata, index: &'a VersionIndex) -> Self {
        Self {
            index,
            pk_positions: table
                .primary_key
                .iter()
                .filter_map(|pk| table.column_index(pk))
                .collect(),
            version_position: table
                .version_column
                .as_deref()
                .and_then(|v| table.column_index(v)),
        }
    }

    pub fn row_key(&self, row: &[Option<String>]) -> String {
        encode_key(self.pk_positions.iter().map(|&i| &row[i]))
    }

    /// Missing on the target: apply. Present without a version column: leave
    /// it. Otherwise apply only when the source version is strictly newer.
    pub fn should_apply(&self, row: &[Option<String>]) -> bool {
        let target = match self.index.get(&self.row_key(row)) {
            None => return true,
            Some(IndexedVersion::Present) => return false,
            Some(IndexedVersion::Version(v)) => v,
        };

        let Some(position) = self.version_position else {
            return false;
        };

        let source_millis = row[position].as_deref().and_then(decode_version_millis);
        let target_millis = target.as_deref().and_then(decode_version_millis);

        match (source_millis, target_millis) {
            (Some(source), Some(target)) => source > target,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}
