// ABOUTME: Streams source rows and keeps only those the target needs
// ABOUTME: Values travel as text so any column type round-trips through casts

use anyhow::{Context, Result};
use futures::{pin_mut, TryStreamExt};
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;

use super::schema::TableMetadata;
use super::version::RowSelector;
use super::{cancellable, RowValues};
use crate::utils::quote_ident;

/// Rows chosen from one source table.
#[derive(Debug, Default)]
pub struct SelectedRows {
    /// Every row read from the source
    pub examined: u64,
    /// Rows missing or older on the target, in read order
    pub rows: Vec<RowValues>,
}

/// `SELECT "a"::text, "b"::text ... FROM "schema"."table"` over the common columns.
pub fn build_select_query(schema: &str, table: &TableMetadata) -> String {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|c| format!("{}::text", quote_ident(c)))
        .collect();

    format!(
        "SELECT {} FROM {}.{}",
        columns.join(", "),
        quote_ident(schema),
        quote_ident(&table.table_name)
    )
}

/// Stream every source row through `selector`.
///
/// Rows are consumed one at a time; only the selected ones are buffered.
pub async fn read_selected_rows(
    client: &Client,
    schema: &str,
    table: &TableMetadata,
    selector: &RowSelector<'_>,
    cancel: &CancellationToken,
) -> Result<SelectedRows> {
    let query = build_select_query(schema, table);
    let no_params: Vec<String> = Vec::new();

    let stream = cancellable(cancel, async {
        client
            .query_raw(query.as_str(), no_params)
            .await
            .with_context(|| format!("Failed to read rows from {}.{}", schema, table.table_name))
    })
    .await?;
    pin_mut!(stream);

    let width = table.columns.len();
    let mut selected = SelectedRows::default();

    loop {
        let next = cancellable(cancel, async {
            stream.try_next().await.with_context(|| {
                format!("Failed to read rows from {}.{}", schema, table.table_name)
            })
        })
        .await?;

        let Some(row) = next else {
            break;
        };

        let values: RowValues = (0..width).map(|i| row.get(i)).collect();
        selected.examined += 1;
        if selector.should_apply(&values) {
            selected.rows.push(values);
        }
    }

    Ok(selected)
}
