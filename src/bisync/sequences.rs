// ABOUTME: Sequence reconciliation after rows arrive with explicit keys
// ABOUTME: Moves every owned integer sequence past the column's current max

use anyhow::{Context, Result};
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;

use super::cancellable;
use crate::utils::quote_ident;

/// An integer column fed by a sequence (serial or identity).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedSequence {
    /// Already quoted, schema-qualified sequence name
    pub sequence: String,
    pub table: String,
    pub column: String,
}

/// Find sequences owned by `smallint`/`integer`/`bigint` columns in `schema`.
pub async fn discover_sequences(client: &Client, schema: &str) -> Result<Vec<OwnedSequence>> {
    let rows = client
        .query(
            "SELECT format('%I.%I', sn.nspname, s.relname), c.relname, a.attname
             FROM pg_class s
             JOIN pg_namespace sn ON sn.oid = s.relnamespace
             JOIN pg_depend d ON d.objid = s.oid
              AND d.classid = 'pg_class'::regclass
              AND d.refclassid = 'pg_class'::regclass
              AND d.deptype IN ('a', 'i')
             JOIN pg_class c ON c.oid = d.refobjid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = d.refobjsubid
             WHERE s.relkind = 'S'
               AND n.nspname = $1
               AND a.atttypid IN ('int2'::regtype::oid, 'int4'::regtype::oid, 'int8'::regtype::oid)
             ORDER BY c.relname, a.attname",
            &[&schema],
        )
        .await
        .with_context(|| format!("Failed to discover sequences in schema {}", schema))?;

    Ok(rows
        .iter()
        .map(|row| OwnedSequence {
            sequence: row.get(0),
            table: row.get(1),
            column: row.get(2),
        })
        .collect())
}

/// `setval` so the next `nextval()` returns max(column) + 1, or 1 on an empty table.
pub fn build_setval_query(schema: &str, sequence: &OwnedSequence) -> String {
    format!(
        "SELECT setval($1::text::regclass, GREATEST(COALESCE((SELECT MAX({}) FROM {}.{}), 0) + 1, 1), false)",
        quote_ident(&sequence.column),
        quote_ident(schema),
        quote_ident(&sequence.table)
    )
}

/// Reset every owned integer sequence in `schema`. Returns how many were reset.
pub async fn reset_sequences(
    client: &Client,
    schema: &str,
    side: &str,
    cancel: &CancellationToken,
) -> Result<usize> {
    let sequences = cancellable(cancel, discover_sequences(client, schema)).await?;

    for sequence in &sequences {
        let query = build_setval_query(schema, sequence);
        cancellable(cancel, async {
            client
                .execute(query.as_str(), &[&sequence.sequence])
                .await
                .with_context(|| {
                    format!(
                        "Failed to reset sequence {} for {}.{} on {}",
                        sequence.sequence, sequence.table, sequence.column, side
                    )
                })
        })
        .await?;

        tracing::debug!(
            "Reset {} on {} for {}.{}",
            sequence.sequence,
            side,
            sequence.table,
            sequence.column
        );
    }

    tracing::info!("Reset {} sequences on {}", sequences.len(), side);
    Ok(sequences.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_setval_query() {
        let sequence = OwnedSequence {
            sequence: "public.users_id_seq".to_string(),
            table: "users".to_string(),
            column: "id".to_string(),
        };

        let query = build_setval_query("public", &sequence);
        assert_eq!(
            query,
            "SELECT setval($1::text::regclass, GREATEST(COALESCE((SELECT MAX(\"id\") FROM \"public\".\"users\"), 0) + 1, 1), false)"
        );
    }

    #[test]
    fn test_build_setval_query_quotes_mixed_case() {
        let sequence = OwnedSequence {
            sequence: "public.\"Order_Id_seq\"".to_string(),
            table: "Order".to_string(),
            column: "Id".to_string(),
        };

        let query = build_setval_query("public", &sequence);
        assert!(query.contains("MAX(\"Id\") FROM \"public\".\"Order\""));
    }
}
