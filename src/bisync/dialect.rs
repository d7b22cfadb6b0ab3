// ABOUTME: SQL dialect for generated sync statements
// ABOUTME: Owns identifier quoting, typed placeholders and upsert construction

use crate::bisync::{SyncMode, TableMetadata};

/// SQL syntax used by the batch applier.
///
/// All dynamic SQL in a sync run goes through this trait, so the cast syntax
/// for runtime-discovered column types lives in exactly one place.
pub trait Dialect: Send + Sync {
    fn name(&self) -> &str;

    fn quote_ident(&self, name: &str) -> String;

    /// Placeholder for the 1-based parameter `index`, cast to `sql_type`.
    ///
    /// Values are always bound as text; the placeholder converts them to the
    /// target column's own type.
    fn typed_placeholder(&self, index: usize, sql_type: &str) -> String;

    /// Build a multi-row upsert for `num_rows` rows of `table.columns`.
    ///
    /// `target_types` is parallel to `table.columns` and holds the SQL types
    /// of the side being written.
    fn build_upsert(
        &self,
        schema: &str,
        table: &TableMetadata,
        target_types: &[String],
        mode: SyncMode,
        num_rows: usize,
    ) -> String;
}

/// PostgreSQL dialect: `"ident"`, `$n::text::type`, `INSERT ... ON CONFLICT`.
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for PostgresDialect {
    fn name(&self) -> &str {
        "postgres"
    }

    fn quote_ident(&self, name: &str) -> String {
        crate::utils::quote_ident(name)
    }

    fn typed_placeholder(&self, index: usize, sql_type: &str) -> String {
        format!("${}::text::{}", index, sql_type)
    }

    /// Generates:
    /// ```sql
    /// INSERT INTO "schema"."table" ("id", "name", "updated_at") OVERRIDING SYSTEM VALUE
    /// VALUES ($1::text::integer, $2::text::text, $3::text::timestamp(3) without time zone), (...)
    /// ON CONFLICT ("id") DO UPDATE SET "name" = EXCLUDED."name", "updated_at" = EXCLUDED."updated_at"
    /// ```
    fn build_upsert(
        &self,
        schema: &str,
        table: &TableMetadata,
        target_types: &[String],
        mode: SyncMode,
        num_rows: usize,
    ) -> String {
        let columns = &table.columns;
        let primary_key = &table.primary_key;
        let quoted_columns: Vec<String> = columns.iter().map(|c| self.quote_ident(c)).collect();
        let quoted_pk: Vec<String> = primary_key.iter().map(|c| self.quote_ident(c)).collect();

        let num_cols = columns.len();
        let value_rows: Vec<String> = (0..num_rows)
            .map(|row_idx| {
                let placeholders: Vec<String> = target_types
                    .iter()
                    .enumerate()
                    .map(|(col_idx, sql_type)| {
                        self.typed_placeholder(row_idx * num_cols + col_idx + 1, sql_type)
                    })
                    .collect();
                format!("({})", placeholders.join(", "))
            })
            .collect();

        let update_columns: Vec<String> = match mode {
            SyncMode::InsertMissing => Vec::new(),
            SyncMode::LastWriteWins => columns
                .iter()
                .filter(|c| !primary_key.contains(c) && !table.identity_always.contains(c))
                .map(|c| {
                    let quoted = self.quote_ident(c);
                    format!("{} = EXCLUDED.{}", quoted, quoted)
                })
                .collect(),
        };

        let conflict_action = if update_columns.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", update_columns.join(", "))
        };

        format!(
            "INSERT INTO {}.{} ({}) OVERRIDING SYSTEM VALUE VALUES {} ON CONFLICT ({}) {}",
            self.quote_ident(schema),
            self.quote_ident(&table.table_name),
            quoted_columns.join(", "),
            value_rows.join(", "),
            quoted_pk.join(", "),
            conflict_action
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn table(name: &str, columns: &[&str], types: &[&str], pk: &[&str]) -> TableMetadata {
        TableMetadata {
            table_name: name.to_string(),
            columns: strings(columns),
            primary_key: strings(pk),
            version_column: None,
            column_types: columns
                .iter()
                .zip(types)
                .map(|(c, t)| (c.to_string(), t.to_string()))
                .collect(),
            identity_always: Vec::new(),
        }
    }

    #[test]
    fn test_typed_placeholder() {
        let dialect = PostgresDialect::new();
        assert_eq!(
            dialect.typed_placeholder(7, "timestamp(3) without time zone"),
            "$7::text::timestamp(3) without time zone"
        );
        assert_eq!(dialect.typed_placeholder(1, "numeric(10,2)"), "$1::text::numeric(10,2)");
    }

    #[test]
    fn test_upsert_last_write_wins() {
        let query = PostgresDialect::new().build_upsert(
            "public",
            &table(
                "users",
                &["id", "name", "updated_at"],
                &["integer", "text", "timestamp(3) without time zone"],
                &["id"],
            ),
            &strings(&["integer", "text", "timestamp(3) without time zone"]),
            SyncMode::LastWriteWins,
            1,
        );

        assert!(query.starts_with(
            "INSERT INTO \"public\".\"users\" (\"id\", \"name\", \"updated_at\") OVERRIDING SYSTEM VALUE VALUES"
        ));
        assert!(query.contains(
            "VALUES ($1::text::integer, $2::text::text, $3::text::timestamp(3) without time zone)"
        ));
        assert!(query.contains("ON CONFLICT (\"id\") DO UPDATE SET"));
        assert!(query.contains("\"name\" = EXCLUDED.\"name\""));
        assert!(query.contains("\"updated_at\" = EXCLUDED.\"updated_at\""));
        assert!(!query.contains("\"id\" = EXCLUDED"));
    }

    #[test]
    fn test_upsert_insert_missing_does_nothing() {
        let query = PostgresDialect::new().build_upsert(
            "public",
            &table("settings", &["key", "value"], &["text", "jsonb"], &["key"]),
            &strings(&["text", "jsonb"]),
            SyncMode::InsertMissing,
            2,
        );

        assert!(query.contains("($1::text::text, $2::text::jsonb), ($3::text::text, $4::text::jsonb)"));
        assert!(query.ends_with("ON CONFLICT (\"key\") DO NOTHING"));
    }

    #[test]
    fn test_upsert_only_pk_columns_falls_back_to_nothing() {
        let query = PostgresDialect::new().build_upsert(
            "public",
            &table(
                "tour_tags",
                &["tour_id", "tag_id"],
                &["integer", "integer"],
                &["tour_id", "tag_id"],
            ),
            &strings(&["integer", "integer"]),
            SyncMode::LastWriteWins,
            1,
        );

        assert!(query.contains("ON CONFLICT (\"tour_id\", \"tag_id\") DO NOTHING"));
        assert!(!query.contains("DO UPDATE"));
    }

    #[test]
    fn test_upsert_quotes_reserved_and_mixed_case() {
        let query = PostgresDialect::new().build_upsert(
            "public",
            &table(
                "Order",
                &["id", "user", "createdAt"],
                &["bigint", "text", "timestamp with time zone"],
                &["id"],
            ),
            &strings(&["bigint", "text", "timestamp with time zone"]),
            SyncMode::LastWriteWins,
            1,
        );

        assert!(query.contains("\"public\".\"Order\""));
        assert!(query.contains("\"user\" = EXCLUDED.\"user\""));
        assert!(query.contains("\"createdAt\" = EXCLUDED.\"createdAt\""));
    }

    #[test]
    fn test_upsert_writes_identity_keys_and_skips_identity_updates() {
        let mut meta = table(
            "drivers",
            &["id", "badge_no", "name", "updated_at"],
            &["bigint", "integer", "text", "timestamp with time zone"],
            &["id"],
        );
        meta.identity_always = strings(&["id", "badge_no"]);

        let query = PostgresDialect::new().build_upsert(
            "public",
            &meta,
            &strings(&["bigint", "integer", "text", "timestamp with time zone"]),
            SyncMode::LastWriteWins,
            1,
        );

        assert!(query.contains("(\"id\", \"badge_no\", \"name\", \"updated_at\") OVERRIDING SYSTEM VALUE VALUES"));
        assert!(query.contains("$1::text::bigint, $2::text::integer"));
        assert!(query.contains(
            "DO UPDATE SET \"name\" = EXCLUDED.\"name\", \"updated_at\" = EXCLUDED.\"updated_at\""
        ));
        assert!(!query.contains("\"badge_no\" = EXCLUDED"));
    }
}
