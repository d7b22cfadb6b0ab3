// ABOUTME: Configuration for a bidirectional sync run
// ABOUTME: Loads bisync.toml files and validates settings before connecting

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::utils::validate_postgres_identifier;

/// What happens when a table fails with a database error mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureMode {
    /// Abort the whole run on the first failing table.
    #[default]
    FailFast,
    /// Record the failure in the result and move on to the next table.
    Continue,
}

/// A column that points at another row of the same table.
///
/// Rows where `column` is NULL are applied before rows where it is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfReference {
    pub table: String,
    pub column: String,
}

/// Settings for one sync run.
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// schema = "public"
/// batch_size = 200
/// failure_mode = "continue"
/// excluded_tables = ["_prisma_migrations", "audit_log"]
///
/// [[self_references]]
/// table = "tours"
/// column = "related_tour_id"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Schema whose tables are synchronized on both sides
    pub schema: String,
    /// Rows per INSERT statement
    pub batch_size: usize,
    /// Tables never synchronized, such as migration bookkeeping
    pub excluded_tables: Vec<String>,
    /// Parent tables first; breaks ties in the foreign-key order
    pub priority_tables: Vec<String>,
    /// Explicit self-reference columns for row ordering
    pub self_references: Vec<SelfReference>,
    pub failure_mode: FailureMode,
    /// Per-statement timeout in seconds, applied to both sessions
    pub statement_timeout_secs: Option<u64>,
    /// Connection attempts after the first one fails
    pub connect_retries: u32,
    /// Select rows but write nothing and leave sequences alone
    pub dry_run: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            batch_size: 100,
            excluded_tables: vec![
                "_prisma_migrations".to_string(),
                "schema_migrations".to_string(),
                "__diesel_schema_migrations".to_string(),
                "_sqlx_migrations".to_string(),
            ],
            priority_tables: [
                "users",
                "tours",
                "drivers",
                "vehicles",
                "customers",
                "bookings",
                "booking_items",
                "finance_items",
            ]
            .iter()
            .map(|t| t.to_string())
            .collect(),
            self_references: Vec::new(),
            failure_mode: FailureMode::FailFast,
            statement_timeout_secs: None,
            connect_retries: 3,
            dry_run: false,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file {:?}", path))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Reject settings that would produce invalid SQL or a no-op run.
    pub fn validate(&self) -> Result<()> {
        validate_postgres_identifier(&self.schema).context("Invalid schema name")?;

        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }

        for rule in &self.self_references {
            if rule.table.trim().is_empty() || rule.column.trim().is_empty() {
                bail!("self_references entries need both a table and a column");
            }
        }

        Ok(())
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_secs.map(Duration::from_secs)
    }

    pub fn is_excluded(&self, table: &str) -> bool {
        self.excluded_tables.iter().any(|t| t == table)
    }

    /// Configured self-reference column for a table, if any.
    pub fn self_reference_for(&self, table: &str) -> Option<&str> {
        self.self_references
            .iter()
            .find(|r| r.table == table)
            .map(|r| r.column.as_str())
    }
}
