// ABOUTME: Foreign-key discovery and dependency-aware table ordering
// ABOUTME: Parents sync before children; a priority list breaks ties

use anyhow::{Context, Result};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use tokio_postgres::Client;

/// A foreign key between two tables of the synced schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub table: String,
    pub referenced_table: String,
    /// Referencing columns in constraint order
    pub columns: Vec<String>,
}

impl ForeignKey {
    pub fn is_self_reference(&self) -> bool {
        self.table == self.referenced_table
    }
}

/// Foreign keys whose both ends live in `schema`.
pub async fn load_foreign_keys(client: &Client, schema: &str) -> Result<Vec<ForeignKey>> {
    let rows = client
        .query(
            "SELECT c.relname, rc.relname, array_agg(a.attname::text ORDER BY k.ord)
             FROM pg_constraint con
             JOIN pg_class c ON c.oid = con.conrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             JOIN pg_class rc ON rc.oid = con.confrelid
             CROSS JOIN LATERAL unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
             JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = k.attnum
             WHERE con.contype = 'f'
               AND n.nspname = $1
               AND rc.relnamespace = n.oid
             GROUP BY con.oid, c.relname, rc.relname
             ORDER BY c.relname, rc.relname",
            &[&schema],
        )
        .await
        .with_context(|| format!("Failed to load foreign keys for schema {}", schema))?;

    Ok(rows
        .iter()
        .map(|row| ForeignKey {
            table: row.get(0),
            referenced_table: row.get(1),
            columns: row.get(2),
        })
        .collect())
}

/// The single-column self-reference of `table`, if it has exactly one.
pub fn discovered_self_reference<'a>(foreign_keys: &'a [ForeignKey], table: &str) -> Option<&'a str> {
    let mut candidates = foreign_keys
        .iter()
        .filter(|fk| fk.table == table && fk.is_self_reference() && fk.columns.len() == 1)
        .map(|fk| fk.columns[0].as_str())
        .collect::<BTreeSet<_>>()
        .into_iter();

    match (candidates.next(), candidates.next()) {
        (Some(column), None) => Some(column),
        _ => None,
    }
}

/// Order tables so referenced tables come before the tables referencing them.
///
/// Among tables that are ready at the same time, those in `priority` come
/// first in list order, then the rest alphabetically. Tables caught in a
/// cycle are appended in that same tie-break order.
pub fn order_tables(
    tables: &[String],
    foreign_keys: &[ForeignKey],
    priority: &[String],
) -> Vec<String> {
    let rank = |table: &str| -> (usize, String) {
        let position = priority
            .iter()
            .position(|p| p == table)
            .unwrap_or(usize::MAX);
        (position, table.to_string())
    };

    let known: HashSet<&str> = tables.iter().map(String::as_str).collect();
    let mut pending: HashMap<&str, HashSet<&str>> =
        tables.iter().map(|t| (t.as_str(), HashSet::new())).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for fk in foreign_keys {
        let (child, parent) = (fk.table.as_str(), fk.referenced_table.as_str());
        if fk.is_self_reference() || !known.contains(child) || !known.contains(parent) {
            continue;
        }
        if let Some(parents) = pending.get_mut(child) {
            if parents.insert(parent) {
                dependents.entry(parent).or_default().push(child);
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<(usize, String)>> = pending
        .iter()
        .filter(|(_, parents)| parents.is_empty())
        .map(|(table, _)| Reverse(rank(*table)))
        .collect();

    let mut ordered = Vec::with_capacity(tables.len());
    let mut placed: HashSet<String> = HashSet::new();

    while let Some(Reverse((_, table))) = ready.pop() {
        if let Some(children) = dependents.get(table.as_str()) {
            for child in children {
                if let Some(parents) = pending.get_mut(child) {
                    parents.remove(table.as_str());
                    if parents.is_empty() && !placed.contains(*child) {
                        ready.push(Reverse(rank(*child)));
                    }
                }
            }
        }
        placed.insert(table.clone());
        ordered.push(table);
    }

    if ordered.len() < tables.len() {
        let mut cyclic: Vec<(usize, String)> = tables
            .iter()
            .filter(|t| !placed.contains(t.as_str()))
            .map(|t| rank(t.as_str()))
            .collect();
        cyclic.sort();
        tracing::warn!(
            "Foreign-key cycle among {} tables; falling back to priority order for them",
            cyclic.len()
        );
        ordered.extend(cyclic.into_iter().map(|(_, t)| t));
    }

    ordered
}
