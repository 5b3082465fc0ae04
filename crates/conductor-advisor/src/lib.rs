//! conductor-advisor
//!
//! Sizes a query's memory footprint from an EXPLAIN plan and picks the
//! smallest pool whose per-node memory comfortably fits it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// `(schema, table, column) -> byte size`, as reported by the database's
/// storage catalog. Populated once per process by whoever owns the
/// database connection (`conductor-backend`), then handed to `Advisor`.
#[derive(Default, Debug, Clone)]
pub struct Storage {
    colsizes: HashMap<(String, String, String), u64>,
}

#[derive(Debug)]
pub struct UnknownColumn(pub String);

impl fmt::Display for UnknownColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no storage entry for column {}", self.0)
    }
}

impl std::error::Error for UnknownColumn {}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_colsize(&mut self, schema: &str, table: &str, column: &str, size: u64) {
        self.colsizes
            .insert((schema.to_string(), table.to_string(), column.to_string()), size);
    }

    pub fn get_colsize(&self, schema: &str, table: &str, column: &str) -> Result<u64, UnknownColumn> {
        self.colsizes
            .get(&(schema.to_string(), table.to_string(), column.to_string()))
            .copied()
            .ok_or_else(|| UnknownColumn(format!("{schema}.{table}.{column}")))
    }

    pub fn count(&self) -> usize {
        self.colsizes.len()
    }
}

/// A `(schema, table, column)` reference pulled out of one EXPLAIN line.
pub type ColumnRef = (String, String, String);

/// Pull every `sql.bind(schema, table, column, ...)` reference out of a raw
/// EXPLAIN plan's text. Isolated behind this one function because it is the
/// part of this crate most tightly coupled to the database engine's EXPLAIN
/// output format and the most likely to need replacing.
pub fn parse_bind_references(explain_output: &str) -> Vec<ColumnRef> {
    let mut seen = Vec::new();
    for line in explain_output.lines() {
        if !line.contains("sql.bind(") {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 7 {
            continue;
        }
        let schema = clean_name(fields[4]);
        let table = clean_name(fields[5]);
        let column = clean_name(fields[6]);
        if schema.is_empty() || table.is_empty() || column.is_empty() {
            continue;
        }
        let key = (schema, table, column);
        if !seen.contains(&key) {
            seen.push(key);
        }
    }
    seen
}

fn clean_name(token: &str) -> String {
    token
        .split(':')
        .next()
        .unwrap_or("")
        .trim_matches(|c: char| !c.is_alphanumeric() && c != '_')
        .to_string()
}

/// Estimate a query's column footprint from an already-fetched EXPLAIN plan.
pub fn estimate(explain_output: &str, storage: &Storage) -> Result<u64, UnknownColumn> {
    let mut total = 0u64;
    for (schema, table, column) in parse_bind_references(explain_output) {
        total += storage.get_colsize(&schema, &table, &column)?;
    }
    Ok(total)
}

/// Pick the smallest pool (by per-node memory) whose capacity exceeds twice
/// the estimated footprint, leaving headroom for intermediates. Falls back
/// explicitly to the largest pool if none fits, breaking ties
/// alphabetically by pool name.
pub fn advise(
    explain_output: &str,
    storage: &Storage,
    pool_specs: &BTreeMap<String, u64>,
) -> Result<String, UnknownColumn> {
    let footprint = estimate(explain_output, storage)?;

    let mut sorted: Vec<(&String, &u64)> = pool_specs.iter().collect();
    sorted.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));

    for (name, mem) in &sorted {
        if footprint.saturating_mul(2) < **mem {
            return Ok((*name).clone());
        }
    }

    sorted
        .last()
        .map(|(name, _)| (*name).clone())
        .ok_or_else(|| UnknownColumn("no pools configured".to_string()))
}
