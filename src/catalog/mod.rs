//! Node and metric directory.
//!
//! Loaded once at startup from the metadata tables an external
//! collaborator maintains. Maps stream addresses to node ids, and
//! vendor metric ids to their series identity, value kind and
//! destination table. The directory is immutable for the life of the
//! process; membership changes take effect on restart.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::decode::KindLookup;
use crate::model::ValueKind;
use crate::store::valid_table_name;

/// Identity and destination of one vendor metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDef {
    pub metric_id: String,
    pub source: String,
    pub fqdd: String,
    pub kind: ValueKind,
    pub table: String,
}

/// Immutable lookup directory for one process lifetime.
#[derive(Debug, Default)]
pub struct Catalog {
    nodes: HashMap<String, i32>,
    metrics: HashMap<String, MetricDef>,
    tables: Vec<String>,
}

impl Catalog {
    /// Builds a catalog from raw entries.
    ///
    /// Fails on an empty node directory, a duplicate metric id, or a
    /// destination that is not a safe SQL identifier.
    pub fn new(nodes: HashMap<String, i32>, metrics: Vec<MetricDef>) -> Result<Self> {
        if nodes.is_empty() {
            bail!("node directory is empty, nothing to listen to");
        }

        let mut by_id: HashMap<String, MetricDef> = HashMap::with_capacity(metrics.len());
        let mut tables: Vec<String> = Vec::new();
        for def in metrics {
            if !valid_table_name(&def.table) {
                bail!(
                    "metric {}: invalid destination table {:?}",
                    def.metric_id,
                    def.table,
                );
            }
            if !tables.contains(&def.table) {
                tables.push(def.table.clone());
            }
            let metric_id = def.metric_id.clone();
            if by_id.insert(metric_id.clone(), def).is_some() {
                bail!("duplicate metric id {metric_id:?}");
            }
        }
        tables.sort();

        Ok(Self {
            nodes,
            metrics: by_id,
            tables,
        })
    }

    /// Loads the directory from the `nodes` and `metric_defs` tables.
    pub async fn load(pool: &PgPool) -> Result<Self> {
        let node_rows = sqlx::query("SELECT node_id, addr FROM nodes WHERE enabled")
            .fetch_all(pool)
            .await
            .context("loading node directory")?;

        let mut nodes = HashMap::with_capacity(node_rows.len());
        for row in &node_rows {
            let addr: String = row.try_get("addr")?;
            let node_id: i32 = row.try_get("node_id")?;
            nodes.insert(addr, node_id);
        }

        let metric_rows = sqlx::query(
            "SELECT metric_id, source, fqdd, value_kind, dest_table FROM metric_defs",
        )
        .fetch_all(pool)
        .await
        .context("loading metric directory")?;

        let mut metrics = Vec::with_capacity(metric_rows.len());
        for row in &metric_rows {
            let metric_id: String = row.try_get("metric_id")?;
            let source: String = row.try_get("source")?;
            let fqdd: String = row.try_get("fqdd")?;
            let kind_name: String = row.try_get("value_kind")?;
            let dest_table: String = row.try_get("dest_table")?;

            let kind = match ValueKind::from_name(&kind_name) {
                Some(kind) => kind,
                None => {
                    tracing::warn!(
                        metric_id = %metric_id,
                        value_kind = %kind_name,
                        "unknown value kind, treating as real",
                    );
                    ValueKind::Real
                }
            };

            metrics.push(MetricDef {
                fqdd: if fqdd.is_empty() {
                    metric_id.clone()
                } else {
                    fqdd
                },
                table: if dest_table.is_empty() {
                    default_table_name(&metric_id)
                } else {
                    dest_table
                },
                metric_id,
                source,
                kind,
            });
        }

        let catalog = Self::new(nodes, metrics)?;
        tracing::info!(
            nodes = catalog.node_count(),
            metrics = catalog.metric_count(),
            tables = catalog.tables.len(),
            "catalog loaded",
        );

        Ok(catalog)
    }

    /// Resolves a stream address to its node id.
    pub fn node_id(&self, addr: &str) -> Option<i32> {
        self.nodes.get(addr).copied()
    }

    /// Resolves a vendor metric id to its definition.
    pub fn metric(&self, metric_id: &str) -> Option<&MetricDef> {
        self.metrics.get(metric_id)
    }

    /// All known (address, node id) pairs.
    pub fn node_addrs(&self) -> impl Iterator<Item = (&str, i32)> {
        self.nodes.iter().map(|(addr, id)| (addr.as_str(), *id))
    }

    /// All destination tables, sorted and deduplicated.
    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn metric_count(&self) -> usize {
        self.metrics.len()
    }
}

impl KindLookup for Catalog {
    fn kind_of(&self, metric_id: &str) -> Option<ValueKind> {
        self.metrics.get(metric_id).map(|def| def.kind)
    }
}

/// Default destination for a metric without a configured table:
/// the lowercased id with anything outside `[a-z0-9]` folded to `_`,
/// prefixed when it would not start like an identifier.
pub fn default_table_name(metric_id: &str) -> String {
    let mut name = String::with_capacity(metric_id.len() + 1);
    for c in metric_id.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            name.push(c);
        } else {
            name.push('_');
        }
    }
    if !name.starts_with(|c: char| c.is_ascii_lowercase() || c == '_') {
        name.insert(0, '_');
    }
    name.truncate(63);
    name
}
