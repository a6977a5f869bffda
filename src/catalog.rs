//! Generated-column cache
//!
//! Generated columns cannot be assigned in DML on the target, so the
//! transformer must know which columns to omit (INSERT) or rewrite to
//! DEFAULT (UPDATE). The cache is populated once from the target catalog —
//! the target schema can differ from the source, and it is the target that
//! rejects writes to generated columns — and consulted during transaction
//! finalization.

use crate::errors::CdcResult;
use crate::types::{LogicalMessageRelation, LogicalMessageTuple, normalize_identifier};
use crate::utils::PgConnection;
use std::collections::{HashMap, HashSet};
use tracing::info;

const GENERATED_COLUMNS_SQL: &str = "\
SELECT n.nspname, c.relname, a.attname \
  FROM pg_catalog.pg_attribute a \
  JOIN pg_catalog.pg_class c ON c.oid = a.attrelid \
  JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
 WHERE a.attgenerated <> '' \
   AND a.attnum > 0 \
   AND NOT a.attisdropped";

/// Mapping (normalized schema, normalized relation) → normalized column names
#[derive(Debug, Default, Clone)]
pub struct GeneratedColumnCache {
    map: HashMap<(String, String), HashSet<String>>,
}

impl GeneratedColumnCache {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Populate the cache from the target catalog.
    pub fn from_target(conn: &PgConnection) -> CdcResult<Self> {
        let result = conn.exec_ok(GENERATED_COLUMNS_SQL)?;

        let mut cache = Self::empty();
        for row in 0..result.ntuples() {
            let nspname = result.getvalue(row, 0).unwrap_or_default();
            let relname = result.getvalue(row, 1).unwrap_or_default();
            let attname = result.getvalue(row, 2).unwrap_or_default();
            cache.add(&nspname, &relname, &attname);
        }

        info!(
            "Generated-column cache holds {} table(s)",
            cache.map.len()
        );

        Ok(cache)
    }

    /// Record one generated column; identifiers may arrive quoted or not.
    pub fn add(&mut self, nspname: &str, relname: &str, attname: &str) {
        self.map
            .entry((
                normalize_identifier(nspname),
                normalize_identifier(relname),
            ))
            .or_default()
            .insert(normalize_identifier(attname));
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Generated columns of a table, when any are known
    pub fn columns_for(&self, relation: &LogicalMessageRelation) -> Option<&HashSet<String>> {
        self.map
            .get(&(relation.nspname.clone(), relation.relname.clone()))
    }

    /// Set `is_generated` on every attribute of `tuple` found in the cache.
    pub fn mark_generated(&self, relation: &LogicalMessageRelation, tuple: &mut LogicalMessageTuple) {
        let Some(columns) = self.columns_for(relation) else {
            return;
        };
        for attribute in &mut tuple.attributes {
            if columns.contains(&attribute.attname) {
                attribute.is_generated = true;
            }
        }
    }
}
