// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lookup-table routing.
//!
//! The row's `row_column` value is a key into an auxiliary mapping table;
//! every `target_column` value stored under that key is the external id of a
//! node that receives the row. The mapping is read once per pass and kept in
//! the [`RouterContext`].

use crate::config::LookupConfig;
use crate::context::{LookupMap, RouterContext};
use crate::error::{Result, RouterError};
use crate::model::ChangeRow;
use crate::policy::TargetNode;
use crate::source::ChangeLogSource;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// A lookup-table router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupPolicy {
    table: String,
    key_column: String,
    target_column: String,
    row_column: String,
}

impl LookupPolicy {
    pub fn new(config: &LookupConfig) -> Result<Self> {
        for (field, value) in [
            ("table", &config.table),
            ("key_column", &config.key_column),
            ("target_column", &config.target_column),
            ("row_column", &config.row_column),
        ] {
            if value.trim().is_empty() {
                return Err(RouterError::Config(format!(
                    "lookup router has an empty {}",
                    field
                )));
            }
        }
        Ok(Self {
            table: config.table.clone(),
            key_column: config.key_column.clone(),
            target_column: config.target_column.clone(),
            row_column: config.row_column.clone(),
        })
    }

    /// Memo key, unique per mapping table and column pair.
    fn memo_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.table.to_ascii_lowercase(),
            self.key_column.to_ascii_lowercase(),
            self.target_column.to_ascii_lowercase()
        )
    }

    async fn mapping(
        &self,
        ctx: &mut RouterContext,
        source: &dyn ChangeLogSource,
    ) -> Result<Arc<LookupMap>> {
        let key = self.memo_key();
        if let Some(map) = ctx.lookup(&key) {
            return Ok(map);
        }

        let pairs = source
            .lookup(&self.table, &self.key_column, &self.target_column)
            .await?;
        let mut map = LookupMap::new();
        for (key_value, target) in pairs {
            map.entry(key_value).or_default().push(target);
        }
        debug!(
            channel_id = %ctx.channel_id(),
            table = %self.table,
            keys = map.len(),
            "Loaded lookup table"
        );
        Ok(ctx.remember_lookup(&key, map))
    }

    /// Nodes whose external id the mapping table assigns to the row's key.
    ///
    /// A row whose key column is NULL routes nowhere. A missing key column is
    /// a policy error; an unreadable mapping table is a change log error.
    pub async fn evaluate(
        &self,
        row: &ChangeRow,
        targets: &[TargetNode],
        ctx: &mut RouterContext,
        source: &dyn ChangeLogSource,
    ) -> Result<BTreeSet<String>> {
        let key = match row.routing_image().get(&self.row_column) {
            Some(Some(value)) => value.to_string(),
            Some(None) => return Ok(BTreeSet::new()),
            None => {
                return Err(RouterError::policy(
                    "lookuptable",
                    format!(
                        "column '{}' not in {} image of row {}",
                        self.row_column, row.table, row.id
                    ),
                ))
            }
        };

        let map = self.mapping(ctx, source).await?;
        let Some(external_ids) = map.get(&key) else {
            return Ok(BTreeSet::new());
        };

        Ok(targets
            .iter()
            .filter(|node| external_ids.iter().any(|id| *id == node.external_id))
            .map(|node| node.node_id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventKind, RowImage};
    use crate::source::MemoryChangeLog;

    fn config() -> LookupConfig {
        LookupConfig {
            table: "customer_store".to_string(),
            key_column: "customer_id".to_string(),
            target_column: "store_id".to_string(),
            row_column: "customer_id".to_string(),
        }
    }

    fn mapping(customer: &str, store: &str) -> RowImage {
        let mut image = RowImage::new();
        image.push("customer_id", Some(customer.to_string()));
        image.push("store_id", Some(store.to_string()));
        image
    }

    fn source() -> MemoryChangeLog {
        let log = MemoryChangeLog::new();
        log.insert_lookup_row("customer_store", mapping("c1", "A"));
        log.insert_lookup_row("customer_store", mapping("c2", "A"));
        log.insert_lookup_row("customer_store", mapping("c2", "B"));
        log
    }

    fn nodes() -> Vec<TargetNode> {
        vec![TargetNode::new("node-a", "A"), TargetNode::new("node-b", "B")]
    }

    fn row(customer: &str) -> ChangeRow {
        ChangeRow::new(1, "invoices", "sales", EventKind::Insert).with_column("customer_id", customer)
    }

    #[test]
    fn test_rejects_empty_fields() {
        let mut bad = config();
        bad.row_column = " ".to_string();
        assert!(LookupPolicy::new(&bad).is_err());
    }

    #[tokio::test]
    async fn test_routes_through_mapping() {
        let policy = LookupPolicy::new(&config()).unwrap();
        let source = source();
        let mut ctx = RouterContext::detached("sales");

        let one = policy.evaluate(&row("c1"), &nodes(), &mut ctx, &source).await.unwrap();
        assert_eq!(one.into_iter().collect::<Vec<_>>(), vec!["node-a".to_string()]);

        let both = policy.evaluate(&row("c2"), &nodes(), &mut ctx, &source).await.unwrap();
        assert_eq!(both.len(), 2);

        let none = policy.evaluate(&row("c9"), &nodes(), &mut ctx, &source).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_mapping_memoized_for_pass() {
        let policy = LookupPolicy::new(&config()).unwrap();
        let source = source();
        let mut ctx = RouterContext::detached("sales");

        policy.evaluate(&row("c1"), &nodes(), &mut ctx, &source).await.unwrap();
        // Rows added after the first evaluation are not visible this pass.
        source.insert_lookup_row("customer_store", mapping("c3", "B"));
        let later = policy.evaluate(&row("c3"), &nodes(), &mut ctx, &source).await.unwrap();
        assert!(later.is_empty());

        let mut next_pass = RouterContext::detached("sales");
        let fresh = policy
            .evaluate(&row("c3"), &nodes(), &mut next_pass, &source)
            .await
            .unwrap();
        assert!(fresh.contains("node-b"));
    }

    #[tokio::test]
    async fn test_missing_row_column_is_transient() {
        let policy = LookupPolicy::new(&config()).unwrap();
        let source = source();
        let mut ctx = RouterContext::detached("sales");
        let row = ChangeRow::new(1, "invoices", "sales", EventKind::Insert);
        let err = policy.evaluate(&row, &nodes(), &mut ctx, &source).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_missing_table_is_systemic() {
        let mut cfg = config();
        cfg.table = "nope".to_string();
        let policy = LookupPolicy::new(&cfg).unwrap();
        let source = source();
        let mut ctx = RouterContext::detached("sales");
        let err = policy.evaluate(&row("c1"), &nodes(), &mut ctx, &source).await.unwrap_err();
        assert!(err.is_systemic());
    }
}
