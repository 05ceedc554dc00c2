// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Column-match routing.
//!
//! Routes a row to the nodes whose identifiers match a column value in the
//! row image (old image for DELETE, new image otherwise).
//!
//! # Expression Syntax
//!
//! ```text
//! STORE_ID=:EXTERNAL_ID          column equals the node's external id
//! STORE_ID=:NODE_ID              column equals the node id
//! REGION=EAST                    column equals a literal (all nodes or none)
//! STATUS!='ARCHIVED'             negation
//! NOTES=NULL                     column is NULL
//! ```
//!
//! Several expressions, one per line or joined with `or`, match a node if
//! any of them matches.

use crate::error::{Result, RouterError};
use crate::model::ChangeRow;
use crate::policy::TargetNode;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Right-hand side of a column expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    ExternalId,
    NodeId,
    Null,
    Literal(String),
}

/// One `column (=|!=) operand` test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnExpression {
    pub column: String,
    pub negated: bool,
    pub operand: Operand,
}

impl ColumnExpression {
    fn matches(&self, value: Option<&str>, node: &TargetNode) -> bool {
        let equal = match (&self.operand, value) {
            (Operand::Null, None) => true,
            (Operand::Null, Some(_)) => false,
            (_, None) => false,
            (Operand::ExternalId, Some(v)) => v == node.external_id,
            (Operand::NodeId, Some(v)) => v == node.node_id,
            (Operand::Literal(literal), Some(v)) => v == literal,
        };
        equal != self.negated
    }
}

impl FromStr for ColumnExpression {
    type Err = RouterError;

    fn from_str(text: &str) -> Result<Self> {
        let (column, negated, operand) = if let Some((lhs, rhs)) = text.split_once("!=") {
            (lhs, true, rhs)
        } else if let Some((lhs, rhs)) = text.split_once('=') {
            (lhs, false, rhs)
        } else {
            return Err(RouterError::Config(format!(
                "column expression '{}' has no '=' or '!='",
                text.trim()
            )));
        };

        let column = column.trim();
        if column.is_empty() {
            return Err(RouterError::Config(format!(
                "column expression '{}' has no column",
                text.trim()
            )));
        }

        let operand = operand.trim();
        let operand = if operand.eq_ignore_ascii_case(":EXTERNAL_ID") {
            Operand::ExternalId
        } else if operand.eq_ignore_ascii_case(":NODE_ID") {
            Operand::NodeId
        } else if operand.eq_ignore_ascii_case("NULL") {
            Operand::Null
        } else {
            let unquoted = operand
                .strip_prefix('\'')
                .and_then(|s| s.strip_suffix('\''))
                .unwrap_or(operand);
            Operand::Literal(unquoted.to_string())
        };

        Ok(Self {
            column: column.to_string(),
            negated,
            operand,
        })
    }
}

impl fmt::Display for ColumnExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = if self.negated { "!=" } else { "=" };
        match &self.operand {
            Operand::ExternalId => write!(f, "{}{}:EXTERNAL_ID", self.column, op),
            Operand::NodeId => write!(f, "{}{}:NODE_ID", self.column, op),
            Operand::Null => write!(f, "{}{}NULL", self.column, op),
            Operand::Literal(literal) => write!(f, "{}{}'{}'", self.column, op, literal),
        }
    }
}

/// Split a line on standalone `or` keywords (any case).
fn split_or(line: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for word in line.split_whitespace() {
        if word.eq_ignore_ascii_case("or") {
            parts.push(current.join(" "));
            current.clear();
        } else {
            current.push(word);
        }
    }
    parts.push(current.join(" "));
    parts
}

/// A parsed column router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMatchPolicy {
    expressions: Vec<ColumnExpression>,
}

impl ColumnMatchPolicy {
    /// Parse a router expression. At least one expression is required.
    pub fn parse(expression: &str) -> Result<Self> {
        let mut expressions = Vec::new();
        for line in expression.lines() {
            for part in split_or(line) {
                if part.trim().is_empty() {
                    continue;
                }
                expressions.push(part.parse()?);
            }
        }
        if expressions.is_empty() {
            return Err(RouterError::Config(
                "column router expression is empty".to_string(),
            ));
        }
        Ok(Self { expressions })
    }

    pub fn expressions(&self) -> &[ColumnExpression] {
        &self.expressions
    }

    /// Nodes among `targets` matched by any expression.
    ///
    /// A column missing from the row image is a policy error for the row.
    pub fn evaluate(&self, row: &ChangeRow, targets: &[TargetNode]) -> Result<BTreeSet<String>> {
        let image = row.routing_image();
        let mut values = Vec::with_capacity(self.expressions.len());
        for expression in &self.expressions {
            let value = image.get(&expression.column).ok_or_else(|| {
                RouterError::policy(
                    "column",
                    format!(
                        "column '{}' not in {} image of row {}",
                        expression.column, row.table, row.id
                    ),
                )
            })?;
            values.push(value);
        }

        Ok(targets
            .iter()
            .filter(|node| {
                self.expressions
                    .iter()
                    .zip(&values)
                    .any(|(expression, value)| expression.matches(*value, node))
            })
            .map(|node| node.node_id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventKind;

    fn nodes() -> Vec<TargetNode> {
        vec![
            TargetNode::new("node-a", "A"),
            TargetNode::new("node-b", "B"),
        ]
    }

    fn row(store: &str) -> ChangeRow {
        ChangeRow::new(1, "orders", "sales", EventKind::Insert).with_column("store_id", store)
    }

    #[test]
    fn test_parse_external_id() {
        let policy = ColumnMatchPolicy::parse("STORE_ID=:EXTERNAL_ID").unwrap();
        assert_eq!(policy.expressions()[0].operand, Operand::ExternalId);
        assert!(!policy.expressions()[0].negated);
    }

    #[test]
    fn test_parse_or_and_lines() {
        let policy = ColumnMatchPolicy::parse("a=:NODE_ID or b=x\nc!=NULL").unwrap();
        assert_eq!(policy.expressions().len(), 3);
        assert_eq!(policy.expressions()[1].operand, Operand::Literal("x".to_string()));
        assert!(policy.expressions()[2].negated);
        assert_eq!(policy.expressions()[2].operand, Operand::Null);
    }

    #[test]
    fn test_parse_quoted_literal() {
        let expr: ColumnExpression = "status != 'ARCHIVED'".parse().unwrap();
        assert_eq!(expr.operand, Operand::Literal("ARCHIVED".to_string()));
        assert_eq!(expr.to_string(), "status!='ARCHIVED'");
    }

    #[test]
    fn test_parse_errors() {
        assert!(ColumnMatchPolicy::parse("").is_err());
        assert!(ColumnMatchPolicy::parse("store_id").is_err());
        assert!(ColumnMatchPolicy::parse("=:EXTERNAL_ID").is_err());
    }

    #[test]
    fn test_routes_to_matching_external_id() {
        let policy = ColumnMatchPolicy::parse("store_id=:EXTERNAL_ID").unwrap();
        let targets = policy.evaluate(&row("A"), &nodes()).unwrap();
        assert_eq!(targets.into_iter().collect::<Vec<_>>(), vec!["node-a".to_string()]);
    }

    #[test]
    fn test_negation_routes_to_others() {
        let policy = ColumnMatchPolicy::parse("store_id!=:EXTERNAL_ID").unwrap();
        let targets = policy.evaluate(&row("A"), &nodes()).unwrap();
        assert_eq!(targets.into_iter().collect::<Vec<_>>(), vec!["node-b".to_string()]);
    }

    #[test]
    fn test_literal_is_all_or_nothing() {
        let policy = ColumnMatchPolicy::parse("store_id=A").unwrap();
        assert_eq!(policy.evaluate(&row("A"), &nodes()).unwrap().len(), 2);
        assert!(policy.evaluate(&row("B"), &nodes()).unwrap().is_empty());
    }

    #[test]
    fn test_delete_uses_old_image() {
        let policy = ColumnMatchPolicy::parse("store_id=:EXTERNAL_ID").unwrap();
        let row = ChangeRow::new(1, "orders", "sales", EventKind::Delete)
            .with_old_column("store_id", "B");
        let targets = policy.evaluate(&row, &nodes()).unwrap();
        assert!(targets.contains("node-b"));
        assert_eq!(targets.len(), 1);
    }

    #[test]
    fn test_missing_column_is_transient_error() {
        let policy = ColumnMatchPolicy::parse("region=:EXTERNAL_ID").unwrap();
        let err = policy.evaluate(&row("A"), &nodes()).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_null_value() {
        let mut row = ChangeRow::new(1, "orders", "sales", EventKind::Insert);
        row.new_image.push("store_id", None);
        let eq = ColumnMatchPolicy::parse("store_id=:EXTERNAL_ID").unwrap();
        assert!(eq.evaluate(&row, &nodes()).unwrap().is_empty());
        let is_null = ColumnMatchPolicy::parse("store_id=NULL").unwrap();
        assert_eq!(is_null.evaluate(&row, &nodes()).unwrap().len(), 2);
    }
}
