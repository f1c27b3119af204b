//! Declarative list filter.
//!
//! Storage reads take a [`Filter`] instead of ad hoc queries:
//!
//! ```json
//! {"offset": 0, "limit": 10, "orderBy": "number", "orderDirection": "desc",
//!  "filters": [{"property": "number", "comparator": "gte", "value": 100}]}
//! ```
//!
//! Properties are checked against a per-table whitelist before they reach SQL.

use anyhow::{bail, Result};
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_LIMIT: u64 = 100;
pub const MAX_LIMIT: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

impl OrderDirection {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Comparator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    /// Prefix match.
    StartsFrom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterEntry {
    pub property: String,
    pub comparator: Comparator,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub order_by: Option<String>,
    #[serde(default)]
    pub order_direction: Option<OrderDirection>,
    #[serde(default)]
    pub filters: Vec<FilterEntry>,
}

/// Queryable columns of a table.
#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    /// Appended to every ORDER BY so pages are stable.
    pub tie_break: &'static str,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, property: &str, comparator: Comparator, value: impl Into<Value>) -> Self {
        self.filters.push(FilterEntry {
            property: property.to_string(),
            comparator,
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, property: &str, direction: OrderDirection) -> Self {
        self.order_by = Some(property.to_string());
        self.order_direction = Some(direction);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Render `WHERE … ORDER BY … LIMIT … OFFSET …` with positional parameters.
    pub fn to_sql(&self, table: &TableSpec) -> Result<(String, Vec<SqlValue>)> {
        let mut clauses = Vec::with_capacity(self.filters.len());
        let mut params = Vec::with_capacity(self.filters.len() + 2);

        for entry in &self.filters {
            let column = checked_column(table, &entry.property)?;
            let index = params.len() + 1;
            let clause = match entry.comparator {
                Comparator::Gt => format!("{column} > ?{index}"),
                Comparator::Gte => format!("{column} >= ?{index}"),
                Comparator::Lt => format!("{column} < ?{index}"),
                Comparator::Lte => format!("{column} <= ?{index}"),
                Comparator::Eq => format!("{column} = ?{index}"),
                Comparator::StartsFrom => format!("{column} LIKE ?{index} ESCAPE '\\'"),
            };
            clauses.push(clause);

            let value = if entry.comparator == Comparator::StartsFrom {
                let Some(prefix) = entry.value.as_str() else {
                    bail!("startsFrom on {} needs a string value", entry.property);
                };
                SqlValue::Text(format!("{}%", escape_like(prefix)))
            } else {
                json_to_sql(&entry.value)?
            };
            params.push(value);
        }

        let mut sql = String::new();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        let direction = self.order_direction.unwrap_or_default().as_sql();
        match &self.order_by {
            Some(property) => {
                let column = checked_column(table, property)?;
                sql.push_str(&format!(
                    " ORDER BY {column} {direction}, {} {direction}",
                    table.tie_break
                ));
            }
            None => sql.push_str(&format!(" ORDER BY {} {direction}", table.tie_break)),
        }

        let limit = self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        sql.push_str(&format!(" LIMIT {limit} OFFSET {}", self.offset.unwrap_or(0)));

        Ok((sql, params))
    }
}

fn checked_column<'a>(table: &TableSpec, property: &'a str) -> Result<&'a str> {
    if table.columns.contains(&property) {
        Ok(property)
    } else {
        bail!("Property '{property}' cannot be filtered on {}", table.name)
    }
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn json_to_sql(value: &Value) -> Result<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => SqlValue::Integer(i),
            (None, Some(f)) => SqlValue::Real(f),
            _ => bail!("Unsupported number in filter: {n}"),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => bail!("Unsupported filter value: {other}"),
    })
}
