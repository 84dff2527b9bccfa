//! `dix query`: run a query against one table and print the matches.
//!
//! Values given on the command line are parsed as JSON when possible
//! (`42`, `true`, `"quoted"`) and taken as plain strings otherwise.

use anyhow::{bail, Result};
use serde_json::Value;

use crate::config::Config;
use crate::db;
use crate::query::Query;
use crate::table::Table;

/// Condition on the `where` index.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Equals(Value),
    NotEqual(Value),
    Above(Value),
    AboveOrEqual(Value),
    Below(Value),
    BelowOrEqual(Value),
    Between(Value, Value),
    StartsWith(String),
    AnyOf(Vec<Value>),
    NoneOf(Vec<Value>),
}

#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub table: String,
    pub where_index: Option<String>,
    pub condition: Option<Condition>,
    pub order_by: Option<String>,
    pub reverse: bool,
    pub limit: Option<usize>,
    pub offset: usize,
    pub output: Output,
}

/// What `dix query` prints per match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Output {
    #[default]
    Records,
    Urls,
    /// Values of the iterated index.
    Keys,
    /// Only the number of matches.
    Count,
}

pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Build the query described by `req` on `table`.
pub fn build_query(table: &Table, req: &QueryRequest) -> Result<Query> {
    let mut query = match (&req.where_index, &req.condition) {
        (Some(index), Some(condition)) => {
            let clause = table.where_(index)?;
            match condition.clone() {
                Condition::Equals(v) => clause.equals(v)?,
                Condition::NotEqual(v) => clause.not_equal(v)?,
                Condition::Above(v) => clause.above(v)?,
                Condition::AboveOrEqual(v) => clause.above_or_equal(v)?,
                Condition::Below(v) => clause.below(v)?,
                Condition::BelowOrEqual(v) => clause.below_or_equal(v)?,
                Condition::Between(lo, hi) => clause.between(lo, hi, true, true)?,
                Condition::StartsWith(prefix) => clause.starts_with(&prefix)?,
                Condition::AnyOf(values) => clause.any_of(values)?,
                Condition::NoneOf(values) => clause.none_of(values)?,
            }
        }
        (Some(index), None) => bail!("--where {} needs a condition", index),
        (None, Some(_)) => bail!("a condition needs --where <index>"),
        (None, None) => table.query(),
    };

    if let Some(index) = &req.order_by {
        query = query.order_by(index)?;
    }
    if req.reverse {
        query = query.reverse();
    }
    if req.offset > 0 {
        query = query.offset(req.offset);
    }
    if let Some(limit) = req.limit {
        query = query.limit(limit);
    }
    Ok(query)
}

pub async fn run_query(config: &Config, req: &QueryRequest) -> Result<()> {
    let (database, _report) = db::open_database(config).await?;
    let Some(table) = database.table(&req.table) else {
        database.close().await?;
        bail!("unknown table: {}", req.table);
    };

    let output = print_matches(&table, req).await;
    database.close().await?;
    output
}

async fn print_matches(table: &Table, req: &QueryRequest) -> Result<()> {
    let query = build_query(table, req)?;
    match req.output {
        Output::Records => {
            for record in query.to_array().await? {
                println!(
                    "{}",
                    serde_json::json!({ "url": record.url, "value": record.value })
                );
            }
        }
        Output::Urls => {
            for url in query.urls().await? {
                println!("{}", url);
            }
        }
        Output::Keys => {
            for key in query.keys().await? {
                println!("{}", key);
            }
        }
        Output::Count => println!("{}", query.count().await?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn values_parse_as_json_or_string() {
        assert_eq!(parse_value("42"), json!(42));
        assert_eq!(parse_value("true"), json!(true));
        assert_eq!(parse_value("\"42\""), json!("42"));
        assert_eq!(parse_value("alice"), json!("alice"));
    }
}
