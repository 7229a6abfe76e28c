//! Relational store access

use std::collections::BTreeMap;

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Params, Row, Value as SqlValue};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use tracing::debug;

use crate::config::DbTarget;
use crate::context::{substitute_value, Context};
use crate::error::{ReplayError, ReplayResult};

/// One result row: column name -> text value, `None` for SQL NULL.
pub type DbRow = BTreeMap<String, Option<String>>;

static NAMED_PARAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r":([a-zA-Z_][a-zA-Z0-9_]*)").expect("named parameter pattern is valid")
});

/// An open connection
#[async_trait]
pub trait Database: Send {
    async fn query(&mut self, sql: &str, params: &[Option<String>]) -> ReplayResult<Vec<DbRow>>;

    async fn execute(&mut self, sql: &str, params: &[Option<String>]) -> ReplayResult<()>;

    async fn close(self: Box<Self>) -> ReplayResult<()>;
}

#[async_trait]
pub trait DbConnector: Send + Sync {
    async fn connect(&self, target: &DbTarget) -> ReplayResult<Box<dyn Database>>;
}

/// SQL rewritten from `:name` placeholders to positional `?`.
/// A `None` value binds SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionalSql {
    pub sql: String,
    pub values: Vec<Option<String>>,
}

/// Replace every `:name` with `?` and collect the substituted value of
/// `params[name]` for each occurrence, in order. A `null` param stays NULL.
pub fn to_positional(
    sql: &str,
    params: &BTreeMap<String, Value>,
    ctx: &Context,
) -> ReplayResult<PositionalSql> {
    let mut names = Vec::new();
    let rewritten = NAMED_PARAM
        .replace_all(sql, |caps: &Captures| {
            names.push(caps[1].to_string());
            "?"
        })
        .into_owned();

    let values = names
        .iter()
        .map(|name| {
            let raw = params.get(name).ok_or_else(|| {
                ReplayError::SpecValidation(format!(
                    "sql parameter :{} has no value in params",
                    name
                ))
            })?;
            Ok((!raw.is_null()).then(|| substitute_value(raw, ctx)))
        })
        .collect::<ReplayResult<Vec<_>>>()?;

    Ok(PositionalSql { sql: rewritten, values })
}

/// MySQL connector backed by `mysql_async`
#[derive(Debug, Clone, Default)]
pub struct MysqlConnector;

pub struct MysqlConnection {
    conn: Conn,
}

#[async_trait]
impl DbConnector for MysqlConnector {
    async fn connect(&self, target: &DbTarget) -> ReplayResult<Box<dyn Database>> {
        debug!("connecting to mysql {}", target.describe());
        let opts = OptsBuilder::default()
            .ip_or_hostname(target.host.clone())
            .tcp_port(target.port)
            .user(Some(target.user.clone()))
            .pass(target.password.clone())
            .db_name(Some(target.database.clone()));
        let conn = Conn::new(opts).await.map_err(|e| {
            ReplayError::Database(format!("connect to mysql {} failed: {}", target.describe(), e))
        })?;
        Ok(Box::new(MysqlConnection { conn }))
    }
}

fn sql_params(values: &[Option<String>]) -> Params {
    if values.is_empty() {
        Params::Empty
    } else {
        Params::Positional(
            values
                .iter()
                .map(|v| match v {
                    Some(text) => SqlValue::Bytes(text.as_bytes().to_vec()),
                    None => SqlValue::NULL,
                })
                .collect(),
        )
    }
}

fn cell_text(value: &SqlValue) -> Option<String> {
    match value {
        SqlValue::NULL => None,
        SqlValue::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        SqlValue::Int(v) => Some(v.to_string()),
        SqlValue::UInt(v) => Some(v.to_string()),
        SqlValue::Float(v) => Some(v.to_string()),
        SqlValue::Double(v) => Some(v.to_string()),
        SqlValue::Date(y, m, d, 0, 0, 0, 0) => Some(format!("{:04}-{:02}-{:02}", y, m, d)),
        SqlValue::Date(y, m, d, h, mi, s, 0) => {
            Some(format!("{:04}-{:02}-{:02} {:02}:{:02}:{:02}", y, m, d, h, mi, s))
        }
        SqlValue::Date(y, m, d, h, mi, s, us) => Some(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
            y, m, d, h, mi, s, us
        )),
        SqlValue::Time(neg, days, h, mi, s, us) => {
            let sign = if *neg { "-" } else { "" };
            let hours = u32::from(*h) + days * 24;
            if *us == 0 {
                Some(format!("{}{:02}:{:02}:{:02}", sign, hours, mi, s))
            } else {
                Some(format!("{}{:02}:{:02}:{:02}.{:06}", sign, hours, mi, s, us))
            }
        }
    }
}

fn row_to_map(row: &Row) -> DbRow {
    row.columns_ref()
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let name = column.name_str().into_owned();
            (name, row.as_ref(i).and_then(cell_text))
        })
        .collect()
}

#[async_trait]
impl Database for MysqlConnection {
    async fn query(&mut self, sql: &str, params: &[Option<String>]) -> ReplayResult<Vec<DbRow>> {
        let rows: Vec<Row> = self.conn.exec(sql, sql_params(params)).await?;
        Ok(rows.iter().map(row_to_map).collect())
    }

    async fn execute(&mut self, sql: &str, params: &[Option<String>]) -> ReplayResult<()> {
        self.conn.exec_drop(sql, sql_params(params)).await?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> ReplayResult<()> {
        let MysqlConnection { conn } = *self;
        conn.disconnect().await?;
        Ok(())
    }
}
