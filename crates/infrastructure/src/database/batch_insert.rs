//! Multi-row insert with generated-key return.
//!
//! Rows are written in chunks so the prepared statement text only varies
//! by chunk size; the statement for each size is built once and cached.
//! Returned ids come back in insertion order, which the materializer
//! relies on to pair ids with the rows it built.

use std::collections::HashMap;
use std::sync::Mutex;

use sqlx::{Postgres, Row, Transaction};

use procq_core::{SchedulerError, SchedulerResult};

const DEFAULT_BATCH_SIZE: usize = 100;

/// A single bindable column value.
#[derive(Debug, Clone)]
pub enum SqlValue {
    I32(i32),
    I64(i64),
    OptI64(Option<i64>),
    Text(String),
    OptText(Option<String>),
}

pub struct BatchRowInserter {
    table: String,
    columns: Vec<String>,
    batch_size: usize,
    statements: Mutex<HashMap<usize, String>>,
}

impl BatchRowInserter {
    pub fn new(table: &str, columns: &[&str]) -> Self {
        Self {
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            batch_size: DEFAULT_BATCH_SIZE,
            statements: Mutex::new(HashMap::new()),
        }
    }

    /// Insert all rows, returning the generated ids in row order.
    pub async fn insert_returning(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        rows: &[Vec<SqlValue>],
    ) -> SchedulerResult<Vec<i64>> {
        self.check_arity(rows)?;

        let mut ids = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(self.batch_size) {
            let sql = self.statement(chunk.len());
            let mut query = sqlx::query(&sql);
            for row in chunk {
                for value in row {
                    query = match value {
                        SqlValue::I32(v) => query.bind(*v),
                        SqlValue::I64(v) => query.bind(*v),
                        SqlValue::OptI64(v) => query.bind(*v),
                        SqlValue::Text(v) => query.bind(v.as_str()),
                        SqlValue::OptText(v) => query.bind(v.as_deref()),
                    };
                }
            }
            let returned = query.fetch_all(&mut **tx).await?;
            for row in returned {
                ids.push(row.try_get::<i64, _>("id")?);
            }
        }
        Ok(ids)
    }

    fn check_arity(&self, rows: &[Vec<SqlValue>]) -> SchedulerResult<()> {
        for row in rows {
            if row.len() != self.columns.len() {
                return Err(SchedulerError::InvalidBatchRow(format!(
                    "row has {} values, table {} expects {}",
                    row.len(),
                    self.table,
                    self.columns.len()
                )));
            }
        }
        Ok(())
    }

    fn statement(&self, row_count: usize) -> String {
        let mut statements = self.statements.lock().unwrap();
        statements
            .entry(row_count)
            .or_insert_with(|| {
                let mut sql = format!(
                    "INSERT INTO {} ({}) VALUES ",
                    self.table,
                    self.columns.join(", ")
                );
                let mut param = 1;
                for row in 0..row_count {
                    if row > 0 {
                        sql.push_str(", ");
                    }
                    sql.push('(');
                    for col in 0..self.columns.len() {
                        if col > 0 {
                            sql.push_str(", ");
                        }
                        sql.push('$');
                        sql.push_str(&param.to_string());
                        param += 1;
                    }
                    sql.push(')');
                }
                sql.push_str(" RETURNING id");
                sql
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_numbers_parameters_across_rows() {
        let inserter = BatchRowInserter::new("things", &["a", "b"]);
        assert_eq!(
            inserter.statement(2),
            "INSERT INTO things (a, b) VALUES ($1, $2), ($3, $4) RETURNING id"
        );
    }

    #[test]
    fn statement_is_cached_per_row_count() {
        let inserter = BatchRowInserter::new("things", &["a"]);
        let first = inserter.statement(3);
        let second = inserter.statement(3);
        assert_eq!(first, second);
        assert_eq!(inserter.statements.lock().unwrap().len(), 1);
    }

    #[test]
    fn rejects_rows_with_wrong_arity() {
        let inserter = BatchRowInserter::new("things", &["a", "b"]);
        let rows = vec![vec![SqlValue::I64(1)]];
        let err = inserter.check_arity(&rows).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidBatchRow(_)));
    }
}
