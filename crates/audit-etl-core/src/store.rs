use crate::config::TableName;
use crate::model::{CompleteRecord, FieldName};
use chrono::NaiveDateTime;
use std::fmt::Display;
use std::io::{self, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connect to {role} database: {message}")]
    Connect { role: &'static str, message: String },
    #[error("{operation}: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("no open transaction")]
    NoTransaction,
    #[error("store already closed")]
    Closed,
}

impl StoreError {
    pub fn backend(operation: &'static str, err: impl Display) -> Self {
        Self::Backend {
            operation,
            message: err.to_string(),
        }
    }
}

/// Rows to pull from the source audit table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractQuery {
    pub table: TableName,
    pub since: NaiveDateTime,
}

impl ExtractQuery {
    pub fn new(table: TableName, since: NaiveDateTime) -> Self {
        Self { table, since }
    }

    pub fn fields(&self) -> [FieldName; 2] {
        FieldName::ALL
    }

    /// `'contextData', 'docIds'`, ready for an `IN (...)` clause.
    pub fn field_list_sql(&self) -> String {
        self.fields()
            .iter()
            .map(|field| format!("'{}'", field.as_str()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Blocking read side of a run; every call returns once the database has answered.
pub trait SourceStore {
    /// Streams every matching row into `sink` as UTF-8 CSV: header
    /// `proc_inst_id_;text_;name_;time_`, `;` delimiter, doubled-quote escaping.
    fn export_audit_rows(
        &mut self,
        query: &ExtractQuery,
        sink: &mut dyn Write,
    ) -> Result<(), StoreError>;

    /// Releases the connection. Calling it again is a no-op.
    fn close(&mut self) -> Result<(), StoreError>;
}

pub trait TargetStore {
    /// Creates the target table and its `doc_id` index when absent.
    fn ensure_schema(&mut self) -> Result<(), StoreError>;

    /// `MAX(time_)` of the target table, `None` when it is empty.
    fn max_event_time(&mut self) -> Result<Option<NaiveDateTime>, StoreError>;

    fn begin(&mut self) -> Result<(), StoreError>;

    fn insert_record(&mut self, record: &CompleteRecord<'_>) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;

    fn rollback(&mut self) -> Result<(), StoreError>;

    /// Releases the connection, discarding any open transaction. Calling it again is a no-op.
    fn close(&mut self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn field_list_quotes_both_audit_fields() {
        let since = NaiveDate::from_ymd_opt(2020, 1, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .expect("valid timestamp");
        let table = TableName::parse("act_hi_detail").expect("table name");
        let query = ExtractQuery::new(table, since);
        assert_eq!(query.field_list_sql(), "'contextData', 'docIds'");
    }
}
