use audit_etl_core::artifact::AuditCsvWriter;
use audit_etl_core::{CompleteRecord, ExtractQuery, SourceStore, StoreError, TableName, TargetStore};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OpenFlags};
use std::io::Write;
use std::path::Path;

// SQLite has no schemas to qualify with, so only the base table name is used.
// `time_` may be stored with a space or a `T` separator; the watermark filter
// compares both sides through `strftime`.

pub struct SqliteSource {
    conn: Option<Connection>,
}

impl SqliteSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| StoreError::Connect {
            role: "source",
            message: err.to_string(),
        })?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn: Some(conn) }
    }
}

impl SourceStore for SqliteSource {
    fn export_audit_rows(
        &mut self,
        query: &ExtractQuery,
        sink: &mut dyn Write,
    ) -> Result<(), StoreError> {
        let conn = self.conn.as_ref().ok_or(StoreError::Closed)?;
        let sql = format!(
            "
            SELECT proc_inst_id_, text_, name_, time_
            FROM {}
            WHERE text_ IS NOT NULL
              AND name_ IN ({})
              AND strftime('%Y-%m-%d %H:%M:%f', time_) > strftime('%Y-%m-%d %H:%M:%f', ?1)
            ",
            query.table.base_name(),
            query.field_list_sql()
        );
        let mut statement = conn
            .prepare(&sql)
            .map_err(|err| StoreError::backend("prepare export query", err))?;
        let mut rows = statement
            .query(params![query.since])
            .map_err(|err| StoreError::backend("run export query", err))?;

        let mut writer = AuditCsvWriter::new(sink)
            .map_err(|err| StoreError::backend("write export header", err))?;
        while let Some(row) = rows
            .next()
            .map_err(|err| StoreError::backend("read export row", err))?
        {
            let process_instance_id: String = row
                .get(0)
                .map_err(|err| StoreError::backend("proc_inst_id_", err))?;
            let field_text: Option<String> = row
                .get(1)
                .map_err(|err| StoreError::backend("text_", err))?;
            let field_name: String = row
                .get(2)
                .map_err(|err| StoreError::backend("name_", err))?;
            let event_time: NaiveDateTime = row
                .get(3)
                .map_err(|err| StoreError::backend("time_", err))?;
            writer
                .write_row(
                    &process_instance_id,
                    field_text.as_deref(),
                    &field_name,
                    &event_time,
                )
                .map_err(|err| StoreError::backend("write export row", err))?;
        }
        writer
            .finish()
            .map_err(|err| StoreError::backend("flush export", err))
    }

    fn close(&mut self) -> Result<(), StoreError> {
        match self.conn.take() {
            Some(conn) => conn
                .close()
                .map_err(|(_, err)| StoreError::backend("close source", err)),
            None => Ok(()),
        }
    }
}

pub struct SqliteTarget {
    conn: Option<Connection>,
    table: TableName,
    in_transaction: bool,
}

impl SqliteTarget {
    pub fn open(path: impl AsRef<Path>, table: TableName) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|err| StoreError::Connect {
            role: "target",
            message: err.to_string(),
        })?;
        Ok(Self::from_connection(conn, table))
    }

    pub fn from_connection(conn: Connection, table: TableName) -> Self {
        Self {
            conn: Some(conn),
            table,
            in_transaction: false,
        }
    }

    fn conn(&self) -> Result<&Connection, StoreError> {
        self.conn.as_ref().ok_or(StoreError::Closed)
    }
}

#[cfg(test)]
impl SqliteTarget {
    pub fn open_in_memory(table: TableName) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|err| StoreError::Connect {
            role: "target",
            message: err.to_string(),
        })?;
        Ok(Self::from_connection(conn, table))
    }

    pub fn schema_objects(&self) -> Result<Vec<(String, String)>, StoreError> {
        let conn = self.conn()?;
        let mut statement = conn
            .prepare(
                "
                SELECT type, name
                FROM sqlite_master
                WHERE tbl_name = ?1
                ORDER BY type, name
                ",
            )
            .map_err(|err| StoreError::backend("list schema objects", err))?;
        let rows = statement
            .query_map([self.table.base_name()], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|err| StoreError::backend("list schema objects", err))?;

        let mut objects = Vec::new();
        for row in rows {
            objects.push(row.map_err(|err| StoreError::backend("list schema objects", err))?);
        }
        Ok(objects)
    }

    pub fn row_count(&self) -> Result<i64, StoreError> {
        self.conn()?
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", self.table.base_name()),
                [],
                |row| row.get(0),
            )
            .map_err(|err| StoreError::backend("count rows", err))
    }
}

impl TargetStore for SqliteTarget {
    fn ensure_schema(&mut self) -> Result<(), StoreError> {
        let table = self.table.base_name();
        let sql = format!(
            "
            CREATE TABLE IF NOT EXISTS {table} (
                doc_id TEXT,
                proc_inst_id_ TEXT,
                contextData TEXT,
                time_ TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS {index} ON {table} (doc_id);
            ",
            index = self.table.doc_id_index_name()
        );
        self.conn()?
            .execute_batch(&sql)
            .map_err(|err| StoreError::backend("create target schema", err))
    }

    fn max_event_time(&mut self) -> Result<Option<NaiveDateTime>, StoreError> {
        self.conn()?
            .query_row(
                &format!("SELECT MAX(time_) FROM {}", self.table.base_name()),
                [],
                |row| row.get::<_, Option<NaiveDateTime>>(0),
            )
            .map_err(|err| StoreError::backend("select max(time_)", err))
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        self.conn()?
            .execute_batch("BEGIN")
            .map_err(|err| StoreError::backend("begin", err))?;
        self.in_transaction = true;
        Ok(())
    }

    fn insert_record(&mut self, record: &CompleteRecord<'_>) -> Result<(), StoreError> {
        if !self.in_transaction {
            return Err(StoreError::NoTransaction);
        }
        let sql = format!(
            "INSERT INTO {} (doc_id, proc_inst_id_, contextData, time_) VALUES (?1, ?2, ?3, ?4)",
            self.table.base_name()
        );
        let conn = self.conn()?;
        let mut statement = conn
            .prepare_cached(&sql)
            .map_err(|err| StoreError::backend("prepare insert", err))?;
        statement
            .execute(params![
                record.document_id,
                record.process_instance_id,
                record.context_data,
                record.event_time,
            ])
            .map_err(|err| StoreError::backend("insert record", err))?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if !self.in_transaction {
            return Err(StoreError::NoTransaction);
        }
        self.conn()?
            .execute_batch("COMMIT")
            .map_err(|err| StoreError::backend("commit", err))?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.conn()?
            .execute_batch("ROLLBACK")
            .map_err(|err| StoreError::backend("rollback", err))
    }

    fn close(&mut self) -> Result<(), StoreError> {
        if self.conn.is_none() {
            return Ok(());
        }
        self.rollback()?;
        match self.conn.take() {
            Some(conn) => conn
                .close()
                .map_err(|(_, err)| StoreError::backend("close target", err)),
            None => Ok(()),
        }
    }
}
