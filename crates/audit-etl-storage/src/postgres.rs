use audit_etl_core::artifact::format_timestamp;
use audit_etl_core::config::PostgresConfig;
use audit_etl_core::{
    CompleteRecord, DbRole, ExtractQuery, SourceStore, StoreError, TableName, TargetStore,
};
use chrono::NaiveDateTime;
use futures_util::StreamExt;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, Transaction};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime shared by the blocking Postgres stores. Every sqlx call runs under
/// `block_on` so the store traits stay synchronous.
pub fn build_runtime() -> Result<Arc<Runtime>, StoreError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map(Arc::new)
        .map_err(StoreError::Io)
}

fn connect(runtime: &Runtime, config: &PostgresConfig, role: DbRole) -> Result<PgPool, StoreError> {
    let options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .password(&config.password)
        .database(&config.dbname);
    runtime
        .block_on(
            PgPoolOptions::new()
                .max_connections(1)
                .acquire_timeout(ACQUIRE_TIMEOUT)
                .connect_with(options),
        )
        .map_err(|err| StoreError::Connect {
            role: role.as_str(),
            message: err.to_string(),
        })
}

/// `COPY ... TO STDOUT` statement for one extraction. The watermark is
/// rendered as a literal because COPY does not accept bind parameters.
pub fn copy_out_statement(query: &ExtractQuery) -> String {
    format!(
        "COPY (SELECT proc_inst_id_, text_, name_, time_ FROM {} \
         WHERE text_ IS NOT NULL AND name_ IN ({}) AND time_ > '{}') \
         TO STDOUT WITH CSV HEADER DELIMITER ';'",
        query.table,
        query.field_list_sql(),
        format_timestamp(&query.since)
    )
}

pub struct PostgresSource {
    runtime: Arc<Runtime>,
    pool: Option<PgPool>,
}

impl PostgresSource {
    pub fn connect(runtime: Arc<Runtime>, config: &PostgresConfig) -> Result<Self, StoreError> {
        let pool = connect(&runtime, config, DbRole::Source)?;
        Ok(Self {
            runtime,
            pool: Some(pool),
        })
    }
}

impl SourceStore for PostgresSource {
    fn export_audit_rows(
        &mut self,
        query: &ExtractQuery,
        sink: &mut dyn Write,
    ) -> Result<(), StoreError> {
        let pool = self.pool.as_ref().ok_or(StoreError::Closed)?;
        let statement = copy_out_statement(query);
        self.runtime.block_on(async {
            let mut conn = pool
                .acquire()
                .await
                .map_err(|err| StoreError::backend("acquire source connection", err))?;
            let mut stream = conn
                .copy_out_raw(&statement)
                .await
                .map_err(|err| StoreError::backend("copy out", err))?;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|err| StoreError::backend("copy out", err))?;
                sink.write_all(&chunk)?;
            }
            Ok::<(), StoreError>(())
        })
    }

    fn close(&mut self) -> Result<(), StoreError> {
        if let Some(pool) = self.pool.take() {
            self.runtime.block_on(pool.close());
        }
        Ok(())
    }
}

impl Drop for PostgresSource {
    fn drop(&mut self) {
        let _guard = self.runtime.enter();
        self.pool.take();
    }
}

pub struct PostgresTarget {
    runtime: Arc<Runtime>,
    pool: Option<PgPool>,
    transaction: Option<Transaction<'static, Postgres>>,
    table: TableName,
}

impl PostgresTarget {
    pub fn connect(
        runtime: Arc<Runtime>,
        config: &PostgresConfig,
        table: TableName,
    ) -> Result<Self, StoreError> {
        let pool = connect(&runtime, config, DbRole::Target)?;
        Ok(Self {
            runtime,
            pool: Some(pool),
            transaction: None,
            table,
        })
    }

    fn pool(&self) -> Result<&PgPool, StoreError> {
        self.pool.as_ref().ok_or(StoreError::Closed)
    }
}

impl TargetStore for PostgresTarget {
    fn ensure_schema(&mut self) -> Result<(), StoreError> {
        let pool = self.pool()?;
        let create_table = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                doc_id TEXT,
                proc_inst_id_ TEXT,
                contextData TEXT,
                time_ TIMESTAMP
            )",
            self.table
        );
        let create_index = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (doc_id)",
            self.table.doc_id_index_name(),
            self.table
        );
        self.runtime.block_on(async {
            let mut tx = pool
                .begin()
                .await
                .map_err(|err| StoreError::backend("begin schema transaction", err))?;
            sqlx::query(&create_table)
                .execute(&mut *tx)
                .await
                .map_err(|err| StoreError::backend("create target table", err))?;
            sqlx::query(&create_index)
                .execute(&mut *tx)
                .await
                .map_err(|err| StoreError::backend("create doc_id index", err))?;
            tx.commit()
                .await
                .map_err(|err| StoreError::backend("commit schema", err))
        })
    }

    fn max_event_time(&mut self) -> Result<Option<NaiveDateTime>, StoreError> {
        let pool = self.pool()?;
        let sql = format!("SELECT MAX(time_) FROM {}", self.table);
        self.runtime
            .block_on(sqlx::query_scalar::<_, Option<NaiveDateTime>>(&sql).fetch_one(pool))
            .map_err(|err| StoreError::backend("select max(time_)", err))
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        let tx = {
            let pool = self.pool()?;
            self.runtime
                .block_on(pool.begin())
                .map_err(|err| StoreError::backend("begin", err))?
        };
        self.transaction = Some(tx);
        Ok(())
    }

    fn insert_record(&mut self, record: &CompleteRecord<'_>) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} (doc_id, proc_inst_id_, contextData, time_) VALUES ($1, $2, $3, $4)",
            self.table
        );
        let tx = self.transaction.as_mut().ok_or(StoreError::NoTransaction)?;
        self.runtime
            .block_on(
                sqlx::query(&sql)
                    .bind(record.document_id)
                    .bind(record.process_instance_id)
                    .bind(record.context_data)
                    .bind(record.event_time)
                    .execute(&mut **tx),
            )
            .map_err(|err| StoreError::backend("insert record", err))?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.transaction.take().ok_or(StoreError::NoTransaction)?;
        self.runtime
            .block_on(tx.commit())
            .map_err(|err| StoreError::backend("commit", err))
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        match self.transaction.take() {
            Some(tx) => self
                .runtime
                .block_on(tx.rollback())
                .map_err(|err| StoreError::backend("rollback", err)),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> Result<(), StoreError> {
        let rolled_back = self.rollback();
        if let Some(pool) = self.pool.take() {
            self.runtime.block_on(pool.close());
        }
        rolled_back
    }
}

impl Drop for PostgresTarget {
    fn drop(&mut self) {
        let _guard = self.runtime.enter();
        self.transaction.take();
        self.pool.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn copy_statement_filters_by_fields_and_watermark() {
        let since = NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|date| date.and_hms_opt(0, 5, 0))
            .expect("valid timestamp");
        let table = TableName::parse("public.act_hi_detail").expect("table");
        let statement = copy_out_statement(&ExtractQuery::new(table, since));

        assert_eq!(
            statement,
            "COPY (SELECT proc_inst_id_, text_, name_, time_ FROM public.act_hi_detail \
             WHERE text_ IS NOT NULL AND name_ IN ('contextData', 'docIds') \
             AND time_ > '2024-01-01 00:05:00') TO STDOUT WITH CSV HEADER DELIMITER ';'"
        );
    }

    #[test]
    fn copy_statement_keeps_fractional_seconds() {
        let since = NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|date| date.and_hms_micro_opt(0, 5, 0, 120_000))
            .expect("valid timestamp");
        let table = TableName::parse("act_hi_detail").expect("table");
        let statement = copy_out_statement(&ExtractQuery::new(table, since));
        assert!(statement.contains("time_ > '2024-01-01 00:05:00.120'"));
    }
}
