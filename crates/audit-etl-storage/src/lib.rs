pub mod postgres;
pub mod sqlite;

use audit_etl_core::{
    DatabaseConfig, DbRole, EtlConfig, SourceStore, StoreError, TableName, TargetStore,
};
use crate::postgres::{PostgresSource, PostgresTarget};
use crate::sqlite::{SqliteSource, SqliteTarget};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::{error, info};

/// The two connections a run works with.
pub struct Stores {
    pub source: Box<dyn SourceStore>,
    pub target: Box<dyn TargetStore>,
}

impl Stores {
    /// Releases both connections; failures are logged, not returned.
    pub fn close(&mut self) {
        if let Err(err) = self.source.close() {
            error!(event = "db_close_failed", role = "source", error = %err);
        }
        if let Err(err) = self.target.close() {
            error!(event = "db_close_failed", role = "target", error = %err);
        }
        info!(event = "db_closed");
    }
}

/// Opens the source, then the target. A target failure drops the already
/// opened source.
pub fn connect(config: &EtlConfig) -> Result<Stores, StoreError> {
    let mut runtime = None;
    let source = open_source(&config.source, &mut runtime)?;
    let target = open_target(
        &config.target,
        config.settings.target_table.clone(),
        &mut runtime,
    )?;
    Ok(Stores { source, target })
}

fn shared_runtime(runtime: &mut Option<Arc<Runtime>>) -> Result<Arc<Runtime>, StoreError> {
    match runtime {
        Some(existing) => Ok(Arc::clone(existing)),
        None => {
            let created = postgres::build_runtime()?;
            *runtime = Some(Arc::clone(&created));
            Ok(created)
        }
    }
}

fn log_connected(role: DbRole, config: &DatabaseConfig) {
    info!(
        event = "db_connected",
        role = %role,
        backend = config.backend(),
        location = %config.describe()
    );
}

fn open_source(
    config: &DatabaseConfig,
    runtime: &mut Option<Arc<Runtime>>,
) -> Result<Box<dyn SourceStore>, StoreError> {
    let store: Box<dyn SourceStore> = match config {
        DatabaseConfig::Postgres(pg) => {
            Box::new(PostgresSource::connect(shared_runtime(runtime)?, pg)?)
        }
        DatabaseConfig::Sqlite(sqlite) => Box::new(SqliteSource::open(&sqlite.path)?),
    };
    log_connected(DbRole::Source, config);
    Ok(store)
}

fn open_target(
    config: &DatabaseConfig,
    table: TableName,
    runtime: &mut Option<Arc<Runtime>>,
) -> Result<Box<dyn TargetStore>, StoreError> {
    let store: Box<dyn TargetStore> = match config {
        DatabaseConfig::Postgres(pg) => Box::new(PostgresTarget::connect(
            shared_runtime(runtime)?,
            pg,
            table,
        )?),
        DatabaseConfig::Sqlite(sqlite) => Box::new(SqliteTarget::open(&sqlite.path, table)?),
    };
    log_connected(DbRole::Target, config);
    Ok(store)
}
