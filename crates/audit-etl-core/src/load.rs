use crate::model::NormalizedRecord;
use crate::store::{StoreError, TargetStore};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("begin load transaction: {0}")]
    Begin(#[source] StoreError),
    #[error("insert record for process instance {process_instance_id}: {source}")]
    Insert {
        process_instance_id: String,
        #[source]
        source: StoreError,
    },
    #[error("commit load transaction: {0}")]
    Commit(#[source] StoreError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub inserted: usize,
    pub skipped: usize,
}

/// Inserts every complete record inside one transaction and commits once.
///
/// Incomplete records are skipped with a warning. A failing insert rolls the
/// whole batch back and aborts the load.
pub fn load_records(
    target: &mut dyn TargetStore,
    records: &[NormalizedRecord],
) -> Result<LoadReport, LoadError> {
    info!(event = "load_start", records = records.len());
    target.begin().map_err(LoadError::Begin)?;

    let mut report = LoadReport::default();
    for (index, record) in records.iter().enumerate() {
        let complete = match record.complete() {
            Ok(complete) => complete,
            Err(missing) => {
                warn!(
                    event = "record_skipped",
                    index,
                    proc_inst_id = %record.process_instance_id,
                    missing = %missing
                );
                report.skipped += 1;
                continue;
            }
        };

        if let Err(source) = target.insert_record(&complete) {
            abandon(target);
            return Err(LoadError::Insert {
                process_instance_id: record.process_instance_id.clone(),
                source,
            });
        }
        report.inserted += 1;
    }

    if let Err(err) = target.commit() {
        abandon(target);
        return Err(LoadError::Commit(err));
    }
    info!(
        event = "load_done",
        inserted = report.inserted,
        skipped = report.skipped
    );
    Ok(report)
}

fn abandon(target: &mut dyn TargetStore) {
    if let Err(err) = target.rollback() {
        error!(event = "rollback_failed", error = %err);
    }
}
