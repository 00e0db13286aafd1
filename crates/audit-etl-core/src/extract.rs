use crate::artifact::{artifact_file_name, Cp1251Writer};
use crate::model::RunId;
use crate::store::{ExtractQuery, SourceStore, StoreError};
use chrono::NaiveDate;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::Builder;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("prepare output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("export from source: {0}")]
    Export(#[from] StoreError),
    #[error("write artifact: {0}")]
    Write(#[source] io::Error),
    #[error("persist artifact {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub path: PathBuf,
    pub bytes_written: u64,
}

/// Exports matching source rows into `<output_dir>/data_<date>_<run>.csv`.
///
/// The file only appears under its final name after the whole export has been
/// written and synced; a failed export leaves nothing behind.
pub fn extract_to_artifact(
    source: &mut dyn SourceStore,
    query: &ExtractQuery,
    output_dir: &Path,
    date: NaiveDate,
    run_id: &RunId,
) -> Result<Extraction, ExtractError> {
    info!(
        event = "extract_start",
        table = %query.table,
        since = %query.since,
        run_id = %run_id
    );
    fs::create_dir_all(output_dir).map_err(|source| ExtractError::OutputDir {
        path: output_dir.to_path_buf(),
        source,
    })?;

    let partial = Builder::new()
        .prefix(".data_")
        .suffix(".partial")
        .tempfile_in(output_dir)
        .map_err(|source| ExtractError::OutputDir {
            path: output_dir.to_path_buf(),
            source,
        })?;

    let mut writer = Cp1251Writer::new(BufWriter::new(partial));
    source.export_audit_rows(query, &mut writer)?;
    let partial = writer
        .finish()
        .and_then(|buffered| buffered.into_inner().map_err(|err| err.into_error()))
        .map_err(ExtractError::Write)?;
    partial.as_file().sync_all().map_err(ExtractError::Write)?;

    let path = output_dir.join(artifact_file_name(date, run_id));
    let file = partial
        .persist(&path)
        .map_err(|err| ExtractError::Persist {
            path: path.clone(),
            source: err.error,
        })?;
    let bytes_written = file.metadata().map_err(ExtractError::Write)?.len();

    info!(
        event = "extract_done",
        artifact = %path.display(),
        bytes = bytes_written
    );
    Ok(Extraction {
        path,
        bytes_written,
    })
}
