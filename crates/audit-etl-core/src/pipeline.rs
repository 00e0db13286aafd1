use crate::artifact::{read_artifact, ArtifactError};
use crate::config::EtlSettings;
use crate::extract::{extract_to_artifact, ExtractError};
use crate::load::{load_records, LoadError, LoadReport};
use crate::model::RunId;
use crate::store::{ExtractQuery, SourceStore, StoreError, TargetStore};
use crate::transform::{TransformReport, Transformer};
use crate::watermark::{read_watermark, Watermark};
use chrono::NaiveDate;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum EtlError {
    #[error("schema initialization failed: {0}")]
    Schema(#[source] StoreError),
    #[error("watermark read failed: {0}")]
    Watermark(#[source] StoreError),
    #[error("extraction failed: {0}")]
    Extract(#[from] ExtractError),
    #[error("artifact unreadable: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("load failed: {0}")]
    Load(#[from] LoadError),
}

impl EtlError {
    pub fn stage(&self) -> &'static str {
        match self {
            EtlError::Schema(_) => "schema",
            EtlError::Watermark(_) => "watermark",
            EtlError::Extract(_) => "extract",
            EtlError::Artifact(_) => "transform",
            EtlError::Load(_) => "load",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: RunId,
    pub watermark: Watermark,
    /// `None` once the artifact has been removed after a successful load.
    pub artifact: Option<PathBuf>,
    pub transform: TransformReport,
    pub load: LoadReport,
}

pub fn initialize_schema(target: &mut dyn TargetStore) -> Result<(), StoreError> {
    info!(event = "schema_init", "ensuring target table and doc_id index");
    target.ensure_schema()?;
    info!(event = "schema_ready");
    Ok(())
}

/// One watermark-bounded pass: schema, watermark, extract, transform, load.
///
/// The pipeline borrows both stores; closing them is left to the owner so it
/// happens on every exit path.
pub struct Pipeline<'a> {
    source: &'a mut dyn SourceStore,
    target: &'a mut dyn TargetStore,
    settings: &'a EtlSettings,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        source: &'a mut dyn SourceStore,
        target: &'a mut dyn TargetStore,
        settings: &'a EtlSettings,
    ) -> Self {
        Self {
            source,
            target,
            settings,
        }
    }

    pub fn run(&mut self, run_id: &RunId, date: NaiveDate) -> Result<RunReport, EtlError> {
        info!(
            event = "run_start",
            run_id = %run_id,
            tie_break = %self.settings.tie_break,
            source_table = %self.settings.source_table,
            target_table = %self.settings.target_table
        );
        initialize_schema(self.target).map_err(EtlError::Schema)?;
        let watermark = read_watermark(self.target).map_err(EtlError::Watermark)?;

        let query = ExtractQuery::new(self.settings.source_table.clone(), watermark.since);
        let extraction = extract_to_artifact(
            self.source,
            &query,
            &self.settings.output_dir,
            date,
            run_id,
        )?;

        info!(event = "transform_start", artifact = %extraction.path.display());
        let rows = read_artifact(&extraction.path)?;
        let output = Transformer::new(self.settings.tie_break).transform(&rows);
        info!(
            event = "transform_done",
            rows = output.report.rows_read,
            records = output.report.records,
            with_doc_id = output.report.with_document_id,
            with_context = output.report.with_context_data,
            payload_warnings = output.report.payload_warnings
        );

        let load = load_records(self.target, &output.records)?;

        let artifact = if self.settings.retain_artifact {
            Some(extraction.path)
        } else {
            match fs::remove_file(&extraction.path) {
                Ok(()) => None,
                Err(err) => {
                    warn!(
                        event = "artifact_cleanup_failed",
                        artifact = %extraction.path.display(),
                        error = %err
                    );
                    Some(extraction.path)
                }
            }
        };

        info!(
            event = "run_done",
            run_id = %run_id,
            inserted = load.inserted,
            skipped = load.skipped
        );
        Ok(RunReport {
            run_id: run_id.clone(),
            watermark,
            artifact,
            transform: output.report,
            load,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableName;
    use crate::test_support::{CannedSource, MemoryTarget, StoredRow};
    use crate::transform::TieBreak;
    use chrono::NaiveDateTime;
    use tempfile::tempdir;

    const EXPORT: &str = "proc_inst_id_;text_;name_;time_\n\
        P1;ctx1;contextData;2024-01-01 00:00:00\n\
        P1;\"{\"\"report.AttachedDocuments\"\":[{\"\"doc.id\"\":\"\"D1\"\"}]}\";docIds;2024-01-01 00:05:00\n";

    fn ts(day: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .and_then(|date| date.and_hms_opt(0, min, 0))
            .expect("valid timestamp")
    }

    fn run_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 2).expect("date")
    }

    fn settings(output_dir: PathBuf) -> EtlSettings {
        EtlSettings {
            output_dir,
            tie_break: TieBreak::FirstSeen,
            ..EtlSettings::default()
        }
    }

    #[test]
    fn first_run_loads_grouped_record_from_full_history() {
        let dir = tempdir().expect("tempdir");
        let settings = settings(dir.path().to_path_buf());
        let mut source = CannedSource {
            csv: EXPORT.to_string(),
            ..CannedSource::default()
        };
        let mut target = MemoryTarget::default();
        let run_id = RunId::new();

        let report = Pipeline::new(&mut source, &mut target, &settings)
            .run(&run_id, run_date())
            .expect("run");

        assert!(report.watermark.from_floor);
        assert_eq!(source.queries.len(), 1);
        assert_eq!(source.queries[0].since.to_string(), "2020-01-01 00:00:00");
        assert_eq!(
            source.queries[0].table,
            TableName::parse("act_hi_detail").expect("table")
        );
        assert_eq!(report.transform.rows_read, 2);
        assert_eq!(report.load, LoadReport { inserted: 1, skipped: 0 });
        assert_eq!(
            target.committed,
            vec![StoredRow {
                doc_id: "D1".to_string(),
                proc_inst_id: "P1".to_string(),
                context_data: "ctx1".to_string(),
                time: Some(ts(1, 5)),
            }]
        );
        let artifact = report.artifact.expect("artifact retained");
        assert!(artifact.exists());
        assert_eq!(
            artifact.file_name().and_then(|name| name.to_str()),
            Some(format!("data_2024-01-02_{run_id}.csv").as_str())
        );
        assert_eq!(target.schema_created, 1);
    }

    #[test]
    fn second_run_starts_from_loaded_watermark() {
        let dir = tempdir().expect("tempdir");
        let settings = settings(dir.path().to_path_buf());
        let mut target = MemoryTarget::default();

        let mut first = CannedSource {
            csv: EXPORT.to_string(),
            ..CannedSource::default()
        };
        let first_report = Pipeline::new(&mut first, &mut target, &settings)
            .run(&RunId::new(), run_date())
            .expect("first run");

        let mut second = CannedSource {
            csv: "proc_inst_id_;text_;name_;time_\n".to_string(),
            ..CannedSource::default()
        };
        let second_report = Pipeline::new(&mut second, &mut target, &settings)
            .run(&RunId::new(), run_date())
            .expect("second run");

        assert!(!second_report.watermark.from_floor);
        assert_eq!(second.queries[0].since, ts(1, 5));
        assert!(second_report.watermark.since >= first_report.watermark.since);
        assert_eq!(second_report.load, LoadReport::default());
        assert_eq!(target.committed.len(), 1);
        assert_eq!(target.schema_created, 2);
    }

    #[test]
    fn schema_failure_stops_before_extraction() {
        let dir = tempdir().expect("tempdir");
        let settings = settings(dir.path().to_path_buf());
        let mut source = CannedSource::default();
        let mut target = MemoryTarget {
            fail_schema: true,
            ..MemoryTarget::default()
        };

        let err = Pipeline::new(&mut source, &mut target, &settings)
            .run(&RunId::new(), run_date())
            .expect_err("schema fails");
        assert_eq!(err.stage(), "schema");
        assert!(source.queries.is_empty());
        assert_eq!(target.calls, vec!["ensure_schema"]);
    }

    #[test]
    fn watermark_failure_stops_before_extraction() {
        let dir = tempdir().expect("tempdir");
        let settings = settings(dir.path().to_path_buf());
        let mut source = CannedSource::default();
        let mut target = MemoryTarget {
            fail_max_time: true,
            ..MemoryTarget::default()
        };

        let err = Pipeline::new(&mut source, &mut target, &settings)
            .run(&RunId::new(), run_date())
            .expect_err("watermark fails");
        assert_eq!(err.stage(), "watermark");
        assert!(source.queries.is_empty());
    }

    #[test]
    fn extraction_failure_never_reaches_the_loader() {
        let dir = tempdir().expect("tempdir");
        let settings = settings(dir.path().to_path_buf());
        let mut source = CannedSource {
            fail: true,
            ..CannedSource::default()
        };
        let mut target = MemoryTarget::default();

        let err = Pipeline::new(&mut source, &mut target, &settings)
            .run(&RunId::new(), run_date())
            .expect_err("extract fails");
        assert_eq!(err.stage(), "extract");
        assert!(!target.calls.contains(&"begin"));
        assert_eq!(fs::read_dir(dir.path()).expect("read dir").count(), 0);
    }

    #[test]
    fn malformed_artifact_is_fatal() {
        let dir = tempdir().expect("tempdir");
        let settings = settings(dir.path().to_path_buf());
        let mut source = CannedSource {
            csv: "proc_inst_id_;text_;name_;time_\nP1;x;docIds;not-a-time\n".to_string(),
            ..CannedSource::default()
        };
        let mut target = MemoryTarget::default();

        let err = Pipeline::new(&mut source, &mut target, &settings)
            .run(&RunId::new(), run_date())
            .expect_err("artifact fails");
        assert_eq!(err.stage(), "transform");
        assert!(matches!(err, EtlError::Artifact(ArtifactError::Timestamp { .. })));
        assert!(target.committed.is_empty());
    }

    #[test]
    fn artifact_is_removed_when_not_retained() {
        let dir = tempdir().expect("tempdir");
        let settings = EtlSettings {
            retain_artifact: false,
            ..settings(dir.path().to_path_buf())
        };
        let mut source = CannedSource {
            csv: EXPORT.to_string(),
            ..CannedSource::default()
        };
        let mut target = MemoryTarget::default();

        let report = Pipeline::new(&mut source, &mut target, &settings)
            .run(&RunId::new(), run_date())
            .expect("run");
        assert_eq!(report.artifact, None);
        assert_eq!(fs::read_dir(dir.path()).expect("read dir").count(), 0);
        assert_eq!(report.load.inserted, 1);
    }
}
