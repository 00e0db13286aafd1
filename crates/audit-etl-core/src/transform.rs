use crate::doc_ids::{extract_document_id, DocIdsError};
use crate::model::{FieldName, NormalizedRecord, RawAuditRow};
use chrono::NaiveDateTime;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Which row wins when a process instance logged the same field more than once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TieBreak {
    #[default]
    FirstSeen,
    LastSeen,
    Random,
}

impl TieBreak {
    pub fn as_str(&self) -> &'static str {
        match self {
            TieBreak::FirstSeen => "first-seen",
            TieBreak::LastSeen => "last-seen",
            TieBreak::Random => "random",
        }
    }

    pub fn pick<'a, T, R>(self, candidates: &'a [T], rng: &mut R) -> Option<&'a T>
    where
        R: Rng + ?Sized,
    {
        match self {
            TieBreak::FirstSeen => candidates.first(),
            TieBreak::LastSeen => candidates.last(),
            TieBreak::Random => candidates.choose(rng),
        }
    }
}

impl fmt::Display for TieBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TieBreak {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "first-seen" | "first_seen" | "first" => Ok(TieBreak::FirstSeen),
            "last-seen" | "last_seen" | "last" => Ok(TieBreak::LastSeen),
            "random" | "sample" => Ok(TieBreak::Random),
            other => Err(format!("Unknown tie-break policy: {other}")),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransformReport {
    pub rows_read: usize,
    pub records: usize,
    pub with_document_id: usize,
    pub with_context_data: usize,
    pub payload_warnings: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutput {
    pub records: Vec<NormalizedRecord>,
    pub report: TransformReport,
}

#[derive(Default)]
struct Group<'a> {
    context_rows: Vec<&'a RawAuditRow>,
    doc_ids_rows: Vec<&'a RawAuditRow>,
    latest: Option<NaiveDateTime>,
}

pub struct Transformer {
    tie_break: TieBreak,
}

impl Transformer {
    pub fn new(tie_break: TieBreak) -> Self {
        Self { tie_break }
    }

    pub fn transform(&self, rows: &[RawAuditRow]) -> TransformOutput {
        self.transform_with_rng(rows, &mut rand::thread_rng())
    }

    /// Emits one record per distinct process instance, ordered by id.
    ///
    /// Malformed `docIds` payloads only null the document id; nothing in here fails.
    pub fn transform_with_rng<R>(&self, rows: &[RawAuditRow], rng: &mut R) -> TransformOutput
    where
        R: Rng + ?Sized,
    {
        let mut groups: BTreeMap<&str, Group<'_>> = BTreeMap::new();
        for row in rows {
            let group = groups.entry(row.process_instance_id.as_str()).or_default();
            match row.field_name {
                FieldName::ContextData => group.context_rows.push(row),
                FieldName::DocIds => group.doc_ids_rows.push(row),
            }
            group.latest = Some(match group.latest {
                Some(latest) => latest.max(row.event_time),
                None => row.event_time,
            });
        }

        let mut report = TransformReport {
            rows_read: rows.len(),
            ..TransformReport::default()
        };
        let mut records = Vec::with_capacity(groups.len());

        for (process_instance_id, group) in groups {
            let context_data = self
                .tie_break
                .pick(&group.context_rows, rng)
                .and_then(|row| row.field_text.clone());

            let document_id = match self.tie_break.pick(&group.doc_ids_rows, rng) {
                Some(row) => match select_document_id(row) {
                    Ok(document_id) => Some(document_id),
                    Err(err) => {
                        warn!(
                            event = "doc_ids_unusable",
                            proc_inst_id = %process_instance_id,
                            error = %err
                        );
                        report.payload_warnings += 1;
                        None
                    }
                },
                None => None,
            };

            if group.context_rows.len() > 1 || group.doc_ids_rows.len() > 1 {
                debug!(
                    event = "duplicate_fields",
                    proc_inst_id = %process_instance_id,
                    context_rows = group.context_rows.len(),
                    doc_ids_rows = group.doc_ids_rows.len(),
                    tie_break = %self.tie_break
                );
            }

            report.with_document_id += usize::from(document_id.is_some());
            report.with_context_data += usize::from(context_data.is_some());
            records.push(NormalizedRecord {
                document_id,
                process_instance_id: process_instance_id.to_string(),
                context_data,
                event_time: group.latest,
            });
        }

        report.records = records.len();
        TransformOutput { records, report }
    }
}

fn select_document_id(row: &RawAuditRow) -> Result<String, DocIdsError> {
    let payload = row
        .field_text
        .as_deref()
        .ok_or(DocIdsError::MissingPayload)?;
    extract_document_id(payload)
}
