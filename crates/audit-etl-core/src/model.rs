use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldName {
    #[serde(rename = "contextData")]
    ContextData,
    #[serde(rename = "docIds")]
    DocIds,
}

impl FieldName {
    pub const ALL: [FieldName; 2] = [FieldName::ContextData, FieldName::DocIds];

    pub fn as_str(self) -> &'static str {
        match self {
            FieldName::ContextData => "contextData",
            FieldName::DocIds => "docIds",
        }
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldName {
    type Err = String;

    // Field names are matched exactly, the source filters on the literal values.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "contextData" => Ok(FieldName::ContextData),
            "docIds" => Ok(FieldName::DocIds),
            other => Err(format!("Unknown field name: {other}")),
        }
    }
}

/// One audit-log entry for a process instance, as read back from the artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAuditRow {
    pub process_instance_id: String,
    pub field_name: FieldName,
    pub field_text: Option<String>,
    pub event_time: NaiveDateTime,
}

/// One record per process instance, shaped like a row of the target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    #[serde(rename = "doc_id")]
    pub document_id: Option<String>,
    #[serde(rename = "proc_inst_id_")]
    pub process_instance_id: String,
    #[serde(rename = "contextData")]
    pub context_data: Option<String>,
    #[serde(rename = "time_")]
    pub event_time: Option<NaiveDateTime>,
}

impl NormalizedRecord {
    /// Borrows the record as insertable, or names the first required column it lacks.
    ///
    /// `event_time` is not required. An empty process instance id counts as missing.
    pub fn complete(&self) -> Result<CompleteRecord<'_>, RequiredField> {
        let document_id = self
            .document_id
            .as_deref()
            .ok_or(RequiredField::DocumentId)?;
        if self.process_instance_id.is_empty() {
            return Err(RequiredField::ProcessInstanceId);
        }
        let context_data = self
            .context_data
            .as_deref()
            .ok_or(RequiredField::ContextData)?;

        Ok(CompleteRecord {
            document_id,
            process_instance_id: &self.process_instance_id,
            context_data,
            event_time: self.event_time,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompleteRecord<'a> {
    pub document_id: &'a str,
    pub process_instance_id: &'a str,
    pub context_data: &'a str,
    pub event_time: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredField {
    DocumentId,
    ProcessInstanceId,
    ContextData,
}

impl RequiredField {
    pub fn as_str(self) -> &'static str {
        match self {
            RequiredField::DocumentId => "doc_id",
            RequiredField::ProcessInstanceId => "proc_inst_id_",
            RequiredField::ContextData => "contextData",
        }
    }
}

impl fmt::Display for RequiredField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Short per-run identifier, used in the artifact name and in log lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId(String);

impl RunId {
    pub fn new() -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(8);
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
