use serde_json::Value;
use std::borrow::Cow;
use thiserror::Error;

pub const ATTACHED_DOCUMENTS_KEY: &str = "report.AttachedDocuments";
pub const DOC_ID_KEY: &str = "doc.id";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocIdsError {
    #[error("docIds payload is null")]
    MissingPayload,
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("payload is a json {0}, expected an object")]
    NotAnObject(&'static str),
    #[error("payload has no `report.AttachedDocuments` key")]
    MissingAttachedDocuments,
    #[error("`report.AttachedDocuments` is a json {0}, expected an array")]
    AttachedDocumentsNotArray(&'static str),
    #[error("`report.AttachedDocuments` is empty")]
    NoAttachedDocuments,
    #[error("first attached document is a json {0}, expected an object")]
    FirstDocumentNotObject(&'static str),
    #[error("first attached document has no `doc.id` key")]
    MissingDocId,
    #[error("`doc.id` is a json {0}, expected a string or number")]
    UnsupportedDocId(&'static str),
}

/// Collapses the doubled quotes the upstream export uses for escaping.
pub fn normalize_doubled_quotes(text: &str) -> Cow<'_, str> {
    if text.contains("\"\"") {
        Cow::Owned(text.replace("\"\"", "\""))
    } else {
        Cow::Borrowed(text)
    }
}

/// Reads `report.AttachedDocuments[0]["doc.id"]` from a `docIds` payload.
///
/// Only the first attached document is considered. Every other shape is a
/// [`DocIdsError`]; callers log it and keep a null id.
pub fn extract_document_id(payload: &str) -> Result<String, DocIdsError> {
    let normalized = normalize_doubled_quotes(payload);
    let value: Value = serde_json::from_str(&normalized)
        .map_err(|err| DocIdsError::InvalidJson(err.to_string()))?;

    let Value::Object(root) = value else {
        return Err(DocIdsError::NotAnObject(json_kind(&value)));
    };
    let attached = root
        .get(ATTACHED_DOCUMENTS_KEY)
        .ok_or(DocIdsError::MissingAttachedDocuments)?;
    let documents = attached
        .as_array()
        .ok_or_else(|| DocIdsError::AttachedDocumentsNotArray(json_kind(attached)))?;
    let first = documents.first().ok_or(DocIdsError::NoAttachedDocuments)?;
    let first = first
        .as_object()
        .ok_or_else(|| DocIdsError::FirstDocumentNotObject(json_kind(first)))?;

    match first.get(DOC_ID_KEY) {
        Some(Value::String(id)) => Ok(id.clone()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        Some(other) => Err(DocIdsError::UnsupportedDocId(json_kind(other))),
        None => Err(DocIdsError::MissingDocId),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
