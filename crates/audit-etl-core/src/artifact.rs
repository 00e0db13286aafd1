use crate::model::{FieldName, RawAuditRow, RunId};
use chrono::{NaiveDate, NaiveDateTime};
use encoding_rs::WINDOWS_1251;
use serde::Deserialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ARTIFACT_DELIMITER: u8 = b';';
pub const ARTIFACT_HEADER: [&str; 4] = ["proc_inst_id_", "text_", "name_", "time_"];

const TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("read artifact {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("artifact {path} is not valid windows-1251 text")]
    Encoding { path: PathBuf },
    #[error("malformed csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("line {line}: unknown field name `{name}`")]
    UnknownField { line: u64, name: String },
    #[error("line {line}: invalid timestamp `{value}`")]
    Timestamp { line: u64, value: String },
}

pub fn artifact_file_name(date: NaiveDate, run_id: &RunId) -> String {
    format!("data_{}_{}.csv", date.format("%Y-%m-%d"), run_id)
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMATS[0]).to_string()
}

pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
}

/// Writes audit rows in the artifact CSV dialect (still UTF-8).
pub struct AuditCsvWriter<W: Write> {
    inner: csv::Writer<W>,
}

impl<W: Write> AuditCsvWriter<W> {
    pub fn new(sink: W) -> Result<Self, csv::Error> {
        let mut inner = csv::WriterBuilder::new()
            .delimiter(ARTIFACT_DELIMITER)
            .from_writer(sink);
        inner.write_record(ARTIFACT_HEADER)?;
        Ok(Self { inner })
    }

    pub fn write_row(
        &mut self,
        process_instance_id: &str,
        field_text: Option<&str>,
        field_name: &str,
        event_time: &NaiveDateTime,
    ) -> Result<(), csv::Error> {
        let event_time = format_timestamp(event_time);
        self.inner.write_record([
            process_instance_id,
            field_text.unwrap_or_default(),
            field_name,
            event_time.as_str(),
        ])
    }

    pub fn finish(mut self) -> Result<(), csv::Error> {
        self.inner.flush()?;
        Ok(())
    }
}

/// Transcodes a UTF-8 byte stream into Windows-1251.
///
/// Multi-byte sequences split across writes are carried over. Characters with
/// no Windows-1251 mapping fail the write instead of being replaced.
pub struct Cp1251Writer<W: Write> {
    inner: W,
    pending: Vec<u8>,
}

impl<W: Write> Cp1251Writer<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    pub fn finish(mut self) -> io::Result<W> {
        if !self.pending.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "stream ended inside a utf-8 sequence",
            ));
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for Cp1251Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        let complete = match std::str::from_utf8(&self.pending) {
            Ok(text) => text.len(),
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            Err(err) => return Err(io::Error::new(io::ErrorKind::InvalidData, err)),
        };
        let text = std::str::from_utf8(&self.pending[..complete])
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        let (encoded, _, unmappable) = WINDOWS_1251.encode(text);
        if unmappable {
            let offending = text
                .chars()
                .find(|ch| WINDOWS_1251.encode(ch.encode_utf8(&mut [0; 4])).2)
                .unwrap_or(char::REPLACEMENT_CHARACTER);
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("character {offending:?} has no windows-1251 mapping"),
            ));
        }
        self.inner.write_all(&encoded)?;
        self.pending.drain(..complete);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Debug, Deserialize)]
struct ArtifactLine {
    proc_inst_id_: String,
    text_: Option<String>,
    name_: String,
    time_: String,
}

/// Decodes a Windows-1251 artifact (header `proc_inst_id_;text_;name_;time_`,
/// `;` delimiter) back into raw rows.
pub fn read_artifact(path: &Path) -> Result<Vec<RawAuditRow>, ArtifactError> {
    let bytes = fs::read(path).map_err(|source| ArtifactError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let text = WINDOWS_1251
        .decode_without_bom_handling_and_without_replacement(&bytes)
        .ok_or_else(|| ArtifactError::Encoding {
            path: path.to_path_buf(),
        })?;
    parse_artifact(&text)
}

pub fn parse_artifact(text: &str) -> Result<Vec<RawAuditRow>, ArtifactError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(ARTIFACT_DELIMITER)
        .has_headers(true)
        .from_reader(text.as_bytes());
    let headers = reader.headers()?.clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let line = record.position().map(|pos| pos.line()).unwrap_or_default();
        let parsed: ArtifactLine = record.deserialize(Some(&headers))?;

        let field_name = parsed
            .name_
            .parse::<FieldName>()
            .map_err(|_| ArtifactError::UnknownField {
                line,
                name: parsed.name_.clone(),
            })?;
        let event_time = parse_timestamp(&parsed.time_).ok_or_else(|| ArtifactError::Timestamp {
            line,
            value: parsed.time_.clone(),
        })?;

        rows.push(RawAuditRow {
            process_instance_id: parsed.proc_inst_id_,
            field_name,
            field_text: parsed.text_,
            event_time,
        });
    }
    Ok(rows)
}
