use crate::model::CompleteRecord;
use crate::store::{ExtractQuery, SourceStore, StoreError, TargetStore};
use chrono::NaiveDateTime;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub doc_id: String,
    pub proc_inst_id: String,
    pub context_data: String,
    pub time: Option<NaiveDateTime>,
}

/// Target with transaction semantics, scripted failures, and a call log.
#[derive(Debug, Default)]
pub struct MemoryTarget {
    pub committed: Vec<StoredRow>,
    pub pending: Option<Vec<StoredRow>>,
    pub schema_created: usize,
    pub fail_insert_for: Option<String>,
    pub fail_max_time: bool,
    pub fail_schema: bool,
    pub calls: Vec<&'static str>,
}

impl TargetStore for MemoryTarget {
    fn ensure_schema(&mut self) -> Result<(), StoreError> {
        self.calls.push("ensure_schema");
        if self.fail_schema {
            return Err(StoreError::backend("create table", "permission denied"));
        }
        self.schema_created += 1;
        Ok(())
    }

    fn max_event_time(&mut self) -> Result<Option<NaiveDateTime>, StoreError> {
        self.calls.push("max_event_time");
        if self.fail_max_time {
            return Err(StoreError::backend("select max", "relation does not exist"));
        }
        Ok(self.committed.iter().filter_map(|row| row.time).max())
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        self.calls.push("begin");
        self.pending = Some(Vec::new());
        Ok(())
    }

    fn insert_record(&mut self, record: &CompleteRecord<'_>) -> Result<(), StoreError> {
        self.calls.push("insert");
        if self.fail_insert_for.as_deref() == Some(record.process_instance_id) {
            return Err(StoreError::backend("insert record", "value too long"));
        }
        let pending = self.pending.as_mut().ok_or(StoreError::NoTransaction)?;
        pending.push(StoredRow {
            doc_id: record.document_id.to_string(),
            proc_inst_id: record.process_instance_id.to_string(),
            context_data: record.context_data.to_string(),
            time: record.event_time,
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.calls.push("commit");
        let pending = self.pending.take().ok_or(StoreError::NoTransaction)?;
        self.committed.extend(pending);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.calls.push("rollback");
        self.pending = None;
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.calls.push("close");
        self.pending = None;
        Ok(())
    }
}

/// Source that replays a fixed UTF-8 CSV export, or fails.
#[derive(Debug, Default)]
pub struct CannedSource {
    pub csv: String,
    pub fail: bool,
    pub queries: Vec<ExtractQuery>,
}

impl SourceStore for CannedSource {
    fn export_audit_rows(
        &mut self,
        query: &ExtractQuery,
        sink: &mut dyn Write,
    ) -> Result<(), StoreError> {
        self.queries.push(query.clone());
        if self.fail {
            return Err(StoreError::backend("copy out", "canceling statement"));
        }
        sink.write_all(self.csv.as_bytes())?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-memory log sink shared between a test and its subscriber.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().map(|bytes| bytes.clone()).unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Ok(mut bytes) = self.0.lock() {
            bytes.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Runs `f` with a thread-local fmt subscriber and returns what it logged.
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let value = tracing::subscriber::with_default(subscriber, f);
    (value, buffer.contents())
}
