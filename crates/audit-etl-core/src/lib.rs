pub mod artifact;
pub mod config;
pub mod doc_ids;
pub mod extract;
pub mod load;
pub mod model;
pub mod pipeline;
pub mod store;
#[cfg(test)]
mod test_support;
pub mod transform;
pub mod watermark;

pub use config::{DatabaseConfig, DbRole, EtlConfig, EtlSettings, TableName};
pub use model::{CompleteRecord, FieldName, NormalizedRecord, RawAuditRow, RequiredField, RunId};
pub use pipeline::{EtlError, Pipeline, RunReport};
pub use store::{ExtractQuery, SourceStore, StoreError, TargetStore};
pub use transform::{TieBreak, Transformer};
pub use watermark::Watermark;
