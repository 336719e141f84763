//! Cost and usage report ingestion into Elasticsearch.
//!
//! - Reports: gzip (or zstd) CSV files described by a JSON manifest, one
//!   manifest per billing period, read from S3 or a local mirror.
//! - Index: one index per billing period, named from the period dates, plus a
//!   small metadata index remembering the last ingested report id per period.
//!
//! Data shape:
//! - `Manifest { report_id, billing_period, columns, report_keys, .. }`
//! - Documents: `{ <category>: { <name>: value | {gte, lte} } }`, snake_cased
//!   from the manifest's camelCase column identifiers.
//
mod codec;
pub mod index;
pub mod io;
pub mod logging;
pub mod manifest;
pub mod metadata;
pub mod processor;
pub mod record;
pub mod schema;
pub mod settings;
pub mod sink;
pub mod store;

pub use crate::index::{BulkItem, BulkOutcome, DocumentIndex, ElasticClient, IndexError};
pub use crate::io::{build_report_reader, Compression, ReportEncoding};
pub use crate::manifest::{Column, ColumnType, Manifest};
pub use crate::metadata::MetadataTracker;
pub use crate::processor::{
    IngestStats, PeriodError, PeriodOutcome, Processor, ProcessorSettings, RunSummary,
};
pub use crate::record::{transform, Document, FieldValue, RecordError};
pub use crate::settings::Settings;
pub use crate::sink::{BulkHandle, BulkOptions, BulkSink, BulkStats, WriteTracker};
pub use crate::store::{LocalReportStore, ReportStore, S3ReportStore, StoreError};

use thiserror::Error;

/// Errors that stop a run before or instead of processing periods.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{0}")]
    Bootstrap(String),
    #[error("couldn't list report periods: {0}")]
    Listing(#[source] StoreError),
    #[error("couldn't create metadata index {index}: {source}")]
    MetadataIndex {
        index: String,
        #[source]
        source: IndexError,
    },
    #[error(transparent)]
    Index(#[from] IndexError),
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;
