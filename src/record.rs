//! CSV row to document transformation.
//!
//! Rows are matched to manifest columns by position only. The header row of
//! every report is consumed and discarded without being compared to the
//! column names.

use std::collections::BTreeMap;

use csv_async::{AsyncReaderBuilder, StringRecord};
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::manifest::{Column, ColumnType};
use crate::sink::SinkClosed;

/// A single field value: the raw text, or a range for interval columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Range { gte: String, lte: String },
}

/// category -> name -> value
pub type Document = BTreeMap<String, BTreeMap<String, FieldValue>>;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("interval value {0:?} is not of the form <start>/<end>")]
    Interval(String),
    #[error("row has {fields} fields but the manifest lists {columns} columns")]
    ColumnCount { fields: usize, columns: usize },
    #[error(transparent)]
    Csv(#[from] csv_async::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Sink(#[from] SinkClosed),
}

/// Split an interval into its two bounds. Exactly one `/` is allowed.
pub fn parse_interval(raw: &str) -> Result<FieldValue, RecordError> {
    match raw.split_once('/') {
        Some((gte, lte)) if !lte.contains('/') => Ok(FieldValue::Range {
            gte: gte.to_string(),
            lte: lte.to_string(),
        }),
        _ => Err(RecordError::Interval(raw.to_string())),
    }
}

/// Turn one data row into a document. Empty fields are left out entirely;
/// values are not coerced, the index mapping types them on write.
pub fn transform<'a, I>(fields: I, columns: &[Column]) -> Result<Document, RecordError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut doc = Document::new();
    for (i, data) in fields.into_iter().enumerate() {
        let column = columns.get(i).ok_or(RecordError::ColumnCount {
            fields: i + 1,
            columns: columns.len(),
        })?;
        if data.is_empty() {
            continue;
        }
        let value = match column.normalized_type() {
            ColumnType::Interval => parse_interval(data)?,
            _ => FieldValue::Text(data.to_string()),
        };
        doc.entry(column.normalized_category().to_string())
            .or_default()
            .insert(column.normalized_name().to_string(), value);
    }
    Ok(doc)
}

/// Stream every data row of a decoded report through `transform`, handing
/// each document to `sink`. Stops at the first bad row. Returns the number
/// of documents produced.
pub async fn for_each_document<R, F, Fut>(
    reader: R,
    columns: &[Column],
    mut sink: F,
) -> Result<usize, RecordError>
where
    R: AsyncRead + Unpin + Send,
    F: FnMut(Document) -> Fut,
    Fut: std::future::Future<Output = Result<(), RecordError>>,
{
    let mut rdr = AsyncReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .buffer_capacity(1 << 20) // 1 MiB
        .create_reader(reader);

    let mut count = 0usize;
    let mut record = StringRecord::new();
    while rdr.read_record(&mut record).await? {
        let doc = transform(record.iter(), columns)?;
        sink(doc).await?;
        count += 1;
    }
    Ok(count)
}
