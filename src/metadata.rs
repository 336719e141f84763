use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use tracing::info;

use crate::index::{DocumentIndex, IndexError};
use crate::schema::metadata_index_body;

const REPORT_ID_FIELD: &str = "report_id";

/// Remembers, per billing period, which report snapshot was last indexed.
/// One document per period, keyed by the period identifier.
#[derive(Clone)]
pub struct MetadataTracker {
    index: Arc<dyn DocumentIndex>,
    name: String,
}

impl MetadataTracker {
    pub fn new(index: Arc<dyn DocumentIndex>, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
        }
    }

    pub fn index_name(&self) -> &str {
        &self.name
    }

    /// Create the metadata index unless it already exists.
    pub async fn ensure_index(&self) -> Result<(), IndexError> {
        if self.index.index_exists(&self.name).await? {
            return Ok(());
        }
        info!(index = %self.name, "Creating metadata index");
        self.index
            .create_index(&self.name, &metadata_index_body())
            .await
    }

    /// Last indexed report id for `period`, `None` if never ingested.
    pub async fn get(&self, period: &str) -> Result<Option<String>, IndexError> {
        self.index
            .get_field(&self.name, period, REPORT_ID_FIELD)
            .await
    }

    /// Overwrite the record for `period`.
    pub async fn set(
        &self,
        period: &str,
        report_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), IndexError> {
        let body = json!({
            REPORT_ID_FIELD: report_id,
            "last_update": at.to_rfc3339_opts(SecondsFormat::Secs, true),
        });
        self.index.put_document(&self.name, period, &body).await
    }
}
