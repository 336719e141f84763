#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_compression::tokio::write::GzipEncoder;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use usage_ingest::{
    BulkItem, BulkOutcome, DocumentIndex, IndexError, LocalReportStore, Manifest, ReportStore,
    StoreError,
};

/// Index operations observed by [`MemoryIndex`], in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Create(String),
    Delete(String),
    Put(String, String),
}

#[derive(Default)]
struct State {
    indices: BTreeMap<String, Value>,
    docs: BTreeMap<String, Vec<Value>>,
    records: BTreeMap<(String, String), Value>,
    ops: Vec<Op>,
}

/// In-memory stand-in for Elasticsearch.
#[derive(Default)]
pub struct MemoryIndex {
    state: Mutex<State>,
    reject_bulk: AtomicBool,
    reject_records: AtomicBool,
}

impl MemoryIndex {
    pub fn rejecting_bulk() -> Self {
        let index = Self::default();
        index.reject_bulk.store(true, Ordering::SeqCst);
        index
    }

    /// Accepts documents but fails every metadata record write.
    pub fn rejecting_record_writes() -> Self {
        let index = Self::default();
        index.reject_records.store(true, Ordering::SeqCst);
        index
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn index_body(&self, name: &str) -> Option<Value> {
        self.state.lock().unwrap().indices.get(name).cloned()
    }

    pub fn documents(&self, index: &str) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .docs
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    pub fn record(&self, index: &str, id: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(&(index.to_string(), id.to_string()))
            .cloned()
    }

    /// Seed a metadata record without it showing up in `ops`.
    pub fn seed_record(&self, index: &str, id: &str, body: Value) {
        self.state
            .lock()
            .unwrap()
            .records
            .insert((index.to_string(), id.to_string()), body);
    }

    pub fn seed_index(&self, name: &str, docs: Vec<Value>) {
        let mut state = self.state.lock().unwrap();
        state.indices.insert(name.to_string(), json!({}));
        state.docs.insert(name.to_string(), docs);
    }
}

#[async_trait]
impl DocumentIndex for MemoryIndex {
    async fn index_exists(&self, name: &str) -> Result<bool, IndexError> {
        Ok(self.state.lock().unwrap().indices.contains_key(name))
    }

    async fn delete_index(&self, name: &str) -> Result<(), IndexError> {
        let mut state = self.state.lock().unwrap();
        state.indices.remove(name);
        state.docs.remove(name);
        state.ops.push(Op::Delete(name.to_string()));
        Ok(())
    }

    async fn create_index(&self, name: &str, body: &Value) -> Result<(), IndexError> {
        let mut state = self.state.lock().unwrap();
        if state.indices.contains_key(name) {
            return Err(IndexError::Status {
                method: "PUT",
                url: name.to_string(),
                status: 400,
                body: "resource_already_exists_exception".into(),
            });
        }
        state.indices.insert(name.to_string(), body.clone());
        state.ops.push(Op::Create(name.to_string()));
        Ok(())
    }

    async fn bulk(&self, items: &[BulkItem]) -> Result<BulkOutcome, IndexError> {
        if self.reject_bulk.load(Ordering::SeqCst) {
            return Ok(BulkOutcome {
                failed: (0..items.len()).collect(),
                first_error: Some("es_rejected_execution_exception".into()),
            });
        }
        let mut state = self.state.lock().unwrap();
        for item in items {
            let doc: Value = serde_json::from_str(&item.source)?;
            state.docs.entry(item.index.clone()).or_default().push(doc);
        }
        Ok(BulkOutcome::default())
    }

    async fn get_field(
        &self,
        index: &str,
        id: &str,
        field: &str,
    ) -> Result<Option<String>, IndexError> {
        Ok(self
            .record(index, id)
            .and_then(|doc| doc[field].as_str().map(str::to_string)))
    }

    async fn put_document(&self, index: &str, id: &str, body: &Value) -> Result<(), IndexError> {
        if self.reject_records.load(Ordering::SeqCst) {
            return Err(IndexError::Status {
                method: "PUT",
                url: format!("{index}/_doc/{id}"),
                status: 503,
                body: "cluster_block_exception".into(),
            });
        }
        let mut state = self.state.lock().unwrap();
        state
            .records
            .insert((index.to_string(), id.to_string()), body.clone());
        state.ops.push(Op::Put(index.to_string(), id.to_string()));
        Ok(())
    }
}

/// Local store with hooks: delays before listing or manifest reads, and a
/// token cancelled right after reports are downloaded.
pub struct HookedStore {
    inner: LocalReportStore,
    pub listing_delay: Option<Duration>,
    pub manifest_delay: Option<Duration>,
    pub cancel_after_download: Option<CancellationToken>,
}

impl HookedStore {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: LocalReportStore::new(root, "cur"),
            listing_delay: None,
            manifest_delay: None,
            cancel_after_download: None,
        }
    }
}

#[async_trait]
impl ReportStore for HookedStore {
    async fn periods(&self) -> Result<Vec<String>, StoreError> {
        if let Some(delay) = self.listing_delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.periods().await
    }

    async fn manifest_for_period(&self, period: &str) -> Result<Manifest, StoreError> {
        if let Some(delay) = self.manifest_delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.manifest_for_period(period).await
    }

    async fn reports_for_manifest(&self, manifest: &Manifest) -> Result<Vec<Bytes>, StoreError> {
        let reports = self.inner.reports_for_manifest(manifest).await?;
        if let Some(cancel) = &self.cancel_after_download {
            cancel.cancel();
        }
        Ok(reports)
    }
}

pub async fn gzip(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut encoder = GzipEncoder::new(Vec::new());
    encoder.write_all(data).await?;
    encoder.shutdown().await?;
    Ok(encoder.into_inner())
}

/// Lay out one billing period under `root/cur/`: a manifest naming
/// `report_id` plus one gzip CSV per entry of `files`.
pub async fn write_period(
    root: &Path,
    period: &str,
    report_id: &str,
    files: &[&str],
) -> anyhow::Result<()> {
    let dir = root.join("cur").join(period);
    std::fs::create_dir_all(dir.join(report_id))?;

    let mut keys = Vec::new();
    for (i, csv) in files.iter().enumerate() {
        let key = format!("cur/{period}/{report_id}/usage-{}.csv.gz", i + 1);
        std::fs::write(root.join(&key), gzip(csv.as_bytes()).await?)?;
        keys.push(key);
    }

    let (start, end) = period.split_once('-').unwrap_or((period, period));
    let manifest = json!({
        "reportId": report_id,
        "reportName": "usage",
        "billingPeriod": {
            "start": format!("{start}T000000.000Z"),
            "end": format!("{end}T000000.000Z"),
        },
        "columns": [
            {"category": "identity", "name": "TimeInterval", "type": "Interval"},
            {"category": "lineItem", "name": "UsageAccountId", "type": "String"},
            {"category": "lineItem", "name": "UnblendedCost", "type": "OptionalBigDecimal"},
            {"category": "resourceTags", "name": "user:Team", "type": "String"},
        ],
        "reportKeys": keys,
        "compression": "GZIP",
        "contentType": "text/csv",
    });
    std::fs::write(
        dir.join("usage-Manifest.json"),
        serde_json::to_vec_pretty(&manifest)?,
    )?;
    Ok(())
}

pub const HEADER: &str =
    "identity/TimeInterval,lineItem/UsageAccountId,lineItem/UnblendedCost,resourceTags/user:Team\n";
