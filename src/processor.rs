//! Period orchestration.
//!
//! Every billing period is handled on its own task: fetch the newest
//! manifest, compare its report id with the one recorded in the metadata
//! index, and when they differ drop and recreate the period's index, re-read
//! every report file and record the new id once all writes are acknowledged.
//! A failure only ends the period (or file) it happened in.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::index::{DocumentIndex, IndexError};
use crate::io::{build_report_reader, ReportEncoding};
use crate::manifest::Manifest;
use crate::metadata::MetadataTracker;
use crate::record::{for_each_document, RecordError};
use crate::schema;
use crate::settings::Settings;
use crate::sink::{BulkHandle, BulkOptions, BulkSink, BulkStats, WriteTracker};
use crate::store::{ReportStore, StoreError};
use crate::{IngestError, IngestResult};

/// Why a period ended in the failed state.
#[derive(Debug, Error)]
pub enum PeriodError {
    #[error("couldn't download manifest: {0}")]
    Manifest(#[source] StoreError),
    #[error("couldn't get previous report id: {0}")]
    MetadataRead(#[source] IndexError),
    #[error("couldn't recreate index: {0}")]
    Schema(#[source] IndexError),
    #[error("couldn't download reports: {0}")]
    Download(#[source] StoreError),
    #[error("{failed} documents were not written")]
    BulkWrite { failed: usize },
    #[error("couldn't set report id: {0}")]
    MetadataWrite(#[source] IndexError),
    #[error("{op} timed out after {after:?}")]
    TimedOut { op: &'static str, after: Duration },
    #[error("cancelled")]
    Cancelled,
    #[error("period task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub files: usize,
    pub files_failed: usize,
    pub documents: usize,
}

#[derive(Debug)]
pub enum PeriodOutcome {
    /// The stored report id matched the manifest; nothing was touched.
    Skipped,
    Ingested(IngestStats),
    Failed(PeriodError),
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub periods: Vec<(String, PeriodOutcome)>,
    pub bulk: BulkStats,
}

impl RunSummary {
    pub fn outcome(&self, period: &str) -> Option<&PeriodOutcome> {
        self.periods
            .iter()
            .find(|(p, _)| p == period)
            .map(|(_, o)| o)
    }

    pub fn ingested(&self) -> usize {
        self.count(|o| matches!(o, PeriodOutcome::Ingested(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, PeriodOutcome::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, PeriodOutcome::Failed(_)))
    }

    fn count(&self, pred: impl Fn(&PeriodOutcome) -> bool) -> usize {
        self.periods.iter().filter(|(_, o)| pred(o)).count()
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub index_prefix: String,
    pub metadata_index: String,
    pub report_shards: u32,
    pub period_concurrency: usize,
    pub file_concurrency: usize,
    /// Upper bound for each store or index call made while processing a period.
    pub request_timeout: Duration,
    pub bulk: BulkOptions,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            index_prefix: "billing".to_string(),
            metadata_index: "aws-usage-metadata".to_string(),
            report_shards: 3,
            period_concurrency: 4,
            file_concurrency: 4,
            request_timeout: Duration::from_secs(120),
            bulk: BulkOptions::default(),
        }
    }
}

impl From<&Settings> for ProcessorSettings {
    fn from(s: &Settings) -> Self {
        Self {
            index_prefix: s.es.report_index_prefix.clone(),
            metadata_index: s.es.metadata_index.clone(),
            report_shards: s.es.report_shards,
            period_concurrency: s.ingest.period_concurrency,
            file_concurrency: s.ingest.file_concurrency,
            request_timeout: s.ingest.request_timeout(),
            bulk: s.bulk_options(),
        }
    }
}

pub struct Processor {
    shared: Arc<Shared>,
    sink: BulkSink,
}

struct Shared {
    store: Arc<dyn ReportStore>,
    index: Arc<dyn DocumentIndex>,
    metadata: MetadataTracker,
    bulk: BulkHandle,
    settings: ProcessorSettings,
    cancel: CancellationToken,
}

impl Processor {
    /// Starts the bulk sink right away; it is drained at the end of `run`.
    pub fn new(
        store: Arc<dyn ReportStore>,
        index: Arc<dyn DocumentIndex>,
        settings: ProcessorSettings,
        cancel: CancellationToken,
    ) -> Self {
        let sink = BulkSink::start(Arc::clone(&index), settings.bulk);
        let metadata = MetadataTracker::new(Arc::clone(&index), settings.metadata_index.clone());
        let shared = Arc::new(Shared {
            store,
            index,
            metadata,
            bulk: sink.handle(),
            settings,
            cancel,
        });
        Self { shared, sink }
    }

    /// Process every listed period, or only those in `only` when it is not
    /// empty. Errors are limited to listing periods and preparing the
    /// metadata index; per-period failures are reported in the summary.
    pub async fn run(self, only: &[String]) -> IngestResult<RunSummary> {
        let Processor { shared, sink } = self;
        let started = Instant::now();

        let result = prepare(&shared, only).await;
        let periods = match result {
            Ok(periods) => periods,
            Err(e) => {
                drop(shared);
                sink.close().await;
                return Err(e);
            }
        };

        let concurrency = shared.settings.period_concurrency.max(1);
        info!(periods = periods.len(), concurrency, "Processing periods");
        let outcomes: Vec<(String, PeriodOutcome)> = stream::iter(periods)
            .map(|period| {
                let task_shared = Arc::clone(&shared);
                let task_period = period.clone();
                let span = tracing::info_span!("period", period = %period);
                let handle = tokio::spawn(
                    async move { task_shared.process_period(&task_period).await }.instrument(span),
                );
                async move {
                    let outcome = match handle.await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!(period = %period, error = %e, "Period task failed");
                            PeriodOutcome::Failed(PeriodError::Task(e.to_string()))
                        }
                    };
                    (period, outcome)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        drop(shared);
        let bulk = sink.close().await;

        let mut summary = RunSummary {
            periods: outcomes,
            bulk,
        };
        summary.periods.sort_by(|a, b| a.0.cmp(&b.0));
        info!(
            ingested = summary.ingested(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            documents = summary.bulk.documents,
            failed_documents = summary.bulk.failed_documents,
            batches = summary.bulk.batches,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Indexing done"
        );
        Ok(summary)
    }
}

async fn prepare(shared: &Shared, only: &[String]) -> IngestResult<Vec<String>> {
    let after = shared.settings.request_timeout;
    let mut periods = tokio::time::timeout(after, shared.store.periods())
        .await
        .map_err(|_| {
            IngestError::Listing(StoreError::TimedOut {
                op: "period listing",
                after,
            })
        })?
        .map_err(IngestError::Listing)?;
    if periods.is_empty() {
        warn!(
            "No prefixes with reports were found, \
             check whether your bucket name or prefix is correct"
        );
    } else if !only.is_empty() {
        periods.retain(|p| only.contains(p));
        if periods.is_empty() {
            warn!(requested = ?only, "None of the requested periods have reports");
        }
    }
    tokio::time::timeout(after, shared.metadata.ensure_index())
        .await
        .map_err(|_| {
            IngestError::Bootstrap(format!(
                "creating metadata index timed out after {after:?}"
            ))
        })?
        .map_err(|source| IngestError::MetadataIndex {
            index: shared.metadata.index_name().to_string(),
            source,
        })?;
    Ok(periods)
}

impl Shared {
    async fn process_period(self: &Arc<Self>, period: &str) -> PeriodOutcome {
        debug!("Starting processing");
        match self.try_process_period(period).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(period, error = %e, "Period failed");
                PeriodOutcome::Failed(e)
            }
        }
    }

    async fn try_process_period(
        self: &Arc<Self>,
        period: &str,
    ) -> Result<PeriodOutcome, PeriodError> {
        let manifest = Arc::new(
            self.bounded(
                "manifest download",
                self.store.manifest_for_period(period),
                PeriodError::Manifest,
            )
            .await?,
        );
        let last = self
            .bounded("report id lookup", self.metadata.get(period), PeriodError::MetadataRead)
            .await?;
        if last.as_deref() == Some(manifest.report_id.as_str()) {
            info!(period, report_id = %manifest.report_id, "No new data for period");
            return Ok(PeriodOutcome::Skipped);
        }

        let index_name = manifest.index_name(&self.settings.index_prefix);
        self.bounded(
            "index recreation",
            self.recreate_index(&index_name, &manifest),
            PeriodError::Schema,
        )
        .await?;

        let reports = self
            .bounded(
                "report download",
                self.store.reports_for_manifest(&manifest),
                PeriodError::Download,
            )
            .await?;

        let tracker = WriteTracker::new();
        let stats = self
            .index_reports(period, &index_name, &manifest, reports, &tracker)
            .await;
        if self.cancel.is_cancelled() {
            return Err(PeriodError::Cancelled);
        }

        let failed = self
            .bounded(
                "document flush",
                async { Ok::<_, Infallible>(tracker.settled().await) },
                |never: Infallible| match never {},
            )
            .await?;
        if failed > 0 {
            return Err(PeriodError::BulkWrite { failed });
        }

        self.bounded(
            "report id update",
            self.metadata.set(period, &manifest.report_id, Utc::now()),
            PeriodError::MetadataWrite,
        )
        .await?;
        info!(
            period,
            index = %index_name,
            report_id = %manifest.report_id,
            files = stats.files,
            files_failed = stats.files_failed,
            documents = stats.documents,
            "Period indexed"
        );
        Ok(PeriodOutcome::Ingested(stats))
    }

    /// Run `fut` under the request timeout, giving up early on cancellation.
    async fn bounded<T, E, F>(
        &self,
        op: &'static str,
        fut: F,
        wrap: impl FnOnce(E) -> PeriodError,
    ) -> Result<T, PeriodError>
    where
        F: Future<Output = Result<T, E>>,
    {
        let after = self.settings.request_timeout;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PeriodError::Cancelled),
            res = tokio::time::timeout(after, fut) => match res {
                Ok(inner) => inner.map_err(wrap),
                Err(_) => Err(PeriodError::TimedOut { op, after }),
            },
        }
    }

    async fn recreate_index(&self, name: &str, manifest: &Manifest) -> Result<(), IndexError> {
        if self.index.index_exists(name).await? {
            info!(index = name, "Deleting outdated index");
            self.index.delete_index(name).await?;
        }
        let body = schema::index_body(&manifest.columns, self.settings.report_shards);
        self.index.create_index(name, &body).await
    }

    /// Index all report files of a period, `file_concurrency` at a time. A
    /// failing file is logged and counted; its siblings carry on.
    async fn index_reports(
        self: &Arc<Self>,
        period: &str,
        index_name: &str,
        manifest: &Arc<Manifest>,
        reports: Vec<Bytes>,
        tracker: &Arc<WriteTracker>,
    ) -> IngestStats {
        let files = reports.len();
        let keys = manifest.report_keys.iter().cloned();
        let results: Vec<Option<usize>> = stream::iter(keys.zip(reports))
            .map(|(key, bytes)| {
                let shared = Arc::clone(self);
                let manifest = Arc::clone(manifest);
                let tracker = Arc::clone(tracker);
                let index_name = index_name.to_string();
                let task_key = key.clone();
                debug!(period, key = %key, "Indexing csv");
                let handle = tokio::spawn(
                    async move {
                        let indexing =
                            shared.index_report(&manifest, &task_key, bytes, &index_name, &tracker);
                        tokio::select! {
                            biased;
                            _ = shared.cancel.cancelled() => None,
                            res = indexing => Some(res),
                        }
                    }
                    .in_current_span(),
                );
                async move {
                    match handle.await {
                        Ok(Some(Ok(docs))) => Some(docs),
                        Ok(Some(Err(e))) => {
                            error!(period, key = %key, error = %e, "Couldn't index report");
                            None
                        }
                        Ok(None) => {
                            warn!(period, key = %key, "Report indexing cancelled");
                            None
                        }
                        Err(e) => {
                            error!(period, key = %key, error = %e, "Report task failed");
                            None
                        }
                    }
                }
            })
            .buffer_unordered(self.settings.file_concurrency.max(1))
            .collect()
            .await;

        IngestStats {
            files,
            files_failed: results.iter().filter(|r| r.is_none()).count(),
            documents: results.iter().flatten().sum(),
        }
    }

    async fn index_report(
        &self,
        manifest: &Manifest,
        key: &str,
        bytes: Bytes,
        index_name: &str,
        tracker: &Arc<WriteTracker>,
    ) -> Result<usize, RecordError> {
        let encoding = ReportEncoding::for_report(manifest, key);
        let reader = build_report_reader(std::io::Cursor::new(bytes), &encoding);
        let bulk = &self.bulk;
        for_each_document(reader, &manifest.columns, |doc| {
            let source = serde_json::to_string(&doc);
            async move {
                bulk.add(index_name, source?, tracker).await?;
                Ok::<(), RecordError>(())
            }
        })
        .await
    }
}
