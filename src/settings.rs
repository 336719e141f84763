//! Settings resolved once at startup and passed down explicitly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;

use crate::sink::BulkOptions;
use crate::{IngestError, IngestResult};

const ENV_PREFIX: &str = "USAGE";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub es: EsSettings,
    pub store: StoreSettings,
    pub s3: S3Settings,
    pub ingest: IngestSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EsSettings {
    pub server: String,
    pub report_index_prefix: String,
    pub metadata_index: String,
    pub indexing_workers: usize,
    pub bulk_actions: usize,
    pub report_shards: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    S3,
    Local,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    pub kind: StoreKind,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Settings {
    pub bucket: Option<String>,
    #[serde(default)]
    pub prefix: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestSettings {
    pub period_concurrency: usize,
    pub file_concurrency: usize,
    pub request_timeout_secs: u64,
    pub channel_capacity: usize,
}

impl IngestSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Settings {
    /// Defaults, then the standard config locations, then `explicit` (which
    /// must exist when given), then `USAGE_*` environment variables
    /// (`__` separates nesting levels, e.g. `USAGE_S3__BUCKET`).
    pub fn load(explicit: Option<&Path>) -> IngestResult<Self> {
        let mut builder = defaults()?;
        for candidate in search_paths() {
            builder = builder.add_source(File::with_name(&candidate).required(false));
        }
        if let Some(path) = explicit {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        finish(builder)
    }

    /// Defaults overlaid with a single file, nothing else.
    pub fn from_file(path: &Path) -> IngestResult<Self> {
        finish(defaults()?.add_source(File::from(path).required(true)))
    }

    pub fn bulk_options(&self) -> BulkOptions {
        BulkOptions {
            bulk_actions: self.es.bulk_actions,
            workers: self.es.indexing_workers,
            capacity: self.ingest.channel_capacity,
        }
    }

    fn validate(&self) -> IngestResult<()> {
        match self.store.kind {
            StoreKind::S3 if self.s3.bucket.as_deref().map_or(true, str::is_empty) => {
                return Err(IngestError::InvalidConfig("no S3 bucket name set (s3.bucket)".into()));
            }
            StoreKind::Local if self.store.path.is_none() => {
                return Err(IngestError::InvalidConfig(
                    "local store needs a root directory (store.path)".into(),
                ));
            }
            _ => {}
        }
        let positive = [
            ("es.indexing_workers", self.es.indexing_workers),
            ("es.bulk_actions", self.es.bulk_actions),
            ("ingest.period_concurrency", self.ingest.period_concurrency),
            ("ingest.file_concurrency", self.ingest.file_concurrency),
            ("ingest.channel_capacity", self.ingest.channel_capacity),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(IngestError::InvalidConfig(format!("{key} must be greater than zero")));
        }
        if self.ingest.request_timeout_secs == 0 {
            return Err(IngestError::InvalidConfig(
                "ingest.request_timeout_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn defaults() -> IngestResult<ConfigBuilder<DefaultState>> {
    Ok(Config::builder()
        .set_default("es.server", "http://localhost:9200")?
        .set_default("es.report_index_prefix", "billing")?
        .set_default("es.metadata_index", "aws-usage-metadata")?
        .set_default("es.indexing_workers", 2)?
        .set_default("es.bulk_actions", 1000)?
        .set_default("es.report_shards", 3)?
        .set_default("store.kind", "s3")?
        .set_default("s3.prefix", "")?
        .set_default("ingest.period_concurrency", 4)?
        .set_default("ingest.file_concurrency", 4)?
        .set_default("ingest.request_timeout_secs", 120)?
        .set_default("ingest.channel_capacity", 10_000)?)
}

fn search_paths() -> Vec<String> {
    let mut paths = vec!["/etc/aws-usage/config".to_string()];
    if let Some(home) = std::env::var_os("HOME") {
        paths.push(
            Path::new(&home)
                .join(".aws-usage/config")
                .to_string_lossy()
                .into_owned(),
        );
    }
    paths.push("config".to_string());
    paths
}

fn finish(builder: ConfigBuilder<DefaultState>) -> IngestResult<Settings> {
    let settings: Settings = builder.build()?.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}
