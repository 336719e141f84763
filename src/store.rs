//! Where reports come from: an S3 bucket, or the same layout on local disk.
//!
//! Layout under the configured prefix:
//!
//! ```text
//! <prefix><period>/<report-name>-Manifest.json
//! <prefix><period>/<snapshot>/<report files>   (paths listed in the manifest)
//! ```

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::future::try_join_all;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::manifest::Manifest;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{op} s3://{bucket}/{key}: {message}")]
    S3 {
        op: &'static str,
        bucket: String,
        key: String,
        message: String,
    },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{op} timed out after {after:?}")]
    TimedOut { op: &'static str, after: Duration },
    #[error("report manifest not found under {0}")]
    ManifestNotFound(String),
    #[error("invalid manifest {key}: {source}")]
    Manifest {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Billing periods with reports, sorted.
    async fn periods(&self) -> Result<Vec<String>, StoreError>;

    /// The manifest of the newest snapshot for `period`.
    async fn manifest_for_period(&self, period: &str) -> Result<Manifest, StoreError>;

    /// Raw bytes of every report file of `manifest`, in `report_keys` order.
    async fn reports_for_manifest(&self, manifest: &Manifest) -> Result<Vec<Bytes>, StoreError>;
}

/// Strip a leading `/` and make sure a non-empty prefix ends in `/`.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

fn parse_manifest(key: &str, bytes: &[u8]) -> Result<Manifest, StoreError> {
    Manifest::from_slice(bytes).map_err(|source| StoreError::Manifest {
        key: key.to_string(),
        source,
    })
}

pub struct S3ReportStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3ReportStore {
    pub fn new(client: Client, bucket: impl Into<String>, prefix: &str) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: normalize_prefix(prefix),
        }
    }

    /// Build a client from the ambient AWS configuration, with optional
    /// region and endpoint overrides.
    pub async fn connect(
        bucket: impl Into<String>,
        prefix: &str,
        region: Option<String>,
        endpoint: Option<String>,
    ) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self::new(Client::from_conf(builder.build()), bucket, prefix)
    }

    fn s3_error(&self, op: &'static str, key: &str, err: impl std::error::Error) -> StoreError {
        StoreError::S3 {
            op,
            bucket: self.bucket.clone(),
            key: key.to_string(),
            message: DisplayErrorContext(err).to_string(),
        }
    }

    async fn download(&self, key: &str) -> Result<Bytes, StoreError> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.s3_error("get", key, e))?;
        let data = object
            .body
            .collect()
            .await
            .map_err(|e| self.s3_error("read", key, e))?
            .into_bytes();
        debug!(key, bytes = data.len(), "Downloaded object");
        Ok(data)
    }
}

#[async_trait]
impl ReportStore for S3ReportStore {
    #[instrument(skip(self))]
    async fn periods(&self) -> Result<Vec<String>, StoreError> {
        let res = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&self.prefix)
            .delimiter("/")
            .send()
            .await
            .map_err(|e| self.s3_error("list", &self.prefix, e))?;
        let mut periods: Vec<String> = res
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix())
            .filter_map(|p| p.strip_prefix(self.prefix.as_str()))
            .map(|p| p.trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .collect();
        periods.sort();
        periods.dedup();
        Ok(periods)
    }

    #[instrument(skip(self))]
    async fn manifest_for_period(&self, period: &str) -> Result<Manifest, StoreError> {
        let dir = format!("{}{}/", self.prefix, period);
        let res = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&dir)
            .delimiter("/")
            .send()
            .await
            .map_err(|e| self.s3_error("list", &dir, e))?;
        let key = res
            .contents()
            .iter()
            .filter_map(|o| o.key())
            .find(|k| k.ends_with(".json"))
            .map(str::to_string)
            .ok_or_else(|| StoreError::ManifestNotFound(format!("s3://{}/{}", self.bucket, dir)))?;
        let bytes = self.download(&key).await?;
        parse_manifest(&key, &bytes)
    }

    #[instrument(skip(self, manifest), fields(report_id = %manifest.report_id))]
    async fn reports_for_manifest(&self, manifest: &Manifest) -> Result<Vec<Bytes>, StoreError> {
        try_join_all(manifest.report_keys.iter().map(|key| self.download(key))).await
    }
}

/// The bucket layout mirrored on local disk. Report keys resolve against
/// `root`, periods are listed under `root/prefix`.
pub struct LocalReportStore {
    root: PathBuf,
    prefix: String,
}

impl LocalReportStore {
    pub fn new(root: impl Into<PathBuf>, prefix: &str) -> Self {
        Self {
            root: root.into(),
            prefix: normalize_prefix(prefix),
        }
    }

    fn io_error(path: PathBuf) -> impl FnOnce(std::io::Error) -> StoreError {
        move |source| StoreError::Io { path, source }
    }

    async fn read_dir_names(&self, dir: PathBuf, dirs: bool) -> Result<Vec<String>, StoreError> {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(Self::io_error(dir.clone()))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(Self::io_error(dir.clone()))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(Self::io_error(entry.path()))?;
            if file_type.is_dir() == dirs {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl ReportStore for LocalReportStore {
    async fn periods(&self) -> Result<Vec<String>, StoreError> {
        self.read_dir_names(self.root.join(&self.prefix), true).await
    }

    async fn manifest_for_period(&self, period: &str) -> Result<Manifest, StoreError> {
        let dir = self.root.join(&self.prefix).join(period);
        let name = self
            .read_dir_names(dir.clone(), false)
            .await?
            .into_iter()
            .find(|n| n.ends_with(".json"))
            .ok_or_else(|| StoreError::ManifestNotFound(dir.display().to_string()))?;
        let path = dir.join(&name);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(Self::io_error(path.clone()))?;
        parse_manifest(&path.display().to_string(), &bytes)
    }

    async fn reports_for_manifest(&self, manifest: &Manifest) -> Result<Vec<Bytes>, StoreError> {
        try_join_all(manifest.report_keys.iter().map(|key| async move {
            let path = self.root.join(key.trim_start_matches('/'));
            tokio::fs::read(&path)
                .await
                .map(Bytes::from)
                .map_err(Self::io_error(path))
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_normalization() {
        assert_eq!(normalize_prefix("/reports/cur"), "reports/cur/");
        assert_eq!(normalize_prefix("reports/"), "reports/");
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
    }

    #[tokio::test]
    async fn local_store_lists_periods_and_finds_manifest() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let period = dir.path().join("cur/20210101-20210201");
        std::fs::create_dir_all(period.join("snap-1"))?;
        std::fs::create_dir_all(dir.path().join("cur/20210201-20210301"))?;
        std::fs::write(period.join("notes.txt"), "ignored")?;
        std::fs::write(
            period.join("hourly-Manifest.json"),
            r#"{"reportId":"snap-1",
                "billingPeriod":{"start":"20210101T000000.000Z","end":"20210201T000000.000Z"},
                "columns":[],"reportKeys":["cur/20210101-20210201/snap-1/part-1.csv"]}"#,
        )?;
        std::fs::write(period.join("snap-1/part-1.csv"), "h\n")?;

        let store = LocalReportStore::new(dir.path(), "/cur");
        assert_eq!(
            store.periods().await?,
            vec!["20210101-20210201".to_string(), "20210201-20210301".to_string()]
        );
        let manifest = store.manifest_for_period("20210101-20210201").await?;
        assert_eq!(manifest.report_id, "snap-1");
        let reports = store.reports_for_manifest(&manifest).await?;
        assert_eq!(reports, vec![Bytes::from_static(b"h\n")]);

        let missing = store.manifest_for_period("20210201-20210301").await;
        assert!(matches!(missing, Err(StoreError::ManifestNotFound(_))));
        Ok(())
    }
}
