//! Document index access: the trait the pipeline talks to and its
//! Elasticsearch implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },
    #[error("unexpected response: {0}")]
    Response(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// One document to be written by a bulk request. `source` is the already
/// serialized JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItem {
    pub index: String,
    pub source: String,
}

/// Per-item result of a bulk request, in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub failed: Vec<usize>,
    /// First item error reported by the index, if any.
    pub first_error: Option<String>,
}

#[async_trait]
pub trait DocumentIndex: Send + Sync {
    async fn index_exists(&self, name: &str) -> Result<bool, IndexError>;

    async fn delete_index(&self, name: &str) -> Result<(), IndexError>;

    async fn create_index(&self, name: &str, body: &Value) -> Result<(), IndexError>;

    /// Write a batch of documents. A transport failure is an `Err`; item
    /// level failures are reported in the outcome.
    async fn bulk(&self, items: &[BulkItem]) -> Result<BulkOutcome, IndexError>;

    /// Read one string field of one document. A missing document or field
    /// is `Ok(None)`.
    async fn get_field(&self, index: &str, id: &str, field: &str)
        -> Result<Option<String>, IndexError>;

    /// Create or overwrite a document.
    async fn put_document(&self, index: &str, id: &str, body: &Value) -> Result<(), IndexError>;
}

/// Elasticsearch REST client.
#[derive(Clone)]
pub struct ElasticClient {
    http: Client,
    base: String,
}

impl ElasticClient {
    pub fn new(server: &str, timeout: Duration) -> Result<Self, IndexError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| IndexError::Http {
                url: server.to_string(),
                source,
            })?;
        Ok(Self {
            http,
            base: server.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    /// Check the server answers at all.
    pub async fn ping(&self) -> Result<(), IndexError> {
        let url = self.url("/");
        let resp = self.send("GET", &url, self.http.get(&url)).await?;
        let body: Value = resp.json().await.map_err(|source| IndexError::Http {
            url: url.clone(),
            source,
        })?;
        info!(
            server = %self.base,
            version = body["version"]["number"].as_str().unwrap_or("unknown"),
            "Connected to Elasticsearch"
        );
        Ok(())
    }

    async fn send(
        &self,
        method: &'static str,
        url: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, IndexError> {
        let resp = req.send().await.map_err(|source| IndexError::Http {
            url: url.to_string(),
            source,
        })?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(IndexError::Status {
            method,
            url: url.to_string(),
            status,
            body,
        })
    }
}

/// NDJSON body for `_bulk`.
pub fn bulk_body(items: &[BulkItem]) -> Result<String, IndexError> {
    let mut body = String::with_capacity(items.iter().map(|i| i.source.len() + 48).sum());
    for item in items {
        let action = serde_json::json!({ "index": { "_index": item.index } });
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&item.source);
        body.push('\n');
    }
    Ok(body)
}

/// Pick failed items out of a `_bulk` response.
pub fn parse_bulk_response(resp: &Value) -> Result<BulkOutcome, IndexError> {
    let mut outcome = BulkOutcome::default();
    if !resp["errors"].as_bool().unwrap_or(false) {
        return Ok(outcome);
    }
    let items = resp["items"]
        .as_array()
        .ok_or_else(|| IndexError::Response("bulk response without items".into()))?;
    for (pos, item) in items.iter().enumerate() {
        let Some(result) = item.as_object().and_then(|o| o.values().next()) else {
            continue;
        };
        if let Some(err) = result.get("error") {
            if outcome.first_error.is_none() {
                outcome.first_error = Some(err.to_string());
            }
            outcome.failed.push(pos);
        }
    }
    Ok(outcome)
}

#[async_trait]
impl DocumentIndex for ElasticClient {
    #[instrument(skip(self))]
    async fn index_exists(&self, name: &str) -> Result<bool, IndexError> {
        let url = self.url(name);
        let resp = self
            .http
            .head(&url)
            .send()
            .await
            .map_err(|source| IndexError::Http {
                url: url.clone(),
                source,
            })?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(IndexError::Status {
                method: "HEAD",
                url,
                status: s.as_u16(),
                body: String::new(),
            }),
        }
    }

    #[instrument(skip(self))]
    async fn delete_index(&self, name: &str) -> Result<(), IndexError> {
        let url = self.url(name);
        self.send("DELETE", &url, self.http.delete(&url)).await?;
        Ok(())
    }

    #[instrument(skip(self, body))]
    async fn create_index(&self, name: &str, body: &Value) -> Result<(), IndexError> {
        let url = self.url(name);
        self.send("PUT", &url, self.http.put(&url).json(body)).await?;
        Ok(())
    }

    async fn bulk(&self, items: &[BulkItem]) -> Result<BulkOutcome, IndexError> {
        let url = self.url("_bulk");
        let body = bulk_body(items)?;
        let resp = self
            .send(
                "POST",
                &url,
                self.http
                    .post(&url)
                    .header("Content-Type", "application/x-ndjson")
                    .body(body),
            )
            .await?;
        let value: Value = resp.json().await.map_err(|source| IndexError::Http {
            url: url.clone(),
            source,
        })?;
        parse_bulk_response(&value)
    }

    #[instrument(skip(self))]
    async fn get_field(
        &self,
        index: &str,
        id: &str,
        field: &str,
    ) -> Result<Option<String>, IndexError> {
        let url = self.url(&format!("{index}/_doc/{id}"));
        let resp = self
            .http
            .get(&url)
            .query(&[("_source_includes", field)])
            .send()
            .await
            .map_err(|source| IndexError::Http {
                url: url.clone(),
                source,
            })?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!(index, id, "Document not found");
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(IndexError::Status {
                method: "GET",
                url,
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let doc: Value = resp.json().await.map_err(|source| IndexError::Http {
            url: url.clone(),
            source,
        })?;
        Ok(doc["_source"][field].as_str().map(str::to_string))
    }

    #[instrument(skip(self, body))]
    async fn put_document(&self, index: &str, id: &str, body: &Value) -> Result<(), IndexError> {
        let url = self.url(&format!("{index}/_doc/{id}"));
        self.send("PUT", &url, self.http.put(&url).json(body)).await?;
        Ok(())
    }
}
