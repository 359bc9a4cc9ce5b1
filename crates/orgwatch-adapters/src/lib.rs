//! Collaborators at the edge of the ingest engine: where records come from
//! and who narrates their changes.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use orgwatch_core::SourceRecord;
use orgwatch_storage::BackoffPolicy;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};

pub mod insights;

pub use insights::{
    AbsenceReason, ChatCompletionsConfig, ChatCompletionsInsights, DisabledInsights, Insight,
    InsightGenerator, InsightRequest,
};

pub const CRATE_NAME: &str = "orgwatch-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing records from {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no record array at `{pointer}` in {origin}")]
    MissingRecords { origin: String, pointer: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Pages of raw records for one ingestion run.
#[async_trait]
pub trait RecordSource: Send {
    fn source_id(&self) -> &str;

    /// Next page, or `None` once the source is exhausted. A page fails as a
    /// whole only when the page itself cannot be read.
    async fn next_page(&mut self) -> Result<Option<Vec<SourceRecord>>, SourceError>;
}

/// Records already in memory, handed out in fixed-size pages.
#[derive(Debug, Clone)]
pub struct StaticSource {
    source_id: String,
    pending: VecDeque<SourceRecord>,
    page_size: usize,
}

impl StaticSource {
    pub fn new(
        source_id: impl Into<String>,
        records: impl IntoIterator<Item = impl Into<SourceRecord>>,
        page_size: usize,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            pending: records.into_iter().map(Into::into).collect(),
            page_size: page_size.max(1),
        }
    }
}

#[async_trait]
impl RecordSource for StaticSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn next_page(&mut self) -> Result<Option<Vec<SourceRecord>>, SourceError> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let take = self.page_size.min(self.pending.len());
        Ok(Some(self.pending.drain(..take).collect()))
    }
}

/// Load a JSON file holding an array of records (or an object with the
/// array at `pointer`) and page through it.
pub async fn load_json_file_source(
    path: impl AsRef<Path>,
    pointer: Option<&str>,
    page_size: usize,
) -> Result<StaticSource, SourceError> {
    let path = path.as_ref();
    let bytes = tokio::fs::read(path).await.map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let origin = path.display().to_string();
    let document: JsonValue =
        serde_json::from_slice(&bytes).map_err(|source| SourceError::Parse {
            origin: origin.clone(),
            source,
        })?;
    let records = extract_records(&origin, document, pointer)?;
    Ok(StaticSource::new(origin, records, page_size))
}

fn extract_records(
    origin: &str,
    mut document: JsonValue,
    pointer: Option<&str>,
) -> Result<Vec<SourceRecord>, SourceError> {
    let array = match pointer.filter(|p| !p.is_empty()) {
        Some(pointer) => document
            .pointer_mut(pointer)
            .map(JsonValue::take)
            .ok_or_else(|| SourceError::MissingRecords {
                origin: origin.to_string(),
                pointer: pointer.to_string(),
            })?,
        None => document,
    };
    let JsonValue::Array(elements) = array else {
        return Err(SourceError::MissingRecords {
            origin: origin.to_string(),
            pointer: pointer.unwrap_or("").to_string(),
        });
    };
    let records = elements
        .into_iter()
        .map(SourceRecord::from_json)
        .collect::<Vec<_>>();
    let undecodable = records
        .iter()
        .filter(|r| matches!(r, SourceRecord::Undecodable(_)))
        .count();
    if undecodable > 0 {
        warn!(origin, undecodable, "source page has undecodable records");
    }
    Ok(records)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shut down")]
    Closed,
}

/// Rate-limited GET with exponential backoff on retryable failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut attempt = 0;
        loop {
            let err = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }
                    let final_url = resp.url().to_string();
                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    format!("http status {status}")
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::Request(err));
                    }
                    err.to_string()
                }
            };

            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(url, attempt, ?delay, error = %err, "retrying page fetch");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Paginated JSON endpoint. `url_template` contains `{page}`, replaced by a
/// zero-based page number; paging stops at the first empty page.
pub struct HttpPageSource {
    fetcher: HttpFetcher,
    url_template: String,
    records_pointer: Option<String>,
    next_page: usize,
    exhausted: bool,
}

impl HttpPageSource {
    pub fn new(
        fetcher: HttpFetcher,
        url_template: impl Into<String>,
        records_pointer: Option<String>,
    ) -> Self {
        Self {
            fetcher,
            url_template: url_template.into(),
            records_pointer,
            next_page: 0,
            exhausted: false,
        }
    }

    pub fn page_url(&self, page: usize) -> String {
        self.url_template.replace("{page}", &page.to_string())
    }
}

#[async_trait]
impl RecordSource for HttpPageSource {
    fn source_id(&self) -> &str {
        &self.url_template
    }

    async fn next_page(&mut self) -> Result<Option<Vec<SourceRecord>>, SourceError> {
        if self.exhausted {
            return Ok(None);
        }
        let page = self.next_page;
        let url = self.page_url(page);
        let span = info_span!("fetch_page", page, url = %url);

        let body = self.fetcher.fetch_bytes(&url).instrument(span).await?;
        let document: JsonValue =
            serde_json::from_slice(&body).map_err(|source| SourceError::Parse {
                origin: url.clone(),
                source,
            })?;
        let records = extract_records(&url, document, self.records_pointer.as_deref())?;
        debug!(page, records = records.len(), "fetched page");

        self.next_page += 1;
        if records.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }
        Ok(Some(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgwatch_core::{IncomingRecord, RecordError};
    use tempfile::tempdir;

    fn decoded(entry: &SourceRecord) -> &IncomingRecord {
        match entry {
            SourceRecord::Decoded(record) => record,
            other => panic!("expected a decoded record, got {other:?}"),
        }
    }

    fn record(key: &str) -> IncomingRecord {
        IncomingRecord {
            external_key: Some(key.into()),
            name: Some(key.to_uppercase()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn static_source_pages_until_exhausted() {
        let mut source = StaticSource::new(
            "fixture",
            vec![record("a"), record("b"), record("c")],
            2,
        );
        let first = source.next_page().await.expect("page").expect("some");
        let second = source.next_page().await.expect("page").expect("some");
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(source.next_page().await.expect("page").is_none());
    }

    #[tokio::test]
    async fn json_file_source_reads_nested_upstream_hits() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("companies.json");
        std::fs::write(
            &path,
            r#"{"results":[{"hits":[
                {"slug":"acme","name":"Acme","stage":"Seed","tags":["b2b","saas"],"team_size":8},
                {"slug":"globex","name":"Globex","website":"https://globex.io"}
            ]}]}"#,
        )
        .expect("write fixture");

        let mut source = load_json_file_source(&path, Some("/results/0/hits"), 100)
            .await
            .expect("load");
        let page = source.next_page().await.expect("page").expect("some");
        assert_eq!(page.len(), 2);
        assert_eq!(decoded(&page[0]).external_key.as_deref(), Some("acme"));
        assert_eq!(decoded(&page[0]).size_bucket.as_deref(), Some("8"));
        assert_eq!(decoded(&page[1]).domain.as_deref(), Some("https://globex.io"));
        assert!(source.next_page().await.expect("page").is_none());
    }

    #[tokio::test]
    async fn mistyped_record_does_not_sink_its_page() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("companies.json");
        std::fs::write(
            &path,
            r#"[
                {"slug":"acme","name":"Acme","tags":["b2b"]},
                {"slug":"bad","name":"Bad","tags":"b2b"},
                {"slug":"globex","name":"Globex"}
            ]"#,
        )
        .expect("write fixture");

        let mut source = load_json_file_source(&path, None, 10).await.expect("load");
        let page = source.next_page().await.expect("page").expect("some");
        assert_eq!(page.len(), 3);
        assert_eq!(decoded(&page[0]).external_key.as_deref(), Some("acme"));
        assert!(matches!(
            page[1],
            SourceRecord::Undecodable(RecordError::Malformed(_))
        ));
        assert_eq!(decoded(&page[2]).external_key.as_deref(), Some("globex"));
    }

    #[tokio::test]
    async fn json_file_source_rejects_non_array_documents() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("broken.json");
        std::fs::write(&path, r#"{"hits":{"slug":"acme"}}"#).expect("write fixture");

        let err = load_json_file_source(&path, Some("/hits"), 10)
            .await
            .expect_err("not an array");
        assert!(matches!(err, SourceError::MissingRecords { .. }));

        let err = load_json_file_source(dir.path().join("missing.json"), None, 10)
            .await
            .expect_err("missing file");
        assert!(matches!(err, SourceError::Io { .. }));
    }

    #[test]
    fn page_url_substitutes_page_number() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let source = HttpPageSource::new(
            fetcher,
            "https://directory.example/api/companies?page={page}&per_page=100",
            None,
        );
        assert_eq!(
            source.page_url(3),
            "https://directory.example/api/companies?page=3&per_page=100"
        );
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
