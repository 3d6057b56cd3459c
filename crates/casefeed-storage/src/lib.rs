//! Keyed document storage, ingestion offsets, and incremental HTTP fetch.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "casefeed-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {collection}/{key} not found")]
    NotFound { collection: String, key: String },
    #[error("document {collection}/{key} has unexpected shape: {source}")]
    Shape {
        collection: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("document serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Keyed JSON document store. Upsert is an unconditional overwrite, so
/// every write is idempotent; consistency relies on per-key atomicity and
/// nothing else.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn upsert(&self, collection: &str, key: &str, value: Value) -> Result<(), StoreError>;

    async fn get(&self, collection: &str, key: &str) -> Result<Value, StoreError>;

    /// All `(key, value)` pairs in a collection, ordered by key. An unknown
    /// collection is an empty one.
    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, StoreError>;

    /// Like [`DocumentStore::list`], restricted to keys starting with
    /// `prefix`.
    async fn list_prefix(
        &self,
        collection: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Value)>, StoreError>;
}

/// Fetches and deserializes a document, failing with [`StoreError::Shape`]
/// when the stored value does not match `T`.
pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: &str,
    key: &str,
) -> Result<T, StoreError> {
    let value = store.get(collection, key).await?;
    serde_json::from_value(value).map_err(|source| StoreError::Shape {
        collection: collection.to_string(),
        key: key.to_string(),
        source,
    })
}

pub async fn upsert_typed<T: Serialize>(
    store: &dyn DocumentStore,
    collection: &str,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    store
        .upsert(collection, key, serde_json::to_value(value)?)
        .await
}

/// In-memory store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn upsert(&self, collection: &str, key: &str, value: Value) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Value, StoreError> {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .and_then(|docs| docs.get(key))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                key: key.to_string(),
            })
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|docs| docs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn list_prefix(
        &self,
        collection: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|docs| {
                docs.range(prefix.to_string()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// File-backed store: one JSON file per document under
/// `<root>/<collection>/<key>.json`. Writes go through a unique temp file
/// and an atomic rename, so readers never observe a partial document.
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    root: PathBuf,
}

impl JsonDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, collection: &str, key: &str) -> PathBuf {
        self.root
            .join(sanitize_component(collection))
            .join(format!("{}.json", sanitize_component(key)))
    }
}

/// Entity keys and collection names are already filesystem-friendly
/// (fips codes, dates, fixed collection names); anything else is mapped
/// to `-` so a hostile key cannot escape the store root.
fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[async_trait]
impl DocumentStore for JsonDirStore {
    async fn upsert(&self, collection: &str, key: &str, value: Value) -> Result<(), StoreError> {
        let path = self.document_path(collection, key);
        let parent = path.parent().expect("document path always has a parent");
        fs::create_dir_all(parent).await?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(&value)?;

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err.into())
            }
        }
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Value, StoreError> {
        let path = self.document_path(collection, key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    collection: collection.to_string(),
                    key: key.to_string(),
                })
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, StoreError> {
        self.list_prefix(collection, "").await
    }

    async fn list_prefix(
        &self,
        collection: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let dir = self.root.join(sanitize_component(collection));
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut documents = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(key) = name.strip_suffix(".json") else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            let bytes = fs::read(entry.path()).await?;
            documents.push((key.to_string(), serde_json::from_slice(&bytes)?));
        }

        documents.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(documents)
    }
}

/// Name of the collection holding per-scope ingestion offsets.
pub const OFFSETS_COLLECTION: &str = "offsets";

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct OffsetRecord {
    offset: u64,
}

/// Per-scope byte offsets over a [`DocumentStore`]. `get` fails with
/// [`StoreError::NotFound`] for a scope that has never been committed;
/// `commit` is an unconditional overwrite and must only run after every
/// upsert of the pass has been acknowledged.
#[derive(Clone)]
pub struct OffsetStore {
    store: Arc<dyn DocumentStore>,
}

impl OffsetStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, scope_key: &str) -> Result<u64, StoreError> {
        let record: OffsetRecord =
            get_typed(self.store.as_ref(), OFFSETS_COLLECTION, scope_key).await?;
        Ok(record.offset)
    }

    pub async fn commit(&self, scope_key: &str, offset: u64) -> Result<(), StoreError> {
        upsert_typed(
            self.store.as_ref(),
            OFFSETS_COLLECTION,
            scope_key,
            &OffsetRecord { offset },
        )
        .await
    }
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

pub fn classify_transport_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("server ignored byte-range request for {url}")]
    RangeNotHonored { url: String },
    #[error("no content-length reported for {url}")]
    MissingLength { url: String },
}

/// Outcome of a byte-range fetch against an append-only resource.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Unconsumed bytes starting exactly at the requested offset, plus the
    /// resource's total length after this read (`offset + body.len()`).
    NewData { body: Vec<u8>, total_len: u64 },
    /// The resource has not grown past the offset. Not an error: the pass
    /// completes as a no-op, optionally refreshing the offset to
    /// `total_len`.
    NoNewData { total_len: u64 },
}

/// Seam between pipelines and the network so ingestion is testable against
/// stub feeds.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    /// Full (non-resuming) GET; live feeds are re-read in full every run.
    async fn fetch_full(&self, url: &str) -> Result<Vec<u8>, FetchError>;

    /// Byte-range GET from `offset` to end-of-resource.
    async fn fetch_from_offset(&self, url: &str, offset: u64)
        -> Result<FetchOutcome, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFeedFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFeedFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self {
            client: builder.build()?,
            backoff: config.backoff,
        })
    }

    /// Current total length of the resource, from a HEAD request. Only used
    /// on the no-new-data path, where there is no body to measure.
    async fn head_total_len(&self, url: &str) -> Result<u64, FetchError> {
        let response = self
            .client
            .head(url)
            .header(header::ACCEPT_ENCODING, "identity")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        response
            .content_length()
            .ok_or_else(|| FetchError::MissingLength {
                url: url.to_string(),
            })
    }

    async fn send_with_retries(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, FetchError> {
        let mut last_transport_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() || status == StatusCode::RANGE_NOT_SATISFIABLE {
                        return Ok(response);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: response.url().to_string(),
                    });
                }
                Err(err) => {
                    if classify_transport_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_transport_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Transport(err));
                }
            }
        }

        Err(FetchError::Transport(
            last_transport_error.expect("retry loop always captures a transport error"),
        ))
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch_full(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("feed_fetch_full", url);
        let _guard = span.enter();

        let response = self.send_with_retries(|| self.client.get(url)).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn fetch_from_offset(
        &self,
        url: &str,
        offset: u64,
    ) -> Result<FetchOutcome, FetchError> {
        let span = info_span!("feed_fetch_range", url, offset);
        let _guard = span.enter();

        // Byte offsets are meaningless against a compressed representation,
        // so range requests pin the identity encoding.
        let response = self
            .send_with_retries(|| {
                self.client
                    .get(url)
                    .header(header::RANGE, format!("bytes={offset}-"))
                    .header(header::ACCEPT_ENCODING, "identity")
            })
            .await?;

        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            let total_len = self.head_total_len(url).await?;
            return Ok(FetchOutcome::NoNewData { total_len });
        }

        // A resumed fetch must be honored with 206: a mirror or proxy that
        // ignores the range replies 200 with the full body, which would
        // replay consumed bytes (header included) and commit an offset past
        // the real resource length.
        if offset > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(FetchError::RangeNotHonored {
                url: url.to_string(),
            });
        }

        let body = response.bytes().await?.to_vec();
        let total_len = offset + body.len() as u64;
        Ok(FetchOutcome::NewData { body, total_len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn memory_store_roundtrips_and_overwrites() {
        let store = MemoryStore::new();
        store
            .upsert("states-live", "50", json!({"Cases": "10"}))
            .await
            .unwrap();
        store
            .upsert("states-live", "50", json!({"Cases": "12"}))
            .await
            .unwrap();

        let doc = store.get("states-live", "50").await.unwrap();
        assert_eq!(doc["Cases"], "12");
        assert_eq!(store.list("states-live").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_document_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get("states-live", "50").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_prefix_scans_only_matching_keys() {
        let store = MemoryStore::new();
        for (key, cases) in [
            ("50_2021-01-01", "1"),
            ("50_2021-01-02", "2"),
            ("51_2021-01-01", "9"),
        ] {
            store
                .upsert("states-historical", key, json!({"Cases": cases}))
                .await
                .unwrap();
        }

        let docs = store
            .list_prefix("states-historical", "50_")
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs.iter().all(|(k, _)| k.starts_with("50_")));
    }

    #[tokio::test]
    async fn typed_reads_name_shape_mismatches() {
        #[derive(Debug, Deserialize)]
        struct Expected {
            #[allow(dead_code)]
            offset: u64,
        }

        let store = MemoryStore::new();
        store
            .upsert("offsets", "state", json!({"offset": "not-a-number"}))
            .await
            .unwrap();

        let err = get_typed::<Expected>(&store, "offsets", "state")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Shape { .. }));
    }

    #[tokio::test]
    async fn json_dir_store_roundtrips_through_files() {
        let dir = tempdir().expect("tempdir");
        let store = JsonDirStore::new(dir.path());

        store
            .upsert("counties-live", "NYC", json!({"Cases": "400"}))
            .await
            .unwrap();
        store
            .upsert("counties-live", "NYC", json!({"Cases": "410"}))
            .await
            .unwrap();

        let doc = store.get("counties-live", "NYC").await.unwrap();
        assert_eq!(doc["Cases"], "410");

        let listed = store.list("counties-live").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "NYC");
    }

    #[tokio::test]
    async fn json_dir_store_treats_unknown_collection_as_empty() {
        let dir = tempdir().expect("tempdir");
        let store = JsonDirStore::new(dir.path());
        assert!(store.list("never-written").await.unwrap().is_empty());

        let err = store.get("never-written", "x").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn hostile_keys_cannot_escape_the_store_root() {
        assert_eq!(sanitize_component("../../etc/passwd"), "..-..-etc-passwd");
        assert_eq!(sanitize_component("50_2021-01-01"), "50_2021-01-01");
    }

    #[tokio::test]
    async fn offset_store_requires_seeding_then_overwrites() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let offsets = OffsetStore::new(store);

        let err = offsets.get("state").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));

        offsets.commit("state", 1024).await.unwrap();
        assert_eq!(offsets.get("state").await.unwrap(), 1024);

        offsets.commit("state", 4096).await.unwrap();
        assert_eq!(offsets.get("state").await.unwrap(), 4096);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    const FEED_FULL: &str = "date,state,fips,cases,deaths\n2021-01-29,Vermont,50,1000,20\n";
    const FEED_TAIL: &str = "2021-01-29,Vermont,50,1000,20\n";

    /// Serves one canned HTTP response on a local port and returns the URL.
    async fn serve_once(response: String) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind local listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut request = [0u8; 2048];
            let _ = socket.read(&mut request).await;
            socket
                .write_all(response.as_bytes())
                .await
                .expect("write response");
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/feed.csv")
    }

    #[tokio::test]
    async fn range_ignoring_server_is_rejected_not_replayed() {
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{FEED_FULL}",
            FEED_FULL.len()
        );
        let url = serve_once(response).await;
        let fetcher = HttpFeedFetcher::new(HttpClientConfig::default()).unwrap();

        // The full body from byte zero must not be mistaken for the tail.
        let err = fetcher.fetch_from_offset(&url, 29).await.unwrap_err();
        assert!(matches!(err, FetchError::RangeNotHonored { .. }));
    }

    #[tokio::test]
    async fn honored_range_yields_exactly_the_unconsumed_tail() {
        let response = format!(
            "HTTP/1.1 206 Partial Content\r\ncontent-range: bytes 29-58/59\r\ncontent-length: {}\r\n\r\n{FEED_TAIL}",
            FEED_TAIL.len()
        );
        let url = serve_once(response).await;
        let fetcher = HttpFeedFetcher::new(HttpClientConfig::default()).unwrap();

        match fetcher.fetch_from_offset(&url, 29).await.unwrap() {
            FetchOutcome::NewData { body, total_len } => {
                assert_eq!(body, FEED_TAIL.as_bytes());
                assert_eq!(total_len, 29 + FEED_TAIL.len() as u64);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn server_errors_are_retryable_client_errors_are_not() {
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
