//! `LogShipper`: masks secrets out of a job's stdout/stderr, batches entries
//! as JSON, and uploads periodic cumulative snapshots to an `ObjectStore`.
//! `SecretMasker` centralises the per-job redaction registry (spec §9,
//! "masking before logging").

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{Error, Result};

const REDACTED_TOKEN: &str = "***REDACTED***";
const MIN_SECRET_LEN: usize = 4;

/// Per-job substring-redaction registry. Every log line passes through it
/// before emission; no ad-hoc redaction elsewhere.
#[derive(Debug, Default, Clone)]
pub struct SecretMasker {
    secrets: HashSet<String>,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty or too-short secrets are skipped (they would mask unrelated
    /// text rather than protect anything).
    pub fn register(&mut self, value: impl Into<String>) {
        let value = value.into();
        if value.len() >= MIN_SECRET_LEN {
            self.secrets.insert(value);
        }
    }

    pub fn register_many<I: IntoIterator<Item = String>>(&mut self, values: I) {
        for v in values {
            self.register(v);
        }
    }

    pub fn mask(&self, line: &str) -> String {
        let mut masked = line.to_string();
        for secret in &self.secrets {
            if masked.contains(secret.as_str()) {
                masked = masked.replace(secret.as_str(), REDACTED_TOKEN);
            }
        }
        masked
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: chrono::DateTime<Utc>,
    pub stream: String,
    #[serde(default)]
    pub level: Option<String>,
    pub message: String,
}

/// External object-store collaborator. `Get` returns `Ok(None)` for a
/// missing key, not an error.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()>;
}

/// In-memory fallback used when no object store is configured (spec
/// §4.7.2 step 9: "fall back to line-scanning into a memory buffer").
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<()> {
        self.objects.lock().await.insert(key.to_string(), body);
        Ok(())
    }
}

/// Production `ObjectStore` backed by S3 (or an S3-compatible endpoint),
/// grounded on the teacher's `S3Config` (`media/file_upload.rs`) and its
/// `aws-sdk-s3`/`aws-config` dependency declarations, generalised from
/// digital-product file storage to log/artifact chunk storage.
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn connect(bucket: impl Into<String>, region: impl Into<String>, endpoint: Option<&str>) -> Self {
        let region = aws_config::Region::new(region.into());
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared_config = loader.load().await;
        Self {
            client: aws_sdk_s3::Client::new(&shared_config),
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(output) => {
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| Error::LogShippingError(format!("s3 get {}: {}", key, e)))?;
                Ok(Some(bytes.into_bytes().to_vec()))
            }
            Err(e) if e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false) => Ok(None),
            Err(e) => Err(Error::LogShippingError(format!("s3 get {}: {}", key, e))),
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body.into())
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| Error::LogShippingError(format!("s3 put {}: {}", key, e)))?;
        Ok(())
    }
}

pub struct LogShipperConfig {
    pub chunk_interval: std::time::Duration,
}

impl Default for LogShipperConfig {
    fn default() -> Self {
        Self {
            chunk_interval: std::time::Duration::from_secs(3),
        }
    }
}

/// One instance per (job, stream). `object_key` is `logs/{job_id}/{stream}.json`.
pub struct LogShipper {
    object_key: String,
    object_store: Arc<dyn ObjectStore>,
    masker: SecretMasker,
    config: LogShipperConfig,
    buffer: Mutex<Vec<LogEntry>>,
    first_chunk: std::sync::atomic::AtomicBool,
    total_bytes: std::sync::atomic::AtomicU64,
    chunks_written: std::sync::atomic::AtomicU64,
}

impl LogShipper {
    pub fn new(job_id: &str, stream: LogStream, object_store: Arc<dyn ObjectStore>, masker: SecretMasker) -> Self {
        Self {
            object_key: format!("logs/{}/{}.json", job_id, stream.as_str()),
            object_store,
            masker,
            config: LogShipperConfig::default(),
            buffer: Mutex::new(Vec::new()),
            first_chunk: std::sync::atomic::AtomicBool::new(true),
            total_bytes: std::sync::atomic::AtomicU64::new(0),
            chunks_written: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn object_key(&self) -> &str {
        &self.object_key
    }

    fn parse_line(&self, stream: LogStream, line: &str) -> LogEntry {
        if let Ok(mut parsed) = serde_json::from_str::<LogEntry>(line) {
            if !parsed.message.is_empty() {
                if parsed.stream.is_empty() {
                    parsed.stream = stream.as_str().to_string();
                }
                return parsed;
            }
        }
        LogEntry {
            timestamp: Utc::now(),
            stream: stream.as_str().to_string(),
            level: Some("info".to_string()),
            message: line.to_string(),
        }
    }

    /// Scan the input reader line-by-line, mask, parse, buffer, and flush on
    /// every tick of `chunk_interval` and on EOF. Runs until the reader hits
    /// EOF or `cancel` fires (buffered lines are flushed either way).
    pub async fn stream_and_ship<R>(
        self: Arc<Self>,
        reader: R,
        stream: LogStream,
        cancel: tokio_util::sync::CancellationToken,
        on_chunk_uploaded: impl Fn(&str, u64) + Send + Sync + 'static,
    ) -> Result<(String, u64)>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut lines = BufReader::new(reader).lines();
        let mut ticker = tokio::time::interval(self.config.chunk_interval);

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line? {
                        Some(raw) => {
                            let masked = self.masker.mask(&raw);
                            let entry = self.parse_line(stream, &masked);
                            self.buffer.lock().await.push(entry);
                        }
                        None => {
                            self.flush(&on_chunk_uploaded).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.flush(&on_chunk_uploaded).await;
                }
                _ = cancel.cancelled() => {
                    self.flush(&on_chunk_uploaded).await;
                    break;
                }
            }
        }

        Ok((
            self.object_key.clone(),
            self.total_bytes.load(std::sync::atomic::Ordering::SeqCst),
        ))
    }

    async fn flush(&self, on_chunk_uploaded: &(impl Fn(&str, u64) + Send + Sync)) {
        let mut buffer = self.buffer.lock().await;
        if buffer.is_empty() {
            return;
        }

        let mut entries = if self.first_chunk.load(std::sync::atomic::Ordering::SeqCst) {
            Vec::new()
        } else {
            match self.object_store.get(&self.object_key).await {
                Ok(Some(existing)) => serde_json::from_slice::<Vec<LogEntry>>(&existing).unwrap_or_default(),
                Ok(None) => Vec::new(),
                Err(e) => {
                    warn!(key = %self.object_key, error = %e, "failed to fetch existing log object, starting fresh");
                    Vec::new()
                }
            }
        };

        entries.append(&mut buffer);
        buffer.clear();
        drop(buffer);

        let body = match serde_json::to_vec(&entries) {
            Ok(b) => b,
            Err(e) => {
                warn!(key = %self.object_key, error = %e, "failed to marshal log entries");
                return;
            }
        };
        let len = body.len() as u64;

        if let Err(e) = self.object_store.put(&self.object_key, body, "application/json").await {
            warn!(key = %self.object_key, error = %e, "log shipping failed (non-fatal)");
            return;
        }

        self.first_chunk.store(false, std::sync::atomic::Ordering::SeqCst);
        self.total_bytes.store(len, std::sync::atomic::Ordering::SeqCst);
        self.chunks_written.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        on_chunk_uploaded(&self.object_key, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masker_skips_short_secrets() {
        let mut masker = SecretMasker::new();
        masker.register("ab");
        assert_eq!(masker.mask("ab leaked"), "ab leaked");
    }

    #[test]
    fn masker_replaces_registered_secret() {
        let mut masker = SecretMasker::new();
        masker.register("supersecret123");
        assert_eq!(
            masker.mask("token=supersecret123 done"),
            format!("token={} done", REDACTED_TOKEN)
        );
    }

    #[tokio::test]
    async fn stream_and_ship_produces_valid_json_array() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let shipper = Arc::new(LogShipper::new("job-1", LogStream::Stdout, store.clone(), SecretMasker::new()));
        let input = tokio::io::BufReader::new("line one\nline two\n".as_bytes());
        let cancel = tokio_util::sync::CancellationToken::new();

        let (key, _bytes) = shipper
            .stream_and_ship(input, LogStream::Stdout, cancel, |_, _| {})
            .await
            .unwrap();

        let body = store.get(&key).await.unwrap().unwrap();
        let entries: Vec<LogEntry> = serde_json::from_slice(&body).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "line one");
        assert_eq!(entries[1].message, "line two");
    }

    #[tokio::test]
    async fn object_store_get_missing_key_is_none() {
        let store = InMemoryObjectStore::new();
        assert!(store.get("missing").await.unwrap().is_none());
    }
}
