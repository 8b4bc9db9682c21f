//! Persistence + HTTP lookup plumbing for CARR: the authoritative actor
//! store, the client-side cache, and the rate-limited client used by
//! enrichment lookups.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use carr_core::{is_placeholder_name, ActorRecord};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "carr-store";

pub type ActorMap = BTreeMap<String, ActorRecord>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store file {path} is corrupt: {detail}")]
    Corrupt { path: PathBuf, detail: String },
    #[error("reading store file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Authoritative server-side store: one JSON document mapping record id to
/// `ActorRecord`. Read in full, rewritten in full after a batch pass; a
/// sha256 sidecar written alongside lets the next load detect truncated or
/// hand-edited content before a pass runs against it.
#[derive(Debug, Clone)]
pub struct AuthoritativeStore {
    path: PathBuf,
}

impl AuthoritativeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn checksum_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".to_string());
        name.push_str(".sha256");
        self.path.with_file_name(name)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Load the full record map. A missing file is an empty store (first
    /// run); anything unreadable or failing the checksum is `Corrupt` and
    /// the caller must abort its pass without writing.
    pub async fn load(&self) -> Result<ActorMap, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ActorMap::new());
            }
            Err(err) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source: err,
                })
            }
        };

        if let Ok(expected) = fs::read_to_string(self.checksum_path()).await {
            let actual = Self::sha256_hex(&bytes);
            if expected.trim() != actual {
                return Err(StoreError::Corrupt {
                    path: self.path.clone(),
                    detail: format!("checksum mismatch: recorded {}, found {actual}", expected.trim()),
                });
            }
        }

        serde_json::from_slice(&bytes).map_err(|err| StoreError::Corrupt {
            path: self.path.clone(),
            detail: err.to_string(),
        })
    }

    /// Atomically replace the store: write to a temp file in the same
    /// directory, rename over the original, then refresh the checksum
    /// sidecar. A crash mid-write leaves the last good store intact.
    pub async fn replace_all(&self, records: &ActorMap) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(records).context("serializing actor store")?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating store directory {}", parent.display()))?;
            }
        }

        let temp_name = format!(".{}.store.tmp", Uuid::new_v4());
        let temp_path = self
            .path
            .parent()
            .map(|p| p.join(&temp_name))
            .unwrap_or_else(|| PathBuf::from(&temp_name));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp store file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp store file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp store file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp store {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }

        fs::write(self.checksum_path(), Self::sha256_hex(&bytes))
            .await
            .with_context(|| format!("writing checksum sidecar for {}", self.path.display()))?;
        Ok(())
    }
}

/// Hydration lifecycle of the client cache, modeled as explicit
/// transitions instead of a ready-flag consulted from everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    #[default]
    Uninitialized,
    Loading,
    Ready,
}

#[derive(Debug, Error)]
#[error("invalid cache state transition {from:?} -> {to:?}")]
pub struct CacheStateError {
    pub from: CacheState,
    pub to: CacheState,
}

/// Client-side cached store: an ordered list (consumers iterate it
/// directly) plus the hydration state. Persisted as a single JSON
/// document, standing in for the browser-local key-value entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ClientCache {
    pub state: CacheState,
    pub records: Vec<ActorRecord>,
}

impl ClientCache {
    pub fn mark_loading(&mut self) -> Result<(), CacheStateError> {
        match self.state {
            CacheState::Uninitialized => {
                self.state = CacheState::Loading;
                Ok(())
            }
            from => Err(CacheStateError {
                from,
                to: CacheState::Loading,
            }),
        }
    }

    pub fn mark_ready(&mut self) -> Result<(), CacheStateError> {
        match self.state {
            CacheState::Loading => {
                self.state = CacheState::Ready;
                Ok(())
            }
            from => Err(CacheStateError {
                from,
                to: CacheState::Ready,
            }),
        }
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.records.iter().any(|r| r.id == id)
    }

    /// Append a record, rejecting duplicate ids so repeated sync runs can
    /// never grow the cache.
    pub fn insert(&mut self, record: ActorRecord) -> bool {
        if self.contains_id(&record.id) {
            warn!(id = %record.id, "refusing duplicate cache insert");
            return false;
        }
        self.records.push(record);
        true
    }

    /// Cached copies whose name is absent, blank, or a generated
    /// placeholder are candidates for a name backfill from the
    /// authoritative store.
    pub fn needs_name_backfill(record: &ActorRecord) -> bool {
        match record.name.as_deref() {
            None => true,
            Some(name) => name.trim().is_empty() || is_placeholder_name(name, &record.id),
        }
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading client cache {}", path.display()))
            }
        };
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing client cache {}", path.display()))
    }

    pub async fn persist(&self, path: &Path) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(self).context("serializing client cache")?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating cache directory {}", parent.display()))?;
            }
        }
        fs::write(path, bytes)
            .await
            .with_context(|| format!("writing client cache {}", path.display()))
    }
}

/// `Retry-After` as the delta-seconds form rate-limited services send.
/// The HTTP-date form is rare on these APIs and is simply ignored.
fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value?.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Retry schedule for enrichment lookups. The exponential curve covers
/// flaky upstreams; a `Retry-After` hint from a throttling service takes
/// precedence over the curve, capped so one response cannot stall a run.
#[derive(Debug, Clone, Copy)]
pub struct RetrySchedule {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetrySchedule {
    pub fn delay(&self, attempt: usize, server_hint: Option<Duration>) -> Duration {
        if let Some(hint) = server_hint {
            return hint.min(self.max_delay);
        }
        let mut delay = self.base_delay;
        for _ in 0..attempt {
            delay = delay.saturating_mul(2);
            if delay >= self.max_delay {
                return self.max_delay;
            }
        }
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct LookupClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_provider_concurrency: usize,
    pub retry: RetrySchedule,
}

impl Default for LookupClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_provider_concurrency: 2,
            retry: RetrySchedule::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("lookup request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("lookup http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding lookup body from {url}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// HTTP client shared by enrichment providers. Every provider speaks the
/// same shape (GET returning a JSON document), so the surface is a single
/// decoded fetch; calls pass through a global and a per-provider
/// concurrency cap, and throttled or transiently failing requests are
/// retried on the schedule.
#[derive(Debug)]
pub struct LookupClient {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_provider_limit: usize,
    per_provider: Mutex<HashMap<String, Arc<Semaphore>>>,
    retry: RetrySchedule,
}

impl LookupClient {
    pub fn new(config: LookupClientConfig) -> anyhow::Result<Self> {
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_provider_limit: config.per_provider_concurrency.max(1),
            per_provider: Mutex::new(HashMap::new()),
            retry: RetrySchedule {
                max_attempts: config.retry.max_attempts.max(1),
                ..config.retry
            },
        })
    }

    async fn per_provider_semaphore(&self, provider: &str) -> Arc<Semaphore> {
        let mut map = self.per_provider.lock().await;
        map.entry(provider.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_provider_limit)))
            .clone()
    }

    /// GET `url` and decode the JSON body. Retries 429 (honoring a
    /// `Retry-After` hint) and 5xx responses as well as timeouts and
    /// connection failures; anything else, including an undecodable body,
    /// fails the lookup immediately.
    pub async fn fetch_json<T: serde::de::DeserializeOwned>(
        &self,
        provider: &str,
        url: &str,
    ) -> Result<T, LookupError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_provider = self.per_provider_semaphore(provider).await;
        let _provider = per_provider.acquire().await.expect("semaphore not closed");

        let span = info_span!("enrichment_lookup", provider, url);
        let _guard = span.enter();

        let mut attempt = 0usize;
        loop {
            let out_of_attempts = attempt + 1 >= self.retry.max_attempts;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return serde_json::from_slice(&body).map_err(|source| {
                            LookupError::Decode {
                                url: final_url,
                                source,
                            }
                        });
                    }

                    let throttled = status == StatusCode::TOO_MANY_REQUESTS;
                    if (throttled || status.is_server_error()) && !out_of_attempts {
                        let hint = if throttled {
                            parse_retry_after(
                                resp.headers()
                                    .get(reqwest::header::RETRY_AFTER)
                                    .and_then(|v| v.to_str().ok()),
                            )
                        } else {
                            None
                        };
                        warn!(
                            status = status.as_u16(),
                            attempt,
                            "lookup rejected upstream; backing off"
                        );
                        tokio::time::sleep(self.retry.delay(attempt, hint)).await;
                    } else {
                        return Err(LookupError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                }
                Err(err) => {
                    if (err.is_timeout() || err.is_connect() || err.is_request()) && !out_of_attempts
                    {
                        warn!(error = %err, attempt, "lookup attempt failed; backing off");
                        tokio::time::sleep(self.retry.delay(attempt, None)).await;
                    } else {
                        return Err(LookupError::Request(err));
                    }
                }
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn actor(id: &str, name: &str) -> ActorRecord {
        let mut a = ActorRecord::new(id);
        a.name = Some(name.to_string());
        a
    }

    #[tokio::test]
    async fn missing_store_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = AuthoritativeStore::new(dir.path().join("actors.json"));
        let map = store.load().await.expect("load");
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn store_round_trips_and_verifies_checksum() {
        let dir = tempdir().expect("tempdir");
        let store = AuthoritativeStore::new(dir.path().join("actors.json"));

        let mut map = ActorMap::new();
        map.insert("a-1".into(), actor("a-1", "Jane Doe"));
        store.replace_all(&map).await.expect("replace");

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded, map);
    }

    #[tokio::test]
    async fn tampered_store_is_rejected_without_write() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("actors.json");
        let store = AuthoritativeStore::new(&path);

        let mut map = ActorMap::new();
        map.insert("a-1".into(), actor("a-1", "Jane Doe"));
        store.replace_all(&map).await.expect("replace");

        let mut bytes = fs::read(&path).await.expect("read");
        bytes.truncate(bytes.len() / 2);
        fs::write(&path, &bytes).await.expect("tamper");

        let err = store.load().await.expect_err("corrupt load must fail");
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn unparsable_store_is_corrupt() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("actors.json");
        fs::write(&path, b"[1, 2, 3]").await.expect("seed");
        let store = AuthoritativeStore::new(&path);
        let err = store.load().await.expect_err("bad shape must fail");
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn cache_state_transitions_are_explicit() {
        let mut cache = ClientCache::default();
        assert_eq!(cache.state, CacheState::Uninitialized);
        cache.mark_ready().expect_err("cannot skip loading");
        cache.mark_loading().expect("uninitialized -> loading");
        cache.mark_loading().expect_err("loading is not re-enterable");
        cache.mark_ready().expect("loading -> ready");
    }

    #[test]
    fn cache_rejects_duplicate_ids() {
        let mut cache = ClientCache::default();
        assert!(cache.insert(actor("a-1", "Jane Doe")));
        assert!(!cache.insert(actor("a-1", "Jane Doe")));
        assert_eq!(cache.records.len(), 1);
    }

    #[test]
    fn backfill_detection_covers_blank_and_placeholder() {
        assert!(ClientCache::needs_name_backfill(&ActorRecord::new("a-1")));
        assert!(ClientCache::needs_name_backfill(&actor("a-1", "  ")));
        assert!(ClientCache::needs_name_backfill(&actor("a-1", "Actor 4821")));
        assert!(!ClientCache::needs_name_backfill(&actor("a-1", "Jane Doe")));
    }

    #[tokio::test]
    async fn cache_round_trips() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("cache.json");
        let mut cache = ClientCache::default();
        cache.mark_loading().expect("loading");
        cache.insert(actor("a-1", "Jane Doe"));
        cache.mark_ready().expect("ready");
        cache.persist(&path).await.expect("persist");

        let loaded = ClientCache::load(&path).await.expect("load");
        assert_eq!(loaded, cache);
    }

    #[test]
    fn retry_delays_double_up_to_the_cap() {
        let schedule = RetrySchedule {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(schedule.delay(0, None), Duration::from_millis(100));
        assert_eq!(schedule.delay(1, None), Duration::from_millis(200));
        assert_eq!(schedule.delay(2, None), Duration::from_millis(350));
        assert_eq!(schedule.delay(9, None), Duration::from_millis(350));
    }

    #[test]
    fn server_retry_hint_overrides_the_curve_but_stays_capped() {
        let schedule = RetrySchedule {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        };
        assert_eq!(
            schedule.delay(0, Some(Duration::from_secs(1))),
            Duration::from_secs(1)
        );
        assert_eq!(
            schedule.delay(0, Some(Duration::from_secs(30))),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn retry_after_parses_delta_seconds_only() {
        assert_eq!(parse_retry_after(Some("3")), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after(Some(" 10 ")), Some(Duration::from_secs(10)));
        assert_eq!(parse_retry_after(Some("Wed, 21 Oct 2026 07:28:00 GMT")), None);
        assert_eq!(parse_retry_after(None), None);
    }
}
