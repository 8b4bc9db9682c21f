//! Client-cache reconciliation: idempotent insert of missing canonical
//! records, narrow name backfill, and the once-per-session guard.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};

use anyhow::{Context, Result};
use carr_core::ActorRecord;
use carr_store::{ActorMap, AuthoritativeStore, CacheState, ClientCache};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const CRATE_NAME: &str = "carr-sync";

/// Change-set produced by one reconciliation pass. The caller decides how
/// to refresh affected views; the engine never forces a reload itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncOutcome {
    pub added: Vec<String>,
    pub backfilled: Vec<String>,
}

impl SyncOutcome {
    pub fn requires_refresh(&self) -> bool {
        !self.added.is_empty() || !self.backfilled.is_empty()
    }
}

/// Wire contract for the sync endpoint. `actors` is the full authoritative
/// set to reconcile against, not a delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub success: bool,
    pub actors: Vec<ActorRecord>,
    pub count: usize,
    pub message: String,
}

impl SyncResponse {
    pub fn ok(actors: Vec<ActorRecord>) -> Self {
        let count = actors.len();
        Self {
            success: true,
            actors,
            count,
            message: format!("{count} actors"),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            actors: Vec::new(),
            count: 0,
            message: message.into(),
        }
    }
}

/// Reconcile the authoritative set into the client cache.
///
/// Records missing by id are appended; for records present on both sides
/// only the name is backfilled, and only when the cached copy's name is
/// blank or a placeholder and the authoritative copy has a real one. A
/// full field merge would clobber client-only edits (notes, manual status
/// flags), so nothing else is touched. Running twice with an unchanged
/// authoritative set is a no-op.
pub fn reconcile(authoritative: &ActorMap, cache: &mut ClientCache) -> SyncOutcome {
    let mut outcome = SyncOutcome::default();

    for cached in cache.records.iter_mut() {
        let Some(server_copy) = authoritative.get(&cached.id) else {
            continue;
        };
        if ClientCache::needs_name_backfill(cached) && server_copy.has_real_name() {
            cached.name = server_copy.name.clone();
            outcome.backfilled.push(cached.id.clone());
        }
    }

    // Cached ids collected once so the insert phase stays linear in the
    // combined size of the two stores.
    let mut cached_ids: HashSet<String> =
        cache.records.iter().map(|r| r.id.clone()).collect();
    for (id, record) in authoritative {
        if cached_ids.insert(id.clone()) {
            cache.records.push(record.clone());
            outcome.added.push(id.clone());
        }
    }

    if outcome.requires_refresh() {
        info!(
            added = outcome.added.len(),
            backfilled = outcome.backfilled.len(),
            "cache reconciliation applied changes"
        );
    }
    outcome
}

const SESSION_IDLE: u8 = 0;
const SESSION_IN_FLIGHT: u8 = 1;
const SESSION_DONE: u8 = 2;

/// Guards the sync path so overlapping initialization hooks cannot run a
/// second reconciliation in the same client session: a pass that is in
/// flight or already completed short-circuits the caller.
#[derive(Debug, Default)]
pub struct SyncSession {
    state: AtomicU8,
}

impl SyncSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the session's single reconciliation slot. Returns false when
    /// another call already holds or used it.
    pub fn try_begin(&self) -> bool {
        self.state
            .compare_exchange(
                SESSION_IDLE,
                SESSION_IN_FLIGHT,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn finish(&self) {
        self.state.store(SESSION_DONE, Ordering::Release);
    }

    /// Release the slot after a failed pass so a later hook may retry.
    pub fn abandon(&self) {
        let _ = self.state.compare_exchange(
            SESSION_IN_FLIGHT,
            SESSION_IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == SESSION_DONE
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_path: PathBuf,
    pub cache_path: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            store_path: std::env::var("CARR_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/actors.json")),
            cache_path: std::env::var("CARR_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/client-cache.json")),
        }
    }
}

/// Session-start sync: load both stores, reconcile once, persist the cache
/// if anything changed. Returns `None` when the session guard short-
/// circuits the call.
pub async fn run_session_sync(
    config: &SyncConfig,
    session: &SyncSession,
) -> Result<Option<SyncOutcome>> {
    if !session.try_begin() {
        info!("sync already ran or is in flight this session; skipping");
        return Ok(None);
    }

    let result = run_sync_inner(config).await;
    match result {
        Ok(outcome) => {
            session.finish();
            Ok(Some(outcome))
        }
        Err(err) => {
            session.abandon();
            Err(err)
        }
    }
}

async fn run_sync_inner(config: &SyncConfig) -> Result<SyncOutcome> {
    let store = AuthoritativeStore::new(&config.store_path);
    let authoritative = store
        .load()
        .await
        .context("loading authoritative store for sync")?;

    let mut cache = ClientCache::load(&config.cache_path)
        .await
        .context("loading client cache")?;

    if cache.state == CacheState::Uninitialized {
        cache.mark_loading().expect("uninitialized cache accepts loading");
    }

    let outcome = reconcile(&authoritative, &mut cache);

    if cache.state == CacheState::Loading {
        cache.mark_ready().expect("loading cache accepts ready");
    }

    if outcome.requires_refresh() || cache.state == CacheState::Ready {
        cache
            .persist(&config.cache_path)
            .await
            .context("persisting client cache after sync")?;
    }

    Ok(outcome)
}
