//! Post-import enrichment: additive merge of asynchronously fetched
//! partial-field results onto canonical records, plus the bounded-parallel
//! runner that fans lookups out per actor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use carr_core::{ActorRecord, EnrichmentPatch};
use carr_store::{ActorMap, AuthoritativeStore, LookupClient};
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "carr-enrich";

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("lookup {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },
    #[error("lookup {provider} failed: {cause}")]
    Lookup { provider: String, cause: anyhow::Error },
}

fn scalar_is_empty(field: &Option<String>) -> bool {
    field.as_deref().map_or(true, |v| v.trim().is_empty())
}

fn fill_scalar(existing: &mut Option<String>, incoming: &Option<String>) -> bool {
    if scalar_is_empty(existing) && !scalar_is_empty(incoming) {
        *existing = incoming.clone();
        return true;
    }
    false
}

fn adopt_list(existing: &mut Vec<String>, incoming: &Option<Vec<String>>) -> bool {
    match incoming {
        Some(values) if existing.is_empty() && !values.is_empty() => {
            *existing = values.clone();
            true
        }
        _ => false,
    }
}

fn append_deduped(existing: &mut Vec<String>, incoming: &Option<Vec<String>>) -> bool {
    let Some(values) = incoming else { return false };
    let mut changed = false;
    for value in values {
        if !existing.contains(value) {
            existing.push(value.clone());
            changed = true;
        }
    }
    changed
}

/// Apply a partial enrichment result onto a canonical record.
///
/// Enrichment is additive, not corrective: scalars fill only empty slots,
/// non-empty lists are kept as-is so repeated passes cannot grow them
/// (publications are the designated append-only exception, deduplicated by
/// value), and the freshness timestamp is latest-wins. Any subset of
/// fields may be absent; absent never clears anything. Returns whether the
/// record changed.
pub fn merge_enrichment(existing: &mut ActorRecord, incoming: &EnrichmentPatch) -> bool {
    let mut changed = false;

    // A generated placeholder is as good as no name for enrichment.
    if !existing.has_real_name() && !scalar_is_empty(&incoming.name) {
        existing.name = incoming.name.clone();
        changed = true;
    }
    changed |= fill_scalar(&mut existing.first_name, &incoming.first_name);
    changed |= fill_scalar(&mut existing.last_name, &incoming.last_name);
    changed |= fill_scalar(&mut existing.organization, &incoming.organization);
    changed |= fill_scalar(&mut existing.role, &incoming.role);
    changed |= fill_scalar(&mut existing.country, &incoming.country);
    changed |= fill_scalar(&mut existing.sector, &incoming.sector);

    changed |= fill_scalar(&mut existing.enrichment.biography, &incoming.biography);
    changed |= fill_scalar(&mut existing.enrichment.image, &incoming.image);
    changed |= fill_scalar(&mut existing.enrichment.profile_link, &incoming.profile_link);

    changed |= adopt_list(&mut existing.enrichment.topics, &incoming.topics);
    changed |= adopt_list(&mut existing.enrichment.expertise, &incoming.expertise);
    changed |= append_deduped(&mut existing.enrichment.publications, &incoming.publications);
    changed |= adopt_list(&mut existing.enrichment.social_posts, &incoming.social_posts);
    changed |= adopt_list(&mut existing.enrichment.case_studies, &incoming.case_studies);

    if let Some(incoming_ts) = incoming.last_enriched {
        let newer = existing
            .enrichment
            .last_enriched
            .map_or(true, |current| incoming_ts > current);
        if newer {
            existing.enrichment.last_enriched = Some(incoming_ts);
            changed = true;
        }
    }

    for (key, value) in &incoming.extra {
        if !existing.extra.contains_key(key) {
            existing.extra.insert(key.clone(), value.clone());
            changed = true;
        }
    }

    changed
}

/// One external lookup (biography completion, social profile,
/// bibliographic search). Implementations live behind this seam; the
/// runner only sees partial patches and failures.
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn lookup(&self, actor: &ActorRecord) -> Result<EnrichmentPatch>;
}

/// Generic HTTP provider: GETs `{base_url}?actor=<name>&id=<id>` and
/// expects an `EnrichmentPatch` JSON body. Concrete services (biography,
/// profile, publications) are configured instances of this.
pub struct HttpEnrichmentProvider {
    name: String,
    base_url: String,
    client: Arc<LookupClient>,
}

impl HttpEnrichmentProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, client: Arc<LookupClient>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            client,
        }
    }

    fn lookup_url(&self, actor: &ActorRecord) -> String {
        let display = actor.name.as_deref().unwrap_or_default();
        format!(
            "{}?actor={}&id={}",
            self.base_url,
            urlencoding::encode(display),
            urlencoding::encode(&actor.id)
        )
    }
}

#[async_trait]
impl EnrichmentProvider for HttpEnrichmentProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, actor: &ActorRecord) -> Result<EnrichmentPatch> {
        let url = self.lookup_url(actor);
        self.client
            .fetch_json(&self.name, &url)
            .await
            .with_context(|| format!("{} lookup for {}", self.name, actor.id))
    }
}

#[derive(Debug, Clone)]
pub struct EnrichConfig {
    pub store_path: PathBuf,
    pub concurrency: usize,
    pub per_call_timeout: Duration,
    pub batch_size: usize,
    pub batch_spacing: Duration,
}

impl EnrichConfig {
    pub fn from_env() -> Self {
        Self {
            store_path: std::env::var("CARR_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/actors.json")),
            concurrency: std::env::var("CARR_ENRICH_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            per_call_timeout: Duration::from_secs(
                std::env::var("CARR_ENRICH_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(20),
            ),
            batch_size: std::env::var("CARR_ENRICH_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            batch_spacing: Duration::from_millis(
                std::env::var("CARR_ENRICH_BATCH_SPACING_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(500),
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichOutcome {
    pub run_id: Uuid,
    pub actors_considered: usize,
    pub actors_enriched: usize,
    pub lookups_succeeded: usize,
    pub lookups_failed: usize,
}

/// Fans enrichment lookups out per actor with a small worker pool.
///
/// Each actor's lookups run independently: one provider failing or timing
/// out costs only that provider's fields for that actor, never the batch.
/// Batches are spaced apart to stay inside external rate limits.
pub struct EnrichmentRunner {
    providers: Vec<Arc<dyn EnrichmentProvider>>,
    concurrency: usize,
    per_call_timeout: Duration,
    batch_size: usize,
    batch_spacing: Duration,
}

impl EnrichmentRunner {
    pub fn new(config: &EnrichConfig, providers: Vec<Arc<dyn EnrichmentProvider>>) -> Self {
        Self {
            providers,
            concurrency: config.concurrency.max(1),
            per_call_timeout: config.per_call_timeout,
            batch_size: config.batch_size.max(1),
            batch_spacing: config.batch_spacing,
        }
    }

    /// Run every provider for one actor and overlay the partial results.
    /// Failures are captured per provider and reported back alongside
    /// whatever subset succeeded.
    async fn lookup_actor(&self, actor: &ActorRecord) -> (EnrichmentPatch, Vec<EnrichError>) {
        let mut combined = EnrichmentPatch::default();
        let mut failures = Vec::new();

        for provider in &self.providers {
            match tokio::time::timeout(self.per_call_timeout, provider.lookup(actor)).await {
                Ok(Ok(patch)) => {
                    combined = combined.overlay(patch);
                }
                Ok(Err(err)) => {
                    failures.push(EnrichError::Lookup {
                        provider: provider.name().to_string(),
                        cause: err,
                    });
                }
                Err(_) => {
                    failures.push(EnrichError::Timeout {
                        provider: provider.name().to_string(),
                        timeout: self.per_call_timeout,
                    });
                }
            }
        }

        (combined, failures)
    }

    /// Enrich every record in the map in place. Bounded concurrency across
    /// actors, spacing between batches, partial-failure isolation per
    /// lookup.
    pub async fn enrich_all(&self, records: &mut ActorMap) -> EnrichOutcome {
        let run_id = Uuid::new_v4();
        let ids: Vec<String> = records.keys().cloned().collect();
        let actors_considered = ids.len();
        let mut actors_enriched = 0usize;
        let mut lookups_succeeded = 0usize;
        let mut lookups_failed = 0usize;

        let limit = Arc::new(Semaphore::new(self.concurrency));

        for (batch_index, batch) in ids.chunks(self.batch_size).enumerate() {
            if batch_index > 0 && !self.batch_spacing.is_zero() {
                tokio::time::sleep(self.batch_spacing).await;
            }

            let mut pending = Vec::with_capacity(batch.len());
            for id in batch {
                let Some(actor) = records.get(id) else { continue };
                let actor = actor.clone();
                let limit = limit.clone();
                pending.push(async move {
                    let _permit = limit.acquire().await.expect("semaphore not closed");
                    let (patch, failures) = self.lookup_actor(&actor).await;
                    (actor.id, patch, failures)
                });
            }

            for (id, mut patch, failures) in futures::future::join_all(pending).await {
                let provider_count = self.providers.len();
                lookups_failed += failures.len();
                lookups_succeeded += provider_count - failures.len();
                for failure in &failures {
                    warn!(run_id = %run_id, actor = %id, error = %failure, "enrichment lookup failed");
                }
                if patch.is_empty() {
                    continue;
                }
                if failures.len() < provider_count && patch.last_enriched.is_none() {
                    patch.last_enriched = Some(Utc::now());
                }
                if let Some(actor) = records.get_mut(&id) {
                    if merge_enrichment(actor, &patch) {
                        actors_enriched += 1;
                    }
                }
            }
        }

        info!(
            run_id = %run_id,
            actors_considered,
            actors_enriched,
            lookups_succeeded,
            lookups_failed,
            "enrichment run complete"
        );

        EnrichOutcome {
            run_id,
            actors_considered,
            actors_enriched,
            lookups_succeeded,
            lookups_failed,
        }
    }
}

/// Load the store, enrich every actor, and write the result back.
pub async fn run_enrichment_once(
    config: &EnrichConfig,
    providers: Vec<Arc<dyn EnrichmentProvider>>,
) -> Result<EnrichOutcome> {
    let store = AuthoritativeStore::new(&config.store_path);
    let mut records = store
        .load()
        .await
        .context("loading authoritative store for enrichment")?;
    let runner = EnrichmentRunner::new(config, providers);
    let outcome = runner.enrich_all(&mut records).await;
    store
        .replace_all(&records)
        .await
        .context("writing enriched store")?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use carr_store::LookupClientConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn actor(id: &str, name: &str) -> ActorRecord {
        let mut a = ActorRecord::new(id);
        a.name = Some(name.to_string());
        a
    }

    #[test]
    fn empty_incoming_never_clears_populated_fields() {
        let mut existing = actor("a-1", "Jane Doe");
        existing.enrichment.topics = vec!["Digital Identity".into()];
        existing.enrichment.biography = Some("A bio".into());

        let incoming = EnrichmentPatch {
            topics: Some(vec![]),
            ..Default::default()
        };
        let changed = merge_enrichment(&mut existing, &incoming);
        assert!(!changed);
        assert_eq!(existing.enrichment.topics, vec!["Digital Identity".to_string()]);
        assert_eq!(existing.enrichment.biography.as_deref(), Some("A bio"));
    }

    #[test]
    fn scalars_fill_only_empty_slots() {
        let mut existing = actor("a-1", "Jane Doe");
        existing.enrichment.biography = Some("Original bio".into());

        let incoming = EnrichmentPatch {
            biography: Some("Replacement bio".into()),
            image: Some("https://example.com/jane.png".into()),
            ..Default::default()
        };
        assert!(merge_enrichment(&mut existing, &incoming));
        assert_eq!(existing.enrichment.biography.as_deref(), Some("Original bio"));
        assert_eq!(
            existing.enrichment.image.as_deref(),
            Some("https://example.com/jane.png")
        );
    }

    #[test]
    fn placeholder_name_yields_to_enriched_name() {
        let mut existing = actor("4821", "Actor 4821");
        let incoming = EnrichmentPatch {
            name: Some("Jane Doe".into()),
            ..Default::default()
        };
        assert!(merge_enrichment(&mut existing, &incoming));
        assert_eq!(existing.name.as_deref(), Some("Jane Doe"));

        // A real name is never replaced.
        let again = EnrichmentPatch {
            name: Some("J. Doe".into()),
            ..Default::default()
        };
        merge_enrichment(&mut existing, &again);
        assert_eq!(existing.name.as_deref(), Some("Jane Doe"));
    }

    #[test]
    fn non_empty_lists_are_kept_as_is() {
        let mut existing = actor("a-1", "Jane Doe");
        existing.enrichment.topics = vec!["Digital Identity".into()];

        let incoming = EnrichmentPatch {
            topics: Some(vec!["Surveillance".into(), "Privacy".into()]),
            ..Default::default()
        };
        merge_enrichment(&mut existing, &incoming);
        assert_eq!(existing.enrichment.topics, vec!["Digital Identity".to_string()]);
    }

    #[test]
    fn publications_append_with_value_dedup() {
        let mut existing = actor("a-1", "Jane Doe");
        existing.enrichment.publications = vec!["Paper A".into()];

        let incoming = EnrichmentPatch {
            publications: Some(vec!["Paper A".into(), "Paper B".into()]),
            ..Default::default()
        };
        assert!(merge_enrichment(&mut existing, &incoming));
        assert_eq!(
            existing.enrichment.publications,
            vec!["Paper A".to_string(), "Paper B".to_string()]
        );

        // Re-applying the same result is a no-op.
        assert!(!merge_enrichment(&mut existing, &incoming));
        assert_eq!(existing.enrichment.publications.len(), 2);
    }

    #[test]
    fn freshness_timestamp_is_latest_wins() {
        let older = Utc::now() - chrono::Duration::hours(3);
        let newer = Utc::now();

        let mut existing = actor("a-1", "Jane Doe");
        existing.enrichment.last_enriched = Some(newer);
        let incoming = EnrichmentPatch {
            last_enriched: Some(older),
            ..Default::default()
        };
        assert!(!merge_enrichment(&mut existing, &incoming));
        assert_eq!(existing.enrichment.last_enriched, Some(newer));

        let fresher = EnrichmentPatch {
            last_enriched: Some(newer + chrono::Duration::minutes(5)),
            ..Default::default()
        };
        assert!(merge_enrichment(&mut existing, &fresher));
    }

    struct StaticProvider {
        name: &'static str,
        patch: EnrichmentPatch,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EnrichmentProvider for StaticProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn lookup(&self, _actor: &ActorRecord) -> Result<EnrichmentPatch> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.patch.clone())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl EnrichmentProvider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }

        async fn lookup(&self, _actor: &ActorRecord) -> Result<EnrichmentPatch> {
            anyhow::bail!("upstream unavailable")
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl EnrichmentProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }

        async fn lookup(&self, _actor: &ActorRecord) -> Result<EnrichmentPatch> {
            tokio::time::sleep(Duration::from_millis(250)).await;
            Ok(EnrichmentPatch {
                image: Some("https://example.com/too-late.png".into()),
                ..Default::default()
            })
        }
    }

    fn test_config() -> EnrichConfig {
        EnrichConfig {
            store_path: PathBuf::from("unused"),
            concurrency: 3,
            per_call_timeout: Duration::from_millis(50),
            batch_size: 10,
            batch_spacing: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn failing_lookup_does_not_block_other_providers_or_actors() {
        let bio = Arc::new(StaticProvider {
            name: "biography",
            patch: EnrichmentPatch {
                biography: Some("Found bio".into()),
                ..Default::default()
            },
            calls: AtomicUsize::new(0),
        });

        let runner = EnrichmentRunner::new(
            &test_config(),
            vec![bio.clone(), Arc::new(FailingProvider)],
        );

        let mut records = ActorMap::new();
        records.insert("a-1".into(), actor("a-1", "Jane Doe"));
        records.insert("a-2".into(), actor("a-2", "Sam Spade"));

        let outcome = runner.enrich_all(&mut records).await;
        assert_eq!(outcome.actors_considered, 2);
        assert_eq!(outcome.actors_enriched, 2);
        assert_eq!(outcome.lookups_failed, 2);
        assert_eq!(outcome.lookups_succeeded, 2);
        assert_eq!(bio.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            records["a-1"].enrichment.biography.as_deref(),
            Some("Found bio")
        );
        assert!(records["a-1"].enrichment.last_enriched.is_some());
    }

    #[tokio::test]
    async fn slow_lookup_times_out_in_isolation() {
        let bio = Arc::new(StaticProvider {
            name: "biography",
            patch: EnrichmentPatch {
                biography: Some("Found bio".into()),
                ..Default::default()
            },
            calls: AtomicUsize::new(0),
        });

        let runner = EnrichmentRunner::new(&test_config(), vec![bio, Arc::new(SlowProvider)]);

        let mut records = ActorMap::new();
        records.insert("a-1".into(), actor("a-1", "Jane Doe"));

        let outcome = runner.enrich_all(&mut records).await;
        assert_eq!(outcome.lookups_failed, 1);
        assert_eq!(outcome.lookups_succeeded, 1);
        assert!(records["a-1"].enrichment.image.is_none());
        assert_eq!(
            records["a-1"].enrichment.biography.as_deref(),
            Some("Found bio")
        );
    }

    #[test]
    fn lookup_url_escapes_name_and_id() {
        let client = Arc::new(LookupClient::new(LookupClientConfig::default()).expect("client"));
        let provider = HttpEnrichmentProvider::new("biography", "https://example.com/bio", client);
        let subject = actor("a/1?x", "Jane Doe");
        assert_eq!(
            provider.lookup_url(&subject),
            "https://example.com/bio?actor=Jane%20Doe&id=a%2F1%3Fx"
        );
    }
}
