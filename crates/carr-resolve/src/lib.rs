//! Identity resolution, deduplication, and non-destructive merge for the
//! actor registry: canonical comparison keys, richness scoring, grouping
//! into equivalence classes, survivor selection, and the batch pass that
//! atomically replaces the authoritative store.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use carr_core::ActorRecord;
use carr_store::{ActorMap, AuthoritativeStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "carr-resolve";

pub const UNKNOWN_ORGANIZATION: &str = "Unknown Organization";
/// Name keys are case-folded, so the sentinel is the folded form.
pub const UNKNOWN_NAME: &str = "unknown";

#[derive(Debug, Clone, Deserialize)]
struct AliasFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    aliases: Vec<AliasEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct AliasEntry {
    canonical: String,
    #[serde(default)]
    variants: Vec<String>,
}

/// Static variant -> canonical organization-name mapping, loaded once and
/// consulted read-only. Every canonical form is registered as its own
/// variant, which is what makes `canonicalize_org` idempotent even for
/// acronym-cased canonicals like "IBM".
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    by_variant: HashMap<String, String>,
}

impl AliasTable {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading alias table {}", path.display()))?;
        let file: AliasFile = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing alias table {}", path.display()))?;
        let pairs = file.aliases.into_iter().flat_map(|entry| {
            let canonical = entry.canonical;
            entry
                .variants
                .into_iter()
                .chain(std::iter::once(canonical.clone()))
                .map(move |variant| (variant, canonical.clone()))
        });
        Ok(Self::from_pairs(pairs))
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut by_variant = HashMap::new();
        for (variant, canonical) in pairs {
            by_variant.insert(fold_key(&variant), canonical.clone());
            // Self-register the canonical form for idempotence.
            by_variant.entry(fold_key(&canonical)).or_insert(canonical);
        }
        Self { by_variant }
    }

    pub fn resolve(&self, candidate: &str) -> Option<&str> {
        self.by_variant.get(&fold_key(candidate)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_variant.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_variant.is_empty()
    }
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn fold_key(raw: &str) -> String {
    collapse_whitespace(raw).to_lowercase()
}

fn title_case_word(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

/// Normalize a raw organization string into its canonical display form:
/// whitespace collapse, per-word title case, then a case-insensitive alias
/// lookup. Empty input maps to a sentinel. Idempotent.
pub fn canonicalize_org(raw: &str, aliases: &AliasTable) -> String {
    let collapsed = collapse_whitespace(raw);
    if collapsed.is_empty() {
        return UNKNOWN_ORGANIZATION.to_string();
    }
    let titled = collapsed
        .split(' ')
        .map(title_case_word)
        .collect::<Vec<_>>()
        .join(" ");
    match aliases.resolve(&titled) {
        Some(canonical) => canonical.to_string(),
        None => titled,
    }
}

/// Normalize a person name into a comparison key (never a display value):
/// whitespace collapse plus case folding. Empty input maps to a sentinel.
/// Idempotent.
pub fn canonicalize_name(raw: &str) -> String {
    let folded = fold_key(raw);
    if folded.is_empty() {
        UNKNOWN_NAME.to_string()
    } else {
        folded
    }
}

/// Deterministic completeness score used to pick a merge survivor. Purely
/// additive over field presence, so populating a field never lowers the
/// score and a strict superset of fields never scores lower.
pub fn richness(record: &ActorRecord) -> u32 {
    let mut score = 0;
    if record.has_real_name() {
        score += 10;
    }
    if record.name_pair().is_some() {
        score += 5;
    }
    if is_populated(&record.organization) {
        score += 3;
    }
    if is_populated(&record.role) {
        score += 2;
    }
    if is_populated(&record.enrichment.image) {
        score += 2;
    }
    if is_populated(&record.country) {
        score += 1;
    }
    if is_populated(&record.enrichment.profile_link) {
        score += 3;
    }
    if !record.enrichment.publications.is_empty() {
        score += 2;
    }
    if !record.enrichment.case_studies.is_empty() {
        score += 5;
    }
    if record.enrichment.last_enriched.is_some() {
        score += 3;
    }
    if !record.enrichment.topics.is_empty() {
        score += 2;
    }
    if !record.enrichment.expertise.is_empty() {
        score += 2;
    }
    score
}

fn is_populated(field: &Option<String>) -> bool {
    field.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Canonical-name comparison key: from the display name when it is real,
/// otherwise derived from the structured pair, so `name: "Jane Doe"` on
/// one record matches `firstName/lastName: Jane/Doe` on another.
fn name_key_for(record: &ActorRecord) -> Option<String> {
    if record.has_real_name() {
        Some(canonicalize_name(record.name.as_deref().unwrap_or_default()))
    } else {
        record
            .name_pair()
            .map(|(first, last)| canonicalize_name(&format!("{first} {last}")))
    }
}

/// First+last comparison key, derived from a two-word real display name
/// when no structured pair was supplied. Placeholder names never derive a
/// pair.
fn pair_key_for(record: &ActorRecord) -> Option<String> {
    if let Some((first, last)) = record.name_pair() {
        return Some(format!("{}\u{1f}{}", fold_key(first), fold_key(last)));
    }
    if record.has_real_name() {
        let name = collapse_whitespace(record.name.as_deref().unwrap_or_default());
        let words: Vec<&str> = name.split(' ').collect();
        if let [first, last] = words[..] {
            return Some(format!("{}\u{1f}{}", fold_key(first), fold_key(last)));
        }
    }
    None
}

/// Groups source records into equivalence classes, one per real identity.
/// Each record is matched against the classes accumulated so far, so the
/// resolver works over a stream in deterministic input order.
pub struct IdentityResolver<'a> {
    aliases: &'a AliasTable,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(aliases: &'a AliasTable) -> Self {
        Self { aliases }
    }

    pub fn partition(&self, records: impl IntoIterator<Item = ActorRecord>) -> Vec<Vec<ActorRecord>> {
        let mut groups: Vec<Vec<ActorRecord>> = Vec::new();
        let mut by_id: HashMap<String, usize> = HashMap::new();
        let mut by_name_key: HashMap<String, usize> = HashMap::new();
        let mut by_pair_key: HashMap<String, usize> = HashMap::new();
        let mut by_org_role: HashMap<String, Vec<usize>> = HashMap::new();

        for record in records {
            let name_key = name_key_for(&record);
            let pair_key = pair_key_for(&record);
            let org_role_key = self.org_role_key(&record);

            let target = self.find_group(
                &record,
                name_key.as_deref(),
                pair_key.as_deref(),
                org_role_key.as_deref(),
                &groups,
                &by_id,
                &by_name_key,
                &by_pair_key,
                &by_org_role,
            );

            let idx = match target {
                Some(idx) => {
                    groups[idx].push(record);
                    idx
                }
                None => {
                    groups.push(vec![record]);
                    groups.len() - 1
                }
            };

            let newcomer = groups[idx].last().expect("group just received a record");
            by_id.entry(newcomer.id.clone()).or_insert(idx);
            if let Some(key) = name_key {
                by_name_key.entry(key).or_insert(idx);
            }
            if let Some(key) = pair_key {
                by_pair_key.entry(key).or_insert(idx);
            }
            if let Some(key) = org_role_key {
                let members = by_org_role.entry(key).or_default();
                if !members.contains(&idx) {
                    members.push(idx);
                }
            }
        }

        groups
    }

    fn org_role_key(&self, record: &ActorRecord) -> Option<String> {
        let org = record.organization.as_deref().filter(|o| !o.trim().is_empty())?;
        let role = record.role.as_deref().filter(|r| !r.trim().is_empty())?;
        Some(format!(
            "{}\u{1f}{}",
            fold_key(&canonicalize_org(org, self.aliases)),
            fold_key(role)
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn find_group(
        &self,
        record: &ActorRecord,
        name_key: Option<&str>,
        pair_key: Option<&str>,
        org_role_key: Option<&str>,
        groups: &[Vec<ActorRecord>],
        by_id: &HashMap<String, usize>,
        by_name_key: &HashMap<String, usize>,
        by_pair_key: &HashMap<String, usize>,
        by_org_role: &HashMap<String, Vec<usize>>,
    ) -> Option<usize> {
        // 1. Literal id collision. Should not occur post-assignment, but a
        // shared id is always the same identity.
        if let Some(&idx) = by_id.get(&record.id) {
            return Some(idx);
        }

        // 2. Exact canonical name match (placeholders excluded upstream).
        if let Some(key) = name_key {
            if let Some(&idx) = by_name_key.get(key) {
                return Some(idx);
            }
        }

        // 3. Structured first+last pair, independent of the display name.
        if let Some(key) = pair_key {
            if let Some(&idx) = by_pair_key.get(key) {
                return Some(idx);
            }
        }

        // 4. Organization+role is only a confirmation signal: same job
        // title at the same employer is routinely two different people, so
        // it links nothing without a shared name or name pair.
        if let Some(key) = org_role_key {
            if let Some(candidates) = by_org_role.get(key) {
                for &idx in candidates {
                    if groups[idx].iter().any(|other| self.shares_name(record, other)) {
                        return Some(idx);
                    }
                }
            }
        }

        None
    }

    fn shares_name(&self, a: &ActorRecord, b: &ActorRecord) -> bool {
        let name_match = match (name_key_for(a), name_key_for(b)) {
            (Some(ka), Some(kb)) => ka == kb,
            _ => false,
        };
        let pair_match = match (pair_key_for(a), pair_key_for(b)) {
            (Some(ka), Some(kb)) => ka == kb,
            _ => false,
        };
        name_match || pair_match
    }
}

/// Result of collapsing one equivalence class: the surviving record (field
/// union applied) and the ids retired by the merge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeOutcome {
    pub survivor: ActorRecord,
    pub retired: Vec<String>,
}

/// Collapse an equivalence class to one survivor. Highest richness wins;
/// ties prefer scrape/bulk-import provenance over repair-pass synthesis,
/// then the first record in input order. Losing members donate every field
/// the survivor lacks; nothing populated on the survivor is overwritten.
pub fn merge_group(group: Vec<ActorRecord>) -> MergeOutcome {
    debug_assert!(!group.is_empty(), "merge_group requires at least one record");

    let mut best: usize = 0;
    let mut best_score = 0u32;
    for (idx, record) in group.iter().enumerate() {
        let score = richness(record);
        let better = if idx == 0 {
            true
        } else {
            score > best_score
                || (score == best_score
                    && record.provenance.authority_rank()
                        > group[best].provenance.authority_rank())
        };
        if better {
            best = idx;
            best_score = score;
        }
    }

    let mut retired = Vec::new();
    let mut survivor = group[best].clone();
    for (idx, donor) in group.iter().enumerate() {
        if idx == best {
            continue;
        }
        fill_missing(&mut survivor, donor);
        if donor.id != survivor.id {
            retired.push(donor.id.clone());
        }
    }

    MergeOutcome { survivor, retired }
}

fn fill_scalar(target: &mut Option<String>, donor: &Option<String>) {
    if !is_populated(target) && is_populated(donor) {
        *target = donor.clone();
    }
}

fn fill_list(target: &mut Vec<String>, donor: &[String]) {
    if target.is_empty() && !donor.is_empty() {
        *target = donor.to_vec();
    }
}

/// Field-level union half: copy every field populated on `donor` but empty
/// on `survivor`. The survivor's own values are never touched.
fn fill_missing(survivor: &mut ActorRecord, donor: &ActorRecord) {
    if survivor.name.as_deref().map_or(true, |n| n.trim().is_empty()) && donor.name.is_some() {
        survivor.name = donor.name.clone();
    } else if !survivor.has_real_name() && donor.has_real_name() {
        // A placeholder yields to a real display name.
        survivor.name = donor.name.clone();
    }
    fill_scalar(&mut survivor.first_name, &donor.first_name);
    fill_scalar(&mut survivor.last_name, &donor.last_name);
    fill_scalar(&mut survivor.organization, &donor.organization);
    fill_scalar(&mut survivor.role, &donor.role);
    fill_scalar(&mut survivor.country, &donor.country);
    fill_scalar(&mut survivor.sector, &donor.sector);

    fill_scalar(&mut survivor.enrichment.biography, &donor.enrichment.biography);
    fill_scalar(&mut survivor.enrichment.image, &donor.enrichment.image);
    fill_scalar(
        &mut survivor.enrichment.profile_link,
        &donor.enrichment.profile_link,
    );
    fill_list(&mut survivor.enrichment.topics, &donor.enrichment.topics);
    fill_list(&mut survivor.enrichment.expertise, &donor.enrichment.expertise);
    fill_list(
        &mut survivor.enrichment.publications,
        &donor.enrichment.publications,
    );
    fill_list(
        &mut survivor.enrichment.social_posts,
        &donor.enrichment.social_posts,
    );
    fill_list(
        &mut survivor.enrichment.case_studies,
        &donor.enrichment.case_studies,
    );
    if survivor.enrichment.last_enriched.is_none() {
        survivor.enrichment.last_enriched = donor.enrichment.last_enriched;
    }

    for (key, value) in &donor.extra {
        survivor
            .extra
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
}

#[derive(Debug, Clone)]
pub struct ResolveConfig {
    pub store_path: PathBuf,
    pub alias_path: PathBuf,
}

impl ResolveConfig {
    pub fn from_env() -> Self {
        Self {
            store_path: std::env::var("CARR_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/actors.json")),
            alias_path: std::env::var("CARR_ALIAS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("aliases.yaml")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolveSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input_records: usize,
    pub groups: usize,
    pub merged_groups: usize,
    pub surviving_records: usize,
    pub unresolved_singletons: usize,
    /// Retired id -> surviving id, for redirecting any index that still
    /// references a merged-away record.
    pub retired: BTreeMap<String, String>,
}

/// Single-threaded batch pass: snapshot the authoritative store, resolve
/// and merge, then atomically replace it. A corrupt store aborts the pass
/// before anything is written, preserving the last good file.
pub struct ResolvePass {
    store: AuthoritativeStore,
    aliases: AliasTable,
}

impl ResolvePass {
    pub fn new(config: &ResolveConfig) -> Result<Self> {
        let aliases = if config.alias_path.exists() {
            AliasTable::load(&config.alias_path)?
        } else {
            AliasTable::default()
        };
        Ok(Self {
            store: AuthoritativeStore::new(&config.store_path),
            aliases,
        })
    }

    pub fn with_parts(store: AuthoritativeStore, aliases: AliasTable) -> Self {
        Self { store, aliases }
    }

    pub async fn run_once(&self) -> Result<ResolveSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let snapshot = self
            .store
            .load()
            .await
            .context("loading authoritative store snapshot")?;
        let input_records = snapshot.len();

        // BTreeMap iteration gives a stable, reproducible input order, so
        // richness ties always break the same way across runs.
        let resolver = IdentityResolver::new(&self.aliases);
        let groups = resolver.partition(snapshot.into_values());
        let group_count = groups.len();

        let mut next = ActorMap::new();
        let mut retired: BTreeMap<String, String> = BTreeMap::new();
        let mut merged_groups = 0usize;
        let mut unresolved_singletons = 0usize;

        for group in groups {
            if group.len() == 1 && group[0].is_unresolvable() {
                unresolved_singletons += 1;
                warn!(
                    id = %group[0].id,
                    "record has no identity signal; left as singleton pending enrichment"
                );
            }
            if group.len() > 1 {
                merged_groups += 1;
            }
            let member_ids: Vec<String> = group.iter().map(|r| r.id.clone()).collect();
            let outcome = merge_group(group);
            if !outcome.retired.is_empty() {
                info!(
                    run_id = %run_id,
                    survivor = %outcome.survivor.id,
                    richness = richness(&outcome.survivor),
                    members = ?member_ids,
                    retired = ?outcome.retired,
                    "merged duplicate group"
                );
            }
            for id in outcome.retired {
                retired.insert(id, outcome.survivor.id.clone());
            }
            next.insert(outcome.survivor.id.clone(), outcome.survivor);
        }

        let surviving_records = next.len();
        self.store
            .replace_all(&next)
            .await
            .context("replacing authoritative store after resolve pass")?;

        let finished_at = Utc::now();
        info!(
            run_id = %run_id,
            input_records,
            groups = group_count,
            merged_groups,
            surviving_records,
            retired = retired.len(),
            "resolve pass complete"
        );

        Ok(ResolveSummary {
            run_id,
            started_at,
            finished_at,
            input_records,
            groups: group_count,
            merged_groups,
            surviving_records,
            unresolved_singletons,
            retired,
        })
    }
}
