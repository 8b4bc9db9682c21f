//! Core domain model and provenance types for CARR.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "carr-core";

/// Where a record (or the pass that minted its id) came from. Explicit
/// attribute rather than an id-prefix convention, so tie-breaks never have
/// to sniff identifier strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Scrape,
    #[default]
    BulkImport,
    Enrichment,
    Repair,
}

impl Provenance {
    /// Scrape-path records are treated as more authoritative than records
    /// synthesized by repair or enrichment passes when richness ties.
    pub fn authority_rank(self) -> u8 {
        match self {
            Provenance::Scrape => 3,
            Provenance::BulkImport => 2,
            Provenance::Enrichment => 1,
            Provenance::Repair => 0,
        }
    }
}

/// Optional fields populated post-import by asynchronous lookups, grouped
/// by concern instead of inlined into the identity core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Enrichment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub biography: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_link: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expertise: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publications: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub social_posts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub case_studies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_enriched: Option<DateTime<Utc>>,
}

impl Enrichment {
    pub fn is_empty(&self) -> bool {
        self.biography.is_none()
            && self.image.is_none()
            && self.profile_link.is_none()
            && self.topics.is_empty()
            && self.expertise.is_empty()
            && self.publications.is_empty()
            && self.social_posts.is_empty()
            && self.case_studies.is_empty()
            && self.last_enriched.is_none()
    }
}

/// Canonical persisted representation of one conference participant.
///
/// The identity core is structured; fields new enrichment lookups invent
/// land in `extra` without a schema change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    #[serde(default)]
    pub provenance: Provenance,
    #[serde(default)]
    pub enrichment: Enrichment,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ActorRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            first_name: None,
            last_name: None,
            organization: None,
            role: None,
            country: None,
            sector: None,
            provenance: Provenance::default(),
            enrichment: Enrichment::default(),
            extra: BTreeMap::new(),
        }
    }

    /// A real display name: present, non-blank, and not a generated
    /// placeholder.
    pub fn has_real_name(&self) -> bool {
        match self.name.as_deref() {
            Some(name) => !name.trim().is_empty() && !is_placeholder_name(name, &self.id),
            None => false,
        }
    }

    /// Structured name pair, both halves non-blank.
    pub fn name_pair(&self) -> Option<(&str, &str)> {
        match (self.first_name.as_deref(), self.last_name.as_deref()) {
            (Some(first), Some(last)) if !first.trim().is_empty() && !last.trim().is_empty() => {
                Some((first, last))
            }
            _ => None,
        }
    }

    /// True when the record carries no identity signal at all (no display
    /// name beyond a placeholder, no structured name pair). Such records
    /// stay singletons until enrichment supplies a name.
    pub fn is_unresolvable(&self) -> bool {
        !self.has_real_name() && self.name_pair().is_none()
    }
}

/// Generated placeholder names look like `Actor 4821` or `Actor <own id>`.
/// They identify nothing and never participate in name matching.
pub fn is_placeholder_name(name: &str, id: &str) -> bool {
    let trimmed = name.trim();
    match trimmed.strip_prefix("Actor ") {
        Some(rest) if !rest.is_empty() => {
            rest == id || rest.chars().all(|c| c.is_ascii_digit())
        }
        _ => false,
    }
}

/// Partial-field update produced by asynchronous enrichment lookups. Any
/// subset of fields may be present; absent means "lookup produced nothing
/// (or failed)", never "clear this field".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub biography: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expertise: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publications: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub social_posts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_studies: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_enriched: Option<DateTime<Utc>>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl EnrichmentPatch {
    pub fn is_empty(&self) -> bool {
        self == &EnrichmentPatch::default()
    }

    /// Field-wise overlay of two patches from independent lookups; `self`
    /// wins where both populated the same field.
    pub fn overlay(mut self, other: EnrichmentPatch) -> EnrichmentPatch {
        macro_rules! take_if_absent {
            ($field:ident) => {
                if self.$field.is_none() {
                    self.$field = other.$field;
                }
            };
        }
        take_if_absent!(name);
        take_if_absent!(first_name);
        take_if_absent!(last_name);
        take_if_absent!(organization);
        take_if_absent!(role);
        take_if_absent!(country);
        take_if_absent!(sector);
        take_if_absent!(biography);
        take_if_absent!(image);
        take_if_absent!(profile_link);
        take_if_absent!(topics);
        take_if_absent!(expertise);
        take_if_absent!(publications);
        take_if_absent!(social_posts);
        take_if_absent!(case_studies);
        if self.last_enriched.map_or(true, |mine| {
            other.last_enriched.is_some_and(|theirs| theirs > mine)
        }) {
            if let Some(theirs) = other.last_enriched {
                self.last_enriched = Some(theirs);
            }
        }
        for (key, value) in other.extra {
            self.extra.entry(key).or_insert(value);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_names_are_detected() {
        assert!(is_placeholder_name("Actor 4821", "a-77"));
        assert!(is_placeholder_name("Actor a-77", "a-77"));
        assert!(!is_placeholder_name("Actor Smith", "a-77"));
        assert!(!is_placeholder_name("Jane Doe", "a-77"));
        assert!(!is_placeholder_name("Actor ", "a-77"));
    }

    #[test]
    fn real_name_excludes_placeholders_and_blanks() {
        let mut actor = ActorRecord::new("a-1");
        assert!(!actor.has_real_name());
        actor.name = Some("  ".into());
        assert!(!actor.has_real_name());
        actor.name = Some("Actor 4821".into());
        assert!(!actor.has_real_name());
        actor.name = Some("Jane Doe".into());
        assert!(actor.has_real_name());
    }

    #[test]
    fn unresolvable_requires_no_signal_at_all() {
        let mut actor = ActorRecord::new("a-2");
        actor.name = Some("Actor 99".into());
        assert!(actor.is_unresolvable());
        actor.first_name = Some("Jane".into());
        assert!(actor.is_unresolvable());
        actor.last_name = Some("Doe".into());
        assert!(!actor.is_unresolvable());
    }

    #[test]
    fn patch_overlay_prefers_first_and_newest_timestamp() {
        let older = Utc::now() - chrono::Duration::hours(2);
        let newer = Utc::now();
        let a = EnrichmentPatch {
            biography: Some("from lookup A".into()),
            last_enriched: Some(older),
            ..Default::default()
        };
        let b = EnrichmentPatch {
            biography: Some("from lookup B".into()),
            profile_link: Some("https://example.com/jane".into()),
            last_enriched: Some(newer),
            ..Default::default()
        };
        let merged = a.overlay(b);
        assert_eq!(merged.biography.as_deref(), Some("from lookup A"));
        assert_eq!(merged.profile_link.as_deref(), Some("https://example.com/jane"));
        assert_eq!(merged.last_enriched, Some(newer));
    }

    #[test]
    fn record_round_trips_with_extra_bag() {
        let mut actor = ActorRecord::new("a-3");
        actor.name = Some("Jane Doe".into());
        actor
            .extra
            .insert("pronouns".into(), serde_json::json!("they/them"));
        let json = serde_json::to_string(&actor).unwrap();
        let back: ActorRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, actor);
        assert_eq!(back.extra["pronouns"], serde_json::json!("they/them"));
    }
}
