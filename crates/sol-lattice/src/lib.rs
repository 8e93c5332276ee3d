// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-user memory retrieval and policy-capsule assembly (C4).
#![deny(unsafe_code)]

use std::collections::HashSet;
use std::time::SystemTime;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Byte budget for the assembled lattice item list.
pub const BYTE_BUDGET: usize = 8 * 1024;

/// Maximum number of query terms considered.
pub const MAX_QUERY_TERMS: usize = 12;

const MAX_LEXICAL_RESULTS: usize = 6;
const MAX_ADR_CAPSULES: usize = 4;
const MAX_OTHER_CAPSULES: usize = 4;

/// Keyword set that, combined with risk/intent, triggers policy-capsule
/// loading (shared with `sol_gates::POLICY_KEYWORDS`).
pub const POLICY_TRIGGER_KEYWORDS: &[&str] = &[
    "policy", "safety", "constraint", "governance", "rule", "journal", "consent",
    "self-harm", "suicide", "violence", "abuse", "hate", "escalate", "crisis",
    "privacy", "security",
];

/// Tokenize `message` into deduplicated, lowercased alphanumeric terms of
/// at least 3 characters, capped at [`MAX_QUERY_TERMS`].
pub fn query_terms(message: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut terms = Vec::new();
    for raw in message.split(|c: char| !c.is_alphanumeric()) {
        let term = raw.to_lowercase();
        if term.len() < 3 || !seen.insert(term.clone()) {
            continue;
        }
        terms.push(term);
        if terms.len() == MAX_QUERY_TERMS {
            break;
        }
    }
    terms
}

/// Whether policy capsules should be loaded for this turn (§4.4).
pub fn should_load_capsules(risk_med_or_high: bool, message: &str, intent_support: bool) -> bool {
    if risk_med_or_high {
        return true;
    }
    let lower = message.to_lowercase();
    if POLICY_TRIGGER_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return true;
    }
    intent_support && lower.contains("should i")
}

/// One hit from the lexical or vector memory search.
#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub id: String,
    pub summary: String,
    pub score: f64,
}

/// Backing memory search used by the lattice (injected so the orchestrator
/// can swap a real store in for the in-memory/test one).
pub trait MemorySearch {
    fn search_lexical(&self, user_id: &str, terms: &[String], limit: usize) -> Vec<MemoryHit>;
    fn search_vector(
        &self,
        user_id: &str,
        embedding: &[f32],
        limit: usize,
        max_distance: Option<f64>,
    ) -> Vec<MemoryHit>;
}

/// A deterministic stand-in embedding: a 16-dim bag-of-character-ngram hash,
/// good enough to exercise the vector-search code path without a real model
/// (network/model I/O is out of scope, §1).
pub fn deterministic_embedding(message: &str) -> Vec<f32> {
    let mut vec = [0f32; 16];
    for (i, byte) in message.bytes().enumerate() {
        vec[i % 16] += byte as f32;
    }
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt().max(1.0);
    vec.iter().map(|v| v / norm).collect()
}

/// A policy capsule loaded from the policy bundle file.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PolicyCapsule {
    pub id: String,
    pub title: String,
    pub snippet: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The kind of a retrieved [`LatticeItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LatticeItemKind {
    Memory,
    Policy,
    Memento,
    Bookmark,
}

/// One item assembled into the prompt pack's retrieval section.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LatticeItem {
    pub id: String,
    pub kind: LatticeItemKind,
    pub summary: String,
}

/// Retrieval outcome status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LatticeStatus {
    Hit,
    Miss,
    Fail,
}

/// The `meta.lattice` / trace stamp produced alongside the retrieved items.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LatticeMeta {
    pub status: LatticeStatus,
    pub counts: usize,
    pub bytes_total: usize,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// A policy-bundle file cache keyed by path + mtime (§5): re-reads only
/// when the file's modification time changes, last-write-wins under
/// contention.
pub struct PolicyBundleCache {
    path: String,
    cached: Option<(SystemTime, Vec<PolicyCapsule>)>,
}

impl PolicyBundleCache {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), cached: None }
    }

    /// Load the bundle, refreshing from disk only if the file's mtime has
    /// changed since the last load.
    pub fn load(&mut self) -> &[PolicyCapsule] {
        let mtime = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        let stale = match (&self.cached, mtime) {
            (Some((cached_mtime, _)), Some(current)) => *cached_mtime != current,
            (None, _) => true,
            (Some(_), None) => false,
        };
        if stale {
            let capsules = std::fs::read_to_string(&self.path)
                .ok()
                .and_then(|s| serde_json::from_str::<Vec<PolicyCapsule>>(&s).ok())
                .unwrap_or_default();
            self.cached = Some((mtime.unwrap_or(SystemTime::UNIX_EPOCH), capsules));
        }
        &self.cached.as_ref().expect("just populated").1
    }
}

fn capsule_score(capsule: &PolicyCapsule, terms: &[String]) -> usize {
    let haystack = format!("{} {} {}", capsule.title, capsule.snippet, capsule.tags.join(" ")).to_lowercase();
    terms.iter().filter(|t| haystack.contains(t.as_str())).count()
}

/// Score, sort, and split capsules into ADR-prefixed and other buckets
/// (§4.4), each capped at 4, ADR first.
pub fn select_capsules<'a>(capsules: &'a [PolicyCapsule], terms: &[String]) -> Vec<&'a PolicyCapsule> {
    let mut scored: Vec<(&PolicyCapsule, usize)> = capsules
        .iter()
        .map(|c| (c, capsule_score(c, terms)))
        .filter(|(_, score)| *score > 0)
        .collect();
    scored.sort_by(|a, b| b.1.cmp(&a.1));

    let (adr, other): (Vec<_>, Vec<_>) = scored
        .into_iter()
        .map(|(c, _)| c)
        .partition(|c| c.id.starts_with("ADR-"));

    adr.into_iter()
        .take(MAX_ADR_CAPSULES)
        .chain(other.into_iter().take(MAX_OTHER_CAPSULES))
        .collect()
}

/// Assemble memory hits and selected capsules into a byte-budgeted item
/// list, stopping (and warning) if the budget would be exceeded.
pub fn assemble(
    memory_hits: &[MemoryHit],
    capsules: &[&PolicyCapsule],
) -> (Vec<LatticeItem>, LatticeMeta) {
    let mut items = Vec::new();
    let mut bytes = 0usize;
    let mut warnings = Vec::new();
    let mut capped = false;

    let candidates: Vec<LatticeItem> = memory_hits
        .iter()
        .map(|h| LatticeItem { id: h.id.clone(), kind: LatticeItemKind::Memory, summary: h.summary.clone() })
        .chain(capsules.iter().map(|c| LatticeItem {
            id: c.id.clone(),
            kind: LatticeItemKind::Policy,
            summary: c.snippet.clone(),
        }))
        .collect();

    for item in candidates {
        let item_bytes = item.summary.len() + item.id.len();
        if bytes + item_bytes > BYTE_BUDGET {
            capped = true;
            break;
        }
        bytes += item_bytes;
        items.push(item);
    }

    if capped {
        warnings.push("lattice_bytes_capped".to_string());
    }

    let status = if items.is_empty() { LatticeStatus::Miss } else { LatticeStatus::Hit };

    (
        items.clone(),
        LatticeMeta { status, counts: items.len(), bytes_total: bytes, warnings },
    )
}

/// Run the full retrieval procedure for one turn (§4.4): lexical search,
/// optional vector search, optional capsule selection, byte-budgeted
/// assembly. Returns `Fail` status (empty items) if `user_id` is absent or
/// query terms are empty, per the stated precondition.
pub fn retrieve(
    store: &dyn MemorySearch,
    user_id: Option<&str>,
    message: &str,
    vector_enabled: bool,
    vector_max_distance: Option<f64>,
    capsules: &[PolicyCapsule],
    risk_med_or_high: bool,
    intent_support: bool,
) -> (Vec<LatticeItem>, LatticeMeta) {
    let Some(user_id) = user_id else {
        return (vec![], LatticeMeta { status: LatticeStatus::Fail, counts: 0, bytes_total: 0, warnings: vec!["no_user_id".into()] });
    };
    let terms = query_terms(message);
    if terms.is_empty() {
        return (vec![], LatticeMeta { status: LatticeStatus::Fail, counts: 0, bytes_total: 0, warnings: vec!["no_query_terms".into()] });
    }

    let mut hits = store.search_lexical(user_id, &terms, MAX_LEXICAL_RESULTS);
    if vector_enabled {
        let embedding = deterministic_embedding(message);
        let vector_hits = store.search_vector(user_id, &embedding, MAX_LEXICAL_RESULTS, vector_max_distance);
        if !vector_hits.is_empty() {
            hits = vector_hits;
        }
    }

    let selected: Vec<&PolicyCapsule> = if should_load_capsules(risk_med_or_high, message, intent_support) {
        select_capsules(capsules, &terms)
    } else {
        vec![]
    };

    assemble(&hits, &selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeStore;
    impl MemorySearch for FakeStore {
        fn search_lexical(&self, _user_id: &str, _terms: &[String], _limit: usize) -> Vec<MemoryHit> {
            vec![MemoryHit { id: "m1".into(), summary: "pinned memory".into(), score: 1.0 }]
        }
        fn search_vector(&self, _user_id: &str, _embedding: &[f32], _limit: usize, _max_distance: Option<f64>) -> Vec<MemoryHit> {
            vec![]
        }
    }

    #[test]
    fn query_terms_dedupes_and_caps() {
        let terms = query_terms("hi hi hi job job work work plan plan build build ship ship go go run run fly");
        assert!(terms.len() <= MAX_QUERY_TERMS);
        assert!(terms.iter().all(|t| t.len() >= 3));
    }

    #[test]
    fn should_load_capsules_on_keyword() {
        assert!(should_load_capsules(false, "what's our safety policy?", false));
        assert!(!should_load_capsules(false, "hello there", false));
    }

    #[test]
    fn should_load_capsules_on_support_should_i() {
        assert!(should_load_capsules(false, "should I tell them?", true));
    }

    #[test]
    fn select_capsules_puts_adr_first_and_caps_each_bucket() {
        let capsules: Vec<PolicyCapsule> = (0..6)
            .map(|i| PolicyCapsule { id: format!("ADR-{i}"), title: "policy".into(), snippet: "policy text".into(), tags: vec![] })
            .chain((0..6).map(|i| PolicyCapsule { id: format!("POL-{i}"), title: "policy".into(), snippet: "policy text".into(), tags: vec![] }))
            .collect();
        let terms = vec!["policy".to_string()];
        let selected = select_capsules(&capsules, &terms);
        assert_eq!(selected.len(), 8);
        assert!(selected[0].id.starts_with("ADR-"));
    }

    #[test]
    fn assemble_caps_at_byte_budget() {
        let hits: Vec<MemoryHit> = (0..50)
            .map(|i| MemoryHit { id: format!("m{i}"), summary: "x".repeat(1000), score: 1.0 })
            .collect();
        let (items, meta) = assemble(&hits, &[]);
        assert!(meta.bytes_total <= BYTE_BUDGET);
        assert!(items.len() < hits.len());
        assert!(meta.warnings.contains(&"lattice_bytes_capped".to_string()));
    }

    #[test]
    fn retrieve_fails_closed_without_user_id() {
        let (items, meta) = retrieve(&FakeStore, None, "hello job work", false, None, &[], false, false);
        assert!(items.is_empty());
        assert_eq!(meta.status, LatticeStatus::Fail);
    }

    #[test]
    fn retrieve_hits_with_user_id_and_terms() {
        let (items, meta) = retrieve(&FakeStore, Some("u1"), "tell me about my job plans", false, None, &[], false, false);
        assert_eq!(meta.status, LatticeStatus::Hit);
        assert_eq!(items.len(), 1);
    }
}
