// SPDX-License-Identifier: MIT OR Apache-2.0
//! Evidence intake (C2) and the librarian/binding/budget output gates (C5).
#![deny(unsafe_code)]

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sol_core::{
    bounds, json_byte_len, Capture, Claim, Evidence, EvidencePack, LibrarianGate,
    LibrarianVerdict, OutputEnvelope,
};
use sol_error::{ErrorCode, SolError};
use uuid::Uuid;

/// Evidence intake (C2): merges client-submitted evidence with
/// auto-detected URL captures and enforces the shape bounds and
/// cross-reference invariants from §3/§4.2.
pub mod intake {
    use super::*;

    /// Scan `message` for `http://`/`https://` URLs using a simple
    /// whitespace tokenizer — the real crawler/extractor is out of scope
    /// (§1); this is the deterministic reference extractor used both here
    /// and by the `url_extraction` gate.
    pub fn extract_urls(message: &str) -> Vec<String> {
        message
            .split_whitespace()
            .filter(|tok| tok.starts_with("http://") || tok.starts_with("https://"))
            .map(|tok| tok.trim_end_matches(|c: char| c == '.' || c == ',' || c == ')').to_string())
            .collect()
    }

    /// Normalize `evidence` against `message`: append an auto-capture for
    /// every extracted URL not already present among the client's captures,
    /// then enforce bounds and referential integrity.
    pub fn normalize(
        mut evidence: Evidence,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Evidence, SolError> {
        let mut existing_urls: HashSet<String> = evidence
            .captures
            .iter()
            .filter_map(|c| c.url.clone())
            .collect();

        for url in extract_urls(message) {
            if !existing_urls.contains(&url) {
                existing_urls.insert(url.clone());
                evidence.captures.push(Capture {
                    id: Uuid::new_v4().to_string(),
                    kind: "url".to_string(),
                    url: Some(url),
                    metadata: serde_json::Value::Null,
                    captured_at: now,
                    source: "user_provided".to_string(),
                });
            }
        }

        validate(&evidence)?;
        Ok(evidence)
    }

    fn validate(evidence: &Evidence) -> Result<(), SolError> {
        if evidence.captures.len() > bounds::MAX_CAPTURES {
            return Err(bounds_error("captures", evidence.captures.len(), bounds::MAX_CAPTURES));
        }
        if evidence.supports.len() > bounds::MAX_SUPPORTS {
            return Err(bounds_error("supports", evidence.supports.len(), bounds::MAX_SUPPORTS));
        }
        if evidence.claims.len() > bounds::MAX_CLAIMS {
            return Err(bounds_error("claims", evidence.claims.len(), bounds::MAX_CLAIMS));
        }

        let capture_ids: HashSet<&str> = evidence.captures.iter().map(|c| c.id.as_str()).collect();
        let support_ids: HashSet<&str> = evidence.supports.iter().map(|s| s.id.as_str()).collect();

        for support in &evidence.supports {
            match support.support_type {
                sol_core::SupportType::UrlCapture => {
                    let resolves = support
                        .capture_id
                        .as_deref()
                        .is_some_and(|id| capture_ids.contains(id));
                    if !resolves {
                        return Err(SolError::new(
                            ErrorCode::EvidenceShapeInvalid,
                            format!("support '{}' has no resolvable capture_id", support.id),
                        )
                        .with_context("support_id", support.id.clone()));
                    }
                }
                sol_core::SupportType::TextSnippet => {
                    if support.text.as_deref().unwrap_or("").is_empty() {
                        return Err(SolError::new(
                            ErrorCode::EvidenceShapeInvalid,
                            format!("text_snippet support '{}' has empty text", support.id),
                        ));
                    }
                }
            }
        }

        for claim in &evidence.claims {
            for sid in &claim.support_ids {
                if !support_ids.contains(sid.as_str()) {
                    return Err(SolError::new(
                        ErrorCode::EvidenceShapeInvalid,
                        format!("claim '{}' references unresolved support '{}'", claim.id, sid),
                    )
                    .with_context("claim_id", claim.id.clone()));
                }
            }
        }

        Ok(())
    }

    fn bounds_error(kind: &str, count: usize, max: usize) -> SolError {
        SolError::new(
            ErrorCode::EvidenceBoundsExceeded,
            format!("{kind} count {count} exceeds bound {max}"),
        )
        .with_context("kind", kind)
        .with_context("count", count)
        .with_context("max", max)
    }
}

/// Whether the evidence provider should run for this request (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderDecision {
    Allowed,
    Skipped,
    ForcedIgnoredProd,
}

/// Pure decision of whether the evidence provider should be consulted.
/// `evidence` having any content always allows the provider; otherwise a
/// force flag allows it outside production, and is ignored (not an error)
/// inside production.
pub fn provider_decision(
    force_evidence: bool,
    env_force: bool,
    is_production: bool,
    evidence: &Evidence,
) -> ProviderDecision {
    if !evidence.is_empty() {
        return ProviderDecision::Allowed;
    }
    let forced = force_evidence || env_force;
    match (forced, is_production) {
        (true, true) => ProviderDecision::ForcedIgnoredProd,
        (true, false) => ProviderDecision::Allowed,
        (false, _) => ProviderDecision::Skipped,
    }
}

const MAX_CLAIMS: usize = 8;
const MAX_REFS_PER_CLAIM: usize = 4;
const MAX_TOTAL_REFS: usize = 20;
const MAX_META_BYTES: usize = 16 * 1024;
const MAX_EVIDENCE_BYTES: usize = 4 * 1024;

/// Apply the librarian gate (only meaningful when `meta.display_hint ==
/// "ghost_card"`): dedupes, prunes unresolvable refs, drops unsupported
/// claims, and returns the `meta.librarian_gate` stamp. Idempotent:
/// running it again on its own output is a no-op (property 4, §8).
pub fn librarian(envelope: &mut OutputEnvelope, pack: Option<&EvidencePack>) -> LibrarianGate {
    let mut pruned_refs = 0u32;
    let mut reason_codes: Vec<String> = Vec::new();
    let mut note = |code: &str| {
        if !reason_codes.iter().any(|c| c == code) && reason_codes.len() < 6 {
            reason_codes.push(code.to_string());
        }
    };

    let mut total_before = 0usize;
    let mut unsupported_claims = 0u32;

    if let Some(meta) = envelope.meta.as_mut() {
        if let Some(claims) = meta.claims.as_mut() {
            total_before = claims.len();
            let mut kept: Vec<Claim> = Vec::with_capacity(claims.len());
            for mut claim in claims.drain(..) {
                let before = claim.evidence_refs.len();
                let mut seen = HashSet::new();
                claim.evidence_refs.retain(|r| {
                    let key = (r.evidence_id.clone(), r.span_id.clone().unwrap_or_default());
                    if !seen.insert(key) {
                        return false;
                    }
                    if r.evidence_id.is_empty() {
                        return false;
                    }
                    if let Some(pack) = pack {
                        pack.resolves(&r.evidence_id, r.span_id.as_deref())
                    } else {
                        true
                    }
                });
                let dropped = before - claim.evidence_refs.len();
                if dropped > 0 {
                    pruned_refs += dropped as u32;
                    note("refs_pruned");
                }
                if claim.evidence_refs.is_empty() {
                    unsupported_claims += 1;
                    note("claim_unsupported");
                } else {
                    kept.push(claim);
                }
            }
            *claims = kept;
        }
    }

    let support_score = if total_before == 0 {
        1.0
    } else {
        1.0 - (unsupported_claims as f64 / total_before as f64)
    };

    let verdict = if pruned_refs == 0 && unsupported_claims == 0 {
        LibrarianVerdict::Pass
    } else if unsupported_claims > 0 {
        LibrarianVerdict::Flag
    } else {
        LibrarianVerdict::Prune
    };

    LibrarianGate {
        version: "v0".to_string(),
        pruned_refs,
        unsupported_claims,
        support_score,
        verdict,
        reason_codes,
    }
}

/// Binding gate (§4.5): every claim's refs must resolve in the pack; claims
/// without a pack at all are a distinct failure.
pub fn binding(envelope: &OutputEnvelope, pack: Option<&EvidencePack>) -> Result<(), SolError> {
    let Some(claims) = envelope.meta.as_ref().and_then(|m| m.claims.as_ref()) else {
        return Ok(());
    };
    if claims.is_empty() {
        return Ok(());
    }
    let Some(pack) = pack else {
        return Err(SolError::new(
            ErrorCode::ClaimsWithoutEvidence,
            "claims present but no evidence pack was resolved",
        ));
    };
    for claim in claims {
        for r in &claim.evidence_refs {
            if !pack.resolves(&r.evidence_id, r.span_id.as_deref()) {
                return Err(SolError::new(
                    ErrorCode::EvidenceBindingFailed,
                    format!("claim '{}' references unresolved evidence '{}'", claim.claim_id, r.evidence_id),
                )
                .with_context("reason", "invalid_binding")
                .with_context("claim_id", claim.claim_id.clone()));
            }
        }
    }
    Ok(())
}

/// Budget gate (§4.5): enforces claim/ref/byte ceilings, all counted in
/// UTF-8 bytes (property 5, §8).
pub fn budget(envelope: &OutputEnvelope, pack: Option<&EvidencePack>) -> Result<(), SolError> {
    let Some(meta) = envelope.meta.as_ref() else {
        return Ok(());
    };
    let Some(claims) = meta.claims.as_ref() else {
        return Ok(());
    };

    if claims.len() > MAX_CLAIMS {
        return Err(budget_error("max_claims", claims.len(), MAX_CLAIMS));
    }

    let mut total_refs = 0usize;
    for claim in claims {
        if claim.evidence_refs.len() > MAX_REFS_PER_CLAIM {
            return Err(budget_error("max_refs_per_claim", claim.evidence_refs.len(), MAX_REFS_PER_CLAIM));
        }
        total_refs += claim.evidence_refs.len();
    }
    if total_refs > MAX_TOTAL_REFS {
        return Err(budget_error("max_total_refs", total_refs, MAX_TOTAL_REFS));
    }

    let meta_bytes = json_byte_len(meta).unwrap_or(usize::MAX);
    if meta_bytes > MAX_META_BYTES {
        return Err(budget_error("max_meta_bytes", meta_bytes, MAX_META_BYTES));
    }

    if let Some(pack) = pack {
        let mut referenced: HashSet<&str> = HashSet::new();
        for claim in claims {
            for r in &claim.evidence_refs {
                referenced.insert(r.evidence_id.as_str());
            }
        }
        let evidence_bytes: usize = referenced
            .iter()
            .filter_map(|id| pack.find(id))
            .filter_map(|item| item.excerpt_text.as_deref())
            .map(|t| t.len())
            .sum();
        if evidence_bytes > MAX_EVIDENCE_BYTES {
            return Err(budget_error("max_evidence_bytes", evidence_bytes, MAX_EVIDENCE_BYTES));
        }
    }

    Ok(())
}

fn budget_error(reason: &str, value: usize, max: usize) -> SolError {
    SolError::new(
        ErrorCode::EvidenceBudgetExceeded,
        format!("budget exceeded: {reason} ({value} > {max})"),
    )
    .with_context("reason", reason)
    .with_context("value", value)
    .with_context("max", max)
}

/// Finalize a surviving envelope after the output gates succeed: derive
/// `used_evidence_ids` from the claims (not the model's self-report),
/// stamp `evidence_pack_id`, set `meta_version`, and rewrite the capture
/// suggestion id to `cap_<transmission_id>` (§4.5).
pub fn finalize(envelope: &mut OutputEnvelope, pack: Option<&EvidencePack>, transmission_id: Uuid) {
    let Some(meta) = envelope.meta.as_mut() else {
        return;
    };
    meta.meta_version = Some("v1".to_string());

    if let Some(claims) = meta.claims.as_ref() {
        let mut ids = Vec::new();
        for claim in claims {
            for r in &claim.evidence_refs {
                if !ids.contains(&r.evidence_id) {
                    ids.push(r.evidence_id.clone());
                }
            }
        }
        meta.used_evidence_ids = Some(ids);
    }

    if let Some(pack) = pack {
        meta.evidence_pack_id = Some(pack.pack_id.clone());
    }

    if let Some(suggestion) = meta.capture_suggestion.as_mut() {
        suggestion.suggestion_id = format!("cap_{transmission_id}");
        normalize_suggestion_fields(suggestion);
    }
}

/// Enforce the kind→field invariant on a capture suggestion (§8 property 6):
/// a `calendar_event` carries `suggested_start_at` and never `suggested_date`;
/// a `journal_entry` or `reminder` never carries `suggested_start_at`.
fn normalize_suggestion_fields(suggestion: &mut sol_core::CaptureSuggestion) {
    match suggestion.suggestion_type.as_str() {
        "calendar_event" => {
            suggestion.suggested_date = None;
        }
        "journal_entry" | "reminder" => {
            suggestion.suggested_start_at = None;
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sol_core::{EnvelopeMeta, EvidenceItem, EvidenceRef, Span};

    fn pack_with(evidence_id: &str, span_id: Option<&str>, text: &str) -> EvidencePack {
        EvidencePack {
            pack_id: "pack-1".into(),
            items: vec![EvidenceItem {
                evidence_id: evidence_id.into(),
                kind: "url".into(),
                spans: span_id
                    .map(|s| vec![Span { span_id: s.into(), text: text.into() }])
                    .unwrap_or_default(),
                excerpt_text: Some(text.into()),
            }],
        }
    }

    fn envelope_with_suggestion(suggestion_type: &str, start_at: bool, date: bool) -> OutputEnvelope {
        let suggestion = sol_core::CaptureSuggestion {
            suggestion_id: "pending".into(),
            suggestion_type: suggestion_type.into(),
            suggested_start_at: start_at.then(Utc::now),
            suggested_date: date.then(|| "2026-08-01".to_string()),
        };
        OutputEnvelope {
            assistant_text: "ok".into(),
            meta: Some(EnvelopeMeta { capture_suggestion: Some(suggestion), ..Default::default() }),
        }
    }

    #[test]
    fn finalize_strips_suggested_date_from_calendar_event() {
        let mut envelope = envelope_with_suggestion("calendar_event", true, true);
        finalize(&mut envelope, None, Uuid::nil());
        let suggestion = envelope.meta.unwrap().capture_suggestion.unwrap();
        assert!(suggestion.suggested_start_at.is_some());
        assert!(suggestion.suggested_date.is_none());
    }

    #[test]
    fn finalize_strips_suggested_start_at_from_journal_entry() {
        let mut envelope = envelope_with_suggestion("journal_entry", true, false);
        finalize(&mut envelope, None, Uuid::nil());
        let suggestion = envelope.meta.unwrap().capture_suggestion.unwrap();
        assert!(suggestion.suggested_start_at.is_none());
    }

    #[test]
    fn finalize_strips_suggested_start_at_from_reminder() {
        let mut envelope = envelope_with_suggestion("reminder", true, false);
        finalize(&mut envelope, None, Uuid::nil());
        let suggestion = envelope.meta.unwrap().capture_suggestion.unwrap();
        assert!(suggestion.suggested_start_at.is_none());
    }

    #[test]
    fn intake_extracts_and_dedupes_urls() {
        let evidence = intake::normalize(Evidence::default(), "see https://a.test/x and https://a.test/x", Utc::now()).unwrap();
        assert_eq!(evidence.captures.len(), 1);
    }

    #[test]
    fn intake_rejects_bounds_violation() {
        let mut evidence = Evidence::default();
        for i in 0..30 {
            evidence.captures.push(Capture {
                id: format!("c{i}"),
                kind: "url".into(),
                url: Some(format!("https://x.test/{i}")),
                metadata: serde_json::Value::Null,
                captured_at: Utc::now(),
                source: "user_provided".into(),
            });
        }
        let err = intake::normalize(evidence, "", Utc::now()).unwrap_err();
        assert_eq!(err.code, ErrorCode::EvidenceBoundsExceeded);
    }

    #[test]
    fn provider_decision_allows_when_evidence_present() {
        let mut evidence = Evidence::default();
        evidence.captures.push(Capture {
            id: "c1".into(),
            kind: "url".into(),
            url: None,
            metadata: serde_json::Value::Null,
            captured_at: Utc::now(),
            source: "user_provided".into(),
        });
        assert_eq!(
            provider_decision(false, false, true, &evidence),
            ProviderDecision::Allowed
        );
    }

    #[test]
    fn provider_decision_forced_ignored_in_prod() {
        assert_eq!(
            provider_decision(true, false, true, &Evidence::default()),
            ProviderDecision::ForcedIgnoredProd
        );
    }

    #[test]
    fn provider_decision_skipped_with_no_force_and_no_evidence() {
        assert_eq!(
            provider_decision(false, false, false, &Evidence::default()),
            ProviderDecision::Skipped
        );
    }

    fn envelope_with_claims(claims: Vec<Claim>) -> OutputEnvelope {
        OutputEnvelope {
            assistant_text: "hi".into(),
            meta: Some(EnvelopeMeta {
                claims: Some(claims),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn librarian_is_idempotent() {
        let pack = pack_with("ev-1", Some("sp-1"), "hi");
        let mut envelope = envelope_with_claims(vec![Claim {
            claim_id: "cl-1".into(),
            claim_text: "x".into(),
            evidence_refs: vec![
                sol_core::EvidenceRef { evidence_id: "ev-1".into(), span_id: Some("sp-1".into()) },
                sol_core::EvidenceRef { evidence_id: "ev-1".into(), span_id: Some("sp-1".into()) },
                sol_core::EvidenceRef { evidence_id: "ev-999".into(), span_id: None },
            ],
        }]);
        let first = librarian(&mut envelope, Some(&pack));
        assert_eq!(first.pruned_refs, 2);
        let second = librarian(&mut envelope, Some(&pack));
        assert_eq!(second.pruned_refs, 0);
        assert_eq!(second.verdict, LibrarianVerdict::Pass);
    }

    #[test]
    fn librarian_flags_unsupported_claim() {
        let pack = pack_with("ev-1", None, "hi");
        let mut envelope = envelope_with_claims(vec![Claim {
            claim_id: "cl-1".into(),
            claim_text: "x".into(),
            evidence_refs: vec![EvidenceRef { evidence_id: "ev-missing".into(), span_id: None }],
        }]);
        let gate = librarian(&mut envelope, Some(&pack));
        assert_eq!(gate.unsupported_claims, 1);
        assert_eq!(gate.verdict, LibrarianVerdict::Flag);
        assert_eq!(envelope.meta.unwrap().claims.unwrap().len(), 0);
    }

    #[test]
    fn binding_fails_on_unresolved_ref() {
        let pack = pack_with("ev-1", None, "hi");
        let envelope = envelope_with_claims(vec![Claim {
            claim_id: "cl-1".into(),
            claim_text: "x".into(),
            evidence_refs: vec![EvidenceRef { evidence_id: "ev-999".into(), span_id: None }],
        }]);
        let err = binding(&envelope, Some(&pack)).unwrap_err();
        assert_eq!(err.code, ErrorCode::EvidenceBindingFailed);
    }

    #[test]
    fn binding_fails_when_claims_present_without_pack() {
        let envelope = envelope_with_claims(vec![Claim {
            claim_id: "cl-1".into(),
            claim_text: "x".into(),
            evidence_refs: vec![EvidenceRef { evidence_id: "ev-1".into(), span_id: None }],
        }]);
        let err = binding(&envelope, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::ClaimsWithoutEvidence);
    }

    #[test]
    fn budget_rejects_too_many_claims() {
        let claims = (0..9)
            .map(|i| Claim {
                claim_id: format!("cl-{i}"),
                claim_text: "x".into(),
                evidence_refs: vec![],
            })
            .collect();
        let envelope = envelope_with_claims(claims);
        let err = budget(&envelope, None).unwrap_err();
        assert_eq!(err.context.get("reason").unwrap(), "max_claims");
    }

    #[test]
    fn budget_counts_evidence_bytes_not_chars() {
        let big = "\u{1F600}".repeat(2000);
        let pack = pack_with("ev-1", None, &big);
        let envelope = envelope_with_claims(vec![Claim {
            claim_id: "cl-1".into(),
            claim_text: "x".into(),
            evidence_refs: vec![EvidenceRef { evidence_id: "ev-1".into(), span_id: None }],
        }]);
        let err = budget(&envelope, Some(&pack)).unwrap_err();
        assert_eq!(err.context.get("reason").unwrap(), "max_evidence_bytes");
    }
}
