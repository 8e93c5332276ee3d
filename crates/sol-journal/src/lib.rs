// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic journal offer classifier (C8): derives an optional
//! journaling offer from affect, risk, and phase.
#![deny(unsafe_code)]

use sol_core::{JournalOfferRecord, JournalOfferReasonCode};

/// Input signals the classifier needs for one turn.
#[derive(Debug, Clone)]
pub struct ClassifyInput {
    /// The affect label for this turn, if any signal was produced.
    pub label: Option<String>,
    pub phase: String,
    pub risk: String,
    pub intensity: f64,
    pub avoid_peak_overwhelm: bool,
    pub mode: String,
    pub evidence_span: Option<String>,
}

/// Classify a turn into a [`JournalOfferRecord`] (§4.8). Only evaluated
/// (beyond the gating checks) when the mood label is non-neutral and risk
/// is `low`. The rule table is keyed on the affect label itself: each
/// label maps to at most one momentType, never to another label's.
pub fn classify(input: &ClassifyInput) -> JournalOfferRecord {
    let Some(label) = input.label.as_deref() else {
        return ineligible(input, vec![JournalOfferReasonCode::NoAffectSignal]);
    };
    if label.eq_ignore_ascii_case("neutral") {
        return ineligible(input, vec![JournalOfferReasonCode::LabelNeutral]);
    }
    if !input.risk.eq_ignore_ascii_case("low") {
        return ineligible(input, vec![JournalOfferReasonCode::RiskNotLow]);
    }

    let phase = input.phase.as_str();

    match label {
        "overwhelm" if phase == "settled" && !input.avoid_peak_overwhelm => eligible(input, "vent"),
        "insight" if input.intensity > 0.7 => eligible(input, "insight"),
        "gratitude" if phase == "downshift" || phase == "settled" => eligible(input, "gratitude"),
        "resolve" if phase == "settled" => eligible(input, "decision"),
        _ => ineligible(input, vec![JournalOfferReasonCode::PhaseBlocked]),
    }
}

fn eligible(input: &ClassifyInput, mode: &str) -> JournalOfferRecord {
    JournalOfferRecord {
        offer_eligible: true,
        phase: input.phase.clone(),
        risk: input.risk.clone(),
        label: input.label.clone().unwrap_or_default(),
        intensity_bucket: bucket(input.intensity).to_string(),
        mode: mode.to_string(),
        evidence_span: input.evidence_span.clone(),
        reason_codes: vec![],
    }
}

fn ineligible(input: &ClassifyInput, reasons: Vec<JournalOfferReasonCode>) -> JournalOfferRecord {
    JournalOfferRecord {
        offer_eligible: false,
        phase: input.phase.clone(),
        risk: input.risk.clone(),
        label: input.label.clone().unwrap_or_default(),
        intensity_bucket: bucket(input.intensity).to_string(),
        mode: input.mode.clone(),
        evidence_span: None,
        reason_codes: reasons,
    }
}

fn bucket(intensity: f64) -> &'static str {
    if intensity >= 0.7 {
        "high"
    } else if intensity >= 0.34 {
        "med"
    } else {
        "low"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(phase: &str, risk: &str, label: &str, intensity: f64, avoid: bool) -> ClassifyInput {
        ClassifyInput {
            label: Some(label.to_string()),
            phase: phase.to_string(),
            risk: risk.to_string(),
            intensity,
            avoid_peak_overwhelm: avoid,
            mode: "auto".to_string(),
            evidence_span: None,
        }
    }

    #[test]
    fn neutral_label_is_ineligible() {
        let input = base("settled", "low", "neutral", 0.5, false);
        let record = classify(&input);
        assert!(!record.offer_eligible);
        assert_eq!(record.reason_codes, vec![JournalOfferReasonCode::LabelNeutral]);
    }

    #[test]
    fn risk_not_low_is_ineligible() {
        let input = base("settled", "med", "content", 0.5, false);
        let record = classify(&input);
        assert!(!record.offer_eligible);
        assert_eq!(record.reason_codes, vec![JournalOfferReasonCode::RiskNotLow]);
    }

    #[test]
    fn missing_signal_is_ineligible() {
        let mut input = base("settled", "low", "content", 0.5, false);
        input.label = None;
        let record = classify(&input);
        assert_eq!(record.reason_codes, vec![JournalOfferReasonCode::NoAffectSignal]);
    }

    #[test]
    fn settled_overwhelm_without_avoid_yields_vent() {
        let record = classify(&base("settled", "low", "overwhelm", 0.5, false));
        assert!(record.offer_eligible);
        assert_eq!(record.mode, "vent");
    }

    #[test]
    fn settled_overwhelm_with_avoid_is_blocked() {
        let record = classify(&base("settled", "low", "overwhelm", 0.5, true));
        assert!(!record.offer_eligible);
    }

    #[test]
    fn high_intensity_insight_yields_insight() {
        let record = classify(&base("support", "low", "insight", 0.9, false));
        assert!(record.offer_eligible);
        assert_eq!(record.mode, "insight");
    }

    #[test]
    fn low_intensity_insight_is_blocked() {
        let record = classify(&base("support", "low", "insight", 0.3, false));
        assert!(!record.offer_eligible);
    }

    #[test]
    fn settled_resolve_yields_decision() {
        let record = classify(&base("settled", "low", "resolve", 0.5, false));
        assert!(record.offer_eligible);
        assert_eq!(record.mode, "decision");
    }

    #[test]
    fn non_settled_resolve_is_blocked() {
        let record = classify(&base("peak", "low", "resolve", 0.5, false));
        assert!(!record.offer_eligible);
    }

    #[test]
    fn downshift_gratitude_yields_gratitude() {
        let record = classify(&base("downshift", "low", "gratitude", 0.5, false));
        assert!(record.offer_eligible);
        assert_eq!(record.mode, "gratitude");
    }

    #[test]
    fn settled_gratitude_yields_gratitude() {
        let record = classify(&base("settled", "low", "gratitude", 0.5, false));
        assert!(record.offer_eligible);
        assert_eq!(record.mode, "gratitude");
    }

    #[test]
    fn curiosity_never_eligible() {
        let record = classify(&base("settled", "low", "curiosity", 0.9, false));
        assert!(!record.offer_eligible);
    }

    #[test]
    fn unknown_label_is_ineligible() {
        let record = classify(&base("settled", "low", "excited", 0.9, false));
        assert!(!record.offer_eligible);
    }

    #[test]
    fn peak_phase_with_low_intensity_is_blocked() {
        let record = classify(&base("peak", "low", "insight", 0.4, false));
        assert!(!record.offer_eligible);
        assert_eq!(record.reason_codes, vec![JournalOfferReasonCode::PhaseBlocked]);
    }
}
