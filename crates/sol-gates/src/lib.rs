// SPDX-License-Identifier: MIT OR Apache-2.0
//! The fixed-order input gate chain (C3): `normalize_modality →
//! url_extraction → intent → sentinel → lattice`, plus a deterministic
//! reference implementation of the first four gates so the system runs
//! end-to-end without external collaborators.
#![deny(unsafe_code)]

use serde_json::{json, Value};
use sol_evidence::intake::extract_urls;

/// Outcome of a single gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pass,
    Fail,
    Warn,
}

/// Risk level raised by the sentinel (safety) gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Med,
    High,
}

/// The classified intent label (heuristic reference implementation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentLabel {
    Support,
    Question,
    Statement,
    Other,
}

/// Result of running one gate (§4.3).
#[derive(Debug, Clone, serde::Serialize)]
pub struct GateOutput {
    pub gate_name: &'static str,
    pub status: GateStatus,
    pub summary: String,
    pub is_urgent: Option<bool>,
    pub metadata: Value,
}

/// Fixed gate invocation order (excludes `lattice`, run separately by
/// `sol-lattice` since it needs store/config access the other gates don't).
pub const GATE_ORDER: &[&str] = &[
    "normalize_modality",
    "url_extraction",
    "intent",
    "sentinel",
];

/// Keyword set shared with the lattice's policy-capsule trigger (§4.4).
pub const POLICY_KEYWORDS: &[&str] = &[
    "policy", "safety", "constraint", "governance", "rule", "journal", "consent",
    "self-harm", "suicide", "violence", "abuse", "hate", "escalate", "crisis",
    "privacy", "security",
];

const HIGH_RISK_KEYWORDS: &[&str] = &["suicide", "self-harm", "crisis"];
const MED_RISK_KEYWORDS: &[&str] = &["violence", "abuse", "hate", "escalate"];

/// `normalize_modality`: passes through text messages, warns on empty text.
pub fn normalize_modality(message: &str) -> GateOutput {
    if message.trim().is_empty() {
        GateOutput {
            gate_name: "normalize_modality",
            status: GateStatus::Warn,
            summary: "empty message text".to_string(),
            is_urgent: None,
            metadata: json!({}),
        }
    } else {
        GateOutput {
            gate_name: "normalize_modality",
            status: GateStatus::Pass,
            summary: "text modality accepted".to_string(),
            is_urgent: None,
            metadata: json!({}),
        }
    }
}

/// `url_extraction`: reuses C2's URL scan and reports the count found.
pub fn url_extraction(message: &str) -> GateOutput {
    let urls = extract_urls(message);
    GateOutput {
        gate_name: "url_extraction",
        status: GateStatus::Pass,
        summary: format!("{} url(s) found", urls.len()),
        is_urgent: None,
        metadata: json!({ "count": urls.len(), "urls": urls }),
    }
}

/// `intent`: classifies the message into a small fixed label set by
/// keyword heuristics, including the "should i" phrase the lattice's
/// policy-capsule gate checks for.
pub fn intent(message: &str) -> GateOutput {
    let lower = message.to_lowercase();
    let label = if lower.contains("should i") {
        IntentLabel::Support
    } else if lower.trim_end().ends_with('?') {
        IntentLabel::Question
    } else if !lower.trim().is_empty() {
        IntentLabel::Statement
    } else {
        IntentLabel::Other
    };
    GateOutput {
        gate_name: "intent",
        status: GateStatus::Pass,
        summary: format!("classified as {label:?}"),
        is_urgent: None,
        metadata: json!({ "label": label }),
    }
}

/// `sentinel`: the only gate allowed to raise urgency. Scans for a fixed
/// crisis/safety keyword set (overlapping [`POLICY_KEYWORDS`]) and reports
/// a risk level.
pub fn sentinel(message: &str) -> GateOutput {
    let lower = message.to_lowercase();
    let risk = if HIGH_RISK_KEYWORDS.iter().any(|k| lower.contains(k)) {
        RiskLevel::High
    } else if MED_RISK_KEYWORDS.iter().any(|k| lower.contains(k)) {
        RiskLevel::Med
    } else {
        RiskLevel::Low
    };
    let is_urgent = risk == RiskLevel::High;
    GateOutput {
        gate_name: "sentinel",
        status: GateStatus::Pass,
        summary: format!("risk={risk:?}"),
        is_urgent: Some(is_urgent),
        metadata: json!({ "risk": risk }),
    }
}

/// Run `normalize_modality → url_extraction → intent → sentinel` in order.
pub fn run_chain(message: &str) -> Vec<GateOutput> {
    vec![
        normalize_modality(message),
        url_extraction(message),
        intent(message),
        sentinel(message),
    ]
}

/// Derive whether the notification policy may be escalated to urgent from a
/// set of gate outputs (property 2, §8): true iff the `sentinel` gate set
/// `is_urgent`. Any other gate's `is_urgent` is discarded; a warning is
/// logged (not returned as an error) since it indicates a misbehaving gate.
pub fn safety_is_urgent(outputs: &[GateOutput]) -> bool {
    let mut urgent = false;
    for output in outputs {
        match output.is_urgent {
            Some(true) if output.gate_name == "sentinel" => urgent = true,
            Some(true) => {
                tracing::warn!(
                    gate = output.gate_name,
                    "non-sentinel gate set is_urgent; discarding"
                );
            }
            _ => {}
        }
    }
    urgent
}
