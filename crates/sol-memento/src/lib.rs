// SPDX-License-Identifier: MIT OR Apache-2.0
//! The memento state engine (C7): breakpoint decisions, peak-freeze, shape
//! merge, affect rollup, and the persistence predicate.
#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use sol_core::{AffectPoint, AffectRollup, Shape, ThreadMementoLatest, MEMENTO_LIST_CAP};

const ACK_WORDS: &[&str] = &[
    "ok", "okay", "thanks", "thank", "you", "yes", "no", "sure", "got", "it", "cool",
    "alright", "fine", "k", "yep", "nope", "great", "nice", "good",
];

/// The per-turn signal bundle feeding the breakpoint decision.
#[derive(Debug, Clone, Default)]
pub struct TurnSignals {
    pub summary_changed: bool,
    pub decision_made: bool,
    pub scope_changed: bool,
    pub pivot: bool,
    pub answer_provided: bool,
    pub open_loop_created: bool,
    pub open_loop_resolved: bool,
    pub risk_or_conflict: bool,
    pub context_drift_pressure: bool,
    pub ack_only_signal: bool,
}

/// Whether the model should treat this turn as a forced (`must`), advisory
/// (`should`), or skippable (`skip`) memento update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointDecision {
    Must,
    Should,
    Skip,
}

/// Whether `message`'s tokens are entirely drawn from the acknowledgement
/// word set, after lowercasing and stripping punctuation.
pub fn is_ack_only(message: &str) -> bool {
    let tokens: Vec<String> = message
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect();
    !tokens.is_empty() && tokens.iter().all(|t| ACK_WORDS.contains(&t.as_str()))
}

/// Derive the breakpoint decision (§4.7) from the message and per-turn
/// signals: `must` conditions take priority, then `should`, then `skip`;
/// anything left over defaults to `should`.
pub fn breakpoint_decision(message: &str, signals: &TurnSignals) -> BreakpointDecision {
    if signals.summary_changed
        || signals.decision_made
        || signals.scope_changed
        || signals.pivot
        || signals.answer_provided
    {
        return BreakpointDecision::Must;
    }
    if signals.open_loop_created
        || signals.open_loop_resolved
        || signals.risk_or_conflict
        || signals.context_drift_pressure
    {
        return BreakpointDecision::Should;
    }
    if is_ack_only(message) || signals.ack_only_signal {
        return BreakpointDecision::Skip;
    }
    BreakpointDecision::Should
}

/// Whether this turn's shape update should be frozen to the previous value
/// (§4.7): true when the thread was at a peak or high-intensity phase and
/// the breakpoint decision didn't force an update.
pub fn should_freeze(previous_phase: &str, previous_intensity_bucket: &str, decision: BreakpointDecision) -> bool {
    (previous_phase == "peak" || previous_intensity_bucket == "high") && decision != BreakpointDecision::Must
}

fn shape_from_memento(memento: &ThreadMementoLatest) -> Shape {
    Shape {
        arc: Some(memento.arc.clone()),
        active: memento.active.clone(),
        parked: memento.parked.clone(),
        decisions: memento.decisions.clone(),
        next: memento.next.clone(),
    }
}

/// Find a decision-style line in the assistant's response (`Recommendation:`,
/// `Decision:`, or `Choose:`), used to backfill an empty `decisions` list
/// when the user's message shows decision-lock intent.
pub fn extract_decision_line(assistant_text: &str) -> Option<String> {
    for line in assistant_text.lines() {
        let trimmed = line.trim();
        for prefix in ["recommendation:", "decision:", "choose:"] {
            if trimmed.to_lowercase().starts_with(prefix) {
                return Some(trimmed[prefix.len()..].trim().trim_end_matches('.').to_string());
            }
        }
    }
    None
}

/// Whether the user's message shows intent to lock in a decision.
pub fn shows_decision_lock_intent(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["decide", "decided", "lock", "choose", "should i"]
        .iter()
        .any(|w| lower.contains(w))
}

/// Merge the model's returned shape with the previous memento's shape
/// (§4.7): start from the model shape unless frozen, fall back to the
/// previous shape; inherit `decisions`/`next` when the model left them
/// empty; backfill `decisions` from the assistant text when the message
/// shows decision-lock intent.
pub fn merge_shape(
    model_shape: Option<Shape>,
    previous: &ThreadMementoLatest,
    frozen: bool,
    user_message: &str,
    assistant_text: &str,
) -> Shape {
    let previous_shape = shape_from_memento(previous);
    let mut merged = if frozen { previous_shape.clone() } else { model_shape.unwrap_or_else(|| previous_shape.clone()) };

    if merged.decisions.is_empty() && !previous.decisions.is_empty() {
        merged.decisions = previous.decisions.clone();
    }
    if merged.next.is_empty() && !previous.next.is_empty() {
        merged.next = previous.next.clone();
    }

    if merged.decisions.is_empty() && shows_decision_lock_intent(user_message) {
        if let Some(line) = extract_decision_line(assistant_text) {
            ThreadMementoLatest::push_capped(&mut merged.decisions, line);
        }
    }

    merged
}

/// Clamp an intensity reading into `[0, 1]`.
pub fn clamp_intensity(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Bucket a confidence score into `low | med | high`.
pub fn confidence_bucket(confidence: f64) -> &'static str {
    if confidence < 0.34 {
        "low"
    } else if confidence < 0.67 {
        "med"
    } else {
        "high"
    }
}

/// Whether `label` denotes no actionable mood signal.
pub fn is_neutral_label(label: &str) -> bool {
    label.eq_ignore_ascii_case("neutral")
}

/// Append a new affect point (unless the label is neutral, in which case no
/// signal is recorded) and keep only the newest [`MEMENTO_LIST_CAP`].
pub fn append_affect_point(
    points: &mut Vec<AffectPoint>,
    end_message_id: String,
    label: String,
    intensity: f64,
    confidence: f64,
    source: String,
    ts: DateTime<Utc>,
) {
    if is_neutral_label(&label) {
        return;
    }
    points.push(AffectPoint {
        end_message_id,
        label,
        intensity: clamp_intensity(intensity),
        confidence: confidence_bucket(confidence).to_string(),
        source,
        ts,
    });
    if points.len() > MEMENTO_LIST_CAP {
        let overflow = points.len() - MEMENTO_LIST_CAP;
        points.drain(0..overflow);
    }
}

/// An injectable, swappable policy mapping retained affect points to a
/// `{phase, intensityBucket}` rollup (§4.7, §9 Open Question).
pub trait AffectRollupFn {
    fn rollup(&self, points: &[AffectPoint], now: DateTime<Utc>) -> AffectRollup;
}

/// Deterministic default rollup: `phase` is derived from the most recent
/// point's label, bucketed into `{peak, downshift, settled, support}`;
/// `intensityBucket` is derived from the mean intensity of the retained
/// points.
pub struct DefaultAffectRollup;

impl AffectRollupFn for DefaultAffectRollup {
    fn rollup(&self, points: &[AffectPoint], now: DateTime<Utc>) -> AffectRollup {
        let phase = points
            .last()
            .map(|p| label_to_phase(&p.label))
            .unwrap_or("support")
            .to_string();

        let mean_intensity = if points.is_empty() {
            0.0
        } else {
            points.iter().map(|p| p.intensity).sum::<f64>() / points.len() as f64
        };

        AffectRollup {
            phase,
            intensity_bucket: intensity_bucket(mean_intensity).to_string(),
            updated_at: now,
        }
    }
}

fn label_to_phase(label: &str) -> &'static str {
    match label.to_lowercase().as_str() {
        "overwhelmed" | "panic" | "anxious" | "distressed" => "peak",
        "relieved" | "calming" | "easing" => "downshift",
        "content" | "steady" | "stable" | "settled" => "settled",
        _ => "support",
    }
}

fn intensity_bucket(mean: f64) -> &'static str {
    if mean >= 0.7 {
        "high"
    } else if mean >= 0.34 {
        "med"
    } else {
        "low"
    }
}

/// Whether a shape differs field-by-field from another.
pub fn shape_differs(a: &Shape, b: &Shape) -> bool {
    a.arc != b.arc || a.active != b.active || a.parked != b.parked || a.decisions != b.decisions || a.next != b.next
}

/// Whether this turn's memento update should be written to the store
/// (property 8, §8): persist iff a new affect point was recorded, the
/// shape meaningfully changed, or this is the thread's first turn.
pub fn should_persist(new_affect_point: bool, shape_changed: bool, first_time: bool) -> bool {
    new_affect_point || shape_changed || first_time
}

/// Quality signals checked after a successful main attempt (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityReport {
    pub shape_present: bool,
    pub shape_decisions_empty: bool,
    pub affect_signal_present: bool,
}

impl QualityReport {
    /// True if any quality issue is present — triggers a single corrective
    /// regeneration when thread-context mode is `auto`.
    pub fn has_issue(&self) -> bool {
        !self.shape_present || self.shape_decisions_empty || !self.affect_signal_present
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_only_detects_plain_thanks() {
        assert!(is_ack_only("Thanks, ok!"));
        assert!(!is_ack_only("thanks for the detailed plan"));
    }

    #[test]
    fn breakpoint_must_beats_everything() {
        let signals = TurnSignals { decision_made: true, ack_only_signal: true, ..Default::default() };
        assert_eq!(breakpoint_decision("ok", &signals), BreakpointDecision::Must);
    }

    #[test]
    fn breakpoint_defaults_to_should() {
        let signals = TurnSignals::default();
        assert_eq!(breakpoint_decision("tell me more about the plan", &signals), BreakpointDecision::Should);
    }

    #[test]
    fn breakpoint_skip_on_ack_only() {
        let signals = TurnSignals::default();
        assert_eq!(breakpoint_decision("thanks", &signals), BreakpointDecision::Skip);
    }

    #[test]
    fn peak_phase_freezes_unless_must() {
        assert!(should_freeze("peak", "low", BreakpointDecision::Should));
        assert!(!should_freeze("peak", "low", BreakpointDecision::Must));
        assert!(!should_freeze("settled", "low", BreakpointDecision::Should));
    }

    #[test]
    fn shape_merge_inherits_decisions_when_model_empty() {
        let previous = ThreadMementoLatest {
            decisions: vec!["keep the job".into()],
            ..ThreadMementoLatest::default_for_thread(Utc::now())
        };
        let model_shape = Shape { decisions: vec![], ..Default::default() };
        let merged = merge_shape(Some(model_shape), &previous, false, "hello", "");
        assert_eq!(merged.decisions, vec!["keep the job".to_string()]);
    }

    #[test]
    fn shape_merge_backfills_decision_from_assistant_text() {
        let previous = ThreadMementoLatest::default_for_thread(Utc::now());
        let model_shape = Shape::default();
        let merged = merge_shape(
            Some(model_shape),
            &previous,
            false,
            "I need to decide what to do",
            "Some preamble.\nRecommendation: take the new job.\n",
        );
        assert_eq!(merged.decisions, vec!["take the new job".to_string()]);
    }

    #[test]
    fn affect_point_skipped_for_neutral_label() {
        let mut points = Vec::new();
        append_affect_point(&mut points, "m1".into(), "neutral".into(), 0.5, 0.5, "model".into(), Utc::now());
        assert!(points.is_empty());
    }

    #[test]
    fn affect_points_capped_at_five() {
        let mut points = Vec::new();
        for i in 0..8 {
            append_affect_point(&mut points, format!("m{i}"), "content".into(), 0.5, 0.9, "model".into(), Utc::now());
        }
        assert_eq!(points.len(), MEMENTO_LIST_CAP);
    }

    #[test]
    fn default_rollup_uses_most_recent_label() {
        let mut points = Vec::new();
        append_affect_point(&mut points, "m1".into(), "overwhelmed".into(), 0.9, 0.9, "model".into(), Utc::now());
        let rollup = DefaultAffectRollup.rollup(&points, Utc::now());
        assert_eq!(rollup.phase, "peak");
        assert_eq!(rollup.intensity_bucket, "high");
    }

    #[test]
    fn persistence_predicate_requires_meaningful_change() {
        assert!(!should_persist(false, false, false));
        assert!(should_persist(true, false, false));
        assert!(should_persist(false, true, false));
        assert!(should_persist(false, false, true));
    }

    #[test]
    fn quality_report_flags_missing_shape() {
        let report = QualityReport { shape_present: false, shape_decisions_empty: false, affect_signal_present: true };
        assert!(report.has_issue());
        let ok = QualityReport { shape_present: true, shape_decisions_empty: false, affect_signal_present: true };
        assert!(!ok.has_issue());
    }
}
