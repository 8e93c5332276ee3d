// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

//! Stable data model for the Sol control plane.
//!
//! This crate defines the entities in play for one chat-packet pipeline run:
//! [`Transmission`], [`TraceRun`]/[`TraceEvent`], [`PacketInput`],
//! [`Evidence`]/[`EvidencePack`], [`OutputEnvelope`]/[`Claim`],
//! [`ThreadMementoLatest`], [`JournalOfferRecord`], and [`DriverBlock`] — plus
//! the canonical-JSON hashing helpers used to fingerprint an envelope.
//!
//! ```
//! use sol_core::CONTRACT_VERSION;
//! assert_eq!(CONTRACT_VERSION, "sol/v1");
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Stable identifier for the data-model contract version.
pub const CONTRACT_VERSION: &str = "sol/v1";

/// Errors raised while (de)serializing or hashing contract types.
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    /// JSON (de)serialization failed.
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Serialize `value` as canonical JSON (stable key ordering, no
/// insignificant whitespace) suitable for hashing.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, ContractError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&v)?)
}

/// Hex-encoded SHA-256 digest of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Deterministic fingerprint of an [`OutputEnvelope`], used to detect
/// accidental double-writes of the "exactly once" persisted envelope.
///
/// ```
/// use sol_core::{OutputEnvelope, envelope_hash};
///
/// let a = OutputEnvelope::new("hello");
/// let b = OutputEnvelope::new("hello");
/// assert_eq!(envelope_hash(&a).unwrap(), envelope_hash(&b).unwrap());
/// ```
pub fn envelope_hash(envelope: &OutputEnvelope) -> Result<String, ContractError> {
    let bytes = canonical_json(envelope)?;
    Ok(sha256_hex(&bytes))
}

// ---------------------------------------------------------------------------
// Transmission
// ---------------------------------------------------------------------------

/// Lifecycle status of a [`Transmission`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransmissionStatus {
    /// Admitted, not yet running.
    Created,
    /// The pipeline is actively running.
    Processing,
    /// The pipeline finished and persisted exactly one output envelope.
    Completed,
    /// The pipeline failed; see `error_code`/`error_detail`.
    Failed,
}

/// Notification urgency attached to a transmission's delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPolicy {
    /// No client-visible notification.
    Silent,
    /// Standard notification.
    Alert,
    /// Escalated notification; settable only by the sentinel gate (or a
    /// persona override), never by client request alone.
    Urgent,
}

/// One attempt to deliver an assistant response for a chat packet.
///
/// Created at request admission; mutated only by the orchestrator; persisted
/// on every status change.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Transmission {
    pub id: Uuid,
    pub thread_id: String,
    pub client_request_id: Option<String>,
    pub forced_persona: Option<String>,
    pub notification_policy: NotificationPolicy,
    pub status: TransmissionStatus,
    pub status_code: u16,
    pub retryable: bool,
    pub error_code: Option<String>,
    pub error_detail: Option<Value>,
}

impl Transmission {
    /// Start a [`TransmissionBuilder`] for a freshly admitted request.
    pub fn builder(thread_id: impl Into<String>) -> TransmissionBuilder {
        TransmissionBuilder::new(thread_id)
    }

    /// Move this transmission to `Completed` and clear any error detail.
    pub fn complete(&mut self) {
        self.status = TransmissionStatus::Completed;
        self.status_code = 200;
        self.retryable = false;
        self.error_code = None;
        self.error_detail = None;
    }

    /// Move this transmission to `Failed` with the given error.
    pub fn fail(&mut self, status_code: u16, error_code: impl Into<String>, retryable: bool) {
        self.status = TransmissionStatus::Failed;
        self.status_code = status_code;
        self.retryable = retryable;
        self.error_code = Some(error_code.into());
    }
}

/// Fluent builder for [`Transmission`].
pub struct TransmissionBuilder {
    id: Uuid,
    thread_id: String,
    client_request_id: Option<String>,
    forced_persona: Option<String>,
    notification_policy: NotificationPolicy,
}

impl TransmissionBuilder {
    fn new(thread_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            thread_id: thread_id.into(),
            client_request_id: None,
            forced_persona: None,
            notification_policy: NotificationPolicy::Alert,
        }
    }

    #[must_use]
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn client_request_id(mut self, id: impl Into<String>) -> Self {
        self.client_request_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn forced_persona(mut self, persona: impl Into<String>) -> Self {
        self.forced_persona = Some(persona.into());
        self
    }

    #[must_use]
    pub fn notification_policy(mut self, policy: NotificationPolicy) -> Self {
        self.notification_policy = policy;
        self
    }

    pub fn build(self) -> Transmission {
        Transmission {
            id: self.id,
            thread_id: self.thread_id,
            client_request_id: self.client_request_id,
            forced_persona: self.forced_persona,
            notification_policy: self.notification_policy,
            status: TransmissionStatus::Created,
            status_code: 0,
            retryable: false,
            error_code: None,
            error_detail: None,
        }
    }
}

// ---------------------------------------------------------------------------
// TraceRun / TraceEvent
// ---------------------------------------------------------------------------

/// A single append-only entry in a [`TraceRun`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TraceEvent {
    pub actor: String,
    pub phase: String,
    pub status: String,
    pub summary: String,
    pub metadata: Value,
    /// Monotonically increasing within the owning [`TraceRun`]; assigned at
    /// append time, never renumbered.
    pub seq: u64,
}

/// Append-only audit log for one [`Transmission`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TraceRun {
    pub id: Uuid,
    pub transmission_id: Uuid,
    events: Vec<TraceEvent>,
    next_seq: u64,
}

impl TraceRun {
    pub fn new(transmission_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            transmission_id,
            events: Vec::new(),
            next_seq: 0,
        }
    }

    /// Append a trace event, assigning it the next monotonic `seq`.
    pub fn append(
        &mut self,
        actor: impl Into<String>,
        phase: impl Into<String>,
        status: impl Into<String>,
        summary: impl Into<String>,
        metadata: Value,
    ) -> &TraceEvent {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.push(TraceEvent {
            actor: actor.into(),
            phase: phase.into(),
            status: status.into(),
            summary: summary.into(),
            metadata,
            seq,
        });
        self.events.last().expect("just pushed")
    }

    /// All events in append order.
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// True iff every consecutive pair of events has strictly increasing
    /// `seq` (property 1, §8).
    pub fn seq_strictly_increasing(&self) -> bool {
        self.events.windows(2).all(|w| w[0].seq < w[1].seq)
    }

    /// Index (position) of the first event in each of `phases`, in the
    /// order encountered — used to check authoritative phase ordering
    /// without requiring contiguity.
    pub fn first_positions(&self, phases: &[&str]) -> Vec<Option<usize>> {
        phases
            .iter()
            .map(|p| self.events.iter().position(|e| e.phase == *p))
            .collect()
    }
}

/// The authoritative phase order from §4.3. Phases need not be contiguous
/// but must appear in this relative order.
pub const AUTHORITATIVE_PHASE_ORDER: &[&str] = &[
    "evidence_intake",
    "gate_normalize_modality",
    "gate_url_extraction",
    "gate_intent",
    "gate_sentinel",
    "gate_lattice",
    "model_call",
    "output_gates",
];

// ---------------------------------------------------------------------------
// PacketInput
// ---------------------------------------------------------------------------

/// Thread-context lookup mode for a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThreadContextMode {
    #[default]
    Auto,
    Off,
}

/// The request envelope consumed by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PacketInput {
    pub thread_id: String,
    pub packet_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_memento_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_memento_inline: Option<ThreadMementoLatest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_notification_policy: Option<NotificationPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_capture_model_io: Option<bool>,
    #[serde(default)]
    pub thread_context_mode: ThreadContextMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_evidence: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Evidence
// ---------------------------------------------------------------------------

/// A user- or system-captured reference (e.g. a URL).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Capture {
    pub id: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub captured_at: DateTime<Utc>,
    pub source: String,
}

/// The kind of a [`Support`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SupportType {
    UrlCapture,
    TextSnippet,
}

/// A piece of evidence backing a [`EvidenceClaim`]: either a reference to a
/// [`Capture`] or an inline text snippet.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Support {
    pub id: String,
    #[serde(rename = "type")]
    pub support_type: SupportType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A user-asserted claim backed by one or more [`Support`]s.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EvidenceClaim {
    pub id: String,
    pub text: String,
    pub support_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Bound values enforced on intake (§4.2).
pub mod bounds {
    pub const MAX_CAPTURES: usize = 25;
    pub const MAX_SUPPORTS: usize = 50;
    pub const MAX_CLAIMS: usize = 50;
}

/// User-submitted evidence for one packet: captures, supports, and claims.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Evidence {
    #[serde(default)]
    pub captures: Vec<Capture>,
    #[serde(default)]
    pub supports: Vec<Support>,
    #[serde(default)]
    pub claims: Vec<EvidenceClaim>,
}

impl Evidence {
    /// Whether any evidence at all was supplied (used by the provider
    /// decision in §4.5).
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.supports.is_empty() && self.claims.is_empty()
    }
}

// ---------------------------------------------------------------------------
// EvidencePack
// ---------------------------------------------------------------------------

/// A span within an [`EvidenceItem`]'s source text.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Span {
    pub span_id: String,
    pub text: String,
}

/// One resolvable piece of evidence inside an [`EvidencePack`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EvidenceItem {
    pub evidence_id: String,
    pub kind: String,
    #[serde(default)]
    pub spans: Vec<Span>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt_text: Option<String>,
}

/// The allowed-evidence-pack resolved for a transmission (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EvidencePack {
    pub pack_id: String,
    pub items: Vec<EvidenceItem>,
}

impl EvidencePack {
    /// Find an item by `evidence_id`.
    pub fn find(&self, evidence_id: &str) -> Option<&EvidenceItem> {
        self.items.iter().find(|i| i.evidence_id == evidence_id)
    }

    /// Whether `evidence_id`/`span_id` resolve within this pack.
    /// `span_id = None` only checks the evidence id itself.
    pub fn resolves(&self, evidence_id: &str, span_id: Option<&str>) -> bool {
        let Some(item) = self.find(evidence_id) else {
            return false;
        };
        match span_id {
            None => true,
            Some(sid) => item.spans.iter().any(|s| s.span_id == sid),
        }
    }
}

// ---------------------------------------------------------------------------
// OutputEnvelope / Claim / meta
// ---------------------------------------------------------------------------

/// A reference from a [`Claim`] to evidence (and optionally a specific
/// span within it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EvidenceRef {
    pub evidence_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

/// A claim made by the assistant, with its supporting evidence references.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Claim {
    pub claim_id: String,
    pub claim_text: String,
    pub evidence_refs: Vec<EvidenceRef>,
}

/// `meta.capture_suggestion`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CaptureSuggestion {
    pub suggestion_id: String,
    pub suggestion_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_start_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_date: Option<String>,
}

/// `meta.shape`: the memento's arc/active/parked/decisions/next snapshot as
/// returned by the model for this turn (pre-merge).
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Shape {
    #[serde(default)]
    pub arc: Option<String>,
    #[serde(default)]
    pub active: Vec<String>,
    #[serde(default)]
    pub parked: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub next: Vec<String>,
}

/// `meta.affect_signal`: the model's raw affect reading for this turn.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AffectSignal {
    pub label: String,
    pub intensity: f64,
    pub confidence: f64,
}

/// Verdict produced by the librarian gate (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LibrarianVerdict {
    Pass,
    Prune,
    Flag,
}

/// `meta.librarian_gate`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LibrarianGate {
    pub version: String,
    pub pruned_refs: u32,
    pub unsupported_claims: u32,
    pub support_score: f64,
    pub verdict: LibrarianVerdict,
    pub reason_codes: Vec<String>,
}

/// `meta.lattice`: retrieval timing/status stamped by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LatticeStamp {
    pub status: String,
    pub item_count: u32,
    pub bytes_total: u32,
}

/// The envelope's `meta` object. Strict at egress (only these keys may be
/// emitted); permissive-then-normalized at ingress (see `sol-envelope`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct EnvelopeMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claims: Option<Vec<Claim>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_evidence_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_pack_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_suggestion: Option<CaptureSuggestion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<Shape>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affect_signal: Option<AffectSignal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub librarian_gate: Option<LibrarianGate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lattice: Option<LatticeStamp>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "journalOffer")]
    pub journal_offer: Option<JournalOfferRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ghost_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ghost_payload: Option<Value>,
}

impl EnvelopeMeta {
    /// The allowlisted top-level meta keys (§3), in the order they should
    /// be checked for unknown-key rejection at ingress.
    pub const ALLOWED_KEYS: &'static [&'static str] = &[
        "meta_version",
        "claims",
        "used_evidence_ids",
        "evidence_pack_id",
        "capture_suggestion",
        "shape",
        "affect_signal",
        "librarian_gate",
        "lattice",
        "journalOffer",
        "display_hint",
        "ghost_kind",
        "ghost_payload",
    ];
}

/// The model's output, normalized into the strict egress contract.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OutputEnvelope {
    pub assistant_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<EnvelopeMeta>,
}

impl OutputEnvelope {
    /// Construct an envelope with no meta.
    pub fn new(assistant_text: impl Into<String>) -> Self {
        Self {
            assistant_text: assistant_text.into(),
            meta: None,
        }
    }

    /// A deterministic stub used when a gate fails and a persisted assistant
    /// text is still required (§7).
    pub fn stub(reason: &str) -> Self {
        Self::new(format!(
            "I wasn't able to complete that response ({reason})."
        ))
    }
}

// ---------------------------------------------------------------------------
// ThreadMementoLatest
// ---------------------------------------------------------------------------

/// One point in a thread's affect history.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AffectPoint {
    pub end_message_id: String,
    pub label: String,
    pub intensity: f64,
    pub confidence: String,
    pub source: String,
    pub ts: DateTime<Utc>,
}

/// Rolled-up affect summary derived from the retained [`AffectPoint`]s.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AffectRollup {
    pub phase: String,
    pub intensity_bucket: String,
    pub updated_at: DateTime<Utc>,
}

/// A thread's affect state: recent points plus the current rollup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Affect {
    #[serde(default)]
    pub points: Vec<AffectPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollup: Option<AffectRollup>,
}

/// Maximum retained length of each of the memento's ordered lists and of
/// the affect point history.
pub const MEMENTO_LIST_CAP: usize = 5;

/// Per-thread memento state: arc, active/parked topics, decisions, next
/// steps, and affect. Cached in-process; persisted only when the quality
/// predicate (§4.7) passes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ThreadMementoLatest {
    pub memento_id: Uuid,
    pub created_ts: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub arc: String,
    #[serde(default)]
    pub active: Vec<String>,
    #[serde(default)]
    pub parked: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub next: Vec<String>,
    #[serde(default)]
    pub affect: Affect,
}

impl ThreadMementoLatest {
    /// A fresh memento with default shape, as used the first time a thread
    /// is seen.
    pub fn default_for_thread(now: DateTime<Utc>) -> Self {
        Self {
            memento_id: Uuid::new_v4(),
            created_ts: now,
            updated_at: now,
            arc: "support".to_string(),
            active: Vec::new(),
            parked: Vec::new(),
            decisions: Vec::new(),
            next: Vec::new(),
            affect: Affect::default(),
        }
    }

    /// Push `value` onto `list`, keeping only the newest [`MEMENTO_LIST_CAP`]
    /// entries (oldest dropped from the front).
    pub fn push_capped(list: &mut Vec<String>, value: String) {
        list.push(value);
        if list.len() > MEMENTO_LIST_CAP {
            let overflow = list.len() - MEMENTO_LIST_CAP;
            list.drain(0..overflow);
        }
    }
}

// ---------------------------------------------------------------------------
// JournalOfferRecord
// ---------------------------------------------------------------------------

/// A specific reason a journaling offer was not made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JournalOfferReasonCode {
    NoAffectSignal,
    LabelNeutral,
    RiskNotLow,
    PhaseBlocked,
    Cooldown,
    Other,
}

/// The optional journaling offer classification for a turn (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JournalOfferRecord {
    pub offer_eligible: bool,
    pub phase: String,
    pub risk: String,
    pub label: String,
    pub intensity_bucket: String,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_span: Option<String>,
    #[serde(default)]
    pub reason_codes: Vec<JournalOfferReasonCode>,
}

// ---------------------------------------------------------------------------
// DriverBlock
// ---------------------------------------------------------------------------

/// A policy-authored text block constraining assistant output via a
/// `Validators:` section (parsed by `sol-linter`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DriverBlock {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub definition: String,
}

// ---------------------------------------------------------------------------
// Usage / DeliveryAttempt (ambient additions)
// ---------------------------------------------------------------------------

/// Normalized token/latency usage for one model attempt.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Usage {
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub latency_ms: u64,
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Succeeded,
    Failed,
}

/// One record of `appendDeliveryAttempt` (§6 store contract).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeliveryAttempt {
    pub transmission_id: Uuid,
    pub attempt_index: u8,
    pub outcome: DeliveryOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Byte length helper used throughout §4.5/§8: UTF-8 *bytes*, never chars.
pub fn utf8_len(s: &str) -> usize {
    s.len()
}

/// Byte length of the canonical JSON form of any serializable value — used
/// for the `meta ≤ 16 KiB` budget check.
pub fn json_byte_len<T: Serialize>(value: &T) -> Result<usize, ContractError> {
    Ok(canonical_json(value)?.len())
}

/// Render a `BTreeMap` key set as a stable, sorted debug string (used in a
/// few error messages so output doesn't depend on hash-map iteration order).
pub fn sorted_keys(map: &BTreeMap<String, Value>) -> String {
    map.keys().cloned().collect::<Vec<_>>().join(",")
}

impl fmt::Display for TransmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transmission_builder_defaults_to_created() {
        let t = Transmission::builder("thread-1").build();
        assert_eq!(t.status, TransmissionStatus::Created);
        assert_eq!(t.notification_policy, NotificationPolicy::Alert);
    }

    #[test]
    fn transmission_complete_clears_error() {
        let mut t = Transmission::builder("thread-1").build();
        t.fail(500, "internal_error", true);
        assert_eq!(t.status, TransmissionStatus::Failed);
        t.complete();
        assert_eq!(t.status, TransmissionStatus::Completed);
        assert!(t.error_code.is_none());
    }

    #[test]
    fn trace_run_seq_is_monotonic() {
        let mut run = TraceRun::new(Uuid::new_v4());
        run.append("system", "evidence_intake", "ok", "intake done", Value::Null);
        run.append("system", "gate_normalize_modality", "ok", "ok", Value::Null);
        assert!(run.seq_strictly_increasing());
        assert_eq!(run.events()[0].seq, 0);
        assert_eq!(run.events()[1].seq, 1);
    }

    #[test]
    fn authoritative_phase_order_positions_are_increasing_when_present() {
        let mut run = TraceRun::new(Uuid::new_v4());
        for phase in AUTHORITATIVE_PHASE_ORDER {
            run.append("system", *phase, "ok", "ok", Value::Null);
        }
        let positions = run.first_positions(AUTHORITATIVE_PHASE_ORDER);
        let resolved: Vec<usize> = positions.into_iter().flatten().collect();
        assert_eq!(resolved.len(), AUTHORITATIVE_PHASE_ORDER.len());
        assert!(resolved.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn evidence_pack_resolves_evidence_and_span() {
        let pack = EvidencePack {
            pack_id: "pack-1".into(),
            items: vec![EvidenceItem {
                evidence_id: "ev-1".into(),
                kind: "url".into(),
                spans: vec![Span {
                    span_id: "sp-1".into(),
                    text: "hello".into(),
                }],
                excerpt_text: None,
            }],
        };
        assert!(pack.resolves("ev-1", None));
        assert!(pack.resolves("ev-1", Some("sp-1")));
        assert!(!pack.resolves("ev-1", Some("sp-missing")));
        assert!(!pack.resolves("ev-missing", None));
    }

    #[test]
    fn memento_push_capped_keeps_newest_five() {
        let mut list = Vec::new();
        for i in 0..8 {
            ThreadMementoLatest::push_capped(&mut list, format!("item-{i}"));
        }
        assert_eq!(list.len(), MEMENTO_LIST_CAP);
        assert_eq!(list.first().unwrap(), "item-3");
        assert_eq!(list.last().unwrap(), "item-7");
    }

    #[test]
    fn envelope_hash_is_deterministic_and_content_sensitive() {
        let a = OutputEnvelope::new("hello");
        let b = OutputEnvelope::new("hello");
        let c = OutputEnvelope::new("goodbye");
        assert_eq!(envelope_hash(&a).unwrap(), envelope_hash(&b).unwrap());
        assert_ne!(envelope_hash(&a).unwrap(), envelope_hash(&c).unwrap());
    }

    #[test]
    fn utf8_len_counts_bytes_not_chars() {
        let emoji = "\u{1F600}".repeat(2000);
        assert_eq!(emoji.chars().count(), 2000);
        assert!(utf8_len(&emoji) > 2000 * 3);
    }

    #[test]
    fn meta_allowed_keys_contains_known_contract_keys() {
        assert!(EnvelopeMeta::ALLOWED_KEYS.contains(&"meta_version"));
        assert!(EnvelopeMeta::ALLOWED_KEYS.contains(&"journalOffer"));
        assert!(EnvelopeMeta::ALLOWED_KEYS.contains(&"ghost_kind"));
    }
}
