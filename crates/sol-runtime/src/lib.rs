// SPDX-License-Identifier: MIT OR Apache-2.0
//! The orchestrator (C9): drives the §2 pipeline end to end, owns the
//! [`Store`]/[`Provider`] contracts, and persists transmission/trace/envelope
//! state while emitting lifecycle events.
#![deny(unsafe_code)]

pub mod provider;
pub mod store;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use sol_core::{
    AffectSignal, DeliveryAttempt, DeliveryOutcome, DriverBlock, Evidence, EvidenceItem,
    EvidencePack, NotificationPolicy, OutputEnvelope, PacketInput, Shape, Span, ThreadMementoLatest,
    TraceRun, Transmission, TransmissionStatus, Usage,
};
#[cfg(test)]
use sol_core::AUTHORITATIVE_PHASE_ORDER;
use sol_error::ErrorCode;
use sol_lattice::{LatticeItem, LatticeMeta, LatticeStatus, PolicyBundleCache, PolicyCapsule};
use sol_memento::{AffectRollupFn, DefaultAffectRollup, QualityReport, TurnSignals};
use tokio::sync::broadcast;
use uuid::Uuid;

pub use provider::{FakeProvider, OpenAiProvider, Provider, ProviderError, ProviderRequest, ProviderResponse};
pub use store::{InMemoryStore, Store, TopologyKey};

const MAX_MODEL_ATTEMPTS: u8 = 2;

/// The orchestrator's own request envelope: [`PacketInput`] plus the
/// admission-time fields that belong to the [`Transmission`], not the
/// packet (§3).
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub packet: PacketInput,
    pub client_request_id: Option<String>,
    pub forced_persona: Option<String>,
}

/// Mode/persona resolution (§4.9 step 1, §9 forced-persona fallback).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeDecision {
    pub mode_label: String,
    pub persona_label: Option<String>,
    pub reasons: Vec<String>,
}

const KNOWN_PERSONAS: &[&str] = &["diogenes", "cassandra"];

/// Resolve the mode decision from a forced persona, if any. Unknown forced
/// personas still route to `System-mode` (§9 Open Question decision) but
/// carry an extra `forced_persona_unknown` reason.
pub fn resolve_mode(forced_persona: Option<&str>) -> ModeDecision {
    match forced_persona {
        Some(persona) => {
            let mut reasons = vec!["forced_persona".to_string()];
            if !KNOWN_PERSONAS.contains(&persona) {
                reasons.push("forced_persona_unknown".to_string());
            }
            ModeDecision {
                mode_label: "System-mode".to_string(),
                persona_label: Some(persona.to_string()),
                reasons,
            }
        }
        None => ModeDecision { mode_label: "Chat-mode".to_string(), persona_label: None, reasons: vec![] },
    }
}

/// Resolve the notification policy (§4.9 step 2): default `silent` for
/// worker/simulate requests, else `alert`; a client-requested `urgent` is
/// downgraded unless the sentinel gate (or a `cassandra` persona) allows it;
/// sentinel/`cassandra` always escalates regardless of what was requested.
pub fn resolve_notification_policy(
    requested: Option<NotificationPolicy>,
    worker_or_simulate: bool,
    persona: Option<&str>,
    sentinel_urgent: bool,
) -> NotificationPolicy {
    let allowed_urgent = sentinel_urgent || persona == Some("cassandra");
    let default = if worker_or_simulate { NotificationPolicy::Silent } else { NotificationPolicy::Alert };
    let mut policy = requested.unwrap_or(default);
    if policy == NotificationPolicy::Urgent && !allowed_urgent {
        policy = NotificationPolicy::Alert;
    }
    if allowed_urgent {
        policy = NotificationPolicy::Urgent;
    }
    policy
}

/// Counts recorded for the assembled prompt pack's driver blocks (§4.9 step 4).
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct DriverBlockCounts {
    pub accepted: usize,
    pub dropped: usize,
    pub trimmed: usize,
}

/// `{captures, supports, claims}` counts returned alongside the full
/// evidence payload.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct EvidenceSummary {
    pub captures: usize,
    pub supports: usize,
    pub claims: usize,
}

impl EvidenceSummary {
    fn of(evidence: &Evidence) -> Self {
        Self { captures: evidence.captures.len(), supports: evidence.supports.len(), claims: evidence.claims.len() }
    }
}

/// Lifecycle events broadcast on the user's SSE stream (§6).
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SseEvent {
    RunStarted { provider: String, model: String },
    AssistantFinalReady { transmission_status: String },
    AssistantFailed {
        code: String,
        detail: String,
        retryable: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
        category: String,
    },
}

/// The outcome of one `/v1/chat` request, shaped to match the §6 response
/// contract. The daemon maps each variant onto its HTTP status/body.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "kind")]
pub enum ChatOutcome {
    Ok {
        transmission_id: Uuid,
        mode_label: String,
        persona_label: Option<String>,
        reasons: Vec<String>,
        assistant: String,
        output_envelope: OutputEnvelope,
        thread_memento: ThreadMementoLatest,
        driver_blocks: DriverBlockCounts,
        evidence: Evidence,
        evidence_summary: EvidenceSummary,
        evidence_warnings: Vec<String>,
        notification_policy: NotificationPolicy,
        forced_persona: Option<String>,
        attempts_used: u8,
    },
    Accepted {
        transmission_id: Uuid,
        check_after_ms: u64,
        driver_blocks: DriverBlockCounts,
        evidence: Evidence,
        evidence_summary: EvidenceSummary,
        evidence_warnings: Vec<String>,
        thread_memento: ThreadMementoLatest,
    },
    InvalidRequest {
        code: String,
        message: String,
        details: serde_json::Value,
    },
    GateFailure {
        error: String,
        transmission_id: Uuid,
        retryable: bool,
        assistant: String,
    },
    ServerError {
        status_code: u16,
        error: String,
        transmission_id: Uuid,
        retryable: bool,
    },
}

/// Shared orchestrator state, following the teacher's `Runtime`/`AppState`
/// ownership pattern (§5): a `Store` + `Provider` pair, the process-local
/// memento cache, and the in-flight dedupe set for simulated-async requests.
#[derive(Clone)]
pub struct Runtime {
    pub store: Arc<dyn Store>,
    pub provider: Arc<dyn Provider>,
    pub config: sol_config::RuntimeConfig,
    pub driver_blocks: Vec<DriverBlock>,
    memento_cache: Arc<RwLock<std::collections::HashMap<String, ThreadMementoLatest>>>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    rollup: Arc<dyn AffectRollupFn + Send + Sync>,
    policy_cache: Arc<Mutex<Option<PolicyBundleCache>>>,
    events: broadcast::Sender<(Uuid, SseEvent)>,
}

impl Runtime {
    pub fn new(store: Arc<dyn Store>, provider: Arc<dyn Provider>, config: sol_config::RuntimeConfig) -> Self {
        let (events, _rx) = broadcast::channel(256);
        let policy_cache = config
            .lattice
            .policy_bundle_path
            .as_ref()
            .map(|path| PolicyBundleCache::new(path.clone()));
        Self {
            store,
            provider,
            config,
            driver_blocks: Vec::new(),
            memento_cache: Arc::new(RwLock::new(std::collections::HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            rollup: Arc::new(DefaultAffectRollup),
            policy_cache: Arc::new(Mutex::new(policy_cache)),
            events,
        }
    }

    #[must_use]
    pub fn with_driver_blocks(mut self, driver_blocks: Vec<DriverBlock>) -> Self {
        self.driver_blocks = driver_blocks;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(Uuid, SseEvent)> {
        self.events.subscribe()
    }

    fn emit(&self, transmission_id: Uuid, event: SseEvent) {
        let _ = self.events.send((transmission_id, event));
    }

    fn policy_capsules(&self) -> Vec<PolicyCapsule> {
        let mut guard = self.policy_cache.lock().unwrap();
        match guard.as_mut() {
            Some(cache) => cache.load().to_vec(),
            None => Vec::new(),
        }
    }

    async fn load_memento(&self, thread_id: &str, now: chrono::DateTime<Utc>) -> (ThreadMementoLatest, bool) {
        if let Some(cached) = self.memento_cache.read().unwrap().get(thread_id).cloned() {
            return (cached, false);
        }
        match self.store.get_thread_memento_latest(thread_id).await {
            Ok(Some(memento)) => (memento, false),
            _ => (ThreadMementoLatest::default_for_thread(now), true),
        }
    }

    /// Entry point for `POST /v1/chat`. Dispatches to the async-simulate
    /// branch (§4.9 "Async-simulate branch") or runs the pipeline inline.
    pub async fn handle_chat(&self, request: ChatRequest) -> ChatOutcome {
        let transmission_id = Uuid::new_v4();
        if request.packet.simulate.unwrap_or(false) {
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                in_flight.insert(transmission_id);
            }
            let runtime = self.clone();
            let background_request = request.clone();
            tokio::spawn(async move {
                runtime.run_pipeline(transmission_id, background_request).await;
                runtime.in_flight.lock().unwrap().remove(&transmission_id);
            });

            let now = Utc::now();
            let (memento, _first_time) = self.load_memento(&request.packet.thread_id, now).await;
            let evidence = request.packet.evidence.clone().unwrap_or_default();
            return ChatOutcome::Accepted {
                transmission_id,
                check_after_ms: 500,
                driver_blocks: DriverBlockCounts { accepted: self.driver_blocks.len(), dropped: 0, trimmed: 0 },
                evidence_summary: EvidenceSummary::of(&evidence),
                evidence,
                evidence_warnings: vec![],
                thread_memento: memento,
            };
        }

        self.run_pipeline(transmission_id, request).await
    }

    /// Runs the full pipeline (§2, §4.9) for one transmission id.
    async fn run_pipeline(&self, transmission_id: Uuid, request: ChatRequest) -> ChatOutcome {
        let now = Utc::now();
        let thread_id = request.packet.thread_id.clone();
        let message = request.packet.message.clone();

        let mode_decision = resolve_mode(request.forced_persona.as_deref());
        let worker_or_simulate = request.packet.simulate.unwrap_or(false) || request.packet.packet_type == "worker";
        let mut notification_policy = resolve_notification_policy(
            request.packet.requested_notification_policy,
            worker_or_simulate,
            mode_decision.persona_label.as_deref(),
            false,
        );

        let mut builder = Transmission::builder(thread_id.clone()).id(transmission_id).notification_policy(notification_policy);
        if let Some(cid) = &request.client_request_id {
            builder = builder.client_request_id(cid.clone());
        }
        if let Some(persona) = &request.forced_persona {
            builder = builder.forced_persona(persona.clone());
        }
        let transmission = builder.build();
        if let Err(err) = self.store.create_transmission(transmission).await {
            tracing::error!(%err, "failed to persist transmission");
        }

        let mut trace = TraceRun::new(transmission_id);
        let driver_blocks_count =
            DriverBlockCounts { accepted: self.driver_blocks.len(), dropped: 0, trimmed: 0 };

        // --- evidence_intake --------------------------------------------------
        let evidence_input = request.packet.evidence.clone().unwrap_or_default();
        let evidence = match sol_evidence::intake::normalize(evidence_input, &message, now) {
            Ok(evidence) => evidence,
            Err(err) => {
                self.trace_and_persist(&mut trace, "evidence_intake", "failed", err.to_string(), serde_json::json!({ "code": err.code.as_str() })).await;
                return ChatOutcome::InvalidRequest {
                    code: err.code.as_str().to_string(),
                    message: err.to_string(),
                    details: serde_json::to_value(&err.context).unwrap_or(serde_json::Value::Null),
                };
            }
        };
        self.trace_and_persist(
            &mut trace,
            "evidence_intake",
            "completed",
            format!("{} captures, {} supports, {} claims", evidence.captures.len(), evidence.supports.len(), evidence.claims.len()),
            serde_json::json!({}),
        )
        .await;

        // --- gates --------------------------------------------------------------
        let normalize_out = sol_gates::normalize_modality(&message);
        self.trace_gate(&mut trace, "gate_normalize_modality", &normalize_out).await;
        let url_out = sol_gates::url_extraction(&message);
        self.trace_gate(&mut trace, "gate_url_extraction", &url_out).await;
        let intent_out = sol_gates::intent(&message);
        self.trace_gate(&mut trace, "gate_intent", &intent_out).await;
        let sentinel_out = sol_gates::sentinel(&message);
        self.trace_gate(&mut trace, "gate_sentinel", &sentinel_out).await;

        let gate_outputs = vec![normalize_out.clone(), url_out.clone(), intent_out.clone(), sentinel_out.clone()];
        let sentinel_urgent = sol_gates::safety_is_urgent(&gate_outputs);
        let risk_med_or_high = sentinel_out.metadata.get("risk").and_then(|v| v.as_str()).map(|r| r != "low").unwrap_or(false);
        let intent_support = intent_out.metadata.get("label").and_then(|v| v.as_str()) == Some("support");

        let updated_policy = resolve_notification_policy(
            request.packet.requested_notification_policy,
            worker_or_simulate,
            mode_decision.persona_label.as_deref(),
            sentinel_urgent,
        );
        if updated_policy != notification_policy {
            notification_policy = updated_policy;
            if let Err(err) = self.store.update_transmission_policy(transmission_id, notification_policy).await {
                tracing::error!(%err, "failed to persist updated notification policy");
            }
        }

        // --- gate_lattice ---------------------------------------------------------
        let (lattice_items, lattice_meta) = if self.config.lattice.enabled {
            self.run_lattice(&request, &message, risk_med_or_high, intent_support).await
        } else {
            (vec![], LatticeMeta { status: LatticeStatus::Miss, counts: 0, bytes_total: 0, warnings: vec!["lattice_disabled".into()] })
        };
        self.trace_and_persist(
            &mut trace,
            "gate_lattice",
            "completed",
            format!("{:?}", lattice_meta.status),
            serde_json::json!({ "counts": lattice_meta.counts, "bytes_total": lattice_meta.bytes_total, "warnings": lattice_meta.warnings }),
        )
        .await;

        // --- evidence provider decision (§4.5) ------------------------------------
        let decision = sol_evidence::provider_decision(
            request.packet.force_evidence.unwrap_or(false),
            self.config.evidence_provider_force,
            self.config.sol_env == sol_config::SolEnv::Production,
            &evidence,
        );
        let pack = match decision {
            sol_evidence::ProviderDecision::Allowed if self.config.evidence_provider_enabled => Some(build_evidence_pack(&evidence)),
            _ => None,
        };

        // --- prompt pack + model attempts -----------------------------------------
        let prompt_text = build_prompt_pack(&message, &lattice_items, &self.driver_blocks);
        let model = request.packet.provider_hint.clone().unwrap_or_else(|| self.default_model());
        self.emit(transmission_id, SseEvent::RunStarted { provider: self.provider.name().to_string(), model: model.clone() });

        let enforcement_mode = self.enforcement_mode();
        let rules: Vec<sol_linter::ValidatorRule> = self.driver_blocks.iter().flat_map(sol_linter::parse_validators).collect();

        let mut attempts_used: u8 = 0;
        let mut retry_used = false;
        let mut accepted_envelope: Option<OutputEnvelope> = None;
        let mut failure: Option<(u16, ErrorCode, String)> = None;

        let mut current_prompt = prompt_text.clone();
        let mut current_model = model.clone();

        while attempts_used < MAX_MODEL_ATTEMPTS && accepted_envelope.is_none() && failure.is_none() {
            let attempt_index = attempts_used;
            attempts_used += 1;

            let response = self
                .provider
                .generate(ProviderRequest { prompt_text: current_prompt.clone(), mode_label: mode_decision.mode_label.clone(), model: current_model.clone() })
                .await;

            let raw_text = match response {
                Ok(response) => response.raw_text,
                Err(err) => {
                    self.trace_and_persist(&mut trace, "model_call", "failed", err.to_string(), serde_json::json!({ "code": err.code() })).await;
                    let (status_code, category) = provider_status(&err);
                    self.emit(
                        transmission_id,
                        SseEvent::AssistantFailed {
                            code: sse_code(&err),
                            detail: err.to_string(),
                            retryable: err.retryable(),
                            retry_after_ms: if let ProviderError::Timeout { retry_after_ms } = &err { *retry_after_ms } else { None },
                            category: category.to_string(),
                        },
                    );
                    return self.finalize_failure(transmission_id, status_code, err.error_code(), err.retryable(), &mut trace).await;
                }
            };
            self.trace_and_persist(&mut trace, "model_call", "completed", format!("attempt {attempt_index}"), serde_json::json!({ "attempt": attempt_index })).await;

            let envelope = match sol_envelope::parse(&raw_text, attempt_index) {
                Ok(envelope) => envelope,
                Err(err) => {
                    self.trace_and_persist(&mut trace, "output_gates", "failed", err.to_string(), serde_json::json!({ "reason": err.reason_code() })).await;
                    let can_contract_retry = !retry_used
                        && attempts_used < MAX_MODEL_ATTEMPTS
                        && self.config.output_contract_retry.enabled
                        && self.provider.name() == "openai"
                        && self.config.output_contract_retry.on.iter().any(|r| r == err.reason_code());
                    if can_contract_retry {
                        retry_used = true;
                        current_model = self.config.output_contract_retry.model.clone().unwrap_or(current_model);
                        continue;
                    }
                    failure = Some((422, ErrorCode::OutputContractFailed, format!("output_contract_failed:{}", err.reason_code())));
                    break;
                }
            };

            let mut envelope = envelope;
            if envelope.meta.as_ref().and_then(|m| m.display_hint.as_deref()) == Some("ghost_card") {
                let gate = sol_evidence::librarian(&mut envelope, pack.as_ref());
                self.trace_and_persist(&mut trace, "output_gates", "completed", "librarian_gate", serde_json::to_value(&gate).unwrap_or_default()).await;
            }

            if let Err(err) = sol_evidence::binding(&envelope, pack.as_ref()) {
                self.trace_and_persist(&mut trace, "output_gates", "failed", err.to_string(), serde_json::json!({ "ok": false, "reason": "invalid_binding" })).await;
                failure = Some((422, err.code, err.code.as_str().to_string()));
                break;
            }
            if let Err(err) = sol_evidence::budget(&envelope, pack.as_ref()) {
                let reason = &err.context.get("reason").cloned().unwrap_or(serde_json::Value::Null);
                self.trace_and_persist(&mut trace, "output_gates", "failed", err.to_string(), serde_json::json!({ "reason": reason })).await;
                failure = Some((422, err.code, err.code.as_str().to_string()));
                break;
            }

            let violations = sol_linter::evaluate(&envelope.assistant_text, &rules);
            let lint_outcome = sol_linter::enforce(enforcement_mode, violations);
            match lint_outcome {
                sol_linter::LintOutcome::Pass => {
                    self.trace_and_persist(&mut trace, "output_gates", "completed", "post_linter", serde_json::json!({ "violations": [] })).await;
                    sol_evidence::finalize(&mut envelope, pack.as_ref(), transmission_id);
                    accepted_envelope = Some(envelope);
                }
                sol_linter::LintOutcome::Warn(violations) => {
                    tracing::warn!(count = violations.len(), "driver-block validators warned");
                    self.trace_and_persist(&mut trace, "output_gates", "completed", "post_linter_warn", serde_json::json!({ "violations": violations.len() })).await;
                    sol_evidence::finalize(&mut envelope, pack.as_ref(), transmission_id);
                    accepted_envelope = Some(envelope);
                }
                sol_linter::LintOutcome::Fail(violations) => {
                    self.trace_and_persist(&mut trace, "output_gates", "failed", "driver_block", serde_json::json!({ "violations": violations.len() })).await;
                    if retry_used || attempts_used >= MAX_MODEL_ATTEMPTS {
                        failure = Some((422, ErrorCode::DriverBlockEnforcementFailed, "driver_block_enforcement_failed".to_string()));
                    } else {
                        retry_used = true;
                        current_prompt = format!(
                            "{prompt_text}\n\nCORRECTION: your previous response violated a driver-block rule ({} violation(s)); revise accordingly.",
                            violations.len()
                        );
                    }
                }
            }
        }

        if let Some((status_code, code, error_label)) = failure {
            let stub = OutputEnvelope::stub(&error_label);
            if let Err(err) = self.store.set_chat_result(transmission_id, stub.assistant_text.clone()).await {
                tracing::error!(%err, "failed to persist stub chat result");
            }
            self.emit(
                transmission_id,
                SseEvent::AssistantFailed {
                    code: code.as_str().to_string(),
                    detail: error_label.clone(),
                    retryable: code.retryable(),
                    retry_after_ms: None,
                    category: format!("{:?}", code.category()),
                },
            );
            return self.finalize_failure(transmission_id, status_code, code, code.retryable(), &mut trace).await;
        }

        let mut envelope = accepted_envelope.expect("loop only exits with envelope or failure set");

        // --- memento update + journal offer (§4.7, §4.8, §4.9 step 9) -------------
        let (previous_memento, first_time) = self.load_memento(&thread_id, now).await;
        let signals = TurnSignals {
            risk_or_conflict: risk_med_or_high,
            answer_provided: !envelope.assistant_text.trim().is_empty(),
            ..Default::default()
        };
        let decision = sol_memento::breakpoint_decision(&message, &signals);
        let previous_phase = previous_memento.affect.rollup.as_ref().map(|r| r.phase.as_str()).unwrap_or("support");
        let previous_intensity = previous_memento.affect.rollup.as_ref().map(|r| r.intensity_bucket.as_str()).unwrap_or("low");
        let frozen = sol_memento::should_freeze(previous_phase, previous_intensity, decision);

        let (mut updated_memento, mut new_affect_point, mut shape_changed, quality) =
            self.derive_memento_update(&envelope, &previous_memento, frozen, &message, transmission_id, now);
        self.trace_and_persist(&mut trace, "output_gates", "completed", "memento_quality", serde_json::json!({ "has_issue": quality.has_issue() })).await;

        // Quality-driven regeneration (§4.7) shares the single correction-retry
        // slot with the post-linter path (property 7: no request invokes the
        // model more than twice). The corrected envelope is accepted only if
        // it clears the same librarian/binding/budget/lint gates as the main
        // attempt; otherwise the original envelope stands.
        if quality.has_issue()
            && !retry_used
            && attempts_used < MAX_MODEL_ATTEMPTS
            && request.packet.thread_context_mode == sol_core::ThreadContextMode::Auto
        {
            retry_used = true;
            attempts_used += 1;
            let correction_prompt = format!(
                "{prompt_text}\n\nCORRECTION: your previous response omitted required structured fields; \
                 include a `shape` with at least one decision and an `affect_signal` in this response."
            );
            let regen = self
                .provider
                .generate(ProviderRequest { prompt_text: correction_prompt, mode_label: mode_decision.mode_label.clone(), model: current_model.clone() })
                .await;
            let repaired = match regen {
                Ok(response) => self.repair_envelope(response.raw_text, attempts_used - 1, pack.as_ref(), enforcement_mode, &rules),
                Err(_) => None,
            };
            match repaired {
                Some(mut candidate) => {
                    sol_evidence::finalize(&mut candidate, pack.as_ref(), transmission_id);
                    let (next_memento, next_new_affect, next_shape_changed, next_quality) =
                        self.derive_memento_update(&candidate, &previous_memento, frozen, &message, transmission_id, now);
                    envelope = candidate;
                    updated_memento = next_memento;
                    new_affect_point = next_new_affect;
                    shape_changed = next_shape_changed;
                    self.trace_and_persist(
                        &mut trace,
                        "output_gates",
                        "completed",
                        "quality_repair",
                        serde_json::json!({ "accepted": true, "retry_used": retry_used, "has_issue": next_quality.has_issue() }),
                    )
                    .await;
                }
                None => {
                    self.trace_and_persist(&mut trace, "output_gates", "completed", "quality_repair", serde_json::json!({ "accepted": false, "retry_used": retry_used })).await;
                }
            }
        }

        self.memento_cache.write().unwrap().insert(thread_id.clone(), updated_memento.clone());
        let should_persist = sol_memento::should_persist(new_affect_point, shape_changed, first_time);
        if should_persist {
            if let Err(err) = self.store.upsert_thread_memento_latest(&thread_id, updated_memento.clone()).await {
                tracing::error!(%err, "failed to persist memento");
            }
        }
        self.trace_and_persist(
            &mut trace,
            "output_gates",
            "completed",
            "breakpoint_engine",
            serde_json::json!({ "decision": format!("{decision:?}"), "frozen": frozen, "persisted": should_persist }),
        )
        .await;

        let affect_signal = envelope.meta.as_ref().and_then(|m| m.affect_signal.clone());
        let rollup = previous_memento.affect.rollup.clone();
        let risk_label = if risk_med_or_high { "med".to_string() } else { "low".to_string() };
        let journal_input = sol_journal::ClassifyInput {
            label: affect_signal.as_ref().map(|s| s.label.clone()),
            phase: rollup.as_ref().map(|r| r.phase.clone()).unwrap_or_else(|| "support".to_string()),
            risk: risk_label,
            intensity: affect_signal.as_ref().map(|s| s.intensity).unwrap_or(0.0),
            avoid_peak_overwhelm: frozen,
            mode: mode_decision.mode_label.clone(),
            evidence_span: None,
        };
        let journal_record = sol_journal::classify(&journal_input);
        self.trace_and_persist(
            &mut trace,
            "output_gates",
            "completed",
            "journal_offer",
            serde_json::json!({ "offer_eligible": journal_record.offer_eligible }),
        )
        .await;

        if let Some(meta) = envelope.meta.as_mut() {
            if journal_record.offer_eligible {
                meta.journal_offer = Some(journal_record);
            }
            meta.lattice = Some(sol_core::LatticeStamp {
                status: format!("{:?}", lattice_meta.status).to_lowercase(),
                item_count: lattice_meta.counts as u32,
                bytes_total: lattice_meta.bytes_total as u32,
            });
        }

        // --- persist + complete (§4.9 step 10) ------------------------------------
        if let Err(err) = self.store.save_evidence(transmission_id, evidence.clone()).await {
            tracing::error!(%err, "failed to persist evidence");
        }
        if let Err(err) = self.store.set_transmission_output_envelope(transmission_id, envelope.clone()).await {
            tracing::error!(%err, "failed to persist output envelope");
        }
        if let Err(err) = self.store.set_chat_result(transmission_id, envelope.assistant_text.clone()).await {
            tracing::error!(%err, "failed to persist chat result");
        }
        let _ = self
            .store
            .append_delivery_attempt(DeliveryAttempt {
                transmission_id,
                attempt_index: attempts_used - 1,
                outcome: DeliveryOutcome::Succeeded,
                error_code: None,
                started_at: now,
                finished_at: Utc::now(),
            })
            .await;
        let _ = self
            .store
            .record_usage(Usage { provider: self.provider.name().to_string(), model: current_model.clone(), prompt_tokens: 0, completion_tokens: 0, latency_ms: 0 })
            .await;
        let _ = self
            .store
            .update_transmission_status(transmission_id, TransmissionStatus::Completed, 200, false, None)
            .await;

        self.emit(transmission_id, SseEvent::AssistantFinalReady { transmission_status: "completed".to_string() });

        ChatOutcome::Ok {
            transmission_id,
            mode_label: mode_decision.mode_label,
            persona_label: mode_decision.persona_label,
            reasons: mode_decision.reasons,
            assistant: envelope.assistant_text.clone(),
            output_envelope: envelope,
            thread_memento: updated_memento,
            driver_blocks: driver_blocks_count,
            evidence_summary: EvidenceSummary::of(&evidence),
            evidence,
            evidence_warnings: vec![],
            notification_policy,
            forced_persona: request.forced_persona,
            attempts_used,
        }
    }

    async fn run_lattice(
        &self,
        request: &ChatRequest,
        message: &str,
        risk_med_or_high: bool,
        intent_support: bool,
    ) -> (Vec<LatticeItem>, LatticeMeta) {
        let Some(user_id) = request.packet.user_id.as_deref() else {
            return (vec![], LatticeMeta { status: LatticeStatus::Fail, counts: 0, bytes_total: 0, warnings: vec!["no_user_id".into()] });
        };
        let terms = sol_lattice::query_terms(message);
        if terms.is_empty() {
            return (vec![], LatticeMeta { status: LatticeStatus::Fail, counts: 0, bytes_total: 0, warnings: vec!["no_query_terms".into()] });
        }

        let mut hits = self.store.search_memory_artifacts_lexical(user_id, &terms, 6).await.unwrap_or_default();
        if self.config.lattice.vector_enabled {
            let embedding = sol_lattice::deterministic_embedding(message);
            let vector_hits = self
                .store
                .search_memory_artifacts_vector(user_id, &embedding, 6, self.config.lattice.vector_max_distance)
                .await
                .unwrap_or_default();
            if !vector_hits.is_empty() {
                hits = vector_hits;
            }
        }

        let capsules = self.policy_capsules();
        let selected: Vec<&PolicyCapsule> = if sol_lattice::should_load_capsules(risk_med_or_high, message, intent_support) {
            sol_lattice::select_capsules(&capsules, &terms)
        } else {
            vec![]
        };
        sol_lattice::assemble(&hits, &selected)
    }

    /// Merge a candidate envelope's shape/affect signal into the previous
    /// memento and derive the §4.7 quality report for it.
    fn derive_memento_update(
        &self,
        envelope: &OutputEnvelope,
        previous_memento: &ThreadMementoLatest,
        frozen: bool,
        message: &str,
        transmission_id: Uuid,
        now: chrono::DateTime<Utc>,
    ) -> (ThreadMementoLatest, bool, bool, QualityReport) {
        let model_shape = envelope.meta.as_ref().and_then(|m| m.shape.clone());
        let merged_shape: Shape = sol_memento::merge_shape(model_shape, previous_memento, frozen, message, &envelope.assistant_text);
        let shape_changed = merged_shape.arc.as_deref().unwrap_or("support") != previous_memento.arc
            || merged_shape.active != previous_memento.active
            || merged_shape.parked != previous_memento.parked
            || merged_shape.decisions != previous_memento.decisions
            || merged_shape.next != previous_memento.next;

        let affect_signal = envelope.meta.as_ref().and_then(|m| m.affect_signal.clone());
        let (affect, new_affect_point) = self.apply_affect(previous_memento, affect_signal.as_ref(), &transmission_id.to_string(), now);

        let updated_memento = ThreadMementoLatest {
            memento_id: previous_memento.memento_id,
            created_ts: previous_memento.created_ts,
            updated_at: now,
            arc: merged_shape.arc.clone().unwrap_or_else(|| "support".to_string()),
            active: merged_shape.active,
            parked: merged_shape.parked,
            decisions: merged_shape.decisions,
            next: merged_shape.next,
            affect,
        };

        let quality = QualityReport {
            shape_present: envelope.meta.as_ref().and_then(|m| m.shape.as_ref()).is_some(),
            shape_decisions_empty: updated_memento.decisions.is_empty(),
            affect_signal_present: affect_signal.is_some(),
        };

        (updated_memento, new_affect_point, shape_changed, quality)
    }

    /// Parse a corrective-regeneration response and run it through the same
    /// librarian/binding/budget/lint gates the main attempt uses. Returns
    /// `None` if the candidate fails any gate.
    fn repair_envelope(
        &self,
        raw_text: String,
        attempt_index: u8,
        pack: Option<&EvidencePack>,
        enforcement_mode: sol_linter::EnforcementMode,
        rules: &[sol_linter::ValidatorRule],
    ) -> Option<OutputEnvelope> {
        let mut candidate = sol_envelope::parse(&raw_text, attempt_index).ok()?;
        if candidate.meta.as_ref().and_then(|m| m.display_hint.as_deref()) == Some("ghost_card") {
            sol_evidence::librarian(&mut candidate, pack);
        }
        sol_evidence::binding(&candidate, pack).ok()?;
        sol_evidence::budget(&candidate, pack).ok()?;
        let violations = sol_linter::evaluate(&candidate.assistant_text, rules);
        match sol_linter::enforce(enforcement_mode, violations) {
            sol_linter::LintOutcome::Fail(_) => None,
            _ => Some(candidate),
        }
    }

    fn apply_affect(
        &self,
        previous: &ThreadMementoLatest,
        signal: Option<&AffectSignal>,
        end_message_id: &str,
        now: chrono::DateTime<Utc>,
    ) -> (sol_core::Affect, bool) {
        let Some(signal) = signal else {
            return (previous.affect.clone(), false);
        };
        let mut points = previous.affect.points.clone();
        let before = points.len();
        sol_memento::append_affect_point(&mut points, end_message_id.to_string(), signal.label.clone(), signal.intensity, signal.confidence, "model".to_string(), now);
        let new_point = points.len() > before;
        let rollup = self.rollup.rollup(&points, now);
        (sol_core::Affect { points, rollup: Some(rollup) }, new_point)
    }

    fn default_model(&self) -> String {
        self.config.openai_model.clone().unwrap_or_else(|| "fake-model".to_string())
    }

    fn enforcement_mode(&self) -> sol_linter::EnforcementMode {
        match self.config.enforcement_mode {
            sol_config::EnforcementMode::Strict => sol_linter::EnforcementMode::Strict,
            sol_config::EnforcementMode::Warn => sol_linter::EnforcementMode::Warn,
            sol_config::EnforcementMode::Off => sol_linter::EnforcementMode::Off,
        }
    }

    async fn trace_and_persist(&self, trace: &mut TraceRun, phase: &str, status: &str, summary: impl Into<String>, metadata: serde_json::Value) {
        let event = trace.append("orchestrator", phase, status, summary, metadata).clone();
        if let Err(err) = self.store.append_trace_event(trace.id, event).await {
            tracing::error!(%err, phase, "failed to persist trace event");
        }
    }

    async fn trace_gate(&self, trace: &mut TraceRun, phase: &str, output: &sol_gates::GateOutput) {
        let status = match output.status {
            sol_gates::GateStatus::Pass => "completed",
            sol_gates::GateStatus::Warn => "warn",
            sol_gates::GateStatus::Fail => "failed",
        };
        self.trace_and_persist(trace, phase, status, output.summary.clone(), output.metadata.clone()).await;
    }

    async fn finalize_failure(&self, transmission_id: Uuid, status_code: u16, code: ErrorCode, retryable: bool, trace: &mut TraceRun) -> ChatOutcome {
        let stub = OutputEnvelope::stub(code.as_str());
        if let Err(err) = self.store.set_chat_result(transmission_id, stub.assistant_text.clone()).await {
            tracing::error!(%err, "failed to persist failure stub");
        }
        if let Err(err) = self
            .store
            .update_transmission_status(transmission_id, TransmissionStatus::Failed, status_code, retryable, Some(code.as_str().to_string()))
            .await
        {
            tracing::error!(%err, "failed to persist failed transmission status");
        }
        let _ = trace; // trace events already persisted incrementally
        if status_code == 422 {
            ChatOutcome::GateFailure { error: code.as_str().to_string(), transmission_id, retryable, assistant: stub.assistant_text }
        } else {
            ChatOutcome::ServerError { status_code, error: code.as_str().to_string(), transmission_id, retryable }
        }
    }
}

fn build_prompt_pack(message: &str, lattice_items: &[LatticeItem], driver_blocks: &[DriverBlock]) -> String {
    let mut pack = String::new();
    for block in driver_blocks {
        pack.push_str(&block.definition);
        pack.push('\n');
    }
    for item in lattice_items {
        pack.push_str("# ");
        pack.push_str(&item.summary);
        pack.push('\n');
    }
    pack.push_str("User: ");
    pack.push_str(message);
    pack
}

/// Deterministic reference evidence provider (§4.5, §1 "evidence provider's
/// actual... out of scope"): turns normalized `Evidence` into an
/// `EvidencePack` the binding/budget gates can resolve claims against.
fn build_evidence_pack(evidence: &Evidence) -> EvidencePack {
    let mut items = Vec::new();
    for claim in &evidence.claims {
        items.push(EvidenceItem {
            evidence_id: claim.id.clone(),
            kind: "claim".to_string(),
            spans: vec![Span { span_id: claim.id.clone(), text: claim.text.clone() }],
            excerpt_text: Some(claim.text.clone()),
        });
    }
    for support in &evidence.supports {
        let text = support.text.clone().unwrap_or_default();
        items.push(EvidenceItem {
            evidence_id: support.id.clone(),
            kind: "support".to_string(),
            spans: vec![Span { span_id: support.id.clone(), text: text.clone() }],
            excerpt_text: Some(text),
        });
    }
    for capture in &evidence.captures {
        items.push(EvidenceItem {
            evidence_id: capture.id.clone(),
            kind: capture.kind.clone(),
            spans: vec![],
            excerpt_text: capture.url.clone(),
        });
    }
    EvidencePack { pack_id: format!("pack_{}", Uuid::new_v4()), items }
}

fn provider_status(err: &ProviderError) -> (u16, &'static str) {
    match err {
        ProviderError::OpenaiApiKeyMissing | ProviderError::OpenaiModelMissing => (500, "config"),
        ProviderError::InvalidRequest => (502, "provider"),
        ProviderError::UpstreamFailed | ProviderError::Failed => (502, "provider"),
        ProviderError::Timeout { .. } => (504, "provider"),
    }
}

fn sse_code(err: &ProviderError) -> String {
    match err {
        ProviderError::Timeout { .. } => "PROVIDER_TIMEOUT".to_string(),
        ProviderError::OpenaiApiKeyMissing | ProviderError::OpenaiModelMissing => "INTERNAL_ERROR".to_string(),
        _ => "PROVIDER_ERROR".to_string(),
    }
}

impl ProviderError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::OpenaiApiKeyMissing => ErrorCode::OpenaiApiKeyMissing,
            Self::OpenaiModelMissing => ErrorCode::OpenaiModelMissing,
            Self::InvalidRequest => ErrorCode::ProviderInvalidRequest,
            Self::UpstreamFailed => ErrorCode::ProviderUpstreamFailed,
            Self::Failed => ErrorCode::ProviderFailed,
            Self::Timeout { .. } => ErrorCode::ProviderTimeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_runtime(provider: Arc<dyn Provider>) -> Runtime {
        let store = Arc::new(InMemoryStore::new());
        let (config, _warnings) = sol_config::RuntimeConfig::from_map(&HashMap::new()).unwrap();
        Runtime::new(store, provider, config)
    }

    fn request(message: &str) -> ChatRequest {
        ChatRequest {
            packet: PacketInput {
                thread_id: "thread-1".to_string(),
                packet_type: "chat".to_string(),
                message: message.to_string(),
                evidence: None,
                thread_memento_ref: None,
                thread_memento_inline: None,
                provider_hint: None,
                requested_notification_policy: None,
                trace_capture_model_io: None,
                thread_context_mode: sol_core::ThreadContextMode::Auto,
                force_evidence: None,
                simulate: None,
                user_id: None,
            },
            client_request_id: None,
            forced_persona: None,
        }
    }

    #[test]
    fn resolve_mode_defaults_to_chat_mode() {
        let decision = resolve_mode(None);
        assert_eq!(decision.mode_label, "Chat-mode");
        assert!(decision.persona_label.is_none());
    }

    #[test]
    fn resolve_mode_forced_unknown_persona_falls_back() {
        let decision = resolve_mode(Some("mystery"));
        assert_eq!(decision.mode_label, "System-mode");
        assert!(decision.reasons.contains(&"forced_persona_unknown".to_string()));
    }

    #[test]
    fn resolve_mode_forced_known_persona() {
        let decision = resolve_mode(Some("diogenes"));
        assert_eq!(decision.mode_label, "System-mode");
        assert_eq!(decision.persona_label.as_deref(), Some("diogenes"));
        assert!(!decision.reasons.contains(&"forced_persona_unknown".to_string()));
    }

    #[test]
    fn notification_policy_escalates_on_sentinel_urgency() {
        let policy = resolve_notification_policy(None, false, None, true);
        assert_eq!(policy, NotificationPolicy::Urgent);
    }

    #[test]
    fn notification_policy_downgrades_unallowed_urgent_request() {
        let policy = resolve_notification_policy(Some(NotificationPolicy::Urgent), false, None, false);
        assert_eq!(policy, NotificationPolicy::Alert);
    }

    #[tokio::test]
    async fn happy_path_returns_ok_with_non_empty_assistant_text() {
        let runtime = test_runtime(Arc::new(FakeProvider::new()));
        let outcome = runtime.handle_chat(request("hello")).await;
        match outcome {
            ChatOutcome::Ok { assistant, notification_policy, .. } => {
                assert!(!assistant.is_empty());
                assert_eq!(notification_policy, NotificationPolicy::Alert);
            }
            other => panic!("expected Ok outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn quality_issue_triggers_corrective_regeneration() {
        // FakeProvider never emits a `shape`/`affect_signal`, so the quality
        // report always has an issue and the repair path always fires,
        // consuming the second of the two bounded model attempts.
        let runtime = test_runtime(Arc::new(FakeProvider::new()));
        let outcome = runtime.handle_chat(request("hello")).await;
        match outcome {
            ChatOutcome::Ok { attempts_used, .. } => assert_eq!(attempts_used, 2),
            other => panic!("expected Ok outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forced_persona_reasons_survive_into_chat_outcome() {
        let runtime = test_runtime(Arc::new(FakeProvider::new()));
        let mut req = request("hello");
        req.forced_persona = Some("diogenes".to_string());
        let outcome = runtime.handle_chat(req).await;
        match outcome {
            ChatOutcome::Ok { reasons, persona_label, .. } => {
                assert_eq!(persona_label.as_deref(), Some("diogenes"));
                assert!(reasons.contains(&"forced_persona".to_string()));
            }
            other => panic!("expected Ok outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sentinel_keyword_escalates_to_urgent() {
        let runtime = test_runtime(Arc::new(FakeProvider::new()));
        let outcome = runtime.handle_chat(request("I am having thoughts of suicide")).await;
        match outcome {
            ChatOutcome::Ok { notification_policy, .. } => assert_eq!(notification_policy, NotificationPolicy::Urgent),
            other => panic!("expected Ok outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_model_output_yields_gate_failure() {
        let runtime = test_runtime(Arc::new(FakeProvider::with_failure(provider::FakeFailure::MalformedJson)));
        let outcome = runtime.handle_chat(request("hello")).await;
        match outcome {
            ChatOutcome::GateFailure { error, .. } => assert!(error.starts_with("output_contract_failed") || error == "OUTPUT_CONTRACT_FAILED"),
            other => panic!("expected GateFailure outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn provider_upstream_failure_surfaces_as_server_error() {
        let runtime = test_runtime(Arc::new(FakeProvider::with_failure(provider::FakeFailure::UpstreamFailed)));
        let outcome = runtime.handle_chat(request("hello")).await;
        match outcome {
            ChatOutcome::ServerError { retryable, .. } => assert!(retryable),
            other => panic!("expected ServerError outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn simulate_returns_accepted_immediately() {
        let runtime = test_runtime(Arc::new(FakeProvider::new()));
        let mut req = request("hello");
        req.packet.simulate = Some(true);
        let outcome = runtime.handle_chat(req).await;
        assert!(matches!(outcome, ChatOutcome::Accepted { .. }));
    }

    #[test]
    fn authoritative_phase_order_is_exposed_for_property_tests() {
        assert_eq!(AUTHORITATIVE_PHASE_ORDER.first(), Some(&"evidence_intake"));
        assert_eq!(AUTHORITATIVE_PHASE_ORDER.last(), Some(&"output_gates"));
    }
}
