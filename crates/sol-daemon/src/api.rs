// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP-facing request/response types for `POST /v1/chat` and
//! `GET /internal/topology` (§6). These wrap [`sol_runtime::ChatOutcome`] in
//! the exact wire shapes the spec names, independent of the orchestrator's
//! internal enum layout.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sol_core::{NotificationPolicy, OutputEnvelope, PacketInput, ThreadMementoLatest};
use sol_runtime::{ChatOutcome, DriverBlockCounts, EvidenceSummary};

/// `POST /v1/chat` request body: a [`PacketInput`] plus the admission-time
/// fields the spec documents alongside it.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequestBody {
    #[serde(flatten)]
    pub packet: PacketInput,
    pub client_request_id: Option<String>,
    pub forced_persona: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModeDecisionBody {
    pub mode_label: String,
    pub persona_label: Option<String>,
    pub reasons: Vec<String>,
}

/// `200 OK` body for `POST /v1/chat`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatOkResponse {
    pub ok: bool,
    pub transmission_id: Uuid,
    pub mode_decision: ModeDecisionBody,
    pub assistant: String,
    pub output_envelope: OutputEnvelope,
    pub thread_memento: ThreadMementoLatest,
    pub driver_blocks: DriverBlockCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<sol_core::Evidence>,
    pub evidence_summary: EvidenceSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_warnings: Option<Vec<String>>,
    pub notification_policy: NotificationPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forced_persona: Option<String>,
}

/// `202 Accepted` body for a `simulate=true` request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatAcceptedResponse {
    pub ok: bool,
    pub transmission_id: Uuid,
    pub status: &'static str,
    pub pending: bool,
    pub simulated: bool,
    pub check_after_ms: u64,
    pub driver_blocks: DriverBlockCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<sol_core::Evidence>,
    pub evidence_summary: EvidenceSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_warnings: Option<Vec<String>>,
    pub thread_memento: ThreadMementoLatest,
}

/// `400 Bad Request` body: an evidence/packet validation failure.
#[derive(Debug, Clone, Serialize)]
pub struct InvalidRequestResponse {
    pub error: &'static str,
    pub code: String,
    pub message: String,
    pub details: serde_json::Value,
}

/// `422 Unprocessable Entity` body: a gate failure.
#[derive(Debug, Clone, Serialize)]
pub struct GateFailureResponse {
    pub error: String,
    pub transmission_id: Uuid,
    pub retryable: bool,
    pub assistant: String,
}

/// `500`/`502` body: a provider or config error.
#[derive(Debug, Clone, Serialize)]
pub struct ServerErrorResponse {
    pub error: String,
    pub transmission_id: Uuid,
    pub retryable: bool,
}

/// `GET /internal/topology` response body.
#[derive(Debug, Clone, Serialize)]
pub struct TopologyResponse {
    pub topology_key: String,
    pub created_at_ms: i64,
    pub created_by: String,
    pub db_path: String,
}

/// Map an orchestrator outcome onto the wire response shape that corresponds
/// to its HTTP status code.
pub enum ChatResponse {
    Ok(u16, ChatOkResponse),
    Accepted(u16, ChatAcceptedResponse),
    InvalidRequest(u16, InvalidRequestResponse),
    GateFailure(u16, GateFailureResponse),
    ServerError(u16, ServerErrorResponse),
}

impl From<ChatOutcome> for ChatResponse {
    fn from(outcome: ChatOutcome) -> Self {
        match outcome {
            ChatOutcome::Ok {
                transmission_id,
                mode_label,
                persona_label,
                reasons,
                assistant,
                output_envelope,
                thread_memento,
                driver_blocks,
                evidence,
                evidence_summary,
                evidence_warnings,
                notification_policy,
                forced_persona,
                attempts_used: _,
            } => Self::Ok(
                200,
                ChatOkResponse {
                    ok: true,
                    transmission_id,
                    mode_decision: ModeDecisionBody { mode_label, persona_label, reasons },
                    assistant,
                    output_envelope,
                    thread_memento,
                    driver_blocks,
                    evidence: Some(evidence),
                    evidence_summary,
                    evidence_warnings: if evidence_warnings.is_empty() { None } else { Some(evidence_warnings) },
                    notification_policy,
                    forced_persona,
                },
            ),
            ChatOutcome::Accepted { transmission_id, check_after_ms, driver_blocks, evidence, evidence_summary, evidence_warnings, thread_memento } => {
                Self::Accepted(
                    202,
                    ChatAcceptedResponse {
                        ok: true,
                        transmission_id,
                        status: "created",
                        pending: true,
                        simulated: true,
                        check_after_ms,
                        driver_blocks,
                        evidence: Some(evidence),
                        evidence_summary,
                        evidence_warnings: if evidence_warnings.is_empty() { None } else { Some(evidence_warnings) },
                        thread_memento,
                    },
                )
            }
            ChatOutcome::InvalidRequest { code, message, details } => {
                Self::InvalidRequest(400, InvalidRequestResponse { error: "invalid_request", code, message, details })
            }
            ChatOutcome::GateFailure { error, transmission_id, retryable, assistant } => {
                Self::GateFailure(422, GateFailureResponse { error, transmission_id, retryable, assistant })
            }
            ChatOutcome::ServerError { status_code, error, transmission_id, retryable } => {
                Self::ServerError(status_code, ServerErrorResponse { error, transmission_id, retryable })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_failure_serializes_expected_shape() {
        let response = GateFailureResponse {
            error: "evidence_binding_failed".to_string(),
            transmission_id: Uuid::nil(),
            retryable: false,
            assistant: "stub".to_string(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"], "evidence_binding_failed");
        assert_eq!(json["retryable"], false);
    }

    #[test]
    fn invalid_request_omits_no_fields() {
        let response = InvalidRequestResponse {
            error: "invalid_request",
            code: "evidence_bounds_exceeded".to_string(),
            message: "too many captures".to_string(),
            details: serde_json::json!({ "limit": 25 }),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"], "invalid_request");
        assert_eq!(json["details"]["limit"], 25);
    }
}
