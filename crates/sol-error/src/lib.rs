//! Unified error taxonomy with stable error codes for the Sol control plane.
//!
//! Every Sol error carries an [`ErrorCode`] (a machine-readable, stable string
//! tag), a human-readable message, an optional cause chain, and arbitrary
//! key-value context. Use the builder returned by [`SolError::new`] to
//! construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to, per §7 of the error
/// handling design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Evidence shape/bounds/timestamp violations. HTTP 400, never retried.
    Validation,
    /// A gate rejected the attempt. HTTP 422, never retried.
    GateFailure,
    /// The LLM provider adapter failed. HTTP 502/504/500, may be retryable.
    Provider,
    /// Missing or invalid deployment configuration. HTTP 500, never retried.
    Config,
    /// The evidence provider collaborator failed. HTTP 500, retryable.
    EvidenceProvider,
    /// Deliberately injected failure used in tests/dev hooks. HTTP 500, retryable.
    Simulated,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::GateFailure => "gate_failure",
            Self::Provider => "provider",
            Self::Config => "config",
            Self::EvidenceProvider => "evidence_provider",
            Self::Simulated => "simulated",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases. These are the `error`
/// values surfaced on `POST /v1/chat` responses and persisted on the
/// transmission's structured error detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Validation (400) --
    /// Captures/supports/claims exceeded their configured bound.
    EvidenceBoundsExceeded,
    /// A support or claim referenced a nonexistent id.
    EvidenceShapeInvalid,
    /// A support or claim timestamp was not valid ISO-8601.
    EvidenceTimestampInvalid,

    // -- Gate failure (422) --
    /// The model's output failed envelope parse/schema validation.
    OutputContractFailed,
    /// A claim referenced evidence that could not be resolved in the pack.
    EvidenceBindingFailed,
    /// Claims were present but no evidence pack was available.
    ClaimsWithoutEvidence,
    /// The envelope exceeded a budget gate limit (claims/refs/bytes).
    EvidenceBudgetExceeded,
    /// The post-output linter rejected the assistant text.
    DriverBlockEnforcementFailed,

    // -- Provider (502/408/504/500) --
    /// The provider rejected the request outright; not retryable.
    ProviderInvalidRequest,
    /// The provider's upstream dependency failed; retryable.
    ProviderUpstreamFailed,
    /// The provider failed for an unclassified reason; retryable.
    ProviderFailed,
    /// The provider call timed out.
    ProviderTimeout,

    // -- Config (500) --
    /// `OPENAI_API_KEY` is required but missing.
    OpenaiApiKeyMissing,
    /// `OPENAI_MODEL` is required but missing.
    OpenaiModelMissing,

    // -- Evidence provider (500) --
    /// The evidence provider collaborator violated its contract.
    EvidenceProviderContractFailed,
    /// The evidence provider collaborator failed for an unclassified reason.
    EvidenceProviderFailed,

    // -- Simulated (500) --
    /// A deliberately injected failure, used in tests and dev hooks.
    SimulatedFailure,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    InternalError,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::EvidenceBoundsExceeded
            | Self::EvidenceShapeInvalid
            | Self::EvidenceTimestampInvalid => ErrorCategory::Validation,

            Self::OutputContractFailed
            | Self::EvidenceBindingFailed
            | Self::ClaimsWithoutEvidence
            | Self::EvidenceBudgetExceeded
            | Self::DriverBlockEnforcementFailed => ErrorCategory::GateFailure,

            Self::ProviderInvalidRequest
            | Self::ProviderUpstreamFailed
            | Self::ProviderFailed
            | Self::ProviderTimeout => ErrorCategory::Provider,

            Self::OpenaiApiKeyMissing | Self::OpenaiModelMissing => ErrorCategory::Config,

            Self::EvidenceProviderContractFailed | Self::EvidenceProviderFailed => {
                ErrorCategory::EvidenceProvider
            }

            Self::SimulatedFailure => ErrorCategory::Simulated,

            Self::InternalError => ErrorCategory::Internal,
        }
    }

    /// Whether a request that failed with this code may be retried by the
    /// caller. Validation, gate, and config failures are never retryable;
    /// only provider, evidence-provider, and simulated failures are.
    pub fn retryable(&self) -> bool {
        if matches!(self, Self::ProviderInvalidRequest) {
            return false;
        }
        matches!(
            self.category(),
            ErrorCategory::Provider | ErrorCategory::EvidenceProvider | ErrorCategory::Simulated
        )
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"EVIDENCE_BINDING_FAILED"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EvidenceBoundsExceeded => "EVIDENCE_BOUNDS_EXCEEDED",
            Self::EvidenceShapeInvalid => "EVIDENCE_SHAPE_INVALID",
            Self::EvidenceTimestampInvalid => "EVIDENCE_TIMESTAMP_INVALID",
            Self::OutputContractFailed => "OUTPUT_CONTRACT_FAILED",
            Self::EvidenceBindingFailed => "EVIDENCE_BINDING_FAILED",
            Self::ClaimsWithoutEvidence => "CLAIMS_WITHOUT_EVIDENCE",
            Self::EvidenceBudgetExceeded => "EVIDENCE_BUDGET_EXCEEDED",
            Self::DriverBlockEnforcementFailed => "DRIVER_BLOCK_ENFORCEMENT_FAILED",
            Self::ProviderInvalidRequest => "PROVIDER_INVALID_REQUEST",
            Self::ProviderUpstreamFailed => "PROVIDER_UPSTREAM_FAILED",
            Self::ProviderFailed => "PROVIDER_FAILED",
            Self::ProviderTimeout => "PROVIDER_TIMEOUT",
            Self::OpenaiApiKeyMissing => "OPENAI_API_KEY_MISSING",
            Self::OpenaiModelMissing => "OPENAI_MODEL_MISSING",
            Self::EvidenceProviderContractFailed => "EVIDENCE_PROVIDER_CONTRACT_FAILED",
            Self::EvidenceProviderFailed => "EVIDENCE_PROVIDER_FAILED",
            Self::SimulatedFailure => "SIMULATED_FAILURE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SolError
// ---------------------------------------------------------------------------

/// Unified Sol error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context that is
/// persisted verbatim on a transmission's error detail.
///
/// # Builder usage
///
/// ```
/// use sol_error::{SolError, ErrorCode};
///
/// let err = SolError::new(ErrorCode::EvidenceBudgetExceeded, "too many claims")
///     .with_context("reason", "max_claims")
///     .with_context("claim_count", 9);
/// ```
pub struct SolError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics, persisted alongside the
    /// transmission's error detail.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl SolError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Shorthand for `self.code.retryable()`.
    pub fn retryable(&self) -> bool {
        self.code.retryable()
    }
}

impl fmt::Debug for SolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("SolError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for SolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for SolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`SolError`] (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SolErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&SolError> for SolErrorDto {
    fn from(err: &SolError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<SolErrorDto> for SolError {
    fn from(dto: SolErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;

    /// All error codes for exhaustive iteration in tests.
    const ALL_CODES: &[ErrorCode] = &[
        ErrorCode::EvidenceBoundsExceeded,
        ErrorCode::EvidenceShapeInvalid,
        ErrorCode::EvidenceTimestampInvalid,
        ErrorCode::OutputContractFailed,
        ErrorCode::EvidenceBindingFailed,
        ErrorCode::ClaimsWithoutEvidence,
        ErrorCode::EvidenceBudgetExceeded,
        ErrorCode::DriverBlockEnforcementFailed,
        ErrorCode::ProviderInvalidRequest,
        ErrorCode::ProviderUpstreamFailed,
        ErrorCode::ProviderFailed,
        ErrorCode::ProviderTimeout,
        ErrorCode::OpenaiApiKeyMissing,
        ErrorCode::OpenaiModelMissing,
        ErrorCode::EvidenceProviderContractFailed,
        ErrorCode::EvidenceProviderFailed,
        ErrorCode::SimulatedFailure,
        ErrorCode::InternalError,
    ];

    // -- Construction & Display -----------------------------------------

    #[test]
    fn basic_construction() {
        let err = SolError::new(ErrorCode::InternalError, "boom");
        assert_eq!(err.code, ErrorCode::InternalError);
        assert_eq!(err.message, "boom");
        assert!(err.source.is_none());
        assert!(err.context.is_empty());
    }

    #[test]
    fn display_without_context() {
        let err = SolError::new(ErrorCode::EvidenceBindingFailed, "bad binding");
        assert_eq!(err.to_string(), "[EVIDENCE_BINDING_FAILED] bad binding");
    }

    #[test]
    fn display_with_context() {
        let err = SolError::new(ErrorCode::EvidenceBudgetExceeded, "too many claims")
            .with_context("reason", "max_claims");
        let s = err.to_string();
        assert!(s.starts_with("[EVIDENCE_BUDGET_EXCEEDED] too many claims"));
        assert!(s.contains("max_claims"));
    }

    #[test]
    fn debug_with_source() {
        let src = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err =
            SolError::new(ErrorCode::OpenaiApiKeyMissing, "init failed").with_source(src);
        let dbg = format!("{err:?}");
        assert!(dbg.contains("source"));
        assert!(dbg.contains("file missing"));
    }

    // -- Error code categorization --------------------------------------

    #[test]
    fn validation_codes_categorised() {
        assert_eq!(
            ErrorCode::EvidenceBoundsExceeded.category(),
            ErrorCategory::Validation
        );
        assert!(!ErrorCode::EvidenceBoundsExceeded.retryable());
    }

    #[test]
    fn gate_failure_codes_categorised() {
        for code in [
            ErrorCode::OutputContractFailed,
            ErrorCode::EvidenceBindingFailed,
            ErrorCode::ClaimsWithoutEvidence,
            ErrorCode::EvidenceBudgetExceeded,
            ErrorCode::DriverBlockEnforcementFailed,
        ] {
            assert_eq!(code.category(), ErrorCategory::GateFailure);
            assert!(!code.retryable());
        }
    }

    #[test]
    fn provider_codes_retryable_except_invalid_request() {
        assert!(!ErrorCode::ProviderInvalidRequest.retryable());
        assert!(ErrorCode::ProviderUpstreamFailed.retryable());
        assert!(ErrorCode::ProviderFailed.retryable());
        assert!(ErrorCode::ProviderTimeout.retryable());
    }

    #[test]
    fn config_codes_not_retryable() {
        assert_eq!(
            ErrorCode::OpenaiApiKeyMissing.category(),
            ErrorCategory::Config
        );
        assert!(!ErrorCode::OpenaiModelMissing.retryable());
    }

    #[test]
    fn evidence_provider_codes_retryable() {
        assert!(ErrorCode::EvidenceProviderContractFailed.retryable());
        assert!(ErrorCode::EvidenceProviderFailed.retryable());
    }

    // -- Builder pattern ------------------------------------------------

    #[test]
    fn builder_with_context_multiple_keys() {
        let err = SolError::new(ErrorCode::EvidenceBudgetExceeded, "budget")
            .with_context("reason", "max_refs_per_claim")
            .with_context("claim_id", "clm-1")
            .with_context("ref_count", 5);
        assert_eq!(err.context.len(), 3);
        assert_eq!(
            err.context["reason"],
            serde_json::json!("max_refs_per_claim")
        );
    }

    #[test]
    fn category_shorthand() {
        let err = SolError::new(ErrorCode::ClaimsWithoutEvidence, "no pack");
        assert_eq!(err.category(), ErrorCategory::GateFailure);
        assert!(!err.retryable());
    }

    // -- Serialization / Deserialization --------------------------------

    #[test]
    fn error_code_serde_roundtrip() {
        let code = ErrorCode::EvidenceBindingFailed;
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, r#""EVIDENCE_BINDING_FAILED""#);
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);
    }

    #[test]
    fn dto_roundtrip_without_source() {
        let err = SolError::new(ErrorCode::EvidenceBudgetExceeded, "bad")
            .with_context("reason", "max_claims");
        let dto: SolErrorDto = (&err).into();
        let json = serde_json::to_string(&dto).unwrap();
        let back: SolErrorDto = serde_json::from_str(&json).unwrap();
        assert_eq!(dto, back);
        assert!(back.source_message.is_none());
    }

    #[test]
    fn dto_roundtrip_with_source() {
        let src = io::Error::new(io::ErrorKind::BrokenPipe, "pipe broke");
        let err = SolError::new(ErrorCode::ProviderFailed, "crash").with_source(src);
        let dto: SolErrorDto = (&err).into();
        assert_eq!(dto.source_message.as_deref(), Some("pipe broke"));
    }

    // -- Error chain (source) preservation ------------------------------

    #[test]
    fn std_error_source_chain() {
        let inner = io::Error::new(io::ErrorKind::NotFound, "not found");
        let err = SolError::new(ErrorCode::EvidenceProviderFailed, "staging").with_source(inner);
        let src = std::error::Error::source(&err).unwrap();
        assert_eq!(src.to_string(), "not found");
    }

    // -- Unique string representations ----------------------------------

    #[test]
    fn all_codes_have_unique_as_str() {
        let mut seen = HashSet::new();
        for code in ALL_CODES {
            let s = code.as_str();
            assert!(seen.insert(s), "duplicate as_str value: {s}");
        }
        assert_eq!(seen.len(), ALL_CODES.len());
    }

    #[test]
    fn all_codes_display_matches_as_str() {
        for code in ALL_CODES {
            assert_eq!(code.to_string(), code.as_str());
        }
    }

    #[test]
    fn all_codes_serialize_to_as_str() {
        for code in ALL_CODES {
            let json = serde_json::to_string(code).unwrap();
            let expected = format!(r#""{}""#, code.as_str());
            assert_eq!(json, expected, "mismatch for {code:?}");
        }
    }
}
