// SPDX-License-Identifier: MIT OR Apache-2.0
//! Environment-driven runtime configuration for the Sol control plane.
//!
//! Loads the variables described in §6 of the spec into a typed
//! [`RuntimeConfig`], validating the combinations that must hold for the
//! orchestrator to start (e.g. an OpenAI model name is required once
//! `LLM_PROVIDER=openai` is selected) and surfacing everything else as
//! advisory [`ConfigWarning`]s.
#![deny(unsafe_code)]

use std::collections::HashMap;
use std::env::VarError;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sol_error::{ErrorCode, SolError};

/// Which LLM backend the orchestrator talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    Openai,
    Fake,
}

impl Default for LlmProvider {
    fn default() -> Self {
        Self::Fake
    }
}

/// Driver-block lint enforcement mode (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    Strict,
    Warn,
    Off,
}

/// Deployment environment, used to pick defaults (enforcement mode,
/// notification policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SolEnv {
    Production,
    Staging,
    Development,
}

impl Default for SolEnv {
    fn default() -> Self {
        Self::Development
    }
}

/// Advisory-level configuration issue that does not prevent startup but
/// deserves attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A recommended optional variable was not set; a default was used.
    MissingOptionalField {
        field: String,
        hint: String,
    },
    /// A variable's value fell outside the expected range and was clamped
    /// or ignored.
    OutOfRangeValue {
        field: String,
        value: String,
        hint: String,
    },
    /// An environment variable name is retained for backward compatibility
    /// and should be migrated.
    DeprecatedField {
        field: String,
        suggestion: String,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingOptionalField { field, hint } => {
                write!(f, "missing optional env var '{field}': {hint}")
            }
            Self::OutOfRangeValue { field, value, hint } => {
                write!(f, "env var '{field}' has out-of-range value '{value}': {hint}")
            }
            Self::DeprecatedField { field, suggestion } => {
                write!(f, "env var '{field}' is deprecated — use '{suggestion}' instead")
            }
        }
    }
}

/// Lattice retrieval (C4) feature flags and tuning.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LatticeConfig {
    pub enabled: bool,
    pub vector_enabled: bool,
    pub vector_query_enabled: bool,
    pub vector_max_distance: Option<f64>,
    pub policy_bundle_path: Option<String>,
}

impl Default for LatticeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            vector_enabled: false,
            vector_query_enabled: false,
            vector_max_distance: None,
            policy_bundle_path: None,
        }
    }
}

/// The output-contract retry feature (§4.9 step 6).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OutputContractRetryConfig {
    pub enabled: bool,
    pub model: Option<String>,
    pub on: Vec<String>,
}

impl Default for OutputContractRetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: None,
            on: vec!["invalid_json".into(), "schema_invalid".into()],
        }
    }
}

/// Top-level runtime settings for the orchestrator and HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RuntimeConfig {
    pub sol_env: SolEnv,
    pub llm_provider: LlmProvider,
    #[serde(skip_serializing)]
    pub openai_api_key: Option<String>,
    pub openai_model: Option<String>,
    pub enforcement_mode: EnforcementMode,
    pub lattice: LatticeConfig,
    pub output_contract_retry: OutputContractRetryConfig,
    pub evidence_provider_enabled: bool,
    pub evidence_provider_force: bool,
    pub trace_capture_model_io: bool,
    pub internal_token: Option<String>,
    pub log_filter: String,
    pub bind_addr: String,
}

impl RuntimeConfig {
    /// Load configuration from the process environment, returning advisory
    /// [`ConfigWarning`]s alongside the resolved config. Fails closed on the
    /// combinations documented in §6 (e.g. `LLM_PROVIDER=openai` requires
    /// both `OPENAI_API_KEY` and `OPENAI_MODEL`).
    pub fn from_env() -> Result<(Self, Vec<ConfigWarning>), SolError> {
        Self::from_map(&std::env::vars().collect())
    }

    /// Load configuration from an explicit map, for tests and for the
    /// `from_env` entry point above.
    pub fn from_map(env: &HashMap<String, String>) -> Result<(Self, Vec<ConfigWarning>), SolError> {
        let mut warnings = Vec::new();
        let get = |key: &str| env.get(key).cloned();

        let sol_env = match get("SOL_ENV").as_deref() {
            Some("production") => SolEnv::Production,
            Some("staging") => SolEnv::Staging,
            Some(_) | None => {
                if get("SOL_ENV").is_none() {
                    warnings.push(ConfigWarning::MissingOptionalField {
                        field: "SOL_ENV".into(),
                        hint: "defaulting to development".into(),
                    });
                }
                SolEnv::Development
            }
        };

        let llm_provider = match get("LLM_PROVIDER").as_deref() {
            Some("openai") => LlmProvider::Openai,
            Some("fake") | None => LlmProvider::Fake,
            Some(other) => {
                warnings.push(ConfigWarning::OutOfRangeValue {
                    field: "LLM_PROVIDER".into(),
                    value: other.into(),
                    hint: "expected openai|fake, defaulting to fake".into(),
                });
                LlmProvider::Fake
            }
        };

        let openai_api_key = get("OPENAI_API_KEY");
        let openai_model = get("OPENAI_MODEL");

        if llm_provider == LlmProvider::Openai {
            if openai_api_key.as_deref().unwrap_or("").is_empty() {
                return Err(SolError::new(
                    ErrorCode::OpenaiApiKeyMissing,
                    "OPENAI_API_KEY is required when LLM_PROVIDER=openai",
                ));
            }
            if openai_model.as_deref().unwrap_or("").is_empty() {
                return Err(SolError::new(
                    ErrorCode::OpenaiModelMissing,
                    "OPENAI_MODEL is required when LLM_PROVIDER=openai",
                ));
            }
        }

        let enforcement_field = if get("DRIVER_BLOCK_ENFORCEMENT").is_some() { "DRIVER_BLOCK_ENFORCEMENT" } else { "SOL_ENFORCEMENT_MODE" };
        let enforcement_mode = get("DRIVER_BLOCK_ENFORCEMENT")
            .or_else(|| get("SOL_ENFORCEMENT_MODE"))
            .map(|v| match v.as_str() {
                "strict" => EnforcementMode::Strict,
                "off" => EnforcementMode::Off,
                "warn" => EnforcementMode::Warn,
                other => {
                    warnings.push(ConfigWarning::OutOfRangeValue {
                        field: enforcement_field.into(),
                        value: other.into(),
                        hint: "expected strict|warn|off".into(),
                    });
                    EnforcementMode::Warn
                }
            })
            .unwrap_or(match sol_env {
                SolEnv::Production => EnforcementMode::Strict,
                _ => EnforcementMode::Warn,
            });

        if get("DRIVER_BLOCK_ENFORCEMENT").is_some() && get("SOL_ENFORCEMENT_MODE").is_some() {
            warnings.push(ConfigWarning::DeprecatedField {
                field: "DRIVER_BLOCK_ENFORCEMENT".into(),
                suggestion: "SOL_ENFORCEMENT_MODE".into(),
            });
        }

        let lattice = LatticeConfig {
            enabled: bool_env(&get, "LATTICE_ENABLED"),
            vector_enabled: bool_env(&get, "LATTICE_VEC_ENABLED"),
            vector_query_enabled: bool_env(&get, "LATTICE_VEC_QUERY_ENABLED"),
            vector_max_distance: get("LATTICE_VEC_MAX_DISTANCE").and_then(|v| v.parse().ok()),
            policy_bundle_path: get("LATTICE_POLICY_BUNDLE_PATH"),
        };

        let output_contract_retry = OutputContractRetryConfig {
            enabled: bool_env(&get, "OUTPUT_CONTRACT_RETRY_ENABLED"),
            model: get("OUTPUT_CONTRACT_RETRY_MODEL"),
            on: get("OUTPUT_CONTRACT_RETRY_ON")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|| vec!["invalid_json".into(), "schema_invalid".into()]),
        };

        if output_contract_retry.enabled && output_contract_retry.model.is_none() {
            warnings.push(ConfigWarning::MissingOptionalField {
                field: "OUTPUT_CONTRACT_RETRY_MODEL".into(),
                hint: "contract retry is enabled but no retry model is configured".into(),
            });
        }

        let log_filter = get("SOL_LOG")
            .or_else(|| get("RUST_LOG"))
            .unwrap_or_else(|| "info".to_string());
        if get("SOL_LOG").is_none() && get("RUST_LOG").is_none() {
            warnings.push(ConfigWarning::MissingOptionalField {
                field: "SOL_LOG".into(),
                hint: "defaulting log filter to 'info'".into(),
            });
        }

        let bind_addr = get("SOL_BIND_ADDR").unwrap_or_else(|| "127.0.0.1:4600".to_string());

        let internal_token = get("SOL_INTERNAL_TOKEN");
        if internal_token.is_none() {
            warnings.push(ConfigWarning::MissingOptionalField {
                field: "SOL_INTERNAL_TOKEN".into(),
                hint: "the /internal/topology endpoint will reject all requests".into(),
            });
        }

        Ok((
            Self {
                sol_env,
                llm_provider,
                openai_api_key,
                openai_model,
                enforcement_mode,
                lattice,
                output_contract_retry,
                evidence_provider_enabled: bool_env(&get, "EVIDENCE_PROVIDER"),
                evidence_provider_force: bool_env(&get, "EVIDENCE_PROVIDER_FORCE"),
                trace_capture_model_io: bool_env(&get, "TRACE_CAPTURE_MODEL_IO"),
                internal_token,
                log_filter,
                bind_addr,
            },
            warnings,
        ))
    }
}

fn bool_env(get: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    matches!(
        get(key).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

/// Read a single variable, mapping a missing variable to `None` rather than
/// an error — a thin wrapper kept for parity with call sites that reach for
/// `std::env::var` directly instead of the bulk loader.
pub fn optional_var(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => Some(v),
        Ok(_) | Err(VarError::NotPresent) | Err(VarError::NotUnicode(_)) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn defaults_to_fake_provider_with_no_env() {
        let (cfg, warnings) = RuntimeConfig::from_map(&HashMap::new()).unwrap();
        assert_eq!(cfg.llm_provider, LlmProvider::Fake);
        assert!(!warnings.is_empty());
    }

    #[test]
    fn openai_provider_requires_api_key_and_model() {
        let env = map(&[("LLM_PROVIDER", "openai")]);
        let err = RuntimeConfig::from_map(&env).unwrap_err();
        assert_eq!(err.code, ErrorCode::OpenaiApiKeyMissing);

        let env = map(&[("LLM_PROVIDER", "openai"), ("OPENAI_API_KEY", "sk-test")]);
        let err = RuntimeConfig::from_map(&env).unwrap_err();
        assert_eq!(err.code, ErrorCode::OpenaiModelMissing);

        let env = map(&[
            ("LLM_PROVIDER", "openai"),
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_MODEL", "gpt-4o"),
        ]);
        let (cfg, _) = RuntimeConfig::from_map(&env).unwrap();
        assert_eq!(cfg.llm_provider, LlmProvider::Openai);
    }

    #[test]
    fn production_defaults_enforcement_to_strict() {
        let env = map(&[("SOL_ENV", "production")]);
        let (cfg, _) = RuntimeConfig::from_map(&env).unwrap();
        assert_eq!(cfg.enforcement_mode, EnforcementMode::Strict);
    }

    #[test]
    fn non_production_defaults_enforcement_to_warn() {
        let (cfg, _) = RuntimeConfig::from_map(&HashMap::new()).unwrap();
        assert_eq!(cfg.enforcement_mode, EnforcementMode::Warn);
    }

    #[test]
    fn unknown_enforcement_value_warns_and_falls_back() {
        let env = map(&[("SOL_ENFORCEMENT_MODE", "bogus")]);
        let (cfg, warnings) = RuntimeConfig::from_map(&env).unwrap();
        assert_eq!(cfg.enforcement_mode, EnforcementMode::Warn);
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::OutOfRangeValue { field, .. } if field == "SOL_ENFORCEMENT_MODE")));
    }
}
