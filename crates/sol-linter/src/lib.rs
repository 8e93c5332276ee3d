// SPDX-License-Identifier: MIT OR Apache-2.0
//! Parses a driver block's `Validators:` section into a small rule DSL and
//! lints assistant output against it (C6).
#![deny(unsafe_code)]

use sol_core::DriverBlock;

/// The kind of a parsed validator rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// The pattern (or any alternative) must NOT be present.
    MustNot,
    /// The pattern (or any alternative) must be present.
    MustHave,
}

/// One parsed `Validators:` line. `alternatives` holds the slash-expanded
/// patterns; a `must_have` rule with more than one alternative behaves as
/// `must-have-any` (passes if any alternative is present).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorRule {
    pub driver_block_id: String,
    pub kind: RuleKind,
    pub alternatives: Vec<String>,
}

/// Slash-expand a quoted pattern per §4.6: split on `/`; if the first
/// segment contains a space, the text before that space is treated as a
/// shared prefix and prepended to every later alternative.
pub fn expand_slash_pattern(pattern: &str) -> Vec<String> {
    let segments: Vec<&str> = pattern.split('/').map(str::trim).collect();
    if segments.len() <= 1 {
        return segments.into_iter().map(str::to_string).collect();
    }

    let first = segments[0];
    let prefix = first.split_whitespace().next();

    let mut out = vec![first.to_string()];
    for seg in &segments[1..] {
        match (first.contains(' '), prefix) {
            (true, Some(prefix)) => out.push(format!("{prefix} {seg}")),
            _ => out.push((*seg).to_string()),
        }
    }
    out
}

/// Parse every `- Must-not: "..."` / `- Must-have: "..."` / `- Must: "..."`
/// line out of a driver block's `Validators:` section. `Must:` is treated
/// as `Must-have`. Lines outside a `Validators:` section, or not matching
/// the rule grammar, are ignored.
pub fn parse_validators(block: &DriverBlock) -> Vec<ValidatorRule> {
    let mut rules = Vec::new();
    let mut in_validators = false;

    for line in block.definition.lines() {
        let trimmed = line.trim();
        if trimmed.eq_ignore_ascii_case("validators:") {
            in_validators = true;
            continue;
        }
        if !in_validators {
            continue;
        }
        if !trimmed.starts_with('-') {
            if !trimmed.is_empty() && !trimmed.starts_with(' ') {
                in_validators = false;
            }
            continue;
        }

        let body = trimmed.trim_start_matches('-').trim();
        let Some((label, rest)) = body.split_once(':') else { continue };
        let kind = match label.trim().to_lowercase().as_str() {
            "must-not" => RuleKind::MustNot,
            "must-have" | "must" => RuleKind::MustHave,
            _ => continue,
        };

        let pattern = rest.trim().trim_matches('"');
        rules.push(ValidatorRule {
            driver_block_id: block.id.clone(),
            kind,
            alternatives: expand_slash_pattern(pattern),
        });
    }

    rules
}

/// A rule that failed evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub driver_block_id: String,
    pub kind: RuleKind,
    pub pattern: String,
}

/// Evaluate `text` (case-insensitive substring match) against `rules`,
/// returning every violation found.
pub fn evaluate(text: &str, rules: &[ValidatorRule]) -> Vec<Violation> {
    let lower = text.to_lowercase();
    let mut violations = Vec::new();

    for rule in rules {
        let any_present = rule
            .alternatives
            .iter()
            .any(|alt| lower.contains(&alt.to_lowercase()));

        let violated = match rule.kind {
            RuleKind::MustNot => any_present,
            RuleKind::MustHave => !any_present,
        };

        if violated {
            violations.push(Violation {
                driver_block_id: rule.driver_block_id.clone(),
                kind: rule.kind,
                pattern: rule.alternatives.join(" / "),
            });
        }
    }

    violations
}

/// Enforcement mode, mirroring `sol_config::EnforcementMode` without a
/// hard dependency on it (kept decoupled so this crate stays testable in
/// isolation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementMode {
    Strict,
    Warn,
    Off,
}

/// Result of applying an enforcement mode to a set of violations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LintOutcome {
    Pass,
    Warn(Vec<Violation>),
    Fail(Vec<Violation>),
}

/// Apply `mode` to `violations`.
pub fn enforce(mode: EnforcementMode, violations: Vec<Violation>) -> LintOutcome {
    if violations.is_empty() {
        return LintOutcome::Pass;
    }
    match mode {
        EnforcementMode::Off => LintOutcome::Pass,
        EnforcementMode::Warn => LintOutcome::Warn(violations),
        EnforcementMode::Strict => LintOutcome::Fail(violations),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(definition: &str) -> DriverBlock {
        DriverBlock { id: "db-1".into(), title: None, definition: definition.to_string() }
    }

    #[test]
    fn parses_must_not_and_must_have() {
        let b = block("Validators:\n- Must-not: \"guarantee\"\n- Must-have: \"disclaimer\"\n");
        let rules = parse_validators(&b);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].kind, RuleKind::MustNot);
        assert_eq!(rules[1].kind, RuleKind::MustHave);
    }

    #[test]
    fn must_is_treated_as_must_have() {
        let b = block("Validators:\n- Must: \"disclaimer\"\n");
        let rules = parse_validators(&b);
        assert_eq!(rules[0].kind, RuleKind::MustHave);
    }

    #[test]
    fn slash_expansion_with_shared_prefix() {
        let expanded = expand_slash_pattern("cannot help you / will not assist");
        assert_eq!(expanded, vec!["cannot help you", "cannot will not assist"]);
    }

    #[test]
    fn slash_expansion_without_space_in_first_segment() {
        let expanded = expand_slash_pattern("yes/no");
        assert_eq!(expanded, vec!["yes", "no"]);
    }

    #[test]
    fn evaluate_flags_must_not_violation() {
        let b = block("Validators:\n- Must-not: \"guaranteed results\"\n");
        let rules = parse_validators(&b);
        let violations = evaluate("We offer GUARANTEED RESULTS today.", &rules);
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn evaluate_must_have_any_passes_with_one_alternative_present() {
        let b = block("Validators:\n- Must-have: \"consult a professional / see a doctor\"\n");
        let rules = parse_validators(&b);
        let violations = evaluate("Please consult a professional before deciding.", &rules);
        assert!(violations.is_empty());
    }

    #[test]
    fn enforce_strict_fails_on_violation() {
        let v = vec![Violation { driver_block_id: "db-1".into(), kind: RuleKind::MustNot, pattern: "x".into() }];
        assert_eq!(enforce(EnforcementMode::Strict, v.clone()), LintOutcome::Fail(v.clone()));
        assert_eq!(enforce(EnforcementMode::Off, v), LintOutcome::Pass);
    }
}
