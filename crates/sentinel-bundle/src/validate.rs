//! Compile-time validation.
//!
//! The control plane does not understand KDL semantics; that is the external
//! validator's job, reached through [`ConfigValidator`]. The built-in
//! [`RuleValidator`] applies the project's own validation rules. Any finding
//! with `error` severity fails the compile.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sentinel_store::Store;
use sentinel_types::{RuleKind, RuleSeverity, ValidationRule};

/// One rule's verdict against a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationFinding {
    pub rule: String,
    pub severity: RuleSeverity,
    pub message: String,
}

/// Everything the validator had to say about a source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub findings: Vec<ValidationFinding>,
}

impl ValidationReport {
    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(|f| f.severity == RuleSeverity::Error)
    }

    /// Human-readable rendering stored as `compiler_output`.
    pub fn render(&self) -> String {
        if self.findings.is_empty() {
            return "validation passed".to_string();
        }
        self.findings
            .iter()
            .map(|f| format!("[{:?}] {}: {}", f.severity, f.rule, f.message))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Seam to the external configuration validator.
#[async_trait]
pub trait ConfigValidator: Send + Sync {
    async fn validate(&self, project_id: Uuid, source: &str) -> Result<ValidationReport>;
}

/// Applies the project's stored [`ValidationRule`]s.
pub struct RuleValidator {
    store: Arc<dyn Store>,
}

impl RuleValidator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ConfigValidator for RuleValidator {
    async fn validate(&self, project_id: Uuid, source: &str) -> Result<ValidationReport> {
        let rules = self.store.list_validation_rules(project_id).await?;
        let mut report = ValidationReport::default();
        for rule in rules.iter().filter(|r| r.enabled) {
            if let Some(message) = apply_rule(rule, source)? {
                report.findings.push(ValidationFinding {
                    rule: rule.name.clone(),
                    severity: rule.severity,
                    message,
                });
            }
        }
        Ok(report)
    }
}

/// Returns a finding message when the rule is violated.
fn apply_rule(rule: &ValidationRule, source: &str) -> Result<Option<String>> {
    let violation = match &rule.kind {
        RuleKind::RequiredField { field } => {
            if has_top_level_declaration(source, field) {
                None
            } else {
                Some(format!("required declaration `{field}` is missing"))
            }
        }
        RuleKind::ForbiddenPattern { pattern } => {
            let re = Regex::new(pattern)?;
            re.find(source)
                .map(|m| format!("forbidden pattern matched: `{}`", m.as_str()))
        }
        RuleKind::AllowedPattern { applies_to, pattern } => {
            let scope = Regex::new(applies_to)?;
            let allowed = Regex::new(pattern)?;
            source
                .lines()
                .find(|line| scope.is_match(line) && !allowed.is_match(line))
                .map(|line| format!("line does not match allowed pattern: `{}`", line.trim()))
        }
        RuleKind::MaxSize { max_bytes } => {
            let size = source.len() as u64;
            (size > *max_bytes)
                .then(|| format!("source is {size} bytes, limit is {max_bytes}"))
        }
        RuleKind::JsonSchema { schema } => {
            // Schema validation here is structural: every declaration the
            // schema requires must be present in the source.
            let required = schema
                .get("required")
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten()
                .filter_map(|v| v.as_str());
            let mut missing: Vec<&str> = required
                .filter(|field| !has_top_level_declaration(source, field))
                .collect();
            missing.sort_unstable();
            (!missing.is_empty())
                .then(|| format!("schema requires declarations: {}", missing.join(", ")))
        }
    };
    Ok(violation)
}

fn has_top_level_declaration(source: &str, field: &str) -> bool {
    let mut depth = 0usize;
    for line in source.lines() {
        let trimmed = line.trim_start();
        if depth == 0
            && trimmed
                .strip_prefix(field)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with([' ', '\t', '{', '"']))
        {
            return true;
        }
        depth = depth
            .saturating_add(line.matches('{').count())
            .saturating_sub(line.matches('}').count());
    }
    false
}
