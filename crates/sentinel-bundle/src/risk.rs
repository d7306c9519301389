//! Compile-time risk scoring.
//!
//! A new bundle is scored against the project's previous compiled source:
//! security-sensitive block changes are high risk, topology churn is medium,
//! anything else is low. Reasons are returned as stable machine-readable
//! tags so operators can alert on them.

use std::collections::BTreeSet;

use sentinel_types::{RiskLevel, RiskReason};

/// Declarations whose change makes a bundle high-risk.
const HIGH_RISK_BLOCKS: &[&str] = &["auth", "authentication", "authorization"];
/// Route-count churn beyond this is medium risk.
const ROUTE_CHURN_THRESHOLD: i64 = 10;

/// Score `new` against the previous compiled source, if any. With no
/// baseline there is nothing to compare, so the first compile is low risk.
pub fn score(new: &str, previous: Option<&str>) -> (RiskLevel, Vec<RiskReason>) {
    let Some(previous) = previous else {
        return (RiskLevel::Low, Vec::new());
    };

    let mut reasons = BTreeSet::new();

    for block in HIGH_RISK_BLOCKS {
        if blocks_of(previous, block) != blocks_of(new, block) {
            reasons.insert(RiskReason::AuthBlockChanged);
        }
    }
    if blocks_of(previous, "tls") != blocks_of(new, "tls") {
        reasons.insert(RiskReason::TlsBlockChanged);
    }

    let route_delta =
        declaration_names(new, "route").len() as i64 - declaration_names(previous, "route").len() as i64;
    if route_delta.abs() > ROUTE_CHURN_THRESHOLD {
        reasons.insert(RiskReason::RouteChurn);
    }

    let old_upstreams = declaration_names(previous, "upstream");
    let new_upstreams = declaration_names(new, "upstream");
    if old_upstreams.difference(&new_upstreams).next().is_some() {
        reasons.insert(RiskReason::UpstreamRemoved);
    }

    if blocks_of(previous, "rate_limit") != blocks_of(new, "rate_limit") {
        reasons.insert(RiskReason::RateLimitChanged);
    }

    let level = if reasons
        .iter()
        .any(|r| matches!(r, RiskReason::AuthBlockChanged | RiskReason::TlsBlockChanged))
    {
        RiskLevel::High
    } else if reasons.is_empty() {
        RiskLevel::Low
    } else {
        RiskLevel::Medium
    };
    (level, reasons.into_iter().collect())
}

/// Names of top-level declarations of `kind`, e.g. `route "api"`.
pub fn declaration_names(source: &str, kind: &str) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let mut depth = 0usize;
    for line in source.lines() {
        let trimmed = line.trim_start();
        if depth == 0
            && let Some(rest) = trimmed.strip_prefix(kind)
            && let Some(name) = quoted_name(rest)
        {
            names.insert(name);
        }
        depth = depth
            .saturating_add(line.matches('{').count())
            .saturating_sub(line.matches('}').count());
    }
    names
}

/// Full text of each top-level block named `kind`, used for change detection.
fn blocks_of(source: &str, kind: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;
    let mut depth = 0usize;
    for line in source.lines() {
        let trimmed = line.trim_start();
        if depth == 0 && current.is_none() && is_declaration(trimmed, kind) {
            current = Some(String::new());
        }
        if let Some(block) = current.as_mut() {
            block.push_str(trimmed);
            block.push('\n');
        }
        let opens = line.matches('{').count();
        let closes = line.matches('}').count();
        depth = depth.saturating_add(opens).saturating_sub(closes);
        if depth == 0
            && current.is_some()
            && (closes > 0 || !line.contains('{'))
        {
            blocks.push(current.take().unwrap_or_default());
        }
    }
    if let Some(block) = current {
        blocks.push(block);
    }
    blocks
}

fn is_declaration(trimmed: &str, kind: &str) -> bool {
    trimmed
        .strip_prefix(kind)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with([' ', '\t', '{', '"']))
}

fn quoted_name(rest: &str) -> Option<String> {
    let after = rest.trim_start();
    let inner = after.strip_prefix('"')?;
    inner.split('"').next().map(|s| s.to_string())
}
