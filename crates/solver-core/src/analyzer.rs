use anyhow::Result;
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, warn};

use crate::confidence::ConfidencePolicy;
use crate::patterns::{fill, FixPattern, MatchOutcome, PatternRegistry};
use crate::safety::SafetyPolicy;
use crate::types::{FixCandidate, Issue, StackFrame};

/// Turns an issue into at most one scored, concrete fix candidate.
///
/// Pure over its inputs: the registry, the policies and `now`.
#[derive(Debug, Clone)]
pub struct Analyzer {
    registry: PatternRegistry,
    policy: ConfidencePolicy,
    safety: SafetyPolicy,
}

impl Analyzer {
    pub fn new(registry: PatternRegistry, policy: ConfidencePolicy, safety: SafetyPolicy) -> Self {
        Self {
            registry,
            policy,
            safety,
        }
    }

    pub fn builtin(safety: SafetyPolicy) -> Result<Self> {
        Ok(Self::new(
            PatternRegistry::builtin()?,
            ConfidencePolicy::default(),
            safety,
        ))
    }

    pub fn analyze(&self, issue: &Issue, now: DateTime<Utc>) -> Option<FixCandidate> {
        let (pattern, outcome) = self.registry.find(issue)?;
        let Some(frame) = issue.location() else {
            debug!("issue {} matched {} but has no stack frame", issue.id, pattern.id);
            return None;
        };
        let Some((original, replacement)) = synthesize(pattern, &outcome, &frame) else {
            debug!(
                "issue {}: pattern {} matched but found nothing to edit at {}:{}",
                issue.id, pattern.id, frame.file, frame.line
            );
            return None;
        };

        let confidence = self.policy.score(
            pattern.base_weight,
            issue.count,
            outcome.specificity,
            issue.age_days(now),
        );

        let candidate = FixCandidate {
            issue_id: issue.id.clone(),
            pattern_id: pattern.id.clone(),
            file: frame.file,
            line: frame.line,
            original,
            replacement,
            explanation: fill(&pattern.template.explanation, 'm', &outcome.captures, false),
            specificity: outcome.specificity,
            confidence,
        };

        if let Err(reason) = self.safety.check_candidate(&candidate) {
            warn!("issue {}: rejected fix from {}: {reason}", issue.id, pattern.id);
            return None;
        }
        Some(candidate)
    }
}

/// Locate the edit in the frame's source text. Returns `(original, replacement)`.
fn synthesize(
    pattern: &FixPattern,
    outcome: &MatchOutcome,
    frame: &StackFrame,
) -> Option<(String, String)> {
    let template = &pattern.template;
    let search = fill(&template.search, 'm', &outcome.captures, true);
    let re = match Regex::new(&search) {
        Ok(re) => re,
        Err(e) => {
            warn!("pattern {}: search template does not compile: {e}", pattern.id);
            return None;
        }
    };

    let source = match frame.context_line.as_deref() {
        Some(line) if !line.trim().is_empty() => line.to_string(),
        _ => fill(template.canonical.as_deref()?, 'm', &outcome.captures, false),
    };

    let caps = re.captures(&source)?;
    let original = caps.get(0)?.as_str().to_string();
    let groups: Vec<String> = caps
        .iter()
        .skip(1)
        .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
        .collect();

    let replacement = fill(
        &fill(&template.replacement, 'm', &outcome.captures, false),
        's',
        &groups,
        false,
    );
    if replacement == original {
        return None;
    }
    Some((original, replacement))
}
