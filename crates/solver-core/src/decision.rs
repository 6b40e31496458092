use serde::{Deserialize, Serialize};

use crate::types::{FixCandidate, ResolutionRecord, ResolutionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyHandled,
    NoMatchingPattern,
    BelowApplyThreshold,
    RetryLimitReached,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyHandled => "already handled",
            Self::NoMatchingPattern => "no matching pattern",
            Self::BelowApplyThreshold => "confidence below apply threshold",
            Self::RetryLimitReached => "retry limit reached",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision", content = "reason")]
pub enum Decision {
    Skip(SkipReason),
    ApplyOnly,
    ApplyAndResolve,
}

impl Decision {
    /// Skip < ApplyOnly < ApplyAndResolve.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Skip(_) => 0,
            Self::ApplyOnly => 1,
            Self::ApplyAndResolve => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionPolicy {
    pub apply_threshold: f64,
    pub resolve_threshold: f64,
    /// APPLY_FAILED transitions tolerated before an issue is given up on.
    pub max_apply_attempts: u32,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            apply_threshold: 0.60,
            resolve_threshold: 0.80,
            max_apply_attempts: 3,
        }
    }
}

impl DecisionPolicy {
    /// Thresholds clamped to [0,1], resolve never below apply.
    pub fn new(apply_threshold: f64, resolve_threshold: f64, max_apply_attempts: u32) -> Self {
        let apply = if apply_threshold.is_nan() {
            0.60
        } else {
            apply_threshold.clamp(0.0, 1.0)
        };
        let resolve = if resolve_threshold.is_nan() {
            0.80
        } else {
            resolve_threshold.clamp(0.0, 1.0)
        };
        Self {
            apply_threshold: apply,
            resolve_threshold: resolve.max(apply),
            max_apply_attempts,
        }
    }

    pub fn decide(
        &self,
        prior: Option<&ResolutionRecord>,
        candidate: Option<&FixCandidate>,
    ) -> Decision {
        if let Some(record) = prior {
            if record.state.is_handled() {
                return Decision::Skip(SkipReason::AlreadyHandled);
            }
            if record.state == ResolutionState::Skipped
                || record.attempts >= self.max_apply_attempts
            {
                return Decision::Skip(SkipReason::RetryLimitReached);
            }
        }
        let Some(candidate) = candidate else {
            return Decision::Skip(SkipReason::NoMatchingPattern);
        };
        if candidate.confidence.is_nan() || candidate.confidence < self.apply_threshold {
            Decision::Skip(SkipReason::BelowApplyThreshold)
        } else if candidate.confidence >= self.resolve_threshold {
            Decision::ApplyAndResolve
        } else {
            Decision::ApplyOnly
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Issue, IssueStatus, MatchSpecificity, Severity};
    use chrono::Utc;

    fn issue() -> Issue {
        Issue {
            id: "9".into(),
            project: "web".into(),
            title: "KeyError: 'a'".into(),
            exception: "KeyError".into(),
            message: "'a'".into(),
            culprit: String::new(),
            permalink: String::new(),
            level: Severity::Error,
            status: IssueStatus::Unresolved,
            count: 3,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            environment: None,
            frame: None,
            stack_trace: None,
        }
    }

    fn candidate(confidence: f64) -> FixCandidate {
        FixCandidate {
            issue_id: "9".into(),
            pattern_id: "py-key-error".into(),
            file: "src/a.py".into(),
            line: 1,
            original: "d['a']".into(),
            replacement: "d.get('a')".into(),
            explanation: String::new(),
            specificity: MatchSpecificity::Pattern,
            confidence,
        }
    }

    #[test]
    fn three_outcomes() {
        let p = DecisionPolicy::default();
        assert_eq!(
            p.decide(None, Some(&candidate(0.59))),
            Decision::Skip(SkipReason::BelowApplyThreshold)
        );
        assert_eq!(p.decide(None, Some(&candidate(0.60))), Decision::ApplyOnly);
        assert_eq!(p.decide(None, Some(&candidate(0.79))), Decision::ApplyOnly);
        assert_eq!(p.decide(None, Some(&candidate(0.80))), Decision::ApplyAndResolve);
        assert_eq!(
            p.decide(None, None),
            Decision::Skip(SkipReason::NoMatchingPattern)
        );
    }

    #[test]
    fn handled_records_always_skip() {
        let p = DecisionPolicy::default();
        for state in [ResolutionState::Applied, ResolutionState::Resolved] {
            let mut record = ResolutionRecord::new(&issue());
            record.state = state;
            for c in [0.0, 0.65, 1.0] {
                assert_eq!(
                    p.decide(Some(&record), Some(&candidate(c))),
                    Decision::Skip(SkipReason::AlreadyHandled)
                );
            }
        }
    }

    #[test]
    fn higher_confidence_never_decides_lower() {
        let p = DecisionPolicy::default();
        let mut prev = 0;
        for i in 0..=100 {
            let rank = p.decide(None, Some(&candidate(f64::from(i) / 100.0))).rank();
            assert!(rank >= prev, "decision dropped at {i}");
            prev = rank;
        }
    }

    #[test]
    fn retry_limit_applies_to_failed_records() {
        let p = DecisionPolicy::default();
        let mut record = ResolutionRecord::new(&issue());
        record.state = ResolutionState::ApplyFailed;
        record.attempts = 2;
        assert_eq!(p.decide(Some(&record), Some(&candidate(0.9))), Decision::ApplyAndResolve);
        record.attempts = 3;
        assert_eq!(
            p.decide(Some(&record), Some(&candidate(0.9))),
            Decision::Skip(SkipReason::RetryLimitReached)
        );
    }

    #[test]
    fn thresholds_are_sanitized() {
        let p = DecisionPolicy::new(0.9, 0.5, 3);
        assert_eq!(p.resolve_threshold, 0.9);
        let p = DecisionPolicy::new(-1.0, 7.0, 3);
        assert_eq!(p.apply_threshold, 0.0);
        assert_eq!(p.resolve_threshold, 1.0);
    }
}
