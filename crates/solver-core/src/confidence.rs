use serde::{Deserialize, Serialize};

use crate::types::MatchSpecificity;

/// Tunable coefficients for turning a pattern's base weight into a final score.
///
/// `confidence = clamp(base + occurrence_bonus + specificity_bonus - age_penalty, 0, 1)`.
/// Every term is monotone: more occurrences never lower the score, older
/// issues never score higher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidencePolicy {
    /// Bonus per doubling of the occurrence count.
    pub occurrence_weight: f64,
    pub occurrence_cap: f64,
    pub exact_bonus: f64,
    pub pattern_bonus: f64,
    pub substring_bonus: f64,
    /// Issues first seen longer ago than this start losing confidence.
    pub max_age_days: i64,
    pub age_penalty_per_day: f64,
    pub age_penalty_cap: f64,
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self {
            occurrence_weight: 0.05,
            occurrence_cap: 0.15,
            exact_bonus: 0.04,
            pattern_bonus: 0.02,
            substring_bonus: 0.01,
            max_age_days: 30,
            age_penalty_per_day: 0.01,
            age_penalty_cap: 0.30,
        }
    }
}

impl ConfidencePolicy {
    pub fn occurrence_bonus(&self, count: u64) -> f64 {
        let n = count.max(1) as f64;
        (self.occurrence_weight * n.log2()).clamp(0.0, self.occurrence_cap)
    }

    pub fn specificity_bonus(&self, specificity: MatchSpecificity) -> f64 {
        match specificity {
            MatchSpecificity::Exact => self.exact_bonus,
            MatchSpecificity::Pattern => self.pattern_bonus,
            MatchSpecificity::Substring => self.substring_bonus,
            MatchSpecificity::Category => 0.0,
        }
    }

    pub fn age_penalty(&self, age_days: i64) -> f64 {
        let over = age_days.saturating_sub(self.max_age_days);
        if over <= 0 {
            return 0.0;
        }
        (over as f64 * self.age_penalty_per_day).min(self.age_penalty_cap)
    }

    pub fn score(
        &self,
        base_weight: f64,
        count: u64,
        specificity: MatchSpecificity,
        age_days: i64,
    ) -> f64 {
        let raw = base_weight + self.occurrence_bonus(count) + self.specificity_bonus(specificity)
            - self.age_penalty(age_days);
        if raw.is_nan() {
            return 0.0;
        }
        raw.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_occurrence_adds_nothing() {
        let p = ConfidencePolicy::default();
        assert_eq!(p.occurrence_bonus(0), 0.0);
        assert_eq!(p.occurrence_bonus(1), 0.0);
    }

    #[test]
    fn occurrences_never_lower_confidence() {
        let p = ConfidencePolicy::default();
        let mut prev = 0.0;
        for n in [1u64, 2, 3, 5, 8, 15, 100, 10_000] {
            let s = p.score(0.6, n, MatchSpecificity::Substring, 3);
            assert!(s >= prev, "score dropped at n={n}");
            prev = s;
        }
    }

    #[test]
    fn older_issues_never_score_higher() {
        let p = ConfidencePolicy::default();
        let mut prev = 1.0;
        for age in [0i64, 10, 30, 31, 45, 90, 365, 5000] {
            let s = p.score(0.8, 4, MatchSpecificity::Exact, age);
            assert!(s <= prev, "score rose at age={age}");
            prev = s;
        }
    }

    #[test]
    fn exact_beats_substring() {
        let p = ConfidencePolicy::default();
        assert!(
            p.score(0.6, 3, MatchSpecificity::Exact, 0)
                > p.score(0.6, 3, MatchSpecificity::Substring, 0)
        );
    }

    #[test]
    fn clamped_to_unit_interval() {
        let p = ConfidencePolicy::default();
        assert_eq!(p.score(0.99, 1_000_000, MatchSpecificity::Exact, 0), 1.0);
        assert_eq!(p.score(0.05, 1, MatchSpecificity::Category, 10_000), 0.0);
    }

    #[test]
    fn frequent_issue_on_strong_pattern_clears_resolve_threshold() {
        let p = ConfidencePolicy::default();
        assert!(p.score(0.70, 15, MatchSpecificity::Substring, 2) >= 0.80);
    }

    #[test]
    fn rare_issue_on_weak_pattern_stays_below_apply_threshold() {
        let p = ConfidencePolicy::default();
        assert!(p.score(0.55, 1, MatchSpecificity::Exact, 0) < 0.60);
    }
}
