use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Issue, Severity};

/// Which unresolved issues are eligible to enter a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueFilter {
    /// `None` means all levels.
    pub min_severity: Option<Severity>,
    /// `None` means all environments.
    pub environments: Option<Vec<String>>,
    pub min_occurrences: u64,
    /// Issues not seen within this many days are ignored.
    pub max_age_days: Option<i64>,
}

impl IssueFilter {
    /// Severities at or above the minimum, lowest first.
    pub fn levels(&self) -> Vec<Severity> {
        match self.min_severity {
            Some(min) => Severity::ALL.into_iter().filter(|s| *s >= min).collect(),
            None => Vec::new(),
        }
    }

    pub fn accepts(&self, issue: &Issue, now: DateTime<Utc>) -> bool {
        if let Some(min) = self.min_severity {
            if issue.level < min {
                return false;
            }
        }
        if let Some(envs) = &self.environments {
            match &issue.environment {
                Some(env) if envs.iter().any(|e| e.eq_ignore_ascii_case(env)) => {}
                _ => return false,
            }
        }
        if issue.count < self.min_occurrences {
            return false;
        }
        if let Some(cutoff) = self.max_age_days.and_then(|days| {
            Duration::try_days(days).and_then(|age| now.checked_sub_signed(age))
        }) {
            if issue.last_seen < cutoff {
                return false;
            }
        }
        true
    }

    /// Accepted issues, most recently seen first, at most `max`.
    pub fn select(&self, issues: Vec<Issue>, now: DateTime<Utc>, max: usize) -> Vec<Issue> {
        let mut out: Vec<Issue> = issues.into_iter().filter(|i| self.accepts(i, now)).collect();
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        out.truncate(max);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IssueStatus;

    fn issue(id: &str, level: Severity, count: u64, env: Option<&str>, seen_days_ago: i64) -> Issue {
        let now = Utc::now();
        Issue {
            id: id.into(),
            project: "web".into(),
            title: id.into(),
            exception: "KeyError".into(),
            message: String::new(),
            culprit: String::new(),
            permalink: String::new(),
            level,
            status: IssueStatus::Unresolved,
            count,
            first_seen: now - Duration::days(seen_days_ago + 1),
            last_seen: now - Duration::days(seen_days_ago),
            environment: env.map(str::to_string),
            frame: None,
            stack_trace: None,
        }
    }

    #[test]
    fn min_occurrences_always_enforced() {
        for min in [0u64, 1, 2, 5, 10, 100] {
            let f = IssueFilter {
                min_occurrences: min,
                ..Default::default()
            };
            let issues: Vec<Issue> = (0..20u64)
                .map(|n| issue(&n.to_string(), Severity::Error, n, None, 0))
                .collect();
            let picked = f.select(issues, Utc::now(), usize::MAX);
            assert!(picked.iter().all(|i| i.count >= min));
        }
    }

    #[test]
    fn severity_and_environment() {
        let f = IssueFilter {
            min_severity: Some(Severity::Error),
            environments: Some(vec!["production".into()]),
            ..Default::default()
        };
        let now = Utc::now();
        assert!(f.accepts(&issue("a", Severity::Fatal, 1, Some("Production"), 0), now));
        assert!(!f.accepts(&issue("b", Severity::Warning, 1, Some("production"), 0), now));
        assert!(!f.accepts(&issue("c", Severity::Error, 1, Some("staging"), 0), now));
        assert!(!f.accepts(&issue("d", Severity::Error, 1, None, 0), now));
        assert_eq!(f.levels(), vec![Severity::Error, Severity::Fatal]);
    }

    #[test]
    fn stale_issues_dropped_and_recent_first() {
        let f = IssueFilter {
            max_age_days: Some(7),
            ..Default::default()
        };
        let picked = f.select(
            vec![
                issue("old", Severity::Error, 1, None, 30),
                issue("mid", Severity::Error, 1, None, 3),
                issue("new", Severity::Error, 1, None, 0),
            ],
            Utc::now(),
            5,
        );
        let ids: Vec<&str> = picked.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid"]);
    }

    #[test]
    fn huge_age_window_keeps_everything() {
        let f = IssueFilter {
            max_age_days: Some(200_000_000),
            ..Default::default()
        };
        let now = Utc::now();
        assert!(f.accepts(&issue("ancient", Severity::Error, 1, None, 10_000), now));
        let f = IssueFilter {
            max_age_days: Some(i64::MAX),
            ..Default::default()
        };
        assert!(f.accepts(&issue("any", Severity::Error, 1, None, 0), now));
    }

    #[test]
    fn batch_is_capped() {
        let issues = (0..10).map(|n| issue(&n.to_string(), Severity::Error, 1, None, n)).collect();
        let picked = IssueFilter::default().select(issues, Utc::now(), 3);
        let ids: Vec<&str> = picked.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
    }
}
