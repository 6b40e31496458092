//! Per-issue lifecycle: analyze, decide, apply, resolve, record.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::analyzer::Analyzer;
use crate::db::Db;
use crate::decision::{Decision, DecisionPolicy, SkipReason};
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::tracker::IssueTracker;
use crate::types::{Issue, ResolutionRecord, ResolutionState};

/// What happened to one issue in a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum IssueOutcome {
    Skipped { reason: SkipReason },
    /// Fix committed. `resolve_error` is set when the upstream resolve was
    /// attempted and failed.
    Applied {
        branch: String,
        resolve_error: Option<String>,
    },
    Resolved { branch: String },
    Failed { error: String },
    /// The working copy was locked by another run; nothing was recorded.
    Busy,
}

pub struct Resolver {
    pub db: Arc<Db>,
    pub tracker: Arc<dyn IssueTracker>,
    pub analyzer: Analyzer,
    pub policy: DecisionPolicy,
    pub orchestrator: Orchestrator,
}

impl Resolver {
    /// Process one issue end to end. `Err` only for store failures.
    pub async fn process_issue(&self, issue: &Issue, now: DateTime<Utc>) -> Result<IssueOutcome> {
        let prior = self.db.get_record(&issue.project, &issue.id)?;
        let candidate = self.analyzer.analyze(issue, now);
        let decision = self.policy.decide(prior.as_ref(), candidate.as_ref());
        debug!("issue {}: decision {decision:?}", issue.id);

        let mut record = prior.unwrap_or_else(|| ResolutionRecord::new(issue));
        record.title = issue.title.clone();
        record.level = issue.level.as_str().to_string();
        record.occurrences = issue.count;

        let candidate = match (decision, candidate) {
            (Decision::Skip(SkipReason::AlreadyHandled), _) => {
                return Ok(IssueOutcome::Skipped {
                    reason: SkipReason::AlreadyHandled,
                });
            }
            (Decision::Skip(SkipReason::RetryLimitReached), _) => {
                if record.state != ResolutionState::Skipped {
                    info!(
                        "issue {}: giving up after {} failed attempts",
                        issue.id, record.attempts
                    );
                    record.advance(ResolutionState::Skipped);
                    self.db.upsert_record(&record)?;
                }
                return Ok(IssueOutcome::Skipped {
                    reason: SkipReason::RetryLimitReached,
                });
            }
            (Decision::Skip(reason), candidate) => {
                record.confidence = candidate.as_ref().map(|c| c.confidence);
                record.pattern_id = candidate.map(|c| c.pattern_id);
                record.analyzed_at = Some(now);
                record.advance(ResolutionState::Analyzed);
                self.db.upsert_record(&record)?;
                debug!("issue {}: skipped ({})", issue.id, reason.as_str());
                return Ok(IssueOutcome::Skipped { reason });
            }
            (_, Some(candidate)) => candidate,
            (_, None) => {
                return Ok(IssueOutcome::Skipped {
                    reason: SkipReason::NoMatchingPattern,
                })
            }
        };

        record.confidence = Some(candidate.confidence);
        record.pattern_id = Some(candidate.pattern_id.clone());
        record.analyzed_at = Some(now);
        info!(
            "issue {}: applying {} (confidence {:.2}, {:?})",
            issue.id, candidate.pattern_id, candidate.confidence, decision
        );

        let (branch, commit) = match self.orchestrator.apply_fix(issue, &candidate).await {
            Ok(applied) => {
                record.last_error = applied
                    .push_error
                    .as_ref()
                    .map(|e| format!("push failed: {e}"));
                self.db.insert_fix(&issue.project, &candidate, &applied)?;
                (applied.branch, applied.commit)
            }
            Err(OrchestratorError::AlreadyApplied { branch, commit }) => {
                warn!(
                    "issue {}: fix already on {branch} but not recorded, adopting it",
                    issue.id
                );
                (branch, commit)
            }
            Err(OrchestratorError::Busy) => return Ok(IssueOutcome::Busy),
            Err(e) => {
                warn!("issue {}: apply failed: {e}", issue.id);
                record.advance(ResolutionState::Analyzed);
                record.attempts += 1;
                record.last_error = Some(e.to_string());
                record.advance(ResolutionState::ApplyFailed);
                self.db.upsert_record(&record)?;
                return Ok(IssueOutcome::Failed {
                    error: e.to_string(),
                });
            }
        };

        record.advance(ResolutionState::Applied);
        record.branch = Some(branch.clone());
        record.commit_hash = Some(commit);
        record.applied_at = Some(Utc::now());
        self.db.upsert_record(&record)?;

        if decision != Decision::ApplyAndResolve {
            return Ok(IssueOutcome::Applied {
                branch,
                resolve_error: None,
            });
        }

        match self.tracker.mark_resolved(&issue.id).await {
            Ok(()) => {
                record.advance(ResolutionState::Resolved);
                record.resolved_at = Some(Utc::now());
                self.db.upsert_record(&record)?;
                info!("issue {}: marked resolved upstream", issue.id);
                Ok(IssueOutcome::Resolved { branch })
            }
            Err(e) => {
                warn!(
                    "issue {}: discrepancy, fix committed on {branch} but resolve failed: {e}",
                    issue.id
                );
                record.last_error = Some(format!("resolve failed: {e}"));
                self.db.upsert_record(&record)?;
                Ok(IssueOutcome::Applied {
                    branch,
                    resolve_error: Some(e.to_string()),
                })
            }
        }
    }
}
