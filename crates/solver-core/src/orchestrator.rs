//! Applying a fix candidate to the shared working copy as a branch + commit.
//!
//! Every apply runs under a per-(project, work directory) lock for its whole
//! sequence and always returns the working copy to its base branch with no
//! uncommitted changes, whatever the outcome.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;
use crate::git::Git;
use crate::naming::{self, BranchNaming, CommitStyle};
use crate::patch;
use crate::safety::SafetyPolicy;
use crate::stacktrace::relative_candidates;
use crate::types::{AppliedFix, FixCandidate, Issue};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Another apply holds the working copy past the wait timeout.
    #[error("working copy is busy")]
    Busy,

    #[error("working copy is not clean: {0}")]
    DirtyWorkingCopy(String),

    #[error("{file}:{line} no longer contains the code the fix expects")]
    StaleTarget { file: String, line: u32 },

    #[error("file not found in working copy: {0}")]
    TargetNotFound(String),

    #[error("refusing to modify {0}")]
    UnsafeTarget(String),

    /// A fix branch for this issue is already in the working copy.
    #[error("fix already committed on {branch}")]
    AlreadyApplied { branch: String, commit: String },

    #[error("git: {0}")]
    Git(String),
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(e: anyhow::Error) -> Self {
        Self::Git(format!("{e:#}"))
    }
}

/// Registry of working-copy locks, shared by every orchestrator in the process.
#[derive(Clone, Default)]
pub struct WorkingCopyLocks {
    inner: Arc<Mutex<HashMap<(String, PathBuf), Arc<tokio::sync::Mutex<()>>>>>,
}

impl WorkingCopyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, project: &str, work_dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let key = (
            project.to_string(),
            std::fs::canonicalize(work_dir).unwrap_or_else(|_| work_dir.to_path_buf()),
        );
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key).or_default().clone()
    }
}

#[derive(Debug, Clone)]
pub struct GitSettings {
    pub base_branch: String,
    pub remote: String,
    pub pull_before_fix: bool,
    pub auto_push: bool,
    pub author_name: String,
    pub author_email: String,
    pub branch: BranchNaming,
    pub commit: CommitStyle,
}

impl GitSettings {
    pub fn from_config(c: &Config) -> Self {
        Self {
            base_branch: c.git_default_branch.clone(),
            remote: c.git_remote.clone(),
            pull_before_fix: c.git_pull_before_fix,
            auto_push: c.git_auto_push,
            author_name: c.git_author_name.clone(),
            author_email: c.git_author_email.clone(),
            branch: c.branch_naming(),
            commit: c.commit_style(),
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    project: String,
    work_dir: PathBuf,
    settings: GitSettings,
    safety: SafetyPolicy,
    locks: WorkingCopyLocks,
    lock_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        project: &str,
        work_dir: impl Into<PathBuf>,
        settings: GitSettings,
        safety: SafetyPolicy,
        locks: WorkingCopyLocks,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            project: project.to_string(),
            work_dir: work_dir.into(),
            settings,
            safety,
            locks,
            lock_timeout,
        }
    }

    pub fn from_config(project: &str, c: &Config, locks: WorkingCopyLocks) -> Self {
        Self::new(
            project,
            &c.work_directory,
            GitSettings::from_config(c),
            c.safety_policy(),
            locks,
            Duration::from_secs(c.lock_timeout_s),
        )
    }

    pub async fn apply_fix(
        &self,
        issue: &Issue,
        candidate: &FixCandidate,
    ) -> Result<AppliedFix, OrchestratorError> {
        let lock = self.locks.lock_for(&self.project, &self.work_dir);
        let guard = tokio::time::timeout(self.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                warn!(
                    "issue {}: working copy {} busy after {:?}",
                    issue.id,
                    self.work_dir.display(),
                    self.lock_timeout
                );
                OrchestratorError::Busy
            })?;

        let this = self.clone();
        let issue = issue.clone();
        let candidate = candidate.clone();
        let now = Utc::now();
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            this.apply_locked(&issue, &candidate, now)
        })
        .await
        .map_err(|e| OrchestratorError::Git(format!("apply task failed: {e}")))?
    }

    /// The whole sequence; caller holds the working-copy lock.
    fn apply_locked(
        &self,
        issue: &Issue,
        candidate: &FixCandidate,
        now: DateTime<Utc>,
    ) -> Result<AppliedFix, OrchestratorError> {
        let s = &self.settings;
        let git = Git::new(self.work_dir.to_string_lossy())
            .with_author(&s.author_name, &s.author_email);

        if !git.is_repo() {
            return Err(OrchestratorError::Git(format!(
                "{} is not a git working copy",
                self.work_dir.display()
            )));
        }
        if !git.status_clean()? {
            return Err(OrchestratorError::DirtyWorkingCopy(
                "uncommitted changes present".into(),
            ));
        }
        let current = git.current_branch()?;
        if current != s.base_branch {
            return Err(OrchestratorError::DirtyWorkingCopy(format!(
                "on branch {current}, expected {}",
                s.base_branch
            )));
        }
        if let Some(globs) = s.branch.issue_branch_globs(issue) {
            let globs: Vec<&str> = globs.iter().map(String::as_str).collect();
            if let Some(branch) = git.list_branches(&globs)?.pop() {
                let commit = git.rev_parse(&branch)?;
                info!("issue {}: found existing fix branch {branch}", issue.id);
                return Err(OrchestratorError::AlreadyApplied { branch, commit });
            }
        }
        if s.pull_before_fix {
            git.pull_ff_only(&s.remote, &s.base_branch)?;
        }

        let (rel, abs) = self.resolve_target(&candidate.file)?;
        let content = std::fs::read_to_string(&abs)
            .map_err(|e| OrchestratorError::TargetNotFound(format!("{rel}: {e}")))?;
        let patched = patch::apply_edit(
            &content,
            &candidate.original,
            &candidate.replacement,
            candidate.line,
        )
        .ok_or_else(|| OrchestratorError::StaleTarget {
            file: rel.clone(),
            line: candidate.line,
        })?;

        let branch = s.branch.branch_name(issue, now);
        if git.branch_exists(&branch)? {
            return Err(OrchestratorError::Git(format!("branch {branch} already exists")));
        }
        git.create_branch(&branch)?;
        info!("issue {}: created branch {branch}", issue.id);

        let committed = (|| -> Result<String, OrchestratorError> {
            std::fs::write(&abs, &patched)
                .map_err(|e| OrchestratorError::Git(format!("writing {rel}: {e}")))?;
            git.add(&rel)?;
            let message = s.commit.message(issue, candidate, &rel);
            if !git.commit(&message)? {
                return Err(OrchestratorError::Git("edit produced no change".into()));
            }
            Ok(git.rev_parse("HEAD")?)
        })();

        let commit = match committed {
            Ok(commit) => commit,
            Err(e) => {
                self.rollback(&git, &branch);
                return Err(e);
            }
        };
        info!("issue {}: committed {commit} on {branch}", issue.id);

        let mut pushed = false;
        let mut push_error = None;
        if s.auto_push {
            match git.push_branch(&s.remote, &branch) {
                Ok(()) => {
                    pushed = true;
                    info!("issue {}: pushed {branch} to {}", issue.id, s.remote);
                }
                Err(e) => {
                    warn!("issue {}: push of {branch} failed, fix kept locally: {e:#}", issue.id);
                    push_error = Some(format!("{e:#}"));
                }
            }
        }

        if let Err(e) = git.checkout(&s.base_branch) {
            warn!("issue {}: could not return to {}: {e:#}", issue.id, s.base_branch);
            git.reset_hard("HEAD")?;
            git.checkout(&s.base_branch)?;
        }

        let (pr_title, pr_body) = naming::pull_request(issue, candidate, &rel, &branch);
        info!("issue {}: pull request ready: {pr_title}", issue.id);
        Ok(AppliedFix {
            branch,
            commit,
            file: rel,
            pushed,
            push_error,
            pr_title,
            pr_body,
        })
    }

    /// Drop a half-built fix branch and go back to the base branch.
    fn rollback(&self, git: &Git, branch: &str) {
        if let Err(e) = git.reset_hard("HEAD") {
            warn!("rollback: reset failed: {e:#}");
        }
        if let Err(e) = git.checkout(&self.settings.base_branch) {
            warn!("rollback: checkout {} failed: {e:#}", self.settings.base_branch);
        }
        if let Err(e) = git.delete_branch(branch) {
            warn!("rollback: deleting {branch} failed: {e:#}");
        }
    }

    /// Map a reported path onto an existing file inside the working copy.
    fn resolve_target(&self, reported: &str) -> Result<(String, PathBuf), OrchestratorError> {
        let root = std::fs::canonicalize(&self.work_dir).map_err(|e| {
            OrchestratorError::Git(format!("work directory {}: {e}", self.work_dir.display()))
        })?;

        let mut candidates = Vec::new();
        if let Ok(inside) = Path::new(reported).strip_prefix(&root) {
            candidates.push(inside.to_string_lossy().into_owned());
        }
        candidates.extend(relative_candidates(reported));

        for rel in candidates {
            if rel.split('/').any(|part| part == "..") {
                return Err(OrchestratorError::UnsafeTarget(format!(
                    "{reported} escapes the working copy"
                )));
            }
            let abs = root.join(&rel);
            if !abs.is_file() {
                continue;
            }
            let canonical = std::fs::canonicalize(&abs)
                .map_err(|e| OrchestratorError::TargetNotFound(format!("{rel}: {e}")))?;
            if !canonical.starts_with(&root) {
                return Err(OrchestratorError::UnsafeTarget(format!(
                    "{reported} escapes the working copy"
                )));
            }
            self.safety
                .check_target(&rel)
                .map_err(OrchestratorError::UnsafeTarget)?;
            return Ok((rel, canonical));
        }
        Err(OrchestratorError::TargetNotFound(reported.to_string()))
    }
}
