use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stacktrace;

// ── Issue ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Self::Debug,
        Self::Info,
        Self::Warning,
        Self::Error,
        Self::Fatal,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warning" | "warn" => Some(Self::Warning),
            "error" => Some(Self::Error),
            "fatal" | "critical" => Some(Self::Fatal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Php,
    Python,
    JavaScript,
    Java,
    Unknown,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Php => "php",
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::Java => "java",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStatus {
    Unresolved,
    Resolved,
}

/// The in-app stack frame an issue points at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    pub file: String,
    /// 1-based line number; 0 when unknown.
    pub line: u32,
    pub language: Language,
    /// Source text of `line` as captured by the tracker, when available.
    pub context_line: Option<String>,
}

/// An upstream error report as seen by this system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub project: String,
    pub title: String,
    /// Exception type or error category, e.g. `KeyError`.
    pub exception: String,
    pub message: String,
    pub culprit: String,
    pub permalink: String,
    pub level: Severity,
    pub status: IssueStatus,
    /// Occurrence count.
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub environment: Option<String>,
    pub frame: Option<StackFrame>,
    /// Raw stack trace text, used when no structured frame is available.
    pub stack_trace: Option<String>,
}

impl Issue {
    /// Structured frame if the tracker provided one, otherwise parsed from the raw trace.
    pub fn location(&self) -> Option<StackFrame> {
        if let Some(frame) = &self.frame {
            return Some(frame.clone());
        }
        self.stack_trace.as_deref().and_then(stacktrace::parse_frame)
    }

    pub fn language(&self) -> Language {
        match &self.frame {
            Some(f) if f.language != Language::Unknown => f.language,
            _ => stacktrace::detect_language(self.stack_trace.as_deref()),
        }
    }

    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.first_seen).num_days().max(0)
    }
}

// ── Fix candidate ────────────────────────────────────────────────────────

/// How precisely a pattern's message matcher accepted an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSpecificity {
    /// Only the exception/category matched.
    Category,
    Substring,
    Pattern,
    Exact,
}

/// A scored, concrete source edit proposed for one issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixCandidate {
    pub issue_id: String,
    pub pattern_id: String,
    /// File as reported by the tracker; resolved against the working copy when applied.
    pub file: String,
    pub line: u32,
    /// Exact text the edit replaces; verified against the file before applying.
    pub original: String,
    pub replacement: String,
    pub explanation: String,
    pub specificity: MatchSpecificity,
    pub confidence: f64,
}

// ── Resolution record ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionState {
    New,
    Analyzed,
    ApplyFailed,
    Skipped,
    Applied,
    Resolved,
}

impl ResolutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Analyzed => "ANALYZED",
            Self::ApplyFailed => "APPLY_FAILED",
            Self::Skipped => "SKIPPED",
            Self::Applied => "APPLIED",
            Self::Resolved => "RESOLVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(Self::New),
            "ANALYZED" => Some(Self::Analyzed),
            "APPLY_FAILED" => Some(Self::ApplyFailed),
            "SKIPPED" => Some(Self::Skipped),
            "APPLIED" => Some(Self::Applied),
            "RESOLVED" => Some(Self::Resolved),
            _ => None,
        }
    }

    /// A fix exists for the issue; it must never be applied again.
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Applied | Self::Resolved)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::New => 0,
            Self::Analyzed => 1,
            Self::ApplyFailed => 2,
            Self::Skipped => 3,
            Self::Applied => 4,
            Self::Resolved => 5,
        }
    }

    /// States only move forward; re-entering the current state is allowed.
    pub fn can_transition_to(&self, next: ResolutionState) -> bool {
        match self {
            Self::Skipped | Self::Resolved => *self == next,
            _ => next.rank() >= self.rank(),
        }
    }
}

/// Persistent per-(project, issue) progress row; the sole source of idempotency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionRecord {
    pub project: String,
    pub issue_id: String,
    pub state: ResolutionState,
    pub confidence: Option<f64>,
    pub pattern_id: Option<String>,
    pub branch: Option<String>,
    pub commit_hash: Option<String>,
    /// Number of APPLY_FAILED transitions so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub title: String,
    pub level: String,
    pub occurrences: u64,
    pub analyzed_at: Option<DateTime<Utc>>,
    pub applied_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResolutionRecord {
    pub fn new(issue: &Issue) -> Self {
        let now = Utc::now();
        Self {
            project: issue.project.clone(),
            issue_id: issue.id.clone(),
            state: ResolutionState::New,
            confidence: None,
            pattern_id: None,
            branch: None,
            commit_hash: None,
            attempts: 0,
            last_error: None,
            title: issue.title.clone(),
            level: issue.level.as_str().to_string(),
            occurrences: issue.count,
            analyzed_at: None,
            applied_at: None,
            resolved_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next` if that does not regress the lifecycle. Returns whether it moved.
    pub fn advance(&mut self, next: ResolutionState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        self.updated_at = Utc::now();
        true
    }
}

/// One applied fix as stored for the dashboard's detail view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixRow {
    pub id: i64,
    pub project: String,
    pub issue_id: String,
    pub pattern_id: String,
    pub file_path: String,
    pub line_number: u32,
    pub original_code: String,
    pub fixed_code: String,
    pub explanation: String,
    pub confidence: f64,
    pub branch: String,
    pub commit_hash: String,
    pub pr_title: String,
    /// Markdown description for the pull request proposing this fix.
    pub pr_body: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a successful apply.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedFix {
    pub branch: String,
    pub commit: String,
    /// Repository-relative path that was edited.
    pub file: String,
    pub pushed: bool,
    /// Set when the push failed; the commit still exists locally.
    pub push_error: Option<String>,
    pub pr_title: String,
    pub pr_body: String,
}

// ── Run session ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "manual" {
            Self::Manual
        } else {
            Self::Scheduled
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "running" => Self::Running,
            _ => Self::Aborted,
        }
    }
}

/// Summary of one run cycle. Finalized once, then never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSession {
    pub id: i64,
    pub project: String,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub issues_seen: u32,
    pub applied: u32,
    pub resolved: u32,
    pub skipped: u32,
    pub failed: u32,
    pub status: RunStatus,
    pub error: Option<String>,
}

impl RunSession {
    pub fn start(project: &str, trigger: RunTrigger) -> Self {
        Self {
            id: 0,
            project: project.to_string(),
            trigger,
            started_at: Utc::now(),
            ended_at: None,
            issues_seen: 0,
            applied: 0,
            resolved: 0,
            skipped: 0,
            failed: 0,
            status: RunStatus::Running,
            error: None,
        }
    }

    pub fn finish(mut self, status: RunStatus, error: Option<String>) -> Self {
        self.ended_at = Some(Utc::now());
        self.status = status;
        self.error = error;
        self
    }
}
