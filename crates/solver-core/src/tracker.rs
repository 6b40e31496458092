use async_trait::async_trait;
use thiserror::Error;

use crate::filter::IssueFilter;
use crate::types::Issue;

/// Failures talking to the issue tracker.
#[derive(Error, Debug)]
pub enum TrackerError {
    /// Token missing, expired or lacking scope.
    #[error("tracker rejected credentials")]
    Unauthorized,

    #[error("tracker rate limit hit, retry after {retry_after_s:?}s")]
    RateLimited { retry_after_s: Option<u64> },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("tracker returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl TrackerError {
    /// Whether trying again later could succeed without operator action.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Transport(_) => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// The upstream issue tracker as the run controller sees it.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Unresolved issues for `project`, at most `limit` of them.
    /// Implementations should narrow by `filter` before doing per-issue
    /// work; callers still apply it locally.
    async fn list_unresolved(
        &self,
        project: &str,
        filter: &IssueFilter,
        limit: usize,
    ) -> Result<Vec<Issue>, TrackerError>;

    async fn mark_resolved(&self, issue_id: &str) -> Result<(), TrackerError>;
}
