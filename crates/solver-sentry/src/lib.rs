//! Sentry REST client implementing the core's `IssueTracker` seam.

pub mod parse;

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Response, StatusCode};
use serde_json::{json, Value};
use solver_core::config::Config;
use solver_core::filter::IssueFilter;
use solver_core::tracker::{IssueTracker, TrackerError};
use solver_core::Issue;
use tracing::{debug, info, warn};

pub use parse::SentryProject;

/// Sentry caps `limit` on the issues endpoint at 100.
const MAX_PAGE: usize = 100;
const MAX_PROJECT_PAGES: usize = 10;

pub struct SentryClient {
    http: reqwest::Client,
    base_url: String,
    org: String,
    token: String,
}

impl SentryClient {
    pub fn new(base_url: &str, org: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .user_agent(concat!("sentry-solver/", env!("CARGO_PKG_VERSION")))
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            org: org.to_string(),
            token: token.to_string(),
        }
    }

    pub fn from_config(c: &Config) -> Result<Self> {
        if c.sentry_auth_token.is_empty() {
            anyhow::bail!("SENTRY_SOLVER_SENTRY_AUTH_TOKEN is not set");
        }
        if c.sentry_org.is_empty() {
            anyhow::bail!("SENTRY_SOLVER_SENTRY_ORGANIZATION_SLUG is not set");
        }
        Ok(Self::new(&c.sentry_base_url, &c.sentry_org, &c.sentry_auth_token))
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/0/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Response, TrackerError> {
        let resp = req
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| TrackerError::Transport(e.to_string()))?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!("sentry rate limit hit, retry after {retry_after:?}");
        }
        Err(parse::status_error(status.as_u16(), &body, retry_after.as_deref()))
    }

    async fn get_json(&self, url: &str) -> Result<Value, TrackerError> {
        self.send(self.http.get(url))
            .await?
            .json()
            .await
            .map_err(|e| TrackerError::Decode(e.to_string()))
    }

    /// Latest event of an issue, where the stack frames live.
    pub async fn latest_event(&self, issue_id: &str) -> Result<Value, TrackerError> {
        self.get_json(&self.api(&format!("issues/{issue_id}/events/latest/")))
            .await
    }

    /// All projects in the organization, following `Link` pagination.
    pub async fn list_projects(&self) -> Result<Vec<SentryProject>, TrackerError> {
        let mut url = Some(self.api(&format!("organizations/{}/projects/", self.org)));
        let mut projects = Vec::new();
        let mut pages = 0;
        while let Some(current) = url.take() {
            if pages == MAX_PROJECT_PAGES {
                warn!("stopped listing projects after {pages} pages");
                break;
            }
            let resp = self.send(self.http.get(&current)).await?;
            url = resp
                .headers()
                .get(reqwest::header::LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(parse::next_page);
            let page: Value = resp
                .json()
                .await
                .map_err(|e| TrackerError::Decode(e.to_string()))?;
            projects.extend(parse::parse_projects(&page));
            pages += 1;
        }
        projects.sort_by_key(|p| p.name.to_lowercase());
        info!("fetched {} sentry projects", projects.len());
        Ok(projects)
    }
}

#[async_trait]
impl IssueTracker for SentryClient {
    async fn list_unresolved(
        &self,
        project: &str,
        filter: &IssueFilter,
        limit: usize,
    ) -> Result<Vec<Issue>, TrackerError> {
        let query = parse::build_query(filter);
        let url = format!(
            "{}?query={}&limit={MAX_PAGE}",
            self.api(&format!("projects/{}/{}/issues/", self.org, project)),
            urlencoding::encode(&query),
        );
        debug!("listing sentry issues for {project}: {query}");
        let list = self.get_json(&url).await?;
        let entries = list
            .as_array()
            .ok_or_else(|| TrackerError::Decode("issue list is not an array".into()))?;

        let parsed: Vec<Issue> = entries
            .iter()
            .filter_map(|entry| match parse::parse_issue(project, entry) {
                Ok(issue) => Some(issue),
                Err(e) => {
                    warn!("skipping sentry issue entry: {e}");
                    None
                }
            })
            .collect();
        let listed = parsed.len();
        let selected = parse::preselect(filter, parsed, Utc::now(), limit);
        debug!("{listed} issues listed for {project}, fetching events for {}", selected.len());

        let mut issues = Vec::with_capacity(selected.len());
        for mut issue in selected {
            match self.latest_event(&issue.id).await {
                Ok(event) => parse::apply_event(&mut issue, &event),
                Err(TrackerError::Unauthorized) => return Err(TrackerError::Unauthorized),
                Err(e @ TrackerError::RateLimited { .. }) => {
                    warn!(
                        "stopped fetching events for {project} after {} issues: {e}",
                        issues.len()
                    );
                    break;
                }
                Err(e) => warn!("issue {}: latest event unavailable: {e}", issue.id),
            }
            issues.push(issue);
        }
        info!("fetched {} unresolved issues for {project}", issues.len());
        Ok(issues)
    }

    async fn mark_resolved(&self, issue_id: &str) -> Result<(), TrackerError> {
        let url = self.api(&format!("issues/{issue_id}/"));
        self.send(self.http.put(&url).json(&json!({"status": "resolved"})))
            .await?;
        info!("issue {issue_id}: status set to resolved in sentry");
        Ok(())
    }
}

/// Startup check that the token can see the organization.
pub async fn verify_access(client: &SentryClient) -> Result<usize> {
    let projects = client
        .list_projects()
        .await
        .context("sentry credentials check failed")?;
    Ok(projects.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_rooted_at_api_zero() {
        let c = SentryClient::new("https://sentry.example.com/", "acme", "t");
        assert_eq!(
            c.api("issues/1/events/latest/"),
            "https://sentry.example.com/api/0/issues/1/events/latest/"
        );
    }

    #[test]
    fn config_without_token_is_rejected() {
        let c = Config::default();
        assert!(SentryClient::from_config(&c).is_err());
        let c = Config {
            sentry_auth_token: "t".into(),
            sentry_org: "acme".into(),
            ..Config::default()
        };
        assert!(SentryClient::from_config(&c).is_ok());
    }

    #[tokio::test]
    async fn unreachable_host_is_a_transport_error() {
        let c = SentryClient::new("http://127.0.0.1:1", "acme", "t");
        let err = c.mark_resolved("1").await.unwrap_err();
        assert!(matches!(err, TrackerError::Transport(_)), "{err:?}");
        assert!(err.is_transient());
    }
}
