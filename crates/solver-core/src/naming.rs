//! Branch names, commit messages and pull-request text for applied fixes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{FixCandidate, Issue};

const COMMIT_TITLE_MAX: usize = 72;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchNaming {
    pub prefix: String,
    pub include_issue_id: bool,
    pub include_timestamp: bool,
}

impl Default for BranchNaming {
    fn default() -> Self {
        Self {
            prefix: "sentry-fix".into(),
            include_issue_id: true,
            include_timestamp: true,
        }
    }
}

impl BranchNaming {
    /// `prefix-id`, or `None` when branch names do not carry the issue id.
    fn issue_stem(&self, issue: &Issue) -> Option<String> {
        if !self.include_issue_id {
            return None;
        }
        let id: String = issue
            .id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        (!id.is_empty()).then(|| format!("{}-{id}", self.prefix))
    }

    /// `prefix[-id][-slug][-YYYYMMDD-HHMMSS]`
    pub fn branch_name(&self, issue: &Issue, now: DateTime<Utc>) -> String {
        let mut parts = vec![self
            .issue_stem(issue)
            .unwrap_or_else(|| self.prefix.clone())];
        if let Some(slug) = exception_slug(issue) {
            parts.push(slug);
        }
        if self.include_timestamp {
            parts.push(now.format("%Y%m%d-%H%M%S").to_string());
        }
        parts.join("-")
    }

    /// Branch globs that can only match fixes for this issue.
    pub fn issue_branch_globs(&self, issue: &Issue) -> Option<[String; 2]> {
        let stem = self.issue_stem(issue)?;
        let nested = format!("{stem}-*");
        Some([stem, nested])
    }
}

/// Short lowercase exception name, e.g. `Google\...\BadRequestException` → `badrequest`.
fn exception_slug(issue: &Issue) -> Option<String> {
    let source = if issue.exception.trim().is_empty() {
        clean_title(&issue.title)
    } else {
        issue.exception.clone()
    };
    let short = source
        .split(':')
        .next()
        .unwrap_or_default()
        .rsplit(|c| c == '\\' || c == '.')
        .next()
        .unwrap_or_default()
        .trim();
    let short = short
        .strip_suffix("Exception")
        .or_else(|| short.strip_suffix("Error"))
        .unwrap_or(short);
    let slug: String = short
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .take(20)
        .collect();
    (slug.len() > 3).then_some(slug)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitFormat {
    Simple,
    Conventional,
    Detailed,
}

impl CommitFormat {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Self::Simple,
            "detailed" => Self::Detailed,
            _ => Self::Conventional,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Conventional => "conventional",
            Self::Detailed => "detailed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitStyle {
    pub prefix: String,
    pub format: CommitFormat,
}

impl Default for CommitStyle {
    fn default() -> Self {
        Self {
            prefix: "fix".into(),
            format: CommitFormat::Conventional,
        }
    }
}

impl CommitStyle {
    pub fn message(&self, issue: &Issue, fix: &FixCandidate, file: &str) -> String {
        let file_name = file.rsplit('/').next().filter(|n| !n.is_empty()).unwrap_or("unknown file");
        let title = truncate(
            &format!("{}: {} in {}", self.prefix, clean_title(&issue.title), file_name),
            COMMIT_TITLE_MAX,
        );
        if self.format == CommitFormat::Simple {
            return title;
        }

        let mut msg = format!(
            "{title}\n\n- Fixed {} error in {}:{}\n- Issue ID: {}\n- Occurrences: {}\n- Confidence: {:.1}%\n",
            issue.level.as_str(),
            file,
            fix.line,
            issue.id,
            issue.count,
            fix.confidence * 100.0,
        );
        if self.format == CommitFormat::Detailed {
            msg.push_str(&format!(
                "\n## Fix Details\n{}\n\n## Code Changes\nOriginal:\n{}\n\nFixed:\n{}\n",
                fix.explanation, fix.original, fix.replacement
            ));
        }
        if !issue.permalink.is_empty() {
            msg.push_str(&format!("\nSentry Issue: {}", issue.permalink));
        }
        msg.trim_end().to_string()
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max - 3).collect();
    format!("{head}...")
}

/// Readable one-line error title: namespace stripped, noisy context trimmed.
pub fn clean_title(title: &str) -> String {
    let title = title.trim();
    let Some((head, context)) = title.split_once(':') else {
        let short = title.rsplit('\\').next().unwrap_or(title);
        return truncate(short, 43);
    };
    let error_type = head.rsplit('\\').next().unwrap_or(head).trim();
    match clean_context(context) {
        Some(ctx) => format!("{error_type}: {ctx}"),
        None => error_type.to_string(),
    }
}

fn clean_context(context: &str) -> Option<String> {
    let context = context.trim();
    if matches!(context, "" | "{" | "}" | "{}" | "[]" | "\"\"" | "''") {
        return None;
    }
    if context.starts_with('{') && !context.ends_with('}') {
        return None;
    }
    if context.starts_with('{') && context.len() > 50 {
        return Some("malformed request data".into());
    }
    let normalized = context.split_whitespace().collect::<Vec<_>>().join(" ");
    Some(truncate(&normalized, 30))
}

/// Title and markdown body for a pull request proposing the fix.
pub fn pull_request(issue: &Issue, fix: &FixCandidate, file: &str, branch: &str) -> (String, String) {
    let title = format!("Fix Sentry Issue: {}", issue.title);
    let body = format!(
        "## Auto-generated fix for Sentry issue {id}\n\n\
         **Issue:** {title}\n\
         **Level:** {level}\n\
         **Occurrences:** {count}\n\
         **Branch:** `{branch}`\n\n\
         ### Issue details\n\
         - **Culprit:** {culprit}\n\
         - **First seen:** {first}\n\
         - **Last seen:** {last}\n\
         - [View issue in Sentry]({link})\n\n\
         ### Fix applied\n\
         **File:** `{file}`\n\
         **Line:** {line}\n\
         **Confidence:** {conf:.1}%\n\
         **Pattern:** `{pattern}`\n\n\
         {explanation}\n\n\
         ### Code changes\n\
         ```\n# Before\n{before}\n\n# After\n{after}\n```\n\n\
         ### Review notes\n\
         - Generated from Sentry error data; review before merging\n\
         - Consider adding a regression test\n\
         - Watch the issue in Sentry after deploying\n",
        id = issue.id,
        title = issue.title,
        level = issue.level.as_str(),
        count = issue.count,
        culprit = issue.culprit,
        first = issue.first_seen.to_rfc3339(),
        last = issue.last_seen.to_rfc3339(),
        link = issue.permalink,
        line = fix.line,
        conf = fix.confidence * 100.0,
        pattern = fix.pattern_id,
        explanation = fix.explanation,
        before = fix.original,
        after = fix.replacement,
    );
    (title, body)
}
