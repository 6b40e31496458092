use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;

use crate::confidence::ConfidencePolicy;
use crate::db::Db;
use crate::decision::DecisionPolicy;
use crate::filter::IssueFilter;
use crate::naming::{BranchNaming, CommitFormat, CommitStyle};
use crate::safety::SafetyPolicy;
use crate::types::Severity;

const ENV_PREFIX: &str = "SENTRY_SOLVER_";
const DB_FILE: &str = "sentry_solver.db";

/// Longest pause between scheduled runs: one week.
pub const MAX_CHECK_INTERVAL_MINUTES: u64 = 7 * 24 * 60;
/// Oldest `last_seen` a run may look back to: ten years.
pub const MAX_ISSUE_AGE_DAYS: i64 = 3650;

#[derive(Debug, Clone)]
pub struct Config {
    pub sentry_auth_token: String,
    pub sentry_org: String,
    pub sentry_project: String,
    pub sentry_base_url: String,
    pub data_dir: String,
    pub work_directory: String,

    pub check_interval_minutes: u64,
    pub max_issues_per_run: u32,
    pub issue_min_severity: String,
    pub issue_environments: String,
    pub issue_min_occurrences: u64,
    pub issue_max_age_days: i64,

    pub git_default_branch: String,
    pub git_remote: String,
    pub git_branch_prefix: String,
    pub git_include_issue_id: bool,
    pub git_include_timestamp: bool,
    pub git_pull_before_fix: bool,
    pub git_auto_push: bool,
    pub git_author_name: String,
    pub git_author_email: String,
    pub commit_message_prefix: String,
    pub commit_message_format: String,

    pub apply_threshold: f64,
    pub resolve_threshold: f64,
    pub max_apply_attempts: u32,
    pub lock_timeout_s: u64,

    pub enable_safety_checks: bool,
    pub allow_config_file_fixes: bool,
    pub allow_migration_fixes: bool,
    pub allow_system_command_fixes: bool,

    pub web_bind: String,
    pub web_port: u16,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sentry_auth_token: String::new(),
            sentry_org: String::new(),
            sentry_project: String::new(),
            sentry_base_url: "https://sentry.io".into(),
            data_dir: "store".into(),
            work_directory: ".".into(),
            check_interval_minutes: 30,
            max_issues_per_run: 5,
            issue_min_severity: "all".into(),
            issue_environments: "all".into(),
            issue_min_occurrences: 1,
            issue_max_age_days: 30,
            git_default_branch: "main".into(),
            git_remote: "origin".into(),
            git_branch_prefix: "sentry-fix".into(),
            git_include_issue_id: true,
            git_include_timestamp: true,
            git_pull_before_fix: false,
            git_auto_push: true,
            git_author_name: String::new(),
            git_author_email: String::new(),
            commit_message_prefix: "fix".into(),
            commit_message_format: "conventional".into(),
            apply_threshold: 0.60,
            resolve_threshold: 0.80,
            max_apply_attempts: 3,
            lock_timeout_s: 5,
            enable_safety_checks: true,
            allow_config_file_fixes: false,
            allow_migration_fixes: false,
            allow_system_command_fixes: false,
            web_bind: "127.0.0.1".into(),
            web_port: 8000,
            log_level: "info".into(),
        }
    }
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            let v = v.trim().trim_matches('"').trim_matches('\'');
            map.insert(k.trim().to_string(), v.to_string());
        }
    }
    map
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Apply `lookup(key)` over every field that has a value. Unparseable values
/// keep the current setting. Shared by env loading and DB overrides.
fn overlay(c: &mut Config, lookup: &dyn Fn(&str) -> Option<String>, include_secrets: bool) {
    macro_rules! load_str {
        ($key:expr, $field:expr) => {
            if let Some(v) = lookup($key) {
                $field = v;
            }
        };
    }
    macro_rules! load_parse {
        ($key:expr, $field:expr) => {
            if let Some(v) = lookup($key).and_then(|s| s.trim().parse().ok()) {
                $field = v;
            }
        };
    }
    macro_rules! load_bool {
        ($key:expr, $field:expr) => {
            if let Some(v) = lookup($key).as_deref().and_then(parse_bool) {
                $field = v;
            }
        };
    }

    if include_secrets {
        load_str!("sentry_auth_token", c.sentry_auth_token);
        load_str!("data_dir", c.data_dir);
    }
    load_str!("sentry_organization_slug", c.sentry_org);
    load_str!("sentry_project_slug", c.sentry_project);
    load_str!("sentry_base_url", c.sentry_base_url);
    load_str!("work_directory", c.work_directory);
    load_parse!("check_interval_minutes", c.check_interval_minutes);
    load_parse!("max_issues_per_run", c.max_issues_per_run);
    load_str!("issue_min_severity", c.issue_min_severity);
    load_str!("issue_environments", c.issue_environments);
    load_parse!("issue_min_occurrences", c.issue_min_occurrences);
    load_parse!("issue_max_age_days", c.issue_max_age_days);
    load_str!("git_default_branch", c.git_default_branch);
    load_str!("git_remote", c.git_remote);
    load_str!("git_branch_prefix", c.git_branch_prefix);
    load_bool!("git_include_issue_id", c.git_include_issue_id);
    load_bool!("git_include_timestamp", c.git_include_timestamp);
    load_bool!("git_pull_before_fix", c.git_pull_before_fix);
    load_bool!("git_auto_push", c.git_auto_push);
    load_str!("git_author_name", c.git_author_name);
    load_str!("git_author_email", c.git_author_email);
    load_str!("commit_message_prefix", c.commit_message_prefix);
    load_str!("commit_message_format", c.commit_message_format);
    load_parse!("apply_threshold", c.apply_threshold);
    load_parse!("resolve_threshold", c.resolve_threshold);
    load_parse!("max_apply_attempts", c.max_apply_attempts);
    load_parse!("lock_timeout_s", c.lock_timeout_s);
    load_bool!("enable_safety_checks", c.enable_safety_checks);
    load_bool!("allow_config_file_fixes", c.allow_config_file_fixes);
    load_bool!("allow_migration_fixes", c.allow_migration_fixes);
    load_bool!("allow_system_command_fixes", c.allow_system_command_fixes);
    load_str!("web_bind", c.web_bind);
    load_parse!("web_port", c.web_port);
    load_str!("log_level", c.log_level);
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();
        let lookup = |key: &str| {
            let name = format!("{ENV_PREFIX}{}", key.to_ascii_uppercase());
            std::env::var(&name)
                .ok()
                .or_else(|| dotenv.get(&name).cloned())
        };
        Ok(Self::from_lookup(&lookup))
    }

    /// Build from an arbitrary key source (lowercase keys without prefix).
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let mut c = Self::default();
        overlay(&mut c, lookup, true);
        c.sanitize();
        c
    }

    fn sanitize(&mut self) {
        let policy = DecisionPolicy::new(
            self.apply_threshold,
            self.resolve_threshold,
            self.max_apply_attempts,
        );
        self.apply_threshold = policy.apply_threshold;
        self.resolve_threshold = policy.resolve_threshold;
        self.check_interval_minutes = self
            .check_interval_minutes
            .clamp(1, MAX_CHECK_INTERVAL_MINUTES);
        self.issue_max_age_days = self.issue_max_age_days.min(MAX_ISSUE_AGE_DAYS);
        if self.max_issues_per_run == 0 {
            self.max_issues_per_run = 1;
        }
    }

    /// Key/value pairs editable at runtime. Secrets are never included.
    pub fn runtime_entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("sentry_organization_slug", self.sentry_org.clone()),
            ("sentry_project_slug", self.sentry_project.clone()),
            ("sentry_base_url", self.sentry_base_url.clone()),
            ("work_directory", self.work_directory.clone()),
            ("check_interval_minutes", self.check_interval_minutes.to_string()),
            ("max_issues_per_run", self.max_issues_per_run.to_string()),
            ("issue_min_severity", self.issue_min_severity.clone()),
            ("issue_environments", self.issue_environments.clone()),
            ("issue_min_occurrences", self.issue_min_occurrences.to_string()),
            ("issue_max_age_days", self.issue_max_age_days.to_string()),
            ("git_default_branch", self.git_default_branch.clone()),
            ("git_remote", self.git_remote.clone()),
            ("git_branch_prefix", self.git_branch_prefix.clone()),
            ("git_include_issue_id", self.git_include_issue_id.to_string()),
            ("git_include_timestamp", self.git_include_timestamp.to_string()),
            ("git_pull_before_fix", self.git_pull_before_fix.to_string()),
            ("git_auto_push", self.git_auto_push.to_string()),
            ("git_author_name", self.git_author_name.clone()),
            ("git_author_email", self.git_author_email.clone()),
            ("commit_message_prefix", self.commit_message_prefix.clone()),
            ("commit_message_format", self.commit_message_format.clone()),
            ("apply_threshold", self.apply_threshold.to_string()),
            ("resolve_threshold", self.resolve_threshold.to_string()),
            ("max_apply_attempts", self.max_apply_attempts.to_string()),
            ("lock_timeout_s", self.lock_timeout_s.to_string()),
            ("enable_safety_checks", self.enable_safety_checks.to_string()),
            ("allow_config_file_fixes", self.allow_config_file_fixes.to_string()),
            ("allow_migration_fixes", self.allow_migration_fixes.to_string()),
            (
                "allow_system_command_fixes",
                self.allow_system_command_fixes.to_string(),
            ),
        ]
    }

    /// Write current settings into the config table without overwriting edits.
    pub fn seed_db(&self, db: &Db) -> Result<()> {
        for (key, value) in self.runtime_entries() {
            db.seed_config(key, &value)?;
        }
        Ok(())
    }

    /// Return a new Config with non-sensitive fields overridden from DB values.
    pub fn load_from_db(&self, db: &Db) -> Self {
        let mut c = self.clone();
        let lookup = |key: &str| db.get_config(key).ok().flatten();
        overlay(&mut c, &lookup, false);
        c.sanitize();
        c
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(DB_FILE)
    }

    pub fn filter(&self) -> IssueFilter {
        let environments = match self.issue_environments.trim() {
            "" | "all" => None,
            list => Some(
                list.split(',')
                    .map(|e| e.trim().to_string())
                    .filter(|e| !e.is_empty())
                    .collect(),
            ),
        };
        IssueFilter {
            min_severity: Severity::parse(&self.issue_min_severity),
            environments,
            min_occurrences: self.issue_min_occurrences,
            max_age_days: (self.issue_max_age_days > 0).then_some(self.issue_max_age_days),
        }
    }

    pub fn decision_policy(&self) -> DecisionPolicy {
        DecisionPolicy::new(
            self.apply_threshold,
            self.resolve_threshold,
            self.max_apply_attempts,
        )
    }

    pub fn confidence_policy(&self) -> ConfidencePolicy {
        ConfidencePolicy {
            max_age_days: self.issue_max_age_days.max(0),
            ..ConfidencePolicy::default()
        }
    }

    pub fn safety_policy(&self) -> SafetyPolicy {
        SafetyPolicy {
            enabled: self.enable_safety_checks,
            allow_config_file_fixes: self.allow_config_file_fixes,
            allow_migration_fixes: self.allow_migration_fixes,
            allow_system_command_fixes: self.allow_system_command_fixes,
        }
    }

    pub fn branch_naming(&self) -> BranchNaming {
        BranchNaming {
            prefix: self.git_branch_prefix.clone(),
            include_issue_id: self.git_include_issue_id,
            include_timestamp: self.git_include_timestamp,
        }
    }

    pub fn commit_style(&self) -> CommitStyle {
        CommitStyle {
            prefix: self.commit_message_prefix.clone(),
            format: CommitFormat::parse(&self.commit_message_format),
        }
    }
}
