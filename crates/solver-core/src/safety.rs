//! Guard rails on what an automatically generated fix may contain and touch.

use tracing::warn;

use crate::types::FixCandidate;

const MIGRATION_MARKERS: &[&str] = &["migration", "migrate", "schema", "artisan migrate"];

const SYSTEM_COMMAND_MARKERS: &[&str] = &[
    "exec(",
    "system(",
    "shell_exec",
    "passthru",
    "proc_open",
    "subprocess",
    "os.system",
    "child_process",
];

const ALWAYS_BLOCKED: &[&str] = &[
    "eval(",
    "unserialize(",
    "drop table",
    "truncate ",
    "delete from",
    "alter table",
    "create table",
    "insert into",
    "rm -",
    "sudo ",
    "chmod ",
    "chown ",
    "unlink(",
    "rmdir(",
    "file_put_contents",
    "composer install",
    "npm install",
    "<?php",
    "<?=",
    "__destruct",
    "`",
];

const INJECTION_MARKERS: &[&str] = &["${", "$_GET", "$_POST", "$_REQUEST", "$_COOKIE"];

const SENSITIVE_FILES: &[&str] = &[
    ".env",
    "config.php",
    "database.php",
    ".htaccess",
    "composer.json",
    "package.json",
    "artisan",
    "web.config",
];

const SOURCE_DIRS: &[&str] = &[
    "app/",
    "src/",
    "lib/",
    "includes/",
    "classes/",
    "controllers/",
    "models/",
    "views/",
    "helpers/",
    "services/",
    "repositories/",
    "middleware/",
    "public/",
    "resources/",
    "routes/",
    "config/",
    "bootstrap/",
    "tests/",
];

#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    pub enabled: bool,
    pub allow_config_file_fixes: bool,
    pub allow_migration_fixes: bool,
    pub allow_system_command_fixes: bool,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_config_file_fixes: false,
            allow_migration_fixes: false,
            allow_system_command_fixes: false,
        }
    }
}

impl SafetyPolicy {
    /// Reject candidates whose new code or explanation contains dangerous constructs.
    pub fn check_candidate(&self, candidate: &FixCandidate) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        let text = format!("{} {}", candidate.replacement, candidate.explanation).to_lowercase();

        if let Some(m) = ALWAYS_BLOCKED.iter().find(|m| text.contains(*m)) {
            return Err(format!("fix contains blocked construct {m:?}"));
        }
        if !self.allow_migration_fixes {
            if let Some(m) = MIGRATION_MARKERS.iter().find(|m| text.contains(*m)) {
                return Err(format!("fix touches migrations ({m:?})"));
            }
        }
        if !self.allow_system_command_fixes {
            if let Some(m) = SYSTEM_COMMAND_MARKERS.iter().find(|m| text.contains(*m)) {
                return Err(format!("fix runs system commands ({m:?})"));
            }
        }
        if let Some(m) = INJECTION_MARKERS
            .iter()
            .find(|m| candidate.replacement.contains(*m))
        {
            return Err(format!("fix contains injection-prone construct {m:?}"));
        }
        Ok(())
    }

    /// Reject edits to vendored code, sensitive config, or files outside source trees.
    pub fn check_target(&self, rel_path: &str) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        let lower = rel_path.to_lowercase();
        if lower.starts_with("vendor/")
            || lower.contains("/vendor/")
            || lower.starts_with("node_modules/")
            || lower.contains("/node_modules/")
        {
            return Err(format!("refusing to modify third-party file {rel_path}"));
        }
        if !self.allow_config_file_fixes {
            let name = lower.rsplit('/').next().unwrap_or(&lower);
            if SENSITIVE_FILES.iter().any(|s| name == *s || name.starts_with(".env")) {
                return Err(format!("refusing to modify sensitive file {rel_path}"));
            }
        }
        let rooted = format!("/{lower}");
        if !SOURCE_DIRS.iter().any(|d| rooted.contains(&format!("/{d}"))) {
            warn!("fix target {rel_path} is outside known source directories");
            return Err(format!("{rel_path} is outside known source directories"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MatchSpecificity;

    fn candidate(replacement: &str) -> FixCandidate {
        FixCandidate {
            issue_id: "1".into(),
            pattern_id: "p".into(),
            file: "src/a.py".into(),
            line: 1,
            original: "a['k']".into(),
            replacement: replacement.into(),
            explanation: "Use a safe accessor".into(),
            specificity: MatchSpecificity::Substring,
            confidence: 0.7,
        }
    }

    #[test]
    fn plain_fix_passes() {
        assert!(SafetyPolicy::default().check_candidate(&candidate("a.get('k')")).is_ok());
    }

    #[test]
    fn shell_execution_blocked_unless_allowed() {
        let c = candidate("os.system('ls')");
        assert!(SafetyPolicy::default().check_candidate(&c).is_err());
        let relaxed = SafetyPolicy {
            allow_system_command_fixes: true,
            ..SafetyPolicy::default()
        };
        assert!(relaxed.check_candidate(&c).is_ok());
    }

    #[test]
    fn sql_always_blocked() {
        let c = candidate("cursor.execute('DROP TABLE users')");
        let relaxed = SafetyPolicy {
            allow_system_command_fixes: true,
            allow_migration_fixes: true,
            ..SafetyPolicy::default()
        };
        assert!(relaxed.check_candidate(&c).is_err());
    }

    #[test]
    fn disabled_policy_allows_everything() {
        let off = SafetyPolicy {
            enabled: false,
            ..SafetyPolicy::default()
        };
        assert!(off.check_candidate(&candidate("eval(x)")).is_ok());
        assert!(off.check_target("vendor/x.php").is_ok());
    }

    #[test]
    fn vendor_and_sensitive_targets_blocked() {
        let p = SafetyPolicy::default();
        assert!(p.check_target("vendor/laravel/x.php").is_err());
        assert!(p.check_target("web/node_modules/lib/index.js").is_err());
        assert!(p.check_target("app/.env").is_err());
        assert!(p.check_target("package.json").is_err());
    }

    #[test]
    fn source_targets_allowed() {
        let p = SafetyPolicy::default();
        assert!(p.check_target("app/Services/Logger.php").is_ok());
        assert!(p.check_target("src/handlers/user.py").is_ok());
        assert!(p.check_target("scripts/deploy.py").is_err());
    }
}
