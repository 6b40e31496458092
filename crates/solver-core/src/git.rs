use std::process::Command;

use anyhow::{anyhow, Context, Result};

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Thin wrapper over the `git` CLI bound to one working copy.
#[derive(Debug, Clone)]
pub struct Git {
    pub repo_path: String,
    /// `(name, email)` used for fix commits; git's own identity when `None`.
    pub author: Option<(String, String)>,
}

impl Git {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
            author: None,
        }
    }

    pub fn with_author(mut self, name: &str, email: &str) -> Self {
        if !name.is_empty() && !email.is_empty() {
            self.author = Some((name.to_string(), email.to_string()));
        }
        self
    }

    pub fn exec(&self, args: &[&str]) -> Result<ExecResult> {
        self.exec_env(args, &[])
    }

    pub fn exec_env(&self, args: &[&str], env: &[(&str, &str)]) -> Result<ExecResult> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.repo_path);
        cmd.args(args);
        for (k, v) in env {
            cmd.env(k, v);
        }

        let output = cmd.output().with_context(|| {
            format!("failed to spawn git -C {} {}", self.repo_path, args.join(" "))
        })?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    /// Run and fail on non-zero exit; returns trimmed stdout.
    fn run(&self, args: &[&str]) -> Result<String> {
        let result = self.exec(args)?;
        if !result.success() {
            return Err(anyhow!(
                "git {} failed in {}: {}",
                args.join(" "),
                self.repo_path,
                result.combined_output().trim()
            ));
        }
        Ok(result.stdout.trim().to_string())
    }

    pub fn is_repo(&self) -> bool {
        self.exec(&["rev-parse", "--git-dir"])
            .map(|r| r.success())
            .unwrap_or(false)
    }

    pub fn status_clean(&self) -> Result<bool> {
        let result = self.exec(&["status", "--porcelain"])?;
        Ok(result.stdout.trim().is_empty() && result.exit_code == 0)
    }

    pub fn current_branch(&self) -> Result<String> {
        self.run(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        self.run(&["rev-parse", "--verify", rev])
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let refname = format!("refs/heads/{branch}");
        Ok(self
            .exec(&["show-ref", "--verify", "--quiet", &refname])?
            .success())
    }

    /// Local branches matching any of `patterns` (`for-each-ref` globs), sorted.
    pub fn list_branches(&self, patterns: &[&str]) -> Result<Vec<String>> {
        let refs: Vec<String> = patterns.iter().map(|p| format!("refs/heads/{p}")).collect();
        let mut args = vec!["for-each-ref", "--format=%(refname:short)"];
        args.extend(refs.iter().map(String::as_str));
        let out = self.run(&args)?;
        let mut branches: Vec<String> = out.lines().map(str::to_string).collect();
        branches.sort();
        Ok(branches)
    }

    pub fn checkout(&self, branch: &str) -> Result<()> {
        self.run(&["checkout", branch]).map(drop)
    }

    pub fn create_branch(&self, branch: &str) -> Result<()> {
        self.run(&["checkout", "-b", branch]).map(drop)
    }

    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run(&["branch", "-D", branch]).map(drop)
    }

    pub fn pull_ff_only(&self, remote: &str, branch: &str) -> Result<()> {
        self.run(&["pull", "--ff-only", remote, branch]).map(drop)
    }

    /// Discard tracked and untracked modifications.
    pub fn reset_hard(&self, ref_: &str) -> Result<()> {
        self.run(&["reset", "--hard", ref_])?;
        self.run(&["clean", "-fd"]).map(drop)
    }

    pub fn add(&self, path: &str) -> Result<()> {
        self.run(&["add", "--", path]).map(drop)
    }

    /// Commit what is staged. Returns `false` when there was nothing to commit.
    pub fn commit(&self, message: &str) -> Result<bool> {
        let staged = self.exec(&["diff", "--cached", "--quiet"])?;
        if staged.success() {
            return Ok(false);
        }

        let env: Vec<(&str, &str)> = match &self.author {
            Some((name, email)) => vec![
                ("GIT_AUTHOR_NAME", name.as_str()),
                ("GIT_AUTHOR_EMAIL", email.as_str()),
                ("GIT_COMMITTER_NAME", name.as_str()),
                ("GIT_COMMITTER_EMAIL", email.as_str()),
            ],
            None => Vec::new(),
        };
        let result = self.exec_env(&["commit", "-m", message], &env)?;
        if !result.success() {
            return Err(anyhow!(
                "git commit failed in {}: {}",
                self.repo_path,
                result.combined_output().trim()
            ));
        }
        Ok(true)
    }

    pub fn push_branch(&self, remote: &str, branch: &str) -> Result<()> {
        self.run(&["push", "-u", remote, branch]).map(drop)
    }
}
