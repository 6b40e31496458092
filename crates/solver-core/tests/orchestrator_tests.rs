use std::path::Path;
use std::process::Command;
use std::time::Duration;

use chrono::Utc;
use solver_core::{
    naming::{BranchNaming, CommitStyle},
    orchestrator::{GitSettings, Orchestrator, OrchestratorError, WorkingCopyLocks},
    safety::SafetyPolicy,
    FixCandidate, Issue, IssueStatus, Language, MatchSpecificity, Severity, StackFrame,
};
use tempfile::TempDir;

// ── helpers ──────────────────────────────────────────────────────────────────

fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .expect("spawn git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

const HANDLER: &str = "def handle(payload):\n    name = payload['user']\n    return name\n";

fn init_repo() -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    let p = dir.path();
    git(p, &["init", "-q", "-b", "main"]);
    git(p, &["config", "user.name", "Test"]);
    git(p, &["config", "user.email", "test@example.com"]);
    git(p, &["config", "commit.gpgsign", "false"]);
    std::fs::create_dir_all(p.join("src")).unwrap();
    std::fs::create_dir_all(p.join("vendor/lib")).unwrap();
    std::fs::write(p.join("src/handler.py"), HANDLER).unwrap();
    std::fs::write(p.join("vendor/lib/dep.py"), HANDLER).unwrap();
    git(p, &["add", "-A"]);
    git(p, &["commit", "-q", "-m", "init"]);
    dir
}

fn settings(auto_push: bool) -> GitSettings {
    GitSettings {
        base_branch: "main".into(),
        remote: "origin".into(),
        pull_before_fix: false,
        auto_push,
        author_name: String::new(),
        author_email: String::new(),
        branch: BranchNaming::default(),
        commit: CommitStyle::default(),
    }
}

fn orchestrator(dir: &TempDir, auto_push: bool, locks: WorkingCopyLocks) -> Orchestrator {
    Orchestrator::new(
        "web",
        dir.path(),
        settings(auto_push),
        SafetyPolicy::default(),
        locks,
        Duration::from_millis(100),
    )
}

fn issue() -> Issue {
    Issue {
        id: "321".into(),
        project: "web".into(),
        title: "KeyError: 'user'".into(),
        exception: "KeyError".into(),
        message: "'user'".into(),
        culprit: "handler.handle".into(),
        permalink: "https://sentry.io/issues/321/".into(),
        level: Severity::Error,
        status: IssueStatus::Unresolved,
        count: 20,
        first_seen: Utc::now(),
        last_seen: Utc::now(),
        environment: Some("production".into()),
        frame: Some(StackFrame {
            file: "/app/src/handler.py".into(),
            line: 2,
            language: Language::Python,
            context_line: Some("    name = payload['user']".into()),
        }),
        stack_trace: None,
    }
}

fn candidate(file: &str) -> FixCandidate {
    FixCandidate {
        issue_id: "321".into(),
        pattern_id: "py-key-error".into(),
        file: file.into(),
        line: 2,
        original: "payload['user']".into(),
        replacement: "payload.get('user')".into(),
        explanation: "Uses dict.get".into(),
        specificity: MatchSpecificity::Pattern,
        confidence: 0.84,
    }
}

/// Install a `pre-commit` hook running `body`.
fn pre_commit_hook(dir: &TempDir, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    let hook = dir.path().join(".git/hooks/pre-commit");
    std::fs::create_dir_all(hook.parent().unwrap()).unwrap();
    std::fs::write(&hook, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn branches(dir: &TempDir) -> Vec<String> {
    git(dir.path(), &["branch", "--format=%(refname:short)"])
        .lines()
        .map(str::to_string)
        .collect()
}

fn assert_clean_on_main(dir: &TempDir) {
    assert_eq!(git(dir.path(), &["rev-parse", "--abbrev-ref", "HEAD"]), "main");
    assert_eq!(git(dir.path(), &["status", "--porcelain"]), "");
}

// ── success path ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn applies_fix_on_new_branch_and_returns_to_base() {
    let dir = init_repo();
    let orch = orchestrator(&dir, false, WorkingCopyLocks::new());

    let applied = orch
        .apply_fix(&issue(), &candidate("/app/src/handler.py"))
        .await
        .expect("apply");

    assert!(applied.branch.starts_with("sentry-fix-321-"));
    assert_eq!(applied.file, "src/handler.py");
    assert!(!applied.pushed);
    assert!(applied.push_error.is_none());
    assert!(applied.pr_title.contains("KeyError"));

    assert_clean_on_main(&dir);
    // Base branch untouched, fix lives on the branch only.
    assert_eq!(
        std::fs::read_to_string(dir.path().join("src/handler.py")).unwrap(),
        HANDLER
    );
    let fixed = git(dir.path(), &["show", &format!("{}:src/handler.py", applied.branch)]);
    assert!(fixed.contains("name = payload.get('user')"));
    assert_eq!(git(dir.path(), &["rev-parse", &applied.branch]), applied.commit);

    let subject = git(dir.path(), &["log", "-1", "--format=%s", &applied.branch]);
    assert_eq!(subject, "fix: KeyError: 'user' in handler.py");
}

#[tokio::test]
async fn push_failure_keeps_the_commit() {
    let dir = init_repo();
    // No remote configured, so the push must fail.
    let orch = orchestrator(&dir, true, WorkingCopyLocks::new());

    let applied = orch
        .apply_fix(&issue(), &candidate("src/handler.py"))
        .await
        .expect("apply despite push failure");

    assert!(!applied.pushed);
    assert!(applied.push_error.is_some());
    assert!(branches(&dir).contains(&applied.branch));
    assert_clean_on_main(&dir);
}

#[tokio::test]
async fn existing_fix_branch_is_reported_not_duplicated() {
    let dir = init_repo();
    let orch = orchestrator(&dir, false, WorkingCopyLocks::new());
    let applied = orch
        .apply_fix(&issue(), &candidate("src/handler.py"))
        .await
        .expect("first apply");

    let err = orch
        .apply_fix(&issue(), &candidate("src/handler.py"))
        .await
        .unwrap_err();
    match err {
        OrchestratorError::AlreadyApplied { branch, commit } => {
            assert_eq!(branch, applied.branch);
            assert_eq!(commit, applied.commit);
        }
        other => panic!("expected AlreadyApplied, got {other:?}"),
    }
    assert_eq!(branches(&dir).len(), 2);
    assert_clean_on_main(&dir);
}

// ── failure paths leave no trace ─────────────────────────────────────────────

#[tokio::test]
async fn rejected_commit_rolls_back_the_branch() {
    let dir = init_repo();
    pre_commit_hook(&dir, "echo 'commit rejected by hook' >&2\nexit 1");

    let orch = orchestrator(&dir, false, WorkingCopyLocks::new());
    let err = orch
        .apply_fix(&issue(), &candidate("src/handler.py"))
        .await
        .unwrap_err();

    assert!(
        matches!(err, OrchestratorError::Git(ref msg) if msg.contains("commit rejected by hook")),
        "{err:?}"
    );
    assert_eq!(branches(&dir), vec!["main".to_string()]);
    assert_clean_on_main(&dir);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("src/handler.py")).unwrap(),
        HANDLER
    );
}

#[tokio::test]
async fn stale_target_leaves_repo_untouched() {
    let dir = init_repo();
    std::fs::write(
        dir.path().join("src/handler.py"),
        "def handle(payload):\n    return payload.get('name')\n",
    )
    .unwrap();
    git(dir.path(), &["commit", "-q", "-am", "refactor"]);

    let orch = orchestrator(&dir, false, WorkingCopyLocks::new());
    let err = orch
        .apply_fix(&issue(), &candidate("src/handler.py"))
        .await
        .unwrap_err();

    assert!(
        matches!(err, OrchestratorError::StaleTarget { ref file, line: 2 } if file == "src/handler.py"),
        "{err:?}"
    );
    assert_eq!(branches(&dir), vec!["main".to_string()]);
    assert_clean_on_main(&dir);
}

#[tokio::test]
async fn dirty_working_copy_is_refused() {
    let dir = init_repo();
    std::fs::write(dir.path().join("src/notes.txt"), "wip").unwrap();

    let orch = orchestrator(&dir, false, WorkingCopyLocks::new());
    let err = orch
        .apply_fix(&issue(), &candidate("src/handler.py"))
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::DirtyWorkingCopy(_)), "{err:?}");
    assert_eq!(branches(&dir), vec!["main".to_string()]);
    // The operator's file is not ours to clean up.
    assert!(dir.path().join("src/notes.txt").exists());
}

#[tokio::test]
async fn wrong_base_branch_is_refused() {
    let dir = init_repo();
    git(dir.path(), &["checkout", "-q", "-b", "feature"]);

    let orch = orchestrator(&dir, false, WorkingCopyLocks::new());
    let err = orch
        .apply_fix(&issue(), &candidate("src/handler.py"))
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::DirtyWorkingCopy(_)), "{err:?}");
    assert_eq!(git(dir.path(), &["rev-parse", "--abbrev-ref", "HEAD"]), "feature");
}

#[tokio::test]
async fn missing_and_unsafe_targets() {
    let dir = init_repo();
    let orch = orchestrator(&dir, false, WorkingCopyLocks::new());

    let err = orch
        .apply_fix(&issue(), &candidate("/app/src/missing.py"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::TargetNotFound(_)), "{err:?}");

    let err = orch
        .apply_fix(&issue(), &candidate("vendor/lib/dep.py"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::UnsafeTarget(_)), "{err:?}");

    let err = orch
        .apply_fix(&issue(), &candidate("src/../../etc/passwd"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::UnsafeTarget(_)), "{err:?}");

    assert_eq!(branches(&dir), vec!["main".to_string()]);
    assert_clean_on_main(&dir);
}

// ── locking ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn held_lock_surfaces_busy() {
    let dir = init_repo();
    let locks = WorkingCopyLocks::new();
    let orch = orchestrator(&dir, false, locks.clone());

    let held = locks.lock_for("web", dir.path()).lock_owned().await;
    let err = orch
        .apply_fix(&issue(), &candidate("src/handler.py"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Busy), "{err:?}");
    assert_eq!(branches(&dir), vec!["main".to_string()]);

    drop(held);
    orch.apply_fix(&issue(), &candidate("src/handler.py"))
        .await
        .expect("apply after release");
}

#[tokio::test]
async fn other_projects_are_not_blocked() {
    let dir = init_repo();
    let locks = WorkingCopyLocks::new();
    let _held = locks.lock_for("api", dir.path()).lock_owned().await;

    let orch = orchestrator(&dir, false, locks.clone());
    orch.apply_fix(&issue(), &candidate("src/handler.py"))
        .await
        .expect("different project key");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_applies_never_interleave() {
    let dir = init_repo();
    let locks = WorkingCopyLocks::new();
    let a = orchestrator(&dir, false, locks.clone());
    let b = Orchestrator::new(
        "web",
        dir.path(),
        settings(false),
        SafetyPolicy::default(),
        locks.clone(),
        Duration::from_secs(30),
    );

    let mut second = issue();
    second.id = "322".into();
    let mut second_candidate = candidate("src/handler.py");
    second_candidate.issue_id = "322".into();

    let first_issue = issue();
    let first_candidate = candidate("src/handler.py");
    let (ra, rb) = tokio::join!(
        a.apply_fix(&first_issue, &first_candidate),
        b.apply_fix(&second, &second_candidate),
    );

    // Each either applied cleanly or saw Busy; never a corrupted sequence.
    for r in [&ra, &rb] {
        match r {
            Ok(_) | Err(OrchestratorError::Busy) => {}
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }
    assert!(ra.is_ok() || rb.is_ok());
    assert_clean_on_main(&dir);
}
