//! Run cycles, continuous mode and the per-project controller registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::analyzer::Analyzer;
use crate::config::Config;
use crate::db::Db;
use crate::orchestrator::{Orchestrator, WorkingCopyLocks};
use crate::patterns::PatternRegistry;
use crate::resolver::{IssueOutcome, Resolver};
use crate::tracker::IssueTracker;
use crate::types::{RunSession, RunStatus, RunTrigger};

#[derive(Error, Debug)]
pub enum RunError {
    /// Another run for this project holds the run lock.
    #[error("a run is already in progress for this project")]
    Busy,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    Idle,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub project: String,
    pub state: ControllerState,
    pub continuous: bool,
    pub work_directory: String,
    pub latest_session: Option<RunSession>,
}

/// Owns everything about running one project: the run lock, status flags and
/// the continuous loop. Shared by the scheduler and on-demand triggers.
pub struct RunController {
    project: String,
    base_config: Config,
    work_dir_override: Option<String>,
    db: Arc<Db>,
    tracker: Arc<dyn IssueTracker>,
    locks: WorkingCopyLocks,
    run_lock: Arc<tokio::sync::Mutex<()>>,
    running: AtomicBool,
    stopping: AtomicBool,
    continuous: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl RunController {
    pub fn new(
        project: &str,
        base_config: Config,
        work_dir_override: Option<String>,
        db: Arc<Db>,
        tracker: Arc<dyn IssueTracker>,
        locks: WorkingCopyLocks,
    ) -> Self {
        Self {
            project: project.to_string(),
            base_config,
            work_dir_override,
            db,
            tracker,
            locks,
            run_lock: Arc::new(tokio::sync::Mutex::new(())),
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            continuous: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Settings as of now: environment, then runtime edits, then this controller's overrides.
    pub fn current_config(&self) -> Config {
        let mut c = self.base_config.load_from_db(&self.db);
        if let Some(dir) = &self.work_dir_override {
            c.work_directory = dir.clone();
        }
        c
    }

    fn token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn state(&self) -> ControllerState {
        let running = self.running.load(Ordering::SeqCst);
        if running && self.stopping.load(Ordering::SeqCst) {
            ControllerState::Stopping
        } else if running {
            ControllerState::Running
        } else {
            ControllerState::Idle
        }
    }

    pub fn is_continuous(&self) -> bool {
        self.continuous.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            project: self.project.clone(),
            state: self.state(),
            continuous: self.is_continuous(),
            work_directory: self.current_config().work_directory,
            latest_session: self.db.latest_session(&self.project).ok().flatten(),
        }
    }

    /// One batch pass over the project's issues. Fails only with `Busy` or
    /// store errors; tracker failures come back as an aborted session.
    ///
    /// The cycle runs on its own task: dropping the returned future does not
    /// cut it short, and the run lock is held until it really ends.
    pub async fn run_cycle(self: &Arc<Self>, trigger: RunTrigger) -> Result<RunSession, RunError> {
        let cfg = self.current_config();
        let wait = Duration::from_secs(cfg.lock_timeout_s);
        let guard = tokio::time::timeout(wait, Arc::clone(&self.run_lock).lock_owned())
            .await
            .map_err(|_| RunError::Busy)?;

        let this = Arc::clone(self);
        let token = self.token();
        tokio::spawn(async move {
            let _guard = guard;
            let _flags = RunFlags::raise(&this);
            this.run_locked(&cfg, trigger, &token).await
        })
        .await
        .map_err(|e| {
            RunError::Internal(anyhow::anyhow!("run task for {} failed: {e}", self.project))
        })?
    }

    async fn run_locked(
        &self,
        cfg: &Config,
        trigger: RunTrigger,
        token: &CancellationToken,
    ) -> Result<RunSession, RunError> {
        let mut session = RunSession::start(&self.project, trigger);
        info!("run started for {} ({})", self.project, trigger.as_str());

        let filter = cfg.filter();
        let issues = match self
            .tracker
            .list_unresolved(&self.project, &filter, cfg.max_issues_per_run as usize)
            .await
        {
            Ok(issues) => issues,
            Err(e) => {
                if e.is_transient() {
                    warn!("run for {} aborted, tracker unavailable: {e}", self.project);
                } else {
                    error!("run for {} aborted, could not fetch issues: {e}", self.project);
                }
                let mut session = session.finish(RunStatus::Aborted, Some(e.to_string()));
                session.id = self.db.record_run_session(&session)?;
                return Ok(session);
            }
        };

        let selected = filter.select(issues, Utc::now(), cfg.max_issues_per_run as usize);
        session.issues_seen = selected.len() as u32;

        let resolver = Resolver {
            db: Arc::clone(&self.db),
            tracker: Arc::clone(&self.tracker),
            analyzer: Analyzer::new(
                PatternRegistry::builtin()?,
                cfg.confidence_policy(),
                cfg.safety_policy(),
            ),
            policy: cfg.decision_policy(),
            orchestrator: Orchestrator::from_config(&self.project, cfg, self.locks.clone()),
        };

        let mut stopped = false;
        for issue in &selected {
            if token.is_cancelled() {
                info!("run for {} stopped before issue {}", self.project, issue.id);
                stopped = true;
                break;
            }
            match resolver.process_issue(issue, Utc::now()).await {
                Ok(IssueOutcome::Resolved { .. }) => {
                    session.applied += 1;
                    session.resolved += 1;
                }
                Ok(IssueOutcome::Applied { .. }) => session.applied += 1,
                Ok(IssueOutcome::Skipped { .. }) | Ok(IssueOutcome::Busy) => session.skipped += 1,
                Ok(IssueOutcome::Failed { .. }) => session.failed += 1,
                Err(e) => {
                    error!("issue {}: {e:#}", issue.id);
                    session.failed += 1;
                }
            }
        }

        let mut session = if stopped {
            session.finish(RunStatus::Aborted, Some("stopped on request".into()))
        } else {
            session.finish(RunStatus::Completed, None)
        };
        session.id = self.db.record_run_session(&session)?;
        info!(
            "run for {} finished: seen={} applied={} resolved={} skipped={} failed={}",
            self.project,
            session.issues_seen,
            session.applied,
            session.resolved,
            session.skipped,
            session.failed
        );
        Ok(session)
    }

    /// Start continuous mode. Returns `false` if it was already on.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.continuous.swap(true, Ordering::SeqCst) {
            return false;
        }
        let token = self.token();
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_loop(token).await });
        info!("continuous mode started for {}", self.project);
        true
    }

    async fn run_loop(self: Arc<Self>, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                break;
            }
            match self.run_cycle(RunTrigger::Scheduled).await {
                Ok(_) => {}
                Err(RunError::Busy) => {
                    info!("scheduled run for {} skipped, another run is active", self.project)
                }
                Err(e) => error!("scheduled run for {} failed: {e:#}", self.project),
            }
            let minutes = self.current_config().check_interval_minutes;
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(minutes.saturating_mul(60))) => {}
            }
        }
        info!("continuous mode ended for {}", self.project);
    }

    /// Leave continuous mode and ask any active run to stop at the next issue.
    pub fn stop(&self) {
        self.continuous.store(false, Ordering::SeqCst);
        if self.running.load(Ordering::SeqCst) {
            self.stopping.store(true, Ordering::SeqCst);
        }
        let mut token = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        token.cancel();
        *token = CancellationToken::new();
        info!("stop requested for {}", self.project);
    }
}

/// Marks a controller as running until dropped, including on panic.
struct RunFlags<'a> {
    controller: &'a RunController,
}

impl<'a> RunFlags<'a> {
    fn raise(controller: &'a RunController) -> Self {
        controller.running.store(true, Ordering::SeqCst);
        Self { controller }
    }
}

impl Drop for RunFlags<'_> {
    fn drop(&mut self) {
        self.controller.running.store(false, Ordering::SeqCst);
        self.controller.stopping.store(false, Ordering::SeqCst);
    }
}

/// One controller per project, created on first use and then reused.
pub struct ControllerRegistry {
    config: Config,
    db: Arc<Db>,
    tracker: Arc<dyn IssueTracker>,
    locks: WorkingCopyLocks,
    controllers: Mutex<HashMap<String, Arc<RunController>>>,
}

impl ControllerRegistry {
    pub fn new(config: Config, db: Arc<Db>, tracker: Arc<dyn IssueTracker>) -> Self {
        Self {
            config,
            db,
            tracker,
            locks: WorkingCopyLocks::new(),
            controllers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, project: &str, work_dir: Option<&str>) -> Arc<RunController> {
        let mut map = self.controllers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = map.get(project) {
            if let Some(dir) = work_dir {
                if existing.work_dir_override.as_deref() != Some(dir) {
                    warn!(
                        "controller for {project} already exists, ignoring work directory {dir}"
                    );
                }
            }
            return Arc::clone(existing);
        }
        let controller = Arc::new(RunController::new(
            project,
            self.config.clone(),
            work_dir.map(str::to_string),
            Arc::clone(&self.db),
            Arc::clone(&self.tracker),
            self.locks.clone(),
        ));
        map.insert(project.to_string(), Arc::clone(&controller));
        controller
    }

    pub fn get(&self, project: &str) -> Option<Arc<RunController>> {
        self.controllers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(project)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<RunController>> {
        let mut out: Vec<_> = self
            .controllers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| a.project.cmp(&b.project));
        out
    }

    pub fn stop_all(&self) {
        for c in self.all() {
            c.stop();
        }
    }
}
