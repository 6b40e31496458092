mod logging;
mod routes;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use solver_core::{config::Config, db::Db, scheduler::ControllerRegistry, RunTrigger};
use solver_sentry::SentryClient;
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::logging::LogRing;
use crate::routes::*;

/// Watches Sentry for known error patterns and commits fixes on branches.
#[derive(Parser, Debug)]
#[command(name = "sentry-solver", version)]
struct Cli {
    /// Sentry project slug; defaults to SENTRY_SOLVER_SENTRY_PROJECT_SLUG.
    #[arg(long)]
    project: Option<String>,

    /// Working copy to apply fixes in; defaults to SENTRY_SOLVER_WORK_DIRECTORY.
    #[arg(long)]
    work_dir: Option<String>,

    /// Run a single cycle and exit.
    #[arg(long, conflicts_with = "serve")]
    once: bool,

    /// Serve the control API; continuous mode is started per project on request.
    #[arg(long)]
    serve: bool,
}

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub config: Config,
    pub db: Arc<Db>,
    pub registry: Arc<ControllerRegistry>,
    pub sentry: Arc<SentryClient>,
    pub start_time: Instant,
    pub log_tx: broadcast::Sender<String>,
    pub log_ring: LogRing,
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    let (log_tx, log_ring) = logging::init(&config.log_level);

    if let Some(dir) = &cli.work_dir {
        config.work_directory = dir.clone();
    }

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir))?;
    let db_path = config.db_path();
    let mut db = Db::open(&db_path.to_string_lossy())?;
    db.migrate()?;
    config.seed_db(&db)?;
    let db = Arc::new(db);

    let sentry = Arc::new(SentryClient::from_config(&config)?);
    match solver_sentry::verify_access(&sentry).await {
        Ok(n) => info!("sentry reachable, {n} projects visible"),
        Err(e) => warn!("{e:#}"),
    }

    let registry = Arc::new(ControllerRegistry::new(
        config.clone(),
        Arc::clone(&db),
        sentry.clone(),
    ));
    let project = cli
        .project
        .clone()
        .or_else(|| Some(config.sentry_project.clone()).filter(|p| !p.is_empty()));

    if cli.once {
        let project = project.context("--project or SENTRY_SOLVER_SENTRY_PROJECT_SLUG required")?;
        let controller = registry.get_or_create(&project, cli.work_dir.as_deref());
        let session = controller
            .run_cycle(RunTrigger::Manual)
            .await
            .map_err(|e| anyhow::anyhow!("{e:#}"))?;
        println!("{}", serde_json::to_string_pretty(&session)?);
        return Ok(());
    }

    if !cli.serve {
        let project = project.context("--project or SENTRY_SOLVER_SENTRY_PROJECT_SLUG required")?;
        registry
            .get_or_create(&project, cli.work_dir.as_deref())
            .start();
        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        registry.stop_all();
        return Ok(());
    }

    if let Some(project) = &project {
        registry.get_or_create(project, cli.work_dir.as_deref());
    }

    let state = Arc::new(AppState {
        config: config.clone(),
        db,
        registry: Arc::clone(&registry),
        sentry,
        start_time: Instant::now(),
        log_tx,
        log_ring,
    });

    let app = Router::new()
        // Health
        .route("/api/health", get(health))
        // Sentry
        .route("/api/projects", get(list_projects))
        // Solver control
        .route("/api/solver/start", post(solver_start))
        .route("/api/solver/stop", post(solver_stop))
        .route("/api/solver/run-once", post(solver_run_once))
        .route("/api/solver/status", get(solver_status))
        // Records
        .route("/api/issues", get(list_issues))
        .route("/api/issues/:id/fixes", get(list_issue_fixes))
        .route("/api/sessions", get(list_sessions))
        // Settings
        .route("/api/settings/git", get(get_git_settings).put(put_git_settings))
        .route(
            "/api/settings/filters",
            get(get_filter_settings).put(put_filter_settings),
        )
        // Logs
        .route("/api/logs", get(sse_logs))
        .route("/api/logs/recent", get(recent_logs))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.web_bind, config.web_port);
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("signal handler failed: {e}");
            }
            info!("shutting down");
            registry.stop_all();
        })
        .await?;

    Ok(())
}
