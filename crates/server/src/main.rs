//! Outreach Server
//!
//! Axum server exposing the pipeline engine from crates/core, plus a
//! headless `run` command for driving a single batch from the terminal.

use axum::{routing::get, Json, Router};
use clap::{Parser, Subcommand};
use outreach_core::config::{PipelineConfig, Prospect};
use outreach_core::state::OutreachDb;
use outreach_core::swarm::{
    DailySummary, EventBus, PipelineEventKind, PipelineServices, RunRegistry, RunStatus,
    WeeklyReview,
};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;

mod api;
mod settings;

use settings::Settings;

/// Application state
pub struct AppState {
    pub registry: RunRegistry,
    /// Shared database for the audit endpoints
    pub db: OutreachDb,
    pub settings: Settings,
}

impl AppState {
    pub fn new(db: OutreachDb, settings: Settings) -> Self {
        let services = PipelineServices::builtin(&db, settings.output_dir.clone());
        let bus = Arc::new(EventBus::new(settings.queue_capacity));
        Self {
            registry: RunRegistry::new(services, bus),
            db,
            settings,
        }
    }
}

pub type SharedState = Arc<AppState>;

#[derive(Parser, Clone)]
#[command(author, version, about = "Outreach - sales outreach pipeline engine")]
struct Args {
    /// SQLite database file (overrides settings)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Clone)]
enum CliCommand {
    /// Start the HTTP server (default)
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one batch in the foreground and print its events
    Run {
        /// Batch number (>= 1)
        #[arg(short, long)]
        batch: u32,
        /// JSON file with an array of prospects
        #[arg(long)]
        prospects: Option<PathBuf>,
        /// Stop at the approval gate and ask on stdin
        #[arg(long)]
        require_approval: bool,
    },
    /// Print today's summary, or the last week's review, as JSON
    Summary {
        #[arg(long)]
        weekly: bool,
    },
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Outreach API",
        version = "1.0.0",
        description = "API for the outreach pipeline engine"
    ),
    paths(
        api::pipeline::start_run,
        api::pipeline::list_runs,
        api::pipeline::get_run,
        api::pipeline::cancel_run,
        api::pipeline::submit_approval,
        api::pipeline::skip_approval,
        api::pipeline::list_tasks,
        api::pipeline::list_errors,
        api::agent::run_action,
        api::agent::daily_summary,
        api::agent::weekly_review,
        get_config
    ),
    components(
        schemas(
            api::ApiResponse,
            api::pipeline::StartRunRequest,
            api::pipeline::ApprovalRequest,
            api::agent::AgentActionRequest,
            Settings
        )
    ),
    tags(
        (name = "pipeline", description = "Pipeline runs, approval and audit trail"),
        (name = "agent", description = "One-off actions and activity summaries"),
        (name = "config", description = "Server settings")
    )
)]
struct ApiDoc;

/// Effective server settings
#[utoipa::path(
    get,
    path = "/api/v1/config",
    tag = "config",
    responses((status = 200, description = "Current settings", body = Settings))
)]
async fn get_config(
    axum::extract::State(state): axum::extract::State<SharedState>,
) -> Json<Settings> {
    Json(state.settings.clone())
}

async fn serve_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Router with every API route
pub fn app(state: SharedState) -> Router {
    Router::new()
        .nest("/api/v1/pipeline", api::pipeline_routes())
        .nest("/api/v1/agent", api::agent_routes())
        .route("/api/v1/config", get(get_config))
        .route("/api/v1/openapi.json", get(serve_openapi))
        .with_state(state)
}

async fn serve(state: SharedState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "outreach server listening");
    tracing::info!("pipeline API at /api/v1/pipeline (start, runs, runs/:id/stream, errors)");
    tracing::info!("agent API at /api/v1/agent (action, daily-summary, weekly-review)");

    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn load_prospects(path: &Path) -> anyhow::Result<Vec<Prospect>> {
    use anyhow::Context;
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid prospects in {}", path.display()))
}

/// Headless run: start one batch, print every event as a JSON line
async fn run_batch(
    state: SharedState,
    batch: u32,
    prospects: Option<PathBuf>,
    require_approval: bool,
) -> anyhow::Result<()> {
    let mut config = state.settings.pipeline_config(PipelineConfig::default());
    if let Some(path) = prospects {
        config.prospects = load_prospects(&path).await?;
    }
    config.require_approval = config.require_approval || require_approval;

    let snapshot = state.registry.start_run(batch, config)?;
    let run_id = snapshot.run_id;
    let mut subscription = state.registry.subscribe(&run_id)?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    while let Some(event) = subscription.recv().await {
        println!("{}", serde_json::to_string(&event)?);

        if event.kind == PipelineEventKind::ApprovalNeeded {
            eprintln!("Approve all drafts of batch {}? [y/N]", batch);
            let answer = stdin.next_line().await?.unwrap_or_default();
            if answer.trim().eq_ignore_ascii_case("y") {
                state.registry.skip_approval(&run_id);
            } else {
                state.registry.cancel_run(&run_id);
            }
        }
    }

    let done = match state.registry.handle(&run_id) {
        Some(handle) => handle.wait_for_terminal().await,
        None => anyhow::bail!("run {} disappeared", run_id),
    };
    match done.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Cancelled => {
            eprintln!("Run {} cancelled", run_id);
            Ok(())
        }
        _ => {
            let reason = done
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| done.status.as_str().to_string());
            anyhow::bail!("run {} failed: {}", run_id, reason)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut settings = Settings::load().await;
    if let Some(db) = &args.db {
        settings.db_path = db.clone();
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let db = OutreachDb::open_at(&settings.db_path)?;

    match args.command {
        Some(CliCommand::Run {
            batch,
            prospects,
            require_approval,
        }) => {
            let state = Arc::new(AppState::new(db, settings));
            run_batch(state, batch, prospects, require_approval).await
        }
        Some(CliCommand::Summary { weekly }) => {
            let now = chrono::Utc::now();
            let json = if weekly {
                serde_json::to_string_pretty(&WeeklyReview::collect(&db, &[], now)?)?
            } else {
                serde_json::to_string_pretty(&DailySummary::collect(&db, &[], now.date_naive())?)?
            };
            println!("{}", json);
            Ok(())
        }
        Some(CliCommand::Serve { port }) => {
            if let Some(port) = port {
                settings.port = port;
            }
            let port = settings.port;
            serve(Arc::new(AppState::new(db, settings)), port).await
        }
        None => {
            let port = settings.port;
            serve(Arc::new(AppState::new(db, settings)), port).await
        }
    }
}
