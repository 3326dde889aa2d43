//! SAML 2.0 Web Browser SSO service provider.
//!
//! Serves a public login page, sends users to the IdP with an AuthnRequest,
//! validates the signed assertion posted back and binds the asserted identity
//! to a server-side session that guards the dashboard.

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    routing::{get, post},
};
use clap::Parser;
use tokio_util::task::TaskTracker;
use tower_cookies::CookieManagerLayer;
use tower_http::{limit::RequestBodyLimitLayer, services::ServeDir, trace::TraceLayer};

mod auth;
mod config;
mod jobs;
mod middleware;
mod observability;
mod routes;
mod saml;

#[cfg(test)]
mod tests;

use auth::{AccessGate, MemorySessionStore, SessionBinder, SharedSessionStore};
use saml::{ReplayCache, SamlAuthenticator, TrustConfig, TrustState};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::AppConfig>,
    pub authenticator: Arc<SamlAuthenticator>,
    pub binder: SessionBinder,
    pub gate: AccessGate,
    pub store: SharedSessionStore,
    pub replay: Arc<ReplayCache>,
    /// Background tasks that shutdown waits for.
    pub task_tracker: TaskTracker,
}

impl AppState {
    /// Wire the components together around an in-memory session store.
    pub fn new(config: config::AppConfig, trust: TrustState) -> Self {
        let store: SharedSessionStore = Arc::new(MemorySessionStore::new());
        let replay = Arc::new(ReplayCache::new());

        let authenticator = Arc::new(SamlAuthenticator::new(
            trust,
            replay.clone(),
            store.clone(),
            &config.saml,
        ));

        let duration = i64::try_from(config.session.duration_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX);
        let binder = SessionBinder::new(store.clone(), duration);
        let gate = AccessGate::new(binder.clone());

        Self {
            config: Arc::new(config),
            authenticator,
            binder,
            gate,
            store,
            replay,
            task_tracker: TaskTracker::new(),
        }
    }
}

/// CLI arguments for the SAML service provider
#[derive(Parser, Debug)]
#[command(version, about = "SAML 2.0 single sign-on service provider", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (defaults to ./saml-sso.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the server (default)
    Serve,
    /// Validate the configuration and IdP metadata, then exit
    Check,
    /// Print this service provider's SAML metadata
    SpMetadata,
}

pub fn build_app(config: &config::AppConfig, state: AppState) -> Router {
    let protected = Router::new()
        .route("/dashboard", get(routes::pages::dashboard))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_session,
        ));

    let mut app = Router::new()
        .route("/", get(routes::pages::login_page))
        .route("/login", post(routes::auth::login))
        .route(&config.saml.callback_path, post(routes::auth::callback))
        .route(
            "/logout",
            get(routes::auth::logout).post(routes::auth::logout),
        )
        .route("/saml/metadata", get(routes::metadata::sp_metadata))
        .route("/health", get(routes::health::health_check))
        .merge(protected);

    if let Some(dir) = &config.server.static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(CookieManagerLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.server.body_limit_bytes))
        .with_state(state)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Some(Command::Check) => run_check(args.config.as_deref()).await,
        Some(Command::SpMetadata) => run_sp_metadata(args.config.as_deref()).await,
        Some(Command::Serve) | None => run_server(args.config.as_deref()).await,
    }
}

fn load_config(explicit_path: Option<&str>) -> config::AppConfig {
    let path = explicit_path.unwrap_or(config::DEFAULT_CONFIG_FILE);

    match config::AppConfig::from_file(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", path, e);
            std::process::exit(1);
        }
    }
}

/// Load the configuration and trust material without starting the server.
async fn run_check(config_path: Option<&str>) {
    let config = load_config(config_path);

    match TrustConfig::load(&config.saml).await {
        Ok(trust) => {
            println!("Configuration OK");
            println!("  IdP entity ID:    {}", trust.descriptor.idp_entity_id);
            println!("  IdP SSO endpoint: {}", trust.descriptor.sso_endpoint);
            println!("  SP entity ID:     {}", trust.sp_entity_id);
            println!(
                "  Signed requests:  {}",
                trust.request_signing_key().is_some()
            );
            for warning in config.warnings() {
                println!("  Warning: {warning}");
            }
        }
        Err(e) => {
            eprintln!("SAML trust configuration is invalid: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run_sp_metadata(config_path: Option<&str>) {
    let config = load_config(config_path);

    let trust = match TrustConfig::load(&config.saml).await {
        Ok(trust) => trust,
        Err(e) => {
            eprintln!("SAML trust configuration is invalid: {}", e);
            std::process::exit(1);
        }
    };

    match trust.sp_metadata_xml() {
        Some(xml) => println!("{xml}"),
        None => {
            eprintln!("SP metadata requires saml.acs_url to be configured");
            std::process::exit(1);
        }
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = load_config(config_path);

    if let Err(e) = observability::init_tracing(&config.observability) {
        eprintln!("{e}");
        std::process::exit(1);
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        sp_entity_id = %config.saml.sp_entity_id,
        callback_path = %config.saml.callback_path,
        "Starting SAML service provider"
    );
    for warning in config.warnings() {
        tracing::warn!("{warning}");
    }

    // A failed load leaves the server up so /health can report it; SAML
    // endpoints answer 503 until the deployment is fixed.
    let trust = TrustState::initialize(&config.saml).await;
    let state = AppState::new(config.clone(), trust);

    let worker = jobs::start_session_cleanup_worker(
        state.store.clone(),
        state.replay.clone(),
        state.authenticator.request_ttl(),
        Duration::from_secs(config.session.cleanup_interval_secs),
    );
    let cleanup_handle = state.task_tracker.spawn(worker);

    let task_tracker = state.task_tracker.clone();
    let app = build_app(&config, state);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, address = %bind_addr, "Failed to bind to address");
            std::process::exit(1);
        }
    };

    tracing::info!("Server listening on http://{}", bind_addr);

    // Graceful shutdown: wait for SIGINT/SIGTERM, then wait for background tasks
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(task_tracker, cleanup_handle))
        .await
    {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}

async fn shutdown_signal(task_tracker: TaskTracker, cleanup_handle: tokio::task::JoinHandle<()>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, waiting for background tasks to complete...");

    // Close the task tracker to prevent new tasks from being spawned
    task_tracker.close();

    // The cleanup worker loops forever; stop it so the tracker can drain.
    cleanup_handle.abort();

    let wait_result = tokio::time::timeout(Duration::from_secs(30), task_tracker.wait()).await;

    match wait_result {
        Ok(()) => tracing::info!("All background tasks completed"),
        Err(_) => {
            tracing::warn!("Timeout waiting for background tasks, some may not have completed")
        }
    }

    tracing::info!("Shutdown complete");
}
