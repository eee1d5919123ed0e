//! The hive session daemon: supervises agent processes and serves them over a
//! bearer-authenticated localhost HTTP API.

mod adapters;
mod api;
mod app;
mod domain;
mod ports;
mod stream;
pub mod telemetry;
pub mod token;

pub use adapters::process::OsProcessControl;
pub use adapters::stores::{FileSessionStore, InMemorySessionStore};
pub use app::approvals::ApprovalGate;
pub use app::supervisor::{
    ProviderRegistry, RestoreReport, SessionSupervisor, SupervisorConfig, SupervisorError,
};
pub use ports::{ProcessControl, SessionStore, Signal};

use anyhow::{anyhow, bail, Context, Result as AnyResult};
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use hive_protocol::HivePaths;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use telemetry::LogHandle;
use token::{AuthToken, TokenStore};
use tokio::fs;
use tokio::net::TcpListener;
use tokio::signal::ctrl_c;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Clone)]
struct AppState {
    supervisor: Arc<SessionSupervisor>,
    token: Arc<AuthToken>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl AppState {
    fn new(
        supervisor: Arc<SessionSupervisor>,
        token: AuthToken,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            supervisor,
            token: Arc::new(token),
            shutdown: Arc::new(shutdown),
        }
    }

    fn supervisor(&self) -> &Arc<SessionSupervisor> {
        &self.supervisor
    }

    fn token(&self) -> &AuthToken {
        &self.token
    }

    fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn shutdown_watch(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub listen: SocketAddr,
    /// Directory holding the token, the session index and the logs.
    pub home: PathBuf,
    /// Extra providers as `NAME=COMMAND`, overriding built-ins of the same
    /// name.
    pub providers: Vec<String>,
    pub subscriber_capacity: usize,
    pub history_limit: usize,
    pub kill_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        let supervisor = SupervisorConfig::default();
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7717)),
            home: PathBuf::from("hive"),
            providers: Vec::new(),
            subscriber_capacity: supervisor.subscriber_capacity,
            history_limit: supervisor.history_limit,
            kill_grace: supervisor.kill_grace,
        }
    }
}

/// Builds the provider table from the built-ins plus `NAME=COMMAND`
/// overrides.
pub fn provider_registry(overrides: &[String]) -> AnyResult<ProviderRegistry> {
    let mut registry = ProviderRegistry::with_defaults();
    for spec in overrides {
        let (name, command) = ProviderRegistry::parse_override(spec)
            .map_err(|err| anyhow!("invalid provider override: {err}"))?;
        registry.register(name, command);
    }
    Ok(registry)
}

fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/v1/sessions",
            get(api::list_sessions).post(api::start_session),
        )
        .route("/v1/sessions/:id", get(api::get_session))
        .route("/v1/sessions/:id/kill", post(api::kill_session))
        .route("/v1/sessions/:id/interrupt", post(api::interrupt_session))
        .route("/v1/sessions/:id/exit", post(api::mark_exited))
        .route("/v1/sessions/:id/send", post(api::send_message))
        .route("/v1/sessions/:id/tail", get(api::tail))
        .route("/v1/sessions/:id/events", get(api::events))
        .route("/v1/sessions/:id/items", get(api::items))
        .route(
            "/v1/sessions/:id/approvals",
            get(api::list_approvals).post(api::decide_approval),
        )
        .route(
            "/v1/sessions/:id/approval",
            get(api::list_approvals).post(api::decide_approval),
        )
        .route("/shutdown", post(api::shutdown))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            api::require_token,
        ));

    Router::new()
        .route("/health", get(api::health))
        .merge(protected)
        .with_state(state)
}

pub async fn run(settings: Settings, log: &LogHandle) -> AnyResult<()> {
    if !settings.listen.ip().is_loopback() {
        bail!(
            "refusing to listen on {}: the control API is loopback-only",
            settings.listen
        );
    }

    let paths = HivePaths::new(&settings.home);
    fs::create_dir_all(paths.root())
        .await
        .with_context(|| format!("creating {}", paths.root().display()))?;
    let token = TokenStore::load_or_create(&paths.token()).context("preparing auth token")?;

    let config = SupervisorConfig {
        subscriber_capacity: settings.subscriber_capacity,
        history_limit: settings.history_limit,
        kill_grace: settings.kill_grace,
        ..SupervisorConfig::default()
    };
    let store = Arc::new(FileSessionStore::new(paths.sessions()));
    let supervisor = Arc::new(SessionSupervisor::new(
        store.clone(),
        Arc::new(OsProcessControl::new()),
        Arc::new(ApprovalGate::new()),
        provider_registry(&settings.providers)?,
        config,
    ));
    if let Err(err) = supervisor.restore().await {
        warn!(error = %format!("{err:#}"), "failed to restore session index");
        let moved = store
            .quarantine()
            .await
            .context("setting aside unreadable session index")?;
        warn!(path = %moved.display(), "unreadable session index moved aside");
    }

    let listener = TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("binding {}", settings.listen))?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = AppState::new(supervisor.clone(), token, shutdown_tx);
    // Signals go through the same watch so open streams end with the server.
    let on_signal = state.clone();
    let signals = tokio::spawn(async move {
        shutdown_signal().await;
        on_signal.request_shutdown();
    });
    let app = router(state);

    info!(
        "listening" = %settings.listen,
        "home" = %paths.root().display(),
        "log" = ?log.destination(),
        "version" = hive_version::hive_version(),
        "build_target" = hive_version::hive_target_triple(),
        "msg" = "hive daemon started"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(stream::shutdown_requested(shutdown_rx))
        .await
        .context("serving control API")?;
    signals.abort();

    supervisor.shutdown().await?;
    info!("msg" = "hive daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let interrupt = async {
        if ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(%err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
    info!("msg" = "shutdown signal received");
}
