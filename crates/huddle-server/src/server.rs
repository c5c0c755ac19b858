//! `HuddleServer`: axum router, listener and the shared handler state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use huddle_admin::GroupAdministration;
use huddle_core::{GroupResultId, ParticipantId};
use huddle_dispatch::GroupDispatcherRegistry;
use huddle_settings::{HuddleSettings, ServerSettings, StoreSettings};
use huddle_store::{ConnectionConfig, GroupStore};
use huddle_telemetry::{TelemetryConfig, init_telemetry};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::Result;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::run_channel_session;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Persisted group membership.
    pub store: GroupStore,
    /// Live dispatchers, one per group with an open channel.
    pub dispatchers: GroupDispatcherRegistry,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Outbound queue capacity per channel.
    pub channel_buffer: usize,
    /// Largest accepted inbound frame.
    pub max_frame_bytes: usize,
    /// When the server started.
    pub start_time: Instant,
}

/// The group channel server.
pub struct HuddleServer {
    config: ServerSettings,
    state: AppState,
    admin: GroupAdministration,
}

impl HuddleServer {
    /// Server over `store` with its own shutdown token.
    pub fn new(config: ServerSettings, store: GroupStore) -> Self {
        Self::with_shutdown(config, store, CancellationToken::new())
    }

    /// Server over `store` that stops when `shutdown` is cancelled.
    pub fn with_shutdown(config: ServerSettings, store: GroupStore, shutdown: CancellationToken) -> Self {
        let dispatchers = GroupDispatcherRegistry::new(store.clone());
        let admin = GroupAdministration::new(store.clone(), dispatchers.clone());
        let state = AppState {
            store,
            dispatchers,
            shutdown: Arc::new(ShutdownCoordinator::with_token(shutdown)),
            channel_buffer: config.channel_buffer,
            max_frame_bytes: config.max_frame_bytes,
            start_time: Instant::now(),
        };
        Self { config, state, admin }
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route(
                "/groups/{group_id}/participants/{participant_id}/channel",
                get(channel_handler),
            )
            .with_state(self.state.clone())
    }

    /// Group administration sharing this server's store and dispatchers.
    pub fn admin(&self) -> &GroupAdministration {
        &self.admin
    }

    /// Live dispatchers.
    pub fn dispatchers(&self) -> &GroupDispatcherRegistry {
        &self.state.dispatchers
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerSettings {
        &self.config
    }

    /// Bind the configured address and serve in a background task until
    /// shutdown. Port `0` picks a free port; the bound address is returned.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        let router = self.router();
        let token = self.state.shutdown.token();

        let handle = tokio::spawn(async move {
            let serving = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serving.await {
                error!(error = %e, "server stopped with error");
            }
        });
        info!(%local_addr, "huddle server listening");
        Ok((local_addr, handle))
    }
}

/// Open the store described by `settings`, creating parent directories
/// for a file database.
pub fn open_store(settings: &StoreSettings) -> Result<GroupStore> {
    if settings.is_in_memory() {
        return Ok(GroupStore::open_in_memory()?);
    }
    let path = settings.resolved_db_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let config = ConnectionConfig {
        pool_size: settings.pool_size,
        busy_timeout_ms: settings.busy_timeout_ms,
    };
    Ok(GroupStore::open(&path, &config)?)
}

/// Install telemetry, open the store and serve until `shutdown` is
/// cancelled. Open channel sessions get a bounded grace period to send
/// their Close frames before this returns.
pub async fn serve(settings: &HuddleSettings, shutdown: CancellationToken) -> Result<()> {
    let telemetry = TelemetryConfig::from_names(
        &settings.logging.level,
        settings
            .logging
            .modules
            .iter()
            .map(|(module, level)| (module.as_str(), level.as_str())),
        settings.logging.json,
    );
    let _ = init_telemetry(&telemetry);

    let store = open_store(&settings.store)?;
    let server = HuddleServer::with_shutdown(settings.server.clone(), store, shutdown);
    let (_, handle) = server.listen().await?;
    if let Err(e) = handle.await {
        warn!(error = %e, "server task ended abnormally");
    }
    server.shutdown().graceful_shutdown(None).await;
    info!("huddle server stopped");
    Ok(())
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.start_time, state.dispatchers.len()))
}

/// GET /groups/{group_id}/participants/{participant_id}/channel
///
/// Upgrades only for an active member of the group.
async fn channel_handler(
    ws: WebSocketUpgrade,
    Path((group_id, participant_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Response {
    let group_id = GroupResultId::from_raw(group_id);
    let participant_id = ParticipantId::from_raw(participant_id);

    match state.store.get_group(&group_id) {
        Ok(Some(group)) if group.is_active_member(&participant_id) => {}
        Ok(_) => {
            warn!(group_id = %group_id, participant_id = %participant_id, "channel refused, not an active member");
            return StatusCode::FORBIDDEN.into_response();
        }
        Err(e) => {
            error!(group_id = %group_id, error = %e, "failed to load group for channel");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    let max_frame_bytes = state.max_frame_bytes;
    let shutdown = state.shutdown.clone();
    ws.max_message_size(max_frame_bytes)
        .on_upgrade(move |socket| async move {
            let session = tokio::spawn(run_channel_session(socket, group_id, participant_id, state));
            shutdown.register_task(session);
        })
        .into_response()
}
