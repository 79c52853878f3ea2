use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, Path, Query, Request, State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::AppState;
use crate::auth::{
    AuthError, GoogleIdentityProvider, IdentityProvider, TokenService, UserProfile, bearer_token,
};
use crate::cache::{KvStore, MemoryKvStore};
use crate::config::AppConfig;
use crate::conversation::{ConversationEngine, EngineDeps, EngineSettings, ErrorCode, TurnResponse};
use crate::credentials::CredentialRotator;
use crate::grounding::GroundingDecisionEngine;
use crate::history::{HistoryStore, MemoryHistoryStore, PostgresHistoryStore};
use crate::hub::{ChatFrame, ConnectParams, DetailsFrame, RealtimeSyncHub};
use crate::llm::{self, GenerativeProvider, LlmSettings};
use crate::search::{ProductSearchProvider, SearchError, SearchOrchestrator, SerpApiProvider};
use crate::semantic::{Embedder, FastEmbedder, SemanticIndex};
use crate::session::{Message, SessionStore};

/// External backends the service talks to.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub embedder: Arc<dyn Embedder>,
    pub generative: Arc<dyn GenerativeProvider>,
    pub products: Arc<dyn ProductSearchProvider>,
    pub identity: Arc<dyn IdentityProvider>,
    pub history: Arc<dyn HistoryStore>,
    pub cache: Arc<MemoryKvStore>,
}

impl Collaborators {
    /// Production backends as configured.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let settings = LlmSettings::from_config(&config.generative);
        info!(
            name: "llm.config.loaded",
            base_url = %settings.base_url,
            model = %settings.model,
            "LLM configuration loaded"
        );

        let embedder = Arc::new(FastEmbedder::new());
        if let Err(e) = embedder.initialize().await {
            tracing::error!("Failed to initialize embedder: {e}");
        }

        if config.credentials.generative.is_empty() {
            warn!("No generative credentials configured");
        }
        if config.credentials.search.is_empty() {
            warn!("No search credentials configured");
        }

        let history: Arc<dyn HistoryStore> = match &config.persistence.database_url {
            Some(url) => Arc::new(PostgresHistoryStore::new(url).await?),
            None => {
                info!("No database configured, search history kept in memory");
                Arc::new(MemoryHistoryStore::default())
            }
        };

        Ok(Self {
            embedder,
            generative: llm::build_provider(settings)?,
            products: Arc::new(SerpApiProvider::new(&config.search)?),
            identity: Arc::new(GoogleIdentityProvider::new(config.oauth.clone())),
            history,
            cache: Arc::new(MemoryKvStore::new()),
        })
    }
}

/// Wire the service graph around `collaborators`.
pub fn build_state(config: Arc<AppConfig>, collaborators: Collaborators) -> AppState {
    let Collaborators {
        embedder,
        generative,
        products,
        identity,
        history,
        cache,
    } = collaborators;
    let kv: Arc<dyn KvStore> = Arc::<MemoryKvStore>::clone(&cache);

    let index = Arc::new(SemanticIndex::new(
        embedder,
        Duration::from_secs(config.embedding.cache_ttl_secs),
        config.embedding.cache_capacity,
    ));
    let generative_credentials = Arc::new(CredentialRotator::new(
        "generative",
        config.credentials.generative.clone(),
        Arc::clone(&kv),
    ));
    let search_credentials = Arc::new(CredentialRotator::new(
        "search",
        config.credentials.search.clone(),
        Arc::clone(&kv),
    ));
    let search = Arc::new(SearchOrchestrator::new(
        products,
        search_credentials,
        Arc::clone(&index),
        Arc::clone(&kv),
        config.search.clone(),
    ));
    let grounding = Arc::new(GroundingDecisionEngine::new(
        Arc::clone(&index),
        config.grounding.clone(),
    ));
    let sessions = SessionStore::new(config.session.ttl(), config.session.max_messages);

    let engine = Arc::new(ConversationEngine::new(
        EngineDeps {
            sessions: sessions.clone(),
            generative,
            credentials: generative_credentials,
            grounding,
            index,
            search,
            cache: kv,
            history: Arc::clone(&history),
        },
        EngineSettings::from_config(&config),
    ));
    let tokens = Arc::new(TokenService::new(&config.security));
    let hub = Arc::new(RealtimeSyncHub::new(
        engine,
        Arc::clone(&tokens),
        &config.rate_limit,
        config.hub.clone(),
    ));

    AppState {
        hub,
        sessions,
        tokens,
        identity,
        history,
        cache,
        config,
    }
}

/// All routes and layers, ready to serve.
pub fn router(state: AppState) -> Router {
    let config = Arc::clone(&state.config);
    let timeout_duration = Duration::from_secs(config.server.request_timeout_secs.max(1));

    let bounded = Router::new()
        .route("/health", get(health))
        .route("/api/product-details", post(product_details_handler))
        .route(
            "/api/sessions/{id}",
            axum::routing::delete(delete_session_handler),
        )
        .route("/api/sessions/{id}/messages", get(session_messages_handler))
        .route("/api/auth/google", post(google_login_handler))
        .layer(axum::middleware::from_fn(
            move |req: Request, next: Next| {
                let duration = timeout_duration;
                async move {
                    match tokio::time::timeout(duration, next.run(req)).await {
                        Ok(res) => res,
                        Err(_) => {
                            (StatusCode::REQUEST_TIMEOUT, "Request timed out").into_response()
                        }
                    }
                }
            },
        ));

    // Chat turns are bounded by the generative and search timeouts instead.
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/chat", post(chat_handler))
        .merge(bounded)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.server.allowed_origins))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter(|o| o.as_str() != "*")
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

/// Periodic expiry of sessions, cache entries and limiter state.
pub fn spawn_cleanup(state: &AppState) -> tokio::task::JoinHandle<()> {
    let period = Duration::from_secs(state.config.session.cleanup_interval_secs.max(1));
    let sessions = state.sessions.clone();
    let cache = Arc::clone(&state.cache);
    let hub = Arc::clone(&state.hub);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let sessions_removed = sessions.cleanup_expired();
            let cache_removed = cache.purge_expired();
            hub.cleanup();
            debug!(sessions_removed, cache_removed, "Cleanup pass finished");
        }
    })
}

/// Start the Axum server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>) -> anyhow::Result<()> {
    let collaborators = Collaborators::from_config(&config).await?;
    let state = build_state(Arc::clone(&config), collaborators);
    let cleanup = spawn_cleanup(&state);
    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    cleanup.abort();
    info!(name: "server.stopped", "Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// API Handlers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

/// User behind the bearer header, if the token verifies.
fn caller(state: &AppState, headers: &HeaderMap) -> Result<Option<String>, Response> {
    let Some(token) = bearer_token(headers) else {
        return Ok(None);
    };
    state
        .tokens
        .verify_access_token(token)
        .map(|ctx| Some(ctx.user_id))
        .map_err(|e| error_response(StatusCode::UNAUTHORIZED, e.to_string()))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    sessions: usize,
    connections: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.sessions.len(),
        connections: state.hub.connection_count(),
    })
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    session_id: Option<String>,
    last_seen: Option<i64>,
    access_token: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let token = query
        .access_token
        .as_deref()
        .or_else(|| bearer_token(&headers));
    let user_id = match token.map(|t| state.tokens.verify_access_token(t)) {
        Some(Ok(ctx)) => Some(ctx.user_id),
        Some(Err(e)) => return error_response(StatusCode::UNAUTHORIZED, e.to_string()),
        None => None,
    };

    let params = ConnectParams {
        user_id,
        session_id: query.session_id,
        last_seen: query.last_seen,
    };
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| handle_socket(socket, hub, params))
}

async fn handle_socket(socket: WebSocket, hub: Arc<RealtimeSyncHub>, params: ConnectParams) {
    let (mut sink, mut stream) = socket.split();
    let (id, mut rx) = hub.connect(params);

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode outbound frame: {e}");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => hub.handle_frame(id, text.as_str()),
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection = %id, "Socket error: {e}");
                    break;
                }
            },
        }
    }

    hub.disconnect(id);
    writer.abort();
}

async fn chat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut frame): Json<ChatFrame>,
) -> Response {
    if frame.access_token.is_none() {
        frame.access_token = bearer_token(&headers).map(str::to_string);
    }

    let response = state.hub.chat(frame).await;
    let status = match response.error_code() {
        Some(ErrorCode::RateLimited) => StatusCode::TOO_MANY_REQUESTS,
        Some(ErrorCode::BadRequest) => StatusCode::BAD_REQUEST,
        _ => StatusCode::OK,
    };

    let retry_after = match &response {
        TurnResponse::Error(e) => e.retry_after,
        _ => None,
    };
    let mut res = (status, Json(response)).into_response();
    if let Some(secs) = retry_after
        && let Ok(value) = HeaderValue::from_str(&secs.to_string())
    {
        res.headers_mut().insert(header::RETRY_AFTER, value);
    }
    res
}

async fn product_details_handler(
    State(state): State<AppState>,
    Json(frame): Json<DetailsFrame>,
) -> Response {
    if frame.page_token.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "page_token is required");
    }
    match state.hub.product_details(&frame).await {
        Ok(details) => Json(details).into_response(),
        Err(SearchError::NotFound) => error_response(StatusCode::NOT_FOUND, "product not found"),
        Err(SearchError::NoCredentials) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "product search unavailable")
        }
        Err(e) => {
            warn!("Product details failed: {e}");
            error_response(StatusCode::BAD_GATEWAY, "product details unavailable")
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    since: Option<i64>,
}

async fn session_messages_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
    headers: HeaderMap,
) -> Response {
    let user = match caller(&state, &headers) {
        Ok(user) => user,
        Err(res) => return res,
    };
    let Some(session) = state.sessions.get(&id) else {
        return error_response(StatusCode::NOT_FOUND, "session not found");
    };
    if !session.is_accessible_by(user.as_deref()) {
        return error_response(StatusCode::FORBIDDEN, "session belongs to another user");
    }

    let messages: Vec<Message> = match query.since {
        Some(since) => state.sessions.messages_since(&id, since),
        None => state.sessions.messages(&id),
    };
    Json(messages).into_response()
}

async fn delete_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let user = match caller(&state, &headers) {
        Ok(user) => user,
        Err(res) => return res,
    };
    let Some(session) = state.sessions.get(&id) else {
        return error_response(StatusCode::NOT_FOUND, "session not found");
    };
    if !session.is_accessible_by(user.as_deref()) {
        return error_response(StatusCode::FORBIDDEN, "session belongs to another user");
    }

    if state.sessions.clear(&id) {
        info!(session_id = %id, "Session cleared");
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, "session not found")
    }
}

#[derive(Debug, Deserialize)]
struct GoogleLoginRequest {
    code: String,
    redirect_uri: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    access_token: String,
    user: UserProfile,
}

async fn google_login_handler(
    State(state): State<AppState>,
    Json(req): Json<GoogleLoginRequest>,
) -> Response {
    let profile = match state
        .identity
        .exchange_code(&req.code, &req.redirect_uri)
        .await
    {
        Ok(profile) => profile,
        Err(e) => return auth_error_response(&e),
    };

    match state.tokens.issue_access_token(&profile) {
        Ok(access_token) => {
            info!(user_id = %profile.id, "User signed in");
            Json(LoginResponse {
                access_token,
                user: profile,
            })
            .into_response()
        }
        Err(e) => auth_error_response(&e),
    }
}

fn auth_error_response(e: &AuthError) -> Response {
    let status = match e {
        AuthError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
        AuthError::Transport(_) => StatusCode::BAD_GATEWAY,
        AuthError::Expired
        | AuthError::InvalidToken(_)
        | AuthError::SessionMismatch(_)
        | AuthError::Provider(_) => StatusCode::UNAUTHORIZED,
    };
    warn!("Authentication failed: {e}");
    error_response(status, e.to_string())
}
