pub mod error;
mod handlers;
mod web;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::session::{Session, SessionId, SessionRegistry};
use crate::shutdown::ShutdownCoordinator;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionRegistry,
    pub shutdown: ShutdownCoordinator,
    /// Capacity of each session's outbound message channel.
    pub channel_capacity: usize,
}

impl AppState {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

    pub fn new(sessions: SessionRegistry) -> Self {
        Self {
            sessions,
            shutdown: ShutdownCoordinator::new(),
            channel_capacity: Self::DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

pub(crate) fn parse_session_id(raw: &str) -> Result<SessionId, error::ApiError> {
    raw.parse()
        .map_err(|_| error::ApiError::SessionNotFound(raw.to_string()))
}

pub(crate) fn get_session(
    sessions: &SessionRegistry,
    raw: &str,
) -> Result<Arc<Session>, error::ApiError> {
    let id = parse_session_id(raw)?;
    sessions
        .lookup(id)
        .ok_or_else(|| error::ApiError::SessionNotFound(raw.to_string()))
}

/// Configuration for the HTTP/WS router.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    /// Origins allowed to make cross-origin requests. Empty disables CORS.
    pub cors_origins: Vec<String>,
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let terminal_routes = Router::new()
        .route("/{id}", get(session_get).delete(session_kill))
        .route("/{id}/input", post(input))
        .route("/{id}/resize", post(resize))
        .route("/{id}/ws", get(terminal_ws));

    let router = Router::new()
        .route("/health", get(health))
        .route("/terminal", get(session_list).post(session_create))
        .nest("/terminal", terminal_routes)
        .fallback(web::web_asset)
        .with_state(state)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static(
                "default-src 'self'; script-src 'self' https://cdn.jsdelivr.net; \
                 style-src 'self' https://cdn.jsdelivr.net; connect-src 'self'; \
                 img-src 'self' data:; frame-ancestors 'none'",
            ),
        ));

    if config.cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE]),
        )
    }
}
