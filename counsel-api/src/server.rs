use anyhow::Result;
use axum::{
    extract::Extension,
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing;

use crate::auth;
use crate::handlers;
use crate::state::AppState;
use crate::websocket;

fn cors_layer(origins: Option<&str>) -> CorsLayer {
    match origins {
        Some(origins) => {
            let mut cors = CorsLayer::new();
            for origin in origins.split(',').map(|s| s.trim()) {
                if let Ok(parsed) = origin.parse::<axum::http::HeaderValue>() {
                    cors = cors.allow_origin(parsed);
                }
            }
            cors.allow_methods(Any).allow_headers(Any)
        }
        None => {
            tracing::warn!("CORS_ORIGINS not set, using permissive CORS. Set CORS_ORIGINS for production!");
            CorsLayer::permissive()
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(state.config.server.cors_origins.as_deref());

    Router::new()
        .route("/health", get(handlers::health))
        .route("/ws", get(websocket::websocket_handler))
        // Profiles
        .route("/api/v1/profiles/me", get(handlers::get_my_profile).post(handlers::register))
        .route("/api/v1/profiles/:id", get(handlers::get_profile).put(handlers::update_profile))
        .route("/api/v1/profiles/:id/role", put(handlers::set_role))
        .route("/api/v1/lawyers", get(handlers::search_lawyers))
        .route("/api/v1/lawyers/me", put(handlers::update_lawyer_profile))
        .route("/api/v1/lawyers/me/documents", post(handlers::add_verification_document))
        .route("/api/v1/lawyers/:id", get(handlers::get_lawyer))
        .route("/api/v1/lawyers/:id/verify", put(handlers::set_verified))
        // Connections
        .route("/api/v1/connections", post(handlers::send_connection_request))
        .route("/api/v1/connections/incoming", get(handlers::get_incoming_requests))
        .route("/api/v1/connections/outgoing", get(handlers::get_outgoing_requests))
        .route("/api/v1/connections/status/:user_id", get(handlers::get_connection_status))
        .route("/api/v1/connections/:id/respond", post(handlers::respond_to_connection_request))
        // Chats
        .route("/api/v1/chats", get(handlers::list_chats))
        .route("/api/v1/chats/unread", get(handlers::get_unread_total))
        .route(
            "/api/v1/chats/:id/messages",
            get(handlers::get_messages).post(handlers::send_message),
        )
        .route("/api/v1/chats/:id/read", post(handlers::mark_chat_read))
        // CRM
        .route("/api/v1/cases", get(handlers::list_cases).post(handlers::create_case))
        .route("/api/v1/cases/:id", get(handlers::get_case))
        .route("/api/v1/cases/:id/status", put(handlers::update_case_status))
        .route(
            "/api/v1/cases/:id/time-entries",
            get(handlers::list_time_entries).post(handlers::start_time_entry),
        )
        .route("/api/v1/time-entries/:id/stop", post(handlers::stop_time_entry))
        .route(
            "/api/v1/cases/:id/documents",
            get(handlers::list_documents).post(handlers::add_document),
        )
        .route("/api/v1/documents/:id", delete(handlers::delete_document))
        // Marketplace
        .route(
            "/api/v1/requests",
            get(handlers::list_open_requests).post(handlers::create_request),
        )
        .route("/api/v1/requests/mine", get(handlers::list_my_requests))
        .route("/api/v1/requests/:id", get(handlers::get_request))
        .route(
            "/api/v1/requests/:id/proposals",
            get(handlers::list_proposals).post(handlers::submit_proposal),
        )
        .route("/api/v1/requests/:id/accept", post(handlers::accept_proposal))
        .route("/api/v1/requests/:id/close", post(handlers::close_request))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(Extension(state))
                .layer(middleware::from_fn(auth::auth_middleware)),
        )
}

pub async fn run(state: AppState) -> Result<()> {
    let host: std::net::IpAddr = state.config.server.host.parse()?;
    let addr = SocketAddr::new(host, state.config.server.api_port);
    let app = router(state);

    tracing::info!("Starting API server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
