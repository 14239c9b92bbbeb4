// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Folio Server
//!
//! HTTP service answering visitor questions about a portfolio site through
//! a page-aware system prompt and an upstream language model.

pub mod api;
pub mod auth;
pub mod config;
pub mod content;
pub mod llm;
pub mod sanitization;

use anyhow::{Context, Result};
use axum::{
    http::{HeaderValue, Method},
    routing::post,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::{chat, health_check, AppState};
use auth::{CounterStore, MemoryCounterStore, UpstashCounterStore, DEFAULT_MAX_COUNTER_KEYS};
use config::{CounterBackend, HttpServerConfig, ServerConfig};
use content::build_content_source;
use llm::{GeminiProvider, LLMProvider};

/// Install the global subscriber. `FOLIO_LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let json = std::env::var("FOLIO_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "folio_server=info,folio_core=info,tower_http=info".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

fn cors_layer(config: &HttpServerConfig) -> CorsLayer {
    if !config.enable_cors {
        return CorsLayer::new();
    }

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    if config.cors_origins.is_empty() {
        tracing::warn!("CORS: Allowing all origins. Set cors_origins in production!");
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    tracing::info!("CORS: Allowing origins: {:?}", config.cors_origins);
    cors.allow_origin(AllowOrigin::list(origins))
}

/// Build the HTTP router around prepared state.
pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route("/api/chat", post(chat).get(health_check))
        .with_state(state)
        .layer(cors_layer(&config.server))
        .layer(TraceLayer::new_for_http())
}

fn build_counter_store(config: &ServerConfig) -> Result<Arc<dyn CounterStore>> {
    match config.rate_limit.backend {
        CounterBackend::Memory => {
            tracing::info!("Rate limit counters held in memory");
            Ok(Arc::new(MemoryCounterStore::for_window(
                DEFAULT_MAX_COUNTER_KEYS,
                Duration::from_secs(config.rate_limit.window_secs),
            )))
        }
        CounterBackend::Upstash => {
            let url = config
                .rate_limit
                .upstash_url
                .as_deref()
                .context("upstash backend requires upstash_url")?;
            let token = config
                .rate_limit
                .upstash_token
                .as_deref()
                .context("upstash backend requires upstash_token")?;
            tracing::info!("Rate limit counters held in Upstash");
            Ok(Arc::new(UpstashCounterStore::new(url, token)?))
        }
    }
}

/// Wire collaborators from configuration.
pub fn build_state(config: &ServerConfig) -> Result<AppState> {
    let store = build_counter_store(config)?;
    let provider = Arc::new(GeminiProvider::new(&config.llm)?);
    let content = build_content_source(&config.content)?;
    let state = AppState::new(config, store, provider, content);

    if state.dispatcher.has_keys() {
        tracing::info!(
            keys = state.dispatcher.key_count(),
            provider = state.provider.name(),
            model = state.provider.model(),
            "Upstream key pool loaded"
        );
    } else {
        tracing::warn!("No GEMINI_API_KEY configured; chat requests will return 503");
    }

    Ok(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

pub async fn run_server(config: ServerConfig) -> Result<()> {
    init_tracing();

    tracing::info!("Starting Folio Server");
    config.validate()?;

    let addr = config.socket_addr()?;
    let state = build_state(&config)?;
    let app = build_router(state, &config);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("HTTP server stopped");
    Ok(())
}
