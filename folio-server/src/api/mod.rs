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

mod chat;
mod health;

pub use chat::{chat, ChatReply};
pub use health::{health_check, HealthResponse};

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use folio_core::{ContextAssembler, ValidationError, ValidationLimits, Validator};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{CounterStore, RateLimiter};
use crate::config::{ChatConfig, ServerConfig};
use crate::content::ContentSource;
use crate::llm::{DispatchError, KeyDispatcher, LLMProvider};

/// Errors surfaced to chat callers. Every variant renders as `{"error": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Payload too large")]
    PayloadTooLarge,

    #[error("Rate limit exceeded")]
    RateLimited { reset_in: u64 },

    #[error("{0}")]
    BadRequest(String),

    #[error("Service temporarily unavailable")]
    Unavailable,

    #[error("Service busy. Please try again shortly.")]
    Busy,

    #[error("Unable to process request")]
    Internal,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitResponse {
    error: String,
    reset_in: u64,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let status = match &self {
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RateLimited { reset_in } => {
                let body = RateLimitResponse {
                    error: message,
                    reset_in: *reset_in,
                };
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, reset_in.to_string())],
                    Json(body),
                )
                    .into_response();
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Busy => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NoKeys | DispatchError::AllKeysExhausted { .. } => ApiError::Unavailable,
            DispatchError::Throttled(_) => ApiError::Busy,
            DispatchError::Upstream(_) => ApiError::Internal,
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub validator: Validator,
    pub rate_limiter: Arc<RateLimiter>,
    pub dispatcher: Arc<KeyDispatcher>,
    pub provider: Arc<dyn LLMProvider>,
    pub content: Arc<dyn ContentSource>,
    pub assembler: Arc<ContextAssembler>,
    pub chat: ChatConfig,
    /// Deadline for one chat request, upstream fallback included.
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(
        config: &ServerConfig,
        store: Arc<dyn CounterStore>,
        provider: Arc<dyn LLMProvider>,
        content: Arc<dyn ContentSource>,
    ) -> Self {
        let dispatcher = KeyDispatcher::new(
            config.llm.api_keys.clone(),
            config.llm.key_reset_interval(),
            config.llm.timeout(),
        );

        Self {
            validator: Validator::new(ValidationLimits {
                max_message_chars: config.chat.max_message_chars,
            }),
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit.clone(), store)),
            dispatcher: Arc::new(dispatcher),
            provider,
            content,
            assembler: Arc::new(ContextAssembler::new(
                config.context.clone(),
                config.profile.clone(),
            )),
            chat: config.chat.clone(),
            request_timeout: Duration::from_secs(config.server.request_timeout_secs),
        }
    }
}
